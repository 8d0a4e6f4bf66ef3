//! ICP outer loop and Levenberg–Marquardt pose solver.
//!
//! One registration is an outer loop of match-and-minimize iterations:
//! every iteration rebuilds the keypoint matches at the current pose
//! estimate, then runs a damped Gauss–Newton (LM) pass on the residual
//! set. The parameter vector is the end-of-sweep pose as
//! `(t, ω) ∈ ℝ⁶` (translation + axis-angle), doubled to 12 when the
//! begin-of-sweep pose is optimized jointly.
//!
//! Motion compensation couples into the solver through the per-point
//! interpolation ratio `s`: the predicted position of a keypoint uses
//! the pose interpolated at its acquisition time, and its Jacobian
//! contribution is split between the begin block (weight `1−s`) and
//! the end block (weight `s`).

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Matrix3x6, Matrix6, Rotation3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::matcher::{KeypointMatcher, MatchingConfig};
use super::residual::{
    saturating_loss, saturating_loss_weight, MatchHistogram, MatchingResult, Residual,
};
use crate::core::types::{MotionInterpolator, Point};
use crate::map::KdTreeCloud;

/// How the engine compensates sensor motion within one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndistortionMode {
    /// No compensation: every point uses the end-of-sweep pose.
    None,
    /// The begin pose is extrapolated from the previous motion; points
    /// use the pose interpolated at their acquisition time.
    Approximated,
    /// Begin and end poses are optimized jointly; points use the pose
    /// interpolated between the two optimized endpoints.
    Optimized,
}

/// How the begin-of-sweep pose is obtained during one registration.
#[derive(Debug, Clone, Copy)]
pub enum BeginPosePolicy {
    /// Begin equals the end pose (rigid sweep, no compensation).
    EndPose,
    /// Begin interpolated between the previous sweep's end pose and
    /// the current end estimate, at the fixed `ratio` given by the
    /// sweep-duration-to-frame-gap relation.
    Extrapolated {
        previous_end: Isometry3<f64>,
        ratio: f64,
    },
    /// Begin is free and optimized jointly with the end pose.
    Optimized { initial: Isometry3<f64> },
}

/// Current-frame keypoints, BASE coordinates.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationInput<'a> {
    pub edges: &'a [Point],
    pub planars: &'a [Point],
    pub blobs: &'a [Point],
}

/// Target kd-trees the keypoints are matched against.
pub struct RegistrationTargets<'a, 'b> {
    pub edges: Option<&'b KdTreeCloud<'a>>,
    pub planars: Option<&'b KdTreeCloud<'a>>,
    pub blobs: Option<&'b KdTreeCloud<'a>>,
}

/// Result of one registration pass.
#[derive(Debug, Clone)]
pub struct RegistrationSummary {
    /// Pose of BASE at the start of the sweep.
    pub pose_begin: Isometry3<f64>,
    /// Pose of BASE at the end of the sweep (the frame estimate).
    pub pose_end: Isometry3<f64>,
    /// 6×6 covariance of the end pose, DoF order `(x, y, z, rx, ry, rz)`.
    pub covariance: Matrix6<f64>,
    /// Residuals surviving the last match pass.
    pub nb_residuals: usize,
    /// Set when too few residuals survived and LM was skipped.
    pub degenerate: bool,
    /// Count of non-finite or singular solver intermediates.
    pub nb_numerical_failures: usize,
    /// Match outcome histograms of the last match pass, per kind.
    pub edges: MatchHistogram,
    pub planars: MatchHistogram,
    pub blobs: MatchHistogram,
    /// Per-keypoint outcome of the last match pass, aligned with the
    /// input keypoint order.
    pub edge_tags: Vec<MatchingResult>,
    pub planar_tags: Vec<MatchingResult>,
    pub blob_tags: Vec<MatchingResult>,
    /// Mean residual error `rᵀAr` at the final pose.
    pub mean_squared_error: f64,
}

/// One registration phase (ego-motion or localization).
pub struct Registration<'a> {
    config: &'a MatchingConfig,
    max_distance: f64,
    min_matched_keypoints: usize,
}

impl<'a> Registration<'a> {
    /// Create a registration pass with the phase configuration, the
    /// shared ICP matching range and the degeneracy threshold.
    pub fn new(config: &'a MatchingConfig, max_distance: f64, min_matched_keypoints: usize) -> Self {
        Self {
            config,
            max_distance,
            min_matched_keypoints,
        }
    }

    /// Run the full ICP + LM registration.
    ///
    /// `init_end` seeds the end-of-sweep pose; `policy` fixes how the
    /// begin pose follows it. `sweep_duration` spans the point `time`
    /// field; a non-positive duration disables interpolation.
    pub fn solve(
        &self,
        input: &RegistrationInput<'_>,
        targets: &RegistrationTargets<'_, '_>,
        init_end: Isometry3<f64>,
        policy: BeginPosePolicy,
        sweep_duration: f64,
        pool: &rayon::ThreadPool,
    ) -> RegistrationSummary {
        // Joint begin/end optimization needs a usable time spread.
        let policy = match policy {
            BeginPosePolicy::Optimized { .. } if sweep_duration <= 0.0 => BeginPosePolicy::EndPose,
            other => other,
        };
        let optimize_begin = matches!(policy, BeginPosePolicy::Optimized { .. });
        let rigid = matches!(policy, BeginPosePolicy::EndPose) || sweep_duration <= 0.0;
        let dim = if optimize_begin { 12 } else { 6 };

        let mut pose_end = init_end;
        let mut pose_begin = begin_pose(&policy, &pose_end);

        let matcher = KeypointMatcher::new(self.config, self.max_distance);

        let mut summary = RegistrationSummary {
            pose_begin,
            pose_end,
            covariance: Matrix6::identity(),
            nb_residuals: 0,
            degenerate: false,
            nb_numerical_failures: 0,
            edges: MatchHistogram::default(),
            planars: MatchHistogram::default(),
            blobs: MatchHistogram::default(),
            edge_tags: Vec::new(),
            planar_tags: Vec::new(),
            blob_tags: Vec::new(),
            mean_squared_error: 0.0,
        };

        let icp_iters = self.config.icp_max_iter.max(1);
        let mut terms: Vec<(Residual, f64)> = Vec::new();
        let mut final_scale = self.config.final_loss_scale;

        for icp in 0..icp_iters {
            let scale = anneal_scale(
                self.config.init_loss_scale,
                self.config.final_loss_scale,
                icp,
                icp_iters,
            );
            final_scale = scale;

            if !optimize_begin {
                pose_begin = begin_pose(&policy, &pose_end);
            }
            let interp = MotionInterpolator::new(0.0, pose_begin, sweep_duration, pose_end);

            // Match every keypoint at its interpolated pose.
            terms.clear();
            summary.edges = MatchHistogram::default();
            summary.planars = MatchHistogram::default();
            summary.blobs = MatchHistogram::default();

            fn collect(
                outcomes: Vec<(Result<Residual, MatchingResult>, f64)>,
                hist: &mut MatchHistogram,
                tags: &mut Vec<MatchingResult>,
                terms: &mut Vec<(Residual, f64)>,
            ) {
                tags.clear();
                for (outcome, ratio) in outcomes {
                    match outcome {
                        Ok(residual) => {
                            hist.record(MatchingResult::Success);
                            tags.push(MatchingResult::Success);
                            terms.push((residual, ratio));
                        }
                        Err(tag) => {
                            hist.record(tag);
                            tags.push(tag);
                        }
                    }
                }
            }

            if let Some(tree) = targets.edges.filter(|t| !t.is_empty()) {
                let outcomes = pool.install(|| {
                    input
                        .edges
                        .par_iter()
                        .map(|p| {
                            let (query, s) = predict(p, &interp, rigid);
                            (matcher.match_edge(&p.position(), &query, p.time, tree), s)
                        })
                        .collect()
                });
                collect(outcomes, &mut summary.edges, &mut summary.edge_tags, &mut terms);
            }
            if let Some(tree) = targets.planars.filter(|t| !t.is_empty()) {
                let outcomes = pool.install(|| {
                    input
                        .planars
                        .par_iter()
                        .map(|p| {
                            let (query, s) = predict(p, &interp, rigid);
                            (matcher.match_planar(&p.position(), &query, p.time, tree), s)
                        })
                        .collect()
                });
                collect(
                    outcomes,
                    &mut summary.planars,
                    &mut summary.planar_tags,
                    &mut terms,
                );
            }
            if let Some(tree) = targets.blobs.filter(|t| !t.is_empty()) {
                let outcomes = pool.install(|| {
                    input
                        .blobs
                        .par_iter()
                        .map(|p| {
                            let (query, s) = predict(p, &interp, rigid);
                            (matcher.match_blob(&p.position(), &query, p.time, tree), s)
                        })
                        .collect()
                });
                collect(outcomes, &mut summary.blobs, &mut summary.blob_tags, &mut terms);
            }

            summary.nb_residuals = terms.len();
            if terms.len() < self.min_matched_keypoints {
                // Too little structure: keep the best pose so far and
                // flag the frame instead of failing it.
                summary.degenerate = true;
                break;
            }

            // Damped Gauss-Newton on the current residual set.
            let mut lambda = 1e-4;
            let mut cost = total_cost(&terms, &pose_begin, &pose_end, scale);
            for _ in 0..self.config.lm_max_iter {
                let Some((h, g)) =
                    normal_equations(&terms, &pose_begin, &pose_end, scale, optimize_begin)
                else {
                    summary.nb_numerical_failures += 1;
                    break;
                };

                let mut damped = h.clone();
                for i in 0..dim {
                    damped[(i, i)] += lambda * h[(i, i)].max(1e-12);
                }
                let Some(chol) = damped.cholesky() else {
                    summary.nb_numerical_failures += 1;
                    lambda *= 10.0;
                    if lambda > 1e8 {
                        break;
                    }
                    continue;
                };
                let delta = chol.solve(&(-&g));
                if !delta.iter().all(|v| v.is_finite()) {
                    summary.nb_numerical_failures += 1;
                    lambda *= 10.0;
                    if lambda > 1e8 {
                        break;
                    }
                    continue;
                }

                let (cand_begin, cand_end) =
                    apply_step(&delta, &pose_begin, &pose_end, optimize_begin);
                let cand_cost = total_cost(&terms, &cand_begin, &cand_end, scale);
                if cand_cost < cost {
                    pose_begin = cand_begin;
                    pose_end = cand_end;
                    cost = cand_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    if delta.norm() < 1e-10 {
                        break;
                    }
                } else {
                    lambda *= 10.0;
                    if lambda > 1e8 {
                        break;
                    }
                }
            }
        }

        if !optimize_begin {
            pose_begin = begin_pose(&policy, &pose_end);
        }
        summary.pose_begin = pose_begin;
        summary.pose_end = pose_end;

        if !terms.is_empty() {
            summary.mean_squared_error =
                mean_error(&terms, &pose_begin, &pose_end);
        }
        if !summary.degenerate && !terms.is_empty() {
            match estimate_covariance(
                &terms,
                &pose_begin,
                &pose_end,
                final_scale,
                optimize_begin,
            ) {
                Some(covariance) => summary.covariance = covariance,
                None => summary.nb_numerical_failures += 1,
            }
        }

        summary
    }
}

/// Begin pose for the non-jointly-optimized policies.
fn begin_pose(policy: &BeginPosePolicy, pose_end: &Isometry3<f64>) -> Isometry3<f64> {
    match policy {
        BeginPosePolicy::EndPose => *pose_end,
        BeginPosePolicy::Extrapolated {
            previous_end,
            ratio,
        } => MotionInterpolator::new(0.0, *previous_end, 1.0, *pose_end).at_ratio(*ratio),
        BeginPosePolicy::Optimized { initial } => *initial,
    }
}

/// World position of a keypoint under the current estimate, plus the
/// Jacobian ratio assigned to the end-pose block.
#[inline]
fn predict(
    point: &Point,
    interp: &MotionInterpolator,
    rigid: bool,
) -> (Vector3<f64>, f64) {
    let s = if rigid { 1.0 } else { interp.ratio(point.time) };
    let pose = interp.at_ratio(s);
    let q = pose * nalgebra::Point3::from(point.position());
    (q.coords, s)
}

/// Linear annealing of the loss scale across ICP iterations.
#[inline]
fn anneal_scale(init: f64, fin: f64, iteration: u32, total: u32) -> f64 {
    if total <= 1 {
        return fin;
    }
    init + (fin - init) * iteration as f64 / (total - 1) as f64
}

/// Robust total cost of the residual set at the given endpoint poses.
fn total_cost(
    terms: &[(Residual, f64)],
    pose_begin: &Isometry3<f64>,
    pose_end: &Isometry3<f64>,
    scale: f64,
) -> f64 {
    let interp = MotionInterpolator::new(0.0, *pose_begin, 1.0, *pose_end);
    terms
        .iter()
        .map(|(res, s)| {
            let pose = interp.at_ratio(*s);
            let r = pose * nalgebra::Point3::from(res.x) - nalgebra::Point3::from(res.p);
            let e = (r.transpose() * res.a * r)[0];
            res.weight * saturating_loss(e, scale)
        })
        .sum()
}

/// Mean raw error `rᵀAr` at the given endpoint poses.
fn mean_error(
    terms: &[(Residual, f64)],
    pose_begin: &Isometry3<f64>,
    pose_end: &Isometry3<f64>,
) -> f64 {
    let interp = MotionInterpolator::new(0.0, *pose_begin, 1.0, *pose_end);
    let sum: f64 = terms
        .iter()
        .map(|(res, s)| {
            let pose = interp.at_ratio(*s);
            let r = pose * nalgebra::Point3::from(res.x) - nalgebra::Point3::from(res.p);
            (r.transpose() * res.a * r)[0]
        })
        .sum();
    sum / terms.len() as f64
}

/// Accumulate the damped-Gauss-Newton normal equations.
///
/// Per residual, with `J₀ = [I | −skew(R·X)]` (translation block
/// first), the end-pose Jacobian is `s·J₀` and the begin-pose Jacobian
/// `(1−s)·J₀`, so the block contributions reduce to scalar multiples
/// of `M = J₀ᵀAJ₀` and `v = J₀ᵀAr`.
///
/// Returns `None` when a non-finite intermediate appears.
fn normal_equations(
    terms: &[(Residual, f64)],
    pose_begin: &Isometry3<f64>,
    pose_end: &Isometry3<f64>,
    scale: f64,
    optimize_begin: bool,
) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let dim = if optimize_begin { 12 } else { 6 };
    let mut h = DMatrix::<f64>::zeros(dim, dim);
    let mut g = DVector::<f64>::zeros(dim);
    let interp = MotionInterpolator::new(0.0, *pose_begin, 1.0, *pose_end);

    for (res, s) in terms {
        let pose = interp.at_ratio(*s);
        let rotated = pose.rotation * res.x;
        let predicted = rotated + pose.translation.vector;
        let r = predicted - res.p;
        let e = (r.transpose() * res.a * r)[0];
        if !e.is_finite() {
            return None;
        }
        let w = res.weight * saturating_loss_weight(e, scale);

        let mut j0 = Matrix3x6::<f64>::zeros();
        j0.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());
        j0.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-crate::core::math::skew(&rotated)));

        let m = j0.transpose() * res.a * j0; // 6×6
        let v = j0.transpose() * res.a * r; // 6

        if optimize_begin {
            let sb = 1.0 - *s;
            let se = *s;
            for (bi, bs) in [(0usize, sb), (6usize, se)] {
                for (bj, cs) in [(0usize, sb), (6usize, se)] {
                    let factor = w * bs * cs;
                    let mut block = h.view_mut((bi, bj), (6, 6));
                    for (r_idx, c_idx) in block_indices() {
                        block[(r_idx, c_idx)] += factor * m[(r_idx, c_idx)];
                    }
                }
                let mut gb = g.rows_mut(bi, 6);
                for r_idx in 0..6 {
                    gb[r_idx] += w * bs * v[r_idx];
                }
            }
        } else {
            let se = *s;
            let factor = w * se * se;
            for (r_idx, c_idx) in block_indices() {
                h[(r_idx, c_idx)] += factor * m[(r_idx, c_idx)];
            }
            for r_idx in 0..6 {
                g[r_idx] += w * se * v[r_idx];
            }
        }
    }

    if h.iter().all(|v| v.is_finite()) && g.iter().all(|v| v.is_finite()) {
        Some((h, g))
    } else {
        None
    }
}

/// Index pairs of a 6×6 block.
#[inline]
fn block_indices() -> impl Iterator<Item = (usize, usize)> {
    (0..6).flat_map(|r| (0..6).map(move |c| (r, c)))
}

/// Apply the LM step: translation added, rotation left-multiplied by
/// the axis-angle exponential.
fn apply_step(
    delta: &DVector<f64>,
    pose_begin: &Isometry3<f64>,
    pose_end: &Isometry3<f64>,
    optimize_begin: bool,
) -> (Isometry3<f64>, Isometry3<f64>) {
    let perturb = |pose: &Isometry3<f64>, offset: usize| -> Isometry3<f64> {
        let dt = Vector3::new(delta[offset], delta[offset + 1], delta[offset + 2]);
        let dw = Vector3::new(delta[offset + 3], delta[offset + 4], delta[offset + 5]);
        let rotation =
            nalgebra::UnitQuaternion::from_rotation_matrix(&(Rotation3::new(dw) * pose.rotation.to_rotation_matrix()));
        Isometry3::from_parts(
            nalgebra::Translation3::from(pose.translation.vector + dt),
            rotation,
        )
    };
    if optimize_begin {
        (perturb(pose_begin, 0), perturb(pose_end, 6))
    } else {
        (*pose_begin, perturb(pose_end, 0))
    }
}

/// `(JᵀWJ)⁻¹ · σ²` with the reduced chi-square, end-pose block only.
fn estimate_covariance(
    terms: &[(Residual, f64)],
    pose_begin: &Isometry3<f64>,
    pose_end: &Isometry3<f64>,
    scale: f64,
    optimize_begin: bool,
) -> Option<Matrix6<f64>> {
    let (h, _) = normal_equations(terms, pose_begin, pose_end, scale, optimize_begin)?;
    let dim = h.nrows();

    // Reduced chi-square at the final pose.
    let interp = MotionInterpolator::new(0.0, *pose_begin, 1.0, *pose_end);
    let chi2: f64 = terms
        .iter()
        .map(|(res, s)| {
            let pose = interp.at_ratio(*s);
            let r = pose * nalgebra::Point3::from(res.x) - nalgebra::Point3::from(res.p);
            let e = (r.transpose() * res.a * r)[0];
            res.weight * saturating_loss_weight(e, scale) * e
        })
        .sum();
    let dof = (terms.len() as f64 - dim as f64).max(1.0);
    let sigma2 = chi2 / dof;

    let inverse = h.try_inverse()?;
    let offset = if optimize_begin { 6 } else { 0 };
    let mut covariance = Matrix6::<f64>::zeros();
    for r in 0..6 {
        for c in 0..6 {
            covariance[(r, c)] = inverse[(offset + r, offset + c)] * sigma2;
        }
    }
    if covariance.iter().all(|v| v.is_finite()) {
        Some(covariance)
    } else {
        None
    }
}
