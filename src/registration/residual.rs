//! Residuals, match outcomes and the saturating robust loss.

use nalgebra::{Matrix3, Vector3};

/// Outcome of one attempted keypoint match.
///
/// Every attempted match produces exactly one tag; the per-kind
/// histograms of tags are the debug surface of the registration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchingResult {
    /// A residual was built from this keypoint.
    Success,
    /// Fewer neighbours than the minimum required for a stable fit.
    NotEnoughNeighbors,
    /// The farthest accepted neighbour exceeds the ICP matching range.
    NeighborsTooFar,
    /// The neighbourhood PCA does not show the expected line or plane
    /// structure.
    BadPcaStructure,
    /// Non-finite or singular numerical intermediate.
    InvalidNumerical,
    /// The neighbours fit the primitive too loosely.
    MseTooLarge,
    /// Unclassified failure.
    Unknown,
}

impl MatchingResult {
    /// All variants, in histogram order.
    pub const ALL: [MatchingResult; 7] = [
        MatchingResult::Success,
        MatchingResult::NotEnoughNeighbors,
        MatchingResult::NeighborsTooFar,
        MatchingResult::BadPcaStructure,
        MatchingResult::InvalidNumerical,
        MatchingResult::MseTooLarge,
        MatchingResult::Unknown,
    ];

    /// Stable numeric code, used in per-keypoint debug arrays.
    #[inline]
    pub fn code(self) -> u8 {
        self.index() as u8
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            MatchingResult::Success => 0,
            MatchingResult::NotEnoughNeighbors => 1,
            MatchingResult::NeighborsTooFar => 2,
            MatchingResult::BadPcaStructure => 3,
            MatchingResult::InvalidNumerical => 4,
            MatchingResult::MseTooLarge => 5,
            MatchingResult::Unknown => 6,
        }
    }
}

/// Histogram of match outcomes for one keypoint kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchHistogram {
    counts: [usize; 7],
}

impl MatchHistogram {
    /// Record one outcome.
    #[inline]
    pub fn record(&mut self, result: MatchingResult) {
        self.counts[result.index()] += 1;
    }

    /// Count of one outcome.
    #[inline]
    pub fn count(&self, result: MatchingResult) -> usize {
        self.counts[result.index()]
    }

    /// Number of successful matches.
    #[inline]
    pub fn successes(&self) -> usize {
        self.counts[0]
    }

    /// Total attempted matches (sum over all outcomes).
    #[inline]
    pub fn attempts(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// One accepted match, as a weighted quadratic cost term.
///
/// Encodes `weight · (R(t)·X + T(t) − P)ᵀ A (R(t)·X + T(t) − P)` where
/// `(R(t), T(t))` is the pose interpolated at the keypoint's
/// sweep-relative time `t`.
#[derive(Debug, Clone, Copy)]
pub struct Residual {
    /// Symmetric PSD weighting matrix of the fitted primitive.
    pub a: Matrix3<f64>,
    /// Reference point of the primitive (neighbour centroid).
    pub p: Vector3<f64>,
    /// Keypoint position in BASE coordinates.
    pub x: Vector3<f64>,
    /// A-priori weight of the term.
    pub weight: f64,
    /// Sweep-relative acquisition time of the keypoint, seconds.
    pub time: f64,
}

/// Saturating robust loss `ρ(x) = s · atan(x / s)`.
///
/// Bounded by `s·π/2`, so a single gross outlier cannot dominate the
/// cost. The scale `s` is annealed from coarse to fine across ICP
/// iterations.
#[inline]
pub fn saturating_loss(error: f64, scale: f64) -> f64 {
    scale * (error / scale).atan()
}

/// Derivative of [`saturating_loss`], used as the IRLS weight.
#[inline]
pub fn saturating_loss_weight(error: f64, scale: f64) -> f64 {
    let ratio = error / scale;
    1.0 / (1.0 + ratio * ratio)
}
