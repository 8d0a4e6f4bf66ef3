//! ICP registration with point-to-line, point-to-plane and
//! point-to-blob residuals, solved by Levenberg–Marquardt.

mod matcher;
mod optimizer;
mod residual;

pub use matcher::{KeypointMatcher, MatchingConfig};
pub use optimizer::{
    BeginPosePolicy, Registration, RegistrationInput, RegistrationSummary, RegistrationTargets,
    UndistortionMode,
};
pub use residual::{saturating_loss, saturating_loss_weight, MatchHistogram, MatchingResult, Residual};
