pub mod main;
pub mod normalize;
pub use main::{NormalizeRequest, NormalizeSummary, RadcalDriverError, run_normalize};
pub use normalize::{
    DEFAULT_NO_CHANGE_THRESHOLD, NormalizationOptions, OrthogonalFit, RadcalError,
    RadiometricNormalization,
};
