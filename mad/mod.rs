pub mod accumulate;
pub mod canonical;
pub mod fit;
pub mod io;
pub mod main;
pub mod progress;
pub mod source;
pub mod transform;
pub use accumulate::{AccumulatorError, WeightedCovariance};
pub use canonical::{CanonicalError, CanonicalPair};
pub use fit::{FitState, FitStatus, IrMadModel, IrMadOptions, MadError, ModelError};
pub use io::RasterPairSource;
pub use source::{DEFAULT_BLOCK_PIXELS, DenseImagePair, PixelBlockSource};
pub use transform::{MadResult, MadTransform, NoChangeProbability};
