#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../shared/raster.rs"]
pub mod raster;

#[path = "../shared/envi.rs"]
pub mod envi;

#[path = "../shared/geotiff.rs"]
pub mod geotiff;

#[path = "../shared/config.rs"]
pub mod config;

pub mod shared {
    pub use super::{config, envi, geotiff, raster};
}

#[path = "../mad/mod.rs"]
pub mod mad;

#[path = "../radcal/mod.rs"]
pub mod radcal;
