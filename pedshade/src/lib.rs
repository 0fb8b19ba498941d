pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;

pub use config::{MaskConfig, PipelineConfig, ZonalConfig};
pub use error::{PipelineError, Result};
pub use geometric::materialisation::{build_mask, MaskReport};
pub use geometric::shade_pet::{run_zonal_statistics, ZonalReport};
