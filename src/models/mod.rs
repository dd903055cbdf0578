pub mod config;
pub mod dataset;

pub use config::*;
pub use dataset::Dataset;
