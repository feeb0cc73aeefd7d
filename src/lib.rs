pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod warehouse;

pub use config::PipelineConfig;
pub use error::{LoadError, Result};
