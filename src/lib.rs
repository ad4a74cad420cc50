pub mod ai;
pub mod capture;
pub mod config;
pub mod error;
pub mod keyframes;
pub mod pipeline;
pub mod video;

pub use config::Settings;
pub use error::{PipelineError, Result};
pub use pipeline::{NarratedVideo, Pipeline, PipelineState};
