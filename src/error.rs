use reqwest::StatusCode;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Terminal failure of a narration run. Nothing is retried; the first error
/// aborts the invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to decode video: {0:#}")]
    Decode(#[source] anyhow::Error),

    #[error("no frames available to narrate")]
    EmptyInput,

    #[error("vision inference failed: {0}")]
    Inference(String),

    #[error("speech service responded with status {status}")]
    Service { status: StatusCode },

    #[error("speech request failed: {0}")]
    Speech(String),

    #[error("failed to mux narrated video: {0:#}")]
    Mux(#[source] anyhow::Error),

    #[error("temporary storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
