use thiserror::Error;

/// All errors produced by the assistant core.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("audio capture failed: {0}")]
    RecorderFailure(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("realtime session error: {0}")]
    Session(String),

    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AssistantError>;
