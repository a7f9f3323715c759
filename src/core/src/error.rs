use thiserror::Error;

/// kitrace error types
#[derive(Error, Debug)]
pub enum ReproError {
    /// A build step could not be expressed as an LLB op
    #[error("graph build error: {0}")]
    GraphBuild(String),

    /// Encoding an op or definition failed
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The build endpoint could not be reached
    #[error("connection error: {address}: {message}")]
    Connection { address: String, message: String },

    /// The Solve RPC failed
    #[error("solve failed: {0}")]
    Solve(String),

    /// The Status stream failed or progress could not be written
    #[error("progress stream error: {0}")]
    ProgressStream(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Stopped by the shared shutdown signal
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReproError {
    /// Build a connection error for the given endpoint.
    pub fn connection(address: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ReproError::Connection {
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error came from the shared shutdown signal rather
    /// than from the build service.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReproError::Cancelled(_))
    }
}

impl From<prost::EncodeError> for ReproError {
    fn from(err: prost::EncodeError) -> Self {
        ReproError::Marshal(err.to_string())
    }
}

/// Result type alias for kitrace operations
pub type Result<T> = std::result::Result<T, ReproError>;
