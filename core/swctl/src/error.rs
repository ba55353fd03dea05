use sw_core::SwError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Failed to reach daemon at {socket}: {reason}")]
    Unreachable { socket: String, reason: String },

    #[error("Daemon returned {code}: {message}")]
    Daemon { code: String, message: String },

    #[error("Invalid daemon response: {0}")]
    BadResponse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Core(#[from] SwError),
}

pub type Result<T> = std::result::Result<T, CliError>;
