use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid block range: start {start} is after end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Errors that must stop the process instead of being retried by the
    /// streaming loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::InvalidRange { .. }
                | StrataError::InvalidInput(_)
                | StrataError::Config(_)
                | StrataError::Checkpoint(_)
        )
    }
}

/// Reject a block range whose start lies after its end.
pub fn validate_range(start: u64, end: u64) -> Result<(), StrataError> {
    if start > end {
        return Err(StrataError::InvalidRange { start, end });
    }
    Ok(())
}
