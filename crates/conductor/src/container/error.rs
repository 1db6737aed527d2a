use thiserror::Error;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// The CLI could not be spawned or exited non-zero.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected `ps` output: {0}")]
    UnreadableListing(String),

    /// Rejected before it reached the command line.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
