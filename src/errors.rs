use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced to control clients. Spawn failures are not listed here
/// on purpose: a command that cannot start is recorded as a crashed entry,
/// never returned as an error from `add`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("app '{0}' does not exist")]
    NotFound(String),
    #[error("app '{0}' already exists")]
    AlreadyExists(String),
    #[error("registry file is unreadable: {0}")]
    CorruptState(String),
    #[error("failed to persist registry: {0}")]
    Persist(String),
}

impl Error {
    /// Stable identifier used on the control socket.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not-found",
            Error::AlreadyExists(_) => "already-exists",
            Error::CorruptState(_) => "corrupt-state",
            Error::Persist(_) => "persist",
        }
    }
}
