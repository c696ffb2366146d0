use thiserror::Error;

use crate::models::ServiceId;

/// The error taxonomy from the design: one enum per failure class, so
/// callers can match on *why* an operation failed rather than parse a
/// string.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel for '{0}' already exists")]
    AlreadyExists(ServiceId),

    #[error("no tunnel for '{0}'")]
    NotFound(ServiceId),

    #[error("loopback pool exhausted: {0}")]
    ResourceExhausted(String),

    #[error("platform alias error: {0}")]
    Platform(String),

    #[error("host file error: {0}")]
    Host(String),

    #[error("cluster API error: {0}")]
    Cluster(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("{count} teardown step(s) failed: {joined}")]
    Aggregate { count: usize, joined: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Collapse the (possibly empty) per-step errors collected while
    /// stopping a connection into a single `Aggregate`: stop never
    /// short-circuits, it aggregates.
    pub fn aggregate(errors: Vec<Error>) -> Option<Error> {
        if errors.is_empty() {
            return None;
        }
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::Aggregate {
            count: errors.len(),
            joined,
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
