use thiserror::Error;

/// Failure classification shared across the pipeline. Every fallible
/// operation reports one of these kinds so callers can decide between
/// redelivery (Transient), discarding (BadPayload/Permanent) and
/// fail-fast shutdown (Fatal).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed or incomplete input; acked and discarded.
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// I/O timeout, 5xx, connection reset; safe to retry or redeliver.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rejected for good (4xx, gone endpoint, invalid recipient); never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Unique-key or referential violation, surfaced to the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration or unrecoverable datastore state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::Permanent("410".into()).is_transient());
        assert!(Error::Conflict("dup".into()).is_conflict());
    }
}
