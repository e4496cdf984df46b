//! Error taxonomy shared by every UDS core crate.
//!
//! Jobs and the service manager façade match on the taxonomy below rather
//! than on opaque strings: [`is_retryable`](Error::is_retryable) drives the
//! deferred-deletion and cache-updater retry loops, [`is_not_found`]
//! collapses "already gone" into success for delete-style operations.

/// The engine-wide error type. Every plug-in call, Store operation, and
/// façade method returns this (or a `Result` alias of it).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Transient failure: lock timeout, connection reset, provider rate
    /// limit. The caller should re-enqueue with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The target object is already gone. Treated as success for delete,
    /// failure for read/update.
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider or pool capacity exhausted.
    #[error("max services reached for pool {pool}: {max}")]
    MaxServicesReached { pool: String, max: u32 },

    /// Pool lacks a usable publication.
    #[error("service invalid: {0}")]
    InvalidService(String),

    /// Calendar/group policy denied access.
    #[error("access denied by calendar: {0}")]
    AccessDeniedByCalendar(String),

    /// A `SELECT ... FOR UPDATE` / integrity failure from the Store that
    /// is not one of the above and is not considered retryable.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Bubbled up from the persistence layer (`uds-store`), kept as a
    /// distinct variant so callers can tell plug-in failures apart from
    /// Store failures even though both often end up in the same match arm.
    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error should cause the caller to re-enqueue and retry
    /// rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }

    /// Whether the target object was already gone. Callers performing a
    /// delete should treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Error::Retryable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::retryable("db deadlock").is_retryable());
        assert!(!Error::fatal("integrity").is_retryable());
    }

    #[test]
    fn not_found_classification() {
        assert!(Error::not_found("vm gone").is_not_found());
        assert!(!Error::retryable("timeout").is_not_found());
    }
}
