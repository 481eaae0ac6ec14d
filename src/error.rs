//! Error taxonomy for the NNTP core.
//!
//! A flat [`thiserror`] enum, in the style of the surrounding system's own
//! `AppError`: one variant per externally-visible error kind, a crate-wide
//! [`Result`] alias, and a [`NntpError::is_retryable`] helper so the
//! multi-connection client can classify failures without matching every
//! variant at each call site.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NntpError>;

/// Errors surfaced by any layer of the connection stack.
///
/// Variant names map directly onto the error kinds a caller is expected to
/// distinguish: `cannot-connect`, `cannot-authenticate`, `no-capacity`,
/// `protocol-error`, `article-missing`, `cancelled`, `timeout`, `other`.
#[derive(Debug, Error, Clone)]
pub enum NntpError {
    /// The underlying TCP/TLS connection could not be established.
    #[error("cannot connect to provider: {0}")]
    CannotConnect(String),

    /// The server rejected the configured credentials. Never retried.
    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),

    /// Every provider is at its connection cap and the pool is full.
    #[error("no capacity available")]
    NoCapacity,

    /// A well-formed but unexpected NNTP response from the server
    /// (malformed line, unexpected status code, transient server fault).
    /// Retried once on a fresh lease.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The requested article does not exist on the server. A stable fact,
    /// never retried, and safe to cache as a negative result.
    #[error("article missing: {0}")]
    ArticleMissing(String),

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A timeout fired before the operation completed (currently only the
    /// 30-second readiness-release timeout; this is never surfaced to the
    /// caller that triggered the original operation).
    #[error("operation timed out")]
    Timeout,

    /// Any other failure from the single-connection primitive. Retried once,
    /// matching the broad "retry on anything unclassified" strategy.
    #[error("{0}")]
    Other(String),
}

impl NntpError {
    /// Whether the multi-connection client should mark the lease for
    /// replacement and retry the operation once on a fresh lease.
    ///
    /// Narrowed (see DESIGN.md) to the two categories the spec calls
    /// transient: protocol errors and unclassified ("other") failures from
    /// the single-connection client. Authentication failures, cancellation,
    /// article-missing, and timeouts are all terminal or handled elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NntpError::ProtocolError(_) | NntpError::Other(_))
    }

    /// Stable string identifier for the error kind, matching the external
    /// interface's `error surfacing` vocabulary.
    pub fn kind(&self) -> &'static str {
        match self {
            NntpError::CannotConnect(_) => "cannot-connect",
            NntpError::CannotAuthenticate(_) => "cannot-authenticate",
            NntpError::NoCapacity => "no-capacity",
            NntpError::ProtocolError(_) => "protocol-error",
            NntpError::ArticleMissing(_) => "article-missing",
            NntpError::Cancelled => "cancelled",
            NntpError::Timeout => "timeout",
            NntpError::Other(_) => "other",
        }
    }

    /// True for cancellation, used by call sites that must not replace a
    /// lease or retry on cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NntpError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_is_narrow() {
        assert!(NntpError::ProtocolError("bad line".into()).is_retryable());
        assert!(NntpError::Other("boom".into()).is_retryable());
        assert!(!NntpError::ArticleMissing("m1".into()).is_retryable());
        assert!(!NntpError::CannotAuthenticate("bad pass".into()).is_retryable());
        assert!(!NntpError::Cancelled.is_retryable());
        assert!(!NntpError::Timeout.is_retryable());
        assert!(!NntpError::NoCapacity.is_retryable());
    }

    #[test]
    fn kind_strings_match_external_interface() {
        assert_eq!(NntpError::NoCapacity.kind(), "no-capacity");
        assert_eq!(NntpError::Cancelled.kind(), "cancelled");
        assert_eq!(NntpError::Timeout.kind(), "timeout");
    }
}
