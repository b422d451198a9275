//! Error taxonomy for the OTA client.
//!
//! Every public operation surfaces failures through [`OtaError`], which
//! tags each error with a [`FailureKind`] so that the façade and the RPC
//! surface can translate it into the three-way `NO_FAILURE` / `RECOVERABLE`
//! / `UNRECOVERABLE` result described for callers.

use std::fmt;

/// The coarse-grained classification every public operation's failure is
/// reduced to before it crosses a process/RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The operation succeeded; included so status responses can use one enum.
    NoFailure,
    /// Safe to retry: busy, bad cookies, exhausted download retries, bad signature.
    Recoverable,
    /// Requires manual intervention: malformed manifest, disk I/O error, mkfs failure,
    /// or a bootloader adapter that failed after the boot entry was already switched.
    Unrecoverable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoFailure => "NO_FAILURE",
            Self::Recoverable => "RECOVERABLE",
            Self::Unrecoverable => "UNRECOVERABLE",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the OTA client. Every variant carries an
/// implicit [`FailureKind`] via [`OtaError::kind`].
#[derive(thiserror::Error, Debug)]
pub enum OtaError {
    /// A second `update`/`rollback` was requested while one was already in flight.
    #[error("an update or rollback is already in progress")]
    Busy,

    /// The manifest envelope's signature did not verify against the certificate store.
    #[error("manifest signature verification failed: {0}")]
    BadSignature(String),

    /// Cookie or header data supplied by the caller could not be parsed.
    #[error("invalid request parameters: {0}")]
    InvalidRequest(String),

    /// A download exhausted its retry budget.
    #[error("download of {url} failed after {attempts} attempts: {source}")]
    DownloadExhausted {
        /// The URL that could not be fetched.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// The underlying error from the final attempt.
        #[source]
        source: anyhow::Error,
    },

    /// A network-level failure that is always retryable by the caller if budget remains.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A manifest meta-stream line did not match the expected grammar. Always unrecoverable:
    /// a partially-applied image is forbidden.
    #[error("malformed manifest record at {stream} line {line}: {detail}")]
    MalformedManifest {
        /// Which meta-stream (`regulars.txt`, `dirs.txt`, ...).
        stream: String,
        /// 1-based line number within the stream.
        line: usize,
        /// Description of what failed to parse.
        detail: String,
    },

    /// An operation required the precondition that `status` not be in a given state.
    #[error("operation invalid from current status {0:?}")]
    InvalidPrecondition(crate::bootctl::OtaStatus),

    /// Any other I/O failure against the standby slot or status store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An FSM `wait_on`/`proceed` call timed out.
    #[error("timed out waiting for orchestrator state {0}")]
    FsmTimeout(String),

    /// An FSM transition was attempted out of order.
    #[error("orchestrator protocol violation: {0}")]
    FsmProtocol(String),

    /// Catch-all for unrecoverable conditions not covered above (mkfs failed,
    /// bootloader adapter failed irreversibly, disk corruption detected, ...).
    #[error(transparent)]
    Unrecoverable(#[from] anyhow::Error),
}

impl OtaError {
    /// Classify this error per spec.md §7's three-way policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Busy
            | Self::BadSignature(_)
            | Self::InvalidRequest(_)
            | Self::DownloadExhausted { .. }
            | Self::Network(_)
            | Self::InvalidPrecondition(_)
            | Self::FsmTimeout(_) => FailureKind::Recoverable,
            Self::MalformedManifest { .. }
            | Self::Io(_)
            | Self::FsmProtocol(_)
            | Self::Unrecoverable(_) => FailureKind::Unrecoverable,
        }
    }
}

/// Convenience alias used throughout the crate's domain modules.
pub type Result<T> = std::result::Result<T, OtaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_recoverable() {
        assert_eq!(OtaError::Busy.kind(), FailureKind::Recoverable);
    }

    #[test]
    fn malformed_manifest_is_unrecoverable() {
        let e = OtaError::MalformedManifest {
            stream: "regulars.txt".into(),
            line: 4,
            detail: "bad mode".into(),
        };
        assert_eq!(e.kind(), FailureKind::Unrecoverable);
    }
}
