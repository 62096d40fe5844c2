use std::time::Duration;

use thiserror::Error;

/// Failure of a call that crosses the remote-invocation boundary.
///
/// `Unreachable` and `Timeout` are transient: the periodic tasks log them and
/// rely on their next cycle to try again.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("peer at {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("call to {address} timed out after {elapsed:?}")]
    Timeout { address: String, elapsed: Duration },
    #[error("malformed exchange: {0}")]
    Protocol(String),
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable { .. } | RemoteError::Timeout { .. } | RemoteError::Io(_)
        )
    }
}
