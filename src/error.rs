use std::time::Duration;

/// Error taxonomy shared by the connection layer and the book synchronizer.
///
/// Transport, timeout and protocol errors are normally recovered internally
/// (reconnect or resync). Only `CannotEstablishBook` and `BookUnavailable`
/// are meant to reach a consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("circuit open")]
    CircuitOpen,

    #[error("cannot establish book for {symbol}: {reason}")]
    CannotEstablishBook { symbol: String, reason: String },

    #[error("book unavailable for {symbol} after {resyncs} resync attempts")]
    BookUnavailable { symbol: String, resyncs: u32 },

    #[error("connection closed")]
    Closed,
}

impl SyncError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        SyncError::Timeout { operation, after }
    }

    /// Whether the error belongs to the family the reconnect loop absorbs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Timeout { .. } | SyncError::Protocol(_)
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = SyncError::timeout("snapshot fetch", Duration::from_secs(5));
        assert_eq!(e.to_string(), "snapshot fetch timed out after 5s");

        let e = SyncError::BookUnavailable { symbol: "BTCUSDT".into(), resyncs: 5 };
        assert_eq!(e.to_string(), "book unavailable for BTCUSDT after 5 resync attempts");
    }

    #[test]
    fn test_recoverable_family() {
        assert!(SyncError::Transport("reset".into()).is_recoverable());
        assert!(SyncError::Protocol("gap".into()).is_recoverable());
        assert!(SyncError::timeout("connect", Duration::from_millis(10)).is_recoverable());
        assert!(!SyncError::CircuitOpen.is_recoverable());
        assert!(!SyncError::Closed.is_recoverable());
    }
}
