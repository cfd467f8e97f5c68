use std::time::Duration;

use thiserror::Error;

/// Errors raised by frames, connections, channels and message channels.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("frame length {length} outside 0..={max}")]
    FrameTooLarge { length: i64, max: usize },

    #[error("peer idle for {idle:?}, limit is {limit:?}")]
    IdleTimeout { idle: Duration, limit: Duration },

    #[error("peer closed the transport without disconnecting")]
    PeerClosed,

    #[error("connection is disconnected")]
    Disconnected,

    #[error("channel {0} is closed")]
    ChannelClosed(u16),

    #[error("unknown message tag '{0}'")]
    UnknownTag(String),

    #[error("unexpected message '{got}', expected '{expected}'")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("message of {length} bytes exceeds maximum {max}")]
    MessageTooLarge { length: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("nothing listening at '{0}'")]
    NoListener(String),

    #[error("connection loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{} connection failures: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<LinkError>),
}

impl LinkError {
    /// The peer broke the wire or message protocol. Fatal to the channel,
    /// never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownFrameType(_)
                | Self::FrameTooLarge { .. }
                | Self::UnknownTag(_)
                | Self::UnexpectedMessage { .. }
                | Self::MessageTooLarge { .. }
                | Self::Malformed(_)
                | Self::Deserialization(_)
        )
    }

    /// The transport itself is gone (auth failure, idle timeout, I/O error,
    /// peer hang-up).
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Tls(_)
            | Self::Certificate(_)
            | Self::IdleTimeout { .. }
            | Self::PeerClosed
            | Self::Disconnected
            | Self::ChannelClosed(_)
            | Self::Join(_) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_connection_failure),
            _ => false,
        }
    }

    /// Fold loop failures into a single error, `None` when there are none.
    pub(crate) fn aggregate(mut errors: Vec<LinkError>) -> Option<LinkError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }
}

fn join_messages(errors: &[LinkError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_one_is_the_error_itself() {
        let err = LinkError::aggregate(vec![LinkError::PeerClosed]).unwrap();
        assert!(matches!(err, LinkError::PeerClosed));
        assert!(LinkError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn aggregate_lists_every_failure() {
        let err = LinkError::aggregate(vec![
            LinkError::PeerClosed,
            LinkError::UnknownFrameType(9),
        ])
        .unwrap();
        let text = err.to_string();
        assert!(text.starts_with("2 connection failures"));
        assert!(text.contains("unknown frame type 9"));
        assert!(err.is_connection_failure());
    }

    #[test]
    fn classification() {
        assert!(LinkError::UnknownTag("x".into()).is_protocol_violation());
        assert!(!LinkError::UnknownTag("x".into()).is_connection_failure());
        let idle = LinkError::IdleTimeout {
            idle: Duration::from_secs(3),
            limit: Duration::from_secs(2),
        };
        assert!(idle.is_connection_failure());
    }
}
