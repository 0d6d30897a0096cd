//! Error taxonomy for the peer layer.
//!
//! `PeerError` is what a request handler or a validation step reports about a
//! remote peer; `TransportError` is what moving bytes to and from a peer can
//! fail with. Both classify themselves so callers can decide between
//! "retry later" and "blacklist".

use thiserror::Error;

use crate::chain::ValidationError;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("not currently valid: {0}")]
    NotCurrentlyValid(String),
    #[error("not yet enabled: {0}")]
    NotYetEnabled(String),
    #[error("storage timeout: {0}")]
    StorageTimeout(String),
    #[error("block out of order: {0}")]
    BlockOutOfOrder(String),
    #[error("unexpected end of input")]
    ParseEof,
    #[error("{0}")]
    Protocol(String),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PeerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        PeerError::Protocol(msg.into())
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        PeerError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Expected conditions that must never get a peer blacklisted
    pub fn is_benign(&self) -> bool {
        match self {
            PeerError::NotCurrentlyValid(_)
            | PeerError::NotYetEnabled(_)
            | PeerError::StorageTimeout(_)
            | PeerError::BlockOutOfOrder(_)
            | PeerError::ParseEof => true,
            PeerError::Transport(e) => !e.is_blacklist_worthy(),
            _ => false,
        }
    }

    /// Short class name used as the blacklist cause when error details are hidden
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::NotCurrentlyValid(_) => "NotCurrentlyValid",
            PeerError::NotYetEnabled(_) => "NotYetEnabled",
            PeerError::StorageTimeout(_) => "StorageTimeout",
            PeerError::BlockOutOfOrder(_) => "BlockOutOfOrder",
            PeerError::ParseEof => "ParseEof",
            PeerError::Protocol(_) => "ProtocolError",
            PeerError::InvalidField { .. } => "InvalidField",
            PeerError::Validation(_) => "ValidationError",
            PeerError::Transport(e) => e.kind(),
        }
    }
}

impl From<ValidationError> for PeerError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::NotCurrentlyValid(m) => PeerError::NotCurrentlyValid(m),
            ValidationError::NotYetEnabled(m) => PeerError::NotYetEnabled(m),
            ValidationError::BlockOutOfOrder(m) => PeerError::BlockOutOfOrder(m),
            ValidationError::StorageTimeout(m) => PeerError::StorageTimeout(m),
            ValidationError::Invalid(m) => PeerError::Validation(m),
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() {
            PeerError::ParseEof
        } else {
            PeerError::Protocol(format!("malformed JSON: {err}"))
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("cannot resolve {0}")]
    Dns(String),
    #[error("connection reset")]
    ConnectionReset,
    #[error("channel closed")]
    Closed,
    #[error("maximum size exceeded: more than {limit} bytes")]
    SizeExceeded { limit: usize },
    #[error("bad frame: {0}")]
    Frame(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("bad JSON: {0}")]
    Json(String),
}

impl TransportError {
    /// Failures that just mean "try again later"; logged at debug only
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connect(_)
                | TransportError::Dns(_)
                | TransportError::ConnectionReset
                | TransportError::Closed
        )
    }

    /// A peer that streams past the response cap is treated as hostile
    pub fn is_blacklist_worthy(&self) -> bool {
        matches!(self, TransportError::SizeExceeded { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "Timeout",
            TransportError::Connect(_) => "ConnectError",
            TransportError::Dns(_) => "UnknownHost",
            TransportError::ConnectionReset => "ConnectionReset",
            TransportError::Closed => "ChannelClosed",
            TransportError::SizeExceeded { .. } => "SizeLimitExceeded",
            TransportError::Frame(_) => "FrameError",
            TransportError::Http(_) => "HttpError",
            TransportError::Json(_) => "JsonError",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(0)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_decode() {
            TransportError::Json(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                TransportError::ConnectionReset
            }
            WsError::Io(e) => TransportError::Connect(e.to_string()),
            WsError::Capacity(e) => TransportError::Frame(e.to_string()),
            other => TransportError::Http(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_causes_are_not_blacklisted() {
        assert!(PeerError::NotYetEnabled("x".into()).is_benign());
        assert!(PeerError::ParseEof.is_benign());
        assert!(PeerError::from(ValidationError::StorageTimeout("db".into())).is_benign());
        assert!(!PeerError::from(ValidationError::Invalid("sig".into())).is_benign());
        assert!(!PeerError::protocol("bad").is_benign());
    }

    #[test]
    fn size_exceeded_is_the_only_blacklist_worthy_transport_error() {
        assert!(TransportError::SizeExceeded { limit: 10 }.is_blacklist_worthy());
        assert!(!TransportError::SizeExceeded { limit: 10 }.is_benign());
        assert!(TransportError::Timeout(5).is_benign());
        assert!(!TransportError::Frame("x".into()).is_blacklist_worthy());
        assert!(!PeerError::from(TransportError::SizeExceeded { limit: 1 }).is_benign());
        assert!(PeerError::from(TransportError::Closed).is_benign());
    }

    #[test]
    fn truncated_json_is_parse_eof() {
        let err = serde_json::from_str::<serde_json::Value>("{\"a\":").unwrap_err();
        assert!(matches!(PeerError::from(err), PeerError::ParseEof));
        let err = serde_json::from_str::<serde_json::Value>("{]").unwrap_err();
        assert!(matches!(PeerError::from(err), PeerError::Protocol(_)));
    }
}
