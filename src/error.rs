//! Error types for the gate

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the gate's components
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration is missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Whitelist file could not be read
    #[error("whitelist file '{}' does not exist or is unreadable: {source}", path.display())]
    WhitelistUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Whitelist file is not a valid JSON membership list
    #[error("whitelist file '{}' is not valid: {source}", path.display())]
    WhitelistInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Peer sent something the codec cannot accept
    #[error("protocol error: {0}")]
    Protocol(ProtocolErrorKind),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Reasons a frame or packet is rejected by the codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolErrorKind {
    #[error("VarInt is longer than 5 bytes")]
    VarIntTooLong,
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("negative length")]
    NegativeLength,
    #[error("string of {len} bytes exceeds limit of {limit}")]
    StringTooLong { len: usize, limit: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet ended early")]
    Truncated,
    #[error("unexpected packet id {id:#04x} in {phase} phase")]
    UnexpectedPacket { id: i32, phase: &'static str },
    #[error("unknown next state {0}")]
    UnknownNextState(i32),
}

impl From<ProtocolErrorKind> for GateError {
    fn from(kind: ProtocolErrorKind) -> Self {
        GateError::Protocol(kind)
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_messages() {
        let err = GateError::from(ProtocolErrorKind::FrameTooLarge {
            len: 40_000,
            limit: 32_768,
        });
        assert_eq!(
            err.to_string(),
            "protocol error: frame of 40000 bytes exceeds limit of 32768"
        );

        let err = GateError::from(ProtocolErrorKind::UnexpectedPacket {
            id: 0x05,
            phase: "status",
        });
        assert_eq!(
            err.to_string(),
            "protocol error: unexpected packet id 0x05 in status phase"
        );
    }

    #[test]
    fn test_whitelist_error_mentions_path() {
        let err = GateError::WhitelistUnreadable {
            path: PathBuf::from("/srv/whitelist.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/srv/whitelist.json"));
        assert!(msg.contains("unreadable"));
    }
}
