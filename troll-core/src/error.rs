//! Error types shared by every target implementation.

use std::time::Duration;

/// Result alias used throughout the core.
pub type Result<T, E = TargetError> = std::result::Result<T, E>;

/// Everything that can go wrong while talking to a target.
///
/// A `Protocol` error means the wire state can no longer be trusted; callers
/// are expected to drop the session rather than keep issuing requests.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Malformed packet, bad checksum, unexpected reply shape or field.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A bounded wait elapsed without the expected data.
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        timeout: Duration,
    },

    /// The probe answered with an error packet.
    #[error("target reported error {code:?} while {context}")]
    TargetReported { code: Option<u8>, context: String },

    /// The operation has no meaning for this kind of target.
    #[error("operation `{0}` is not supported by this target")]
    Unsupported(&'static str),

    /// The run-state query answered with something that is not a number.
    #[error("cannot read target state, response is: {0:?}")]
    BadStateReply(String),

    #[error("register {index} out of range, target has {available} registers")]
    RegisterOutOfRange { index: u32, available: usize },

    #[error("no memory mapped at {address:#010x} (+{len} bytes)")]
    Unmapped { address: u32, len: usize },

    /// A textual query must print its start sentinel before the end sentinel.
    #[error("malformed query: {0:?}")]
    InvalidQuery(String),

    /// Flash programming was asked to do something it cannot do.
    #[error("cannot program flash: {0}")]
    FlashPrecondition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "hardware")]
    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

impl TargetError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the wire state is unrecoverable after this error.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desync_classification() {
        assert!(TargetError::protocol("bad checksum").is_desync());
        assert!(TargetError::Timeout { waiting_for: "ack", timeout: Duration::from_secs(1) }
            .is_desync());
        assert!(!TargetError::Unsupported("resume").is_desync());
        assert!(!TargetError::TargetReported { code: Some(1), context: "reading".into() }
            .is_desync());
    }

    #[test]
    fn test_messages() {
        let e = TargetError::RegisterOutOfRange { index: 20, available: 17 };
        assert_eq!(e.to_string(), "register 20 out of range, target has 17 registers");
        let e = TargetError::Unmapped { address: 0x1000, len: 4 };
        assert_eq!(e.to_string(), "no memory mapped at 0x00001000 (+4 bytes)");
    }
}
