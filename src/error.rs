use std::time::Duration;

use thiserror::Error;

/// Every failure the node core can report. Connection-level variants are
/// absorbed by the peer group; the rest reach the caller with a stable code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated data: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad packet magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("declared payload length {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown xrouter command id {0}")]
    UnknownCommand(u32),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not yet connected")]
    NotYetConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    #[error("no spendable utxos")]
    NoSpendableUtxos,

    #[error("invalid plugin call: {0}")]
    InvalidPluginCall(String),

    #[error("no peer available for {0}")]
    NoPeer(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown currency {0}")]
    UnknownCurrency(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl Error {
    /// Stable numeric code surfaced to RPC callers.
    pub fn code(&self) -> i32 {
        match self {
            Error::Truncated { .. } => 1001,
            Error::BadMagic { .. } => 1002,
            Error::ChecksumMismatch => 1003,
            Error::MessageTooLarge { .. } => 1004,
            Error::UnknownCommand(_) => 1101,
            Error::Malformed(_) => 1102,
            Error::Protocol(_) => 1201,
            Error::NotYetConnected => 1202,
            Error::ConnectionClosed => 1203,
            Error::InvalidSignature => 1301,
            Error::InsufficientFunds { .. } => 2001,
            Error::NoSpendableUtxos => 2002,
            Error::InvalidAddress(_) => 2003,
            Error::UnknownCurrency(_) => 2004,
            Error::InvalidPluginCall(_) => 2101,
            Error::NoPeer(_) => 3001,
            Error::Timeout(_) => 3002,
            Error::Remote(_) => 3003,
            Error::Io(_) => 4001,
            Error::Secp256k1(_) => 4002,
            Error::Json(_) => 4003,
            Error::Config(_) => 4004,
            Error::Hex(_) => 4005,
        }
    }

    /// Framing and sequencing errors close the connection they happened on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::BadMagic { .. }
                | Error::ChecksumMismatch
                | Error::MessageTooLarge { .. }
                | Error::Protocol(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_are_fatal_test() {
        assert!(Error::ChecksumMismatch.is_fatal_to_connection());
        assert!(Error::Protocol("dup version".into()).is_fatal_to_connection());
        assert!(!Error::InvalidSignature.is_fatal_to_connection());
        assert!(!Error::InsufficientFunds {
            requested: 10,
            available: 1
        }
        .is_fatal_to_connection());
    }

    #[test]
    fn error_codes_are_distinct_by_category_test() {
        assert_ne!(
            Error::NoSpendableUtxos.code(),
            Error::NoPeer("BLOCK".into()).code()
        );
        assert_eq!(Error::Timeout(Duration::from_secs(1)).code(), 3002);
    }
}
