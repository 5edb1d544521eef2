//! Error types for CMP client, transport and mock server operations
//!
//! Every fallible library operation returns [`Result<T>`]. The variants follow
//! the phase in which the failure happens: setup errors (`Io`, `Format`,
//! `CredentialMismatch`, `TrustConfig`, `ProtocolConfig`) abort a run before
//! any message is sent, while `Transport`, `Decode`, `MessageCheck` and
//! `ProtocolStatus` abort only the current transaction and the remaining
//! repeat iterations.

use crate::protocol::PkiStatusInfo;
use std::path::PathBuf;

/// Error taxonomy for the CMP client
#[derive(Debug, thiserror::Error)]
pub enum CmpError {
    /// File open/read/write failure
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No format variant could parse the input
    #[error("format error: {0}")]
    Format(String),

    /// Key does not match certificate, or a required credential is missing
    #[error("credential mismatch: {0}")]
    CredentialMismatch(String),

    /// Trust store construction failure
    #[error("trust store error: {0}")]
    TrustConfig(String),

    /// Invalid option value or option combination
    #[error("configuration error: {0}")]
    ProtocolConfig(String),

    /// Missing capture file, network failure, timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed protocol message (captured file or network payload)
    #[error("decode error: {0}")]
    Decode(String),

    /// Response failed transaction ID, nonce, sender or protection checks
    #[error("message check failed: {0}")]
    MessageCheck(String),

    /// Peer returned a rejection or an unexpected status
    #[error("{context}: {status}")]
    ProtocolStatus {
        context: String,
        status: PkiStatusInfo,
    },
}

impl CmpError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CmpError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised while building the client, before any exchange
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            CmpError::Io { .. }
                | CmpError::Format(_)
                | CmpError::CredentialMismatch(_)
                | CmpError::TrustConfig(_)
                | CmpError::ProtocolConfig(_)
        )
    }
}

impl From<openssl::error::ErrorStack> for CmpError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        CmpError::Format(format!("openssl: {}", e))
    }
}

/// Result type alias for CMP operations
pub type Result<T> = std::result::Result<T, CmpError>;
