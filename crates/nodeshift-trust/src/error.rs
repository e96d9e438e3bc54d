//! Trust errors

use thiserror::Error;

pub type TrustResult<T> = Result<T, TrustError>;

#[derive(Debug, Error)]
pub enum TrustError {
    /// Bad signature, wrong subject, expired or malformed payload
    #[error("Host key verification failed: {0}")]
    Verification(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("KV service returned status {status}: {body}")]
    Kv { status: u16, body: String },

    #[error("KV request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Known hosts I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trust fetch cancelled")]
    Cancelled,
}

impl TrustError {
    /// Failures worth polling through; verification never is
    pub fn is_transient(&self) -> bool {
        match self {
            TrustError::Http(_) => true,
            TrustError::Kv { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
