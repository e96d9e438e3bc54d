//! Provider errors

use nodeshift_proto::ProviderKind;
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The vendor answered with a non-2xx status
    #[error("{provider} {operation} failed with status {status}: {raw_response}")]
    Api {
        provider: ProviderKind,
        operation: &'static str,
        status: u16,
        raw_response: String,
    },

    /// The vendor answered 2xx but the body did not decode
    #[error("{provider} {operation} returned malformed JSON ({reason}): {raw_response}")]
    Malformed {
        provider: ProviderKind,
        operation: &'static str,
        reason: String,
        raw_response: String,
    },

    #[error("{provider} {operation} request failed: {source}")]
    Http {
        provider: ProviderKind,
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Every candidate provider was asked; none offers an eligible region
    #[error("No eligible region on {}", join_kinds(.providers))]
    NoEligibleRegion { providers: Vec<ProviderKind> },

    #[error("Invalid provider configuration: {0}")]
    Config(String),
}

fn join_kinds(kinds: &[ProviderKind]) -> String {
    let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    names.join(", ")
}

impl ProviderError {
    /// Failures a polling loop may ride out: transport errors, 5xx and 429
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Raw response body for API and decoding failures
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ProviderError::Api { raw_response, .. } | ProviderError::Malformed { raw_response, .. } => {
                Some(raw_response)
            }
            _ => None,
        }
    }
}
