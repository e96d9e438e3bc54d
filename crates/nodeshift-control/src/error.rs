//! Lifecycle errors

use nodeshift_proto::NodeState;
use nodeshift_provider::ProviderError;
use nodeshift_store::StoreError;
use nodeshift_trust::TrustError;
use nodeshift_tunnel::{ProcessError, TunnelError};
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh-keygen failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No provider is enabled")]
    NoProvider,

    /// Shutdown interrupted the lifecycle while it was in this state
    #[error("Lifecycle cancelled in state {0}")]
    Cancelled(NodeState),

    #[error("Lifecycle invariant violated: {0}")]
    InvariantViolation(String),
}

impl LifecycleError {
    /// Policy and verification failures; the cycle is abandoned without
    /// touching the active node
    pub fn is_fatal_policy(&self) -> bool {
        matches!(
            self,
            LifecycleError::Provider(ProviderError::NoEligibleRegion { .. })
                | LifecycleError::Trust(TrustError::Verification(_))
                | LifecycleError::InvariantViolation(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LifecycleError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeshift_proto::ProviderKind;

    #[test]
    fn test_policy_classification() {
        let region: LifecycleError = ProviderError::NoEligibleRegion {
            providers: vec![ProviderKind::UpCloud],
        }
        .into();
        assert!(region.is_fatal_policy());

        let trust: LifecycleError = TrustError::Verification("bad signature".to_string()).into();
        assert!(trust.is_fatal_policy());

        let api: LifecycleError = ProviderError::Api {
            provider: ProviderKind::DigitalOcean,
            operation: "create_instance",
            status: 422,
            raw_response: "{}".to_string(),
        }
        .into();
        assert!(!api.is_fatal_policy());

        assert!(LifecycleError::Cancelled(NodeState::KeyExchange).is_cancelled());
    }
}
