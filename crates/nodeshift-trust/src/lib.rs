//! Out-of-band host identity verification
//!
//! A freshly provisioned node signs its SSH host public key with a per-node
//! shared secret and publishes the token to a key/value service under the
//! node's uid. The client polls for that token, verifies the signature, and
//! only then trusts the host key.

pub mod bootstrap;
pub mod error;
pub mod known_hosts;
pub mod kv;
pub mod store;
pub mod token;

pub use bootstrap::publish_script;
pub use error::{TrustError, TrustResult};
pub use known_hosts::KnownHosts;
pub use kv::{HttpKvClient, KvClient, HEARTBEAT_KEY};
pub use store::TrustStore;
pub use token::{generate_secret, HostKeyClaims, HostKeyToken};
