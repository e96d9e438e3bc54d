//! Node lifecycle orchestration
//!
//! [`NodeLifecycleManager`] drives one node from request to a serving tunnel
//! and later to deletion. [`RecycleScheduler`] runs the timed loop that
//! provisions a replacement before retiring the node it replaces.

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod scheduler;
pub mod ssh;

pub use config::{KillswitchConfig, OrchestratorConfig, ProbeKind, SshConfig};
pub use context::{sweep_stragglers, LifecycleContext};
pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::NodeLifecycleManager;
pub use scheduler::RecycleScheduler;
pub use ssh::{generate_key, BannerProbe, SshCommandProbe, SshProbe};
