//! Tunnel script selection and execution
//!
//! Tunnels are driven entirely by shell scripts rendered from a closed
//! matrix keyed by tunnel type, side, platform, action and phase. The matrix
//! is validated when the [`TunnelManager`] is built, so a missing combination
//! is a startup error rather than a failure halfway through a lifecycle.

pub mod error;
pub mod manager;
pub mod process;
pub mod scripts;

pub use error::{ProcessError, TunnelError, TunnelResult};
pub use manager::{TunnelManager, TunnelSettings};
pub use process::{ProcessOutput, ProcessRunner, ShellRunner};
pub use scripts::{Renderer, ScriptContext, ScriptKey, ScriptMatrix};
