//! Tunnel enable/disable driver
//!
//! Tracks which nodes currently have a tunnel up. Disabling a node that was
//! never enabled (or already disabled) is a no-op, and the killswitch is only
//! lifted once no killswitched tunnel remains.
//!
//! Proxy tunnels of every node share `127.0.0.1:{local_port}`, so enabling a
//! proxy node first releases the forward of the node it replaces. Should the
//! new tunnel fail, the released forward is brought back up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use nodeshift_proto::{Node, Platform, ScriptAction, ScriptPhase, TunnelType};

use crate::error::{TunnelError, TunnelResult};
use crate::process::ProcessRunner;
use crate::scripts::{ScriptContext, ScriptKey, ScriptMatrix};

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub ssh_user: String,
    pub known_hosts: PathBuf,
    /// Pid files, control sockets and generated configs live here
    pub state_dir: PathBuf,
    pub killswitch: bool,
    pub allowed_subnets: Vec<String>,
}

#[derive(Debug)]
struct EnabledTunnel {
    node: Node,
    killswitch: bool,
}

pub struct TunnelManager {
    matrix: ScriptMatrix,
    runner: Arc<dyn ProcessRunner>,
    settings: TunnelSettings,
    enabled: Mutex<HashMap<String, EnabledTunnel>>,
}

impl TunnelManager {
    /// Build a manager, refusing a matrix that lacks any script needed by
    /// `tunnels` on `platforms`
    pub fn new(
        matrix: ScriptMatrix,
        runner: Arc<dyn ProcessRunner>,
        settings: TunnelSettings,
        tunnels: &[TunnelType],
        platforms: &[Platform],
    ) -> TunnelResult<Self> {
        matrix.validate(tunnels, platforms)?;

        Ok(Self {
            matrix,
            runner,
            settings,
            enabled: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    fn context<'a>(&'a self, node: &'a Node) -> ScriptContext<'a> {
        ScriptContext {
            node,
            ssh_user: &self.settings.ssh_user,
            known_hosts: &self.settings.known_hosts,
            state_dir: &self.settings.state_dir,
            allowed_subnets: &self.settings.allowed_subnets,
        }
    }

    /// Server-side preparation, shipped to the node as user data
    pub fn server_prepare_script(&self, node: &Node) -> TunnelResult<String> {
        let key = ScriptKey::server(node.tunnel_type, ScriptPhase::Prepare);
        self.matrix.render(key, &self.context(node))
    }

    async fn run(&self, key: ScriptKey, node: &Node) -> TunnelResult<()> {
        let script = self.matrix.render(key, &self.context(node))?;
        debug!("Running {} for node {}", key, node.uid);

        let output = self.runner.run_script(&script).await?;
        if !output.success() {
            return Err(TunnelError::Establish {
                key,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    fn client_key(node: &Node, action: ScriptAction, phase: ScriptPhase) -> ScriptKey {
        ScriptKey::client(node.tunnel_type, node.platform, action, phase)
    }

    /// Bring the tunnel up for `node`, then the killswitch if configured
    pub async fn enable(&self, node: &Node) -> TunnelResult<()> {
        let mut enabled = self.enabled.lock().await;
        if enabled.contains_key(&node.uid) {
            debug!("Tunnel for node {} already enabled", node.uid);
            return Ok(());
        }

        let released = if node.tunnel_type.binds_local_port() {
            self.release_port(&mut enabled, node).await?
        } else {
            Vec::new()
        };

        if let Err(e) = self.bring_up(node).await {
            for tunnel in released {
                self.restore(&mut enabled, tunnel).await;
            }
            return Err(e);
        }

        enabled.insert(
            node.uid.clone(),
            EnabledTunnel {
                node: node.clone(),
                killswitch: self.settings.killswitch,
            },
        );
        info!("🔒 {} tunnel up via node {}", node.tunnel_type, node.uid);

        Ok(())
    }

    /// Stop every other forward listening on the port `node` is about to bind
    ///
    /// Released tunnels are no longer tracked, so disabling their node later
    /// is a no-op. Their killswitch rules stay until the new node's replace them.
    async fn release_port(
        &self,
        enabled: &mut HashMap<String, EnabledTunnel>,
        node: &Node,
    ) -> TunnelResult<Vec<EnabledTunnel>> {
        let port = node.params.local_port;
        let holders: Vec<String> = enabled
            .iter()
            .filter(|(uid, t)| {
                **uid != node.uid
                    && t.node.tunnel_type.binds_local_port()
                    && t.node.params.local_port == port
            })
            .map(|(uid, _)| uid.clone())
            .collect();

        let mut released = Vec::with_capacity(holders.len());
        for uid in holders {
            let Some(tunnel) = enabled.remove(&uid) else {
                continue;
            };
            let key = Self::client_key(&tunnel.node, ScriptAction::Main, ScriptPhase::Disable);
            if let Err(e) = self.run(key, &tunnel.node).await {
                enabled.insert(uid, tunnel);
                return Err(e);
            }
            info!(
                "Released 127.0.0.1:{} from node {} for node {}",
                port, uid, node.uid
            );
            released.push(tunnel);
        }

        Ok(released)
    }

    /// Bring a released tunnel back after its replacement failed
    async fn restore(&self, enabled: &mut HashMap<String, EnabledTunnel>, tunnel: EnabledTunnel) {
        let node = &tunnel.node;
        let mut result = self
            .run(
                Self::client_key(node, ScriptAction::Main, ScriptPhase::Enable),
                node,
            )
            .await;
        if result.is_ok() && tunnel.killswitch {
            result = self
                .run(
                    Self::client_key(node, ScriptAction::Killswitch, ScriptPhase::Enable),
                    node,
                )
                .await;
        }

        match result {
            Ok(()) => {
                info!("Restored {} tunnel via node {}", node.tunnel_type, node.uid);
                enabled.insert(node.uid.clone(), tunnel);
            }
            Err(e) => warn!("Could not restore tunnel via node {}: {}", node.uid, e),
        }
    }

    /// Prepare, enable and guard the tunnel; a failed killswitch takes the tunnel back down
    async fn bring_up(&self, node: &Node) -> TunnelResult<()> {
        let prepare = Self::client_key(node, ScriptAction::Main, ScriptPhase::Prepare);
        if self.matrix.contains(&prepare) {
            self.run(prepare, node).await?;
        }

        self.run(
            Self::client_key(node, ScriptAction::Main, ScriptPhase::Enable),
            node,
        )
        .await?;

        if self.settings.killswitch {
            let result = self
                .run(
                    Self::client_key(node, ScriptAction::Killswitch, ScriptPhase::Enable),
                    node,
                )
                .await;

            if let Err(e) = result {
                warn!("Killswitch failed for node {}, tearing tunnel down", node.uid);
                if let Err(teardown) = self
                    .run(
                        Self::client_key(node, ScriptAction::Main, ScriptPhase::Disable),
                        node,
                    )
                    .await
                {
                    warn!("Tunnel teardown for node {} failed: {}", node.uid, teardown);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Track a tunnel brought up by an earlier process so it can be disabled
    pub async fn adopt(&self, node: &Node) {
        self.enabled.lock().await.insert(
            node.uid.clone(),
            EnabledTunnel {
                node: node.clone(),
                killswitch: self.settings.killswitch,
            },
        );
        debug!("Adopted {} tunnel via node {}", node.tunnel_type, node.uid);
    }

    /// Take the tunnel for `node` down
    pub async fn disable(&self, node: &Node) -> TunnelResult<()> {
        let mut enabled = self.enabled.lock().await;
        let Some(tunnel) = enabled.remove(&node.uid) else {
            debug!("Tunnel for node {} not enabled, nothing to disable", node.uid);
            return Ok(());
        };

        let main = self
            .run(
                Self::client_key(node, ScriptAction::Main, ScriptPhase::Disable),
                node,
            )
            .await;

        let still_guarded = enabled.values().any(|t| t.killswitch);
        let killswitch = if tunnel.killswitch && !still_guarded {
            self.run(
                Self::client_key(node, ScriptAction::Killswitch, ScriptPhase::Disable),
                node,
            )
            .await
        } else {
            Ok(())
        };

        info!("{} tunnel via node {} down", node.tunnel_type, node.uid);
        main.and(killswitch)
    }

    pub async fn is_enabled(&self, uid: &str) -> bool {
        self.enabled.lock().await.contains_key(uid)
    }

    pub async fn enabled_count(&self) -> usize {
        self.enabled.lock().await.len()
    }
}
