//! SSH readiness probes and ephemeral key generation

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use nodeshift_tunnel::ProcessRunner;

use crate::error::{LifecycleError, LifecycleResult};

/// Decides whether sshd on a fresh node accepts connections yet
#[async_trait]
pub trait SshProbe: Send + Sync {
    async fn is_ready(&self, ip: IpAddr, port: u16) -> bool;
}

/// Connects and waits for the `SSH-` identification line
///
/// A refused or silent port is "not ready"; anything that speaks the SSH
/// protocol is ready, whatever it later does with credentials.
#[derive(Debug, Clone)]
pub struct BannerProbe {
    timeout: Duration,
}

impl BannerProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn read_banner(addr: SocketAddr) -> std::io::Result<String> {
        let stream = TcpStream::connect(addr).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        // Servers may send other lines before the identification string
        for _ in 0..8 {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if line.starts_with("SSH-") {
                return Ok(line);
            }
        }
        Ok(String::new())
    }
}

#[async_trait]
impl SshProbe for BannerProbe {
    async fn is_ready(&self, ip: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(ip, port);
        match tokio::time::timeout(self.timeout, Self::read_banner(addr)).await {
            Ok(Ok(banner)) if !banner.is_empty() => {
                debug!("{} answered with {}", addr, banner.trim());
                true
            }
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                debug!("SSH probe of {} failed: {}", addr, e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Runs `ssh` without credentials; an authentication rejection proves sshd is up
pub struct SshCommandProbe {
    runner: Arc<dyn ProcessRunner>,
    user: String,
    timeout: Duration,
}

impl SshCommandProbe {
    pub fn new(runner: Arc<dyn ProcessRunner>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            user: user.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SshProbe for SshCommandProbe {
    async fn is_ready(&self, ip: IpAddr, port: u16) -> bool {
        let args: Vec<String> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.timeout.as_secs().max(1)),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "PreferredAuthentications=none,publickey".into(),
            "-p".into(),
            port.to_string(),
            format!("{}@{}", self.user, ip),
            "true".into(),
        ];

        match self.runner.run("ssh", &args).await {
            Ok(output) => {
                output.success() || output.stderr.to_lowercase().contains("permission denied")
            }
            Err(e) => {
                debug!("ssh probe of {}:{} could not run: {}", ip, port, e);
                false
            }
        }
    }
}

pub fn public_key_path(private: &Path) -> PathBuf {
    let mut path = private.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Create a fresh key pair at `path` with `ssh-keygen`, returning the public key
pub async fn generate_key(
    runner: &dyn ProcessRunner,
    path: &Path,
    algorithm: &str,
    bits: Option<u32>,
    passphrase: Option<&str>,
    comment: &str,
) -> LifecycleResult<String> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_key_files(path).await;

    let mut args: Vec<String> = vec!["-q".into(), "-t".into(), algorithm.to_string()];
    if let Some(bits) = bits {
        args.push("-b".into());
        args.push(bits.to_string());
    }
    args.extend([
        "-N".to_string(),
        passphrase.unwrap_or_default().to_string(),
        "-C".to_string(),
        comment.to_string(),
        "-f".to_string(),
        path.display().to_string(),
    ]);

    let output = runner.run("ssh-keygen", &args).await?;
    if !output.success() {
        return Err(LifecycleError::KeyGeneration(output.stderr.trim().to_string()));
    }

    let public_key = tokio::fs::read_to_string(public_key_path(path)).await?;
    let public_key = public_key.trim().to_string();
    if public_key.is_empty() {
        return Err(LifecycleError::KeyGeneration(format!(
            "empty public key at {:?}",
            public_key_path(path)
        )));
    }

    Ok(public_key)
}

/// Remove both halves of a key pair, ignoring files that are already gone
pub async fn remove_key_files(path: &Path) {
    for file in [path.to_path_buf(), public_key_path(path)] {
        if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove {:?}: {}", file, e);
            }
        }
    }
}
