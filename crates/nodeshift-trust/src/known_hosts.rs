//! Append-only known-hosts record

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::TrustResult;

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host pattern as OpenSSH writes it
    fn host_pattern(host: IpAddr, port: u16) -> String {
        if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Record a verified host key
    pub async fn append(&self, host: IpAddr, port: u16, host_key: &str) -> TrustResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let line = format!("{} {}\n", Self::host_pattern(host, port), host_key.trim());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Drop every entry for `host:port`; a missing file is not an error
    pub async fn remove(&self, host: IpAddr, port: u16) -> TrustResult<usize> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let pattern = Self::host_pattern(host, port);
        let mut removed = 0;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let matches = line.split_whitespace().next() == Some(pattern.as_str());
                if matches {
                    removed += 1;
                }
                !matches
            })
            .collect();

        if removed > 0 {
            let mut rewritten = kept.join("\n");
            if !rewritten.is_empty() {
                rewritten.push('\n');
            }
            fs::write(&self.path, rewritten).await?;
        }

        Ok(removed)
    }

    /// Whether a line for `host:port` carrying `host_key` is recorded
    pub async fn contains(&self, host: IpAddr, port: u16, host_key: &str) -> TrustResult<bool> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let expected = format!("{} {}", Self::host_pattern(host, port), host_key.trim());
        Ok(content.lines().any(|line| line.trim() == expected))
    }
}
