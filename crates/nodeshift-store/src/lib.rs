//! Durable record of known nodes and orchestrator settings
//!
//! The store is a single JSON document with two collections, `connections`
//! and `config`. It is read fully at open and rewritten on every mutation by
//! writing a sibling temp file and renaming it over the original.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use nodeshift_proto::{Connection, NodeState};

/// Config key holding the id of the connection currently serving traffic
pub const ACTIVE_NODE_KEY: &str = "active_node";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl StoreDocument {
    fn upsert(&mut self, connection: &Connection) {
        match self.connections.iter_mut().find(|c| c.id == connection.id) {
            Some(existing) => *existing = connection.clone(),
            None => self.connections.push(connection.clone()),
        }
    }
}

#[derive(Debug)]
pub struct PersistenceStore {
    path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl PersistenceStore {
    /// Load the document at `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let document = match fs::read_to_string(&path) {
            Ok(json) if json.trim().is_empty() => StoreDocument::default(),
            Ok(json) => serde_json::from_str(&json).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        debug!(
            "Opened store {:?} with {} connections",
            path,
            document.connections.len()
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreDocument> {
        // A panic mid-mutation never commits, so the inner value is still the last written state
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-modify-write under the store lock; memory is only updated once
    /// the new document is on disk
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreDocument) -> R) -> StoreResult<R> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let result = f(&mut next);
        self.write(&next)?;
        *guard = next;
        Ok(result)
    }

    fn write(&self, document: &StoreDocument) -> StoreResult<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        Ok(())
    }

    pub fn snapshot(&self) -> StoreDocument {
        self.lock().clone()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.lock().connections.clone()
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.lock().connections.iter().find(|c| c.id == id).cloned()
    }

    /// Connections not yet marked deleted
    pub fn live_connections(&self) -> Vec<Connection> {
        self.lock()
            .connections
            .iter()
            .filter(|c| !c.is_deleted)
            .cloned()
            .collect()
    }

    pub fn upsert_connection(&self, connection: &Connection) -> StoreResult<()> {
        self.mutate(|doc| doc.upsert(connection))
    }

    /// Mark a connection deleted, returning false for an unknown id
    pub fn mark_deleted(&self, id: &str) -> StoreResult<bool> {
        self.mutate(|doc| {
            let found = doc.connections.iter_mut().find(|c| c.id == id);
            let known = found.is_some();
            if let Some(connection) = found {
                if connection.deleted_at.is_none() {
                    connection.mark_deleted();
                }
            }
            if doc.config.get(ACTIVE_NODE_KEY).map(String::as_str) == Some(id) {
                doc.config.remove(ACTIVE_NODE_KEY);
            }
            known
        })
    }

    pub fn get_config(&self, key: &str) -> Option<String> {
        self.lock().config.get(key).cloned()
    }

    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        self.mutate(|doc| {
            doc.config.insert(key.to_string(), value.to_string());
        })
    }

    pub fn remove_config(&self, key: &str) -> StoreResult<Option<String>> {
        self.mutate(|doc| doc.config.remove(key))
    }

    /// The connection recorded as serving traffic, if it is still live
    pub fn active_connection(&self) -> Option<Connection> {
        let doc = self.lock();
        let id = doc.config.get(ACTIVE_NODE_KEY)?;
        doc.connections
            .iter()
            .find(|c| &c.id == id && !c.is_deleted && c.state == NodeState::Active)
            .cloned()
    }

    /// Record `connection` and make it the active node in a single write
    pub fn promote(&self, connection: &Connection) -> StoreResult<()> {
        self.mutate(|doc| {
            doc.upsert(connection);
            doc.config
                .insert(ACTIVE_NODE_KEY.to_string(), connection.id.clone());
        })
    }
}
