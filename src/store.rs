// =============================================================================
// FEDERATION NODE — store.rs
// =============================================================================
//
// Persistent tables for Node / NetMessage / PendingNetMessage.
// Every mutation runs under one write lock and is flushed to a JSON snapshot
// (write tmp + rename) before the lock is released.
// =============================================================================

use crate::error::{FederationError, FederationResult};
use crate::message::{NetMessage, PendingNetMessage};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, RwLockReadGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub nodes: BTreeMap<u64, Node>,
    pub messages: BTreeMap<Uuid, NetMessage>,
    pub pending: BTreeMap<u64, PendingNetMessage>,
    pub next_node_id: u64,
    pub next_pending_id: u64,
}

impl Tables {
    pub fn node_by_uuid(&self, uuid: &Uuid) -> Option<&Node> {
        self.nodes.values().find(|n| &n.uuid == uuid)
    }

    pub fn node_by_mac(&self, mac: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.mac_address == mac)
    }

    pub fn alloc_node_id(&mut self) -> u64 {
        self.next_node_id += 1;
        self.next_node_id
    }

    pub fn alloc_pending_id(&mut self) -> u64 {
        self.next_pending_id += 1;
        self.next_pending_id
    }

    pub fn pending_for(&self, message: &Uuid, node: &Uuid) -> Option<&PendingNetMessage> {
        self.pending
            .values()
            .find(|p| &p.message == message && &p.node == node)
    }
}

pub struct Store {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl Store {
    /// Volatile store, nothing touches disk
    pub fn in_memory() -> Self {
        Store {
            path: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn open(path: &Path) -> FederationResult<Self> {
        let tables = if path.exists() {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw).map_err(|e| {
                FederationError::Storage(format!("{}: {}", path.display(), e))
            })?
        } else {
            Tables::default()
        };
        log::debug!(
            "Store opened at {} ({} nodes, {} pending)",
            path.display(),
            tables.nodes.len(),
            tables.pending.len()
        );
        Ok(Store {
            path: Some(path.to_path_buf()),
            tables: RwLock::new(tables),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Apply `f` and persist the result atomically with respect to other writers.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> FederationResult<R> {
        let mut tables = self.tables.write().await;
        let out = f(&mut tables);
        self.flush(&tables).await?;
        Ok(out)
    }

    async fn flush(&self, tables: &Tables) -> FederationResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(tables)
            .map_err(|e| FederationError::Storage(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
