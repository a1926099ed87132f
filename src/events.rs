//! Typed node events on a bounded broadcast channel.
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! simply dropped, and slow subscribers lag rather than stall the registry.

use crate::constants::EVENT_BUS_CAPACITY;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A node record was created or its advertised information refreshed
    InfoUpdated {
        uuid: Uuid,
        created: bool,
        old_version: Option<String>,
        new_version: Option<String>,
        old_revision: Option<String>,
        new_revision: Option<String>,
    },
}

impl NodeEvent {
    pub fn version_changed(&self) -> bool {
        match self {
            NodeEvent::InfoUpdated {
                old_version,
                new_version,
                old_revision,
                new_revision,
                ..
            } => old_version != new_version || old_revision != new_revision,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

/// Log every node info update until the bus is dropped.
pub async fn run_update_log(mut rx: broadcast::Receiver<NodeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let NodeEvent::InfoUpdated { uuid, created, old_version, new_version, .. } = &event;
                if *created {
                    log::info!("➕ node {} joined (version {:?})", uuid, new_version);
                } else if event.version_changed() {
                    log::info!("⬆️ node {} version {:?} -> {:?}", uuid, old_version, new_version);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("⚠️ event log lagged, {} event(s) dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
