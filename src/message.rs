// =============================================================================
// FEDERATION NODE — message.rs
// =============================================================================
//
// NetMessage      : broadcast with a reach policy, originated by one node
// PendingNetMessage: per-recipient queue row awaiting a pull
// MessagePayload  : wire form; always transmitted as the exact signed bytes
// =============================================================================

use crate::error::{FederationError, FederationResult};
use crate::node::Node;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// ReachPolicy: which nodes a message should reach
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachPolicy {
    pub role: Option<String>,
    pub feature: Option<String>,
    pub node: Option<Uuid>,
}

impl ReachPolicy {
    pub fn everyone() -> Self {
        ReachPolicy::default()
    }

    /// All present filters must match; no filters means every node.
    pub fn admits(&self, node: &Node) -> bool {
        if let Some(target) = self.node {
            if node.uuid != target {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if node.role.as_deref() != Some(role.as_str()) {
                return false;
            }
        }
        if let Some(feature) = &self.feature {
            if !node.has_feature(feature) {
                return false;
            }
        }
        true
    }
}

// -----------------------------------------------------------------------------
// NetMessage
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetMessage {
    pub uuid: Uuid,
    pub subject: String,
    pub body: String,
    pub origin: Uuid,
    pub reach: ReachPolicy,
    pub seen: Vec<Uuid>,
    pub created: DateTime<Utc>,
    pub complete: bool,
}

impl NetMessage {
    pub fn new(origin: Uuid, subject: &str, body: &str, reach: ReachPolicy) -> Self {
        NetMessage {
            uuid: Uuid::new_v4(),
            subject: subject.to_string(),
            body: body.to_string(),
            origin,
            reach,
            seen: vec![origin],
            created: Utc::now(),
            complete: false,
        }
    }

    pub fn has_seen(&self, node: &Uuid) -> bool {
        self.seen.contains(node)
    }

    /// Insert keeping first-seen order. Returns true if the set grew.
    pub fn mark_seen(&mut self, node: Uuid) -> bool {
        if self.has_seen(&node) {
            return false;
        }
        self.seen.push(node);
        true
    }

    pub fn to_payload(&self, sender: Uuid) -> MessagePayload {
        MessagePayload {
            uuid: Some(self.uuid),
            subject: Some(self.subject.clone()),
            body: self.body.clone(),
            origin: Some(self.origin),
            sender: Some(sender),
            seen: self.seen.clone(),
            reach: self.reach.clone(),
            created: Some(self.created),
        }
    }
}

// -----------------------------------------------------------------------------
// PendingNetMessage
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNetMessage {
    pub id: u64,
    pub message: Uuid,
    pub node: Uuid,
    pub seen: Vec<Uuid>,
    pub queued_at: DateTime<Utc>,
}

impl PendingNetMessage {
    pub fn is_stale(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.queued_at < now - retention
    }
}

// -----------------------------------------------------------------------------
// Wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePayload {
    pub uuid: Option<Uuid>,
    pub subject: Option<String>,
    pub body: String,
    pub origin: Option<Uuid>,
    pub sender: Option<Uuid>,
    pub seen: Vec<Uuid>,
    pub reach: ReachPolicy,
    pub created: Option<DateTime<Utc>>,
}

/// Validated view of a payload
#[derive(Debug, Clone)]
pub struct ParsedPayload {
    pub payload: MessagePayload,
    pub uuid: Uuid,
    pub subject: String,
    pub sender: Uuid,
    pub origin: Uuid,
}

impl MessagePayload {
    pub fn parse(raw: &[u8]) -> FederationResult<ParsedPayload> {
        let payload: MessagePayload = serde_json::from_slice(raw)
            .map_err(|_| FederationError::Validation("invalid message".into()))?;
        let (Some(uuid), Some(subject), Some(sender)) =
            (payload.uuid, payload.subject.clone(), payload.sender)
        else {
            return Err(FederationError::Validation("invalid message".into()));
        };
        let origin = payload.origin.unwrap_or(sender);
        Ok(ParsedPayload {
            payload,
            uuid,
            subject,
            sender,
            origin,
        })
    }

    /// Exact string that gets signed and transmitted
    pub fn to_json(&self) -> FederationResult<String> {
        serde_json::to_string(self).map_err(|e| FederationError::Internal(e.to_string()))
    }
}

impl ParsedPayload {
    pub fn into_message(self) -> NetMessage {
        let mut message = NetMessage {
            uuid: self.uuid,
            subject: self.subject,
            body: self.payload.body,
            origin: self.origin,
            reach: self.payload.reach,
            seen: vec![],
            created: self.payload.created.unwrap_or_else(Utc::now),
            complete: false,
        };
        for node in self.payload.seen {
            message.mark_seen(node);
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub requester: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    pub messages: Vec<SignedPayload>,
}
