// =============================================================================
// FEDERATION NODE — poller.rs
// =============================================================================
//
// Background work that talks to other nodes:
//   forward    : push an accepted message to upstream relays / peers
//   poll       : pull queued messages from every upstream node
//   purge loop : drop stale pending rows
//
// Nothing here propagates errors: failures are logged and reported in the
// returned summaries; the next tick retries.
// =============================================================================

use crate::client::PeerClient;
use crate::message::PullRequest;
use crate::node::{Node, Relation};
use crate::propagation::{Accepted, PropagationEngine};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    pub node: Uuid,
    pub hostname: String,
    pub fetched: usize,
    pub accepted: usize,
    pub error: Option<String>,
}

impl PollSummary {
    fn failed(node: &Node, error: String) -> Self {
        PollSummary {
            node: node.uuid,
            hostname: node.hostname.clone(),
            fetched: 0,
            accepted: 0,
            error: Some(error),
        }
    }
}

/// Push to every node in `accepted.forward_to`; returns successful pushes.
pub async fn forward(engine: &PropagationEngine, client: &PeerClient, accepted: &Accepted) -> usize {
    if accepted.forward_to.is_empty() {
        return 0;
    }
    let signed = match engine.signed_payload(&accepted.message).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("❌ cannot sign message {} for forwarding: {}", accepted.message.uuid, e);
            return 0;
        }
    };

    let mut ok = 0;
    for node in &accepted.forward_to {
        let Some(url) = node.base_url() else {
            continue;
        };
        match client.push_message(&url, &signed).await {
            Ok(reply) => {
                ok += 1;
                log::info!(
                    "📤 message {} -> [{}] complete={}",
                    accepted.message.uuid,
                    node.hostname,
                    reply.complete
                );
            }
            Err(e) => log::warn!(
                "⚠️ push of {} to [{}] failed: {}",
                accepted.message.uuid,
                node.hostname,
                e
            ),
        }
    }
    ok
}

/// Pull queued messages from each upstream node and accept them locally.
pub async fn poll_upstreams(engine: &PropagationEngine, client: &PeerClient) -> Vec<PollSummary> {
    let Some(local) = engine.registry().get_local().await else {
        log::warn!("⚠️ poll skipped: local node not registered");
        return vec![];
    };
    let upstreams = engine.registry().with_relation(Relation::Upstream).await;
    let mut summaries = Vec::with_capacity(upstreams.len());

    for upstream in upstreams {
        let Some(url) = upstream.base_url() else {
            summaries.push(PollSummary::failed(&upstream, "no address".into()));
            continue;
        };
        let body = match serde_json::to_vec(&PullRequest { requester: local.uuid }) {
            Ok(b) => b,
            Err(e) => {
                summaries.push(PollSummary::failed(&upstream, e.to_string()));
                continue;
            }
        };
        let Some(signature) = engine.keystore().sign(&local, &body) else {
            summaries.push(PollSummary::failed(&upstream, "local node key unavailable".into()));
            continue;
        };

        let batch = match client.pull_messages(&url, body, &signature).await {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("⚠️ poll of [{}] failed: {}", upstream.hostname, e);
                summaries.push(PollSummary::failed(&upstream, e.to_string()));
                continue;
            }
        };
        if let Err(e) = engine.registry().touch(&upstream.uuid).await {
            log::warn!("⚠️ could not refresh last_seen of [{}]: {}", upstream.hostname, e);
        }

        let fetched = batch.messages.len();
        let mut accepted = 0;
        for signed in batch.messages {
            match engine.receive(signed.payload.as_bytes(), &signed.signature).await {
                Ok(a) => {
                    accepted += 1;
                    forward(engine, client, &a).await;
                }
                Err(e) => log::warn!(
                    "⚠️ message pulled from [{}] rejected: {}",
                    upstream.hostname,
                    e
                ),
            }
        }
        if fetched > 0 {
            log::info!(
                "📥 pulled {} message(s) from [{}], accepted {}",
                fetched,
                upstream.hostname,
                accepted
            );
        }
        summaries.push(PollSummary {
            node: upstream.uuid,
            hostname: upstream.hostname.clone(),
            fetched,
            accepted,
            error: None,
        });
    }
    summaries
}

pub async fn run_poll_loop(engine: Arc<PropagationEngine>, client: PeerClient, every: Duration) {
    let mut ticker = interval(every);
    log::info!("🔄 upstream poll loop started ({}s)", every.as_secs());
    loop {
        ticker.tick().await;
        let summaries = poll_upstreams(&engine, &client).await;
        let failed = summaries.iter().filter(|s| s.error.is_some()).count();
        if failed > 0 {
            log::debug!("poll cycle: {}/{} upstream(s) failed", failed, summaries.len());
        }
    }
}

pub async fn run_purge_loop(engine: Arc<PropagationEngine>, every: Duration) {
    let mut ticker = interval(every);
    log::info!("🧹 purge loop started ({}s)", every.as_secs());
    loop {
        ticker.tick().await;
        if let Err(e) = engine.purge_stale().await {
            log::error!("❌ purge failed: {}", e);
        }
    }
}
