use crate::client::PeerClient;
use crate::config::{AdminPrincipal, Settings};
use crate::constants::*;
use crate::error::{FederationError, FederationResult};
use crate::keystore::KeyStore;
use crate::message::{MessagePayload, PullRequest, PullResponse};
use crate::node::{NodeInfo, NodeRegistrationRequest, Relation};
use crate::poller;
use crate::propagation::PropagationEngine;
use crate::registry::NodeRegistry;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<NodeRegistry>,
    pub engine: Arc<PropagationEngine>,
    pub keystore: KeyStore,
    pub client: PeerClient,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterReply {
    pub id: u64,
    pub uuid: Uuid,
    pub created: bool,
}

#[derive(Deserialize)]
pub struct InfoQuery {
    pub token: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct PropagateReply {
    pub status: String,
    pub complete: bool,
}

#[derive(Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(flatten)]
    pub info: NodeInfo,
    pub relation: Relation,
    pub trusted: bool,
    pub last_seen: String,
}

// Bearer token -> configured admin principal
fn principal<'a>(settings: &'a Settings, headers: &HeaderMap) -> Option<&'a AdminPrincipal> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    settings.principal(token)
}

fn signature(headers: &HeaderMap) -> FederationResult<String> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(FederationError::InvalidSignature)
}

pub async fn register_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> FederationResult<Json<RegisterReply>> {
    let request: NodeRegistrationRequest = serde_json::from_slice(&body)
        .map_err(|e| FederationError::Validation(format!("invalid JSON: {}", e)))?;
    let principal = principal(&state.settings, &headers);
    let registration = state.registry.register_or_update(request, principal).await?;
    log::info!(
        "🤝 node [{}] {} ({})",
        registration.node.hostname,
        if registration.created { "registered" } else { "updated" },
        registration.node.mac_address
    );
    Ok(Json(RegisterReply {
        id: registration.node.id,
        uuid: registration.node.uuid,
        created: registration.created,
    }))
}

pub async fn info_handler(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> FederationResult<Json<NodeInfo>> {
    let local = state
        .registry
        .get_local()
        .await
        .ok_or_else(|| FederationError::Internal("local node not registered".into()))?;
    let mut info = NodeInfo::from(&local);
    if let Some(token) = query.token.filter(|t| !t.is_empty()) {
        let sig = state
            .keystore
            .sign(&local, token.as_bytes())
            .ok_or_else(|| FederationError::Internal("local node key unavailable".into()))?;
        info.token_signature = Some(sig);
    }
    Ok(Json(info))
}

pub async fn net_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> FederationResult<Json<PropagateReply>> {
    // malformed payloads are a 400 whether or not they are signed
    MessagePayload::parse(&body)?;
    let sig = signature(&headers)?;
    let accepted = state.engine.receive(&body, &sig).await?;
    let complete = accepted.message.complete;

    if !accepted.forward_to.is_empty() {
        let engine = Arc::clone(&state.engine);
        let client = state.client.clone();
        tokio::spawn(async move {
            poller::forward(&engine, &client, &accepted).await;
        });
    }

    Ok(Json(PropagateReply {
        status: "propagated".to_string(),
        complete,
    }))
}

pub async fn pull_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> FederationResult<Json<PullResponse>> {
    serde_json::from_slice::<PullRequest>(&body)
        .map_err(|_| FederationError::Validation("invalid pull request".into()))?;
    let sig = signature(&headers)?;
    let messages = state.engine.pull(&body, &sig).await?;
    Ok(Json(PullResponse { messages }))
}

/// Admin principals only; the listing exposes keys and addresses.
async fn peers_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> FederationResult<Json<serde_json::Value>> {
    if principal(&state.settings, &headers).is_none() {
        return Err(FederationError::Unauthenticated);
    }
    let peers: Vec<PeerEntry> = state
        .registry
        .list()
        .await
        .iter()
        .map(|n| PeerEntry {
            info: NodeInfo::from(n),
            relation: n.relation,
            trusted: n.trusted,
            last_seen: n.last_seen.to_rfc3339(),
        })
        .collect();
    Ok(Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers,
    })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ROUTE_REGISTER, post(register_handler))
        .route(ROUTE_INFO, get(info_handler))
        .route(ROUTE_NET_MESSAGE, post(net_message_handler))
        .route(ROUTE_NET_MESSAGE_PULL, post(pull_handler))
        .route(ROUTE_PEERS, get(peers_handler))
        .with_state(state)
}
