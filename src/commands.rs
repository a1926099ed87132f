// =============================================================================
// FEDERATION NODE — commands.rs
// =============================================================================
//
// `federation-node node ...` operator commands. Each command works on a
// Context (settings + store + registry + engine) and returns something
// printable; main.rs owns printing and exit codes.
// =============================================================================

use crate::api::AppState;
use crate::client::{PeerClient, RegisterResponse};
use crate::config::Settings;
use crate::discovery::{self, Discovered, ScanOptions};
use crate::error::{FederationError, FederationResult};
use crate::events::EventBus;
use crate::keystore::{public_pem, KeyStore};
use crate::message::ReachPolicy;
use crate::node::{Node, NodeRegistrationRequest, Relation};
use crate::poller;
use crate::propagation::{Accepted, PropagationEngine};
use crate::registry::NodeRegistry;
use crate::store::Store;
use std::sync::Arc;
use uuid::Uuid;

pub struct Context {
    pub settings: Arc<Settings>,
    pub registry: Arc<NodeRegistry>,
    pub keystore: KeyStore,
    pub engine: Arc<PropagationEngine>,
    pub client: PeerClient,
}

impl Context {
    /// Open the on-disk state described by `settings`.
    pub fn open(settings: Settings) -> FederationResult<Self> {
        std::fs::create_dir_all(&settings.node.base_dir)?;
        let store = Arc::new(Store::open(&settings.state_path())?);
        let registry = Arc::new(NodeRegistry::new(store.clone(), EventBus::new()));
        let keystore = KeyStore::new(&settings.node.base_dir, settings.node.key_bits);
        let engine = Arc::new(PropagationEngine::new(
            store,
            registry,
            keystore,
            settings.federation.retention(),
        ));
        let client = PeerClient::new(settings.federation.request_timeout())?;
        Ok(Context::from_engine(settings, engine, client))
    }

    pub fn from_engine(settings: Settings, engine: Arc<PropagationEngine>, client: PeerClient) -> Self {
        Context {
            settings: Arc::new(settings),
            registry: Arc::clone(engine.registry()),
            keystore: engine.keystore().clone(),
            engine,
            client,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            settings: self.settings.clone(),
            registry: self.registry.clone(),
            engine: self.engine.clone(),
            keystore: self.keystore.clone(),
            client: self.client.clone(),
        }
    }

    /// Local node, self-registering on first use.
    pub async fn local(&self) -> FederationResult<Node> {
        match self.registry.get_local().await {
            Some(node) => Ok(node),
            None => self.registry.register_self(&self.settings, &self.keystore).await,
        }
    }

    fn upstream_url(&self) -> FederationResult<String> {
        self.settings
            .federation
            .upstream_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                FederationError::Validation(
                    "no upstream configured (federation.upstream_url / FEDERATION_UPSTREAM)".into(),
                )
            })
    }
}

// -----------------------------------------------------------------------------
// register / register-curl
// -----------------------------------------------------------------------------

/// Signed registration request describing the local node to an upstream.
pub async fn registration_request(ctx: &Context, token: &str) -> FederationResult<NodeRegistrationRequest> {
    let local = ctx.local().await?;
    let signature = ctx
        .keystore
        .sign(&local, token.as_bytes())
        .ok_or_else(|| FederationError::Internal("local node key unavailable".into()))?;
    let mut req = NodeRegistrationRequest::from_node(&local);
    req.token = Some(token.to_string());
    req.signature = Some(signature);
    // how we see the receiver
    req.current_relation = Some(Relation::Upstream.name().to_string());
    Ok(req)
}

pub struct Enrollment {
    pub response: RegisterResponse,
    pub upstream: Node,
}

pub async fn register(ctx: &Context, token: &str) -> FederationResult<Enrollment> {
    let upstream_url = ctx.upstream_url()?;
    let req = registration_request(ctx, token).await?;
    let response = ctx.client.register(&upstream_url, &req).await?;
    log::info!(
        "✅ registered with {} as {} (created={})",
        upstream_url,
        response.uuid,
        response.created
    );

    let challenge = Uuid::new_v4().to_string();
    let info = ctx.client.fetch_info(&upstream_url, Some(challenge.as_str())).await?;
    let trusted = discovery::proves_key(&info, &challenge);
    let mut up = info.into_request();
    if !up.has_locator() {
        up.address = host_of(&upstream_url);
    }
    let upstream = ctx.registry.record(up, Relation::Upstream, trusted).await?.node;
    Ok(Enrollment { response, upstream })
}

pub async fn register_curl(
    ctx: &Context,
    upstream_url: &str,
    local_base: Option<&str>,
    token: &str,
) -> FederationResult<String> {
    let req = match local_base {
        Some(base) => {
            let info = ctx.client.fetch_info(base, Some(token)).await?;
            let signature = info.token_signature.clone().ok_or_else(|| {
                FederationError::Network(format!("{} did not sign the token", base))
            })?;
            let mut req = info.into_request();
            req.token = Some(token.to_string());
            req.signature = Some(signature);
            req.current_relation = Some(Relation::Upstream.name().to_string());
            req
        }
        None => registration_request(ctx, token).await?,
    };
    curl_command(upstream_url, &req)
}

pub fn curl_command(upstream_url: &str, req: &NodeRegistrationRequest) -> FederationResult<String> {
    let body = serde_json::to_string(req).map_err(|e| FederationError::Internal(e.to_string()))?;
    let url = format!(
        "{}{}",
        upstream_url.trim_end_matches('/'),
        crate::constants::ROUTE_REGISTER
    );
    Ok(format!(
        "curl -sS -X POST {} -H 'Content-Type: application/json' -d {}",
        shell_quote(&url),
        shell_quote(&body)
    ))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => authority,
    };
    Some(host.trim_matches(|c| c == '[' || c == ']').to_string()).filter(|h| !h.is_empty())
}

// -----------------------------------------------------------------------------
// discover / peers / check
// -----------------------------------------------------------------------------

pub async fn discover(ctx: &Context, opts: &ScanOptions) -> FederationResult<String> {
    ctx.local().await?;
    let found = discovery::scan(&ctx.registry, opts).await?;
    Ok(discovered_table(&found))
}

fn discovered_table(found: &[Discovered]) -> String {
    if found.is_empty() {
        return "No nodes found.".to_string();
    }
    let rows: Vec<Vec<String>> = found
        .iter()
        .map(|d| {
            vec![
                d.node.hostname.clone(),
                format!("{}:{}", d.ip, d.port),
                d.node.uuid.to_string(),
                d.node.relation.name().to_string(),
                yes_no(d.node.trusted),
                if d.created { "new" } else { "known" }.to_string(),
            ]
        })
        .collect();
    render_table(&["HOSTNAME", "ADDRESS", "UUID", "RELATION", "TRUSTED", "STATE"], &rows)
}

pub async fn peers(ctx: &Context) -> FederationResult<String> {
    let nodes = ctx.registry.list().await;
    if nodes.is_empty() {
        return Ok("No nodes registered.".to_string());
    }
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|n| {
            vec![
                n.hostname.clone(),
                n.uuid.to_string(),
                n.relation.name().to_string(),
                n.host().map(|h| format!("{}:{}", h, n.port)).unwrap_or_else(|| "-".into()),
                yes_no(n.trusted),
                n.installed_version.clone().unwrap_or_else(|| "-".into()),
                n.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    Ok(render_table(
        &["HOSTNAME", "UUID", "RELATION", "ADDRESS", "TRUSTED", "VERSION", "LAST SEEN"],
        &rows,
    ))
}

#[derive(Debug, Clone)]
pub struct CheckRow {
    pub hostname: String,
    pub relation: Relation,
    pub url: Option<String>,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl CheckRow {
    pub fn reachable(&self) -> bool {
        self.url.is_some() && self.error.is_none()
    }
}

pub async fn check(ctx: &Context) -> FederationResult<Vec<CheckRow>> {
    let mut rows = Vec::new();
    for node in ctx.registry.list().await {
        if node.is_local() {
            continue;
        }
        let url = node.base_url();
        let mut row = CheckRow {
            hostname: node.hostname.clone(),
            relation: node.relation,
            url: url.clone(),
            version: None,
            error: None,
        };
        match url {
            None => row.error = Some("no address".into()),
            Some(url) => match ctx.client.fetch_info(&url, None).await {
                Ok(info) => {
                    row.version = info.installed_version;
                    ctx.registry.touch(&node.uuid).await?;
                }
                Err(e) => row.error = Some(e.to_string()),
            },
        }
        rows.push(row);
    }
    Ok(rows)
}

pub fn check_table(rows: &[CheckRow]) -> String {
    if rows.is_empty() {
        return "No remote nodes to check.".to_string();
    }
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.hostname.clone(),
                r.relation.name().to_string(),
                r.url.clone().unwrap_or_else(|| "-".into()),
                if r.reachable() { "online" } else { "offline" }.to_string(),
                r.version.clone().or_else(|| r.error.clone()).unwrap_or_default(),
            ]
        })
        .collect();
    render_table(&["HOSTNAME", "RELATION", "URL", "STATUS", "DETAIL"], &rows)
}

// -----------------------------------------------------------------------------
// ready / send
// -----------------------------------------------------------------------------

/// Local node exists, its private key is on disk and matches the stored public key.
pub async fn ready(ctx: &Context) -> FederationResult<String> {
    ctx.registry.clear_local_cache().await;
    let local = ctx
        .registry
        .get_local()
        .await
        .ok_or_else(|| FederationError::Internal("local node not registered".into()))?;
    let key = ctx.keystore.load_private_key(&local).ok_or_else(|| {
        FederationError::Internal(format!(
            "no private key at {}",
            ctx.keystore.private_key_path(&local).display()
        ))
    })?;
    let derived = public_pem(&key)?;
    let stored = local.public_key.as_deref().map(str::trim).unwrap_or_default();
    if stored != derived.trim() {
        return Err(FederationError::Internal(
            "stored public key does not match private key".into(),
        ));
    }
    let pending = ctx.engine.pending().await.len();
    Ok(format!(
        "ready: [{}] {} ({} pending message(s))",
        local.hostname, local.uuid, pending
    ))
}

pub async fn set_relation(ctx: &Context, uuid: &Uuid, relation: &str) -> FederationResult<String> {
    let relation = Relation::parse(relation)
        .filter(|r| *r != Relation::Local)
        .ok_or_else(|| {
            FederationError::Validation(format!(
                "invalid relation: {} (UPSTREAM, DOWNSTREAM or PEER)",
                relation
            ))
        })?;
    let before = ctx
        .registry
        .get_by_uuid(uuid)
        .await
        .ok_or_else(|| FederationError::Validation(format!("unknown node {}", uuid)))?;
    if before.is_local() {
        return Err(FederationError::Validation("cannot change the local node's relation".into()));
    }
    let node = ctx.registry.set_relation(uuid, relation).await?;
    Ok(format!(
        "[{}] {} -> {}",
        node.hostname,
        before.relation.name(),
        node.relation.name()
    ))
}

pub async fn send(ctx: &Context, subject: &str, body: &str, reach: ReachPolicy) -> FederationResult<Accepted> {
    ctx.local().await?;
    let accepted = ctx.engine.originate(subject, body, reach).await?;
    let pushed = poller::forward(&ctx.engine, &ctx.client, &accepted).await;
    log::info!(
        "message {} queued, pushed to {}/{} node(s)",
        accepted.message.uuid,
        pushed,
        accepted.forward_to.len()
    );
    Ok(accepted)
}

// -----------------------------------------------------------------------------
// Table rendering
// -----------------------------------------------------------------------------

fn yes_no(v: bool) -> String {
    if v { "yes" } else { "no" }.to_string()
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }
    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let mut out = vec![line(headers.to_vec())];
    out.push(line(dashes.iter().map(String::as_str).collect()));
    for row in rows {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::tests::{fixture, Fixture};
    use crate::signature::test_keys::public_pem as test_public_pem;
    use crate::signature::verify_with_pem;
    use std::time::Duration;

    fn context(f: &Fixture) -> Context {
        Context::from_engine(
            Settings::default(),
            Arc::clone(&f.engine),
            PeerClient::new(Duration::from_millis(300)).unwrap(),
        )
    }

    /// A second node with its own store, registry and key (test key 2).
    async fn edge_context(dir: &tempfile::TempDir) -> Context {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let store = Arc::new(Store::in_memory());
        let registry = Arc::new(NodeRegistry::new(store.clone(), EventBus::new()));
        let keystore = KeyStore::new(dir.path(), 1024);
        let local = registry
            .record(
                NodeRegistrationRequest {
                    hostname: Some("edge-9".into()),
                    mac_address: Some("02:00:00:00:00:09".into()),
                    address: Some("10.0.0.99".into()),
                    public_key: Some(test_public_pem(2)),
                    ..Default::default()
                },
                Relation::Local,
                true,
            )
            .await
            .unwrap()
            .node;
        std::fs::create_dir_all(dir.path().join("security")).unwrap();
        let pem = crate::signature::test_keys::key(2).to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(keystore.private_key_path(&local), pem.as_bytes()).unwrap();
        let engine = Arc::new(PropagationEngine::new(
            store,
            registry,
            keystore,
            chrono::Duration::hours(24),
        ));
        Context::from_engine(
            Settings::default(),
            engine,
            PeerClient::new(Duration::from_millis(300)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_enrolled_edge_pulls_from_separate_hub() {
        use crate::message::{MessagePayload, PullRequest};
        use crate::node::NodeInfo;
        use crate::signature::sign_payload;

        let hub = fixture().await;
        let dir = tempfile::tempdir().unwrap();
        let edge = edge_context(&dir).await;
        let edge_local = edge.local().await.unwrap();

        // edge enrolls at the hub, the hub is recorded at the edge
        let req = registration_request(&edge, "enroll-7").await.unwrap();
        let enrolled = hub.engine.registry().register_or_update(req, None).await.unwrap();
        assert_eq!(enrolled.node.uuid, edge_local.uuid);
        assert_eq!(enrolled.node.relation, Relation::Downstream);
        let hub_info = NodeInfo::from(&hub.local).into_request();
        let upstream = edge.registry.record(hub_info, Relation::Upstream, true).await.unwrap().node;
        assert_eq!(upstream.uuid, hub.local.uuid);

        // a message reaches the hub and is queued for the edge
        let body = crate::propagation::tests::payload_from(&hub.sender, "firmware");
        let sig = sign_payload(&crate::signature::test_keys::key(1), body.as_bytes()).unwrap();
        let accepted = hub.engine.receive(body.as_bytes(), &sig).await.unwrap();

        // the edge pulls with its own identity and key
        let pull = serde_json::to_vec(&PullRequest { requester: edge_local.uuid }).unwrap();
        let pull_sig = edge.keystore.sign(&edge_local, &pull).unwrap();
        let batch = hub.engine.pull(&pull, &pull_sig).await.unwrap();
        assert_eq!(batch.len(), 1);

        let got = edge
            .engine
            .receive(batch[0].payload.as_bytes(), &batch[0].signature)
            .await
            .unwrap();
        assert_eq!(got.message.uuid, accepted.message.uuid);
        assert_eq!(MessagePayload::parse(batch[0].payload.as_bytes()).unwrap().sender, hub.local.uuid);
        // the hub already saw it, so it is not pushed back
        assert!(got.forward_to.is_empty());
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let table = render_table(
            &["A", "BB"],
            &[vec!["long-value".into(), "x".into()], vec!["s".into(), "yy".into()]],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "A           BB");
        assert_eq!(lines[1], "----------  --");
        assert_eq!(lines[2], "long-value  x");
        assert_eq!(lines[3], "s           yy");
    }

    #[test]
    fn test_shell_quote_and_host_of() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(host_of("http://10.1.2.3:8888/").as_deref(), Some("10.1.2.3"));
        assert_eq!(host_of("https://hub.example.org").as_deref(), Some("hub.example.org"));
        assert_eq!(host_of("http://[fd00::1]:8888").as_deref(), Some("fd00::1"));
    }

    #[tokio::test]
    async fn test_registration_request_is_signed_by_local_key() {
        let f = fixture().await;
        let ctx = context(&f);
        let req = registration_request(&ctx, "enroll-1").await.unwrap();
        assert_eq!(req.mac_address.as_deref(), Some("02:00:00:00:00:01"));
        assert_eq!(req.current_relation.as_deref(), Some("UPSTREAM"));
        let sig = req.signature.clone().unwrap();
        assert!(verify_with_pem(&test_public_pem(0), b"enroll-1", &sig));

        let cmd = curl_command("http://hub:8888/", &req).unwrap();
        assert!(cmd.starts_with("curl -sS -X POST 'http://hub:8888/nodes/register'"));
        assert!(cmd.contains("\"token\":\"enroll-1\""));
    }

    #[tokio::test]
    async fn test_register_without_upstream_fails() {
        let f = fixture().await;
        let ctx = context(&f);
        let err = register(&ctx, "tok").await.err().unwrap();
        assert!(matches!(err, FederationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_ready_checks_key_pair() {
        let f = fixture().await;
        let ctx = context(&f);
        assert!(ready(&ctx).await.unwrap().contains("hub"));

        ctx.registry
            .record(
                NodeRegistrationRequest {
                    hostname: Some("hub".into()),
                    mac_address: Some("02:00:00:00:00:01".into()),
                    address: Some("10.0.0.9".into()),
                    public_key: Some(test_public_pem(1)),
                    ..Default::default()
                },
                Relation::Local,
                true,
            )
            .await
            .unwrap();
        assert!(ready(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_ready_without_local_node_fails() {
        let ctx = Context::from_engine(
            Settings::default(),
            Arc::new(PropagationEngine::new(
                Arc::new(Store::in_memory()),
                Arc::new(crate::registry::tests::registry()),
                KeyStore::new(std::path::Path::new("/nonexistent"), 1024),
                chrono::Duration::hours(24),
            )),
            PeerClient::new(Duration::from_millis(300)).unwrap(),
        );
        assert!(ready(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_set_relation_command() {
        let f = fixture().await;
        let ctx = context(&f);
        let out = set_relation(&ctx, &f.sender.uuid, "peer").await.unwrap();
        assert_eq!(out, "[upstream] UPSTREAM -> PEER");
        assert!(set_relation(&ctx, &f.sender.uuid, "SELF").await.is_err());
        assert!(set_relation(&ctx, &f.local.uuid, "PEER").await.is_err());
        assert!(set_relation(&ctx, &Uuid::new_v4(), "PEER").await.is_err());
    }

    #[tokio::test]
    async fn test_peers_table_lists_every_node() {
        let f = fixture().await;
        let table = peers(&context(&f)).await.unwrap();
        for host in ["hub", "upstream", "edge-1"] {
            assert!(table.contains(host));
        }
        assert!(table.contains("SELF"));
        assert!(table.contains("DOWNSTREAM"));
    }

    #[tokio::test]
    async fn test_check_marks_unreachable_nodes_offline() {
        let f = fixture().await;
        let ctx = context(&f);
        for (host, mac, relation) in [
            ("upstream", "02:00:00:00:00:02", Relation::Upstream),
            ("edge-1", "02:00:00:00:00:03", Relation::Downstream),
        ] {
            ctx.registry
                .record(
                    NodeRegistrationRequest {
                        hostname: Some(host.into()),
                        mac_address: Some(mac.into()),
                        address: Some("127.0.0.1".into()),
                        port: Some(9),
                        ..Default::default()
                    },
                    relation,
                    true,
                )
                .await
                .unwrap();
        }
        let rows = check(&ctx).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.reachable()));
        let table = check_table(&rows);
        assert!(table.contains("offline"));
    }

    #[tokio::test]
    async fn test_send_originates_from_local() {
        let f = fixture().await;
        let ctx = context(&f);
        let reach = ReachPolicy { role: Some("Constellation".into()), ..Default::default() };
        let accepted = send(&ctx, "notice", "hello", reach).await.unwrap();
        assert_eq!(accepted.message.origin, f.local.uuid);
        assert!(f.engine.message(&accepted.message.uuid).await.is_some());
    }
}
