// =============================================================================
// FEDERATION NODE — registry.rs
// =============================================================================
//
// Node Registry: owns every Node record.
//   - resolves the local node (relation SELF), memoized per registry instance
//   - register_or_update: signed or admin-authorized upsert keyed by MAC
//   - candidate lookups for the signature verifier
//
// Nodes are never deleted here; they age out through relation changes.
// =============================================================================

use crate::config::{AdminPrincipal, Settings};
use crate::constants::{PERM_ADD_NODE, PERM_CHANGE_NODE};
use crate::error::{FederationError, FederationResult};
use crate::events::{EventBus, NodeEvent};
use crate::keystore::KeyStore;
use crate::node::{normalize_mac, slugify, Node, NodeRegistrationRequest, Relation};
use crate::signature::verify_with_pem;
use crate::store::{Store, Tables};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Registration {
    pub node: Node,
    pub created: bool,
    /// Fields whose value changed; `last_seen` is always present
    pub update_fields: Vec<&'static str>,
}

/// Registration request after field validation
struct Validated {
    hostname: String,
    mac: String,
    req: NodeRegistrationRequest,
}

fn validate(req: NodeRegistrationRequest) -> FederationResult<Validated> {
    let hostname = req
        .hostname
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from);
    let mac_raw = req
        .mac_address
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());

    let (Some(hostname), Some(mac_raw)) = (hostname, mac_raw) else {
        return Err(FederationError::Validation("required fields missing".into()));
    };
    if !req.has_locator() {
        return Err(FederationError::Validation("required fields missing".into()));
    }
    let mac = normalize_mac(mac_raw)
        .ok_or_else(|| FederationError::Validation(format!("invalid mac_address: {}", mac_raw)))?;
    let mut req = req;
    req.uuid = req.uuid.filter(|u| !u.is_nil());
    Ok(Validated { hostname, mac, req })
}

/// Assign `new` to `slot` when it differs, recording the field name.
fn assign<T: PartialEq>(fields: &mut Vec<&'static str>, name: &'static str, slot: &mut T, new: T) {
    if *slot != new {
        *slot = new;
        fields.push(name);
    }
}

fn clean(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub struct NodeRegistry {
    store: Arc<Store>,
    events: EventBus,
    local: Arc<RwLock<Option<Node>>>,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>, events: EventBus) -> Self {
        NodeRegistry {
            store,
            events,
            local: Arc::new(RwLock::new(None)),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -------------------------------------------------------------------------
    // Local node
    // -------------------------------------------------------------------------

    pub async fn get_local(&self) -> Option<Node> {
        if let Some(node) = self.local.read().await.clone() {
            return Some(node);
        }
        let found = self
            .store
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.relation == Relation::Local)
            .cloned();
        if found.is_some() {
            *self.local.write().await = found.clone();
        }
        found
    }

    pub async fn clear_local_cache(&self) {
        *self.local.write().await = None;
    }

    async fn refresh_local(&self, node: &Node) {
        if node.is_local() {
            *self.local.write().await = Some(node.clone());
        }
    }

    /// Create or refresh the SELF node from settings, generating a keypair if needed.
    pub async fn register_self(
        &self,
        settings: &Settings,
        keystore: &KeyStore,
    ) -> FederationResult<Node> {
        let cfg = &settings.node;
        let hostname = cfg.hostname.clone().unwrap_or_else(detect_hostname);
        let mac = match &cfg.mac_address {
            Some(raw) => normalize_mac(raw).ok_or_else(|| {
                FederationError::Validation(format!("invalid mac_address: {}", raw))
            })?,
            None => detect_mac(&cfg.base_dir)?,
        };

        let mut req = NodeRegistrationRequest {
            hostname: Some(hostname.clone()),
            mac_address: Some(mac.clone()),
            address: cfg.address.clone(),
            network_hostname: cfg.network_hostname.clone(),
            ipv4_address: cfg.ipv4_address.clone(),
            ipv6_address: cfg.ipv6_address.clone(),
            port: Some(cfg.port),
            role: cfg.role.clone(),
            features: Some(cfg.features.clone()),
            installed_version: cfg.installed_version.clone(),
            installed_revision: cfg.installed_revision.clone(),
            ..Default::default()
        };
        if !req.has_locator() {
            req.ipv4_address = Some(detect_ipv4());
        }

        let endpoint = self
            .get_by_mac(&mac)
            .await
            .map(|n| n.public_endpoint)
            .unwrap_or_else(|| slugify(&hostname));
        let draft = Node {
            id: 0,
            uuid: Uuid::nil(),
            hostname: hostname.clone(),
            network_hostname: None,
            address: None,
            ipv4_address: None,
            ipv6_address: None,
            port: cfg.port,
            mac_address: mac.clone(),
            public_key: None,
            relation: Relation::Local,
            trusted: true,
            role: None,
            features: vec![],
            installed_version: None,
            installed_revision: None,
            public_endpoint: endpoint,
            last_seen: Utc::now(),
        };
        let ks = keystore.clone();
        let public_key = tokio::task::spawn_blocking(move || ks.ensure_keypair(&draft))
            .await
            .map_err(|e| FederationError::Internal(e.to_string()))??;
        req.public_key = Some(public_key);

        let registration = self
            .apply(validate(req)?, Some(Relation::Local), true)
            .await?;
        log::info!(
            "🌐 Local node [{}] {} uuid={} mac={}",
            registration.node.hostname,
            if registration.created { "registered" } else { "refreshed" },
            registration.node.uuid,
            registration.node.mac_address
        );
        Ok(registration.node)
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub async fn register_or_update(
        &self,
        req: NodeRegistrationRequest,
        principal: Option<&AdminPrincipal>,
    ) -> FederationResult<Registration> {
        let validated = validate(req)?;
        self.refuse_local_identity(&validated).await?;
        let signature = clean(&validated.req.signature);

        let verified = match signature {
            Some(signature) => {
                let (Some(public_key), Some(token)) =
                    (clean(&validated.req.public_key), clean(&validated.req.token))
                else {
                    return Err(FederationError::InvalidSignature);
                };
                if !verify_with_pem(&public_key, token.as_bytes(), &signature) {
                    log::warn!(
                        "⚠️ registration for [{}] {} carried a bad signature",
                        validated.hostname,
                        validated.mac
                    );
                    return Err(FederationError::InvalidSignature);
                }
                true
            }
            None => {
                let Some(principal) = principal else {
                    return Err(FederationError::Unauthenticated);
                };
                let exists = self.get_by_mac(&validated.mac).await.is_some();
                let perm = if exists { PERM_CHANGE_NODE } else { PERM_ADD_NODE };
                if !principal.has_perm(perm) {
                    return Err(FederationError::Forbidden(perm.to_string()));
                }
                false
            }
        };

        let relation = validated
            .req
            .current_relation
            .as_deref()
            .and_then(Relation::parse)
            .filter(|r| *r != Relation::Local)
            .map(|r| r.inverse());

        self.apply(validated, relation, verified).await
    }

    /// Record a node learned locally (discovery, upstream info) without auth.
    pub async fn record(
        &self,
        req: NodeRegistrationRequest,
        relation: Relation,
        trusted: bool,
    ) -> FederationResult<Registration> {
        let validated = validate(req)?;
        if relation != Relation::Local {
            self.refuse_local_identity(&validated).await?;
        }
        self.apply(validated, Some(relation), trusted).await
    }

    /// Only `register_self` may write the SELF record.
    async fn refuse_local_identity(&self, v: &Validated) -> FederationResult<()> {
        let Some(local) = self.get_local().await else {
            return Ok(());
        };
        if local.mac_address == v.mac || v.req.uuid == Some(local.uuid) {
            log::warn!(
                "⚠️ refused registration of [{}] {}: claims the local node identity",
                v.hostname,
                v.mac
            );
            return Err(FederationError::Forbidden("local node identity".into()));
        }
        Ok(())
    }

    async fn apply(
        &self,
        v: Validated,
        relation: Option<Relation>,
        trusted: bool,
    ) -> FederationResult<Registration> {
        let now = Utc::now();
        let (registration, old_version, old_revision) = self
            .store
            .mutate(|t| -> FederationResult<_> {
                check_identity(t, &v)?;
                if relation == Some(Relation::Local) {
                    demote_other_locals(t, &v.mac);
                }
                let existing = t.node_by_mac(&v.mac).map(|n| n.id);
                match existing.and_then(|id| t.nodes.get_mut(&id)) {
                    Some(node) => {
                        let old_version = node.installed_version.clone();
                        let old_revision = node.installed_revision.clone();
                        let update_fields = update_node(node, &v, relation, trusted);
                        node.last_seen = now;
                        let reg = Registration {
                            node: node.clone(),
                            created: false,
                            update_fields,
                        };
                        Ok((reg, old_version, old_revision))
                    }
                    None => {
                        let id = t.alloc_node_id();
                        let node = new_node(id, &v, relation.unwrap_or_default(), trusted, now);
                        t.nodes.insert(id, node.clone());
                        let reg = Registration {
                            node,
                            created: true,
                            update_fields: vec![],
                        };
                        Ok((reg, None, None))
                    }
                }
            })
            .await??;

        self.refresh_local(&registration.node).await;
        self.events.publish(NodeEvent::InfoUpdated {
            uuid: registration.node.uuid,
            created: registration.created,
            old_version,
            new_version: registration.node.installed_version.clone(),
            old_revision,
            new_revision: registration.node.installed_revision.clone(),
        });
        log::debug!(
            "node [{}] created={} fields={:?}",
            registration.node.hostname,
            registration.created,
            registration.update_fields
        );
        Ok(registration)
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub async fn get_by_uuid(&self, uuid: &Uuid) -> Option<Node> {
        self.store.read().await.node_by_uuid(uuid).cloned()
    }

    pub async fn get_by_mac(&self, mac: &str) -> Option<Node> {
        let mac = normalize_mac(mac)?;
        self.store.read().await.node_by_mac(&mac).cloned()
    }

    pub async fn list(&self) -> Vec<Node> {
        self.store.read().await.nodes.values().cloned().collect()
    }

    pub async fn with_relation(&self, relation: Relation) -> Vec<Node> {
        self.store
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.relation == relation)
            .cloned()
            .collect()
    }

    /// Verifier candidates: UUID match, then MAC match, then public-key match.
    pub async fn candidates(
        &self,
        uuid: Option<&Uuid>,
        mac: Option<&str>,
        public_key: Option<&str>,
    ) -> Vec<Node> {
        let tables = self.store.read().await;
        let mut out: Vec<Node> = Vec::new();
        let mut push = |n: Option<&Node>| {
            if let Some(n) = n {
                if !out.iter().any(|o| o.id == n.id) {
                    out.push(n.clone());
                }
            }
        };
        if let Some(uuid) = uuid {
            push(tables.node_by_uuid(uuid));
        }
        if let Some(mac) = mac.and_then(normalize_mac) {
            push(tables.node_by_mac(&mac));
        }
        if let Some(pem) = public_key.map(str::trim).filter(|p| !p.is_empty()) {
            for n in tables.nodes.values() {
                if n.public_key.as_deref().map(str::trim) == Some(pem) {
                    push(Some(n));
                }
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    pub async fn set_relation(&self, uuid: &Uuid, relation: Relation) -> FederationResult<Node> {
        let node = self
            .store
            .mutate(|t| {
                let id = t.node_by_uuid(uuid).map(|n| n.id)?;
                if relation == Relation::Local {
                    let mac = t.nodes.get(&id)?.mac_address.clone();
                    demote_other_locals(t, &mac);
                }
                let node = t.nodes.get_mut(&id)?;
                node.relation = relation;
                Some(node.clone())
            })
            .await?
            .ok_or_else(|| FederationError::Validation(format!("unknown node {}", uuid)))?;
        if relation == Relation::Local {
            self.refresh_local(&node).await;
        } else {
            let cached = self.local.read().await.as_ref().map(|n| n.uuid);
            if cached == Some(node.uuid) {
                self.clear_local_cache().await;
            }
        }
        Ok(node)
    }

    /// Refresh `last_seen`
    pub async fn touch(&self, uuid: &Uuid) -> FederationResult<()> {
        self.store
            .mutate(|t| {
                if let Some(id) = t.node_by_uuid(uuid).map(|n| n.id) {
                    if let Some(node) = t.nodes.get_mut(&id) {
                        node.last_seen = Utc::now();
                    }
                }
            })
            .await
    }
}

fn demote_other_locals(t: &mut Tables, keep_mac: &str) {
    for node in t.nodes.values_mut() {
        if node.relation == Relation::Local && node.mac_address != keep_mac {
            log::warn!(
                "⚠️ demoting previous local node [{}] {} to PEER",
                node.hostname,
                node.mac_address
            );
            node.relation = Relation::Peer;
        }
    }
}

/// A claimed UUID must not belong to another MAC, and must match the UUID
/// already stored for this MAC.
fn check_identity(t: &Tables, v: &Validated) -> FederationResult<()> {
    let Some(claimed) = v.req.uuid else {
        return Ok(());
    };
    if let Some(owner) = t.node_by_uuid(&claimed) {
        if owner.mac_address != v.mac {
            return Err(FederationError::Validation(format!(
                "uuid {} already belongs to {}",
                claimed, owner.mac_address
            )));
        }
    }
    if let Some(known) = t.node_by_mac(&v.mac) {
        if known.uuid != claimed {
            return Err(FederationError::Validation(format!(
                "uuid {} does not match the node registered for {}",
                claimed, v.mac
            )));
        }
    }
    Ok(())
}

fn new_node(
    id: u64,
    v: &Validated,
    relation: Relation,
    trusted: bool,
    now: chrono::DateTime<Utc>,
) -> Node {
    let req = &v.req;
    Node {
        id,
        uuid: req.uuid.unwrap_or_else(Uuid::new_v4),
        hostname: v.hostname.clone(),
        network_hostname: clean(&req.network_hostname),
        address: clean(&req.address),
        ipv4_address: clean(&req.ipv4_address),
        ipv6_address: clean(&req.ipv6_address),
        port: req.port.unwrap_or(crate::constants::DEFAULT_PORT),
        mac_address: v.mac.clone(),
        public_key: clean(&req.public_key),
        relation,
        trusted,
        role: clean(&req.role),
        features: req.features.clone().unwrap_or_default(),
        installed_version: clean(&req.installed_version),
        installed_revision: clean(&req.installed_revision),
        public_endpoint: slugify(&v.hostname),
        last_seen: now,
    }
}

/// Apply only the fields the request carries; absent fields keep their value.
fn update_node(
    node: &mut Node,
    v: &Validated,
    relation: Option<Relation>,
    trusted: bool,
) -> Vec<&'static str> {
    let req = &v.req;
    let mut fields = Vec::new();
    assign(&mut fields, "hostname", &mut node.hostname, v.hostname.clone());
    if let Some(x) = clean(&req.network_hostname) {
        assign(&mut fields, "network_hostname", &mut node.network_hostname, Some(x));
    }
    if let Some(x) = clean(&req.address) {
        assign(&mut fields, "address", &mut node.address, Some(x));
    }
    if let Some(x) = clean(&req.ipv4_address) {
        assign(&mut fields, "ipv4_address", &mut node.ipv4_address, Some(x));
    }
    if let Some(x) = clean(&req.ipv6_address) {
        assign(&mut fields, "ipv6_address", &mut node.ipv6_address, Some(x));
    }
    if let Some(port) = req.port {
        assign(&mut fields, "port", &mut node.port, port);
    }
    if let Some(x) = clean(&req.public_key) {
        let replaced = node.public_key.as_deref().map_or(false, |k| k != x);
        assign(&mut fields, "public_key", &mut node.public_key, Some(x));
        // an unproven key replacement loses the old key's trust
        if replaced && !trusted {
            assign(&mut fields, "trusted", &mut node.trusted, false);
        }
    }
    if let Some(x) = clean(&req.role) {
        assign(&mut fields, "role", &mut node.role, Some(x));
    }
    if let Some(features) = &req.features {
        assign(&mut fields, "features", &mut node.features, features.clone());
    }
    if let Some(x) = clean(&req.installed_version) {
        assign(&mut fields, "installed_version", &mut node.installed_version, Some(x));
    }
    if let Some(x) = clean(&req.installed_revision) {
        assign(&mut fields, "installed_revision", &mut node.installed_revision, Some(x));
    }
    // a remote caller can never rewrite the local node's relation
    if let Some(relation) = relation {
        if !node.is_local() || relation == Relation::Local {
            assign(&mut fields, "relation", &mut node.relation, relation);
        }
    }
    if trusted {
        assign(&mut fields, "trusted", &mut node.trusted, true);
    }
    fields.push("last_seen");
    fields
}

// -----------------------------------------------------------------------------
// Host identity detection
// -----------------------------------------------------------------------------

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// First non-loopback interface MAC, else a locally administered MAC kept in
/// `<base>/node.mac` so the identity survives restarts.
fn detect_mac(base_dir: &Path) -> FederationResult<String> {
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        let mut names: Vec<_> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != "lo")
            .collect();
        names.sort();
        for name in names {
            let path = format!("/sys/class/net/{}/address", name);
            if let Some(mac) = std::fs::read_to_string(path)
                .ok()
                .and_then(|raw| normalize_mac(raw.trim()))
                .filter(|m| m != "00:00:00:00:00:00")
            {
                return Ok(mac);
            }
        }
    }

    let path = base_dir.join("node.mac");
    if let Some(mac) = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| normalize_mac(raw.trim()))
    {
        return Ok(mac);
    }
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    let mac = bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    std::fs::create_dir_all(base_dir)?;
    std::fs::write(&path, &mac)?;
    log::info!("generated node MAC {} ({})", mac, path.display());
    Ok(mac)
}

/// Outbound interface address; a UDP connect sends no packets.
fn detect_ipv4() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("192.0.2.1:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
