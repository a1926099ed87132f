// =============================================================================
// FEDERATION NODE — node.rs
// =============================================================================
//
// Node identity record, its relation to the local node, and the request /
// document types exchanged over /nodes/register and /nodes/info.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Relation: a node's role relative to the local node
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Relation {
    #[serde(rename = "SELF")]
    Local,
    Upstream,
    Downstream,
    #[default]
    Peer,
}

impl Relation {
    pub fn name(&self) -> &'static str {
        match self {
            Relation::Local => "SELF",
            Relation::Upstream => "UPSTREAM",
            Relation::Downstream => "DOWNSTREAM",
            Relation::Peer => "PEER",
        }
    }

    /// The caller's view of us, seen from our side.
    pub fn inverse(&self) -> Relation {
        match self {
            Relation::Upstream => Relation::Downstream,
            Relation::Downstream => Relation::Upstream,
            other => *other,
        }
    }

    pub fn parse(s: &str) -> Option<Relation> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SELF" => Some(Relation::Local),
            "UPSTREAM" => Some(Relation::Upstream),
            "DOWNSTREAM" => Some(Relation::Downstream),
            "PEER" => Some(Relation::Peer),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub uuid: Uuid,
    pub hostname: String,
    pub network_hostname: Option<String>,
    pub address: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub port: u16,
    pub mac_address: String,
    pub public_key: Option<String>,
    pub relation: Relation,
    pub trusted: bool,
    pub role: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub installed_version: Option<String>,
    pub installed_revision: Option<String>,
    pub public_endpoint: String,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// First reachable locator: DNS name, generic address, IPv4, IPv6.
    pub fn host(&self) -> Option<String> {
        let pick = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
        pick(&self.network_hostname)
            .or_else(|| pick(&self.address))
            .or_else(|| pick(&self.ipv4_address))
            .or_else(|| pick(&self.ipv6_address).map(|v6| format!("[{}]", v6)))
    }

    pub fn base_url(&self) -> Option<String> {
        self.host().map(|h| format!("http://{}:{}", h, self.port))
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn is_local(&self) -> bool {
        self.relation == Relation::Local
    }
}

// -----------------------------------------------------------------------------
// NodeRegistrationRequest: body of POST /nodes/register
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRegistrationRequest {
    /// The node's own UUID; adopted on first registration
    pub uuid: Option<Uuid>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub address: Option<String>,
    pub network_hostname: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub port: Option<u16>,
    pub public_key: Option<String>,
    pub token: Option<String>,
    pub signature: Option<String>,
    pub role: Option<String>,
    pub features: Option<Vec<String>>,
    pub installed_version: Option<String>,
    pub installed_revision: Option<String>,
    pub current_relation: Option<String>,
}

impl NodeRegistrationRequest {
    pub fn has_locator(&self) -> bool {
        [
            &self.address,
            &self.network_hostname,
            &self.ipv4_address,
            &self.ipv6_address,
        ]
        .iter()
        .any(|v| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false))
    }

    /// Build the request a node sends about itself
    pub fn from_node(node: &Node) -> Self {
        NodeRegistrationRequest {
            uuid: Some(node.uuid),
            hostname: Some(node.hostname.clone()),
            mac_address: Some(node.mac_address.clone()),
            address: node.address.clone(),
            network_hostname: node.network_hostname.clone(),
            ipv4_address: node.ipv4_address.clone(),
            ipv6_address: node.ipv6_address.clone(),
            port: Some(node.port),
            public_key: node.public_key.clone(),
            token: None,
            signature: None,
            role: node.role.clone(),
            features: Some(node.features.clone()),
            installed_version: node.installed_version.clone(),
            installed_revision: node.installed_revision.clone(),
            current_relation: None,
        }
    }
}

// -----------------------------------------------------------------------------
// NodeInfo: identity document served by GET /nodes/info
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uuid: Uuid,
    pub hostname: String,
    pub network_hostname: Option<String>,
    pub address: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub port: u16,
    pub mac_address: String,
    pub public_key: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub role: Option<String>,
    pub installed_version: Option<String>,
    pub installed_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_signature: Option<String>,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            uuid: node.uuid,
            hostname: node.hostname.clone(),
            network_hostname: node.network_hostname.clone(),
            address: node.address.clone(),
            ipv4_address: node.ipv4_address.clone(),
            ipv6_address: node.ipv6_address.clone(),
            port: node.port,
            mac_address: node.mac_address.clone(),
            public_key: node.public_key.clone(),
            features: node.features.clone(),
            role: node.role.clone(),
            installed_version: node.installed_version.clone(),
            installed_revision: node.installed_revision.clone(),
            token_signature: None,
        }
    }
}

impl NodeInfo {
    pub fn into_request(self) -> NodeRegistrationRequest {
        NodeRegistrationRequest {
            uuid: Some(self.uuid),
            hostname: Some(self.hostname),
            mac_address: Some(self.mac_address),
            address: self.address,
            network_hostname: self.network_hostname,
            ipv4_address: self.ipv4_address,
            ipv6_address: self.ipv6_address,
            port: Some(self.port),
            public_key: self.public_key,
            token: None,
            signature: None,
            role: self.role,
            features: Some(self.features),
            installed_version: self.installed_version,
            installed_revision: self.installed_revision,
            current_relation: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

/// `AA-BB-CC-DD-EE-01` / `aabb.ccdd.ee01` -> `aa:bb:cc:dd:ee:01`
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let separators_ok = raw
        .chars()
        .all(|c| c.is_ascii_hexdigit() || matches!(c, ':' | '-' | '.'));
    if hex.len() != 12 || !separators_ok {
        return None;
    }
    let parts: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Some(parts.join(":"))
}

/// Lower-case slug used for key file names
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut dash = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    let slug = out.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "node".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
pub(crate) fn test_node(id: u64, hostname: &str, mac: &str, relation: Relation) -> Node {
    Node {
        id,
        uuid: Uuid::new_v4(),
        hostname: hostname.to_string(),
        network_hostname: None,
        address: Some(format!("10.0.0.{}", id)),
        ipv4_address: None,
        ipv6_address: None,
        port: 8888,
        mac_address: mac.to_string(),
        public_key: None,
        relation,
        trusted: false,
        role: None,
        features: vec![],
        installed_version: None,
        installed_revision: None,
        public_endpoint: slugify(hostname),
        last_seen: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-01").as_deref(), Some("aa:bb:cc:dd:ee:01"));
        assert_eq!(normalize_mac("aabb.ccdd.ee01").as_deref(), Some("aa:bb:cc:dd:ee:01"));
        assert_eq!(normalize_mac("aa:bb:cc"), None);
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:01"), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Edge 1.local"), "edge-1-local");
        assert_eq!(slugify("  --  "), "node");
    }

    #[test]
    fn test_relation_inverse_and_wire_name() {
        assert_eq!(Relation::Upstream.inverse(), Relation::Downstream);
        assert_eq!(Relation::Peer.inverse(), Relation::Peer);
        assert_eq!(serde_json::to_string(&Relation::Local).unwrap(), "\"SELF\"");
        assert_eq!(serde_json::to_string(&Relation::Downstream).unwrap(), "\"DOWNSTREAM\"");
        assert_eq!(Relation::parse("upstream"), Some(Relation::Upstream));
        assert_eq!(Relation::parse("self"), Some(Relation::Local));
        assert_eq!(Relation::parse("sideways"), None);
    }

    #[test]
    fn test_base_url_prefers_dns_then_address() {
        let mut n = test_node(5, "edge-1", "aa:bb:cc:dd:ee:01", Relation::Peer);
        assert_eq!(n.base_url().as_deref(), Some("http://10.0.0.5:8888"));
        n.network_hostname = Some("edge-1.lan".into());
        assert_eq!(n.base_url().as_deref(), Some("http://edge-1.lan:8888"));
        n.network_hostname = None;
        n.address = None;
        n.ipv6_address = Some("fe80::1".into());
        assert_eq!(n.base_url().as_deref(), Some("http://[fe80::1]:8888"));
    }

    #[test]
    fn test_request_locator_check() {
        let mut req = NodeRegistrationRequest::default();
        assert!(!req.has_locator());
        req.ipv4_address = Some("  ".into());
        assert!(!req.has_locator());
        req.ipv6_address = Some("::1".into());
        assert!(req.has_locator());
    }

    #[test]
    fn test_identity_uuid_travels_with_node() {
        let n = test_node(5, "edge-1", "aa:bb:cc:dd:ee:01", Relation::Peer);
        assert_eq!(NodeRegistrationRequest::from_node(&n).uuid, Some(n.uuid));
        assert_eq!(NodeInfo::from(&n).into_request().uuid, Some(n.uuid));

        let json = serde_json::to_value(NodeInfo::from(&n)).unwrap();
        assert_eq!(json["uuid"], serde_json::json!(n.uuid));
    }
}
