// =============================================================================
// FEDERATION NODE — discovery.rs
// =============================================================================
//
// LAN discovery: query GET /nodes/info on every host of a set of IPv4
// networks, challenge each responder with a random token and record it as a
// PEER. Responders whose token signature verifies are marked trusted.
// =============================================================================

use crate::client::PeerClient;
use crate::constants::*;
use crate::error::{FederationError, FederationResult};
use crate::node::{Node, NodeInfo, Relation};
use crate::registry::NodeRegistry;
use crate::signature::verify_with_pem;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// IPv4 network in CIDR form, e.g. `192.168.1.0/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn parse(raw: &str) -> FederationResult<Self> {
        let invalid = || FederationError::Validation(format!("invalid network: {}", raw));
        let (addr, prefix) = match raw.trim().split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().map_err(|_| invalid())?),
            None => (raw.trim(), 32),
        };
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Ipv4Net::new(addr, prefix))
    }

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        Ipv4Net {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix)),
            prefix,
        }
    }

    /// Usable host addresses, at most `limit`. Network and broadcast
    /// addresses are skipped for prefixes shorter than /31.
    pub fn hosts(&self, limit: usize) -> Vec<Ipv4Addr> {
        let start = u32::from(self.network);
        let size: u64 = 1u64 << (32 - self.prefix as u32);
        let (first, last) = if self.prefix >= 31 {
            (start as u64, start as u64 + size - 1)
        } else {
            (start as u64 + 1, start as u64 + size - 2)
        };
        (first..=last)
            .take(limit)
            .map(|ip| Ipv4Addr::from(ip as u32))
            .collect()
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

/// /24 around the local node's IPv4 locator.
pub fn local_network(local: &Node) -> Option<Ipv4Net> {
    [&local.ipv4_address, &local.address]
        .into_iter()
        .flatten()
        .find_map(|a| a.parse::<Ipv4Addr>().ok())
        .map(|ip| Ipv4Net::new(ip, 24))
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub networks: Vec<Ipv4Net>,
    pub ports: Vec<u16>,
    pub timeout: Duration,
    pub max_hosts: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            networks: vec![],
            ports: DISCOVERY_PORTS.to_vec(),
            timeout: Duration::from_secs(DISCOVERY_TIMEOUT_SECS),
            max_hosts: DISCOVERY_MAX_HOSTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discovered {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub node: Node,
    pub created: bool,
}

/// Challenge token sent with each info request
fn challenge() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// True when `info` carries a signature of `token` made by its own key.
pub fn proves_key(info: &NodeInfo, token: &str) -> bool {
    match (&info.public_key, &info.token_signature) {
        (Some(pem), Some(sig)) => verify_with_pem(pem, token.as_bytes(), sig),
        _ => false,
    }
}

/// A responder is trusted when it proved its key just now, or when it is a
/// trusted node still advertising the key it was trusted with.
fn earned_trust(existing: Option<&Node>, info: &NodeInfo, proven: bool) -> bool {
    if proven {
        return true;
    }
    existing.map_or(false, |n| {
        n.trusted && n.public_key.as_deref().map(str::trim) == info.public_key.as_deref().map(str::trim)
    })
}

pub async fn scan(registry: &NodeRegistry, opts: &ScanOptions) -> FederationResult<Vec<Discovered>> {
    let local = registry.get_local().await;
    let local_mac = local.as_ref().map(|n| n.mac_address.clone());
    let networks = if opts.networks.is_empty() {
        local
            .as_ref()
            .and_then(local_network)
            .map(|n| vec![n])
            .ok_or_else(|| {
                FederationError::Validation("no network given and no local IPv4 address".into())
            })?
    } else {
        opts.networks.clone()
    };

    let mut targets: Vec<Ipv4Addr> = Vec::new();
    for net in &networks {
        let room = opts.max_hosts.saturating_sub(targets.len());
        targets.extend(net.hosts(room));
    }
    log::info!(
        "🔎 scanning {} host(s) on {} port(s) across {:?}",
        targets.len(),
        opts.ports.len(),
        networks.iter().map(|n| n.to_string()).collect::<Vec<_>>()
    );

    let client = PeerClient::new(opts.timeout)?;
    let semaphore = Arc::new(Semaphore::new(DISCOVERY_CONCURRENCY));
    let mut tasks = Vec::new();
    for ip in targets {
        for &port in &opts.ports {
            let client = client.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let token = challenge();
                let url = format!("http://{}:{}", ip, port);
                let info = client.fetch_info(&url, Some(token.as_str())).await.ok()?;
                let trusted = proves_key(&info, &token);
                Some((ip, port, info, trusted))
            }));
        }
    }

    let mut found = Vec::new();
    for task in tasks {
        let Ok(Some((ip, port, info, trusted))) = task.await else {
            continue;
        };
        if local_mac.as_deref() == Some(info.mac_address.as_str()) {
            continue;
        }
        let existing = registry.get_by_mac(&info.mac_address).await;
        let relation = existing.as_ref().map(|n| n.relation).unwrap_or(Relation::Peer);
        let trusted = earned_trust(existing.as_ref(), &info, trusted);

        let mut req = info.into_request();
        if req.address.is_none() {
            req.address = Some(ip.to_string());
        }
        req.port = Some(port);
        match registry.record(req, relation, trusted).await {
            Ok(reg) => {
                log::info!(
                    "🛰️ found [{}] at {}:{} trusted={}",
                    reg.node.hostname,
                    ip,
                    port,
                    reg.node.trusted
                );
                found.push(Discovered {
                    ip,
                    port,
                    node: reg.node,
                    created: reg.created,
                });
            }
            Err(e) => log::warn!("⚠️ responder at {}:{} not recorded: {}", ip, port, e),
        }
    }
    Ok(found)
}
