//! Protocol constants for the federation node
//!
//! Wire names, defaults and timeouts shared by the HTTP surface,
//! the outbound client and the background tasks.

/// Node software version advertised in `/nodes/info`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project tagline
pub const TAGLINE: &str = "Signed node registration and pull-based message relay";

// ═══════════════════════════════════════════════════════════════
// HTTP surface
// ═══════════════════════════════════════════════════════════════

pub const ROUTE_REGISTER: &str = "/nodes/register";
pub const ROUTE_INFO: &str = "/nodes/info";
pub const ROUTE_NET_MESSAGE: &str = "/nodes/net-message";
pub const ROUTE_NET_MESSAGE_PULL: &str = "/nodes/net-message/pull";
pub const ROUTE_PEERS: &str = "/nodes/peers";

/// Header carrying the base64 signature of the raw request body
pub const SIGNATURE_HEADER: &str = "x-signature";

// ═══════════════════════════════════════════════════════════════
// Defaults
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_KEY_BITS: usize = 2048;
pub const DEFAULT_CONFIG_FILE: &str = "federation.toml";
pub const STATE_FILE: &str = "federation-state.json";
pub const SECURITY_DIR: &str = "security";

/// Pending messages older than this are purged instead of delivered
pub const MESSAGE_RETENTION_HOURS: i64 = 24;
pub const POLL_INTERVAL_SECS: u64 = 60;
pub const PURGE_INTERVAL_SECS: u64 = 3600;
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Broadcast capacity of the node event bus
pub const EVENT_BUS_CAPACITY: usize = 64;

// ═══════════════════════════════════════════════════════════════
// Discovery
// ═══════════════════════════════════════════════════════════════

pub const DISCOVERY_PORTS: &[u16] = &[8888, 8000];
pub const DISCOVERY_TIMEOUT_SECS: u64 = 2;
pub const DISCOVERY_MAX_HOSTS: usize = 256;
pub const DISCOVERY_CONCURRENCY: usize = 32;

// ═══════════════════════════════════════════════════════════════
// Admin permissions
// ═══════════════════════════════════════════════════════════════

pub const PERM_ADD_NODE: &str = "add_node";
pub const PERM_CHANGE_NODE: &str = "change_node";

/// Print the startup banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              FEDERATION NODE                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  {}  v{}", TAGLINE, VERSION);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_route_nested_under_message_route() {
        assert!(ROUTE_NET_MESSAGE_PULL.starts_with(ROUTE_NET_MESSAGE));
    }

    #[test]
    fn test_signature_header_lowercase() {
        assert_eq!(SIGNATURE_HEADER, SIGNATURE_HEADER.to_lowercase());
    }
}
