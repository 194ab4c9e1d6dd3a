use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the brokerage gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the gateway API is listening on.
    pub port: u16,
    /// Client id announced in the handshake.
    pub client_id: i32,
    /// Per-exchange timeout in seconds (connect + handshake, or request + response).
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7496,
            client_id: 1,
            timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Access restrictions applied before any request reaches the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub readonly: bool,
    /// Whitelisted account ids. Empty means every account is allowed.
    pub authorized_accounts: Vec<String>,
}

impl PolicyConfig {
    /// Parse a comma-separated whitelist, ignoring blanks.
    pub fn parse_accounts(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|account| !account.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Response cache sizing and freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of in-memory entries before LRU eviction.
    pub capacity: usize,
    /// Enables the disk tier when set.
    pub dir: Option<PathBuf>,
    /// Market data windows that closed before the current month.
    pub historical_ttl_secs: u64,
    /// Market data windows overlapping the current month.
    pub current_ttl_secs: u64,
    pub contract_ttl_secs: u64,
    pub account_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            dir: None,
            historical_ttl_secs: 7 * 24 * 3600,
            current_ttl_secs: 4 * 3600,
            contract_ttl_secs: 24 * 3600,
            account_ttl_secs: 15,
        }
    }
}

/// Everything the bridge needs, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub gateway: GatewayConfig,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
}
