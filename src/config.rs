use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub host: String,
    pub port: u16,
    /// HMAC secret for issued tokens
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// Roles tokens may be issued for
    pub token_roles: Vec<String>,
    /// Maximum distance between a request timestamp and server time
    pub auth_timestamp_window: Duration,
    pub database_url: Option<String>,
    pub chains_file: Option<PathBuf>,
    pub nft_indexer_url: Option<String>,
    pub oracle_timeout: Duration,
    pub bulk_limit: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string()),
            token_ttl: Duration::from_secs(
                env::var("TOKEN_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(14 * 24 * 60 * 60),
            ),
            token_roles: env::var("TOKEN_ROLES")
                .map(|s| {
                    s.split(',')
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec!["admin".into(), "verify".into()]),
            auth_timestamp_window: Duration::from_secs(
                env::var("AUTH_TIMESTAMP_WINDOW_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5 * 60),
            ),
            database_url: env::var("DATABASE_URL").ok(),
            chains_file: env::var("CHAINS_FILE").ok().map(PathBuf::from),
            nft_indexer_url: env::var("NFT_INDEXER_URL").ok(),
            oracle_timeout: Duration::from_millis(
                env::var("ORACLE_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5_000),
            ),
            bulk_limit: env::var("BULK_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
        }
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::tokens::token_lifetime(self.token_ttl).map_err(anyhow::Error::msg)?;
        if self.token_roles.is_empty() {
            anyhow::bail!("TOKEN_ROLES must name at least one role");
        }
        if self.bulk_limit == 0 {
            anyhow::bail!("BULK_LIMIT must be positive");
        }
        Ok(())
    }

    /// Chain registry from `chains_file`, or the built-in table
    pub fn load_chain_registry(&self) -> anyhow::Result<ChainRegistry> {
        match &self.chains_file {
            Some(path) => ChainRegistry::from_json_file(path),
            None => Ok(ChainRegistry::builtin()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

// ============ Chain Registry ============

/// Static metadata about a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub chain_id: String,
    pub bech32_prefix: String,
    pub coin_type: u32,
    pub fee_denom: String,
}

impl ChainInfo {
    pub fn new(chain_id: &str, bech32_prefix: &str, coin_type: u32, fee_denom: &str) -> Self {
        Self {
            chain_id: chain_id.into(),
            bech32_prefix: bech32_prefix.into(),
            coin_type,
            fee_denom: fee_denom.into(),
        }
    }
}

/// Immutable chain ID -> metadata table, loaded once at start-up.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<String, ChainInfo>,
}

impl ChainRegistry {
    pub fn new(chains: impl IntoIterator<Item = ChainInfo>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .map(|c| (c.chain_id.clone(), c))
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new([
            ChainInfo::new("cosmoshub-4", "cosmos", 118, "uatom"),
            ChainInfo::new("juno-1", "juno", 118, "ujuno"),
            ChainInfo::new("osmosis-1", "osmo", 118, "uosmo"),
            ChainInfo::new("stargaze-1", "stars", 118, "ustars"),
            ChainInfo::new("neutron-1", "neutron", 118, "untrn"),
            ChainInfo::new("migaloo-1", "migaloo", 118, "uwhale"),
            ChainInfo::new("terra2", "terra", 330, "uluna"),
            ChainInfo::new("injective-1", "inj", 60, "inj"),
            ChainInfo::new("uni-6", "juno", 118, "ujunox"),
            ChainInfo::new("osmo-test-5", "osmo", 118, "uosmo"),
            ChainInfo::new("pion-1", "neutron", 118, "untrn"),
            ChainInfo::new("injective-888", "inj", 60, "inj"),
        ])
    }

    /// Load a JSON array of [`ChainInfo`]
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let chains: Vec<ChainInfo> = serde_json::from_str(&json)?;
        Ok(Self::new(chains))
    }

    pub fn get(&self, chain_id: &str) -> Option<&ChainInfo> {
        self.chains.get(chain_id)
    }

    pub fn require(&self, chain_id: &str) -> ApiResult<&ChainInfo> {
        self.get(chain_id)
            .ok_or_else(|| ApiError::UnknownChain(chain_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainInfo> {
        self.chains.values()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
