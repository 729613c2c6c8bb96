//! Configuration for the yield rebalancing agent

use crate::model::GrantFrequency;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use url::Url;

/// Agent id override
pub const AGENT_ID_ENV: &str = "YIELD_AGENT_ID";
/// Pyth Hermes endpoint override
pub const HERMES_URL_ENV: &str = "HERMES_URL";
/// Yield API endpoint override
pub const YIELD_API_URL_ENV: &str = "YIELD_API_URL";

/// Supported blockchain networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Ethereum,
    Base,
    Optimism,
    Arbitrum,
    Polygon,
    Celo,
    Avalanche,
    WorldChain,
}

impl Network {
    pub const ALL: [Network; 8] = [
        Network::Ethereum,
        Network::Base,
        Network::Optimism,
        Network::Arbitrum,
        Network::Polygon,
        Network::Celo,
        Network::Avalanche,
        Network::WorldChain,
    ];

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::Base => 8453,
            Network::Optimism => 10,
            Network::Arbitrum => 42161,
            Network::Polygon => 137,
            Network::Celo => 42220,
            Network::Avalanche => 43114,
            Network::WorldChain => 480,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Base => "base",
            Network::Optimism => "optimism",
            Network::Arbitrum => "arbitrum",
            Network::Polygon => "polygon",
            Network::Celo => "celo",
            Network::Avalanche => "avalanche",
            Network::WorldChain => "world-chain",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_lowercase();
        match lowered.as_str() {
            "mainnet" => return Ok(Network::Ethereum),
            "worldchain" | "world_chain" => return Ok(Network::WorldChain),
            _ => {}
        }
        Network::ALL
            .into_iter()
            .find(|n| n.name() == lowered)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown network: {}", s)))
    }
}

/// Decision thresholds and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Minimum APR improvement in percentage points (e.g., 1.0)
    pub min_apr_delta: f64,
    /// Minimum net profit after costs, as a percent of the moved amount
    pub min_profit_percent: f64,
    /// Largest amount moved by a single rebalance
    pub max_rebalance_amount: f64,
    /// Asset held in the yield positions
    pub asset: String,
    /// Minimum seconds between rebalances (0 disables)
    #[serde(default)]
    pub cooldown_seconds: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_apr_delta: 1.0,
            min_profit_percent: 0.5,
            max_rebalance_amount: 1_000.0,
            asset: "USDC".to_string(),
            cooldown_seconds: 0,
        }
    }
}

/// Owner grant requested when the agent is provisioned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Owner address granting the authorization
    pub grantor: String,
    /// Maximum value moved per period
    pub amount_ceiling: f64,
    pub frequency: GrantFrequency,
}

/// Custody settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    /// Network the agent wallet is provisioned on
    pub wallet_network: Network,
    /// Vault contract invoked to move funds
    pub vault_address: String,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            wallet_network: Network::Base,
            vault_address: "0x0000000000000000000000000000000000000000".to_string(),
        }
    }
}

/// Where yield figures come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    /// Fixed table from `paper_yields`
    #[default]
    Paper,
    /// Live HTTP endpoints
    Http,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaperYield {
    pub apr: f64,
    pub tvl: f64,
}

/// Oracle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub mode: OracleMode,
    pub hermes_url: String,
    pub yield_api_url: String,
    #[serde(default)]
    pub paper_yields: BTreeMap<Network, PaperYield>,
    #[serde(default)]
    pub paper_prices: HashMap<String, f64>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let paper_yields = [
            (Network::Base, 4.2, 4_200_000.0),
            (Network::Polygon, 11.4, 2_600_000.0),
            (Network::Celo, 5.3, 1_100_000.0),
            (Network::Arbitrum, 7.1, 6_800_000.0),
            (Network::Optimism, 6.2, 3_900_000.0),
        ]
        .into_iter()
        .map(|(network, apr, tvl)| (network, PaperYield { apr, tvl }))
        .collect();

        let paper_prices = [
            ("ETH", 2_500.0),
            ("USDC", 1.0),
            ("USDT", 1.0),
            ("DAI", 1.0),
            ("MATIC", 0.7),
            ("CELO", 0.6),
            ("AVAX", 30.0),
        ]
        .into_iter()
        .map(|(asset, price)| (asset.to_string(), price))
        .collect();

        Self {
            mode: OracleMode::Paper,
            hermes_url: "https://hermes.pyth.network".to_string(),
            yield_api_url: "http://localhost:8080".to_string(),
            paper_yields,
            paper_prices,
        }
    }
}

/// Gas spent on the source network, in its native asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCost {
    pub native_asset: String,
    pub gas_native: f64,
}

impl NetworkCost {
    fn new(native_asset: &str, gas_native: f64) -> Self {
        Self {
            native_asset: native_asset.to_string(),
            gas_native,
        }
    }
}

/// Cost model used to judge whether a move pays for itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModelConfig {
    pub networks: BTreeMap<Network, NetworkCost>,
    /// Bridge messaging fee in ETH
    pub bridge_fee_eth: f64,
    /// Used when the oracle cannot price a native asset
    pub fallback_native_price: f64,
    /// Moves that take longer than this to earn back their cost are rejected
    pub max_break_even_days: f64,
    /// Horizon over which the APR gain is counted as profit
    pub profit_horizon_days: f64,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        let networks = [
            (Network::Ethereum, NetworkCost::new("ETH", 0.003)),
            (Network::Base, NetworkCost::new("ETH", 0.0001)),
            (Network::Optimism, NetworkCost::new("ETH", 0.0001)),
            (Network::Arbitrum, NetworkCost::new("ETH", 0.0001)),
            (Network::Polygon, NetworkCost::new("MATIC", 0.05)),
            (Network::Celo, NetworkCost::new("CELO", 0.001)),
            (Network::Avalanche, NetworkCost::new("AVAX", 0.01)),
            (Network::WorldChain, NetworkCost::new("ETH", 0.0001)),
        ]
        .into_iter()
        .collect();

        Self {
            networks,
            bridge_fee_eth: 0.002,
            fallback_native_price: 2_500.0,
            max_break_even_days: 30.0,
            profit_horizon_days: 365.0,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Directory for the JSONL store; in-memory when unset
    pub path: Option<String>,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent_id: String,
    /// Networks to monitor, in collection order
    pub networks: Vec<Network>,
    /// Pause between the end of one cycle and the start of the next (milliseconds)
    pub check_interval_ms: u64,
    /// Bound on every collaborator call (milliseconds)
    pub collaborator_timeout_ms: u64,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub authorization: Option<AuthorizationConfig>,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub costs: CostModelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Capital per network before the first rebalance
    #[serde(default)]
    pub initial_allocation: BTreeMap<Network, f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: "agent-1".to_string(),
            networks: vec![
                Network::Base,
                Network::Polygon,
                Network::Celo,
                Network::Arbitrum,
                Network::Optimism,
            ],
            check_interval_ms: 60_000, // 1 minute
            collaborator_timeout_ms: 10_000,
            strategy: StrategyConfig::default(),
            authorization: None,
            custody: CustodyConfig::default(),
            oracle: OracleConfig::default(),
            costs: CostModelConfig::default(),
            store: StoreConfig::default(),
            initial_allocation: BTreeMap::from([(Network::Base, 1_000.0)]),
        }
    }
}

impl Config {
    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(agent_id) = std::env::var(AGENT_ID_ENV) {
            self.agent_id = agent_id;
        }
        if let Ok(url) = std::env::var(HERMES_URL_ENV) {
            self.oracle.hermes_url = url;
        }
        if let Ok(url) = std::env::var(YIELD_API_URL_ENV) {
            self.oracle.yield_api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::Config("agent_id must not be empty".to_string()));
        }
        if self.networks.is_empty() {
            return Err(Error::Config("at least one network is required".to_string()));
        }
        if self.check_interval_ms == 0 || self.collaborator_timeout_ms == 0 {
            return Err(Error::Config(
                "check_interval_ms and collaborator_timeout_ms must be positive".to_string(),
            ));
        }
        if self.strategy.min_apr_delta < 0.0 || self.strategy.max_rebalance_amount <= 0.0 {
            return Err(Error::Config(
                "min_apr_delta must be >= 0 and max_rebalance_amount > 0".to_string(),
            ));
        }
        let cooldown_in_range = i64::try_from(self.strategy.cooldown_seconds)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .is_some();
        if !cooldown_in_range {
            return Err(Error::Config(format!(
                "cooldown_seconds out of range: {}",
                self.strategy.cooldown_seconds
            )));
        }
        if let Some((network, amount)) = self.initial_allocation.iter().find(|(_, a)| **a < 0.0) {
            return Err(Error::Config(format!(
                "initial allocation for {} is negative: {}",
                network, amount
            )));
        }
        if self.oracle.mode == OracleMode::Http {
            for url in [&self.oracle.hermes_url, &self.oracle.yield_api_url] {
                Url::parse(url).map_err(|e| Error::Config(format!("invalid url {}: {}", url, e)))?;
            }
        }
        Ok(())
    }
}
