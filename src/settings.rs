//! Node configuration, read with the `config` crate from a TOML file and
//! `XRW_` prefixed environment variables (`XRW_NETWORK__PORT=41413`).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::networking::codec::BLOCKNET_MAGIC;
use crate::networking::seed::{default_seed_addresses, DEFAULT_PORT};
use crate::Result;

pub const DEFAULT_CONFIG_PATH: &str = "config/xrouter.toml";
pub const PROTOCOL_VERSION: i32 = 70712;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub magic: u32,
    pub port: u16,
    pub seeds: Vec<String>,
    pub user_agent: String,
    pub protocol_version: i32,
    pub min_protocol_version: i32,
    pub allow_empty_chains: bool,
    pub connect_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub verify_reply_signatures: bool,
    pub require_config: bool,
    pub reconnect_interval_secs: u64,
    pub reconnect_cooldown_secs: u64,
    pub max_reconnects: u32,
    pub fail_reset_minutes: u64,
    pub queue_interval_ms: u64,
    pub queue_expiry_secs: u64,
    pub queue_wait_secs: u64,
    pub queue_poll_ms: u64,
    pub background_interval_secs: u64,
    pub utxo_refresh_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            magic: BLOCKNET_MAGIC,
            port: DEFAULT_PORT,
            seeds: default_seed_addresses(),
            user_agent: format!("/xrouter-wallet:{}/", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: PROTOCOL_VERSION,
            allow_empty_chains: false,
            connect_timeout_ms: 1000,
            request_timeout_secs: 15,
            verify_reply_signatures: true,
            require_config: true,
            reconnect_interval_secs: 60,
            reconnect_cooldown_secs: 120,
            max_reconnects: 30,
            fail_reset_minutes: 60,
            queue_interval_ms: 1000,
            queue_expiry_secs: 120,
            queue_wait_secs: 15,
            queue_poll_ms: 100,
            background_interval_secs: 10,
            utxo_refresh_ms: 500,
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }

    pub fn fail_reset(&self) -> Duration {
        Duration::from_secs(self.fail_reset_minutes * 60)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }

    pub fn queue_expiry(&self) -> Duration {
        Duration::from_secs(self.queue_expiry_secs)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_secs)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn utxo_refresh(&self) -> Duration {
        Duration::from_millis(self.utxo_refresh_ms)
    }
}

/// Keys for one currency, each a hex secret or a WIF string.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletSettings {
    pub ticker: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Overrides or additions to the built-in coin table.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinSettings {
    pub ticker: String,
    pub address_version: u8,
    pub p2sh_version: u8,
    pub wif_version: u8,
    #[serde(default)]
    pub acceptable_codes: Vec<u8>,
    pub min_output: u64,
    #[serde(default)]
    pub relay_fee: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub network: NetworkSettings,
    pub wallets: Vec<WalletSettings>,
    pub coins: Vec<CoinSettings>,
}

impl NodeSettings {
    /// Load `path` (optional on disk) and apply environment overrides.
    pub fn load(path: &str) -> Result<NodeSettings> {
        let mut settings = Config::default();
        settings.merge(File::with_name(path).required(false))?;
        settings.merge(Environment::with_prefix("XRW").separator("__"))?;
        Ok(settings.try_into::<NodeSettings>()?)
    }

    pub fn from_toml(text: &str) -> Result<NodeSettings> {
        let mut settings = Config::default();
        settings.merge(File::from_str(text, config::FileFormat::Toml))?;
        Ok(settings.try_into::<NodeSettings>()?)
    }
}
