//! Per-currency parameters and the shared block-height and relay-fee tables.
//!
//! One `Context` is built at start-up and handed to the peer group, the
//! wallets, and the reply handlers. Tests build their own.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::settings::CoinSettings;
use crate::{Error, Result};

pub const COIN: u64 = 100_000_000;
pub const DEFAULT_RELAY_FEE: u64 = 10_000;

/// Convert a decimal coin amount to minor units, rounding down.
pub fn to_minor_units(amount: f64) -> u64 {
    if amount <= 0.0 {
        return 0;
    }
    (amount * COIN as f64).floor() as u64
}

pub fn to_coins(amount: u64) -> f64 {
    amount as f64 / COIN as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoinParams {
    pub ticker: String,
    pub address_version: u8,
    pub p2sh_version: u8,
    pub wif_version: u8,
    /// Every address version byte the network accepts.
    pub acceptable_codes: Vec<u8>,
    /// Smallest output the network relays.
    pub min_output: u64,
    pub protocol_version: i32,
}

impl CoinParams {
    pub fn new(ticker: &str, address_version: u8, p2sh_version: u8, wif_version: u8, min_output: u64) -> Self {
        CoinParams {
            ticker: ticker.to_string(),
            address_version,
            p2sh_version,
            wif_version,
            acceptable_codes: vec![address_version, p2sh_version],
            min_output,
            protocol_version: crate::settings::PROTOCOL_VERSION,
        }
    }

    pub fn blocknet() -> Self {
        CoinParams::new("BLOCK", 26, 28, 154, 5_500)
    }

    pub fn litecoin() -> Self {
        CoinParams::new("LTC", 48, 50, 176, 100_000)
    }

    pub fn bitcoin() -> Self {
        CoinParams::new("BTC", 0, 5, 128, 546)
    }

    /// Whether an address with `version` pays to a script hash.
    pub fn is_p2sh_version(&self, version: u8) -> bool {
        if version == self.p2sh_version {
            return true;
        }
        self.acceptable_codes.len() > 2
            && self.acceptable_codes.contains(&version)
            && version != self.address_version
    }
}

#[derive(Debug)]
pub struct Context {
    coins: HashMap<String, CoinParams>,
    block_heights: RwLock<HashMap<String, u64>>,
    relay_fees: RwLock<HashMap<String, u64>>,
}

impl Context {
    pub fn new(coins: Vec<CoinParams>) -> Self {
        Context {
            coins: coins
                .into_iter()
                .map(|coin| (coin.ticker.clone(), coin))
                .collect(),
            block_heights: RwLock::new(HashMap::new()),
            relay_fees: RwLock::new(HashMap::new()),
        }
    }

    /// The built-in coin table with `overrides` applied on top.
    pub async fn with_overrides(overrides: &[CoinSettings]) -> Self {
        let mut coins = vec![CoinParams::blocknet(), CoinParams::litecoin(), CoinParams::bitcoin()];
        let mut relay_fees = vec![];
        for coin in overrides {
            let ticker = coin.ticker.to_uppercase();
            let mut params = CoinParams::new(
                &ticker,
                coin.address_version,
                coin.p2sh_version,
                coin.wif_version,
                coin.min_output,
            );
            if !coin.acceptable_codes.is_empty() {
                params.acceptable_codes = coin.acceptable_codes.clone();
            }
            debug!("coin parameters for {} from configuration", ticker);
            coins.retain(|existing| existing.ticker != ticker);
            coins.push(params);
            if let Some(fee) = coin.relay_fee {
                relay_fees.push((ticker, to_minor_units(fee)));
            }
        }

        let context = Context::new(coins);
        for (ticker, fee) in relay_fees {
            context.set_relay_fee(&ticker, fee).await;
        }
        context
    }

    pub fn coin(&self, ticker: &str) -> Result<&CoinParams> {
        self.coins
            .get(&ticker.to_uppercase())
            .ok_or_else(|| Error::UnknownCurrency(ticker.to_string()))
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.coins.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    pub async fn block_height(&self, ticker: &str) -> u64 {
        self.block_heights
            .read()
            .await
            .get(&ticker.to_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// Record a reported height. Heights only move forward.
    pub async fn update_block_height(&self, ticker: &str, height: u64) -> bool {
        let mut heights = self.block_heights.write().await;
        let current = heights.entry(ticker.to_uppercase()).or_insert(0);
        if height < *current {
            return false;
        }
        if height > *current {
            info!("{} block height {}", ticker, height);
        }
        *current = height;
        true
    }

    pub async fn relay_fee(&self, ticker: &str) -> u64 {
        self.relay_fees
            .read()
            .await
            .get(&ticker.to_uppercase())
            .copied()
            .unwrap_or(DEFAULT_RELAY_FEE)
    }

    pub async fn set_relay_fee(&self, ticker: &str, fee: u64) {
        self.relay_fees.write().await.insert(ticker.to_uppercase(), fee);
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(vec![CoinParams::blocknet(), CoinParams::litecoin(), CoinParams::bitcoin()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_test() {
        assert_eq!(to_minor_units(1.0), COIN);
        assert_eq!(to_minor_units(0.000000019), 1);
        assert_eq!(to_minor_units(-1.0), 0);
        assert_eq!(to_coins(150_000_000), 1.5);
    }

    #[test]
    fn p2sh_detection_test() {
        let block = CoinParams::blocknet();
        assert!(block.is_p2sh_version(28));
        assert!(!block.is_p2sh_version(26));

        let mut wide = CoinParams::litecoin();
        wide.acceptable_codes = vec![48, 50, 5];
        assert!(wide.is_p2sh_version(5));
        assert!(!wide.is_p2sh_version(48));
        assert!(!wide.is_p2sh_version(99));
    }

    #[tokio::test]
    async fn block_heights_are_monotonic_test() {
        let context = Context::default();
        assert!(context.update_block_height("block", 100).await);
        assert!(!context.update_block_height("BLOCK", 90).await);
        assert_eq!(context.block_height("BLOCK").await, 100);
        assert!(context.update_block_height("BLOCK", 101).await);
        assert_eq!(context.block_height("block").await, 101);
    }

    #[tokio::test]
    async fn overrides_test() {
        let context = Context::with_overrides(&[CoinSettings {
            ticker: "doge".into(),
            address_version: 30,
            p2sh_version: 22,
            wif_version: 158,
            acceptable_codes: vec![],
            min_output: COIN,
            relay_fee: Some(1.0),
        }])
        .await;
        assert_eq!(context.coin("DOGE").unwrap().address_version, 30);
        assert_eq!(context.relay_fee("DOGE").await, COIN);
        assert_eq!(context.relay_fee("BLOCK").await, DEFAULT_RELAY_FEE);
        assert!(matches!(context.coin("XYZ"), Err(Error::UnknownCurrency(_))));
        assert_eq!(context.tickers(), vec!["BLOCK", "BTC", "DOGE", "LTC"]);
    }
}
