pub mod mock_node;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::context::CoinParams;
use crate::keypair::Keypair;
use crate::ledger::Utxo;
use crate::wallet::Wallet;

/// One unspent output per value, each with its own txid.
pub fn make_mock_utxos(ticker: &str, address: &str, values: &[u64]) -> Vec<Utxo> {
    values
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let mut txid = [0u8; 32];
            txid[..8].copy_from_slice(&(idx as u64 + 1).to_be_bytes());
            Utxo::new(ticker, address, &hex::encode(txid), idx as u32 % 4, 100, *value)
        })
        .collect()
}

/// A single-address Blocknet wallet holding `values`.
pub async fn make_funded_wallet(values: &[u64]) -> (Wallet, String) {
    let wallet = Wallet::new(CoinParams::blocknet(), vec![Arc::new(Keypair::new())]);
    let address = wallet.addresses().await[0].clone();
    wallet
        .replace_utxos(&address, make_mock_utxos("BLOCK", &address, values))
        .await
        .unwrap();
    (wallet, address)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}
