use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{event, warn, Level};

use crate::context::{to_coins, CoinParams};
use crate::crypto::base58check_decode;
use crate::keypair::Keypair;
use crate::ledger::{Utxo, UtxoLedger};
use crate::settings::WalletSettings;
use crate::transaction::{p2pkh_script, script_for_address, OutPoint, Transaction, TxOut};
use crate::{Error, Result};

/// How leftover value is returned to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePolicy {
    /// One change output.
    Single,
    /// Three equal outputs when change exceeds the threshold, otherwise one.
    SplitAbove(u64),
}

impl ChangePolicy {
    fn amounts(&self, change: u64) -> Vec<u64> {
        match *self {
            ChangePolicy::SplitAbove(threshold) if change > threshold => vec![change / 3; 3],
            _ => vec![change],
        }
    }
}

/// Order unspent outputs for selection: ascending by value, split at the
/// midpoint, then alternate between the low and high halves.
pub fn selection_order(mut utxos: Vec<Utxo>) -> Vec<Utxo> {
    utxos.sort_by_key(|utxo| utxo.value);
    let split = (utxos.len() + 1) / 2;
    let high = utxos.split_off(split);

    let mut ordered = Vec::with_capacity(utxos.len() + high.len());
    let mut low = utxos.into_iter();
    let mut high = high.into_iter();
    loop {
        match (low.next(), high.next()) {
            (None, None) => break,
            (a, b) => ordered.extend(a.into_iter().chain(b)),
        }
    }
    ordered
}

/// Pick outputs in `selection_order` until their sum reaches `target`.
/// Returns `None` when the unspent outputs cannot cover it.
pub fn select_utxos(unspent: Vec<Utxo>, target: u64) -> Option<Vec<Utxo>> {
    let mut total = 0u64;
    let mut selected = vec![];
    for utxo in selection_order(unspent.into_iter().filter(|u| !u.spent).collect()) {
        if total >= target && !selected.is_empty() {
            break;
        }
        total += utxo.value;
        selected.push(utxo);
    }
    if selected.is_empty() || total < target {
        return None;
    }
    Some(selected)
}

/// The keys and outputs of one currency. Coin selection and transaction
/// building are serialized per wallet so concurrent builders never pick the
/// same output.
#[derive(Debug)]
pub struct Wallet {
    coin: CoinParams,
    ledger: RwLock<UtxoLedger>,
    building: Mutex<()>,
}

impl Wallet {
    pub fn new(coin: CoinParams, keys: Vec<Arc<Keypair>>) -> Wallet {
        let mut ledger = UtxoLedger::new(&coin.ticker);
        for keypair in keys {
            ledger.add_address(keypair, coin.address_version);
        }
        Wallet {
            coin,
            ledger: RwLock::new(ledger),
            building: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &WalletSettings, coin: CoinParams) -> Result<Wallet> {
        let keys = settings
            .keys
            .iter()
            .map(|key| Keypair::from_secret_str(key, coin.wif_version).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            warn!("wallet {} has no keys", coin.ticker);
        }
        Ok(Wallet::new(coin, keys))
    }

    pub fn ticker(&self) -> &str {
        &self.coin.ticker
    }

    pub fn coin(&self) -> &CoinParams {
        &self.coin
    }

    pub async fn ledger(&self) -> RwLockReadGuard<'_, UtxoLedger> {
        self.ledger.read().await
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.ledger.read().await.address_strings()
    }

    pub async fn add_key(&self, keypair: Arc<Keypair>) -> String {
        self.ledger
            .write()
            .await
            .add_address(keypair, self.coin.address_version)
    }

    pub async fn snapshot(&self) -> Vec<Utxo> {
        self.ledger.read().await.snapshot()
    }

    pub async fn balance(&self) -> u64 {
        self.ledger.read().await.total_balance()
    }

    pub async fn replace_utxos(&self, address: &str, incoming: Vec<Utxo>) -> Result<usize> {
        self.ledger.write().await.replace_utxos(address, incoming)
    }

    pub async fn process_utxos(&self, utxos: Vec<Utxo>) -> usize {
        self.ledger.write().await.process_utxos(utxos)
    }

    pub async fn mark_spent(&self, txid: &str, vout: u32) -> bool {
        self.ledger.write().await.mark_spent(txid, vout)
    }

    pub async fn select(&self, target: u64) -> Option<Vec<Utxo>> {
        select_utxos(self.ledger.read().await.unspent(), target)
    }

    /// Flip the spent flag of every ledger output `transaction` spends.
    pub async fn set_spent(&self, transaction: &Transaction, spent: bool) -> usize {
        let mut ledger = self.ledger.write().await;
        transaction
            .outpoints()
            .filter(|outpoint| ledger.set_spent(&outpoint.txid, outpoint.vout, spent))
            .count()
    }

    pub fn is_p2sh(&self, address: &str) -> bool {
        match base58check_decode(address) {
            Ok((version, _)) => self.coin.is_p2sh_version(version),
            Err(_) => false,
        }
    }

    /// Spend `amount` to `destination`, paying `relay_fee` to the network.
    pub async fn create_transaction_simple(
        &self,
        destination: &str,
        amount: u64,
        relay_fee: u64,
    ) -> Result<Transaction> {
        self.build_and_sign(&[(destination.to_string(), amount)], amount + relay_fee)
            .await
    }

    pub async fn build_and_sign(&self, outputs: &[(String, u64)], funding: u64) -> Result<Transaction> {
        self.build(outputs, funding, ChangePolicy::Single).await
    }

    /// Select outputs worth at least `funding`, pay `outputs` (script-hash
    /// destinations first) and return the rest to the first address. Selected
    /// outputs are marked spent as they are added.
    pub async fn build(
        &self,
        outputs: &[(String, u64)],
        funding: u64,
        change: ChangePolicy,
    ) -> Result<Transaction> {
        let requested: u64 = outputs.iter().map(|(_, value)| value).sum();
        if requested > funding {
            return Err(Error::Malformed(format!(
                "outputs {} exceed funding {}",
                requested, funding
            )));
        }

        let mut p2sh_outputs = vec![];
        let mut standard_outputs = vec![];
        for (address, value) in outputs {
            let (script, p2sh) = script_for_address(address, &self.coin)?;
            if p2sh {
                p2sh_outputs.push(TxOut::new(*value, script));
            } else {
                standard_outputs.push(TxOut::new(*value, script));
            }
        }

        let _building = self.building.lock().await;
        let mut ledger = self.ledger.write().await;

        let change_address = ledger
            .change_address()
            .ok_or(Error::NoSpendableUtxos)?
            .to_string();
        let unspent = ledger.unspent();
        if unspent.is_empty() {
            return Err(Error::NoSpendableUtxos);
        }
        let selected = select_utxos(unspent, funding).ok_or(Error::InsufficientFunds {
            requested: funding,
            available: ledger.total_balance(),
        })?;
        let available: u64 = selected.iter().map(|utxo| utxo.value).sum();

        let mut transaction = Transaction::new();
        for output in p2sh_outputs.into_iter().chain(standard_outputs) {
            transaction.add_output(output);
        }
        let leftover = available - funding;
        if leftover > 0 {
            let (script, _) = script_for_address(&change_address, &self.coin)?;
            for value in change.amounts(leftover) {
                transaction.add_output(TxOut::new(value, script.clone()));
            }
        }

        let mut signers = vec![];
        for utxo in &selected {
            let keypair = match ledger.keypair_for(&utxo.address) {
                Some(keypair) => keypair.clone(),
                None => {
                    rollback(&mut ledger, &transaction);
                    return Err(Error::InvalidAddress(utxo.address.clone()));
                }
            };
            transaction.add_input(
                OutPoint::new(&utxo.txid, utxo.vout),
                p2pkh_script(&keypair.pubkey_hash()),
            );
            ledger.mark_spent(&utxo.txid, utxo.vout);
            signers.push(keypair);
        }

        for (index, keypair) in signers.iter().enumerate() {
            if let Err(error) = transaction.sign_input(index, keypair) {
                rollback(&mut ledger, &transaction);
                return Err(error);
            }
        }

        event!(
            Level::INFO,
            "built {} transaction: {} inputs, {} outputs, {} change",
            self.coin.ticker,
            transaction.inputs.len(),
            transaction.outputs.len(),
            to_coins(leftover)
        );
        Ok(transaction)
    }
}

fn rollback(ledger: &mut UtxoLedger, transaction: &Transaction) {
    for outpoint in transaction.outpoints() {
        ledger.set_spent(&outpoint.txid, outpoint.vout, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::base58check_encode;

    fn wallet_with(values: &[u64]) -> (Wallet, String) {
        let wallet = Wallet::new(CoinParams::blocknet(), vec![Arc::new(Keypair::new())]);
        let address = wallet.ledger.try_read().unwrap().address_strings()[0].clone();
        let utxos = values
            .iter()
            .enumerate()
            .map(|(i, value)| Utxo::new("BLOCK", &address, &hex::encode([i as u8 + 1; 32]), 0, 5, *value))
            .collect();
        wallet
            .ledger
            .try_write()
            .unwrap()
            .replace_utxos(&address, utxos)
            .unwrap();
        (wallet, address)
    }

    fn values(utxos: &[Utxo]) -> Vec<u64> {
        utxos.iter().map(|utxo| utxo.value).collect()
    }

    #[test]
    fn selection_order_interleaves_test() {
        let utxos: Vec<Utxo> = [5, 1, 4, 2, 3]
            .iter()
            .map(|v| Utxo::new("BLOCK", "a", "aa", *v as u32, 0, *v))
            .collect();
        assert_eq!(values(&selection_order(utxos)), vec![1, 4, 2, 5, 3]);
        assert!(selection_order(vec![]).is_empty());
    }

    #[test]
    fn selection_sufficiency_test() {
        let (wallet, _) = wallet_with(&[10, 20, 30, 40, 50]);
        let unspent = wallet.ledger.try_read().unwrap().unspent();
        let total: u64 = 150;
        for target in [1, 10, 11, 45, 99, 149, 150] {
            let selected = select_utxos(unspent.clone(), target).unwrap();
            assert!(values(&selected).iter().sum::<u64>() >= target);
        }
        assert!(select_utxos(unspent.clone(), total + 1).is_none());
        assert!(select_utxos(vec![], 1).is_none());
        // 10, 40, 20 covers 60
        assert_eq!(values(&select_utxos(unspent, 60).unwrap()), vec![10, 40, 20]);
    }

    #[tokio::test]
    async fn p2sh_outputs_come_first_test() {
        let (wallet, _) = wallet_with(&[100_000, 200_000]);
        let standard = Keypair::new().address(26);
        let script_hash = base58check_encode(28, &[9u8; 20]);
        assert!(wallet.is_p2sh(&script_hash));
        assert!(!wallet.is_p2sh(&standard));

        let tx = wallet
            .build_and_sign(
                &[(standard, 1_000), (script_hash, 2_000)],
                13_000,
            )
            .await
            .unwrap();
        assert_eq!(tx.outputs[0].value, 2_000);
        assert_eq!(tx.outputs[0].script_pubkey.len(), 23);
        assert_eq!(tx.outputs[1].value, 1_000);
        assert_eq!(tx.outputs[1].script_pubkey.len(), 25);
        // change to the first address
        assert_eq!(tx.outputs[2].value, 100_000 - 13_000);
        assert!(tx.is_signed());
    }

    #[tokio::test]
    async fn build_marks_inputs_spent_test() {
        let (wallet, address) = wallet_with(&[50_000, 60_000]);
        let destination = Keypair::new().address(26);

        let first = wallet
            .create_transaction_simple(&destination, 40_000, 10_000)
            .await
            .unwrap();
        assert_eq!(first.inputs.len(), 1);
        // exact spend, no change output
        assert_eq!(first.outputs.len(), 1);
        assert_eq!(wallet.balance().await, 60_000);

        let second = wallet
            .create_transaction_simple(&destination, 40_000, 10_000)
            .await
            .unwrap();
        assert_ne!(first.inputs[0].previous_output, second.inputs[0].previous_output);
        assert_eq!(wallet.balance().await, 0);

        match wallet.create_transaction_simple(&address, 1, 0).await {
            Err(Error::NoSpendableUtxos) => {}
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(wallet.set_spent(&second, false).await, 1);
        assert_eq!(wallet.balance().await, 60_000);
    }

    #[tokio::test]
    async fn insufficient_funds_test() {
        let (wallet, _) = wallet_with(&[1_000]);
        let destination = Keypair::new().address(26);
        match wallet.create_transaction_simple(&destination, 5_000, 10).await {
            Err(Error::InsufficientFunds { requested, available }) => {
                assert_eq!(requested, 5_010);
                assert_eq!(available, 1_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(wallet.balance().await, 1_000);
    }

    #[tokio::test]
    async fn concurrent_builds_do_not_share_inputs_test() {
        let (wallet, _) = wallet_with(&[30_000, 30_000, 30_000, 30_000]);
        let wallet = Arc::new(wallet);
        let destination = Keypair::new().address(26);

        let a = tokio::spawn({
            let wallet = wallet.clone();
            let destination = destination.clone();
            async move { wallet.create_transaction_simple(&destination, 25_000, 1_000).await }
        });
        let b = tokio::spawn({
            let wallet = wallet.clone();
            async move { wallet.create_transaction_simple(&destination, 25_000, 1_000).await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        for input in &a.inputs {
            assert!(!b.outpoints().any(|outpoint| *outpoint == input.previous_output));
        }
    }

    #[test]
    fn change_split_test() {
        assert_eq!(ChangePolicy::SplitAbove(6_000_000).amounts(9_000_001), vec![3_000_000; 3]);
        assert_eq!(ChangePolicy::SplitAbove(6_000_000).amounts(6_000_000), vec![6_000_000]);
        assert_eq!(ChangePolicy::Single.amounts(9_000_001), vec![9_000_001]);
    }
}
