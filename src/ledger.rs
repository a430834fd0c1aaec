//! Per-address UTXO bookkeeping for one currency.
//!
//! Balances are cached per address and recomputed after every mutation, so
//! `balance` is always the sum of the unspent values.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{to_coins, to_minor_units};
use crate::keypair::Keypair;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub ticker: String,
    pub address: String,
    pub txid: String,
    pub vout: u32,
    pub block_number: u64,
    /// Minor units.
    pub value: u64,
    #[serde(default)]
    pub spent: bool,
}

impl Utxo {
    pub fn new(ticker: &str, address: &str, txid: &str, vout: u32, block_number: u64, value: u64) -> Utxo {
        Utxo {
            ticker: ticker.to_string(),
            address: address.to_string(),
            txid: txid.to_string(),
            vout,
            block_number,
            value,
            spent: false,
        }
    }

    pub fn same_outpoint(&self, txid: &str, vout: u32) -> bool {
        self.vout == vout && self.txid.eq_ignore_ascii_case(txid)
    }

    pub fn amount(&self) -> f64 {
        to_coins(self.value)
    }
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} {})", self.txid, self.vout, self.amount(), self.ticker)
    }
}

#[derive(Deserialize)]
struct UtxoEntry {
    address: String,
    txhash: String,
    vout: u32,
    #[serde(default)]
    block_number: u64,
    value: f64,
}

#[derive(Deserialize)]
struct UtxoReply {
    #[serde(default)]
    utxos: Vec<UtxoEntry>,
    #[serde(default)]
    error: Option<Value>,
}

/// Parse an `xrmgetutxos` reply. Values arrive as decimal coin amounts.
pub fn parse_utxo_reply(ticker: &str, reply: &str) -> Result<Vec<Utxo>> {
    let parsed: UtxoReply = serde_json::from_str(reply)?;
    if let Some(error) = parsed.error {
        return Err(Error::Remote(error.to_string()));
    }
    Ok(parsed
        .utxos
        .into_iter()
        .map(|entry| {
            Utxo::new(
                ticker,
                &entry.address,
                &entry.txhash,
                entry.vout,
                entry.block_number,
                to_minor_units(entry.value),
            )
        })
        .collect())
}

/// One wallet address, its key, and the outputs paying to it.
#[derive(Debug, Clone)]
pub struct AddressBalance {
    address: String,
    keypair: Arc<Keypair>,
    utxos: Vec<Utxo>,
    balance: u64,
}

impl AddressBalance {
    pub fn new(address: String, keypair: Arc<Keypair>) -> AddressBalance {
        AddressBalance {
            address,
            keypair,
            utxos: vec![],
            balance: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn unspent(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.iter().filter(|utxo| !utxo.spent)
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    fn recalculate(&mut self) {
        self.balance = self.unspent().map(|utxo| utxo.value).sum();
    }

    /// Apply a fresh snapshot. Unspent entries the snapshot no longer lists
    /// are dropped; locally spent entries are kept even when listed again.
    /// Returns how many outpoints were new.
    pub fn replace_utxos(&mut self, incoming: Vec<Utxo>) -> usize {
        self.utxos.retain(|utxo| utxo.spent);
        let mut added = 0;
        for utxo in incoming {
            if self
                .utxos
                .iter()
                .any(|known| known.same_outpoint(&utxo.txid, utxo.vout))
            {
                continue;
            }
            self.utxos.push(Utxo {
                spent: false,
                ..utxo
            });
            added += 1;
        }
        self.recalculate();
        added
    }

    pub fn set_spent(&mut self, txid: &str, vout: u32, spent: bool) -> bool {
        let found = match self
            .utxos
            .iter_mut()
            .find(|utxo| utxo.same_outpoint(txid, vout))
        {
            Some(utxo) => {
                utxo.spent = spent;
                true
            }
            None => false,
        };
        self.recalculate();
        found
    }
}

/// All addresses of one currency. The first address receives change.
#[derive(Debug, Clone)]
pub struct UtxoLedger {
    ticker: String,
    addresses: Vec<AddressBalance>,
}

impl UtxoLedger {
    pub fn new(ticker: &str) -> UtxoLedger {
        UtxoLedger {
            ticker: ticker.to_uppercase(),
            addresses: vec![],
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    /// Track `keypair` under its address for `version`. Adding a tracked
    /// address again is a no-op.
    pub fn add_address(&mut self, keypair: Arc<Keypair>, version: u8) -> String {
        let address = keypair.address(version);
        if self.address(&address).is_none() {
            debug!("tracking {} address {}", self.ticker, address);
            self.addresses
                .push(AddressBalance::new(address.clone(), keypair));
        }
        address
    }

    pub fn addresses(&self) -> &[AddressBalance] {
        &self.addresses
    }

    pub fn address_strings(&self) -> Vec<String> {
        self.addresses
            .iter()
            .map(|entry| entry.address.clone())
            .collect()
    }

    pub fn address(&self, address: &str) -> Option<&AddressBalance> {
        self.addresses.iter().find(|entry| entry.address == address)
    }

    fn address_mut(&mut self, address: &str) -> Option<&mut AddressBalance> {
        self.addresses
            .iter_mut()
            .find(|entry| entry.address == address)
    }

    pub fn change_address(&self) -> Option<&str> {
        self.addresses.first().map(|entry| entry.address.as_str())
    }

    pub fn replace_utxos(&mut self, address: &str, incoming: Vec<Utxo>) -> Result<usize> {
        let entry = self
            .address_mut(address)
            .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
        Ok(entry.replace_utxos(incoming))
    }

    /// Apply a reply that may cover several addresses. Only the addresses
    /// it mentions are replaced; untracked addresses are skipped.
    pub fn process_utxos(&mut self, utxos: Vec<Utxo>) -> usize {
        let mut grouped: Vec<(String, Vec<Utxo>)> = vec![];
        for utxo in utxos {
            match grouped.iter_mut().find(|(address, _)| *address == utxo.address) {
                Some((_, list)) => list.push(utxo),
                None => grouped.push((utxo.address.clone(), vec![utxo])),
            }
        }

        let mut added = 0;
        for (address, list) in grouped {
            match self.replace_utxos(&address, list) {
                Ok(count) => added += count,
                Err(_) => warn!("{} reply lists untracked address {}", self.ticker, address),
            }
        }
        added
    }

    /// Mark an outpoint spent. Marking twice changes nothing.
    pub fn mark_spent(&mut self, txid: &str, vout: u32) -> bool {
        self.set_spent(txid, vout, true)
    }

    pub fn set_spent(&mut self, txid: &str, vout: u32, spent: bool) -> bool {
        self.addresses
            .iter_mut()
            .any(|entry| entry.set_spent(txid, vout, spent))
    }

    pub fn balance(&self, address: &str) -> Option<u64> {
        self.address(address).map(|entry| entry.balance)
    }

    pub fn total_balance(&self) -> u64 {
        self.addresses.iter().map(|entry| entry.balance).sum()
    }

    /// Every tracked output, spent or not.
    pub fn snapshot(&self) -> Vec<Utxo> {
        self.addresses
            .iter()
            .flat_map(|entry| entry.utxos.iter().cloned())
            .collect()
    }

    pub fn unspent(&self) -> Vec<Utxo> {
        self.addresses
            .iter()
            .flat_map(|entry| entry.unspent().cloned())
            .collect()
    }

    pub fn keypair_for(&self, address: &str) -> Option<&Arc<Keypair>> {
        self.address(address).map(|entry| &entry.keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_address() -> (UtxoLedger, String) {
        let mut ledger = UtxoLedger::new("block");
        let address = ledger.add_address(Arc::new(Keypair::new()), 26);
        (ledger, address)
    }

    fn utxo(address: &str, txid: &str, vout: u32, value: u64) -> Utxo {
        Utxo::new("BLOCK", address, txid, vout, 10, value)
    }

    #[test]
    fn replace_keeps_spent_entries_test() {
        let (mut ledger, address) = ledger_with_address();
        ledger
            .replace_utxos(
                &address,
                vec![utxo(&address, "aa", 0, 100), utxo(&address, "bb", 1, 200)],
            )
            .unwrap();
        assert_eq!(ledger.balance(&address), Some(300));

        assert!(ledger.mark_spent("aa", 0));
        assert_eq!(ledger.balance(&address), Some(200));

        // the remote source has not seen the spend yet and still lists aa:0,
        // while bb:1 has disappeared and cc:0 is new
        let added = ledger
            .replace_utxos(
                &address,
                vec![utxo(&address, "aa", 0, 100), utxo(&address, "cc", 0, 50)],
            )
            .unwrap();
        assert_eq!(added, 1);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|u| u.same_outpoint("aa", 0) && u.spent));
        assert!(snapshot.iter().all(|u| !u.same_outpoint("bb", 1)));
        assert_eq!(ledger.balance(&address), Some(50));
    }

    #[test]
    fn mark_spent_is_idempotent_test() {
        let (mut ledger, address) = ledger_with_address();
        ledger
            .replace_utxos(
                &address,
                vec![utxo(&address, "aa", 0, 100), utxo(&address, "bb", 0, 5)],
            )
            .unwrap();

        ledger.mark_spent("aa", 0);
        let once = ledger.snapshot();
        let once_balance = ledger.total_balance();
        ledger.mark_spent("aa", 0);
        assert_eq!(ledger.snapshot(), once);
        assert_eq!(ledger.total_balance(), once_balance);
        assert_eq!(once_balance, 5);

        assert!(!ledger.mark_spent("zz", 9));
        assert!(ledger.set_spent("AA", 0, false));
        assert_eq!(ledger.total_balance(), 105);
    }

    #[test]
    fn unknown_address_test() {
        let (mut ledger, _) = ledger_with_address();
        assert!(matches!(
            ledger.replace_utxos("nobody", vec![]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn process_utxo_reply_test() {
        let (mut ledger, address) = ledger_with_address();
        let reply = format!(
            r#"{{"utxos":[
                {{"address":"{0}","txhash":"aa","vout":0,"block_number":12,"value":1.5}},
                {{"address":"{0}","txhash":"bb","vout":2,"block_number":13,"value":0.00000001}},
                {{"address":"stranger","txhash":"cc","vout":0,"block_number":13,"value":3.0}}
            ]}}"#,
            address
        );
        let utxos = parse_utxo_reply("BLOCK", &reply).unwrap();
        assert_eq!(utxos[0].value, 150_000_000);
        assert_eq!(utxos[1].value, 1);

        assert_eq!(ledger.process_utxos(utxos), 2);
        assert_eq!(ledger.total_balance(), 150_000_001);
        assert_eq!(ledger.unspent().len(), 2);
    }

    #[test]
    fn error_reply_test() {
        assert!(matches!(
            parse_utxo_reply("BLOCK", r#"{"error":"no such plugin"}"#),
            Err(Error::Remote(_))
        ));
    }

    #[test]
    fn change_address_is_first_test() {
        let mut ledger = UtxoLedger::new("LTC");
        let first = ledger.add_address(Arc::new(Keypair::new()), 48);
        ledger.add_address(Arc::new(Keypair::new()), 48);
        let again = ledger.add_address(ledger.addresses()[0].keypair().clone(), 48);
        assert_eq!(again, first);
        assert_eq!(ledger.addresses().len(), 2);
        assert_eq!(ledger.change_address(), Some(first.as_str()));
    }
}
