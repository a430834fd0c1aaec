//! The wallet side of the node: turns peer-group traffic into ledger and
//! block-height updates, and exposes the calls the RPC front end needs.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, event, info, warn, Level};

use crate::context::{to_coins, to_minor_units, Context};
use crate::fee::{command_fee, covered_send_fee, fee_transaction, plugin_fee_transaction};
use crate::ledger::{parse_utxo_reply, Utxo};
use crate::networking::connection::PeerConnection;
use crate::networking::peer_group::{GroupEvent, PeerGroup};
use crate::networking::queue::MessageSource;
use crate::networking::xrouter::{
    PluginParam, XRouterBody, XRouterCommand, XRouterMessage, FREE_PAYMENT,
};
use crate::networking::xrouter_config::{PluginConfiguration, XRouterConfiguration, REQUIRED_PLUGIN};
use crate::transaction::Transaction;
use crate::wallet::Wallet;
use crate::{Error, Result};

/// Fees are paid in this currency.
pub const FEE_TICKER: &str = "BLOCK";

struct Broadcast {
    ticker: String,
    transaction: Transaction,
    sent: Instant,
}

pub struct WalletService {
    context: Arc<Context>,
    group: Arc<PeerGroup>,
    wallets: HashMap<String, Arc<Wallet>>,
    last_utxo_request: Mutex<HashMap<String, Instant>>,
    /// Transactions handed to `xrSendTransaction`, by request UUID.
    broadcasts: Mutex<HashMap<String, Broadcast>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WalletService {
    pub fn new(context: Arc<Context>, group: Arc<PeerGroup>, wallets: Vec<Wallet>) -> Arc<WalletService> {
        Arc::new(WalletService {
            context,
            group,
            wallets: wallets
                .into_iter()
                .map(|wallet| (wallet.ticker().to_uppercase(), Arc::new(wallet)))
                .collect(),
            last_utxo_request: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(HashMap::new()),
            tasks: Mutex::new(vec![]),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn group(&self) -> &Arc<PeerGroup> {
        &self.group
    }

    pub fn wallet(&self, ticker: &str) -> Result<&Arc<Wallet>> {
        self.wallets
            .get(&ticker.to_uppercase())
            .ok_or_else(|| Error::UnknownCurrency(ticker.to_string()))
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.wallets.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    /// Listen to the peer group and start the keep-alive job.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let mut events = self.group.subscribe();
        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => service.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => warn!("missed {} peer group events", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let service = self.clone();
        tasks.push(tokio::spawn(async move { service.run_background().await }));
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub async fn best_peer(&self, ticker: &str) -> Option<Arc<PeerConnection>> {
        self.group.best_peer(ticker).await
    }

    pub async fn ledger_snapshot(&self, ticker: &str) -> Result<Vec<Utxo>> {
        Ok(self.wallet(ticker)?.snapshot().await)
    }

    /// Spendable balance in coins.
    pub async fn balance(&self, ticker: &str) -> Result<f64> {
        Ok(to_coins(self.wallet(ticker)?.balance().await))
    }

    /// Build and sign a payment of `amount` coins. The inputs are marked
    /// spent immediately.
    pub async fn build_transaction(&self, ticker: &str, destination: &str, amount: f64) -> Result<Transaction> {
        let wallet = self.wallet(ticker)?;
        let relay_fee = self.context.relay_fee(ticker).await;
        wallet
            .create_transaction_simple(destination, to_minor_units(amount), relay_fee)
            .await
    }

    /// Send `command` to `peer`. For currency commands `params` starts with
    /// the ticker; for `xrService` it starts with the plugin name. Returns the
    /// request UUID without waiting for the reply.
    pub async fn send_request(
        &self,
        peer: &Arc<PeerConnection>,
        command: XRouterCommand,
        params: &[String],
    ) -> Result<String> {
        self.dispatch(peer, command, params, MessageSource::Rpc, None)
            .await
    }

    /// Send `command` and wait for the reply, bounded by the request timeout.
    pub async fn request(
        &self,
        peer: &Arc<PeerConnection>,
        command: XRouterCommand,
        params: &[String],
    ) -> Result<XRouterMessage> {
        let (waiter, reply) = oneshot::channel();
        let uuid = self
            .dispatch(peer, command, params, MessageSource::Rpc, Some(waiter))
            .await?;
        let limit = self.group.settings().request_timeout();
        match timeout(limit, reply).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                debug!("{} {} timed out", command, uuid);
                Err(Error::Timeout(limit))
            }
        }
    }

    async fn dispatch(
        &self,
        peer: &Arc<PeerConnection>,
        command: XRouterCommand,
        params: &[String],
        source: MessageSource,
        waiter: Option<oneshot::Sender<XRouterMessage>>,
    ) -> Result<String> {
        let body = self.request_body(peer, command, params).await?;
        self.group.send(peer, command, body, source, waiter).await
    }

    async fn peer_config(&self, peer: &PeerConnection) -> Result<XRouterConfiguration> {
        peer.remote_config().await.ok_or(Error::NotYetConnected)
    }

    async fn request_body(
        &self,
        peer: &Arc<PeerConnection>,
        command: XRouterCommand,
        params: &[String],
    ) -> Result<XRouterBody> {
        if command == XRouterCommand::GetConfig {
            return Ok(XRouterBody::GetConfig {
                addr: String::from("self"),
            });
        }
        let (first, rest) = params
            .split_first()
            .ok_or_else(|| Error::Malformed(format!("{} needs a currency", command)))?;
        let config = self.peer_config(peer).await?;

        if command == XRouterCommand::Service {
            let plugin = config
                .plugin(first)
                .ok_or_else(|| Error::InvalidPluginCall(format!("{} does not offer {}", peer.seed(), first)))?;
            // check the arguments before any fee is paid
            XRouterBody::service(plugin, FREE_PAYMENT, rest)?;
            let payment = self.plugin_payment(&config, plugin).await?;
            return XRouterBody::service(plugin, &payment, rest);
        }

        let expected = match command {
            XRouterCommand::GetBlockCount => Some(0),
            XRouterCommand::GetBlockHash
            | XRouterCommand::GetBlock
            | XRouterCommand::GetTransaction
            | XRouterCommand::SendTransaction => Some(1),
            XRouterCommand::GetBlocks
            | XRouterCommand::GetTransactions
            | XRouterCommand::GetBalanceUpdate => Some(2),
            XRouterCommand::GetBalance | XRouterCommand::GetTxBloomFilter => Some(1),
            _ => None,
        };
        match expected {
            Some(count) if count == rest.len() => {}
            Some(count) => {
                return Err(Error::Malformed(format!(
                    "{} takes {} parameters, got {}",
                    command,
                    count,
                    rest.len()
                )))
            }
            None => return Err(Error::Malformed(format!("cannot send {}", command))),
        }

        let currency = first.to_uppercase();
        let payment = self.command_payment(&config, command).await?;
        let params = rest.to_vec();
        Ok(match command {
            XRouterCommand::GetBlocks
            | XRouterCommand::GetTransactions
            | XRouterCommand::GetBalanceUpdate
            | XRouterCommand::GetBalance
            | XRouterCommand::GetTxBloomFilter => XRouterBody::Fields {
                currency,
                payment,
                fields: params,
            },
            _ => XRouterBody::Query {
                currency,
                payment,
                params,
            },
        })
    }

    fn fee_wallet(&self) -> Result<&Arc<Wallet>> {
        self.wallet(FEE_TICKER)
    }

    async fn command_payment(&self, config: &XRouterConfiguration, command: XRouterCommand) -> Result<String> {
        if command_fee(config, command) == 0 {
            return Ok(FREE_PAYMENT.to_string());
        }
        let relay_fee = self.context.relay_fee(FEE_TICKER).await;
        fee_transaction(self.fee_wallet()?, config, command, relay_fee).await
    }

    async fn plugin_payment(
        &self,
        config: &XRouterConfiguration,
        plugin: &PluginConfiguration,
    ) -> Result<String> {
        if to_minor_units(plugin.fee) == 0 {
            return Ok(FREE_PAYMENT.to_string());
        }
        let relay_fee = self.context.relay_fee(FEE_TICKER).await;
        plugin_fee_transaction(self.fee_wallet()?, config, plugin, relay_fee).await
    }

    pub async fn request_block_count(&self, peer: &Arc<PeerConnection>, ticker: &str) -> Result<String> {
        self.dispatch(
            peer,
            XRouterCommand::GetBlockCount,
            &[ticker.to_string()],
            MessageSource::Background,
            None,
        )
        .await
    }

    /// Ask the best peer for the UTXOs of every address of `ticker`. Calls
    /// closer together than the refresh interval are skipped (`Ok(None)`).
    pub async fn refresh_utxos(&self, ticker: &str) -> Result<Option<String>> {
        let wallet = self.wallet(ticker)?;
        let ticker = wallet.ticker().to_string();
        if let Some(previous) = self.last_utxo_request.lock().await.get(&ticker) {
            if previous.elapsed() < self.group.settings().utxo_refresh() {
                debug!("skipping {} utxo refresh, last one was too recent", ticker);
                return Ok(None);
            }
        }

        let peer = self
            .best_peer(&ticker)
            .await
            .ok_or_else(|| Error::NoPeer(ticker.clone()))?;
        if !peer.has_required_plugins() {
            return Err(Error::InvalidPluginCall(format!(
                "{} does not offer {}",
                peer.seed(),
                REQUIRED_PLUGIN
            )));
        }
        let addresses = serde_json::to_string(&wallet.addresses().await)?;
        let uuid = self
            .dispatch(
                &peer,
                XRouterCommand::Service,
                &[REQUIRED_PLUGIN.to_string(), ticker.clone(), addresses],
                MessageSource::Background,
                None,
            )
            .await?;
        self.last_utxo_request
            .lock()
            .await
            .insert(ticker.clone(), Instant::now());
        debug!("requested {} utxos from {} ({})", ticker, peer.seed(), uuid);
        Ok(Some(uuid))
    }

    /// Broadcast `transaction` through the best peer. Its inputs are marked
    /// spent before any fee is paid and stay spent unless the peer rejects it.
    pub async fn send_transaction(&self, ticker: &str, transaction: Transaction) -> Result<String> {
        let wallet = self.wallet(ticker)?;
        let peer = self
            .best_peer(ticker)
            .await
            .ok_or_else(|| Error::NoPeer(ticker.to_string()))?;
        let config = self.peer_config(&peer).await?;

        let payment = if command_fee(&config, XRouterCommand::SendTransaction) == 0 {
            wallet.set_spent(&transaction, true).await;
            Ok(FREE_PAYMENT.to_string())
        } else {
            let relay_fee = self.context.relay_fee(FEE_TICKER).await;
            match self.fee_wallet() {
                Ok(fee_wallet) => {
                    covered_send_fee(wallet, fee_wallet, &config, &transaction, relay_fee).await
                }
                Err(err) => Err(err),
            }
        };
        let body = payment.and_then(|payment| {
            Ok(XRouterBody::Query {
                currency: wallet.ticker().to_uppercase(),
                payment,
                params: vec![transaction.to_hex()?],
            })
        });

        let mut broadcasts = self.broadcasts.lock().await;
        let sent = match body {
            Ok(body) => {
                self.group
                    .send(&peer, XRouterCommand::SendTransaction, body, MessageSource::Rpc, None)
                    .await
            }
            Err(err) => Err(err),
        };
        match sent {
            Ok(uuid) => {
                info!("broadcasting {} transaction {} ({})", ticker, transaction.txid()?, uuid);
                broadcasts.insert(
                    uuid.clone(),
                    Broadcast {
                        ticker: wallet.ticker().to_string(),
                        transaction,
                        sent: Instant::now(),
                    },
                );
                Ok(uuid)
            }
            Err(err) => {
                wallet.set_spent(&transaction, false).await;
                Err(err)
            }
        }
    }

    async fn handle_event(&self, event: GroupEvent) {
        match event {
            GroupEvent::PeerConfigured(peer) => {
                for ticker in self.tickers() {
                    if peer.supports(&ticker).await {
                        if let Err(err) = self.request_block_count(&peer, &ticker).await {
                            debug!("block count for {} from {}: {}", ticker, peer.seed(), err);
                        }
                    }
                }
            }
            GroupEvent::PeerDisconnected(peer) => {
                debug!("{} left the group", peer.seed());
            }
            GroupEvent::XRouter {
                peer,
                message,
                original,
            } => match original {
                Some(original) => self.process_reply(&peer, &message, &original).await,
                None => debug!("unsolicited {} from {}", message.command(), peer.seed()),
            },
        }
    }

    /// Apply one matched reply to the context or the ledgers.
    pub async fn process_reply(&self, peer: &PeerConnection, reply: &XRouterMessage, original: &XRouterMessage) {
        let text = match reply.reply() {
            Some(text) => text,
            None => return,
        };
        match original.body() {
            XRouterBody::Query { currency, .. } if original.command() == XRouterCommand::GetBlockCount => {
                match text.trim().trim_matches('"').parse::<u64>() {
                    Ok(height) => {
                        self.context.update_block_height(currency, height).await;
                    }
                    Err(_) => warn!("bad block count for {} from {}: {}", currency, peer.seed(), text),
                }
            }
            XRouterBody::Query { .. } if original.command() == XRouterCommand::SendTransaction => {
                self.process_broadcast_reply(original.uuid(), text).await;
            }
            XRouterBody::Service { plugin, params, .. } if plugin == REQUIRED_PLUGIN => {
                let ticker = match params.first() {
                    Some(PluginParam::String(ticker)) => ticker.to_uppercase(),
                    _ => return,
                };
                let wallet = match self.wallet(&ticker) {
                    Ok(wallet) => wallet,
                    Err(_) => return,
                };
                match parse_utxo_reply(&ticker, text) {
                    Ok(utxos) => {
                        let added = wallet.process_utxos(utxos).await;
                        event!(
                            Level::DEBUG,
                            "{} utxos from {}: {} new, balance {}",
                            ticker,
                            peer.seed(),
                            added,
                            to_coins(wallet.balance().await)
                        );
                    }
                    Err(err) => warn!("{} utxo reply from {}: {}", ticker, peer.seed(), err),
                }
            }
            _ => debug!("{} reply {} from {}", original.command(), reply.uuid(), peer.seed()),
        }
    }

    async fn process_broadcast_reply(&self, uuid: &str, text: &str) {
        let Broadcast {
            ticker, transaction, ..
        } = match self.broadcasts.lock().await.remove(uuid) {
            Some(entry) => entry,
            None => return,
        };
        let rejected = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map.get("error").filter(|error| !error.is_null()).cloned(),
            _ => None,
        };
        match (rejected, self.wallet(&ticker)) {
            (Some(error), Ok(wallet)) => {
                let restored = wallet.set_spent(&transaction, false).await;
                warn!(
                    "{} transaction rejected: {}, {} inputs spendable again",
                    ticker, error, restored
                );
            }
            (None, _) => info!("{} transaction accepted: {}", ticker, text.trim_matches('"')),
            _ => {}
        }
    }

    /// Forget broadcasts whose reply did not come within the queue expiry.
    /// Their inputs stay spent until a UTXO refresh says otherwise.
    pub async fn prune_broadcasts(&self) -> usize {
        let expiry = self.group.settings().queue_expiry();
        let mut broadcasts = self.broadcasts.lock().await;
        let before = broadcasts.len();
        broadcasts.retain(|uuid, broadcast| {
            let keep = broadcast.sent.elapsed() <= expiry;
            if !keep {
                debug!("no reply to {} broadcast {}", broadcast.ticker, uuid);
            }
            keep
        });
        before - broadcasts.len()
    }

    /// Every background interval: block counts from each configured peer,
    /// then a UTXO refresh for every currency with a known height.
    async fn run_background(self: Arc<Self>) {
        let mut ticker = interval(self.group.settings().background_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.keep_alive().await;
        }
    }

    pub async fn keep_alive(&self) {
        self.prune_broadcasts().await;
        for peer in self.group.connected_peers().await {
            if !peer.have_config() {
                continue;
            }
            for ticker in self.tickers() {
                if peer.supports(&ticker).await {
                    if let Err(err) = self.request_block_count(&peer, &ticker).await {
                        debug!("keep-alive to {} failed: {}", peer.seed(), err);
                    }
                }
            }
        }
        for ticker in self.tickers() {
            if self.context.block_height(&ticker).await == 0 {
                continue;
            }
            if let Err(err) = self.refresh_utxos(&ticker).await {
                debug!("utxo refresh for {}: {}", ticker, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoinParams;
    use crate::keypair::Keypair;
    use crate::networking::seed::Seed;
    use crate::networking::wire::{read_nt_string, read_u32_le};
    use crate::settings::NetworkSettings;
    use crate::test_utilities::mock_node::{MockNode, MockNodeConfig};
    use crate::test_utilities::wait_until;
    use serde_json::json;
    use std::time::Duration;

    fn settings() -> Arc<NetworkSettings> {
        Arc::new(NetworkSettings {
            seeds: vec![],
            connect_timeout_ms: 2_000,
            request_timeout_secs: 1,
            background_interval_secs: 3_600,
            queue_interval_ms: 3_600_000,
            ..NetworkSettings::default()
        })
    }

    async fn started(node: &MockNode, wallets: Vec<Wallet>) -> Arc<WalletService> {
        let group = PeerGroup::with_seeds(
            settings(),
            Arc::new(Keypair::new()),
            vec![Seed::parse(&node.address(), 0)],
        );
        let service = WalletService::new(Arc::new(Context::default()), group.clone(), wallets);
        service.start().await;
        group.start().await.unwrap();
        let svc = &service;
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                match svc.best_peer("BLOCK").await {
                    Some(peer) => peer.have_config(),
                    None => false,
                }
            })
            .await
        );
        service
    }

    fn utxo_json(address: &str, value: f64) -> serde_json::Value {
        json!({ "utxos": [
            { "address": address, "txhash": "11".repeat(32), "vout": 0, "block_number": 90, "value": value },
            { "address": address, "txhash": "22".repeat(32), "vout": 3, "block_number": 91, "value": value }
        ]})
    }

    #[tokio::test]
    async fn block_count_reaches_context_test() {
        let node = MockNode::start(MockNodeConfig::default()).await;
        let wallet = Wallet::new(CoinParams::blocknet(), vec![Arc::new(Keypair::new())]);
        let service = started(&node, vec![wallet]).await;

        let svc = &service;
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                svc.context().block_height("BLOCK").await == 2_000_000
            })
            .await
        );
        service.group().stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn utxo_refresh_updates_balance_test() {
        let keypair = Arc::new(Keypair::new());
        let address = keypair.address(26);
        let node = MockNode::start(MockNodeConfig {
            utxos: utxo_json(&address, 0.5),
            ..MockNodeConfig::default()
        })
        .await;
        let wallet = Wallet::new(CoinParams::blocknet(), vec![keypair]);
        let service = started(&node, vec![wallet]).await;
        let svc = &service;

        assert!(service.refresh_utxos("BLOCK").await.unwrap().is_some());
        // rate limited
        assert!(service.refresh_utxos("block").await.unwrap().is_none());

        assert!(
            wait_until(Duration::from_secs(5), || async move {
                svc.balance("BLOCK").await.unwrap() == 1.0
            })
            .await
        );
        assert_eq!(service.ledger_snapshot("BLOCK").await.unwrap().len(), 2);

        let request = node
            .requests()
            .await
            .into_iter()
            .find(|request| request.command() == XRouterCommand::Service)
            .unwrap();
        // service bodies are only typed with the plugin schema at hand
        match request.body() {
            XRouterBody::Raw(bytes) => {
                let mut buf = &bytes[..];
                assert_eq!(read_nt_string(&mut buf).unwrap(), REQUIRED_PLUGIN);
                assert_eq!(read_nt_string(&mut buf).unwrap(), FREE_PAYMENT);
                assert_eq!(read_u32_le(&mut buf).unwrap(), 2);
                assert_eq!(read_nt_string(&mut buf).unwrap(), "BLOCK");
                assert_eq!(read_nt_string(&mut buf).unwrap(), format!("[\"{}\"]", address));
            }
            other => panic!("unexpected body {:?}", other),
        }
        service.group().stop().await;
    }

    #[tokio::test]
    async fn rejected_broadcast_unmarks_inputs_test() {
        let keypair = Arc::new(Keypair::new());
        let address = keypair.address(26);
        let node = MockNode::start(MockNodeConfig {
            utxos: utxo_json(&address, 0.5),
            send_transaction_reply: Some(json!({ "error": "bad-txns-inputs-spent" }).to_string()),
            ..MockNodeConfig::default()
        })
        .await;
        let wallet = Wallet::new(CoinParams::blocknet(), vec![keypair]);
        let service = started(&node, vec![wallet]).await;
        let svc = &service;

        service.refresh_utxos("BLOCK").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                svc.balance("BLOCK").await.unwrap() == 1.0
            })
            .await
        );

        let destination = Keypair::new().address(26);
        let tx = service.build_transaction("BLOCK", &destination, 0.1).await.unwrap();
        assert_eq!(service.balance("BLOCK").await.unwrap(), 0.5);

        service.send_transaction("BLOCK", tx).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                svc.balance("BLOCK").await.unwrap() == 1.0
            })
            .await
        );
        service.group().stop().await;
    }

    #[tokio::test]
    async fn accepted_broadcast_keeps_inputs_spent_test() {
        let keypair = Arc::new(Keypair::new());
        let address = keypair.address(26);
        let node = MockNode::start(MockNodeConfig {
            utxos: utxo_json(&address, 0.5),
            ..MockNodeConfig::default()
        })
        .await;
        let service = started(&node, vec![Wallet::new(CoinParams::blocknet(), vec![keypair])]).await;
        let svc = &service;
        service.refresh_utxos("BLOCK").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                svc.balance("BLOCK").await.unwrap() == 1.0
            })
            .await
        );

        let tx = service
            .build_transaction("BLOCK", &Keypair::new().address(26), 0.1)
            .await
            .unwrap();
        let peer = service.best_peer("BLOCK").await.unwrap();
        service.send_transaction("BLOCK", tx).await.unwrap();
        let (peer, node) = (&peer, &node);
        assert!(
            wait_until(Duration::from_secs(5), || async move {
                peer.pending_count().await == 0
                    && node
                        .requests()
                        .await
                        .iter()
                        .any(|request| request.command() == XRouterCommand::SendTransaction)
            })
            .await
        );
        assert_eq!(service.balance("BLOCK").await.unwrap(), 0.5);
        service.group().stop().await;
    }

    #[tokio::test]
    async fn plugin_schema_is_checked_before_sending_test() {
        let node = MockNode::start(MockNodeConfig::default()).await;
        let service = started(&node, vec![]).await;
        let peer = service.best_peer("BLOCK").await.unwrap();

        let wrong_count = service
            .send_request(&peer, XRouterCommand::Service, &[REQUIRED_PLUGIN.to_string(), "BLOCK".into()])
            .await;
        assert!(matches!(wrong_count, Err(Error::InvalidPluginCall(_))));
        let unknown = service
            .send_request(&peer, XRouterCommand::Service, &["xrmnothing".to_string()])
            .await;
        assert!(matches!(unknown, Err(Error::InvalidPluginCall(_))));
        let extra = service
            .send_request(&peer, XRouterCommand::GetBlockCount, &["BLOCK".into(), "1".into()])
            .await;
        assert!(matches!(extra, Err(Error::Malformed(_))));

        let reply = service
            .request(&peer, XRouterCommand::GetBlockCount, &["LTC".into()])
            .await
            .unwrap();
        assert_eq!(reply.reply(), Some("2000000"));
        service.group().stop().await;
    }

    #[tokio::test]
    async fn request_times_out_test() {
        let node = MockNode::start(MockNodeConfig::default()).await;
        let service = started(&node, vec![]).await;
        let peer = service.best_peer("BLOCK").await.unwrap();
        // a closed peer leaves the request in the retry queue
        peer.close().await;

        let result = service
            .request(&peer, XRouterCommand::GetBlockHash, &["BLOCK".into(), "1".into()])
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        service.group().stop().await;
    }

    fn offline_service(queue_expiry_secs: u64, wallets: Vec<Wallet>) -> Arc<WalletService> {
        let group = PeerGroup::with_seeds(
            Arc::new(NetworkSettings {
                queue_expiry_secs,
                ..NetworkSettings::default()
            }),
            Arc::new(Keypair::new()),
            vec![],
        );
        WalletService::new(Arc::new(Context::default()), group, wallets)
    }

    #[tokio::test]
    async fn failed_refresh_is_not_rate_limited_test() {
        let wallet = Wallet::new(CoinParams::blocknet(), vec![Arc::new(Keypair::new())]);
        let service = offline_service(120, vec![wallet]);
        assert!(matches!(service.refresh_utxos("BLOCK").await, Err(Error::NoPeer(_))));
        // no request went out, so the next attempt is not skipped
        assert!(matches!(service.refresh_utxos("BLOCK").await, Err(Error::NoPeer(_))));
    }

    #[tokio::test]
    async fn unanswered_broadcasts_are_pruned_test() {
        let service = offline_service(0, vec![]);
        service.broadcasts.lock().await.insert(
            String::from("stale"),
            Broadcast {
                ticker: String::from("BLOCK"),
                transaction: Transaction::new(),
                sent: Instant::now(),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.prune_broadcasts().await, 1);
        assert!(service.broadcasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_currency_test() {
        let node = MockNode::start(MockNodeConfig::default()).await;
        let service = started(&node, vec![]).await;
        assert!(matches!(service.balance("DOGE").await, Err(Error::UnknownCurrency(_))));
        assert!(matches!(
            service.build_transaction("DOGE", "x", 1.0).await,
            Err(Error::UnknownCurrency(_))
        ));
        service.group().stop().await;
    }
}
