use std::sync::Arc;

use clap::{App, Arg};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, event, info, Level};

use crate::context::Context;
use crate::keypair::Keypair;
use crate::networking::peer_group::PeerGroup;
use crate::service::WalletService;
use crate::settings::{NodeSettings, DEFAULT_CONFIG_PATH};
use crate::wallet::Wallet;

///
/// The entry point to the wallet node runtime
///
pub async fn run() -> crate::Result<()> {
    //
    // handle command-line arguments
    //
    let matches = App::new("XRouter Wallet Node")
        .about("Connects to service nodes and keeps wallet balances current")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH)
                .takes_value(true)
                .help("config file name"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
    let settings = NodeSettings::load(config_path)?;
    let mut node = Node::new(settings).await?;

    //
    // initiate runtime and handle results
    //
    tokio::select! {
        res = node.run() => {
            if let Err(err) = res {
                error!("{}", err);
            }
        },
        _ = signal::ctrl_c() => {
            info!("Shutting down!")
        }
    }

    node.shutdown().await;
    Ok(())
}

pub struct Node {
    context: Arc<Context>,
    group: Arc<PeerGroup>,
    service: Arc<WalletService>,
}

impl Node {
    pub async fn new(settings: NodeSettings) -> crate::Result<Node> {
        let context = Arc::new(Context::with_overrides(&settings.coins).await);

        //
        // one wallet per configured currency
        //
        let mut wallets = vec![];
        for wallet_settings in &settings.wallets {
            let coin = context.coin(&wallet_settings.ticker)?.clone();
            let wallet = Wallet::from_settings(wallet_settings, coin)?;
            event!(
                Level::INFO,
                "{} wallet with addresses {:?}",
                wallet.ticker(),
                wallet.addresses().await
            );
            wallets.push(wallet);
        }

        //
        // packets are signed with a per-session key
        //
        let group = PeerGroup::new(Arc::new(settings.network), Arc::new(Keypair::new()));
        let service = WalletService::new(context.clone(), group.clone(), wallets);

        Ok(Node {
            context,
            group,
            service,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn service(&self) -> &Arc<WalletService> {
        &self.service
    }

    /// Start the service and the peer group, then report group events until
    /// the group goes away.
    async fn run(&mut self) -> crate::Result<()> {
        let mut events = self.group.subscribe();
        self.service.start().await;
        self.group.start().await?;

        loop {
            match events.recv().await {
                Ok(event) => event!(Level::TRACE, "{:?}", event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    pub async fn shutdown(&self) {
        self.service.stop().await;
        self.group.stop().await;
        for ticker in self.service.tickers() {
            if let Ok(balance) = self.service.balance(&ticker).await {
                info!("{} balance {}", ticker, balance);
            }
        }
    }
}
