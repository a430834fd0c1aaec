//! An in-process service node: accepts TCP connections, completes the
//! handshake, and answers XRouter requests from canned data.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::keypair::Keypair;
use crate::networking::codec::{encode, FrameCodec, BLOCKNET_MAGIC};
use crate::networking::messages::{NetworkMessage, VersionMessage, NODE_NETWORK};
use crate::networking::xrouter::{XRouterBody, XRouterCommand, XRouterMessage};
use crate::time::unix_seconds;

#[derive(Debug, Clone)]
pub struct MockNodeConfig {
    pub wallets: Vec<String>,
    pub height: i32,
    pub protocol_version: i32,
    pub block_count: String,
    /// Body of the `xrmgetutxos` reply.
    pub utxos: serde_json::Value,
    /// Reply to `xrSendTransaction`; `None` echoes a fixed txid.
    pub send_transaction_reply: Option<String>,
    pub payment_address: String,
    pub send_transaction_fee: f64,
    pub with_utxo_plugin: bool,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        MockNodeConfig {
            wallets: vec![String::from("BLOCK"), String::from("LTC")],
            height: 100,
            protocol_version: 70712,
            block_count: String::from("2000000"),
            utxos: json!({ "utxos": [] }),
            send_transaction_reply: None,
            payment_address: Keypair::new().address(26),
            send_transaction_fee: 0.0,
            with_utxo_plugin: true,
        }
    }
}

impl MockNodeConfig {
    pub fn config_reply(&self) -> String {
        let config = format!(
            "[Main]\nwallets={}\ntimeout=30\nblocklimit=50\npaymentaddress={}\n[xrGetBlockCount]\nfee=0\n[xrSendTransaction]\nfee={}\n",
            self.wallets.join(","),
            self.payment_address,
            self.send_transaction_fee
        );
        let mut plugins = serde_json::Map::new();
        if self.with_utxo_plugin {
            plugins.insert(
                String::from("xrmgetutxos"),
                json!("parameters=string,string\nfee=0\nclientrequestlimit=50"),
            );
        }
        json!({ "config": config, "plugins": plugins }).to_string()
    }
}

pub struct MockNode {
    address: SocketAddr,
    keypair: Arc<Keypair>,
    requests: Arc<Mutex<Vec<XRouterMessage>>>,
    task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start(config: MockNodeConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let keypair = Arc::new(Keypair::new());
        let requests = Arc::new(Mutex::new(vec![]));
        let config = Arc::new(config);

        let node_keypair = keypair.clone();
        let node_requests = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = config.clone();
                let keypair = node_keypair.clone();
                let requests = node_requests.clone();
                tokio::spawn(async move { serve(stream, config, keypair, requests).await });
            }
        });

        MockNode {
            address,
            keypair,
            requests,
            task,
        }
    }

    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Every XRouter request received so far, in arrival order.
    pub async fn requests(&self) -> Vec<XRouterMessage> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn write(writer: &mut OwnedWriteHalf, message: NetworkMessage) -> bool {
    match encode(&message, BLOCKNET_MAGIC) {
        Ok(bytes) => writer.write_all(&bytes).await.is_ok(),
        Err(_) => false,
    }
}

async fn serve(
    stream: TcpStream,
    config: Arc<MockNodeConfig>,
    keypair: Arc<Keypair>,
    requests: Arc<Mutex<Vec<XRouterMessage>>>,
) {
    let remote = match stream.peer_addr() {
        Ok(remote) => remote,
        Err(_) => return,
    };
    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec::new(BLOCKNET_MAGIC));

    while let Some(Ok(frame)) = frames.next().await {
        let message = match frame.decode() {
            Ok(message) => message,
            Err(_) => return,
        };
        match message {
            NetworkMessage::Version(_) => {
                let mut version = VersionMessage::new(config.protocol_version, "/mock:0.1/", remote);
                version.services = NODE_NETWORK;
                version.start_height = config.height;
                if !write(&mut writer, NetworkMessage::Version(version)).await
                    || !write(&mut writer, NetworkMessage::Verack).await
                    || !write(&mut writer, NetworkMessage::Ping(42)).await
                {
                    return;
                }
            }
            NetworkMessage::Ping(nonce) => {
                if !write(&mut writer, NetworkMessage::Pong(nonce)).await {
                    return;
                }
            }
            NetworkMessage::XRouter(request) => {
                requests.lock().await.push(request.clone());
                let (command, reply) = answer(&config, &request);
                debug!("mock node answering {}", request.command());
                let reply = XRouterMessage::new_signed(
                    command,
                    Some(request.uuid().to_string()),
                    XRouterBody::Reply { reply },
                    &keypair,
                    unix_seconds(),
                );
                match reply {
                    Ok(reply) => {
                        if !write(&mut writer, NetworkMessage::XRouter(reply)).await {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
            _ => {}
        }
    }
}

fn answer(config: &MockNodeConfig, request: &XRouterMessage) -> (XRouterCommand, String) {
    match request.command() {
        XRouterCommand::GetConfig => (XRouterCommand::ConfigReply, config.config_reply()),
        XRouterCommand::GetBlockCount => (XRouterCommand::Reply, config.block_count.clone()),
        XRouterCommand::SendTransaction => {
            let reply = config
                .send_transaction_reply
                .clone()
                .unwrap_or_else(|| String::from("\"mocktxid\""));
            (XRouterCommand::Reply, reply)
        }
        XRouterCommand::Service => (XRouterCommand::Reply, config.utxos.to_string()),
        _ => (
            XRouterCommand::Reply,
            json!({ "error": "unsupported" }).to_string(),
        ),
    }
}
