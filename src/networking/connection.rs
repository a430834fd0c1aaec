//! One TCP connection to a service node.
//!
//! A connection goes `Connecting -> Handshaking -> Ready -> Closed`. The
//! handshake is three independent completions tracked as a bit mask: our
//! version acknowledged, the peer's version received and acknowledged, and the
//! first ping answered. The connection becomes `Ready` the moment the mask is
//! full and never transitions there twice.
//!
//! Each connection runs its read loop in its own task. Decoded events go to
//! the owning group over an unbounded channel; they are never awaited by the
//! read loop, so a slow consumer cannot stall the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as TaskSlot};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use crate::keypair::Keypair;
use crate::networking::codec::{encode, FrameCodec};
use crate::networking::messages::{NetworkMessage, VersionMessage};
use crate::networking::request_tracker::{PendingRequest, ReplyWaiter, RequestTracker};
use crate::networking::seed::Seed;
use crate::networking::xrouter::XRouterMessage;
use crate::networking::xrouter_config::XRouterConfiguration;
use crate::settings::NetworkSettings;
use crate::time::create_timestamp;
use crate::{Error, Result};

/// The peer acknowledged our version.
pub const HANDSHAKE_OUTGOING: u8 = 0b001;
/// We received and acknowledged the peer's version.
pub const HANDSHAKE_INCOMING: u8 = 0b010;
/// We answered the peer's first ping.
pub const HANDSHAKE_PING: u8 = 0b100;
pub const HANDSHAKE_COMPLETE: u8 = HANDSHAKE_OUTGOING | HANDSHAKE_INCOMING | HANDSHAKE_PING;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// What a connection reports to its group.
#[derive(Debug)]
pub enum PeerEvent {
    Ready(Arc<PeerConnection>),
    Disconnected(Arc<PeerConnection>),
    /// An XRouter packet. `original` is the request a reply answers, and is
    /// `None` for packets the peer sent unprompted.
    XRouter {
        peer: Arc<PeerConnection>,
        message: XRouterMessage,
        original: Option<XRouterMessage>,
    },
}

#[derive(Debug, Default)]
struct Handshake {
    mask: u8,
    peer_version: Option<VersionMessage>,
}

pub struct PeerConnection {
    id: u64,
    seed: Arc<Seed>,
    settings: Arc<NetworkSettings>,
    keypair: Arc<Keypair>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: RwLock<ConnectionState>,
    handshake: Mutex<Handshake>,
    writer: Mutex<Option<BoxedWriter>>,
    tracker: Mutex<RequestTracker>,
    remote_config: RwLock<Option<XRouterConfiguration>>,
    have_config: AtomicBool,
    past_success: AtomicBool,
    has_required_plugins: AtomicBool,
    closed: AtomicBool,
    read_task: TaskSlot<Option<JoinHandle<()>>>,
    timeout_task: TaskSlot<Option<JoinHandle<()>>>,
}

fn put_task(slot: &TaskSlot<Option<JoinHandle<()>>>, task: JoinHandle<()>) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(task),
        Err(poisoned) => *poisoned.into_inner() = Some(task),
    }
}

fn take_task(slot: &TaskSlot<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

impl PeerConnection {
    pub fn new(
        seed: Arc<Seed>,
        settings: Arc<NetworkSettings>,
        keypair: Arc<Keypair>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Arc<PeerConnection> {
        Arc::new(PeerConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            seed,
            settings,
            keypair,
            events,
            state: RwLock::new(ConnectionState::Connecting),
            handshake: Mutex::new(Handshake::default()),
            writer: Mutex::new(None),
            tracker: Mutex::new(RequestTracker::new()),
            remote_config: RwLock::new(None),
            have_config: AtomicBool::new(false),
            past_success: AtomicBool::new(false),
            has_required_plugins: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_task: TaskSlot::new(None),
            timeout_task: TaskSlot::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn seed(&self) -> &Arc<Seed> {
        &self.seed
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn settings(&self) -> &Arc<NetworkSettings> {
        &self.settings
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn handshake_mask(&self) -> u8 {
        self.handshake.lock().await.mask
    }

    pub async fn peer_version(&self) -> Option<VersionMessage> {
        self.handshake.lock().await.peer_version.clone()
    }

    pub fn have_config(&self) -> bool {
        self.have_config.load(Ordering::SeqCst)
    }

    pub fn past_success(&self) -> bool {
        self.past_success.load(Ordering::SeqCst)
    }

    pub fn set_past_success(&self, value: bool) {
        self.past_success.store(value, Ordering::SeqCst);
    }

    pub fn has_required_plugins(&self) -> bool {
        self.has_required_plugins.load(Ordering::SeqCst)
    }

    pub async fn remote_config(&self) -> Option<XRouterConfiguration> {
        self.remote_config.read().await.clone()
    }

    pub async fn set_remote_config(&self, config: XRouterConfiguration, has_required_plugins: bool) {
        *self.remote_config.write().await = Some(config);
        self.has_required_plugins
            .store(has_required_plugins, Ordering::SeqCst);
        self.have_config.store(true, Ordering::SeqCst);
    }

    pub fn clear_config(&self) {
        self.have_config.store(false, Ordering::SeqCst);
    }

    /// Whether the peer's configuration lists `ticker`.
    pub async fn supports(&self, ticker: &str) -> bool {
        match self.remote_config.read().await.as_ref() {
            Some(config) => config.supports(ticker),
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.tracker.lock().await.len()
    }

    pub async fn take_pending(&self) -> Vec<(XRouterMessage, Option<ReplyWaiter>)> {
        self.tracker.lock().await.drain()
    }

    /// Drop requests that have waited longer than `max_age` for a reply.
    pub async fn expire_requests(&self, max_age: Duration) -> Vec<PendingRequest> {
        let cutoff = create_timestamp().saturating_sub(max_age.as_millis() as u64);
        self.tracker.lock().await.expire(cutoff)
    }

    /// Open the TCP connection to the seed and start the handshake.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let address = self.seed.address();
        debug!("connecting to {}", address);
        let limit = self.settings.connect_timeout();
        let stream = match timeout(limit, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.close().await;
                return Err(err.into());
            }
            Err(_) => {
                self.close().await;
                return Err(Error::Timeout(limit));
            }
        };
        let remote = stream.peer_addr()?;
        self.attach(stream, remote).await
    }

    /// Drive the handshake over an already-open stream.
    pub async fn attach<S>(self: &Arc<Self>, stream: S, remote: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(Box::new(writer));
        *self.state.write().await = ConnectionState::Handshaking;

        let connection = self.clone();
        let read_task = tokio::spawn(async move { connection.read_loop(reader).await });
        let connection = Arc::downgrade(self);
        let limit = self.settings.connect_timeout();
        let timeout_task = tokio::spawn(async move {
            sleep(limit).await;
            if let Some(connection) = connection.upgrade() {
                if !connection.is_ready().await {
                    warn!("handshake with {} timed out", connection.seed);
                    connection.close().await;
                }
            }
        });
        put_task(&self.read_task, read_task);
        put_task(&self.timeout_task, timeout_task);
        if self.is_closed() {
            // closed while the tasks were starting
            for task in [take_task(&self.read_task), take_task(&self.timeout_task)]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            return Err(Error::ConnectionClosed);
        }

        let version = VersionMessage::new(
            self.settings.protocol_version,
            &self.settings.user_agent,
            remote,
        );
        self.send(NetworkMessage::Version(version)).await
    }

    /// Write one message. Writers are serialized so frames never interleave.
    pub async fn send(&self, message: NetworkMessage) -> Result<()> {
        let bytes = encode(&message, self.settings.magic)?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotYetConnected)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn register_request(&self, message: XRouterMessage, waiter: Option<ReplyWaiter>) -> Result<()> {
        self.tracker.lock().await.register(message, waiter)
    }

    /// Withdraw a registration whose request could not be sent.
    pub async fn forget_request(&self, uuid: &str) -> Option<PendingRequest> {
        self.tracker.lock().await.forget(uuid)
    }

    /// Register `message` as pending, then send it.
    pub async fn send_xrouter(&self, message: XRouterMessage, waiter: Option<ReplyWaiter>) -> Result<()> {
        let uuid = message.uuid().to_string();
        self.register_request(message.clone(), waiter).await?;
        debug!("sending {} {} to {}", message.command(), uuid, self.seed);
        if let Err(err) = self.send(NetworkMessage::XRouter(message)).await {
            self.forget_request(&uuid).await;
            return Err(err);
        }
        Ok(())
    }

    /// Close the socket and report the disconnect. Only the first call acts.
    ///
    /// The read and timeout tasks call this themselves, so the disconnect is
    /// reported before either task is aborted and nothing is awaited after.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = [take_task(&self.timeout_task), take_task(&self.read_task)];
        *self.state.write().await = ConnectionState::Closed;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        info!("connection {} to {} closed", self.id, self.seed);
        let _ = self.events.send(PeerEvent::Disconnected(self.clone()));
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new(self.settings.magic));
        while let Some(frame) = frames.next().await {
            let result = match frame {
                Ok(frame) => match frame.decode() {
                    Ok(message) => self.handle_message(message).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if err.is_fatal_to_connection() {
                    warn!("closing {}: {}", self.seed, err);
                    break;
                }
                debug!("dropping message from {}: {}", self.seed, err);
            }
            if self.is_closed() {
                return;
            }
        }
        self.close().await;
    }

    /// Apply one decoded message to the connection.
    pub async fn handle_message(self: &Arc<Self>, message: NetworkMessage) -> Result<()> {
        match message {
            NetworkMessage::Version(version) => self.on_version(version).await,
            NetworkMessage::Verack => self.on_verack().await,
            NetworkMessage::Ping(nonce) => self.on_ping(nonce).await,
            other => {
                if !self.is_ready().await {
                    return Err(Error::Protocol(format!(
                        "received {} before the handshake completed",
                        other.command()
                    )));
                }
                match other {
                    NetworkMessage::XRouter(message) => self.on_xrouter(message).await,
                    NetworkMessage::Reject(reject) => {
                        warn!(
                            "{} rejected {}: {} ({})",
                            self.seed, reject.message, reject.reason, reject.code
                        );
                        Ok(())
                    }
                    NetworkMessage::Pong(_) | NetworkMessage::Ignored(_) => Ok(()),
                    NetworkMessage::Unknown { command, .. } => {
                        trace!("ignoring unknown command {} from {}", command, self.seed);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn on_version(self: &Arc<Self>, version: VersionMessage) -> Result<()> {
        {
            let mut handshake = self.handshake.lock().await;
            if handshake.peer_version.is_some() {
                return Err(Error::Protocol(String::from(
                    "received more than one version message",
                )));
            }
            debug!(
                "{} version {} {} height {}",
                self.seed, version.version, version.user_agent, version.start_height
            );
            handshake.peer_version = Some(version.clone());
        }

        if !version.has_blockchain()
            || (!self.settings.allow_empty_chains && version.start_height == 0)
        {
            info!("{} has no usable blockchain, disconnecting", self.seed);
            self.close().await;
            return Ok(());
        }
        if version.start_height < 0 {
            info!(
                "{} reported bad height {}, disconnecting",
                self.seed, version.start_height
            );
            self.close().await;
            return Ok(());
        }

        self.send(NetworkMessage::Verack).await?;
        self.complete(HANDSHAKE_INCOMING).await
    }

    async fn on_verack(self: &Arc<Self>) -> Result<()> {
        let mask = {
            let handshake = self.handshake.lock().await;
            if handshake.peer_version.is_none() {
                return Err(Error::Protocol(String::from(
                    "received verack before version",
                )));
            }
            handshake.mask
        };
        if mask & HANDSHAKE_INCOMING == 0 || mask & HANDSHAKE_OUTGOING != 0 {
            return Err(Error::Protocol(String::from(
                "received more than one verack",
            )));
        }
        self.complete(HANDSHAKE_OUTGOING).await
    }

    async fn on_ping(self: &Arc<Self>, nonce: u64) -> Result<()> {
        self.send(NetworkMessage::Pong(nonce)).await?;
        self.complete(HANDSHAKE_PING).await
    }

    /// Record a handshake completion and enter `Ready` once all three are in.
    async fn complete(self: &Arc<Self>, bit: u8) -> Result<()> {
        let (became_complete, peer_version) = {
            let mut handshake = self.handshake.lock().await;
            let before = handshake.mask;
            handshake.mask |= bit;
            (
                before != HANDSHAKE_COMPLETE && handshake.mask == HANDSHAKE_COMPLETE,
                handshake.peer_version.as_ref().map(|version| version.version),
            )
        };
        if !became_complete {
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Handshaking {
                return Ok(());
            }
            *state = ConnectionState::Ready;
        }

        // the connect timeout no longer applies
        if let Some(task) = take_task(&self.timeout_task) {
            task.abort();
        }
        info!("handshake with {} complete", self.seed);
        let _ = self.events.send(PeerEvent::Ready(self.clone()));

        if peer_version.unwrap_or(0) < self.settings.min_protocol_version {
            info!(
                "{} protocol version {:?} below minimum {}, disconnecting",
                self.seed, peer_version, self.settings.min_protocol_version
            );
            self.close().await;
        }
        Ok(())
    }

    async fn on_xrouter(self: &Arc<Self>, message: XRouterMessage) -> Result<()> {
        if !message.command().is_reply() {
            let _ = self.events.send(PeerEvent::XRouter {
                peer: self.clone(),
                message,
                original: None,
            });
            return Ok(());
        }

        let uuid = message.uuid().to_string();
        if uuid.is_empty() {
            warn!("{} sent a reply with a blank uuid", self.seed);
            return Ok(());
        }
        if !self.tracker.lock().await.contains(&uuid) {
            return Err(Error::Protocol(format!("Unexpected UUID {}", uuid)));
        }
        if self.settings.verify_reply_signatures && !message.is_unsigned() {
            if let Err(err) = message.verify_signature() {
                warn!("dropping reply {} from {}: {}", uuid, self.seed, err);
                return Err(err);
            }
        }

        let matched = self.tracker.lock().await.take(&uuid)?;
        if let Some(waiter) = matched.waiter {
            let _ = waiter.send(message.clone());
        }
        let _ = self.events.send(PeerEvent::XRouter {
            peer: self.clone(),
            message,
            original: Some(matched.original),
        });
        Ok(())
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("seed", &self.seed.address())
            .field("closed", &self.is_closed())
            .finish()
    }
}
