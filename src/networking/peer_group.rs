//! The group of connections to service nodes.
//!
//! Every seed gets a connection on start. Connections that finish the
//! handshake are promoted to the connected set and asked for their XRouter
//! configuration; connections that die are demoted to the pending set if they
//! ever worked, and their seed is charged a failure. Two periodic jobs keep
//! the group alive: the reconnect scheduler retries inactive seeds once they
//! have cooled down, and the retry queue re-homes requests whose peer died.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, event, info, warn, Level};

use crate::keypair::Keypair;
use crate::networking::connection::{PeerConnection, PeerEvent};
use crate::networking::messages::NetworkMessage;
use crate::networking::queue::{MessageSource, QueueItem};
use crate::networking::request_tracker::ReplyWaiter;
use crate::networking::seed::{shuffled_seeds, Seed};
use crate::networking::xrouter::{XRouterBody, XRouterCommand, XRouterMessage};
use crate::networking::xrouter_config::{XRouterConfiguration, REQUIRED_PLUGIN};
use crate::settings::NetworkSettings;
use crate::time::{create_timestamp, unix_seconds};
use crate::{Error, Result};

pub const GROUP_EVENT_CAPACITY: usize = 1024;

/// What the group reports to the rest of the node.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// A peer delivered its remote configuration and can take requests.
    PeerConfigured(Arc<PeerConnection>),
    PeerDisconnected(Arc<PeerConnection>),
    XRouter {
        peer: Arc<PeerConnection>,
        message: XRouterMessage,
        original: Option<XRouterMessage>,
    },
}

#[derive(Debug, Default)]
struct PeerSets {
    connected: Vec<Arc<PeerConnection>>,
    pending: Vec<Arc<PeerConnection>>,
}

/// Whether the scheduler should retry `seed` at `now` (ms). Failures older
/// than the reset window are forgiven first.
pub fn reconnect_due(seed: &Seed, now: u64, settings: &NetworkSettings) -> bool {
    if seed.is_active() {
        return false;
    }
    let reset = settings.fail_reset().as_millis() as u64;
    if seed.fail_count() > 0 && seed.since_last_fail(now) >= reset {
        debug!("forgiving {} failures of {}", seed.fail_count(), seed);
        seed.reset_counters();
    }
    let cooldown = settings.reconnect_cooldown().as_millis() as u64;
    seed.fail_count() <= settings.max_reconnects && seed.since_last_fail(now) >= cooldown
}

pub struct PeerGroup {
    settings: Arc<NetworkSettings>,
    keypair: Arc<Keypair>,
    seeds: Vec<Arc<Seed>>,
    peers: Mutex<PeerSets>,
    queue: Mutex<Vec<QueueItem>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    subscribers: broadcast::Sender<GroupEvent>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerGroup {
    /// Seeds come from the settings and are shuffled once here.
    pub fn new(settings: Arc<NetworkSettings>, keypair: Arc<Keypair>) -> Arc<PeerGroup> {
        let seeds = shuffled_seeds(&settings.seeds, settings.port);
        PeerGroup::with_seeds(settings, keypair, seeds)
    }

    pub fn with_seeds(
        settings: Arc<NetworkSettings>,
        keypair: Arc<Keypair>,
        seeds: Vec<Seed>,
    ) -> Arc<PeerGroup> {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(GROUP_EVENT_CAPACITY);
        Arc::new(PeerGroup {
            settings,
            keypair,
            seeds: seeds.into_iter().map(Arc::new).collect(),
            peers: Mutex::new(PeerSets::default()),
            queue: Mutex::new(vec![]),
            events,
            event_receiver: Mutex::new(Some(event_receiver)),
            subscribers,
            running: AtomicBool::new(false),
            tasks: Mutex::new(vec![]),
        })
    }

    pub fn settings(&self) -> &Arc<NetworkSettings> {
        &self.settings
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn seeds(&self) -> &[Arc<Seed>] {
        &self.seeds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.subscribers.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connect to every seed and start the periodic jobs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let receiver = self
            .event_receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Protocol(String::from("peer group cannot be restarted")))?;

        let mut tasks = self.tasks.lock().await;
        let group = self.clone();
        tasks.push(tokio::spawn(async move { group.run_events(receiver).await }));

        info!("connecting to {} seeds", self.seeds.len());
        for seed in &self.seeds {
            let peer = self.create_peer(seed).await;
            self.spawn_connect(peer);
        }

        let group = self.clone();
        tasks.push(tokio::spawn(async move { group.run_reconnects().await }));
        let group = self.clone();
        tasks.push(tokio::spawn(async move { group.run_queue().await }));
        Ok(())
    }

    /// Stop the periodic jobs and close every connection.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let peers: Vec<Arc<PeerConnection>> = {
            let mut peers = self.peers.lock().await;
            let mut all: Vec<Arc<PeerConnection>> = peers.connected.drain(..).collect();
            all.append(&mut peers.pending);
            all
        };
        for peer in peers {
            peer.close().await;
        }
        info!("peer group stopped");
    }

    /// A fresh connection for `seed`, tracked as pending until it is ready.
    pub async fn create_peer(&self, seed: &Arc<Seed>) -> Arc<PeerConnection> {
        let peer = PeerConnection::new(
            seed.clone(),
            self.settings.clone(),
            self.keypair.clone(),
            self.events.clone(),
        );
        seed.set_active(true);
        self.peers.lock().await.pending.push(peer.clone());
        peer
    }

    /// Connect in the background. A failed connect closes the peer, which
    /// reports back as a disconnect.
    fn spawn_connect(&self, peer: Arc<PeerConnection>) {
        tokio::spawn(async move {
            if let Err(err) = peer.connect().await {
                debug!("connect to {} failed: {}", peer.seed(), err);
            }
        });
    }

    pub async fn connected_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.lock().await.connected.clone()
    }

    pub async fn pending_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.lock().await.pending.clone()
    }

    /// The least loaded ready peer serving `ticker`, falling back to the
    /// pending set. Never waits on the network.
    pub async fn best_peer(&self, ticker: &str) -> Option<Arc<PeerConnection>> {
        let (connected, pending) = {
            let peers = self.peers.lock().await;
            (peers.connected.clone(), peers.pending.clone())
        };
        match least_loaded(&connected, ticker).await {
            Some(peer) => Some(peer),
            None => least_loaded(&pending, ticker).await,
        }
    }

    /// Sign and send a request, returning its UUID. When the peer cannot
    /// take it right now the request goes to the retry queue instead, with
    /// the same UUID and waiter.
    pub async fn send(
        &self,
        peer: &Arc<PeerConnection>,
        command: XRouterCommand,
        body: XRouterBody,
        source: MessageSource,
        waiter: Option<ReplyWaiter>,
    ) -> Result<String> {
        let mut item = QueueItem::new(peer.clone(), command, body, None, source, waiter);
        let message = item.message(&self.keypair)?;
        let uuid = message.uuid().to_string();

        if !peer.is_ready().await {
            debug!("{} not ready, queueing {} {}", peer.seed(), command, uuid);
            self.enqueue(item).await;
            return Ok(uuid);
        }
        if let Err(err) = self.submit(peer, &mut item, message).await {
            debug!("queueing {} {} after send failure: {}", command, uuid, err);
            self.enqueue(item).await;
        }
        Ok(uuid)
    }

    /// Register and write one attempt. On failure the waiter goes back into
    /// the item so a later attempt can still answer it.
    async fn submit(
        &self,
        peer: &Arc<PeerConnection>,
        item: &mut QueueItem,
        message: XRouterMessage,
    ) -> Result<()> {
        let uuid = message.uuid().to_string();
        peer.register_request(message.clone(), item.take_waiter())
            .await?;
        if let Err(err) = peer.send(NetworkMessage::XRouter(message)).await {
            if let Some(pending) = peer.forget_request(&uuid).await {
                let (_, waiter) = pending.into_parts();
                item.restore_waiter(waiter);
            }
            return Err(err);
        }
        event!(
            Level::DEBUG,
            "sent {} {} to {} for {}",
            item.command(),
            uuid,
            peer.seed(),
            item.source()
        );
        Ok(())
    }

    pub async fn enqueue(&self, item: QueueItem) {
        self.queue.lock().await.push(item);
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn run_events(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Ready(peer) => self.handle_new_peer(peer).await,
            PeerEvent::Disconnected(peer) => self.handle_peer_death(peer).await,
            PeerEvent::XRouter {
                peer,
                message,
                original,
            } => {
                let _ = self.subscribers.send(GroupEvent::XRouter {
                    peer,
                    message,
                    original,
                });
            }
        }
    }

    async fn handle_new_peer(self: &Arc<Self>, peer: Arc<PeerConnection>) {
        {
            let mut peers = self.peers.lock().await;
            let address = peer.seed().address();
            // older dead connections to the same seed are superseded
            peers.pending.retain(|other| {
                other.id() != peer.id() && !(other.is_closed() && other.seed().address() == address)
            });
            if !peers.connected.iter().any(|other| other.id() == peer.id()) {
                peers.connected.push(peer.clone());
            }
            info!(
                "{} connected, {} peers ready",
                peer.seed(),
                peers.connected.len()
            );
        }
        peer.set_past_success(true);
        peer.seed().set_active(true);
        peer.seed().reset_counters();

        if peer.have_config() {
            let _ = self.subscribers.send(GroupEvent::PeerConfigured(peer));
        } else if self.settings.require_config {
            if let Err(err) = self.request_config(&peer).await {
                warn!("could not request configuration from {}: {}", peer.seed(), err);
            }
        }
    }

    /// Ask `peer` for its configuration and apply the reply when it comes.
    async fn request_config(self: &Arc<Self>, peer: &Arc<PeerConnection>) -> Result<()> {
        let message = XRouterMessage::new_signed(
            XRouterCommand::GetConfig,
            None,
            XRouterBody::GetConfig {
                addr: String::from("self"),
            },
            &self.keypair,
            unix_seconds(),
        )?;
        let (waiter, reply) = oneshot::channel();
        peer.send_xrouter(message, Some(waiter)).await?;

        let group = self.clone();
        let peer = peer.clone();
        let limit = self.settings.request_timeout();
        tokio::spawn(async move {
            match timeout(limit, reply).await {
                Ok(Ok(reply)) => group.apply_config(&peer, &reply).await,
                Ok(Err(_)) => debug!("configuration request to {} abandoned", peer.seed()),
                Err(_) => warn!("{} did not send its configuration", peer.seed()),
            }
        });
        Ok(())
    }

    async fn apply_config(&self, peer: &Arc<PeerConnection>, reply: &XRouterMessage) {
        let text = match reply.reply() {
            Some(text) => text,
            None => return,
        };
        let config = match XRouterConfiguration::from_reply(text) {
            Ok(config) => config,
            Err(err) => {
                warn!("bad configuration from {}: {}", peer.seed(), err);
                return;
            }
        };
        let has_required = config.has_plugin(REQUIRED_PLUGIN);
        if !has_required {
            warn!("{} lacks the {} plugin", peer.seed(), REQUIRED_PLUGIN);
        }
        info!(
            "{} serves {}",
            peer.seed(),
            config.supported_wallets().join(",")
        );
        peer.set_remote_config(config, has_required).await;
        peer.set_past_success(true);
        let _ = self
            .subscribers
            .send(GroupEvent::PeerConfigured(peer.clone()));
    }

    async fn handle_peer_death(self: &Arc<Self>, peer: Arc<PeerConnection>) {
        {
            let mut peers = self.peers.lock().await;
            peers.connected.retain(|other| other.id() != peer.id());
            peers.pending.retain(|other| other.id() != peer.id());
            if peer.have_config() || peer.past_success() {
                peers.pending.push(peer.clone());
            }
            info!(
                "{} died, {} peers ready",
                peer.seed(),
                peers.connected.len()
            );
        }
        peer.clear_config();
        peer.seed().record_failure();
        peer.close().await;

        let orphaned = peer.take_pending().await;
        if !orphaned.is_empty() {
            debug!(
                "re-queueing {} requests from {}",
                orphaned.len(),
                peer.seed()
            );
            let mut queue = self.queue.lock().await;
            for (message, waiter) in orphaned {
                queue.push(QueueItem::from_pending(
                    peer.clone(),
                    message,
                    MessageSource::Background,
                    waiter,
                ));
            }
        }
        let _ = self.subscribers.send(GroupEvent::PeerDisconnected(peer));
    }

    async fn run_reconnects(self: Arc<Self>) {
        let mut ticker = interval(self.settings.reconnect_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires at once and start already connected everything
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.attempt_reconnects(false).await;
        }
    }

    /// Open new connections to every inactive seed that is due, or to every
    /// inactive seed when `force` is set. Returns how many were started.
    pub async fn attempt_reconnects(self: &Arc<Self>, force: bool) -> usize {
        let now = create_timestamp();
        let mut started = 0;
        for seed in &self.seeds {
            let due = reconnect_due(seed, now, &self.settings);
            if due || (force && !seed.is_active()) {
                event!(
                    Level::INFO,
                    "reconnecting to {} ({} failures)",
                    seed,
                    seed.fail_count()
                );
                let peer = self.create_peer(seed).await;
                self.spawn_connect(peer);
                started += 1;
            }
        }
        started
    }

    async fn run_queue(self: Arc<Self>) {
        let mut ticker = interval(self.settings.queue_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.process_queue().await;
        }
    }

    /// One pass over the retry queue. Expired items are dropped; items whose
    /// peer is gone wait for a new connection to the same seed.
    pub async fn process_queue(self: &Arc<Self>) {
        self.expire_requests().await;

        let items: Vec<QueueItem> = self.queue.lock().await.drain(..).collect();
        if items.is_empty() {
            return;
        }
        debug!("processing {} queued requests", items.len());

        let mut retained = vec![];
        for mut item in items {
            if item.is_expired(self.settings.queue_expiry()) {
                warn!("dropping expired {} request {:?}", item.command(), item.uuid());
                continue;
            }

            let original = item.original_peer().clone();
            let peer = if original.is_ready().await {
                original
            } else {
                let replacement = self.create_peer(original.seed()).await;
                self.peers
                    .lock()
                    .await
                    .pending
                    .retain(|other| other.id() != original.id());
                self.spawn_connect(replacement.clone());
                item.set_new_peer(replacement.clone());

                match self
                    .wait_for_connection(original.seed(), self.settings.queue_wait())
                    .await
                {
                    Some(peer) => peer,
                    None => {
                        debug!("{} did not come back in time", original.seed());
                        replacement.close().await;
                        retained.push(item);
                        continue;
                    }
                }
            };

            let message = match item.message(&self.keypair) {
                Ok(message) => message,
                Err(err) => {
                    warn!("dropping unsendable {} request: {}", item.command(), err);
                    continue;
                }
            };
            if let Err(err) = self.submit(&peer, &mut item, message).await {
                debug!("resubmission to {} failed: {}", peer.seed(), err);
                retained.push(item);
            }
        }

        if !retained.is_empty() {
            self.queue.lock().await.extend(retained);
        }
    }

    /// Forget requests no reply came for within the queue expiry. Dropping
    /// them also drops their waiters.
    async fn expire_requests(&self) -> usize {
        let peers: Vec<Arc<PeerConnection>> = {
            let peers = self.peers.lock().await;
            peers.connected.iter().chain(peers.pending.iter()).cloned().collect()
        };
        let mut expired = 0;
        for peer in peers {
            for pending in peer.expire_requests(self.settings.queue_expiry()).await {
                debug!(
                    "no reply from {} to {} {}",
                    peer.seed(),
                    pending.message().command(),
                    pending.message().uuid()
                );
                expired += 1;
            }
        }
        expired
    }

    /// Poll until a configured peer for `seed` is connected, or give up
    /// after `max_wait`.
    async fn wait_for_connection(
        &self,
        seed: &Arc<Seed>,
        max_wait: Duration,
    ) -> Option<Arc<PeerConnection>> {
        let address = seed.address();
        let deadline = Instant::now() + max_wait;
        loop {
            let found = self
                .peers
                .lock()
                .await
                .connected
                .iter()
                .find(|peer| peer.have_config() && peer.seed().address() == address)
                .cloned();
            if found.is_some() {
                return found;
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.settings.queue_poll()).await;
        }
    }
}

async fn least_loaded(peers: &[Arc<PeerConnection>], ticker: &str) -> Option<Arc<PeerConnection>> {
    let mut best: Option<(usize, Arc<PeerConnection>)> = None;
    for peer in peers {
        if !(peer.have_config() || peer.past_success()) {
            continue;
        }
        if !peer.supports(ticker).await {
            continue;
        }
        let load = peer.pending_count().await;
        if best.as_ref().map_or(true, |(fewest, _)| load < *fewest) {
            best = Some((load, peer.clone()));
        }
    }
    best.map(|(_, peer)| peer)
}
