//! Requests waiting to be (re)sent once their peer is usable again.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::keypair::Keypair;
use crate::networking::connection::PeerConnection;
use crate::networking::request_tracker::ReplyWaiter;
use crate::networking::xrouter::{XRouterBody, XRouterCommand, XRouterMessage};
use crate::time::unix_seconds;
use crate::Result;

/// Who asked for a request. Only used for logging and ordering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Gui,
    Rpc,
    Background,
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSource::Gui => f.write_str("gui"),
            MessageSource::Rpc => f.write_str("rpc"),
            MessageSource::Background => f.write_str("background"),
        }
    }
}

/// A deferred XRouter request. The request is re-signed on each attempt but
/// keeps its UUID, so whoever waits on the reply is not affected by the move.
pub struct QueueItem {
    original_peer: Arc<PeerConnection>,
    new_peer: Option<Arc<PeerConnection>>,
    command: XRouterCommand,
    body: XRouterBody,
    uuid: Option<String>,
    source: MessageSource,
    created: Instant,
    waiter: Option<ReplyWaiter>,
}

impl QueueItem {
    pub fn new(
        original_peer: Arc<PeerConnection>,
        command: XRouterCommand,
        body: XRouterBody,
        uuid: Option<String>,
        source: MessageSource,
        waiter: Option<ReplyWaiter>,
    ) -> QueueItem {
        QueueItem {
            original_peer,
            new_peer: None,
            command,
            body,
            uuid,
            source,
            created: Instant::now(),
            waiter,
        }
    }

    /// Re-home a request that was already registered on a dead peer.
    pub fn from_pending(
        original_peer: Arc<PeerConnection>,
        message: XRouterMessage,
        source: MessageSource,
        waiter: Option<ReplyWaiter>,
    ) -> QueueItem {
        let uuid = Some(message.uuid().to_string());
        QueueItem::new(
            original_peer,
            message.command(),
            message.body().clone(),
            uuid,
            source,
            waiter,
        )
    }

    pub fn original_peer(&self) -> &Arc<PeerConnection> {
        &self.original_peer
    }

    pub fn new_peer(&self) -> Option<&Arc<PeerConnection>> {
        self.new_peer.as_ref()
    }

    pub fn set_new_peer(&mut self, peer: Arc<PeerConnection>) {
        self.new_peer = Some(peer);
    }

    pub fn command(&self) -> XRouterCommand {
        self.command
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn source(&self) -> MessageSource {
        self.source
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.age() >= expiry
    }

    /// Build the signed request for one attempt. The first attempt fixes the
    /// UUID for all later ones.
    pub fn message(&mut self, keypair: &Keypair) -> Result<XRouterMessage> {
        let message = XRouterMessage::new_signed(
            self.command,
            self.uuid.clone(),
            self.body.clone(),
            keypair,
            unix_seconds(),
        )?;
        self.uuid = Some(message.uuid().to_string());
        Ok(message)
    }

    pub fn take_waiter(&mut self) -> Option<ReplyWaiter> {
        self.waiter.take()
    }

    pub fn restore_waiter(&mut self, waiter: Option<ReplyWaiter>) {
        self.waiter = waiter;
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("command", &self.command)
            .field("uuid", &self.uuid)
            .field("source", &self.source)
            .field("peer", &self.original_peer.seed().address())
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::seed::Seed;
    use crate::networking::xrouter::FREE_PAYMENT;
    use crate::settings::NetworkSettings;
    use tokio::sync::mpsc;

    fn peer() -> Arc<PeerConnection> {
        let (sender, _events) = mpsc::unbounded_channel();
        PeerConnection::new(
            Arc::new(Seed::new("127.0.0.1", 1)),
            Arc::new(NetworkSettings::default()),
            Arc::new(Keypair::new()),
            sender,
        )
    }

    fn block_count() -> XRouterBody {
        XRouterBody::Query {
            currency: "BLOCK".into(),
            payment: FREE_PAYMENT.into(),
            params: vec![],
        }
    }

    #[test]
    fn uuid_is_kept_across_attempts_test() {
        let keypair = Keypair::new();
        let mut item = QueueItem::new(
            peer(),
            XRouterCommand::GetBlockCount,
            block_count(),
            None,
            MessageSource::Rpc,
            None,
        );
        let first = item.message(&keypair).unwrap();
        let second = item.message(&keypair).unwrap();
        assert_eq!(first.uuid(), second.uuid());
        assert!(second.verify_signature().is_ok());
    }

    #[test]
    fn from_pending_keeps_custom_uuid_test() {
        let keypair = Keypair::new();
        let original = XRouterMessage::new_signed(
            XRouterCommand::GetBlockCount,
            Some("custom-uuid".into()),
            block_count(),
            &keypair,
            0,
        )
        .unwrap();
        let mut item = QueueItem::from_pending(peer(), original, MessageSource::Background, None);
        assert_eq!(item.uuid(), Some("custom-uuid"));
        assert_eq!(item.message(&keypair).unwrap().uuid(), "custom-uuid");
        assert_eq!(item.source(), MessageSource::Background);
    }

    #[test]
    fn expiry_test() {
        let item = QueueItem::new(
            peer(),
            XRouterCommand::GetBlockCount,
            block_count(),
            None,
            MessageSource::Gui,
            None,
        );
        assert!(!item.is_expired(Duration::from_secs(120)));
        assert!(item.is_expired(Duration::from_secs(0)));
    }
}
