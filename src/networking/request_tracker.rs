use ahash::AHashMap;
use tokio::sync::oneshot;

use crate::networking::xrouter::XRouterMessage;
use crate::time::create_timestamp;
use crate::{Error, Result};

/// Resolved with the reply once it arrives.
pub type ReplyWaiter = oneshot::Sender<XRouterMessage>;

#[derive(Debug)]
pub struct PendingRequest {
    message: XRouterMessage,
    created: u64,
    waiter: Option<ReplyWaiter>,
}

impl PendingRequest {
    pub fn message(&self) -> &XRouterMessage {
        &self.message
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn into_parts(self) -> (XRouterMessage, Option<ReplyWaiter>) {
        (self.message, self.waiter)
    }
}

/// A reply matched to the request it answers.
#[derive(Debug)]
pub struct MatchedReply {
    pub original: XRouterMessage,
    pub waiter: Option<ReplyWaiter>,
}

/// Outstanding XRouter requests of one connection, keyed by UUID.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: AHashMap<String, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        RequestTracker {
            pending: AHashMap::new(),
        }
    }

    /// Must happen before the request bytes go out.
    pub fn register(&mut self, message: XRouterMessage, waiter: Option<ReplyWaiter>) -> Result<()> {
        let uuid = message.uuid().to_string();
        if self.pending.contains_key(&uuid) {
            return Err(Error::Protocol(format!("duplicate request uuid {}", uuid)));
        }
        self.pending.insert(
            uuid,
            PendingRequest {
                message,
                created: create_timestamp(),
                waiter,
            },
        );
        Ok(())
    }

    /// Remove the entry a reply answers. An unknown UUID leaves the tracker untouched.
    pub fn take(&mut self, uuid: &str) -> Result<MatchedReply> {
        match self.pending.remove(uuid) {
            Some(pending) => Ok(MatchedReply {
                original: pending.message,
                waiter: pending.waiter,
            }),
            None => Err(Error::Protocol(format!("Unexpected UUID {}", uuid))),
        }
    }

    /// Drop a registration whose request never made it onto the wire.
    pub fn forget(&mut self, uuid: &str) -> Option<PendingRequest> {
        self.pending.remove(uuid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.pending.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove entries created before `cutoff` (ms).
    pub fn expire(&mut self, cutoff: u64) -> Vec<PendingRequest> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.created < cutoff)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        expired
            .iter()
            .filter_map(|uuid| self.pending.remove(uuid))
            .collect()
    }

    /// Hand every outstanding request over, e.g. when the connection dies.
    pub fn drain(&mut self) -> Vec<(XRouterMessage, Option<ReplyWaiter>)> {
        self.pending
            .drain()
            .map(|(_, pending)| (pending.message, pending.waiter))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::networking::xrouter::{XRouterBody, XRouterCommand, FREE_PAYMENT};

    fn request(keypair: &Keypair) -> XRouterMessage {
        XRouterMessage::new_signed(
            XRouterCommand::GetBlockCount,
            None,
            XRouterBody::Query {
                currency: "LTC".into(),
                payment: FREE_PAYMENT.into(),
                params: vec![],
            },
            keypair,
            0,
        )
        .unwrap()
    }

    #[test]
    fn reply_matches_once_test() {
        let keypair = Keypair::new();
        let mut tracker = RequestTracker::new();
        let message = request(&keypair);
        let uuid = message.uuid().to_string();
        tracker.register(message.clone(), None).unwrap();
        assert!(tracker.register(message.clone(), None).is_err());
        assert_eq!(tracker.len(), 1);

        let matched = tracker.take(&uuid).unwrap();
        assert_eq!(matched.original, message);
        assert!(tracker.is_empty());
        assert!(matches!(tracker.take(&uuid), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_uuid_leaves_state_test() {
        let keypair = Keypair::new();
        let mut tracker = RequestTracker::new();
        tracker.register(request(&keypair), None).unwrap();
        tracker.register(request(&keypair), None).unwrap();

        assert!(tracker.take("00000000-0000-0000-0000-000000000000").is_err());
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn waiter_receives_reply_test() {
        let keypair = Keypair::new();
        let mut tracker = RequestTracker::new();
        let message = request(&keypair);
        let (sender, receiver) = oneshot::channel();
        tracker.register(message.clone(), Some(sender)).unwrap();

        let matched = tracker.take(message.uuid()).unwrap();
        matched.waiter.unwrap().send(message.clone()).unwrap();
        assert_eq!(receiver.await.unwrap(), message);
    }

    #[test]
    fn expire_and_drain_test() {
        let keypair = Keypair::new();
        let mut tracker = RequestTracker::new();
        tracker.register(request(&keypair), None).unwrap();
        assert!(tracker.expire(0).is_empty());
        assert_eq!(tracker.expire(u64::MAX).len(), 1);

        tracker.register(request(&keypair), None).unwrap();
        assert_eq!(tracker.drain().len(), 1);
        assert!(tracker.is_empty());
    }
}
