//! Typed notification feeds.
//!
//! One broadcast channel per inbound result kind plus a lifecycle feed.
//! Subscribing returns a receiver; dropping it unsubscribes. The router
//! publishes only after the caches have been updated, so a subscriber that
//! reads a cache on notification sees the new state.

use tokio::sync::broadcast;

use delve_net::messages::{
    AdCountUpdate, Currency, GemDiscardResult, GemEquipResult, GemProducedResult, GemRecord,
    InstanceId, MilestoneClaimResult, MissionClaimResult, MissionProgress, MissionRerollResult,
    SlotResult,
};
use delve_net::transport::DisconnectReason;

const FEED_CAPACITY: usize = 64;

/// Lifecycle events, with distinct human-readable reasons.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The handshake succeeded and the caches hold the initial state.
    Authenticated,
    /// The server refused the credentials.
    AuthenticationFailed(String),
    /// The connection ended.
    Disconnected(DisconnectReason),
    /// The server reported an error outside any result message.
    ServerError { code: u32, message: String },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Authenticated => write!(f, "signed in"),
            SessionEvent::AuthenticationFailed(reason) => write!(f, "sign-in rejected: {reason}"),
            SessionEvent::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            SessionEvent::ServerError { code, message } => {
                write!(f, "server error {code}: {message}")
            }
        }
    }
}

/// A result whose consumed ids were recovered from the correlation tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlated<T> {
    pub result: T,
    /// Ids recorded when the request was sent. Empty if none were pending.
    pub consumed: Vec<InstanceId>,
}

/// Single-kind broadcast feed.
#[derive(Debug)]
pub struct Feed<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Feed<T> {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to current subscribers. No subscribers is not an error.
    pub(crate) fn publish(&self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Every feed the client publishes.
#[derive(Debug)]
pub struct Notifications {
    pub session: Feed<SessionEvent>,
    pub currency: Feed<Currency>,
    pub server_time: Feed<u64>,
    /// Upgrade, unlock and sub-slot unlock outcomes.
    pub slot_results: Feed<SlotResult>,
    pub slots_changed: Feed<()>,
    pub gems_granted: Feed<Vec<GemRecord>>,
    pub gems_changed: Feed<()>,
    pub gem_equip: Feed<GemEquipResult>,
    pub gem_synthesis: Feed<Correlated<GemProducedResult>>,
    pub gem_discard: Feed<Correlated<GemDiscardResult>>,
    pub gem_conversion: Feed<Correlated<GemProducedResult>>,
    pub missions_changed: Feed<()>,
    pub mission_progress: Feed<MissionProgress>,
    pub mission_claim: Feed<MissionClaimResult>,
    pub mission_reroll: Feed<MissionRerollResult>,
    pub milestone_claim: Feed<MilestoneClaimResult>,
    pub ad_count: Feed<AdCountUpdate>,
}

impl Notifications {
    pub fn new() -> Self {
        Self {
            session: Feed::new(),
            currency: Feed::new(),
            server_time: Feed::new(),
            slot_results: Feed::new(),
            slots_changed: Feed::new(),
            gems_granted: Feed::new(),
            gems_changed: Feed::new(),
            gem_equip: Feed::new(),
            gem_synthesis: Feed::new(),
            gem_discard: Feed::new(),
            gem_conversion: Feed::new(),
            missions_changed: Feed::new(),
            mission_progress: Feed::new(),
            mission_claim: Feed::new(),
            mission_reroll: Feed::new(),
            milestone_claim: Feed::new(),
            ad_count: Feed::new(),
        }
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let feeds = Notifications::new();
        feeds.session.publish(SessionEvent::Authenticated);
        assert_eq!(feeds.session.subscriber_count(), 0);
    }

    #[test]
    fn test_each_subscriber_gets_every_event() {
        let feeds = Notifications::new();
        let mut a = feeds.currency.subscribe();
        let mut b = feeds.currency.subscribe();

        feeds.currency.publish(Currency { gold: 1, crystal: 0 });
        assert_eq!(a.try_recv().unwrap().gold, 1);
        assert_eq!(b.try_recv().unwrap().gold, 1);
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let feeds = Notifications::new();
        let rx = feeds.slots_changed.subscribe();
        assert_eq!(feeds.slots_changed.subscriber_count(), 1);
        drop(rx);
        assert_eq!(feeds.slots_changed.subscriber_count(), 0);
    }

    #[test]
    fn test_session_event_messages_are_distinct() {
        let rejected = SessionEvent::AuthenticationFailed("bad token".into()).to_string();
        let lost = SessionEvent::Disconnected(DisconnectReason::RemoteClosed).to_string();
        assert!(rejected.contains("bad token"));
        assert!(lost.starts_with("disconnected"));
        assert_ne!(rejected, lost);
    }
}
