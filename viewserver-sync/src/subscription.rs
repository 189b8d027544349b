//! Subscription registry: view ↔ subscriber handle mapping and fan-out.
//!
//! ```text
//!  by_handle                      by_view
//! ┌──────────┬────────┐          ┌────────┬──────────────────────┐
//! │ handle A │ view 1 │          │ view 1 │ { A, B }             │
//! │ handle B │ view 1 │   ◄────► │ view 2 │ { C }                │
//! │ handle C │ view 2 │          └────────┴──────────────────────┘
//! └──────────┴────────┘
//! ```
//!
//! A handle belongs to at most one view at a time. Both indexes are sharded
//! concurrent maps; mutations always lock `by_handle` before `by_view` so the
//! two never deadlock and stay consistent with each other.
//!
//! Broadcast copies the subscriber set out of the shard before sending, so
//! concurrent subscribe/unsubscribe never pauses a fan-out pass and a
//! fan-out pass never observes a half-applied mutation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use viewserver_core::ViewId;

use crate::error::TransportError;
use crate::protocol::Payload;

/// Opaque identity of a connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the core needs from a connection: identity, send, liveness.
///
/// `send` must not block; a transport that cannot accept a payload right
/// away should fail with a [`TransportError`] instead.
pub trait SubscriberHandle: Send + Sync {
    fn id(&self) -> HandleId;
    fn send(&self, payload: Payload) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
}

/// Result of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_handles: usize,
    pub active_views: usize,
    pub total_subscriptions: usize,
    pub messages_sent: u64,
    pub messages_failed: u64,
}

type SubscriberSet = HashMap<HandleId, Arc<dyn SubscriberHandle>>;

/// Maps views to their subscribers and handles to their view.
pub struct SubscriptionRegistry {
    by_view: DashMap<ViewId, SubscriberSet>,
    by_handle: DashMap<HandleId, ViewId>,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            by_view: DashMap::new(),
            by_handle: DashMap::new(),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
        }
    }

    /// Subscribe `handle` to `view`, replacing any prior subscription.
    ///
    /// Subscribing a handle to the view it already watches is a no-op.
    pub fn subscribe(&self, view: &ViewId, handle: Arc<dyn SubscriberHandle>) {
        let id = handle.id();
        match self.by_handle.entry(id) {
            Entry::Occupied(mut current) => {
                if current.get() == view {
                    return;
                }
                let previous = current.insert(view.clone());
                self.remove_from_view(&previous, &id);
                self.by_view.entry(view.clone()).or_default().insert(id, handle);
                log::info!("Handle {id} moved from view {previous} to view {view}");
            }
            Entry::Vacant(slot) => {
                self.by_view.entry(view.clone()).or_default().insert(id, handle);
                slot.insert(view.clone());
                log::info!("Handle {id} subscribed to view {view}");
            }
        }
    }

    /// Remove `id` from whichever view it watches.
    ///
    /// Returns the view it was removed from; a second call returns `None`.
    pub fn unsubscribe(&self, id: &HandleId) -> Option<ViewId> {
        match self.by_handle.entry(*id) {
            Entry::Occupied(current) => {
                let view = current.remove();
                self.remove_from_view(&view, id);
                log::info!("Handle {id} unsubscribed from view {view}");
                Some(view)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Remove `id` only while it is still subscribed to `view`.
    ///
    /// A handle that has since moved to another view keeps that
    /// subscription. Returns whether anything was removed.
    pub fn unsubscribe_from(&self, id: &HandleId, view: &ViewId) -> bool {
        if self.by_handle.remove_if(id, |_, current| current == view).is_none() {
            return false;
        }
        self.remove_from_view(view, id);
        log::info!("Handle {id} unsubscribed from view {view}");
        true
    }

    /// Drop `id` from the set of `view`, removing the set once empty.
    fn remove_from_view(&self, view: &ViewId, id: &HandleId) {
        let now_empty = match self.by_view.get_mut(view) {
            Some(mut set) => {
                set.remove(id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_view.remove_if(view, |_, set| set.is_empty());
        }
    }

    /// Send `payload` once to every current subscriber of `view`.
    ///
    /// A closed handle or failed send unsubscribes only that handle, and
    /// only from `view`; the pass continues with the rest. No retries.
    pub fn broadcast(&self, view: &ViewId, payload: &Payload) -> BroadcastOutcome {
        let targets = self.subscribers(view);
        if targets.is_empty() {
            log::trace!("No subscribers for view {view}");
            return BroadcastOutcome::default();
        }

        let mut outcome = BroadcastOutcome::default();
        for handle in targets {
            let result = if handle.is_open() {
                handle.send(payload.clone())
            } else {
                Err(TransportError::Closed(handle.id()))
            };
            match result {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    log::warn!("Failed to send to handle {} on view {view}: {e}", handle.id());
                    self.unsubscribe_from(&handle.id(), view);
                    outcome.failed += 1;
                }
            }
        }

        self.messages_sent.fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.messages_failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        log::debug!(
            "Broadcast to view {view}: {} successful, {} failed",
            outcome.sent,
            outcome.failed
        );
        outcome
    }

    /// Stable copy of the subscriber set of `view`.
    pub fn subscribers(&self, view: &ViewId) -> Vec<Arc<dyn SubscriberHandle>> {
        self.by_view
            .get(view)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, view: &ViewId) -> usize {
        self.by_view.get(view).map_or(0, |set| set.len())
    }

    pub fn view_of(&self, id: &HandleId) -> Option<ViewId> {
        self.by_handle.get(id).map(|v| v.clone())
    }

    pub fn is_subscribed(&self, id: &HandleId) -> bool {
        self.by_handle.contains_key(id)
    }

    pub fn active_views(&self) -> Vec<ViewId> {
        self.by_view.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_handles: self.by_handle.len(),
            active_views: self.by_view.len(),
            total_subscriptions: self.by_view.iter().map(|e| e.value().len()).sum(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ChannelHandle;
    use std::sync::atomic::AtomicBool;

    /// Handle whose sends always fail.
    struct BrokenHandle {
        id: HandleId,
    }

    impl SubscriberHandle for BrokenHandle {
        fn id(&self) -> HandleId {
            self.id
        }
        fn send(&self, _payload: Payload) -> Result<(), TransportError> {
            Err(TransportError::Closed(self.id))
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    /// Handle that reports closed but would accept sends.
    struct ClosedHandle {
        id: HandleId,
        touched: AtomicBool,
    }

    impl SubscriberHandle for ClosedHandle {
        fn id(&self) -> HandleId {
            self.id
        }
        fn send(&self, _payload: Payload) -> Result<(), TransportError> {
            self.touched.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_open(&self) -> bool {
            false
        }
    }

    fn payload(s: &str) -> Payload {
        Payload::from(s)
    }

    #[tokio::test]
    async fn test_subscribe_and_count() {
        let registry = SubscriptionRegistry::new();
        let view = ViewId::from("u_v");
        let (a, _rx_a) = ChannelHandle::new(8);
        let (b, _rx_b) = ChannelHandle::new(8);

        registry.subscribe(&view, a.clone());
        registry.subscribe(&view, b.clone());
        assert_eq!(registry.subscriber_count(&view), 2);
        assert_eq!(registry.view_of(&a.id()), Some(view.clone()));

        // Idempotent
        registry.subscribe(&view, a.clone());
        assert_eq!(registry.subscriber_count(&view), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_moves_handle() {
        let registry = SubscriptionRegistry::new();
        let v1 = ViewId::from("u_1");
        let v2 = ViewId::from("u_2");
        let (a, _rx) = ChannelHandle::new(8);

        registry.subscribe(&v1, a.clone());
        registry.subscribe(&v2, a.clone());

        assert_eq!(registry.subscriber_count(&v1), 0);
        assert_eq!(registry.subscriber_count(&v2), 1);
        assert_eq!(registry.view_of(&a.id()), Some(v2));
        // Empty view entries are collected.
        assert_eq!(registry.active_views().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let view = ViewId::from("u_v");
        let (a, _rx_a) = ChannelHandle::new(8);
        let (b, _rx_b) = ChannelHandle::new(8);
        registry.subscribe(&view, a.clone());
        registry.subscribe(&view, b.clone());

        assert_eq!(registry.unsubscribe(&a.id()), Some(view.clone()));
        assert_eq!(registry.subscriber_count(&view), 1);
        assert_eq!(registry.unsubscribe(&a.id()), None);
        assert_eq!(registry.subscriber_count(&view), 1);
        assert!(!registry.is_subscribed(&a.id()));
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let registry = SubscriptionRegistry::new();
        let view = ViewId::from("u_v");
        let (a, mut rx_a) = ChannelHandle::new(8);
        let (b, mut rx_b) = ChannelHandle::new(8);
        registry.subscribe(&view, a);
        registry.subscribe(&view, b);

        let outcome = registry.broadcast(&view, &payload("hello"));
        assert_eq!(outcome, BroadcastOutcome { sent: 2, failed: 0 });
        assert_eq!(&*rx_a.recv().await.unwrap(), "hello");
        assert_eq!(&*rx_b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_view() {
        let registry = SubscriptionRegistry::new();
        let outcome = registry.broadcast(&ViewId::from("nobody"), &payload("x"));
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn test_failed_send_removes_only_that_handle() {
        let registry = SubscriptionRegistry::new();
        let view = ViewId::from("u_v");
        let (good, mut rx) = ChannelHandle::new(8);
        let broken = Arc::new(BrokenHandle { id: HandleId::new() });
        registry.subscribe(&view, good.clone());
        registry.subscribe(&view, broken.clone());

        let outcome = registry.broadcast(&view, &payload("1"));
        assert_eq!(outcome, BroadcastOutcome { sent: 1, failed: 1 });
        assert_eq!(registry.subscriber_count(&view), 1);
        assert!(!registry.is_subscribed(&broken.id));
        assert!(registry.is_subscribed(&good.id()));
        assert_eq!(&*rx.recv().await.unwrap(), "1");

        let outcome = registry.broadcast(&view, &payload("2"));
        assert_eq!(outcome, BroadcastOutcome { sent: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_closed_handle_is_not_sent_to() {
        let registry = SubscriptionRegistry::new();
        let view = ViewId::from("u_v");
        let closed = Arc::new(ClosedHandle { id: HandleId::new(), touched: AtomicBool::new(false) });
        registry.subscribe(&view, closed.clone());

        let outcome = registry.broadcast(&view, &payload("x"));
        assert_eq!(outcome, BroadcastOutcome { sent: 0, failed: 1 });
        assert!(!closed.touched.load(Ordering::SeqCst));
        assert_eq!(registry.subscriber_count(&view), 0);
    }

    /// Handle that moves itself to another view and then fails the send,
    /// as a concurrent SUBSCRIBE racing a broadcast would.
    struct MovingHandle {
        id: HandleId,
        registry: Arc<SubscriptionRegistry>,
        target: ViewId,
        me: std::sync::Mutex<Option<Arc<dyn SubscriberHandle>>>,
    }

    impl SubscriberHandle for MovingHandle {
        fn id(&self) -> HandleId {
            self.id
        }
        fn send(&self, _payload: Payload) -> Result<(), TransportError> {
            if let Some(me) = self.me.lock().unwrap().take() {
                self.registry.subscribe(&self.target, me);
            }
            Err(TransportError::Backlogged(self.id))
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_from_ignores_other_view() {
        let registry = SubscriptionRegistry::new();
        let v1 = ViewId::from("u_1");
        let v2 = ViewId::from("u_2");
        let (a, _rx) = ChannelHandle::new(8);
        registry.subscribe(&v2, a.clone());

        assert!(!registry.unsubscribe_from(&a.id(), &v1));
        assert_eq!(registry.view_of(&a.id()), Some(v2.clone()));
        assert!(registry.unsubscribe_from(&a.id(), &v2));
        assert!(!registry.is_subscribed(&a.id()));
        assert_eq!(registry.subscriber_count(&v2), 0);
    }

    #[tokio::test]
    async fn test_failed_send_after_move_keeps_new_subscription() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let v1 = ViewId::from("u_1");
        let v2 = ViewId::from("u_2");
        let moving = Arc::new(MovingHandle {
            id: HandleId::new(),
            registry: registry.clone(),
            target: v2.clone(),
            me: std::sync::Mutex::new(None),
        });
        *moving.me.lock().unwrap() = Some(moving.clone() as Arc<dyn SubscriberHandle>);
        registry.subscribe(&v1, moving.clone());

        let outcome = registry.broadcast(&v1, &payload("x"));
        assert_eq!(outcome, BroadcastOutcome { sent: 0, failed: 1 });
        assert_eq!(registry.view_of(&moving.id), Some(v2.clone()));
        assert_eq!(registry.subscriber_count(&v2), 1);
        assert_eq!(registry.subscriber_count(&v1), 0);

        // Break the self-reference so the handle can drop.
        registry.unsubscribe(&moving.id);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = ChannelHandle::new(8);
        let (b, _rx_b) = ChannelHandle::new(8);
        let (c, _rx_c) = ChannelHandle::new(8);
        registry.subscribe(&ViewId::from("v1"), a);
        registry.subscribe(&ViewId::from("v1"), b);
        registry.subscribe(&ViewId::from("v2"), c);
        registry.broadcast(&ViewId::from("v1"), &payload("x"));

        let stats = registry.stats();
        assert_eq!(stats.active_handles, 3);
        assert_eq!(stats.active_views, 2);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_failed, 0);
    }

    #[test]
    fn test_concurrent_subscribe_unsubscribe_keeps_indexes_consistent() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let views: Vec<ViewId> = (0..4).map(|i| ViewId::from(format!("v{i}"))).collect();

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let views = views.clone();
                std::thread::spawn(move || {
                    let mut receivers = Vec::new();
                    for i in 0..50usize {
                        let (h, rx) = ChannelHandle::new(512);
                        receivers.push(rx);
                        registry.subscribe(&views[(t + i) % 4], h.clone());
                        registry.subscribe(&views[(t + i + 1) % 4], h.clone());
                        registry.broadcast(&views[i % 4], &Payload::from("tick"));
                        if i % 2 == 0 {
                            registry.unsubscribe(&h.id());
                        }
                    }
                    receivers
                })
            })
            .collect();
        // Keep receivers alive until every worker is done.
        let _receivers: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let stats = registry.stats();
        assert_eq!(stats.active_handles, 8 * 25);
        assert_eq!(stats.total_subscriptions, stats.active_handles);
    }
}
