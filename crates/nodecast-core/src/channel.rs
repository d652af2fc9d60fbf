//! Channel: a named value cell with broadcast-on-change.
//!
//! A channel's value and its subscriber set share one lock. `set` holds it
//! across the commit and the whole broadcast, so no other handler can observe
//! the new value before every current subscriber has been handed the update.
//! Delivery itself never blocks: subscribers enqueue onto their own outbound
//! queue and report back if that queue is full or closed.
//!
//! A channel replaced by a migration is retired: it keeps a link to its
//! successor and forwards every later read, write, and (un)watch there, so a
//! handler holding a stale `Arc<Channel>` still acts on the live value.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::ids::{ChannelId, NodeId, SubscriberId};

/// Why a single delivery to a subscriber did not go through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber's outbound queue is full.
    #[error("outbound queue full")]
    Full,
    /// The subscriber has disconnected.
    #[error("subscriber closed")]
    Closed,
}

/// A value change as seen by a subscriber.
#[derive(Clone, Copy, Debug)]
pub struct ChannelUpdate<'a> {
    /// Channel that changed.
    pub channel_id: &'a ChannelId,
    /// Current value.
    pub data: &'a Value,
}

/// Receiver side of a channel subscription.
///
/// Implemented by protocol clients. `deliver` must not block and must not
/// call back into any channel.
pub trait ChannelSubscriber: Send + Sync {
    /// Stable identity used for de-duplication and removal.
    fn subscriber_id(&self) -> SubscriberId;

    /// Hand an update to the subscriber. `request_id` correlates the push
    /// with the watch request that created the subscription.
    fn deliver(&self, update: ChannelUpdate<'_>, request_id: Option<u64>)
    -> Result<(), DeliveryError>;

    /// The channel dropped this subscriber on its own, e.g. because its node
    /// was removed. Called without the channel lock held.
    fn detached(&self, _channel_id: &ChannelId) {}
}

/// Whether the client that changed a channel also receives the broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    /// The originating client is skipped.
    #[default]
    ExcludeOrigin,
    /// Every subscriber receives the update, including the originator.
    IncludeOrigin,
}

impl EchoPolicy {
    /// Subscriber to skip when `origin` changes a channel.
    pub fn exclusion(self, origin: SubscriberId) -> Option<SubscriberId> {
        match self {
            Self::ExcludeOrigin => Some(origin),
            Self::IncludeOrigin => None,
        }
    }
}

impl std::str::FromStr for EchoPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude_origin" => Ok(Self::ExcludeOrigin),
            "include_origin" => Ok(Self::IncludeOrigin),
            other => Err(format!("unknown echo policy: {other}")),
        }
    }
}

/// Outcome of a single broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers that accepted the update.
    pub delivered: usize,
    /// Subscribers whose delivery failed.
    pub failed: usize,
    /// Subscribers skipped by the echo policy.
    pub skipped: usize,
}

struct Subscription {
    subscriber: Arc<dyn ChannelSubscriber>,
    request_id: Option<u64>,
}

struct ChannelState {
    data: Value,
    /// Insertion-ordered, never contains the same subscriber twice.
    subscribers: Vec<Subscription>,
    /// Bumped by every `set`.
    version: u64,
    /// Set once this channel has been retired by a migration.
    successor: Option<Arc<Channel>>,
}

/// A named, mutable value owned by exactly one node.
pub struct Channel {
    id: ChannelId,
    node_id: NodeId,
    name: String,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Create a channel named `name` on `node_id` holding `data`.
    pub fn new(node_id: &NodeId, name: impl Into<String>, data: Value) -> Self {
        let name = name.into();
        Self {
            id: ChannelId::scoped(node_id, &name),
            node_id: node_id.clone(),
            name,
            state: Mutex::new(ChannelState {
                data,
                subscribers: Vec::new(),
                version: 0,
                successor: None,
            }),
        }
    }

    /// Globally unique id.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Owning node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Name, unique within the owning node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn data(&self) -> Value {
        match self.live() {
            Ok(state) => state.data.clone(),
            Err(next) => next.data(),
        }
    }

    /// Number of writes this channel instance has committed.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Whether a migration replaced this channel.
    pub fn is_retired(&self) -> bool {
        self.state.lock().successor.is_some()
    }

    /// Lock the state, or hand back the channel that replaced this one.
    fn live(&self) -> Result<MutexGuard<'_, ChannelState>, Arc<Self>> {
        let state = self.state.lock();
        if let Some(next) = state.successor.clone() {
            return Err(next);
        }
        Ok(state)
    }

    /// Replace the value and broadcast it to every subscriber except
    /// `exclude`.
    ///
    /// The new value is committed before any delivery is attempted; a failed
    /// delivery is counted and logged but never rolls the value back.
    pub fn set(&self, data: Value, exclude: Option<SubscriberId>) -> BroadcastReport {
        let mut state = match self.live() {
            Ok(state) => state,
            Err(next) => return next.set(data, exclude),
        };
        state.data = data;
        state.version += 1;

        let mut report = BroadcastReport::default();
        let update = ChannelUpdate {
            channel_id: &self.id,
            data: &state.data,
        };
        for sub in &state.subscribers {
            let sub_id = sub.subscriber.subscriber_id();
            if Some(sub_id) == exclude {
                report.skipped += 1;
                continue;
            }
            match sub.subscriber.deliver(update, sub.request_id) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(channel_id = %self.id, subscriber = %sub_id, error = %e, "channel update not delivered");
                }
            }
        }
        debug!(
            channel_id = %self.id,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "channel set"
        );
        report
    }

    /// Subscribe and immediately send the current value as a snapshot.
    ///
    /// Re-watching is a no-op for the subscriber set (the first watch's
    /// `request_id` is kept) but still sends a snapshot. Returns `true` if the
    /// subscriber was newly added.
    pub fn watch(&self, subscriber: Arc<dyn ChannelSubscriber>, request_id: Option<u64>) -> bool {
        let mut state = match self.live() {
            Ok(state) => state,
            Err(next) => return next.watch(subscriber, request_id),
        };
        let sub_id = subscriber.subscriber_id();
        let added = !state
            .subscribers
            .iter()
            .any(|s| s.subscriber.subscriber_id() == sub_id);

        let update = ChannelUpdate {
            channel_id: &self.id,
            data: &state.data,
        };
        if let Err(e) = subscriber.deliver(update, request_id) {
            warn!(channel_id = %self.id, subscriber = %sub_id, error = %e, "snapshot not delivered");
        }

        if added {
            state.subscribers.push(Subscription {
                subscriber,
                request_id,
            });
        }
        added
    }

    /// Remove a subscriber. Returns `true` if it was subscribed.
    pub fn unwatch(&self, subscriber: SubscriberId) -> bool {
        let mut state = match self.live() {
            Ok(state) => state,
            Err(next) => return next.unwatch(subscriber),
        };
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|s| s.subscriber.subscriber_id() != subscriber);
        state.subscribers.len() != before
    }

    /// Whether `subscriber` is currently watching.
    pub fn is_watched_by(&self, subscriber: SubscriberId) -> bool {
        match self.live() {
            Ok(state) => state
                .subscribers
                .iter()
                .any(|s| s.subscriber.subscriber_id() == subscriber),
            Err(next) => next.is_watched_by(subscriber),
        }
    }

    /// Subscriber ids in broadcast order.
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.state
            .lock()
            .subscribers
            .iter()
            .map(|s| s.subscriber.subscriber_id())
            .collect()
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscriber and tell each one. Returns how many were removed.
    pub fn clear_subscribers(&self) -> usize {
        let drained = std::mem::take(&mut self.state.lock().subscribers);
        for sub in &drained {
            sub.subscriber.detached(&self.id);
        }
        drained.len()
    }

    /// Retire this channel in favor of `successor`.
    ///
    /// Subscribers move over keeping their order and watch request ids;
    /// those already on `successor` are not duplicated. If this channel was
    /// written after it reached `seen_version`, its value is carried over
    /// as well. Afterwards every operation on this channel is forwarded to
    /// `successor`.
    pub fn hand_over_to(&self, successor: &Arc<Self>, seen_version: u64) -> usize {
        let mut state = self.state.lock();
        let mut next = successor.state.lock();
        if state.version != seen_version {
            next.data = state.data.clone();
            next.version += 1;
        }
        let drained = std::mem::take(&mut state.subscribers);
        state.successor = Some(Arc::clone(successor));
        let mut moved = 0;
        for sub in drained {
            let sub_id = sub.subscriber.subscriber_id();
            if next
                .subscribers
                .iter()
                .all(|s| s.subscriber.subscriber_id() != sub_id)
            {
                next.subscribers.push(sub);
                moved += 1;
            }
        }
        moved
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}
