//! Protocol endpoint bound to one connection.
//!
//! A `Client` knows nothing about the transport under it. Outbound envelopes
//! are numbered and pushed onto a bounded queue that the session's writer
//! drains; inbound envelopes reach the client through
//! [`crate::MethodRegistry::dispatch`].
//!
//! The client keeps its own index of watched channel ids, so tearing it down
//! costs one unwatch per subscription.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use nodecast_core::{
    Channel, ChannelId, ChannelSubscriber, ChannelUpdate, DeliveryError, NodeManager, SubscriberId,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::Envelope;

/// Method name of channel value pushes and read/watch answers.
pub const CHANNEL_UPDATE: &str = "nodeChannelUpdate";

/// Per-connection lifecycle. Moves forward only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, transport not yet confirmed.
    Connecting,
    /// Exchanging messages.
    Active,
    /// Terminal.
    Closed,
}

struct Inner {
    state: ClientState,
    subscriptions: HashSet<ChannelId>,
}

/// One connected protocol endpoint.
pub struct Client {
    id: SubscriberId,
    inner: Mutex<Inner>,
    /// Next outbound `id`. Held while enqueueing so envelopes leave in order.
    next_seq: Mutex<u64>,
    tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
    /// When this client was created.
    pub connected_at: Instant,
    /// Count of envelopes dropped because the queue was full.
    pub dropped_messages: AtomicU64,
}

impl Client {
    /// Create a client that writes to `tx`.
    pub fn new(id: SubscriberId, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                state: ClientState::Connecting,
                subscriptions: HashSet::new(),
            }),
            next_seq: Mutex::new(1),
            tx,
            closed: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Client identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Whether the client has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    /// `Connecting → Active`. Returns `false` in any other state.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ClientState::Connecting {
            inner.state = ClientState::Active;
            true
        } else {
            false
        }
    }

    /// Token cancelled when the client is destroyed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Number the next outbound envelope and queue it. Fire-and-forget:
    /// returns the assigned `id`, or why nothing was queued.
    pub fn send(
        &self,
        method: &str,
        params: Value,
        request_id: Option<u64>,
    ) -> Result<u64, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let mut seq = self.next_seq.lock();
        let id = *seq;
        match self.tx.try_send(Envelope::new(id, request_id, method, params)) {
            Ok(()) => {
                *seq += 1;
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Subscribe to `channel`; its current value is pushed right away with
    /// `request_id`. Returns `true` if the subscription is new.
    pub fn watch(
        self: &Arc<Self>,
        channel: &Channel,
        request_id: Option<u64>,
    ) -> Result<bool, DeliveryError> {
        {
            let mut inner = self.inner.lock();
            if inner.state == ClientState::Closed {
                return Err(DeliveryError::Closed);
            }
            let _ = inner.subscriptions.insert(channel.id().clone());
        }

        let subscriber: Arc<dyn ChannelSubscriber> = Arc::clone(self) as Arc<dyn ChannelSubscriber>;
        let added = channel.watch(subscriber, request_id);

        // Lost a race with destroy(); it may have missed this channel.
        if self.is_closed() {
            let _ = channel.unwatch(self.id);
            return Err(DeliveryError::Closed);
        }
        Ok(added)
    }

    /// Unsubscribe from `channel`. Returns `true` if it was watched.
    pub fn unwatch(&self, channel: &Channel) -> bool {
        let _ = self.inner.lock().subscriptions.remove(channel.id());
        channel.unwatch(self.id)
    }

    /// Drop `id` from the subscription index without touching any channel.
    /// Used when the channel no longer exists.
    pub fn forget(&self, id: &ChannelId) -> bool {
        self.inner.lock().subscriptions.remove(id)
    }

    /// Whether the subscription index holds `id`.
    pub fn is_watching(&self, id: &ChannelId) -> bool {
        self.inner.lock().subscriptions.contains(id)
    }

    /// Number of channels this client watches.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Close the client and remove it from every channel it watches.
    /// Idempotent; returns how many subscriptions were removed.
    pub fn destroy(&self, nodes: &NodeManager) -> usize {
        let subscriptions = {
            let mut inner = self.inner.lock();
            if inner.state == ClientState::Closed {
                return 0;
            }
            inner.state = ClientState::Closed;
            std::mem::take(&mut inner.subscriptions)
        };
        self.closed.cancel();

        let removed = subscriptions
            .iter()
            .filter_map(|id| nodes.channel(id).ok())
            .filter(|ch| ch.unwatch(self.id))
            .count();
        info!(
            client_id = %self.id,
            subscriptions_removed = removed,
            dropped_messages = self.drop_count(),
            "client destroyed"
        );
        removed
    }

    /// Total envelopes dropped for this client.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Client age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl ChannelSubscriber for Client {
    fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(
        &self,
        update: ChannelUpdate<'_>,
        request_id: Option<u64>,
    ) -> Result<(), DeliveryError> {
        let params = json!({ "channelId": update.channel_id, "data": update.data });
        match self.send(CHANNEL_UPDATE, params, request_id) {
            Ok(_) => Ok(()),
            Err(e) => {
                counter!("channel_broadcast_drops_total", "reason" => drop_reason(e)).increment(1);
                debug!(client_id = %self.id, channel_id = %update.channel_id, error = %e, "push dropped");
                Err(e)
            }
        }
    }

    fn detached(&self, channel_id: &ChannelId) {
        let _ = self.forget(channel_id);
    }
}

fn drop_reason(err: DeliveryError) -> &'static str {
    match err {
        DeliveryError::Full => "full",
        DeliveryError::Closed => "closed",
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
