//! Live set of connected clients, shared by both listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nodecast_core::SubscriberId;
use nodecast_rpc::Client;
use tokio::sync::RwLock;

/// Clients indexed by id, plus the connection-limit accounting.
///
/// A slot is reserved at accept time, before the session starts, so the
/// limit holds across both listeners even while upgrades are in flight.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: RwLock<HashMap<SubscriberId, Arc<Client>>>,
    reserved: Arc<AtomicUsize>,
}

/// A held connection slot. Released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    reserved: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ClientSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot unless `max` are already held.
    pub fn try_reserve(&self, max: usize) -> Option<ConnectionSlot> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                reserved: Arc::clone(&self.reserved),
            })
    }

    /// Slots currently held, including connections still handshaking.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Add a client.
    pub async fn add(&self, client: Arc<Client>) {
        let mut clients = self.clients.write().await;
        let _ = clients.insert(client.id(), client);
    }

    /// Remove a client by id.
    pub async fn remove(&self, id: SubscriberId) -> Option<Arc<Client>> {
        self.clients.write().await.remove(&id)
    }

    /// Look up a client by id.
    pub async fn get(&self, id: SubscriberId) -> Option<Arc<Client>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Number of registered clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ids of all registered clients, ascending.
    pub async fn ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self.clients.read().await.keys().copied().collect();
        ids.sort_unstable_by_key(|id| id.0);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client(id: u64) -> Arc<Client> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(Client::new(SubscriberId(id), tx))
    }

    #[tokio::test]
    async fn add_get_remove() {
        let set = ClientSet::new();
        set.add(client(2)).await;
        set.add(client(1)).await;
        assert_eq!(set.count().await, 2);
        assert_eq!(set.ids().await, vec![SubscriberId(1), SubscriberId(2)]);
        assert!(set.get(SubscriberId(1)).await.is_some());

        assert!(set.remove(SubscriberId(1)).await.is_some());
        assert!(set.remove(SubscriberId(1)).await.is_none());
        assert!(set.get(SubscriberId(1)).await.is_none());
        assert_eq!(set.count().await, 1);
    }

    #[test]
    fn slots_enforce_limit_and_release_on_drop() {
        let set = ClientSet::new();
        let a = set.try_reserve(2).unwrap();
        let _b = set.try_reserve(2).unwrap();
        assert!(set.try_reserve(2).is_none());
        assert_eq!(set.reserved(), 2);

        drop(a);
        assert_eq!(set.reserved(), 1);
        assert!(set.try_reserve(2).is_some());
    }

    #[test]
    fn zero_limit_refuses_everything() {
        let set = ClientSet::new();
        assert!(set.try_reserve(0).is_none());
    }
}
