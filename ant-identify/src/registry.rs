// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::host::Connection;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{watch, RwLock};

/// Stable identity of a transport connection, as assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Whether the remote end of a connection handles identify pushes. Resolved
/// from the peer store once the first identify on the connection completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSupport {
    Unknown,
    Supported,
    Unsupported,
}

/// Handle onto the one-shot completion of a connection's first identify
/// exchange. Any number of clones observe the same resolution; the outcome
/// itself travels on the event channel.
#[derive(Debug, Clone)]
pub struct IdentifyWaiter {
    done: watch::Receiver<bool>,
}

impl IdentifyWaiter {
    fn new(done: watch::Receiver<bool>) -> Self {
        Self { done }
    }

    fn resolved() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { done: rx }
    }

    pub fn is_resolved(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the identify exchange on the connection finishes, one way
    /// or the other.
    pub async fn wait(mut self) {
        // A dropped sender means the registry went away during teardown;
        // either way the wait is over.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

/// Identify state of one active connection.
pub(crate) struct ConnectionEntry {
    conn: Arc<dyn Connection>,
    /// Created lazily by the first waiter; transitions false -> true once.
    wait: Option<watch::Sender<bool>>,
    push_support: PushSupport,
    /// Timestamp of the snapshot last pushed over this connection.
    last_push: u64,
}

impl ConnectionEntry {
    fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            wait: None,
            push_support: PushSupport::Unknown,
            last_push: 0,
        }
    }

    pub(crate) fn resolve(&self) {
        if let Some(wait) = &self.wait {
            let _ = wait.send_replace(true);
        }
    }
}

/// Thread-safe map from connection id to identify state. An entry exists
/// exactly while the swarm considers the connection open.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub(crate) async fn insert(&self, conn: Arc<dyn Connection>) {
        let mut connections = self.connections.write().await;
        connections
            .entry(conn.id())
            .or_insert_with(|| ConnectionEntry::new(conn));
    }

    pub(crate) async fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.write().await.remove(&id)
    }

    /// The wait handle for a connection, creating it on first use. For an
    /// unknown connection (presumed closed) an already-resolved handle is
    /// returned, keeping waits total. The second element is true iff this
    /// call created the handle, i.e. the caller is the first waiter.
    pub(crate) async fn wait_handle(&self, id: ConnectionId) -> (IdentifyWaiter, bool) {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(&id) else {
            return (IdentifyWaiter::resolved(), false);
        };
        match &entry.wait {
            Some(wait) => (IdentifyWaiter::new(wait.subscribe()), false),
            None => {
                let (tx, rx) = watch::channel(false);
                entry.wait = Some(tx);
                (IdentifyWaiter::new(rx), true)
            }
        }
    }

    /// Resolve the connection's wait handle, if one was ever created. A
    /// no-op for entries already removed: their handle was resolved on
    /// removal.
    pub(crate) async fn resolve(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.read().await.get(&id) {
            entry.resolve();
        }
    }

    pub(crate) async fn set_push_support(&self, id: ConnectionId, support: PushSupport) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.push_support = support;
        }
    }

    pub(crate) async fn set_last_push(&self, id: ConnectionId, timestamp: u64) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.last_push = timestamp;
        }
    }

    /// Connections eligible for a push of the snapshot stamped `timestamp`:
    /// still live, not known to lack push support, and not already at (or
    /// past) that snapshot.
    pub(crate) async fn push_targets(&self, timestamp: u64) -> Vec<Arc<dyn Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| {
                entry.push_support != PushSupport::Unsupported && entry.last_push < timestamp
            })
            .map(|entry| entry.conn.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConnection;
    use libp2p::PeerId;

    fn connection(id: u64) -> Arc<TestConnection> {
        TestConnection::new(
            id,
            PeerId::random(),
            PeerId::random(),
            "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/4002".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn unknown_connection_yields_resolved_handle() {
        let registry = ConnectionRegistry::default();
        let (waiter, created) = registry.wait_handle(ConnectionId::new(7)).await;
        assert!(!created);
        assert!(waiter.is_resolved());
        waiter.wait().await;
    }

    #[tokio::test]
    async fn only_the_first_waiter_creates_the_handle() {
        let registry = ConnectionRegistry::default();
        let conn = connection(1);
        registry.insert(conn.clone()).await;

        let (first, first_created) = registry.wait_handle(conn.id()).await;
        let (second, second_created) = registry.wait_handle(conn.id()).await;
        assert!(first_created);
        assert!(!second_created);
        assert!(!first.is_resolved());

        registry.resolve(conn.id()).await;
        first.wait().await;
        second.wait().await;
    }

    #[tokio::test]
    async fn waiters_observe_resolution_after_removal() {
        let registry = ConnectionRegistry::default();
        let conn = connection(1);
        registry.insert(conn.clone()).await;

        let (waiter, _) = registry.wait_handle(conn.id()).await;
        let entry = registry.remove(conn.id()).await.expect("entry should exist");
        assert_eq!(registry.len().await, 0);
        entry.resolve();
        waiter.wait().await;
    }

    #[tokio::test]
    async fn push_targets_filter_on_support_and_timestamp() {
        let registry = ConnectionRegistry::default();
        let supported = connection(1);
        let unsupported = connection(2);
        let already_pushed = connection(3);
        for conn in [&supported, &unsupported, &already_pushed] {
            registry.insert(conn.clone()).await;
        }
        registry
            .set_push_support(unsupported.id(), PushSupport::Unsupported)
            .await;
        registry.set_last_push(already_pushed.id(), 42).await;

        let targets = registry.push_targets(42).await;
        let ids: Vec<_> = targets.iter().map(|conn| conn.id()).collect();
        assert_eq!(ids, vec![supported.id()]);

        // A newer snapshot makes the already-pushed connection eligible again.
        let targets = registry.push_targets(43).await;
        assert_eq!(targets.len(), 2);
    }
}
