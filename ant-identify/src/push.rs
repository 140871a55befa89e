// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    codec,
    driver::Inner,
    error::{Error, Result},
    host::Connection,
    snapshot::Snapshot,
    IDENTIFY_PUSH_PROTOCOL,
};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, sync::mpsc, time::timeout};

/// Deadline for opening and writing one outbound push stream.
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

impl Inner {
    /// Drains push triggers until shutdown. Each trigger runs one full cycle
    /// to completion, so a trigger queued while a cycle is in flight yields
    /// exactly one follow-up cycle.
    pub(crate) async fn push_worker(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = trigger.recv() => match received {
                    Some(()) => self.send_pushes().await,
                    None => break,
                },
            }
        }
        trace!("identify push worker stopped");
    }

    /// One push cycle: send the current snapshot to every eligible
    /// connection, at most `push_slots` streams in flight at a time. Errors
    /// are logged and ignored.
    pub(crate) async fn send_pushes(self: &Arc<Self>) {
        let Ok(_cycle) = self.push_cycle.try_acquire() else {
            trace!("identify push cycle already in flight, coalescing");
            return;
        };

        let snapshot = self.snapshot.current().await;
        let targets = self.registry.push_targets(snapshot.timestamp).await;
        trace!(
            "pushing identify snapshot {} to {} connections",
            snapshot.timestamp,
            targets.len()
        );

        let pushes = targets.into_iter().map(|conn| {
            let snapshot = snapshot.clone();
            async move {
                let Ok(_slot) = self.push_slots.acquire().await else {
                    return;
                };
                match self.push_snapshot(conn.as_ref(), &snapshot).await {
                    Ok(()) => {
                        self.registry
                            .set_last_push(conn.id(), snapshot.timestamp)
                            .await;
                    }
                    Err(error) => {
                        debug!("identify push to {:?} failed: {error}", conn.remote_peer());
                    }
                }
            }
        });
        join_all(pushes).await;
    }

    async fn push_snapshot(&self, conn: &dyn Connection, snapshot: &Snapshot) -> Result<()> {
        let send = async {
            let mut stream = conn.open_stream(IDENTIFY_PUSH_PROTOCOL, true).await?;
            let message = self.build_message(conn, snapshot);
            codec::write_identify_message(&mut stream, &message).await?;
            stream.shutdown().await.map_err(Error::WriteFailed)
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::ShuttingDown),
            result = timeout(PUSH_TIMEOUT, send) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Result as IdentifyResult,
        host::IdentifyStream,
        registry::{ConnectionId, PushSupport},
        testing::fixtures,
    };
    use async_trait::async_trait;
    use libp2p::{Multiaddr, PeerId, StreamProtocol};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection double that measures how many streams are open at once.
    struct GaugedConnection {
        id: ConnectionId,
        peer: PeerId,
        addr: Multiaddr,
        gauge: Arc<Gauge>,
    }

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        max: AtomicUsize,
        opened: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl crate::host::Connection for GaugedConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn remote_peer(&self) -> PeerId {
            self.peer
        }

        fn local_addr(&self) -> Multiaddr {
            self.addr.clone()
        }

        fn remote_addr(&self) -> Multiaddr {
            self.addr.clone()
        }

        async fn open_stream(
            &self,
            _protocol: StreamProtocol,
            _transient: bool,
        ) -> IdentifyResult<IdentifyStream> {
            self.gauge.enter();
            // Hold the slot long enough for overlap to show up.
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.gauge.exit();
            let (local, _remote) = tokio::io::duplex(64 * 1024);
            Ok(Box::new(local))
        }
    }

    async fn gauged_registry(
        inner: &Arc<Inner>,
        gauge: &Arc<Gauge>,
        connections: usize,
    ) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        for index in 0..connections {
            let id = ConnectionId::new(index as u64);
            let conn = Arc::new(GaugedConnection {
                id,
                peer: PeerId::random(),
                addr: "/ip4/192.0.2.1/tcp/4001".parse().unwrap(),
                gauge: gauge.clone(),
            });
            inner.registry.insert(conn).await;
            inner.registry.set_push_support(id, PushSupport::Supported).await;
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn caps_in_flight_pushes_at_the_slot_limit() {
        let node = fixtures::spawn_node(false);
        let inner = &node.identify.inner;
        let gauge = Arc::new(Gauge::default());
        gauged_registry(inner, &gauge, 100).await;

        inner.snapshot.refresh().await;
        inner.send_pushes().await;

        assert_eq!(gauge.opened.load(Ordering::SeqCst), 100);
        assert!(
            gauge.max.load(Ordering::SeqCst) <= 32,
            "max in-flight was {}",
            gauge.max.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn pushes_each_snapshot_at_most_once_per_connection() {
        let node = fixtures::spawn_node(false);
        let inner = &node.identify.inner;
        let gauge = Arc::new(Gauge::default());
        gauged_registry(inner, &gauge, 3).await;

        inner.snapshot.refresh().await;
        inner.send_pushes().await;
        assert_eq!(gauge.opened.load(Ordering::SeqCst), 3);

        // Same snapshot, second cycle: everyone is already up to date.
        inner.send_pushes().await;
        assert_eq!(gauge.opened.load(Ordering::SeqCst), 3);

        // A fresh snapshot makes everyone eligible again.
        inner.snapshot.refresh().await;
        inner.send_pushes().await;
        assert_eq!(gauge.opened.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn peers_without_push_support_are_skipped() {
        let node = fixtures::spawn_node(false);
        let inner = &node.identify.inner;
        let gauge = Arc::new(Gauge::default());
        let ids = gauged_registry(inner, &gauge, 2).await;
        inner
            .registry
            .set_push_support(ids[0], PushSupport::Unsupported)
            .await;

        inner.snapshot.refresh().await;
        inner.send_pushes().await;

        assert_eq!(gauge.opened.load(Ordering::SeqCst), 1);
    }
}
