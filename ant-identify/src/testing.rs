// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory implementations of the identify collaborators (peer store,
//! observed-address tracker, host, connections over duplex pipes), used to
//! drive the engine in tests.

use crate::{
    driver::HostNotifier,
    error::{Error, Result},
    host::{Connection, Host, IdentifyStream, ObservedAddresses},
    peer_store::PeerStore,
    registry::ConnectionId,
};
use async_trait::async_trait;
use itertools::Itertools;
use libp2p::{
    core::{PeerRecord, SignedEnvelope},
    identity::{Keypair, PublicKey},
    Multiaddr, PeerId, StreamProtocol,
};
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::io::duplex;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct PeerEntry {
    protocols: Vec<StreamProtocol>,
    addrs: HashMap<Multiaddr, Duration>,
    key: Option<PublicKey>,
    record: Option<SignedEnvelope>,
    metadata: HashMap<&'static str, String>,
}

/// In-memory peer store. The certified flavour accepts signed peer records.
#[derive(Default)]
pub struct MemoryPeerStore {
    certified: bool,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn certified() -> Self {
        Self {
            certified: true,
            ..Default::default()
        }
    }

    /// The lifetime currently on record for an address, if any.
    pub fn addr_ttl(&self, peer: &PeerId, addr: &Multiaddr) -> Option<Duration> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .and_then(|entry| entry.addrs.get(addr).copied())
    }

    pub fn metadata(&self, peer: &PeerId, key: &str) -> Option<String> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .and_then(|entry| entry.metadata.get(key).cloned())
    }
}

impl PeerStore for MemoryPeerStore {
    fn protocols(&self, peer: &PeerId) -> Vec<StreamProtocol> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .map(|entry| entry.protocols.clone())
            .unwrap_or_default()
    }

    fn set_protocols(&self, peer: &PeerId, protocols: Vec<StreamProtocol>) {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .entry(*peer)
            .or_default()
            .protocols = protocols;
    }

    fn supports_protocol(&self, peer: &PeerId, protocol: &StreamProtocol) -> bool {
        self.protocols(peer).contains(protocol)
    }

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .map(|entry| entry.addrs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn add_addrs(&self, peer: &PeerId, addrs: Vec<Multiaddr>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut peers = self.peers.lock().expect("peer store lock poisoned");
        let entry = peers.entry(*peer).or_default();
        for addr in addrs {
            let current = entry.addrs.entry(addr).or_insert(Duration::ZERO);
            // An address keeps the longer of the two lifetimes.
            if ttl > *current {
                *current = ttl;
            }
        }
    }

    fn update_addrs(&self, peer: &PeerId, old_ttl: Duration, new_ttl: Duration) {
        let mut peers = self.peers.lock().expect("peer store lock poisoned");
        if let Some(entry) = peers.get_mut(peer) {
            for ttl in entry.addrs.values_mut() {
                if *ttl == old_ttl {
                    *ttl = new_ttl;
                }
            }
            entry.addrs.retain(|_, ttl| !ttl.is_zero());
        }
    }

    fn supports_signed_records(&self) -> bool {
        self.certified
    }

    fn consume_peer_record(&self, envelope: SignedEnvelope, ttl: Duration) -> Result<()> {
        let record = PeerRecord::from_signed_envelope(envelope.clone())
            .map_err(|error| Error::Io(io::Error::new(io::ErrorKind::InvalidData, error)))?;
        let mut peers = self.peers.lock().expect("peer store lock poisoned");
        let entry = peers.entry(record.peer_id()).or_default();
        for addr in record.addresses() {
            let current = entry.addrs.entry(addr.clone()).or_insert(Duration::ZERO);
            if ttl > *current {
                *current = ttl;
            }
        }
        entry.record = Some(envelope);
        Ok(())
    }

    fn peer_record(&self, peer: &PeerId) -> Option<SignedEnvelope> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .and_then(|entry| entry.record.clone())
    }

    fn public_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(peer)
            .and_then(|entry| entry.key.clone())
    }

    fn set_public_key(&self, peer: &PeerId, key: PublicKey) -> Result<()> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .entry(*peer)
            .or_default()
            .key = Some(key);
        Ok(())
    }

    fn put_metadata(&self, peer: &PeerId, key: &'static str, value: String) {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .entry(*peer)
            .or_default()
            .metadata
            .insert(key, value);
    }
}

/// Observed-address tracker that records reports verbatim.
#[derive(Default)]
pub struct MemoryObservedAddrs {
    reports: Mutex<Vec<(ConnectionId, Multiaddr, Multiaddr)>>,
    closed: AtomicBool,
}

impl MemoryObservedAddrs {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ObservedAddresses for MemoryObservedAddrs {
    fn record(&self, conn: &dyn Connection, observed: Multiaddr) {
        if self.is_closed() {
            return;
        }
        self.reports
            .lock()
            .expect("observed addrs lock poisoned")
            .push((conn.id(), conn.local_addr(), observed));
    }

    fn own_addrs(&self) -> Vec<Multiaddr> {
        self.reports
            .lock()
            .expect("observed addrs lock poisoned")
            .iter()
            .map(|(_, _, observed)| observed.clone())
            .unique()
            .collect()
    }

    fn addrs_for(&self, local: &Multiaddr) -> Vec<Multiaddr> {
        self.reports
            .lock()
            .expect("observed addrs lock poisoned")
            .iter()
            .filter(|(_, report_local, _)| report_local == local)
            .map(|(_, _, observed)| observed.clone())
            .unique()
            .collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Host double backed by a [`MemoryPeerStore`].
pub struct MemoryHost {
    keypair: Keypair,
    peer_store: Arc<MemoryPeerStore>,
    listen_addrs: Mutex<Vec<Multiaddr>>,
    protocols: Mutex<Vec<StreamProtocol>>,
    connections: Mutex<HashMap<PeerId, usize>>,
}

impl MemoryHost {
    pub fn new(keypair: Keypair, peer_store: Arc<MemoryPeerStore>) -> Self {
        Self {
            keypair,
            peer_store,
            listen_addrs: Mutex::new(Vec::new()),
            protocols: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.listen_addrs.lock().expect("host lock poisoned") = addrs;
    }

    pub fn set_protocols(&self, protocols: Vec<StreamProtocol>) {
        *self.protocols.lock().expect("host lock poisoned") = protocols;
    }

    pub fn add_connection(&self, peer: PeerId) {
        *self
            .connections
            .lock()
            .expect("host lock poisoned")
            .entry(peer)
            .or_insert(0) += 1;
    }

    pub fn remove_connection(&self, peer: PeerId) {
        let mut connections = self.connections.lock().expect("host lock poisoned");
        if let Some(count) = connections.get_mut(&peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&peer);
            }
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().expect("host lock poisoned").clone()
    }

    fn supported_protocols(&self) -> Vec<StreamProtocol> {
        self.protocols.lock().expect("host lock poisoned").clone()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections
            .lock()
            .expect("host lock poisoned")
            .get(peer)
            .is_some_and(|count| *count > 0)
    }

    fn peer_store(&self) -> Arc<dyn PeerStore> {
        self.peer_store.clone()
    }
}

/// Connection double. Streams are in-memory duplex pipes; the far half of an
/// opened stream is delivered to the counterpart service's notifier, as the
/// transport would.
pub struct TestConnection {
    id: ConnectionId,
    remote_peer: PeerId,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    remote: Mutex<Option<(Weak<TestConnection>, HostNotifier)>>,
    streams_opened: AtomicU64,
    refuse_streams: AtomicBool,
    stall_streams: AtomicBool,
}

impl TestConnection {
    pub fn new(
        id: u64,
        _local_peer: PeerId,
        remote_peer: PeerId,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            remote_peer,
            local_addr,
            remote_addr,
            remote: Mutex::new(None),
            streams_opened: AtomicU64::new(0),
            refuse_streams: AtomicBool::new(false),
            stall_streams: AtomicBool::new(false),
        })
    }

    /// Wire the two directions of a connection together: streams opened on
    /// `a` arrive at `notify_b` (carrying `b` as the receiving end), and vice
    /// versa.
    pub fn link(
        a: &Arc<TestConnection>,
        b: &Arc<TestConnection>,
        notify_a: HostNotifier,
        notify_b: HostNotifier,
    ) {
        *a.remote.lock().expect("connection lock poisoned") =
            Some((Arc::downgrade(b), notify_b));
        *b.remote.lock().expect("connection lock poisoned") =
            Some((Arc::downgrade(a), notify_a));
    }

    /// Number of outbound streams opened on this side so far.
    pub fn streams_opened(&self) -> u64 {
        self.streams_opened.load(Ordering::SeqCst)
    }

    /// Make subsequent `open_stream` calls fail.
    pub fn refuse_streams(&self) {
        self.refuse_streams.store(true, Ordering::SeqCst);
    }

    /// Make subsequent `open_stream` calls hang until cancelled.
    pub fn stall_streams(&self) {
        self.stall_streams.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }

    async fn open_stream(
        &self,
        protocol: StreamProtocol,
        _transient: bool,
    ) -> Result<IdentifyStream> {
        if self.refuse_streams.load(Ordering::SeqCst) {
            return Err(Error::StreamOpenFailed(
                "connection refused the stream".to_string(),
            ));
        }
        if self.stall_streams.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (near, far) = duplex(STREAM_BUFFER_SIZE);
        let remote = self
            .remote
            .lock()
            .expect("connection lock poisoned")
            .clone();
        if let Some((counterpart, notifier)) = remote {
            if let Some(conn) = counterpart.upgrade() {
                notifier
                    .inbound_stream(conn, protocol, Box::new(far))
                    .await;
            }
        }
        // With no linked remote the far half is simply dropped and the
        // stream reads EOF, like a reset from the other side.
        Ok(Box::new(near))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::{
        driver::{Identify, IdentifyBuilder, IdentifyDriver},
        event::IdentifyEvent,
        IDENTIFY_PROTOCOL, IDENTIFY_PUSH_PROTOCOL,
    };
    use tokio::{sync::mpsc, time::timeout};

    pub(crate) const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) struct TestNode {
        pub(crate) identify: Identify,
        pub(crate) notifier: HostNotifier,
        pub(crate) events: mpsc::Receiver<IdentifyEvent>,
        pub(crate) host: Arc<MemoryHost>,
        pub(crate) store: Arc<MemoryPeerStore>,
        pub(crate) observed: Arc<MemoryObservedAddrs>,
        pub(crate) peer_id: PeerId,
    }

    fn build_node(certified: bool, configure: impl FnOnce(&mut IdentifyBuilder)) -> (TestNode, IdentifyDriver) {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        let store = Arc::new(if certified {
            MemoryPeerStore::certified()
        } else {
            MemoryPeerStore::new()
        });
        let host = Arc::new(MemoryHost::new(keypair, store.clone()));
        host.set_protocols(vec![
            IDENTIFY_PROTOCOL,
            IDENTIFY_PUSH_PROTOCOL,
            StreamProtocol::new("/safe/node/1.0"),
        ]);
        host.set_listen_addrs(vec!["/ip4/192.0.2.1/tcp/4001".parse().expect("valid addr")]);

        let observed = Arc::new(MemoryObservedAddrs::default());
        let mut builder = IdentifyBuilder::new(host.clone(), observed.clone());
        configure(&mut builder);
        let (identify, notifier, events, driver) = builder.build();
        (
            TestNode {
                identify,
                notifier,
                events,
                host,
                store,
                observed,
                peer_id,
            },
            driver,
        )
    }

    /// A node with a running driver.
    pub(crate) fn spawn_node(certified: bool) -> TestNode {
        spawn_configured(certified, |_| {})
    }

    /// Same, with a hook into the builder before the service is assembled.
    pub(crate) fn spawn_configured(
        certified: bool,
        configure: impl FnOnce(&mut IdentifyBuilder),
    ) -> TestNode {
        let (node, driver) = build_node(certified, configure);
        tokio::spawn(driver.run());
        node
    }

    /// An unlinked connection from `node` to `peer`; opened streams read EOF.
    pub(crate) fn connection_to(node: &TestNode, id: u64, peer: PeerId) -> Arc<TestConnection> {
        TestConnection::new(
            id,
            node.peer_id,
            peer,
            "/ip4/192.0.2.1/tcp/4001".parse().expect("valid addr"),
            "/ip4/198.51.100.2/tcp/4001".parse().expect("valid addr"),
        )
    }

    /// Establish a full bidirectional connection between two nodes and
    /// deliver the `Connected` notifications, which kicks off identify on
    /// both sides.
    pub(crate) async fn connect(
        a: &TestNode,
        b: &TestNode,
        id: u64,
    ) -> (Arc<TestConnection>, Arc<TestConnection>) {
        let addr_a: Multiaddr = "/ip4/192.0.2.1/tcp/4001".parse().expect("valid addr");
        let addr_b: Multiaddr = "/ip4/198.51.100.2/tcp/4002".parse().expect("valid addr");
        let conn_ab = TestConnection::new(id, a.peer_id, b.peer_id, addr_a.clone(), addr_b.clone());
        let conn_ba = TestConnection::new(id, b.peer_id, a.peer_id, addr_b, addr_a);
        TestConnection::link(&conn_ab, &conn_ba, a.notifier.clone(), b.notifier.clone());
        a.host.add_connection(b.peer_id);
        b.host.add_connection(a.peer_id);
        // Connected is delivered to both drivers before either side can open
        // a stream, mirroring the transport's ordering guarantee.
        b.notifier.connected(conn_ba.clone()).await;
        a.notifier.connected(conn_ab.clone()).await;
        (conn_ab, conn_ba)
    }

    pub(crate) async fn expect_event(events: &mut mpsc::Receiver<IdentifyEvent>) -> IdentifyEvent {
        timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for an identify event")
            .expect("event channel closed")
    }

    /// Poll until `check` passes or the deadline strikes.
    pub(crate) async fn wait_until(check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
