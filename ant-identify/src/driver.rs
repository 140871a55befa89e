// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    codec::{self, pb},
    error::Error,
    event::IdentifyEvent,
    host::{Connection, Host, HostEvent, IdentifyStream, ObservedAddresses},
    multiaddr_is_loopback,
    peer_store::{CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL},
    registry::{ConnectionId, ConnectionRegistry, IdentifyWaiter, PushSupport},
    snapshot::{Snapshot, SnapshotStore},
    IDENTIFY_PROTOCOL, IDENTIFY_PUSH_PROTOCOL,
};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, Mutex, Semaphore},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Deadline for reading or writing one identify message on a stream.
const STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// The agent version advertised when none is configured.
const DEFAULT_AGENT_VERSION: &str = concat!("ant-identify/", env!("CARGO_PKG_VERSION"));

const DEFAULT_PROTOCOL_VERSION: &str = "ipfs/0.1.0";

/// Concurrent outbound streams within one push cycle, unless reconfigured.
const DEFAULT_PUSH_CONCURRENCY: usize = 32;

const IDENTIFY_CHANNEL_SIZE: usize = 10_000;

pub(crate) struct IdentifyConfig {
    pub(crate) protocol_version: String,
    pub(crate) agent_version: String,
    /// Also emit the protocol delta for the first (non-push) identify on a
    /// connection, where "added" is trivially the full list.
    pub(crate) emit_first_identify_delta: bool,
}

/// Builder for the identify service.
pub struct IdentifyBuilder {
    host: Arc<dyn Host>,
    observed: Arc<dyn ObservedAddresses>,
    protocol_version: String,
    agent_version: String,
    disable_signed_peer_records: bool,
    push_concurrency: usize,
    emit_first_identify_delta: bool,
}

impl IdentifyBuilder {
    pub fn new(host: Arc<dyn Host>, observed: Arc<dyn ObservedAddresses>) -> Self {
        Self {
            host,
            observed,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            agent_version: DEFAULT_AGENT_VERSION.to_string(),
            disable_signed_peer_records: false,
            push_concurrency: DEFAULT_PUSH_CONCURRENCY,
            emit_first_identify_delta: false,
        }
    }

    pub fn protocol_version(&mut self, version: String) {
        self.protocol_version = version;
    }

    pub fn agent_version(&mut self, version: String) {
        self.agent_version = version;
    }

    /// Leave the signed peer record out of outgoing snapshots.
    pub fn disable_signed_peer_records(&mut self) {
        self.disable_signed_peer_records = true;
    }

    /// Cap on concurrent outbound streams within one push cycle.
    pub fn push_concurrency(&mut self, limit: usize) {
        self.push_concurrency = limit.max(1);
    }

    /// Emit [`IdentifyEvent::PeerProtocolsUpdated`] for the first identify on
    /// a connection too, not just for pushes.
    pub fn emit_first_identify_delta(&mut self) {
        self.emit_first_identify_delta = true;
    }

    /// Creates the service: a clonable [`Identify`] handle, the
    /// [`HostNotifier`] to be wired into the host's swarm notifier and event
    /// bus, the event receiver, and the [`IdentifyDriver`] the caller spawns.
    pub fn build(
        self,
    ) -> (
        Identify,
        HostNotifier,
        mpsc::Receiver<IdentifyEvent>,
        IdentifyDriver,
    ) {
        let (event_tx, event_rx) = mpsc::channel(IDENTIFY_CHANNEL_SIZE);
        let (host_tx, host_rx) = mpsc::channel(IDENTIFY_CHANNEL_SIZE);
        // Depth one on purpose: a burst of local changes collapses into the
        // in-flight push cycle plus at most one queued trigger.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let snapshot = SnapshotStore::new(self.host.clone(), !self.disable_signed_peer_records);
        let inner = Arc::new(Inner {
            cfg: IdentifyConfig {
                protocol_version: self.protocol_version,
                agent_version: self.agent_version,
                emit_first_identify_delta: self.emit_first_identify_delta,
            },
            host: self.host,
            observed: self.observed,
            snapshot,
            registry: ConnectionRegistry::default(),
            event_tx,
            trigger_tx,
            addr_mutex: Mutex::new(()),
            push_cycle: Semaphore::new(1),
            push_slots: Semaphore::new(self.push_concurrency),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        (
            Identify {
                inner: inner.clone(),
            },
            HostNotifier { events: host_tx },
            event_rx,
            IdentifyDriver { inner, host_rx, trigger_rx },
        )
    }
}

/// Handle to a running identify service.
#[derive(Clone)]
pub struct Identify {
    pub(crate) inner: Arc<Inner>,
}

impl Identify {
    /// Block until the first identify exchange on `conn` completes or fails.
    pub async fn identify_conn(&self, conn: &Arc<dyn Connection>) {
        self.identify_wait(conn).await.wait().await;
    }

    /// The wait handle for the connection's first identify exchange; does not
    /// block. The first caller triggers the exchange, later callers share the
    /// same handle. Total: a closed connection yields a resolved handle.
    pub async fn identify_wait(&self, conn: &Arc<dyn Connection>) -> IdentifyWaiter {
        self.inner.identify_wait(conn).await
    }

    /// The addresses remote peers report they observe this node at.
    pub fn own_observed_addrs(&self) -> Vec<Multiaddr> {
        self.inner.observed.own_addrs()
    }

    /// Observed addresses reported on connections bound to `local`.
    pub fn observed_addrs_for(&self, local: &Multiaddr) -> Vec<Multiaddr> {
        self.inner.observed.addrs_for(local)
    }

    /// Cancel all in-flight identify work, close the observed-address
    /// tracker, and block until the background tasks have drained.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.observed.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Thin adapter between the host (swarm notifier, event bus) and the identify
/// driver. Holds nothing but the channel into the driver, so neither side
/// owns the other.
#[derive(Clone)]
pub struct HostNotifier {
    events: mpsc::Sender<HostEvent>,
}

impl HostNotifier {
    /// Must be delivered before any stream activity on the connection; the
    /// transport guarantees this ordering.
    pub async fn connected(&self, conn: Arc<dyn Connection>) {
        self.send(HostEvent::Connected(conn)).await;
    }

    pub async fn disconnected(&self, id: ConnectionId, peer: PeerId) {
        self.send(HostEvent::Disconnected { id, peer }).await;
    }

    /// An inbound stream negotiated to one of the identify protocols.
    pub async fn inbound_stream(
        &self,
        conn: Arc<dyn Connection>,
        protocol: StreamProtocol,
        stream: IdentifyStream,
    ) {
        self.send(HostEvent::InboundStream {
            conn,
            protocol,
            stream,
        })
        .await;
    }

    pub async fn local_protocols_changed(&self) {
        self.send(HostEvent::LocalProtocolsChanged).await;
    }

    pub async fn local_addresses_changed(&self) {
        self.send(HostEvent::LocalAddressesChanged).await;
    }

    async fn send(&self, event: HostEvent) {
        if let Err(error) = self.events.send(event).await {
            trace!("identify driver gone, dropping host event: {error}");
        }
    }
}

/// Drives the identify service; created by [`IdentifyBuilder::build`] and
/// spawned by the caller.
pub struct IdentifyDriver {
    inner: Arc<Inner>,
    host_rx: mpsc::Receiver<HostEvent>,
    trigger_rx: mpsc::Receiver<()>,
}

impl IdentifyDriver {
    /// Process host notifications until shutdown or until the notifier goes
    /// away.
    pub async fn run(self) {
        let IdentifyDriver {
            inner,
            mut host_rx,
            trigger_rx,
        } = self;

        let worker = inner.clone();
        inner.tasks.spawn(worker.push_worker(trigger_rx));

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                event = host_rx.recv() => match event {
                    Some(event) => inner.handle_host_event(event).await,
                    None => break,
                },
            }
        }
        debug!("identify driver stopped");
    }
}

/// Shared state of the service. The [`Identify`] handle, the driver loop and
/// every background task operate on this.
pub(crate) struct Inner {
    pub(crate) cfg: IdentifyConfig,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) observed: Arc<dyn ObservedAddresses>,
    pub(crate) snapshot: SnapshotStore,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) event_tx: mpsc::Sender<IdentifyEvent>,
    pub(crate) trigger_tx: mpsc::Sender<()>,
    /// Serializes the multi-step TTL dance in the consumer against the
    /// disconnect downgrade.
    pub(crate) addr_mutex: Mutex<()>,
    /// Capacity one: at most one push cycle in flight.
    pub(crate) push_cycle: Semaphore,
    pub(crate) push_slots: Semaphore,
    pub(crate) tasks: TaskTracker,
    pub(crate) shutdown: CancellationToken,
}

impl Inner {
    pub(crate) async fn handle_host_event(self: &Arc<Self>, event: HostEvent) {
        match event {
            HostEvent::Connected(conn) => {
                trace!("connection {:?} to {:?} established", conn.id(), conn.remote_peer());
                self.registry.insert(conn.clone()).await;
                // Kick off the background identify for the new connection.
                let _waiter = self.identify_wait(&conn).await;
            }
            HostEvent::Disconnected { id, peer } => self.on_disconnected(id, peer).await,
            HostEvent::InboundStream {
                conn,
                protocol,
                stream,
            } => self.on_inbound_stream(conn, protocol, stream),
            HostEvent::LocalProtocolsChanged | HostEvent::LocalAddressesChanged => {
                let snapshot = self.snapshot.refresh().await;
                trace!("local identity changed, snapshot is now {}", snapshot.timestamp);
                // A full buffer means a cycle is already queued; coalesce.
                let _ = self.trigger_tx.try_send(());
            }
        }
    }

    async fn on_disconnected(&self, id: ConnectionId, peer: PeerId) {
        trace!("connection {id:?} to {peer:?} closed");
        if let Some(entry) = self.registry.remove(id).await {
            // In-flight waiters observe resolution even though the entry is gone.
            entry.resolve();
        }
        if !self.host.is_connected(&peer) {
            // Last connection to this peer: its addresses are no longer
            // pinned. Serialized against a concurrent identify consume.
            let _guard = self.addr_mutex.lock().await;
            self.host
                .peer_store()
                .update_addrs(&peer, CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL);
        }
    }

    fn on_inbound_stream(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        protocol: StreamProtocol,
        stream: IdentifyStream,
    ) {
        if protocol == IDENTIFY_PROTOCOL {
            let inner = self.clone();
            self.tasks
                .spawn(async move { inner.serve_identify_request(conn, stream).await });
        } else if protocol == IDENTIFY_PUSH_PROTOCOL {
            let inner = self.clone();
            self.tasks
                .spawn(async move { inner.handle_identify_push(conn, stream).await });
        } else {
            debug!("dropping inbound stream on unexpected protocol {protocol:?}");
        }
    }

    pub(crate) async fn identify_wait(self: &Arc<Self>, conn: &Arc<dyn Connection>) -> IdentifyWaiter {
        let (waiter, created) = self.registry.wait_handle(conn.id()).await;
        if created {
            self.spawn_identify(conn.clone());
        }
        waiter
    }

    /// One-shot identify of the remote end of `conn`, spawned by the first
    /// waiter. Emits the outcome, then resolves the wait handle regardless.
    fn spawn_identify(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let inner = self.clone();
        self.tasks.spawn(async move {
            let peer = conn.remote_peer();
            let outcome = tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    // Shutdown is not an identification failure.
                    inner.registry.resolve(conn.id()).await;
                    return;
                }
                outcome = inner.run_identify(&conn) => outcome,
            };
            match outcome {
                Ok(()) => {
                    inner
                        .send_event(IdentifyEvent::IdentificationCompleted { peer })
                        .await;
                }
                Err(reason) => {
                    debug!("identify of {peer:?} on {:?} failed: {reason}", conn.id());
                    inner
                        .send_event(IdentifyEvent::IdentificationFailed { peer, reason })
                        .await;
                }
            }
            inner.registry.resolve(conn.id()).await;
        });
    }

    async fn run_identify(self: &Arc<Self>, conn: &Arc<dyn Connection>) -> crate::Result<()> {
        let mut stream = conn.open_stream(IDENTIFY_PROTOCOL, true).await?;
        let message = match timeout(STREAM_TIMEOUT, codec::read_identify_message(&mut stream)).await
        {
            Ok(message) => message?,
            Err(_) => return Err(Error::Timeout),
        };
        self.consume_message(conn.as_ref(), message, false).await;

        let peer = conn.remote_peer();
        let support = if self
            .host
            .peer_store()
            .supports_protocol(&peer, &IDENTIFY_PUSH_PROTOCOL)
        {
            PushSupport::Supported
        } else {
            PushSupport::Unsupported
        };
        self.registry.set_push_support(conn.id(), support).await;
        Ok(())
    }

    /// The remote asked who we are: send the current snapshot and close.
    /// Best-effort; errors only fail the stream.
    async fn serve_identify_request(&self, conn: Arc<dyn Connection>, mut stream: IdentifyStream) {
        let snapshot = self.snapshot.current().await;
        let message = self.build_message(conn.as_ref(), &snapshot);
        let send = async {
            codec::write_identify_message(&mut stream, &message).await?;
            stream.shutdown().await.map_err(Error::WriteFailed)
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = timeout(STREAM_TIMEOUT, send) => match result {
                Ok(Ok(())) => trace!("sent identify to {:?}", conn.remote_peer()),
                Ok(Err(error)) => debug!("failed to send identify to {:?}: {error}", conn.remote_peer()),
                Err(_) => debug!("timed out sending identify to {:?}", conn.remote_peer()),
            },
        }
    }

    /// The remote pushed a fresh snapshot at us: same read path as the
    /// initiator side, consumed with the push flag set.
    async fn handle_identify_push(&self, conn: Arc<dyn Connection>, mut stream: IdentifyStream) {
        let message = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = timeout(STREAM_TIMEOUT, codec::read_identify_message(&mut stream)) => match result {
                Ok(Ok(message)) => message,
                Ok(Err(error)) => {
                    debug!("failed to read identify push from {:?}: {error}", conn.remote_peer());
                    return;
                }
                Err(_) => {
                    debug!("timed out reading identify push from {:?}", conn.remote_peer());
                    return;
                }
            },
        };
        self.consume_message(conn.as_ref(), message, true).await;
    }

    /// Compose the outbound identify message for one connection.
    pub(crate) fn build_message(&self, conn: &dyn Connection, snapshot: &Snapshot) -> pb::Identify {
        let mut listen_addrs = snapshot.listen_addrs.clone();
        // Loopback addresses are only useful to a peer that shares the
        // loopback interface with us.
        if !multiaddr_is_loopback(&conn.local_addr()) && !multiaddr_is_loopback(&conn.remote_addr())
        {
            listen_addrs.retain(|addr| !multiaddr_is_loopback(addr));
        }
        pb::Identify {
            protocol_version: Some(self.cfg.protocol_version.clone()),
            agent_version: Some(self.cfg.agent_version.clone()),
            public_key: Some(self.host.public_key().encode_protobuf().into()),
            listen_addrs: listen_addrs.iter().map(Multiaddr::to_vec).collect(),
            observed_addr: Some(conn.remote_addr().to_vec().into()),
            protocols: snapshot
                .protocols
                .iter()
                .map(|protocol| protocol.as_ref().to_string())
                .collect(),
            signed_peer_record: snapshot
                .record
                .clone()
                .map(|envelope| envelope.into_protobuf_encoding().into()),
        }
    }

    pub(crate) async fn send_event(&self, event: IdentifyEvent) {
        if let Err(error) = self.event_tx.send(event).await {
            trace!("identify event receiver dropped: {error}");
        }
    }
}
