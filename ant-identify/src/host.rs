// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{error::Result, peer_store::PeerStore, registry::ConnectionId};
use async_trait::async_trait;
use libp2p::{identity::PublicKey, Multiaddr, PeerId, StreamProtocol};
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream bound to a single negotiated protocol on a connection.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed stream as handed over by the transport.
pub type IdentifyStream = Box<dyn StreamIo>;

/// A transport-level connection as the identify engine sees it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable id supplied by the transport. Connections are always keyed by
    /// this id, never by the remote peer id: a peer may hold several
    /// connections at once.
    fn id(&self) -> ConnectionId;

    fn remote_peer(&self) -> PeerId;

    fn local_addr(&self) -> Multiaddr;

    fn remote_addr(&self) -> Multiaddr;

    /// Open an outbound stream negotiated to `protocol`. Transient streams
    /// are not counted against the connection's ordinary stream limits.
    async fn open_stream(&self, protocol: StreamProtocol, transient: bool) -> Result<IdentifyStream>;
}

/// The slice of host state the engine reads when building snapshots and
/// applying received messages.
pub trait Host: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    fn public_key(&self) -> PublicKey;

    /// The addresses this node currently advertises.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Protocol ids with a registered handler on this node.
    fn supported_protocols(&self) -> Vec<StreamProtocol>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    fn peer_store(&self) -> Arc<dyn PeerStore>;
}

/// Aggregates "this is how others see you" reports and derives the node's
/// externally visible addresses. Identify only feeds and queries it.
pub trait ObservedAddresses: Send + Sync {
    /// Record that the remote end of `conn` observes us at `observed`.
    fn record(&self, conn: &dyn Connection, observed: Multiaddr);

    fn own_addrs(&self) -> Vec<Multiaddr>;

    /// Observed addresses reported on connections bound to `local`.
    fn addrs_for(&self, local: &Multiaddr) -> Vec<Multiaddr>;

    fn close(&self);
}

/// Notifications the host feeds into the identify driver. `Connected` is
/// guaranteed by the transport to be delivered before any stream activity on
/// that connection.
pub enum HostEvent {
    Connected(Arc<dyn Connection>),
    Disconnected {
        id: ConnectionId,
        peer: PeerId,
    },
    InboundStream {
        conn: Arc<dyn Connection>,
        protocol: StreamProtocol,
        stream: IdentifyStream,
    },
    LocalProtocolsChanged,
    LocalAddressesChanged,
}

// Manually implement Debug as connections and streams are opaque trait objects.
impl Debug for HostEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HostEvent::Connected(conn) => write!(f, "HostEvent::Connected({:?})", conn.id()),
            HostEvent::Disconnected { id, peer } => {
                write!(f, "HostEvent::Disconnected({id:?}, {peer:?})")
            }
            HostEvent::InboundStream { conn, protocol, .. } => {
                write!(f, "HostEvent::InboundStream({:?}, {protocol:?})", conn.id())
            }
            HostEvent::LocalProtocolsChanged => write!(f, "HostEvent::LocalProtocolsChanged"),
            HostEvent::LocalAddressesChanged => write!(f, "HostEvent::LocalAddressesChanged"),
        }
    }
}
