// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

#[macro_use]
extern crate tracing;

mod codec;
mod consume;
mod driver;
mod error;
mod event;
mod host;
mod peer_store;
mod push;
mod registry;
mod snapshot;
pub mod testing;

pub use self::{
    driver::{HostNotifier, Identify, IdentifyBuilder, IdentifyDriver},
    error::{Error, Result},
    event::IdentifyEvent,
    host::{Connection, Host, HostEvent, IdentifyStream, ObservedAddresses, StreamIo},
    peer_store::{PeerStore, CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL},
    registry::{ConnectionId, IdentifyWaiter, PushSupport},
};

use libp2p::{multiaddr::Protocol, Multiaddr, StreamProtocol};

/// Protocol id of the request/response identify exchange.
pub const IDENTIFY_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/id/1.0.0");

/// Protocol id over which a node pushes a fresh identity snapshot to peers it
/// is already connected to.
pub const IDENTIFY_PUSH_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/id/push/1.0.0");

/// Checks if a multiaddress sits on a loopback interface.
pub fn multiaddr_is_loopback(addr: &Multiaddr) -> bool {
    addr.iter().any(|protocol| match protocol {
        Protocol::Ip4(ip) => ip.is_loopback(),
        Protocol::Ip6(ip) => ip.is_loopback(),
        _ => false,
    })
}
