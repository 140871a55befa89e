// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Result;
use libp2p::{core::SignedEnvelope, identity::PublicKey, Multiaddr, PeerId, StreamProtocol};
use std::time::Duration;

/// Lifetime of addresses learned from a peer we hold a live connection to.
/// Effectively unbounded; the disconnect handler downgrades these.
pub const CONNECTED_ADDR_TTL: Duration = Duration::MAX;

/// Lifetime of addresses of a peer whose last connection recently closed.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(15 * 60);

/// Short holding lifetime used while an identify message is re-applied: known
/// addresses are parked here and either promoted by the new message or expired.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// The slice of the host's peer store that identify reads and writes: the
/// protocol book, the TTL'd address book (optionally certified), the key book
/// and opaque per-peer metadata.
///
/// Implementations are expected to be cheap, in-memory style books; all
/// methods are synchronous and callable from any task.
pub trait PeerStore: Send + Sync {
    fn protocols(&self, peer: &PeerId) -> Vec<StreamProtocol>;

    /// Replace the peer's protocol list wholesale.
    fn set_protocols(&self, peer: &PeerId, protocols: Vec<StreamProtocol>);

    fn supports_protocol(&self, peer: &PeerId, protocol: &StreamProtocol) -> bool;

    /// Addresses currently on record for the peer, expired entries excluded.
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Insert addresses with the given lifetime. An address already on record
    /// keeps the longer of the two lifetimes.
    fn add_addrs(&self, peer: &PeerId, addrs: Vec<Multiaddr>, ttl: Duration);

    /// Re-label every address of the peer currently at `old_ttl` with
    /// `new_ttl`. A zero `new_ttl` expires the addresses.
    fn update_addrs(&self, peer: &PeerId, old_ttl: Duration, new_ttl: Duration);

    /// Whether the address book accepts signed peer records. When false,
    /// identify persists raw listen addresses instead.
    fn supports_signed_records(&self) -> bool;

    /// Store a signed peer record, giving its addresses the given lifetime.
    /// The envelope signature has already been verified by the caller.
    fn consume_peer_record(&self, envelope: SignedEnvelope, ttl: Duration) -> Result<()>;

    /// The latest signed record on file for the peer, if any. Identify reads
    /// its own entry here when building snapshots.
    fn peer_record(&self, peer: &PeerId) -> Option<SignedEnvelope>;

    fn public_key(&self, peer: &PeerId) -> Option<PublicKey>;

    fn set_public_key(&self, peer: &PeerId, key: PublicKey) -> Result<()>;

    /// Opaque per-peer metadata, e.g. the advertised agent version.
    fn put_metadata(&self, peer: &PeerId, key: &'static str, value: String);
}
