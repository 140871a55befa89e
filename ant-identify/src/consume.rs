// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    codec::pb,
    driver::Inner,
    error::Error,
    event::IdentifyEvent,
    host::Connection,
    peer_store::{CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL},
};
use itertools::Itertools;
use libp2p::{
    core::{PeerRecord, SignedEnvelope},
    identity::PublicKey,
    Multiaddr, PeerId, StreamProtocol,
};
use std::time::Duration;

impl Inner {
    /// Apply a received identify message to the peer store. Individual
    /// malformed fields are skipped; the rest of the message is still
    /// applied.
    pub(crate) async fn consume_message(
        &self,
        conn: &dyn Connection,
        message: pb::Identify,
        is_push: bool,
    ) {
        let peer = conn.remote_peer();
        let store = self.host.peer_store();

        // Protocols: replace the list wholesale, remember the delta.
        let protocols: Vec<StreamProtocol> = message
            .protocols
            .iter()
            .filter_map(|name| match StreamProtocol::try_from_owned(name.clone()) {
                Ok(protocol) => Some(protocol),
                Err(error) => {
                    debug!("dropping malformed protocol id {name:?} from {peer:?}: {error}");
                    None
                }
            })
            .collect();
        let known = store.protocols(&peer);
        let added: Vec<StreamProtocol> = protocols
            .iter()
            .filter(|protocol| !known.contains(protocol))
            .cloned()
            .collect();
        let removed: Vec<StreamProtocol> = known
            .iter()
            .filter(|protocol| !protocols.contains(protocol))
            .cloned()
            .collect();
        store.set_protocols(&peer, protocols);
        // On the first identify the whole list would count as added; only
        // pushes carry an interesting delta.
        if is_push || self.cfg.emit_first_identify_delta {
            self.send_event(IdentifyEvent::PeerProtocolsUpdated {
                peer,
                added,
                removed,
            })
            .await;
        }

        // Observed address: how the remote sees us.
        if let Some(bytes) = &message.observed_addr {
            match Multiaddr::try_from(bytes.to_vec()) {
                Ok(observed) => self.observed.record(conn, observed),
                Err(error) => {
                    debug!("{} (observed, from {peer:?}): {error}", Error::MalformedAddress)
                }
            }
        }

        // Listen addresses: only what the peer explicitly advertises. The
        // connection's own source address is never added; gossiping random
        // NAT source ports around would splode the address books.
        let listen_addrs: Vec<Multiaddr> = message
            .listen_addrs
            .iter()
            .filter_map(|bytes| match Multiaddr::try_from(bytes.clone()) {
                Ok(addr) => Some(addr),
                Err(error) => {
                    debug!("{} (from {peer:?}): {error}", Error::MalformedAddress);
                    None
                }
            })
            .unique()
            .collect();

        // TTL dance: park every known address on the temp lifetime, promote
        // what the message (re-)advertises, expire the rest. Serialized
        // against the disconnect downgrade so the two never interleave.
        {
            let _guard = self.addr_mutex.lock().await;
            let ttl = if self.host.is_connected(&peer) {
                CONNECTED_ADDR_TTL
            } else {
                RECENTLY_CONNECTED_ADDR_TTL
            };
            store.update_addrs(&peer, CONNECTED_ADDR_TTL, TEMP_ADDR_TTL);
            store.update_addrs(&peer, RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL);

            let mut certified = false;
            if store.supports_signed_records() {
                if let Some(envelope) = &message.signed_peer_record {
                    certified = self.consume_peer_record(&peer, envelope, ttl);
                }
            }
            if !certified {
                store.add_addrs(&peer, listen_addrs, ttl);
            }
            store.update_addrs(&peer, TEMP_ADDR_TTL, Duration::ZERO);
        }

        // Versions, stored as opaque metadata.
        if let Some(protocol_version) = message.protocol_version {
            store.put_metadata(&peer, "ProtocolVersion", protocol_version);
        }
        if let Some(agent_version) = message.agent_version {
            store.put_metadata(&peer, "AgentVersion", agent_version);
        }

        if let Some(bytes) = &message.public_key {
            self.consume_public_key(&peer, bytes);
        }
    }

    /// Returns true iff the record was verified and persisted; the caller
    /// falls back to the unsigned listen addresses otherwise.
    fn consume_peer_record(&self, peer: &PeerId, bytes: &[u8], ttl: Duration) -> bool {
        let envelope = match SignedEnvelope::from_protobuf_encoding(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!("undecodable signed peer record from {peer:?}: {error}");
                return false;
            }
        };
        let record = match PeerRecord::from_signed_envelope(envelope.clone()) {
            Ok(record) => record,
            Err(error) => {
                debug!("invalid signed peer record from {peer:?}: {error}");
                return false;
            }
        };
        if record.peer_id() != *peer {
            warn!(
                "signed peer record from {peer:?} is for {:?}, ignoring",
                record.peer_id()
            );
            return false;
        }
        if let Err(error) = self.host.peer_store().consume_peer_record(envelope, ttl) {
            warn!("failed to store signed peer record for {peer:?}: {error}");
            return false;
        }
        true
    }

    /// Reconcile the advertised public key with the connection's remote peer
    /// id and the key already on record. Anomalies are logged and never
    /// overwrite trusted state.
    fn consume_public_key(&self, peer: &PeerId, bytes: &[u8]) {
        let store = self.host.peer_store();
        let key = match PublicKey::try_decode_protobuf(bytes).map_err(Error::MalformedKey) {
            Ok(key) => key,
            Err(error) => {
                debug!("ignoring public key from {peer:?}: {error}");
                return;
            }
        };
        let derived = key.to_peer_id();
        if derived != *peer {
            error!(
                "{}",
                Error::KeyPeerIdMismatch {
                    derived,
                    expected: *peer,
                }
            );
            return;
        }
        match store.public_key(peer) {
            None => {
                if let Err(error) = store.set_public_key(peer, key) {
                    warn!("failed to store public key for {peer:?}: {error}");
                }
            }
            Some(existing) if existing == key => {}
            // Two valid keys for one identity is anomalous; keep the original.
            Some(_) => error!("{}", Error::KeyConflict(*peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peer_store::PeerStore,
        testing::{fixtures, TestConnection},
    };
    use bytes::Bytes;
    use libp2p::identity::Keypair;
    use std::sync::Arc;

    /// A message as the remote peer `keypair` would send it.
    fn message_from(keypair: &Keypair, listen_addrs: &[&str], protocols: &[&str]) -> pb::Identify {
        pb::Identify {
            protocol_version: Some("ipfs/0.1.0".to_string()),
            agent_version: Some("remote/0.1".to_string()),
            public_key: Some(keypair.public().encode_protobuf().into()),
            listen_addrs: listen_addrs
                .iter()
                .map(|addr| addr.parse::<Multiaddr>().unwrap().to_vec())
                .collect(),
            observed_addr: None,
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            signed_peer_record: None,
        }
    }

    #[tokio::test]
    async fn replaces_addresses_and_expires_omitted_ones() {
        let node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);
        node.host.add_connection(peer);

        let x = "/ip4/192.0.2.1/tcp/4001";
        let y = "/ip4/192.0.2.1/tcp/4002";
        let z = "/ip4/192.0.2.1/tcp/4003";

        let inner = &node.identify.inner;
        inner
            .consume_message(conn.as_ref(), message_from(&remote, &[x, y], &[]), false)
            .await;
        assert_eq!(
            node.store.addr_ttl(&peer, &x.parse().unwrap()),
            Some(CONNECTED_ADDR_TTL)
        );
        assert_eq!(
            node.store.addr_ttl(&peer, &y.parse().unwrap()),
            Some(CONNECTED_ADDR_TTL)
        );

        // A later push advertises {Y, Z}: X must be expired outright.
        inner
            .consume_message(conn.as_ref(), message_from(&remote, &[y, z], &[]), true)
            .await;
        assert_eq!(node.store.addr_ttl(&peer, &x.parse().unwrap()), None);
        assert_eq!(
            node.store.addr_ttl(&peer, &y.parse().unwrap()),
            Some(CONNECTED_ADDR_TTL)
        );
        assert_eq!(
            node.store.addr_ttl(&peer, &z.parse().unwrap()),
            Some(CONNECTED_ADDR_TTL)
        );
    }

    #[tokio::test]
    async fn disconnected_peer_addresses_get_the_recent_ttl() {
        let node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);
        // No connection on record for the peer.

        let addr = "/ip4/192.0.2.9/tcp/4001";
        node.identify
            .inner
            .consume_message(conn.as_ref(), message_from(&remote, &[addr], &[]), false)
            .await;
        assert_eq!(
            node.store.addr_ttl(&peer, &addr.parse().unwrap()),
            Some(RECENTLY_CONNECTED_ADDR_TTL)
        );
    }

    #[tokio::test]
    async fn malformed_signed_record_falls_back_to_unsigned_addresses() {
        let node = fixtures::spawn_node(true);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);
        node.host.add_connection(peer);

        let addr = "/ip4/192.0.2.1/tcp/4001";
        let mut message = message_from(&remote, &[addr], &[]);
        message.signed_peer_record = Some(Bytes::from_static(b"not an envelope"));

        node.identify
            .inner
            .consume_message(conn.as_ref(), message, false)
            .await;
        assert_eq!(
            node.store.addr_ttl(&peer, &addr.parse().unwrap()),
            Some(CONNECTED_ADDR_TTL)
        );
    }

    #[tokio::test]
    async fn signed_record_is_preferred_over_raw_addresses() {
        let node = fixtures::spawn_node(true);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);
        node.host.add_connection(peer);

        let certified_addr: Multiaddr = "/ip4/192.0.2.5/tcp/5001".parse().unwrap();
        let raw_addr: Multiaddr = "/ip4/192.0.2.6/tcp/6001".parse().unwrap();
        let record = PeerRecord::new(&remote, vec![certified_addr.clone()]).unwrap();
        let mut message = message_from(&remote, &["/ip4/192.0.2.6/tcp/6001"], &[]);
        message.signed_peer_record =
            Some(record.into_signed_envelope().into_protobuf_encoding().into());

        node.identify
            .inner
            .consume_message(conn.as_ref(), message, false)
            .await;
        assert_eq!(
            node.store.addr_ttl(&peer, &certified_addr),
            Some(CONNECTED_ADDR_TTL)
        );
        assert_eq!(node.store.addr_ttl(&peer, &raw_addr), None);
    }

    #[tokio::test]
    async fn record_signed_by_someone_else_is_rejected() {
        let node = fixtures::spawn_node(true);
        let remote = Keypair::generate_ed25519();
        let impostor = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);
        node.host.add_connection(peer);

        let certified_addr: Multiaddr = "/ip4/192.0.2.5/tcp/5001".parse().unwrap();
        let raw_addr: Multiaddr = "/ip4/192.0.2.6/tcp/6001".parse().unwrap();
        let record = PeerRecord::new(&impostor, vec![certified_addr.clone()]).unwrap();
        let mut message = message_from(&remote, &["/ip4/192.0.2.6/tcp/6001"], &[]);
        message.signed_peer_record =
            Some(record.into_signed_envelope().into_protobuf_encoding().into());

        node.identify
            .inner
            .consume_message(conn.as_ref(), message, false)
            .await;
        // Fallback path: raw addresses in, nothing certified.
        assert_eq!(node.store.addr_ttl(&peer, &certified_addr), None);
        assert_eq!(node.store.addr_ttl(&peer, &raw_addr), Some(CONNECTED_ADDR_TTL));
    }

    #[tokio::test]
    async fn mismatched_public_key_is_not_stored_but_rest_applies() {
        let node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);

        let mut message = message_from(&remote, &[], &["/safe/node/1.0"]);
        // Key of some other identity entirely.
        message.public_key = Some(
            Keypair::generate_ed25519()
                .public()
                .encode_protobuf()
                .into(),
        );

        node.identify
            .inner
            .consume_message(conn.as_ref(), message, false)
            .await;
        assert!(node.store.public_key(&peer).is_none());
        assert_eq!(
            node.store.protocols(&peer),
            vec![StreamProtocol::new("/safe/node/1.0")]
        );
        assert_eq!(
            node.store.metadata(&peer, "AgentVersion").as_deref(),
            Some("remote/0.1")
        );
    }

    #[tokio::test]
    async fn matching_public_key_is_stored_once() {
        let node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);

        let inner = &node.identify.inner;
        inner
            .consume_message(conn.as_ref(), message_from(&remote, &[], &[]), false)
            .await;
        assert_eq!(node.store.public_key(&peer), Some(remote.public()));

        // Same key again is a no-op.
        inner
            .consume_message(conn.as_ref(), message_from(&remote, &[], &[]), true)
            .await;
        assert_eq!(node.store.public_key(&peer), Some(remote.public()));
    }

    #[tokio::test]
    async fn protocol_delta_event_is_push_only() {
        let mut node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);

        let inner = &node.identify.inner;
        inner
            .consume_message(
                conn.as_ref(),
                message_from(&remote, &[], &["/safe/node/1.0", "/ipfs/id/push/1.0.0"]),
                false,
            )
            .await;
        // First identify: the full list is trivially "added", no event.
        assert!(node.events.try_recv().is_err());

        inner
            .consume_message(
                conn.as_ref(),
                message_from(&remote, &[], &["/safe/node/1.1", "/ipfs/id/push/1.0.0"]),
                true,
            )
            .await;
        match fixtures::expect_event(&mut node.events).await {
            IdentifyEvent::PeerProtocolsUpdated { peer: from, added, removed } => {
                assert_eq!(from, peer);
                assert_eq!(added, vec![StreamProtocol::new("/safe/node/1.1")]);
                assert_eq!(removed, vec![StreamProtocol::new("/safe/node/1.0")]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_identify_delta_can_be_opted_into() -> eyre::Result<()> {
        let mut node =
            fixtures::spawn_configured(false, |builder| builder.emit_first_identify_delta());
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn = fixtures::connection_to(&node, 1, peer);

        node.identify
            .inner
            .consume_message(
                conn.as_ref(),
                message_from(&remote, &[], &["/safe/node/1.0"]),
                false,
            )
            .await;
        match fixtures::expect_event(&mut node.events).await {
            IdentifyEvent::PeerProtocolsUpdated { added, removed, .. } => {
                assert_eq!(added, vec![StreamProtocol::new("/safe/node/1.0")]);
                assert!(removed.is_empty());
            }
            other => eyre::bail!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn observed_address_is_recorded_and_own_address_is_not_added() {
        let node = fixtures::spawn_node(false);
        let remote = Keypair::generate_ed25519();
        let peer = remote.public().to_peer_id();
        let conn: Arc<TestConnection> = fixtures::connection_to(&node, 1, peer);
        node.host.add_connection(peer);

        let observed: Multiaddr = "/ip4/203.0.113.3/tcp/7000".parse().unwrap();
        let mut message = message_from(&remote, &[], &[]);
        message.observed_addr = Some(observed.to_vec().into());

        node.identify
            .inner
            .consume_message(conn.as_ref(), message, false)
            .await;
        assert_eq!(node.identify.own_observed_addrs(), vec![observed]);
        // No listen addresses advertised: nothing lands in the address book,
        // not even the connection's own remote address.
        assert!(node.store.addrs(&peer).is_empty());
    }
}
