// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::host::Host;
use libp2p::{core::SignedEnvelope, Multiaddr, StreamProtocol};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::RwLock;

/// Immutable record of the identity this node currently advertises. Replaced
/// atomically on local change, never mutated in place.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    /// Milliseconds since the epoch, strictly increasing across refreshes.
    pub(crate) timestamp: u64,
    pub(crate) protocols: Vec<StreamProtocol>,
    pub(crate) listen_addrs: Vec<Multiaddr>,
    /// This node's own signed peer record, unless emission is disabled.
    pub(crate) record: Option<SignedEnvelope>,
}

/// Holds the active [`Snapshot`]; the lock is only ever taken for a pointer
/// load or swap.
pub(crate) struct SnapshotStore {
    host: Arc<dyn Host>,
    signed_records: bool,
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    /// A store starts out with a freshly built snapshot, so the active
    /// pointer is never empty.
    pub(crate) fn new(host: Arc<dyn Host>, signed_records: bool) -> Self {
        let initial = Arc::new(Self::build(host.as_ref(), signed_records, 0));
        Self {
            host,
            signed_records,
            current: RwLock::new(initial),
        }
    }

    /// Cheap handle to the active snapshot.
    pub(crate) async fn current(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Rebuild the snapshot from host state and swap it in.
    pub(crate) async fn refresh(&self) -> Arc<Snapshot> {
        let mut current = self.current.write().await;
        let snapshot = Arc::new(Self::build(
            self.host.as_ref(),
            self.signed_records,
            current.timestamp,
        ));
        *current = snapshot.clone();
        snapshot
    }

    fn build(host: &dyn Host, signed_records: bool, last_timestamp: u64) -> Snapshot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let record = if signed_records {
            host.peer_store().peer_record(&host.local_peer_id())
        } else {
            None
        };
        Snapshot {
            // The clock may not move between two refreshes; order them anyway.
            timestamp: now.max(last_timestamp + 1),
            protocols: host.supported_protocols(),
            listen_addrs: host.listen_addrs(),
            record,
        }
    }
}
