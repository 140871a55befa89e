// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Error;
use libp2p::{PeerId, StreamProtocol};

/// Events emitted by the identify service; to be consumed by the upper layers.
#[derive(Debug)]
pub enum IdentifyEvent {
    /// The first identify exchange on a connection finished successfully.
    IdentificationCompleted { peer: PeerId },
    /// The first identify exchange on a connection failed. The wait handle
    /// still resolves.
    IdentificationFailed { peer: PeerId, reason: Error },
    /// An identify push carried a protocol list differing from the one on
    /// record. Not emitted for the first identify on a connection, where the
    /// whole list would trivially count as added.
    PeerProtocolsUpdated {
        peer: PeerId,
        added: Vec<StreamProtocol>,
        removed: Vec<StreamProtocol>,
    },
}
