// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use libp2p::PeerId;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("failed to open identify stream: {0}")]
    StreamOpenFailed(String),

    #[error("protocol negotiation failed: {0}")]
    ProtocolNegotiationFailed(String),

    #[error("failed to read identify message: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("failed to write identify message: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("identify message frame of {size} bytes exceeds the 8 KiB cap")]
    MessageTooLarge { size: usize },

    #[error("identify message split into more than 10 parts")]
    TooManyParts,

    #[error("malformed multiaddr in identify message")]
    MalformedAddress,

    #[error("malformed public key in identify message: {0}")]
    MalformedKey(#[from] libp2p::identity::DecodingError),

    #[error("public key derives peer id {derived}, connection reports {expected}")]
    KeyPeerIdMismatch { derived: PeerId, expected: PeerId },

    #[error("conflicting public key on record for peer {0}")]
    KeyConflict(PeerId),

    #[error("failed to reserve memory for an identify message")]
    MemoryReservationFailed,

    #[error("identify message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("identify stream timed out")]
    Timeout,

    #[error("identify service is shutting down")]
    ShuttingDown,
}
