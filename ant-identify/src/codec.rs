// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::{Error, Result};
use prost::Message;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-frame cap when reading. Signed peer records do not fit the legacy cap,
/// hence the larger allowance.
pub(crate) const MAX_FRAME_SIZE: usize = 8 * 1024;

/// Frame size older peers are known to enforce on a single identify frame.
pub(crate) const LEGACY_FRAME_SIZE: usize = 2 * 1024;

/// A logical identify message may arrive split over this many frames at most.
pub(crate) const MAX_MESSAGE_PARTS: usize = 10;

pub(crate) mod pb {
    /// The identify wire message. Field tags are fixed by the protocol; all
    /// fields are optional.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Identify {
        #[prost(string, optional, tag = "5")]
        pub protocol_version: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(string, optional, tag = "6")]
        pub agent_version: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(bytes = "bytes", optional, tag = "1")]
        pub public_key: ::core::option::Option<::prost::bytes::Bytes>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub listen_addrs: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
        #[prost(bytes = "bytes", optional, tag = "4")]
        pub observed_addr: ::core::option::Option<::prost::bytes::Bytes>,
        #[prost(string, repeated, tag = "3")]
        pub protocols: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(bytes = "bytes", optional, tag = "8")]
        pub signed_peer_record: ::core::option::Option<::prost::bytes::Bytes>,
    }
}

/// Read one logical identify message: up to [`MAX_MESSAGE_PARTS`]
/// varint-delimited frames merged field-wise (scalars overwrite, repeated
/// fields append). A clean EOF ends the read; data past the frame cap fails
/// with [`Error::TooManyParts`].
pub(crate) async fn read_identify_message<S>(stream: &mut S) -> Result<pb::Identify>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut message = pb::Identify::default();
    let mut parts = 0;
    loop {
        let Some(len) = read_frame_len(stream).await? else {
            break;
        };
        if parts == MAX_MESSAGE_PARTS {
            return Err(Error::TooManyParts);
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge { size: len });
        }
        let mut frame = vec![0u8; len];
        stream
            .read_exact(&mut frame)
            .await
            .map_err(Error::ReadFailed)?;
        message.merge(frame.as_slice())?;
        parts += 1;
    }
    Ok(message)
}

/// Write one logical identify message. A message that fits the legacy frame
/// size, or that carries no signed record, goes out as a single frame.
/// Otherwise the base message and the signed record are sent as two separate
/// frames, so peers enforcing the legacy cap per frame can still read both.
pub(crate) async fn write_identify_message<S>(stream: &mut S, message: &pb::Identify) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if message.signed_peer_record.is_none() || message.encoded_len() <= LEGACY_FRAME_SIZE {
        return write_frame(stream, message).await;
    }

    let mut base = message.clone();
    let record = base.signed_peer_record.take();
    write_frame(stream, &base).await?;
    write_frame(
        stream,
        &pb::Identify {
            signed_peer_record: record,
            ..Default::default()
        },
    )
    .await
}

async fn write_frame<S>(stream: &mut S, message: &pb::Identify) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(message.encoded_len() + 4);
    message
        .encode_length_delimited(&mut buf)
        .map_err(|err| Error::WriteFailed(io::Error::new(io::ErrorKind::Other, err)))?;
    stream.write_all(&buf).await.map_err(Error::WriteFailed)?;
    stream.flush().await.map_err(Error::WriteFailed)?;
    Ok(())
}

/// Read the varint length prefix of the next frame. `None` on a clean EOF,
/// an error on EOF in the middle of a prefix.
async fn read_frame_len<S>(stream: &mut S) -> Result<Option<usize>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        let read = stream.read(&mut byte).await.map_err(Error::ReadFailed)?;
        if read == 0 {
            if shift == 0 {
                return Ok(None);
            }
            return Err(Error::ReadFailed(io::ErrorKind::UnexpectedEof.into()));
        }
        len |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(len as usize));
        }
        shift += 7;
        if shift >= 35 {
            return Err(Error::Decode(prost::DecodeError::new(
                "frame length prefix overflows",
            )));
        }
    }
}
