//! Length-prefixed framing of packets
//!
//! ```text
//! <u32 BE header length><CBOR header map>[<u32 BE content length><content>]
//! ```
//!
//! The content section is only present for container packets.

use crate::protocol::commands::Blob;
use crate::protocol::packet::{Header, Packet, Payload};
use crate::protocol::progress::{Progress, Transfers};
use crate::protocol::{MAX_CONTAINER_SIZE, MAX_HEADER_SIZE};
use crate::types::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    /// Header of a container packet read, waiting for its content.
    Content(Header),
}

/// Frames [`Packet`]s on a byte stream.
#[derive(Debug, Default)]
pub struct PacketCodec {
    state: DecodeState,
    transfers: Option<Arc<Transfers>>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports how much of each incoming container has arrived.
    pub fn with_progress(transfers: Arc<Transfers>) -> Self {
        Self {
            state: DecodeState::Header,
            transfers: Some(transfers),
        }
    }

    fn report(&self, header: &Header, progress: Progress) {
        if let (Some(transfers), Some(id)) = (&self.transfers, header.query_id()) {
            transfers.report(id, progress);
        }
    }
}

/// Offset of the content section in an encoded container packet.
pub fn content_offset(encoded: &[u8]) -> Option<usize> {
    let header = declared_size(encoded)?;
    Some(LENGTH_PREFIX + header + LENGTH_PREFIX)
}

fn declared_size(src: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX] = src.get(..LENGTH_PREFIX)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Reads one length-prefixed section, or `None` if it is not complete yet.
fn take_section(src: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, ProtocolError> {
    let Some(size) = declared_size(src) else {
        return Ok(None);
    };

    if size > max {
        return Err(ProtocolError::TooLarge { size, max });
    }

    if src.len() < LENGTH_PREFIX + size {
        src.reserve(LENGTH_PREFIX + size - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX);
    Ok(Some(src.split_to(size)))
}

fn put_section(dst: &mut BytesMut, section: &[u8], max: usize) -> Result<(), ProtocolError> {
    if section.len() > max {
        return Err(ProtocolError::TooLarge {
            size: section.len(),
            max,
        });
    }

    dst.reserve(LENGTH_PREFIX + section.len());
    dst.put_u32(section.len() as u32);
    dst.extend_from_slice(section);
    Ok(())
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Header => {
                    let Some(bytes) = take_section(src, MAX_HEADER_SIZE)? else {
                        return Ok(None);
                    };
                    let header = Header::parse(&bytes)?;

                    if !header.kind().container {
                        return header.into_packet().map(Some);
                    }
                    self.state = DecodeState::Content(header);
                }
                DecodeState::Content(mut header) => {
                    let Some(bytes) = take_section(src, MAX_CONTAINER_SIZE)? else {
                        if let Some(total) = declared_size(src) {
                            let transferred = (src.len() - LENGTH_PREFIX).min(total);
                            self.report(&header, Progress { transferred, total });
                        }
                        self.state = DecodeState::Content(header);
                        return Ok(None);
                    };
                    let total = bytes.len();
                    self.report(
                        &header,
                        Progress {
                            transferred: total,
                            total,
                        },
                    );
                    header.set_content(Blob(bytes.to_vec()));

                    return header.into_packet().map(Some);
                }
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let tag = packet.tag();
        let frame = packet.into_frame()?;
        let header = serde_cbor::to_vec(&frame.header).map_err(|source| {
            ProtocolError::Malformed {
                tag: tag.to_string(),
                source,
            }
        })?;

        if let Payload::Container(content) = &frame.payload {
            if content.len() > MAX_CONTAINER_SIZE {
                return Err(ProtocolError::TooLarge {
                    size: content.len(),
                    max: MAX_CONTAINER_SIZE,
                });
            }
        }

        put_section(dst, &header, MAX_HEADER_SIZE)?;
        if let Payload::Container(content) = frame.payload {
            put_section(dst, &content.0, MAX_CONTAINER_SIZE)?;
        }
        Ok(())
    }
}
