//! Receive and send loops of a client connection

use crate::client::replica::Replica;
use crate::correlation::PendingQueries;
use crate::protocol::codec::content_offset;
use crate::protocol::{Packet, PacketCodec, Progress, QueryId, Transfers};
use crate::types::{Error, ProtocolError};
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;

/// Container content is written in pieces of this size, with progress
/// reported after each one.
const WRITE_CHUNK: usize = 64 * 1024;

/// Routes every packet read from the relay until the stream ends.
///
/// Replies complete their pending query; everything else is fed to the
/// replica, whose answers are queued on `outgoing`. When the stream ends,
/// pending queries fail with [`Error::ConnectionLost`].
pub async fn receive<S>(
    mut incoming: S,
    pending: Arc<PendingQueries>,
    replica: Arc<Mutex<Replica>>,
    outgoing: mpsc::UnboundedSender<Packet>,
) where
    S: Stream<Item = Result<Packet, ProtocolError>> + Unpin,
{
    while let Some(next) = incoming.next().await {
        let packet = match next {
            Ok(packet) => packet,
            Err(error) => {
                tracing::error!("Closing connection after protocol error: {}", error);
                break;
            }
        };
        tracing::debug!(tag = packet.tag(), "Received packet");

        if let Some(id) = packet.reply_to() {
            let reply = match packet {
                Packet::Error(_, reply) => Err(Error::Rejected {
                    code: reply.code,
                    message: reply.message,
                }),
                other => Ok(other),
            };
            pending.complete(id, reply);
            continue;
        }

        let answers = lock(&replica).handle(packet);
        for answer in answers {
            if outgoing.send(answer).is_err() {
                tracing::warn!("Failed to queue packet, connection closing");
            }
        }
    }

    tracing::info!("Connection to relay closed");
    pending.fail_all();
    lock(&replica).connection_lost();
}

/// Writes queued packets until the queue closes or the transport fails.
///
/// A packet that cannot be encoded fails the query it belongs to; the
/// connection stays usable.
pub async fn send<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    pending: Arc<PendingQueries>,
    transfers: Arc<Transfers>,
) where
    W: AsyncWrite + Unpin,
{
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::new();

    while let Some(packet) = queue.recv().await {
        tracing::debug!(tag = packet.tag(), "Sending packet");
        let query = packet.query_id();
        let container = packet.is_container();

        buffer.clear();
        if let Err(error) = codec.encode(packet, &mut buffer) {
            tracing::error!("Failed to encode packet: {}", error);
            if let Some(id) = query {
                pending.complete(id, Err(error.into()));
            }
            continue;
        }

        let written = match query {
            Some(id) if container => write_reporting(&mut writer, &buffer, id, &transfers).await,
            _ => writer.write_all(&buffer).await,
        };
        if let Err(error) = written {
            tracing::error!("Failed to send packet: {}", error);
            break;
        }
        if let Err(error) = writer.flush().await {
            tracing::error!("Failed to flush connection: {}", error);
            break;
        }
    }
}

/// Writes an encoded container packet, reporting how much of its content
/// went out.
async fn write_reporting<W>(
    writer: &mut W,
    frame: &[u8],
    id: QueryId,
    transfers: &Transfers,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let start = content_offset(frame).unwrap_or(frame.len()).min(frame.len());
    let (header, content) = frame.split_at(start);
    writer.write_all(header).await?;

    let total = content.len();
    if total == 0 {
        transfers.report(id, Progress { transferred: 0, total });
    }
    let mut transferred = 0;
    for chunk in content.chunks(WRITE_CHUNK) {
        writer.write_all(chunk).await?;
        transferred += chunk.len();
        transfers.report(id, Progress { transferred, total });
    }
    Ok(())
}

pub(crate) fn lock(replica: &Mutex<Replica>) -> std::sync::MutexGuard<'_, Replica> {
    replica
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
