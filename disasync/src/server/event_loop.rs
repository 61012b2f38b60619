//! Per-connection event loop
//!
//! Each accepted socket is split into a reader, which decodes packets and
//! dispatches them to the [`Relay`], and a writer task draining the
//! connection's outgoing queue. A protocol error closes the connection.
//! The connection is registered with the relay before it gets here.

use crate::protocol::{Packet, PacketCodec};
use crate::server::relay::{ConnectionId, Relay};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

/// Serves one registered client until it disconnects or violates the
/// protocol. `queue` receives what the relay sends to `id`.
pub async fn handle_connection<T>(
    relay: Arc<Relay>,
    id: ConnectionId,
    queue: mpsc::UnboundedReceiver<Packet>,
    io: T,
    peer: SocketAddr,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = tracing::info_span!("connection", %peer);
    run(relay, id, queue, io).instrument(span).await
}

async fn run<T>(
    relay: Arc<Relay>,
    id: ConnectionId,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    io: T,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    let mut incoming = FramedRead::new(reader, PacketCodec::new());
    let mut outgoing = FramedWrite::new(writer, PacketCodec::new());
    tracing::info!(connection = %id, "Client connected");

    let writer = tokio::spawn(
        async move {
            while let Some(packet) = queue.recv().await {
                if let Err(error) = outgoing.send(packet).await {
                    tracing::warn!("Failed to write packet: {}", error);
                    break;
                }
            }
        }
        .in_current_span(),
    );

    while let Some(next) = incoming.next().await {
        match next {
            Ok(packet) => relay.dispatch(id, packet).await,
            Err(error) => {
                tracing::error!(connection = %id, "Closing connection after protocol error: {}", error);
                break;
            }
        }
    }

    // Dropping the relay's sender lets the writer flush what is queued and stop.
    relay.unregister(id);
    if let Err(error) = writer.await {
        tracing::warn!("Writer task failed: {}", error);
    }
    tracing::info!(connection = %id, "Client disconnected");
}
