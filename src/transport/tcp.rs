use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::client::Connection;
use crate::transport::message::WireMessage;
use crate::utils::Result;

/// Lock the broker. Never hold the guard across an `.await`.
pub fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 4-byte big-endian length prefix, as used by every harq socket.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

/// Bind `addr` and serve clients until the task is dropped.
pub async fn start_server(addr: &str, broker: Arc<Mutex<Broker>>, max_connections: usize) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("harq listening on {}", listener.local_addr()?);
    serve(listener, broker, max_connections).await;
    Ok(())
}

/// Accept loop. Each socket gets its own task; sockets beyond
/// `max_connections` are closed right away.
pub async fn serve(listener: TcpListener, broker: Arc<Mutex<Broker>>, max_connections: usize) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {e}");
                continue;
            }
        };

        if lock(&broker).connection_count() >= max_connections {
            warn!("Refusing {peer}: {max_connections} connections already open");
            drop(stream);
            continue;
        }

        let broker = broker.clone();
        tokio::spawn(async move {
            handle_socket(stream, broker, None).await;
            debug!("{peer} done");
        });
    }
}

/// Run one socket until it closes. `greeting` is written before anything the
/// broker sends.
pub(crate) async fn handle_socket(stream: TcpStream, broker: Arc<Mutex<Broker>>, greeting: Option<Bytes>) {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    // Create channel for this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    if let Some(frame) = greeting {
        let _ = tx.send(frame);
    }

    let id = lock(&broker).register(Connection::new(tx));
    info!("{id} connected from {peer:?}");

    // broker -> socket
    let send_loop = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                warn!("Failed to write to {id}: {e}");
                break;
            }
        }
        debug!("Send loop closed for {id}");
    });

    // socket -> broker
    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Read from {id} failed: {e}");
                break;
            }
        };
        let handled = {
            let mut guard = lock(&broker);
            let handled = guard.handle_frame(id, &frame);
            guard.cleanup();
            handled
        };
        if let Err(e) = handled {
            warn!("Closing {id} after a bad frame: {e}");
            break;
        }
    }

    {
        let mut guard = lock(&broker);
        guard.disconnect(id);
        guard.cleanup();
    }

    // the connection and its sender are gone, so the send loop drains and ends
    let _ = send_loop.await;
    info!("{id} disconnected");
}

/// Send one message to the broker at `addr` and close the socket.
pub async fn publish_once(addr: &str, msg: WireMessage) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, codec());
    framed.send(msg.to_bytes()).await?;
    SinkExt::<Bytes>::close(&mut framed).await?;
    debug!("Published one message to {addr}");
    Ok(())
}
