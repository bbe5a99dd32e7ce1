//! Listeners and socket I/O tasks.
//!
//! The core task never touches sockets directly: listeners and per-socket
//! read/write tasks run on the runtime and talk to the core through the
//! event queue and per-connection outbound channels.

pub mod connection;

use std::net::{Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use modircd_proto::{LineCodec, Message};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, warn};

use crate::config::{Config, Endpoint};
use self::connection::{ConnId, Event, ListenerKind};

/// Bind one endpoint descriptor and start its accept loop.
pub async fn bind_endpoint(
    desc: &str,
    kind: ListenerKind,
    tx: UnboundedSender<Event>,
) -> std::io::Result<JoinHandle<()>> {
    let endpoint = Endpoint::parse(desc)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, endpoint.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, ?kind, secure = endpoint.secure, "listening");
    let secure = endpoint.secure;
    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    if tx
                        .send(Event::Accept {
                            stream,
                            addr,
                            listener: kind,
                            secure,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }))
}

/// Bind every configured endpoint. Returns the handles that bound; bind
/// failures log and are skipped.
pub async fn bind_all(
    config: &Config,
    tx: &UnboundedSender<Event>,
) -> Vec<((ListenerKind, String), JoinHandle<()>)> {
    let mut bound = Vec::new();
    let descriptors = config
        .bind_client
        .iter()
        .map(|desc| (ListenerKind::Client, desc.clone()))
        .chain(
            config
                .bind_server
                .iter()
                .map(|desc| (ListenerKind::Server, desc.clone())),
        );
    for (kind, desc) in descriptors {
        match bind_endpoint(&desc, kind, tx.clone()).await {
            Ok(handle) => bound.push(((kind, desc), handle)),
            Err(e) => error!(desc = %desc, error = %e, "could not bind"),
        }
    }
    bound
}

/// Spawn the read and write tasks for an accepted socket. Returns the
/// outbound sender the core stores on the connection.
pub fn spawn_io(
    conn: ConnId,
    stream: TcpStream,
    tx: UnboundedSender<Event>,
) -> UnboundedSender<Message> {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(read_task(conn, read_half, tx));
    tokio::spawn(write_task(write_half, out_rx));
    out_tx
}

async fn read_task(conn: ConnId, read_half: OwnedReadHalf, tx: UnboundedSender<Event>) {
    let mut framed = FramedRead::new(read_half, LineCodec);
    loop {
        match framed.next().await {
            Some(Ok(frame)) => {
                if tx.send(Event::Frame { conn, frame }).is_err() {
                    return;
                }
            }
            Some(Err(_)) | None => break,
        }
    }
    let _ = tx.send(Event::Closed { conn });
}

async fn write_task(
    write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut framed = FramedWrite::new(write_half, LineCodec);
    while let Some(msg) = out_rx.recv().await {
        if framed.send(&msg).await.is_err() {
            break;
        }
    }
    // Dropping the write half shuts the socket down.
}
