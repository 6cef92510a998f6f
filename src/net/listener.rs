//! Listener: one shared socket, demultiplexed by (peer, conversation).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use arq_core::peek_conv;

use crate::config::ArqConfig;
use crate::error::{ArqError, Result};
use crate::net::driver;
use crate::net::stream::ArqStream;

/// One inbound route: where this conversation's datagrams go, and when
/// it last spoke.
struct Route {
    packet_tx: mpsc::UnboundedSender<Bytes>,
    last_seen: Instant,
}

/// Accepts incoming conversations on a bound socket.
///
/// The first datagram from an unknown (peer address, conversation id)
/// pair creates a server-side [`ArqStream`] that shares the listener
/// socket; conversation assignment itself is the client's choice.
pub struct ArqListener {
    local_addr: SocketAddr,
    accept_rx: mpsc::UnboundedReceiver<ArqStream>,
    demux_task: JoinHandle<()>,
}

impl ArqListener {
    /// Bind a UDP socket and start demultiplexing.
    pub async fn bind(addr: SocketAddr, config: ArqConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::with_socket(socket, config)
    }

    /// Listen on a caller-supplied, already-bound socket.
    pub fn with_socket(socket: UdpSocket, config: ArqConfig) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let demux_task = tokio::spawn(demux_loop(socket, config, local_addr, accept_tx));
        info!(addr = %local_addr, "listener started");
        Ok(Self {
            local_addr,
            accept_rx,
            demux_task,
        })
    }

    /// Next incoming connection.
    pub async fn accept(&mut self) -> Result<ArqStream> {
        self.accept_rx.recv().await.ok_or_else(ArqError::closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ArqListener {
    fn drop(&mut self) {
        self.demux_task.abort();
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    config: ArqConfig,
    local_addr: SocketAddr,
    accept_tx: mpsc::UnboundedSender<ArqStream>,
) {
    let mut routes: HashMap<(SocketAddr, u32), Route> = HashMap::new();
    let mut buf = vec![0u8; config.recv_buffer_bytes];
    let mut sweep = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "listener receive failed");
                        break;
                    }
                };
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                let Some(conv) = peek_conv(&datagram) else {
                    trace!(%peer, len, "runt datagram dropped");
                    continue;
                };

                let key = (peer, conv);
                if let Some(route) = routes.get_mut(&key) {
                    route.last_seen = Instant::now();
                    if route.packet_tx.send(datagram).is_ok() {
                        continue;
                    }
                    // Stream went away; forget the route. The peer's next
                    // retransmission may establish a fresh one.
                    routes.remove(&key);
                    continue;
                }

                debug!(%peer, conv, "new incoming conversation");
                let parts = driver::spawn(conv, config.engine.clone(), socket.clone(), peer);
                let _ = parts.packet_tx.send(datagram);
                routes.insert(
                    key,
                    Route {
                        packet_tx: parts.packet_tx.clone(),
                        last_seen: Instant::now(),
                    },
                );
                let stream = ArqStream::from_parts(conv, peer, local_addr, parts, &config);
                if accept_tx.send(stream).is_err() {
                    // Listener handle dropped; stop serving.
                    break;
                }
            }
            _ = sweep.tick() => {
                let idle = config.idle_timeout;
                routes.retain(|(peer, conv), route| {
                    let keep = !route.packet_tx.is_closed()
                        && route.last_seen.elapsed() < idle;
                    if !keep {
                        debug!(%peer, conv, "route expired");
                    }
                    keep
                });
            }
        }
    }
}
