//! High-level async stream with a TCP-like interface over datagrams.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use arq_core::Stats;

use crate::config::ArqConfig;
use crate::error::{ArqError, ConnectionError, Result};
use crate::net::driver::{self, DriverHandle, DriverParts};
use crate::pool;

/// Pick a conversation id for an outgoing connection; 0 is reserved for
/// "not yet assigned".
fn random_conv() -> u32 {
    loop {
        let conv = rand::random::<u32>();
        if conv != 0 {
            return conv;
        }
    }
}

/// Reliable, ordered stream over an unreliable datagram transport.
///
/// Message-oriented by default ([`send`](Self::send) /
/// [`recv`](Self::recv) preserve boundaries); the `AsyncRead` /
/// `AsyncWrite` adapters treat it as a byte pipe and pair naturally with
/// stream-mode configuration.
pub struct ArqStream {
    handle: DriverHandle,
    delivered_rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: BytesMut,
    conv: u32,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    dead: Arc<AtomicBool>,
    /// Client-side socket pump; server streams are fed by the listener.
    pump_task: Option<JoinHandle<()>>,
    /// Largest chunk one write submits, to stay well under the fragment
    /// limit in message mode.
    max_write: usize,
}

impl ArqStream {
    /// Connect to a remote endpoint, binding a fresh UDP socket.
    pub async fn connect(addr: SocketAddr, config: ArqConfig) -> Result<Self> {
        let bind_addr = if addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Self::connect_with_socket(Arc::new(socket), addr, config).await
    }

    /// Connect over a caller-supplied, already-bound socket.
    pub async fn connect_with_socket(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: ArqConfig,
    ) -> Result<Self> {
        config.validate()?;
        let conv = random_conv();
        let local_addr = socket.local_addr()?;
        let parts = driver::spawn(conv, config.engine.clone(), socket.clone(), peer);

        // Feed every datagram from the peer into the driver.
        let packet_tx = parts.packet_tx.clone();
        let recv_len = config.recv_buffer_bytes;
        let pump_task = tokio::spawn(async move {
            let mut buf = vec![0u8; recv_len];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if src != peer {
                            trace!(%src, "datagram from unknown source dropped");
                            continue;
                        }
                        if packet_tx.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "socket receive failed");
                        break;
                    }
                }
            }
        });

        info!(conv, peer = %peer, "stream connected");
        Ok(Self::assemble(
            conv,
            peer,
            local_addr,
            parts,
            Some(pump_task),
            &config,
        ))
    }

    /// Build a server-side stream around an already-spawned driver; the
    /// listener routes datagrams to it.
    pub(crate) fn from_parts(
        conv: u32,
        peer: SocketAddr,
        local_addr: SocketAddr,
        parts: DriverParts,
        config: &ArqConfig,
    ) -> Self {
        Self::assemble(conv, peer, local_addr, parts, None, config)
    }

    fn assemble(
        conv: u32,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        parts: DriverParts,
        pump_task: Option<JoinHandle<()>>,
        config: &ArqConfig,
    ) -> Self {
        let overhead = arq_core::wire::consts::OVERHEAD;
        let mss = config.engine.mtu.saturating_sub(overhead).max(1) as usize;
        Self {
            handle: parts.handle,
            delivered_rx: parts.delivered_rx,
            read_buf: pool::message(),
            conv,
            peer_addr,
            local_addr,
            dead: parts.dead,
            pump_task,
            max_write: mss * 64,
        }
    }

    /// Send one message (message mode) or a run of bytes (stream mode).
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.handle
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|e| self.refine_closed(e))
    }

    /// Next reassembled message, or `None` once the connection is done.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.delivered_rx.recv().await
    }

    /// Push everything queued out to the socket now.
    pub async fn flush(&self) -> Result<()> {
        self.handle.flush().await.map_err(|e| self.refine_closed(e))
    }

    /// Engine counters for this connection.
    pub async fn stats(&self) -> Result<Stats> {
        self.handle.stats().await.map_err(|e| self.refine_closed(e))
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once the driver exited, whether by close or dead link.
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Ask the driver to flush once more and stop.
    pub async fn close(&mut self) -> Result<()> {
        self.handle.close();
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        info!(conv = self.conv, peer = %self.peer_addr, "stream closed");
        Ok(())
    }

    /// Map a generic "closed" error to "lost" when the link actually died.
    fn refine_closed(&self, err: ArqError) -> ArqError {
        if self.dead.load(Ordering::Relaxed) {
            if let ArqError::Connection(ConnectionError::Closed) = err {
                return ArqError::Connection(ConnectionError::Lost);
            }
        }
        err
    }
}

impl Drop for ArqStream {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        let buf = std::mem::take(&mut self.read_buf);
        pool::recycle(buf);
    }
}

impl AsyncRead for ArqStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Serve leftovers from the previous message first.
        if !self.read_buf.is_empty() {
            let n = buf.remaining().min(self.read_buf.len());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        match self.delivered_rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            // Driver gone: clean end-of-stream.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for ArqStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = buf.len().min(self.max_write);
        match self.handle.send_nowait(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.handle.flush_nowait() {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.handle.close();
        Poll::Ready(Ok(()))
    }
}
