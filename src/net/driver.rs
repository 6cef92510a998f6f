//! Driver task: owns one control block in a dedicated task and talks to
//! the rest of the program through channels. Zero locks on the hot path.
//!
//! The engine's millisecond clock is an `Instant` epoch captured at
//! spawn; `check()` tells the task how long it may sleep before the next
//! flush deadline or retransmission is due.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arq_core::{ControlBlock, EngineConfig, Stats};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{ArqError, Result};
use crate::metrics;

/// Commands accepted by the driver task.
pub(crate) enum DriverCmd {
    Send {
        data: Bytes,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    Flush {
        reply: Option<oneshot::Sender<()>>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
    Close,
}

/// Clonable, lock-free handle to a driver task.
#[derive(Clone)]
pub(crate) struct DriverHandle {
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
}

impl DriverHandle {
    /// Queue application data and wait for the engine's verdict.
    pub async fn send(&self, data: Bytes) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Send {
                data,
                reply: Some(reply),
            })
            .map_err(|_| ArqError::closed())?;
        rx.await.map_err(|_| ArqError::closed())?
    }

    /// Queue application data without waiting; errors are only reported
    /// for a driver that is already gone.
    pub fn send_nowait(&self, data: Bytes) -> Result<()> {
        self.cmd_tx
            .send(DriverCmd::Send { data, reply: None })
            .map_err(|_| ArqError::closed())
    }

    /// Ask for an immediate flush.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Flush { reply: Some(reply) })
            .map_err(|_| ArqError::closed())?;
        rx.await.map_err(|_| ArqError::closed())
    }

    /// Fire-and-forget flush, usable from poll contexts.
    pub fn flush_nowait(&self) -> Result<()> {
        self.cmd_tx
            .send(DriverCmd::Flush { reply: None })
            .map_err(|_| ArqError::closed())
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Stats { reply })
            .map_err(|_| ArqError::closed())?;
        rx.await.map_err(|_| ArqError::closed())
    }

    /// Request an orderly shutdown; the task flushes once more and exits.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(DriverCmd::Close);
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Everything a stream needs to talk to its driver.
pub(crate) struct DriverParts {
    pub handle: DriverHandle,
    /// Inbound raw datagrams go here.
    pub packet_tx: mpsc::UnboundedSender<Bytes>,
    /// Reassembled messages come out here.
    pub delivered_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Raised when the link died on retransmission budget.
    pub dead: Arc<AtomicBool>,
}

/// Spawn a driver for conversation `conv` talking to `peer` through
/// `socket`.
pub(crate) fn spawn(
    conv: u32,
    config: EngineConfig,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
) -> DriverParts {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let mut engine = ControlBlock::new(conv, config);
    engine.set_output(move |datagram| {
        let _ = out_tx.send(Bytes::copy_from_slice(datagram));
    });

    let dead = Arc::new(AtomicBool::new(false));
    metrics::global().connection_created();

    let driver = Driver {
        engine,
        epoch: Instant::now(),
        cmd_rx,
        packet_rx,
        delivered_tx,
        out_rx,
        socket,
        peer,
        dead: dead.clone(),
    };
    tokio::spawn(driver.run());

    DriverParts {
        handle: DriverHandle { cmd_tx },
        packet_tx,
        delivered_rx,
        dead,
    }
}

struct Driver {
    engine: ControlBlock,
    epoch: Instant,
    cmd_rx: mpsc::UnboundedReceiver<DriverCmd>,
    packet_rx: mpsc::UnboundedReceiver<Bytes>,
    delivered_tx: mpsc::UnboundedSender<Bytes>,
    /// Datagrams the engine emitted, awaiting the socket.
    out_rx: mpsc::UnboundedReceiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    dead: Arc<AtomicBool>,
}

impl Driver {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Push every emitted datagram to the socket.
    async fn pump_output(&mut self) {
        while let Ok(datagram) = self.out_rx.try_recv() {
            if let Err(e) = self.socket.send_to(&datagram, self.peer).await {
                debug!(peer = %self.peer, error = %e, "datagram send failed");
            }
        }
    }

    /// Hand reassembled messages to the stream side.
    fn deliver(&mut self) {
        while let Some(msg) = self.engine.recv_bytes() {
            let _ = self.delivered_tx.send(msg);
        }
    }

    async fn run(mut self) {
        let conv = self.engine.conv();
        trace!(conv, peer = %self.peer, "driver started");
        self.engine.update(self.now_ms());

        loop {
            self.pump_output().await;
            self.deliver();

            if self.engine.is_dead() {
                self.dead.store(true, Ordering::Relaxed);
                warn!(conv, peer = %self.peer, "link dead, giving up");
                break;
            }

            let now = self.now_ms();
            let next = self.engine.check(now);
            let sleep_ms = u64::from(next.wrapping_sub(now).min(10_000));

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                    let now = self.now_ms();
                    self.engine.update(now);
                    // A retransmission can fall due between cadence ticks;
                    // flush it now rather than spinning until the tick.
                    if self.engine.check(now) == now {
                        self.engine.flush();
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(DriverCmd::Send { data, reply }) => {
                        let result = self.engine.send(&data).map_err(ArqError::from);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                        // Emit fresh data now instead of on the next tick.
                        self.engine.update(self.now_ms());
                        self.engine.flush();
                    }
                    Some(DriverCmd::Flush { reply }) => {
                        self.engine.update(self.now_ms());
                        self.engine.flush();
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                    }
                    Some(DriverCmd::Stats { reply }) => {
                        let _ = reply.send(self.engine.stats());
                    }
                    Some(DriverCmd::Close) | None => {
                        self.engine.flush();
                        self.pump_output().await;
                        break;
                    }
                },
                pkt = self.packet_rx.recv() => match pkt {
                    Some(pkt) => {
                        if let Err(e) = self.engine.input(pkt) {
                            trace!(conv, error = %e, "undecodable datagram dropped");
                        }
                        self.engine.update(self.now_ms());
                    }
                    None => {
                        // The socket side is gone; nothing more will arrive.
                        self.engine.flush();
                        self.pump_output().await;
                        break;
                    }
                },
            }
        }

        metrics::global().connection_closed(&self.engine.stats());
        trace!(conv, peer = %self.peer, "driver stopped");
    }
}
