//! The TCP cluster bus.
//!
//! Owns the sockets the engine cannot: one outbound link per peer (dialed
//! on demand when the tick queues a `Connect`), plus inbound connections
//! accepted on the bus port. Frames are delimited by the fixed header's
//! total-length field; each complete frame is handed to the engine under
//! the single engine lock, and the outbox is drained after every
//! interaction, so the protocol behaves exactly like the single-threaded
//! model it was specified against.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flint_cluster::{frame_length, Cluster, Event, LinkId, MemoryDataPlane, NodeId, Outbound};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::time::now_ms;

/// The engine tick period: ten times per second.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Dial timeout for outbound bus links.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-link outbound queue depth; the bus is a low-traffic channel.
const SEND_QUEUE_DEPTH: usize = 64;

pub type Engine = Cluster<MemoryDataPlane>;
pub type SharedEngine = Arc<Mutex<Engine>>;

struct LinkHandle {
    seq: u64,
    tx: mpsc::Sender<Bytes>,
}

/// Handle to the bus state: the engine plus the write halves of the live
/// outbound links. Cloning is cheap; every task owns a clone.
#[derive(Clone)]
pub struct Bus {
    engine: SharedEngine,
    links: Arc<Mutex<HashMap<NodeId, LinkHandle>>>,
    link_seq: Arc<AtomicU64>,
}

impl Bus {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            links: Arc::new(Mutex::new(HashMap::new())),
            link_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Runs the bus: the accept loop and the 10 Hz tick driver. Returns
    /// only on listener failure.
    pub async fn run(self, listener: TcpListener) -> std::io::Error {
        let ticker_bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                let now = now_ms();
                ticker_bus.engine.lock().await.tick(now);
                ticker_bus.settle(now).await;
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let bus = self.clone();
                    tokio::spawn(async move {
                        bus.serve_inbound(stream, addr.ip().to_string()).await;
                    });
                }
                Err(err) => {
                    error!(%err, "bus accept failed");
                    return err;
                }
            }
        }
    }

    /// Drains the outbox, runs the before-sleep hook, and drains whatever
    /// the deferred work queued on top. A persistence failure here is
    /// fatal: the node view is on the critical path for epoch bumps.
    pub async fn settle(&self, now: u64) {
        self.drain_outbox(now).await;
        let result = {
            let mut engine = self.engine.lock().await;
            for event in engine.take_events() {
                match event {
                    Event::PublishReceived { channel, message } => {
                        debug!(
                            channel = %String::from_utf8_lossy(&channel),
                            len = message.len(),
                            "bus publish received"
                        );
                    }
                }
            }
            engine.before_sleep(now)
        };
        if let Err(err) = result {
            error!(%err, "can't update cluster config file, shutting down");
            std::process::exit(1);
        }
        self.drain_outbox(now).await;
    }

    async fn drain_outbox(&self, now: u64) {
        loop {
            let actions = self.engine.lock().await.take_outbox();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                self.apply(action, now).await;
            }
        }
    }

    fn apply(&self, action: Outbound, _now: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match action {
                Outbound::Connect {
                    node,
                    host,
                    bus_port,
                } => {
                    let bus = self.clone();
                    tokio::spawn(async move {
                        let dial = tokio::time::timeout(
                            CONNECT_TIMEOUT,
                            TcpStream::connect((host.as_str(), bus_port)),
                        )
                        .await;
                        match dial {
                            Ok(Ok(stream)) => bus.register_outbound(node, stream).await,
                            _ => {
                                debug!(node = %node.short(), host, bus_port, "bus connect failed");
                                bus.engine.lock().await.connect_failed(node, now_ms());
                            }
                        }
                    });
                }
                Outbound::Send { node, bytes } => {
                    let tx = {
                        let links = self.links.lock().await;
                        links.get(&node).map(|l| l.tx.clone())
                    };
                    match tx {
                        Some(tx) => {
                            if tx.send(bytes).await.is_err() {
                                self.links.lock().await.remove(&node);
                                self.engine.lock().await.link_closed(node);
                            }
                        }
                        // the link went away between queueing and sending;
                        // the next tick reconnects
                        None => self.engine.lock().await.link_closed(node),
                    }
                }
                Outbound::Disconnect { node } => {
                    self.links.lock().await.remove(&node);
                }
            }
        })
    }

    /// Wires up a freshly dialed outbound link: writer task, engine
    /// callback (which queues the first PING/MEET), then the read loop.
    async fn register_outbound(self, node: NodeId, stream: TcpStream) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set nodelay on bus link");
        }
        let (mut read_half, write_half) = stream.into_split();
        let seq = self.link_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        self.links.lock().await.insert(node, LinkHandle { seq, tx });
        tokio::spawn(writer_task(write_half, rx));

        let now = now_ms();
        self.engine.lock().await.link_established(node, now);
        self.settle(now).await;

        // read loop for the peer's traffic on our link
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let close_reason = loop {
            match read_one_frame(&mut read_half, &mut buf).await {
                Ok(Some(frame)) => {
                    let now = now_ms();
                    let outcome = {
                        let mut engine = self.engine.lock().await;
                        engine.handle_packet(LinkId::Peer(node), &frame, now)
                    };
                    if !outcome.replies.is_empty() {
                        let tx = {
                            let links = self.links.lock().await;
                            links.get(&node).map(|l| l.tx.clone())
                        };
                        if let Some(tx) = tx {
                            for reply in outcome.replies {
                                if tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    self.settle(now).await;
                    if outcome.close_link {
                        break "engine closed link";
                    }
                }
                Ok(None) => break "peer closed connection",
                Err(err) => {
                    debug!(%err, node = %node.short(), "bus link read error");
                    break "read error";
                }
            }
        };
        debug!(node = %node.short(), reason = close_reason, "outbound bus link down");

        // only tear down our own registration; a reconnect may already
        // have replaced it
        {
            let mut links = self.links.lock().await;
            if links.get(&node).is_some_and(|l| l.seq == seq) {
                links.remove(&node);
            }
        }
        self.engine.lock().await.link_closed(node);
    }

    /// Serves one accepted inbound connection.
    async fn serve_inbound(self, stream: TcpStream, peer_host: String) {
        debug!(peer = %peer_host, "accepted bus connection");
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match read_one_frame(&mut read_half, &mut buf).await {
                Ok(Some(frame)) => {
                    let now = now_ms();
                    let outcome = {
                        let mut engine = self.engine.lock().await;
                        engine.handle_packet(
                            LinkId::Accepted {
                                peer_host: peer_host.clone(),
                            },
                            &frame,
                            now,
                        )
                    };
                    for reply in &outcome.replies {
                        if write_half.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                    self.settle(now).await;
                    if outcome.close_link {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    debug!(%err, peer = %peer_host, "dropping inbound bus connection");
                    return;
                }
            }
        }
    }
}

/// Reads until one complete frame is buffered. Returns `None` on a clean
/// remote close, an error on I/O failure or a corrupt header.
async fn read_one_frame(
    read_half: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> std::io::Result<Option<Bytes>> {
    loop {
        if let Some(len) = frame_length(buf)? {
            if buf.len() >= len {
                return Ok(Some(buf.split_to(len).freeze()));
            }
        }
        let read = read_half.read_buf(buf).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
    }
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = write_half.write_all(&bytes).await {
            debug!(%err, "bus link write error");
            return;
        }
    }
}

/// Binds the bus listener. A failure here is fatal for the node.
pub async fn bind_bus(host: &str, bus_port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((host, bus_port)).await?;
    info!(%host, bus_port, "cluster bus listening");
    Ok(listener)
}
