//! # TCP Transport
//!
//! Both channels run over plain TCP with length-prefixed frames: a 4-byte
//! big-endian length followed by the JSON body, at most
//! [`MAX_FRAME_SIZE`] bytes.
//!
//! ## Coordinator
//!
//! - Message listener on `host:port`. Each connecting worker sends a hello
//!   frame (`{"node_id": ...}`) first; its connection is then addressable
//!   by that id through `send_to`.
//! - Discovery listener on `host:discovery_port`. Every accepted connection
//!   is a subscriber; `publish` writes to all of them and drops the dead.
//!
//! ## Worker
//!
//! Background tasks keep one connection to each coordinator listener,
//! reconnecting every `poll_interval` while it is down. Binding waits for
//! the outcome of the first upstream dial, so a reachable coordinator is
//! connected by the time `bind` returns. `send_upstream` fails while
//! disconnected.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::close_signal::CloseSignal;
use crate::domain::{NodeConfig, NodeId, NodeType, TransportError, MAX_FRAME_SIZE};
use crate::ports::{InboundFrame, Transport, TransportBinder};

// =============================================================================
// Framing
// =============================================================================

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Oversized frames are rejected before
/// their body is read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// How long an accepted connection may stay silent before its hello frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the first upstream dial, on top of one `poll_interval`.
const FIRST_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// First frame a worker sends on the message channel.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
}

/// Read and decode the hello frame, giving up after `wait`.
async fn read_hello<R>(reader: &mut R, wait: Duration) -> Result<Hello, TransportError>
where
    R: AsyncRead + Unpin,
{
    let bytes = tokio::time::timeout(wait, read_frame(reader))
        .await
        .map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no hello frame received",
            ))
        })??;
    serde_json::from_slice(&bytes).map_err(|e| {
        TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

type Outbox = mpsc::UnboundedSender<Vec<u8>>;

/// Spawn a task draining `rx` into `writer`. Ends on the first write error
/// or once every sender is dropped.
fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "frame write failed, closing connection");
                break;
            }
        }
    })
}

// =============================================================================
// Binder
// =============================================================================

/// Binds [`TcpTransport`]s from node configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportBinder;

#[async_trait]
impl TransportBinder for TcpTransportBinder {
    async fn bind(
        &self,
        local_id: &NodeId,
        config: &NodeConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = match config.node_type {
            NodeType::Coordinator => TcpTransport::listen(local_id, config).await?,
            NodeType::Worker => TcpTransport::connect(local_id, config).await?,
        };
        Ok(Arc::new(transport))
    }
}

// =============================================================================
// Transport
// =============================================================================

struct PeerConnection {
    connection_id: u64,
    outbox: Outbox,
}

#[derive(Default)]
struct CoordinatorState {
    peers: Mutex<HashMap<NodeId, PeerConnection>>,
    subscribers: Mutex<Vec<Outbox>>,
    next_connection: AtomicU64,
}

enum Side {
    Coordinator(Arc<CoordinatorState>),
    Worker {
        upstream_address: String,
        upstream: Arc<Mutex<Option<Outbox>>>,
    },
}

/// One node's TCP channels.
pub struct TcpTransport {
    side: Side,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundFrame>>,
    broadcasts: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    message_address: String,
    discovery_address: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: CloseSignal,
}

impl TcpTransport {
    async fn listen(local_id: &NodeId, config: &NodeConfig) -> Result<Self, TransportError> {
        let message_listener = bind_listener(&config.network.message_address()).await?;
        let discovery_listener = bind_listener(&config.network.discovery_address()).await?;
        let message_address = message_listener.local_addr()?.to_string();
        let discovery_address = discovery_listener.local_addr()?.to_string();

        let state = Arc::new(CoordinatorState::default());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (_, broadcasts_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(accept_workers(
                message_listener,
                Arc::clone(&state),
                inbox_tx,
            )),
            tokio::spawn(accept_subscribers(discovery_listener, Arc::clone(&state))),
        ];

        info!(
            node_id = %local_id,
            message_address = %message_address,
            discovery_address = %discovery_address,
            "tcp listeners bound"
        );
        Ok(Self {
            side: Side::Coordinator(state),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            broadcasts: tokio::sync::Mutex::new(broadcasts_rx),
            message_address,
            discovery_address,
            tasks: Mutex::new(tasks),
            closed: CloseSignal::new(),
        })
    }

    async fn connect(local_id: &NodeId, config: &NodeConfig) -> Result<Self, TransportError> {
        let upstream_address =
            config
                .network
                .coordinator
                .clone()
                .ok_or_else(|| TransportError::Connect {
                    address: "<unset>".into(),
                    reason: "no coordinator address configured".into(),
                })?;
        let discovery_address = config
            .network
            .coordinator_discovery_address()
            .unwrap_or_else(|| upstream_address.clone());
        let retry = config.timing.poll_interval();

        let upstream = Arc::new(Mutex::new(None));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (broadcasts_tx, broadcasts_rx) = mpsc::unbounded_channel();
        let (first_dial_tx, first_dial_rx) = oneshot::channel();

        let tasks = vec![
            tokio::spawn(maintain_upstream(
                local_id.clone(),
                upstream_address.clone(),
                Arc::clone(&upstream),
                inbox_tx,
                retry,
                first_dial_tx,
            )),
            tokio::spawn(maintain_subscription(
                discovery_address,
                broadcasts_tx,
                retry,
            )),
        ];

        match tokio::time::timeout(retry + FIRST_DIAL_TIMEOUT, first_dial_rx).await {
            Ok(Ok(true)) => {}
            _ => info!(
                node_id = %local_id,
                address = %upstream_address,
                "coordinator not reachable yet, retrying in the background"
            ),
        }

        Ok(Self {
            side: Side::Worker {
                upstream_address,
                upstream,
            },
            inbox: tokio::sync::Mutex::new(inbox_rx),
            broadcasts: tokio::sync::Mutex::new(broadcasts_rx),
            message_address: config.network.message_address(),
            discovery_address: config.network.discovery_address(),
            tasks: Mutex::new(tasks),
            closed: CloseSignal::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

async fn bind_listener(address: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(address)
        .await
        .map_err(|e| TransportError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

async fn accept_workers(
    listener: TcpListener,
    state: Arc<CoordinatorState>,
    inbox: mpsc::UnboundedSender<InboundFrame>,
) {
    // Dropped with this task on close, aborting every connection.
    let mut connections = JoinSet::new();
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed on message listener");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(remote = %addr, "message connection accepted");
        connections.spawn(serve_worker(stream, Arc::clone(&state), inbox.clone()));
        while connections.try_join_next().is_some() {}
    }
}

async fn serve_worker(
    stream: TcpStream,
    state: Arc<CoordinatorState>,
    inbox: mpsc::UnboundedSender<InboundFrame>,
) {
    let (mut reader, writer) = stream.into_split();
    let hello = match read_hello(&mut reader, HELLO_TIMEOUT).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!(error = %e, "no valid hello, dropping connection");
            return;
        }
    };

    let peer = hello.node_id;
    let connection_id = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let (outbox, rx) = mpsc::unbounded_channel();
    let writer_task = spawn_writer(writer, rx);
    state.peers.lock().insert(
        peer.clone(),
        PeerConnection {
            connection_id,
            outbox,
        },
    );
    debug!(peer = %peer, connection_id, "worker connected");

    loop {
        match read_frame(&mut reader).await {
            Ok(bytes) => {
                let frame = InboundFrame {
                    peer: Some(peer.clone()),
                    bytes,
                };
                if inbox.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "worker connection closed");
                break;
            }
        }
    }

    let mut peers = state.peers.lock();
    if peers
        .get(&peer)
        .is_some_and(|connection| connection.connection_id == connection_id)
    {
        peers.remove(&peer);
    }
    drop(peers);
    writer_task.abort();
}

async fn accept_subscribers(listener: TcpListener, state: Arc<CoordinatorState>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed on discovery listener");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let (_reader, writer) = stream.into_split();
        let (outbox, rx) = mpsc::unbounded_channel();
        spawn_writer(writer, rx);
        state.subscribers.lock().push(outbox);
        debug!(remote = %addr, "discovery subscriber connected");
    }
}

async fn maintain_upstream(
    local_id: NodeId,
    address: String,
    upstream: Arc<Mutex<Option<Outbox>>>,
    inbox: mpsc::UnboundedSender<InboundFrame>,
    retry: Duration,
    first_dial: oneshot::Sender<bool>,
) {
    let mut first_dial = Some(first_dial);
    let hello = match serde_json::to_vec(&Hello {
        node_id: local_id.clone(),
    }) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "failed to encode hello frame");
            return;
        }
    };

    loop {
        match TcpStream::connect(address.as_str()).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (mut reader, mut writer) = stream.into_split();
                if let Err(e) = write_frame(&mut writer, &hello).await {
                    debug!(address = %address, error = %e, "hello failed");
                } else {
                    let (outbox, rx) = mpsc::unbounded_channel();
                    let writer_task = spawn_writer(writer, rx);
                    *upstream.lock() = Some(outbox);
                    info!(node_id = %local_id, address = %address, "connected to coordinator");
                    if let Some(first_dial) = first_dial.take() {
                        let _ = first_dial.send(true);
                    }

                    loop {
                        match read_frame(&mut reader).await {
                            Ok(bytes) => {
                                if inbox.send(InboundFrame { peer: None, bytes }).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(node_id = %local_id, address = %address, error = %e, "coordinator connection lost");
                                break;
                            }
                        }
                    }

                    *upstream.lock() = None;
                    writer_task.abort();
                }
            }
            Err(e) => debug!(address = %address, error = %e, "coordinator not reachable"),
        }
        if let Some(first_dial) = first_dial.take() {
            let _ = first_dial.send(false);
        }

        if inbox.is_closed() {
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

async fn maintain_subscription(
    address: String,
    broadcasts: mpsc::UnboundedSender<Vec<u8>>,
    retry: Duration,
) {
    loop {
        match TcpStream::connect(address.as_str()).await {
            Ok(mut stream) => {
                debug!(address = %address, "subscribed to discovery channel");
                loop {
                    match read_frame(&mut stream).await {
                        Ok(bytes) => {
                            if broadcasts.send(bytes).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(address = %address, error = %e, "discovery subscription lost");
                            break;
                        }
                    }
                }
            }
            Err(e) => debug!(address = %address, error = %e, "discovery channel not reachable"),
        }

        if broadcasts.is_closed() {
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_to(&self, peer: &NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Side::Coordinator(state) = &self.side else {
            return Err(TransportError::WrongSide("worker"));
        };
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut peers = state.peers.lock();
        let connection = peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        if connection.outbox.send(frame).is_err() {
            peers.remove(peer);
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        Ok(())
    }

    async fn send_upstream(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Side::Worker {
            upstream_address,
            upstream,
        } = &self.side
        else {
            return Err(TransportError::WrongSide("coordinator"));
        };
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let upstream = upstream.lock();
        let outbox = upstream.as_ref().ok_or_else(|| TransportError::Connect {
            address: upstream_address.clone(),
            reason: "not connected".into(),
        })?;
        outbox.send(frame).map_err(|_| TransportError::Send {
            target: upstream_address.clone(),
            reason: "connection closed".into(),
        })
    }

    async fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Side::Coordinator(state) = &self.side else {
            return Err(TransportError::WrongSide("worker"));
        };
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        state
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(frame.clone()).is_ok());
        Ok(())
    }

    async fn recv_message(&self) -> Option<InboundFrame> {
        if self.closed.is_closed() {
            return None;
        }
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.closed.closed() => None,
            frame = inbox.recv() => frame,
        }
    }

    async fn recv_broadcast(&self) -> Option<Vec<u8>> {
        if self.closed.is_closed() {
            return None;
        }
        let mut broadcasts = self.broadcasts.lock().await;
        tokio::select! {
            _ = self.closed.closed() => None,
            frame = broadcasts.recv() => frame,
        }
    }

    fn message_address(&self) -> String {
        self.message_address.clone()
    }

    fn discovery_address(&self) -> String {
        self.discovery_address.clone()
    }

    async fn close(&self) {
        if !self.closed.close() {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        match &self.side {
            Side::Coordinator(state) => {
                state.peers.lock().clear();
                state.subscribers.lock().clear();
            }
            Side::Worker { upstream, .. } => {
                *upstream.lock() = None;
            }
        }
        debug!(message_address = %self.message_address, "tcp transport closed");
    }
}
