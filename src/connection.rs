//! TCP connection to the robot: lifecycle state machine, stream reassembly,
//! and event publication.
//!
//! A [`Connection`] owns the socket and an explicit openness state machine:
//!
//! ```text
//! CLOSED ──connect()──► OPENING ──socket up──► OPEN
//! OPEN|OPENING ──disconnect()──► CLOSING ──socket down──► CLOSED
//! ```
//!
//! `connect()` while already open first performs a full disconnect and then
//! reopens (reconnect-by-cycling). Incoming bytes are reassembled by a
//! [`FrameBuffer`] on a spawned read loop; every chunk's decoded packets are
//! published together as one ordered batch. Subscribers receive events over
//! broadcast channels and unsubscribe by dropping the receiver.

use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::CommandRegistry;
use crate::error::{BotlinkError, Result};
use crate::protocol::{encode_packets, FrameBuffer, Packet};

/// Capacity of the packet-batch and lifecycle broadcast channels.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Read buffer chunk size for the socket read loop.
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Openness state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket. The initial and final state.
    Closed,
    /// A socket connect is in flight.
    Opening,
    /// Connected; packets can be sent.
    Open,
    /// A teardown is in flight.
    Closing,
}

/// Lifecycle events published to external subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection transitioned to a new state. Emitted on every
    /// transition.
    StateChanged(ConnectionState),
    /// The connection failed terminally (socket error, peer close, or a
    /// malformed frame). Always followed by `StateChanged(Closed)`.
    Lost(String),
}

struct Inner {
    ip: String,
    port: u16,
    state: ConnectionState,
    writer: Option<OwnedWriteHalf>,
    read_task: Option<JoinHandle<()>>,
}

/// Handle for the connection, disconnection, and data stream of one socket.
pub struct Connection {
    registry: Arc<CommandRegistry>,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    packet_tx: broadcast::Sender<Vec<Packet>>,
}

impl Connection {
    /// Create a closed connection aimed at `ip:port`.
    pub fn new(registry: Arc<CommandRegistry>, ip: &str, port: u16) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (packet_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry,
            inner: Mutex::new(Inner {
                ip: ip.to_string(),
                port,
                state: ConnectionState::Closed,
                writer: None,
                read_task: None,
            }),
            event_tx,
            packet_tx,
        })
    }

    /// Subscribe to decoded packet batches. One batch per incoming chunk,
    /// packet order equals wire order. Drop the receiver to unsubscribe.
    pub fn subscribe_packets(&self) -> broadcast::Receiver<Vec<Packet>> {
        self.packet_tx.subscribe()
    }

    /// Subscribe to lifecycle events. Drop the receiver to unsubscribe.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Current openness state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Current target address as `(ip, port)`.
    pub async fn target(&self) -> (String, u16) {
        let inner = self.inner.lock().await;
        (inner.ip.clone(), inner.port)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        let _ = self.event_tx.send(ConnectionEvent::StateChanged(state));
    }

    /// Connect, or cycle the connection if it is already open.
    ///
    /// Fails with [`BotlinkError::StateConflict`] when called while a
    /// teardown is still in progress, and with the socket error when the
    /// connect itself fails (state returns to `Closed`).
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Open | ConnectionState::Opening => {
                self.teardown(&mut inner).await;
            }
            ConnectionState::Closing => {
                return Err(BotlinkError::StateConflict(
                    "cannot open a connection while it is closing, wait for it to finish"
                        .to_string(),
                ));
            }
            ConnectionState::Closed => {}
        }

        self.set_state(&mut inner, ConnectionState::Opening);
        let addr = format!("{}:{}", inner.ip, inner.port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(&mut inner, ConnectionState::Closed);
                return Err(e.into());
            }
        };

        let (reader, writer) = stream.into_split();
        inner.writer = Some(writer);
        inner.read_task = Some(tokio::spawn(read_loop(
            reader,
            FrameBuffer::new(self.registry.clone()),
            self.packet_tx.clone(),
            self.event_tx.clone(),
            Arc::downgrade(self),
        )));
        self.set_state(&mut inner, ConnectionState::Open);
        debug!(%addr, "connection open");
        Ok(())
    }

    /// Close the connection. Calling this while already closed (or closing)
    /// is a warn-only no-op; disconnect is idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.state,
            ConnectionState::Closed | ConnectionState::Closing
        ) {
            warn!("disconnect called on an already closed connection, nothing changed");
            return Ok(());
        }
        self.teardown(&mut inner).await;
        Ok(())
    }

    /// Switch the ip and port of the connection. If the connection is open
    /// (or opening), it is cycled to the new target; the reconnect is
    /// awaited before this returns.
    pub async fn change_target(self: &Arc<Self>, ip: &str, port: u16) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.ip = ip.to_string();
            inner.port = port;
            if !matches!(
                inner.state,
                ConnectionState::Open | ConnectionState::Opening
            ) {
                return Ok(());
            }
        }
        self.connect().await
    }

    /// Encode `packets` into one buffer and issue a single write.
    ///
    /// The single write preserves packet ordering on the wire and never
    /// interleaves with another send. Fails fast with
    /// [`BotlinkError::NotConnected`] unless the connection is open.
    pub async fn send_packets(&self, packets: &[Packet]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Open {
            return Err(BotlinkError::NotConnected);
        }
        let writer = inner.writer.as_mut().ok_or(BotlinkError::NotConnected)?;

        let data = encode_packets(packets);
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn teardown(&self, inner: &mut Inner) {
        self.set_state(inner, ConnectionState::Closing);
        if let Some(mut writer) = inner.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown failed: {e}");
            }
        }
        if let Some(task) = inner.read_task.take() {
            task.abort();
        }
        self.set_state(inner, ConnectionState::Closed);
    }
}

/// Socket read loop: reassemble the byte stream into packet batches until
/// the peer goes away or a frame is malformed.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut frames: FrameBuffer,
    packet_tx: broadcast::Sender<Vec<Packet>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    connection: Weak<Connection>,
) {
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        chunk.clear();
        let n = match reader.read_buf(&mut chunk).await {
            Ok(0) => {
                lose_connection(&connection, &event_tx, "connection closed by peer").await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                lose_connection(&connection, &event_tx, &format!("socket read failed: {e}")).await;
                return;
            }
        };

        let (packets, err) = frames.push(&chunk[..n]);
        // A malformed frame never corrupts the packets decoded before it;
        // deliver them, then surface the failure.
        if !packets.is_empty() {
            let _ = packet_tx.send(packets);
        }
        if let Some(e) = err {
            lose_connection(&connection, &event_tx, &format!("malformed frame: {e}")).await;
            return;
        }
    }
}

/// Emit a terminal `Lost` event and drive the state machine to `Closed`.
async fn lose_connection(
    connection: &Weak<Connection>,
    event_tx: &broadcast::Sender<ConnectionEvent>,
    reason: &str,
) {
    warn!("connection lost: {reason}");
    let _ = event_tx.send(ConnectionEvent::Lost(reason.to_string()));
    if let Some(connection) = connection.upgrade() {
        let mut inner = connection.inner.lock().await;
        inner.writer = None;
        inner.read_task = None;
        connection.set_state(&mut inner, ConnectionState::Closed);
    }
}
