//! Sending and receiving of packets in terms of commands, requests, and
//! responses.
//!
//! The [`CommandSender`] sits above a [`Connection`]. Outgoing calls become
//! request/response packets; incoming response packets are correlated with
//! the pending request created when their request was sent, keyed by
//! request id. Requests that never receive a reply are aged out by an
//! opportunistic pruning sweep, and outgoing non-immediate packets are
//! coalesced behind a short debounce delay so several calls in the same tick
//! become one socket write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::command::{Command, CommandRegistry, KEEP_ALIVE_COMMAND};
use crate::connection::{Connection, ConnectionState};
use crate::error::{BotlinkError, Result};
use crate::protocol::{Packet, PacketParam};

/// Default age after which an unanswered request is eligible for pruning.
pub const DEFAULT_REQUEST_MAX_AGE: Duration = Duration::from_millis(10_000);

/// Default minimum interval between pruning sweeps.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default debounce delay for batched sends.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(10);

/// Timing configuration for the sender.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// A pending request untouched for longer than this is pruned.
    pub request_max_age: Duration,
    /// Minimum time between pruning sweeps; sweeps run lazily before
    /// incoming batches, so worst-case staleness is
    /// `request_max_age + prune_interval`.
    pub prune_interval: Duration,
    /// How long a non-immediate packet may wait for companions before the
    /// queued batch is flushed in one write.
    pub send_delay: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            request_max_age: DEFAULT_REQUEST_MAX_AGE,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            send_delay: DEFAULT_SEND_DELAY,
        }
    }
}

/// Errors the sender reports to subscribers rather than returning to a
/// caller, because they are triggered by peer traffic.
#[derive(Debug, Clone)]
pub enum SenderEvent {
    /// A response arrived whose request id has no pending request — it
    /// expired or never existed. Signals desync between peer and local
    /// pending table.
    ProtocolDesync {
        /// The orphaned request id.
        request_id: i32,
        /// The command the response carried.
        command: String,
    },
}

/// Book-keeping for one sent request awaiting response(s).
struct PendingRequest {
    request: Packet,
    responses: Vec<Packet>,
    last_updated: Instant,
}

struct SenderInner {
    pending: HashMap<i32, PendingRequest>,
    last_pruned: Instant,
    outgoing: Vec<Packet>,
    flush_timer: Option<JoinHandle<()>>,
}

/// Turns application calls into packets and correlates responses back to
/// their requests.
pub struct CommandSender {
    config: SenderConfig,
    connection: Arc<Connection>,
    registry: Arc<CommandRegistry>,
    inner: Mutex<SenderInner>,
    event_tx: broadcast::Sender<SenderEvent>,
}

impl CommandSender {
    /// Create a sender over `connection` with default timing.
    ///
    /// Spawns the dispatch task, so this must be called inside a tokio
    /// runtime.
    pub fn new(connection: Arc<Connection>, registry: Arc<CommandRegistry>) -> Arc<Self> {
        Self::with_config(connection, registry, SenderConfig::default())
    }

    /// Create a sender with explicit timing configuration.
    pub fn with_config(
        connection: Arc<Connection>,
        registry: Arc<CommandRegistry>,
        config: SenderConfig,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(16);
        let sender = Arc::new(Self {
            config,
            connection: connection.clone(),
            registry,
            inner: Mutex::new(SenderInner {
                pending: HashMap::new(),
                last_pruned: Instant::now(),
                outgoing: Vec::new(),
                flush_timer: None,
            }),
            event_tx,
        });

        let mut batches = connection.subscribe_packets();
        let weak = Arc::downgrade(&sender);
        tokio::spawn(async move {
            loop {
                match batches.recv().await {
                    Ok(batch) => {
                        let Some(sender) = weak.upgrade() else { return };
                        if let Err(e) = sender.handle_batch(batch).await {
                            error!("failed to handle incoming batch: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("dispatch lagged, {skipped} packet batches were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        sender
    }

    /// The registry this sender dispatches against.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Subscribe to peer-triggered error reports. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SenderEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to the robot, or cycle the connection if already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.connection.connect().await
    }

    /// Disconnect from the robot.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Switch the ip and port the connection targets, cycling it if open.
    pub async fn change_target(&self, ip: &str, port: u16) -> Result<()> {
        self.connection().change_target(ip, port).await
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Make a request to the robot and queue the packet for sending.
    ///
    /// Generates a request id (uniform over the signed 32-bit range, zero
    /// excluded, regenerated on collision with an in-flight request),
    /// records the pending request, and sends now (`immediate`) or with the
    /// next debounced batch. Returns the generated id.
    pub async fn make_request<I, P>(
        self: &Arc<Self>,
        command: &Arc<Command>,
        params: I,
        immediate: bool,
    ) -> Result<i32>
    where
        I: IntoIterator<Item = P>,
        P: Into<Option<PacketParam>>,
    {
        let (request_id, packet) = {
            let mut inner = self.inner.lock();
            let request_id = fresh_request_id(&inner.pending);
            let packet = Packet::request(command.clone(), request_id, params);
            inner.pending.insert(
                request_id,
                PendingRequest {
                    request: packet.clone(),
                    responses: Vec::new(),
                    last_updated: Instant::now(),
                },
            );
            (request_id, packet)
        };
        if let Err(e) = self.send_or_enqueue(immediate, packet).await {
            // Nothing reached the wire, so no response can ever arrive.
            self.inner.lock().pending.remove(&request_id);
            return Err(e);
        }
        Ok(request_id)
    }

    /// Respond to a request the robot sent and queue the response.
    ///
    /// Fails with [`BotlinkError::RespondToResponse`] if `request` is itself
    /// a response; responses cannot be responded to.
    pub async fn respond_to<I, P>(
        self: &Arc<Self>,
        request: &Packet,
        command: &Arc<Command>,
        params: I,
        immediate: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Option<PacketParam>>,
    {
        if request.is_response() {
            return Err(BotlinkError::RespondToResponse);
        }
        let packet = Packet::response(command.clone(), request.request_id, params);
        self.send_or_enqueue(immediate, packet).await
    }

    /// Flush the outgoing queue as one write and disarm the debounce timer.
    pub async fn send(&self) -> Result<()> {
        self.flush(true).await
    }

    async fn flush(&self, disarm_timer: bool) -> Result<()> {
        let (packets, timer) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.outgoing),
                inner.flush_timer.take(),
            )
        };
        // The debounce task calls flush itself and must not abort its own
        // handle mid-send.
        if disarm_timer {
            if let Some(timer) = timer {
                timer.abort();
            }
        }
        if packets.is_empty() {
            return Ok(());
        }
        self.connection.send_packets(&packets).await
    }

    async fn send_or_enqueue(self: &Arc<Self>, immediate: bool, packet: Packet) -> Result<()> {
        if immediate {
            return self.connection.send_packets(&[packet]).await;
        }

        let mut inner = self.inner.lock();
        inner.outgoing.push(packet);
        // First enqueue after an empty queue arms the debounce; later
        // enqueues ride the same batch.
        if inner.flush_timer.is_none() {
            let weak = Arc::downgrade(self);
            let delay = self.config.send_delay;
            inner.flush_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(sender) = weak.upgrade() {
                    if let Err(e) = sender.flush(false).await {
                        warn!("debounced send failed: {e}");
                    }
                }
            }));
        }
        Ok(())
    }

    /// Handle one ordered batch of incoming packets.
    ///
    /// Prunes stale pending requests first (so a request answered in the
    /// same tick it would have expired is not lost), then dispatches each
    /// packet in wire order.
    async fn handle_batch(self: &Arc<Self>, batch: Vec<Packet>) -> Result<()> {
        self.prune_if_needed();

        for packet in batch {
            match packet.kind {
                crate::protocol::PacketKind::Request => {
                    let command = packet.command.clone();
                    command.handle_request(packet).await;
                }
                crate::protocol::PacketKind::Response => {
                    self.handle_response(packet).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_response(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let dispatch = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.pending.get_mut(&packet.request_id) else {
                let event = SenderEvent::ProtocolDesync {
                    request_id: packet.request_id,
                    command: packet.command.id().to_string(),
                };
                error!(
                    request_id = packet.request_id,
                    command = packet.command.id(),
                    "response to missing or expired request"
                );
                let _ = self.event_tx.send(event);
                return Err(BotlinkError::UnmatchedResponse {
                    request_id: packet.request_id,
                });
            };

            entry.last_updated = Instant::now();
            if packet.command.id() == KEEP_ALIVE_COMMAND {
                // Keep-alive only refreshes the age; a real response is
                // still in flight.
                None
            } else {
                entry.responses.push(packet.clone());
                Some((entry.request.clone(), entry.responses.clone()))
            }
        };

        if let Some((request, responses)) = dispatch {
            let command = packet.command.clone();
            command.handle_response(request, responses).await;
        }
        Ok(())
    }

    /// Run the pruning sweep if `prune_interval` has elapsed since the last
    /// one. Lazy rather than timer-driven.
    fn prune_if_needed(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if now.duration_since(inner.last_pruned) <= self.config.prune_interval {
            return;
        }
        inner.last_pruned = now;

        let max_age = self.config.request_max_age;
        let before = inner.pending.len();
        inner
            .pending
            .retain(|_, entry| now.duration_since(entry.last_updated) <= max_age);
        let removed = before - inner.pending.len();
        if removed > 0 {
            warn!("pruned {removed} expired pending request(s)");
        }
    }

    /// Number of requests currently awaiting responses.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// Draw a request id uniformly from the signed 32-bit range, excluding zero
/// and any id already in flight.
fn fresh_request_id(pending: &HashMap<i32, PendingRequest>) -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let id: i32 = rng.gen();
        if id != 0 && !pending.contains_key(&id) {
            return id;
        }
    }
}
