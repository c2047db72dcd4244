//! A single command of the link protocol.
//!
//! A [`Command`] is identified by a four character uppercase id and carries
//! at most one request handler and one response handler. Handlers are
//! assigned exactly once; the slots are [`OnceLock`]s so "once set, never
//! changed" holds structurally rather than by convention.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use crate::error::{BotlinkError, Result};
use crate::protocol::Packet;

/// Boxed future returned by erased handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Erased handler invoked for incoming request packets.
pub type RequestHandler = Box<dyn Fn(Packet) -> BoxFuture<'static, ()> + Send + Sync>;

/// Erased handler invoked for incoming response packets. Receives the
/// original request and the full accumulated response list so far, so a
/// multi-part exchange is observed as a growing sequence across calls.
pub type ResponseHandler = Box<dyn Fn(Packet, Vec<Packet>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Check that a command id matches the wire format `[A-Z_]{4}`.
pub fn is_valid_command_id(id: &str) -> bool {
    id.len() == 4 && id.bytes().all(|b| b == b'_' || b.is_ascii_uppercase())
}

/// A registered command: its wire identifier plus handler slots.
///
/// Commands are created through
/// [`CommandRegistry::register`](crate::command::CommandRegistry::register)
/// and shared as `Arc<Command>`; packets hold a reference to the command they
/// carry.
pub struct Command {
    id: String,
    request_handler: OnceLock<RequestHandler>,
    response_handler: OnceLock<ResponseHandler>,
}

impl Command {
    /// Create a command with a validated id. Callers go through the registry.
    pub(crate) fn new(id: &str) -> Result<Self> {
        if !is_valid_command_id(id) {
            return Err(BotlinkError::InvalidCommandId(id.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            request_handler: OnceLock::new(),
            response_handler: OnceLock::new(),
        })
    }

    /// The four character wire identifier.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id as the four raw bytes written to the wire.
    #[inline]
    pub(crate) fn id_bytes(&self) -> &[u8] {
        self.id.as_bytes()
    }

    /// Assign the request handler. Fails if one was already assigned.
    pub fn set_request_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: RequestHandler = Box::new(move |packet| Box::pin(handler(packet)));
        self.request_handler
            .set(boxed)
            .map_err(|_| BotlinkError::HandlerAlreadyAssigned(self.id.clone()))
    }

    /// Assign the response handler. Fails if one was already assigned.
    pub fn set_response_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Packet, Vec<Packet>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: ResponseHandler =
            Box::new(move |request, responses| Box::pin(handler(request, responses)));
        self.response_handler
            .set(boxed)
            .map_err(|_| BotlinkError::HandlerAlreadyAssigned(self.id.clone()))
    }

    /// Whether a request handler has been assigned.
    pub fn has_request_handler(&self) -> bool {
        self.request_handler.get().is_some()
    }

    /// Whether a response handler has been assigned.
    pub fn has_response_handler(&self) -> bool {
        self.response_handler.get().is_some()
    }

    /// Dispatch an incoming request packet. No-op without a handler; some
    /// commands (the keep-alive) carry no payload-level behaviour.
    pub async fn handle_request(&self, packet: Packet) {
        if let Some(handler) = self.request_handler.get() {
            handler(packet).await;
        }
    }

    /// Dispatch an incoming response with the accumulated response list.
    /// No-op without a handler.
    pub async fn handle_response(&self, request: Packet, responses: Vec<Packet>) {
        if let Some(handler) = self.response_handler.get() {
            handler(request, responses).await;
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("request_handler", &self.has_request_handler())
            .field("response_handler", &self.has_response_handler())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::protocol::PacketKind;

    fn test_packet(command: &Arc<Command>) -> Packet {
        Packet::new(PacketKind::Request, command.clone(), 1, Vec::<crate::protocol::PacketParam>::new())
    }

    #[test]
    fn test_id_format_validation() {
        assert!(is_valid_command_id("ECHO"));
        assert!(is_valid_command_id("A___"));
        assert!(is_valid_command_id("WAIT"));
        assert!(!is_valid_command_id("echo"));
        assert!(!is_valid_command_id("TOOLONG"));
        assert!(!is_valid_command_id("AB1_"));
        assert!(!is_valid_command_id(""));

        assert!(Command::new("ech0").is_err());
        assert!(Command::new("ECHO").is_ok());
    }

    #[test]
    fn test_second_handler_assignment_fails() {
        let cmd = Command::new("ECHO").unwrap();

        cmd.set_request_handler(|_packet| async {}).unwrap();
        let err = cmd.set_request_handler(|_packet| async {}).unwrap_err();
        assert!(matches!(err, BotlinkError::HandlerAlreadyAssigned(_)));

        // One of each kind succeeds independently.
        cmd.set_response_handler(|_req, _responses| async {})
            .unwrap();
        let err = cmd
            .set_response_handler(|_req, _responses| async {})
            .unwrap_err();
        assert!(matches!(err, BotlinkError::HandlerAlreadyAssigned(_)));
    }

    #[tokio::test]
    async fn test_dispatch_without_handler_is_noop() {
        let cmd = Arc::new(Command::new("WAIT").unwrap());
        let packet = test_packet(&cmd);
        cmd.handle_request(packet.clone()).await;
        cmd.handle_response(packet.clone(), vec![]).await;
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler() {
        let cmd = Arc::new(Command::new("ECHO").unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        cmd.set_request_handler(move |_packet| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        cmd.handle_request(test_packet(&cmd)).await;
        cmd.handle_request(test_packet(&cmd)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
