//! # botlink
//!
//! Client-side protocol engine for the robot remote debugger link.
//!
//! Talks to the robot over a persistent TCP connection using a compact
//! binary framing protocol, correlating asynchronous requests with one or
//! more responses. The surrounding UI and process wiring are external
//! collaborators: they consume this engine's operations and event streams
//! and supply per-command handlers, nothing more.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): wire codec, fragment detection, and
//!   partial-read reassembly
//! - **Commands** ([`command`]): registry of known commands with
//!   once-settable request/response handlers
//! - **Connection** ([`Connection`]): socket ownership, openness state
//!   machine, packet-batch and lifecycle events
//! - **Sender** ([`CommandSender`]): request/response correlation, stale
//!   request pruning, debounced outgoing batches
//! - **Requests** ([`AsyncRequestCommand`]): typed call/await convenience
//!   on top of the sender
//!
//! ## Example
//!
//! ```ignore
//! use botlink::{AsyncRequestCommand, CommandRegistry, CommandSender, Connection};
//!
//! #[tokio::main]
//! async fn main() -> botlink::Result<()> {
//!     let registry = CommandRegistry::new();
//!     let logs = registry.register("LOGS")?;
//!     let fetch_logs: AsyncRequestCommand<(String, Option<i32>), Vec<String>> =
//!         AsyncRequestCommand::new(logs)?;
//!
//!     let connection = Connection::new(registry.clone(), "10.0.0.2", 5800);
//!     let sender = CommandSender::new(connection, registry);
//!     sender.connect().await?;
//!
//!     let lines = fetch_logs.request(&sender, ("drive".into(), None)).await?;
//!     println!("{}", lines.join("\n"));
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod protocol;

mod connection;
mod error;
mod request;
mod sender;

pub use command::{Command, CommandRegistry, KEEP_ALIVE_COMMAND};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{BotlinkError, Result};
pub use protocol::{Packet, PacketKind, PacketParam};
pub use request::{AsyncRequestCommand, FromParam, FromParams, IntoParam, IntoParams};
pub use sender::{CommandSender, SenderConfig, SenderEvent};
