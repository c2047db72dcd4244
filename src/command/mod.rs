//! Command module - command identities, handler slots, and the registry.
//!
//! Provides:
//! - [`Command`] - a four character command id with once-settable request
//!   and response handlers
//! - [`CommandRegistry`] - explicit shared table of known commands

mod command;
mod registry;

pub use command::{
    is_valid_command_id, BoxFuture, Command, RequestHandler, ResponseHandler,
};
pub use registry::{CommandRegistry, KEEP_ALIVE_COMMAND};
