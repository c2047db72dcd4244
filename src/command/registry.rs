//! Registry of known commands, keyed by wire identifier.
//!
//! The registry is an explicit object shared by `Arc`, not a process-wide
//! static: every component that decodes packets or dispatches handlers holds
//! a handle to it. Registration happens once at startup; lookup is read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::command::Command;
use crate::error::{BotlinkError, Result};

/// Reserved keep-alive command id. Responses carrying it refresh a pending
/// request's age without delivering data.
pub const KEEP_ALIVE_COMMAND: &str = "WAIT";

/// Table of registered commands.
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<Command>>>,
}

impl CommandRegistry {
    /// Create a registry with the reserved `WAIT` keep-alive pre-registered.
    pub fn new() -> Arc<Self> {
        let registry = Self {
            commands: RwLock::new(HashMap::new()),
        };
        // KEEP_ALIVE_COMMAND always passes id validation.
        let keep_alive = Command::new(KEEP_ALIVE_COMMAND)
            .unwrap_or_else(|_| unreachable!("reserved keep-alive id is valid"));
        registry
            .commands
            .write()
            .insert(KEEP_ALIVE_COMMAND.to_string(), Arc::new(keep_alive));
        Arc::new(registry)
    }

    /// Register a new command.
    ///
    /// Fails with [`BotlinkError::InvalidCommandId`] when the id does not
    /// match `[A-Z_]{4}`, and with [`BotlinkError::DuplicateCommand`] when
    /// the id is already registered. Rejecting duplicates means a lookup can
    /// never be shadowed by an unreachable second entry.
    pub fn register(&self, id: &str) -> Result<Arc<Command>> {
        let command = Arc::new(Command::new(id)?);
        let mut commands = self.commands.write();
        if commands.contains_key(id) {
            return Err(BotlinkError::DuplicateCommand(id.to_string()));
        }
        commands.insert(id.to_string(), command.clone());
        Ok(command)
    }

    /// Look up a command by its wire identifier.
    pub fn find(&self, id: &str) -> Option<Arc<Command>> {
        self.commands.read().get(id).cloned()
    }

    /// The reserved keep-alive command.
    pub fn keep_alive(&self) -> Arc<Command> {
        self.find(KEEP_ALIVE_COMMAND)
            .unwrap_or_else(|| unreachable!("keep-alive is registered at construction"))
    }

    /// Number of registered commands, keep-alive included.
    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    /// Whether the registry holds no commands at all.
    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }
}
