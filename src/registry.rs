//! Handler registry — explicit dispatch tables for commands and
//! notifications.
//!
//! The embedding application registers a handler per name at
//! construction time; the endpoint consults the tables when the peer's
//! messages arrive. An unregistered name is a deterministic protocol
//! violation, never a lookup surprise.
//!
//! Names travel over the wire with hyphens; lookup replaces hyphens with
//! underscores, so `"get-status"` and `"get_status"` address the same
//! handler regardless of which form was used at registration.

use serde_json::Value;
use std::collections::HashMap;

use crate::endpoint::{Responder, Wire};
use crate::error::HandlerError;

/// Handler for an inbound command.
///
/// Receives the payload (if any) and a one-shot [`Responder`] that must
/// eventually produce the reply. The [`Wire`] lets the handler send its
/// own commands and notifications or close the endpoint.
pub type CommandHandler =
    Box<dyn FnMut(&mut Wire<'_>, Option<Value>, Responder) -> Result<(), HandlerError> + Send>;

/// Handler for an inbound notification. No reply path exists.
pub type NotificationHandler =
    Box<dyn FnMut(&mut Wire<'_>, Option<Value>) -> Result<(), HandlerError> + Send>;

/// Dispatch tables consulted by the endpoint for every inbound message.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<String, CommandHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler under `name`.
    pub fn command<F>(mut self, name: &str, handler: F) -> Self
    where
        F: FnMut(&mut Wire<'_>, Option<Value>, Responder) -> Result<(), HandlerError>
            + Send
            + 'static,
    {
        self.commands.insert(normalize(name), Box::new(handler));
        self
    }

    /// Register a notification handler under `name`.
    pub fn notification<F>(mut self, name: &str, handler: F) -> Self
    where
        F: FnMut(&mut Wire<'_>, Option<Value>) -> Result<(), HandlerError> + Send + 'static,
    {
        self.notifications.insert(normalize(name), Box::new(handler));
        self
    }

    pub(crate) fn command_mut(&mut self, wire_name: &str) -> Option<&mut CommandHandler> {
        self.commands.get_mut(&normalize(wire_name))
    }

    pub(crate) fn notification_mut(&mut self, wire_name: &str) -> Option<&mut NotificationHandler> {
        self.notifications.get_mut(&normalize(wire_name))
    }
}

/// Wire names use hyphens; handler keys use underscores.
fn normalize(name: &str) -> String {
    name.replace('-', "_")
}
