//! Client-side modules: handler tables that see application packets before
//! the receive queue does.

use async_trait::async_trait;
use linkup_core::{Gate, HandlerTable, Session};

use crate::connection::ClientConnection;

/// What a client module handler can reach.
pub struct ClientContext {
    connection: ClientConnection,
}

impl ClientContext {
    pub(crate) fn new(connection: ClientConnection) -> Self {
        Self { connection }
    }

    /// The connection the packet arrived on; use it to reply.
    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<Session> {
        self.connection.session()
    }
}

#[async_trait]
impl Gate for ClientContext {
    fn is_signed_in(&self) -> bool {
        self.connection.is_signed_in()
    }

    // Clients have no authorizers, so role-gated handlers never fire here.
    async fn is_authorized(&self, _roles: &[String]) -> bool {
        false
    }
}

/// A client module. Modules are consulted in the order they were added;
/// the first handler that reports the packet handled keeps it out of the
/// receive queue.
pub trait ClientModule: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Declared handlers.
    fn handlers(&self) -> &HandlerTable<ClientContext>;

    /// Called once the module is installed.
    fn on_added(&self, _connection: &ClientConnection) {}

    /// Called once the module is removed.
    fn on_removed(&self, _connection: &ClientConnection) {}
}
