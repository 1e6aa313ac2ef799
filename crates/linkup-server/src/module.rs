//! Server modules: declarative handler tables consulted before routing.

use std::sync::Arc;

use async_trait::async_trait;
use linkup_core::{Gate, HandlerTable, Session};

use crate::connection::ServerConnection;
use crate::server::Server;

/// What a server module handler can reach.
pub struct ServerContext {
    server: Server,
    connection: Arc<ServerConnection>,
}

impl ServerContext {
    pub(crate) fn new(server: Server, connection: Arc<ServerConnection>) -> Self {
        Self { server, connection }
    }

    /// The server; use it to route or push packets.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The connection the packet arrived on.
    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    /// The connection's session, if signed in.
    pub fn session(&self) -> Option<Session> {
        self.connection.session()
    }
}

#[async_trait]
impl Gate for ServerContext {
    fn is_signed_in(&self) -> bool {
        self.connection.is_signed_in()
    }

    async fn is_authorized(&self, roles: &[String]) -> bool {
        self.server.is_authorized(&self.connection, roles).await
    }
}

/// A server module. Modules see each application packet in the order they
/// were added; the first handler that reports it handled stops routing.
pub trait ServerModule: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Declared handlers.
    fn handlers(&self) -> &HandlerTable<ServerContext>;

    /// Called once the module is installed.
    fn on_added(&self, _server: &Server) {}

    /// Called once the module is removed.
    fn on_removed(&self, _server: &Server) {}
}
