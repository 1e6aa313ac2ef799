//! The Linkup server: listeners, the connection directory, the sign-in
//! pipeline, module dispatch and routing.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use linkup_core::protocol::{AuthenticationFailed, SignIn, SignedIn, SignedOut};
use linkup_core::{ConnectionId, DisconnectReason, Id, Packet, PacketContent, Session};
use linkup_transport::{
    AcceptedReceiver, Certificate, Channel, ChannelEvent, ChannelListener, Endpoint,
    ListenerOptions, listener_for,
};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionEvent, ServerConnection};
use crate::directory::Directory;
use crate::errors::{Result, ServerError};
use crate::events::ServerEvent;
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL, PACKETS_ROUTED_TOTAL,
    SIGN_INS_TOTAL, TAKEOVERS_TOTAL,
};
use crate::module::{ServerContext, ServerModule};
use crate::security::{Authenticator, Authorizer};
use crate::session::{MemorySessionRepository, SessionRepository};
use crate::shutdown::ShutdownCoordinator;

/// A running listener as reported by [`Server::listeners`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    /// Endpoint as configured (port 0 stays 0).
    pub endpoint: Endpoint,
    /// Bound address.
    pub local_addr: SocketAddr,
}

struct ListenerEntry {
    endpoint: Endpoint,
    listener: Arc<dyn ChannelListener>,
    local_addr: SocketAddr,
    pump: JoinHandle<()>,
}

#[derive(Clone, Copy)]
enum Adoption {
    SignIn,
    Restore,
}

impl Adoption {
    fn outcome(self) -> &'static str {
        match self {
            Self::SignIn => "accepted",
            Self::Restore => "restored",
        }
    }
}

struct Inner {
    config: ServerConfig,
    repository: Arc<dyn SessionRepository>,
    authenticators: RwLock<Vec<Arc<dyn Authenticator>>>,
    authorizers: RwLock<Vec<Arc<dyn Authorizer>>>,
    modules: RwLock<Vec<Arc<dyn ServerModule>>>,
    listeners: tokio::sync::Mutex<Vec<ListenerEntry>>,
    directory: Mutex<Directory>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: ShutdownCoordinator,
    sweeper: std::sync::Once,
}

/// Handle to a Linkup server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    /// Server with an in-memory session repository.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_repository(config, Arc::new(MemorySessionRepository::new()))
    }

    /// Server backed by `repository`.
    pub fn with_repository(config: ServerConfig, repository: Arc<dyn SessionRepository>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                repository,
                authenticators: RwLock::new(Vec::new()),
                authorizers: RwLock::new(Vec::new()),
                modules: RwLock::new(Vec::new()),
                listeners: tokio::sync::Mutex::new(Vec::new()),
                directory: Mutex::new(Directory::default()),
                events,
                shutdown: ShutdownCoordinator::new(),
                sweeper: std::sync::Once::new(),
            }),
        }
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Session store.
    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.inner.repository
    }

    /// Directory notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.inner.events.send(event);
    }

    // ── Setup ───────────────────────────────────────────────────────────────

    /// Append an authenticator; sign-ins try them in order.
    pub fn add_authenticator(&self, authenticator: Arc<dyn Authenticator>) -> Result<()> {
        let mut authenticators = self.inner.authenticators.write();
        if authenticators.iter().any(|a| Arc::ptr_eq(a, &authenticator)) {
            return Err(ServerError::AuthenticatorAlreadyAdded);
        }
        authenticators.push(authenticator);
        Ok(())
    }

    /// Remove an authenticator. Returns `false` if it was not installed.
    pub fn remove_authenticator(&self, authenticator: &Arc<dyn Authenticator>) -> bool {
        let mut authenticators = self.inner.authenticators.write();
        let before = authenticators.len();
        authenticators.retain(|a| !Arc::ptr_eq(a, authenticator));
        authenticators.len() != before
    }

    /// Append an authorizer.
    pub fn add_authorizer(&self, authorizer: Arc<dyn Authorizer>) -> Result<()> {
        let mut authorizers = self.inner.authorizers.write();
        if authorizers.iter().any(|a| Arc::ptr_eq(a, &authorizer)) {
            return Err(ServerError::AuthorizerAlreadyAdded);
        }
        authorizers.push(authorizer);
        Ok(())
    }

    /// Remove an authorizer. Returns `false` if it was not installed.
    pub fn remove_authorizer(&self, authorizer: &Arc<dyn Authorizer>) -> bool {
        let mut authorizers = self.inner.authorizers.write();
        let before = authorizers.len();
        authorizers.retain(|a| !Arc::ptr_eq(a, authorizer));
        authorizers.len() != before
    }

    /// Install `module` after the existing ones.
    pub fn add_module(&self, module: Arc<dyn ServerModule>) -> Result<()> {
        {
            let mut modules = self.inner.modules.write();
            if modules.iter().any(|m| Arc::ptr_eq(m, &module)) {
                return Err(ServerError::ModuleAlreadyAdded(module.name().to_owned()));
            }
            modules.push(Arc::clone(&module));
        }
        module.on_added(self);
        info!(module = module.name(), "server module added");
        Ok(())
    }

    /// Remove `module`. Returns `false` if it was not installed.
    pub fn remove_module(&self, module: &Arc<dyn ServerModule>) -> bool {
        let removed = {
            let mut modules = self.inner.modules.write();
            let before = modules.len();
            modules.retain(|m| !Arc::ptr_eq(m, module));
            modules.len() != before
        };
        if removed {
            module.on_removed(self);
            info!(module = module.name(), "server module removed");
        }
        removed
    }

    /// Installed modules, in dispatch order.
    pub fn modules(&self) -> Vec<Arc<dyn ServerModule>> {
        self.inner.modules.read().clone()
    }

    // ── Listeners ───────────────────────────────────────────────────────────

    /// Start accepting on `endpoint`. TLS schemes need `certificate` with its
    /// private key. Returns the bound address.
    pub async fn add_listener(
        &self,
        endpoint: &str,
        certificate: Option<&Certificate>,
    ) -> Result<SocketAddr> {
        if self.inner.shutdown.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        let endpoint: Endpoint = endpoint.parse()?;
        let mut listeners = self.inner.listeners.lock().await;
        if listeners.iter().any(|l| l.endpoint == endpoint) {
            return Err(ServerError::ListenerExists(endpoint.to_string()));
        }
        let options = ListenerOptions {
            long_poll_inactivity: self.inner.config.long_poll_inactivity,
        };
        let listener = listener_for(&endpoint, certificate, &options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let local_addr = listener.start(tx).await?;
        let pump = tokio::spawn(accept_pump(self.clone(), rx));
        info!(%endpoint, %local_addr, "listener started");
        listeners.push(ListenerEntry {
            endpoint,
            listener,
            local_addr,
            pump,
        });
        Ok(local_addr)
    }

    /// Stop the listener added for `endpoint`. Live connections stay up.
    pub async fn remove_listener(&self, endpoint: &str) -> Result<()> {
        let endpoint: Endpoint = endpoint.parse()?;
        let entry = {
            let mut listeners = self.inner.listeners.lock().await;
            let index = listeners
                .iter()
                .position(|l| l.endpoint == endpoint)
                .ok_or_else(|| ServerError::ListenerNotFound(endpoint.to_string()))?;
            listeners.remove(index)
        };
        stop_listener(entry).await;
        Ok(())
    }

    /// Running listeners.
    pub async fn listeners(&self) -> Vec<ListenerInfo> {
        self.inner
            .listeners
            .lock()
            .await
            .iter()
            .map(|l| ListenerInfo {
                endpoint: l.endpoint.clone(),
                local_addr: l.local_addr,
            })
            .collect()
    }

    // ── Connections ─────────────────────────────────────────────────────────

    /// Take over an accepted channel. The connection task opens it,
    /// acknowledges the peer and runs until the channel closes.
    pub fn accept(&self, channel: Arc<dyn Channel>) -> Arc<ServerConnection> {
        let connection = Arc::new(ServerConnection::new(channel));
        if self.inner.shutdown.is_shutting_down() {
            let refused = Arc::clone(&connection);
            drop(tokio::spawn(async move {
                refused.disconnect(DisconnectReason::ServerRequest).await;
            }));
            return connection;
        }
        self.ensure_sweeper();
        let _ = self
            .inner
            .shutdown
            .spawn(run_connection(self.clone(), Arc::clone(&connection)));
        connection
    }

    /// Connection by id.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ServerConnection>> {
        self.inner.directory.lock().get(id)
    }

    /// Ids of every signed-in connection, sorted.
    pub fn signed_in(&self) -> Vec<Id> {
        self.inner.directory.lock().signed_in()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.directory.lock().connection_count()
    }

    /// Number of live connections without a session.
    pub fn anonymous_count(&self) -> usize {
        self.inner.directory.lock().anonymous_count()
    }

    /// Connections signed in as `id`.
    pub fn owners_of(&self, id: &Id) -> Vec<Arc<ServerConnection>> {
        self.inner.directory.lock().owners_of(id)
    }

    /// Whether any authorizer grants one of `roles` to the connection's
    /// session. Anonymous connections hold no roles.
    pub async fn is_authorized(&self, connection: &ServerConnection, roles: &[String]) -> bool {
        let Some(session) = connection.session() else {
            return false;
        };
        let authorizers = self.inner.authorizers.read().clone();
        for authorizer in authorizers {
            if authorizer.is_authorized(&session, roles).await {
                return true;
            }
        }
        false
    }

    // ── Routing ─────────────────────────────────────────────────────────────

    /// Push a server-originated packet: to its recipient, or to every
    /// signed-in connection when it has none. Returns the delivery count.
    pub async fn send(&self, packet: Packet) -> usize {
        self.route(&packet, None).await
    }

    /// Push `content` to the connections signed in as `recipient`.
    pub async fn send_to<T: PacketContent>(&self, recipient: Id, content: &T) -> Result<usize> {
        Ok(self.send(Packet::new(content)?.to(recipient)).await)
    }

    async fn route(&self, packet: &Packet, origin: Option<&ConnectionId>) -> usize {
        let (route, targets) = {
            let directory = self.inner.directory.lock();
            match &packet.recipient {
                None => ("broadcast", directory.signed_in_connections(origin)),
                Some(recipient) => ("direct", directory.owners_of(recipient)),
            }
        };
        if targets.is_empty() {
            debug!(
                type_name = %packet.type_name,
                recipient = ?packet.recipient,
                "no connection to deliver to"
            );
            counter!(PACKETS_ROUTED_TOTAL, "route" => "undeliverable").increment(1);
            return 0;
        }
        let sent = join_all(targets.iter().map(|c| c.send(packet))).await;
        let delivered = sent.into_iter().filter(|ok| *ok).count();
        counter!(PACKETS_ROUTED_TOTAL, "route" => route).increment(1);
        delivered
    }

    // ── Connection pipeline ─────────────────────────────────────────────────

    async fn on_event(&self, connection: &Arc<ServerConnection>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::SignInRequired(sign_in) => self.sign_in(connection, sign_in).await,
            ConnectionEvent::SignOutRequired(session) => self.sign_out(connection, session).await,
            ConnectionEvent::RestoreSessionRequired(session) => {
                self.restore(connection, session).await;
            }
            ConnectionEvent::DisconnectRequested(reason) => {
                debug!(connection_id = %connection.id(), %reason, "peer is leaving");
                connection.close(reason, false).await;
            }
            ConnectionEvent::Packet(packet) => self.dispatch(connection, packet).await,
        }
    }

    async fn sign_in(&self, connection: &Arc<ServerConnection>, sign_in: SignIn) {
        self.close_session(connection).await;
        let authenticators = self.inner.authenticators.read().clone();
        let mut accepted = None;
        for authenticator in authenticators {
            if let Some(session) = authenticator.authenticate(&sign_in).await {
                accepted = Some(session);
                break;
            }
        }
        match accepted {
            Some(session) => self.adopt(connection, session, Adoption::SignIn).await,
            None => {
                info!(connection_id = %connection.id(), id = %sign_in.id, "sign-in rejected");
                counter!(SIGN_INS_TOTAL, "outcome" => "rejected").increment(1);
                let _ = connection
                    .send_content(&AuthenticationFailed { id: sign_in.id })
                    .await;
            }
        }
    }

    async fn restore(&self, connection: &Arc<ServerConnection>, requested: Session) {
        let stored = self.inner.repository.get(&requested.token);
        match stored {
            Some(session) if session.id == requested.id => {
                if connection.session().as_ref() != Some(&session) {
                    self.close_session(connection).await;
                }
                self.adopt(connection, session, Adoption::Restore).await;
            }
            _ => {
                info!(connection_id = %connection.id(), id = %requested.id, "session restore rejected");
                counter!(SIGN_INS_TOTAL, "outcome" => "restore_rejected").increment(1);
                let _ = connection
                    .send_content(&AuthenticationFailed { id: requested.id })
                    .await;
            }
        }
    }

    async fn adopt(&self, connection: &Arc<ServerConnection>, session: Session, how: Adoption) {
        let evicted = self.inner.directory.lock().claim(
            connection,
            session.clone(),
            self.inner.repository.as_ref(),
        );
        for holder in &evicted {
            info!(
                connection_id = %holder.id(),
                id = %session.id,
                by = %connection.id(),
                "session taken over"
            );
            counter!(TAKEOVERS_TOTAL).increment(1);
        }
        let _ = join_all(
            evicted
                .iter()
                .map(|holder| holder.disconnect(DisconnectReason::AnotherSessionOpened)),
        )
        .await;

        info!(connection_id = %connection.id(), id = %session.id, outcome = how.outcome(), "signed in");
        counter!(SIGN_INS_TOTAL, "outcome" => how.outcome()).increment(1);
        let _ = connection
            .send_content(&SignedIn {
                session: session.clone(),
            })
            .await;
        let connection_id = connection.id().clone();
        self.emit(match how {
            Adoption::SignIn => ServerEvent::ClientConnected {
                connection_id,
                session,
            },
            Adoption::Restore => ServerEvent::ClientReconnected {
                connection_id,
                session,
            },
        });
    }

    async fn sign_out(&self, connection: &Arc<ServerConnection>, session: Session) {
        let current = connection.session().as_ref() == Some(&session);
        if current {
            let _ = self.inner.directory.lock().release(connection);
            let _ = self.inner.repository.remove(&session);
            info!(connection_id = %connection.id(), id = %session.id, "signed out");
        } else {
            debug!(connection_id = %connection.id(), id = %session.id, "sign-out for a session not held");
        }
        let id = session.id.clone();
        let _ = connection
            .send_content(&SignedOut {
                session,
                is_current_session: current,
            })
            .await;
        if current {
            self.emit(ServerEvent::ClientDisconnected {
                connection_id: connection.id().clone(),
                id,
                reason: DisconnectReason::ClientRequest,
            });
        }
    }

    /// Close the connection's session ahead of a new sign-in. The peer is
    /// told with `SignedOut`, so a rejected sign-in leaves both ends anonymous.
    async fn close_session(&self, connection: &ServerConnection) {
        let released = self.inner.directory.lock().release(connection);
        let Some(session) = released else {
            return;
        };
        let _ = self.inner.repository.remove(&session);
        debug!(connection_id = %connection.id(), id = %session.id, "previous session closed");
        let id = session.id.clone();
        let _ = connection
            .send_content(&SignedOut {
                session,
                is_current_session: true,
            })
            .await;
        self.emit(ServerEvent::ClientDisconnected {
            connection_id: connection.id().clone(),
            id,
            reason: DisconnectReason::ClientRequest,
        });
    }

    async fn dispatch(&self, connection: &Arc<ServerConnection>, packet: Packet) {
        let modules = self.modules();
        if !modules.is_empty() {
            let ctx = ServerContext::new(self.clone(), Arc::clone(connection));
            for module in &modules {
                if module.handlers().dispatch(&packet, &ctx).await {
                    debug!(module = module.name(), type_name = %packet.type_name, "packet handled by module");
                    counter!(PACKETS_ROUTED_TOTAL, "route" => "module").increment(1);
                    return;
                }
            }
        }
        let _ = self.route(&packet, Some(connection.id())).await;
    }

    fn on_closed(&self, connection: &ServerConnection) {
        let reason = connection.finish();
        let released = {
            let mut directory = self.inner.directory.lock();
            let released = directory.remove(connection);
            if let (Some(session), Some(_)) = (&released, self.inner.config.session_timeout) {
                directory.orphan(session.clone(), tokio::time::Instant::now());
            }
            released
        };
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        counter!(DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(connection_id = %connection.id(), %reason, "connection closed");
        if let Some(session) = released {
            self.emit(ServerEvent::ClientDisconnected {
                connection_id: connection.id().clone(),
                id: session.id,
                reason,
            });
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    fn ensure_sweeper(&self) {
        let Some(timeout) = self.inner.config.session_timeout else {
            return;
        };
        self.inner.sweeper.call_once(|| {
            let weak = Arc::downgrade(&self.inner);
            let period = self.inner.config.sweep_interval;
            let stop = self.inner.shutdown.token();
            drop(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    let expired = inner
                        .directory
                        .lock()
                        .expire(tokio::time::Instant::now(), timeout);
                    for session in expired {
                        if inner.repository.remove(&session) {
                            debug!(id = %session.id, "orphaned session expired");
                        }
                    }
                }
            }));
        });
    }

    /// Number of sessions waiting to be restored or expire.
    pub fn orphaned_sessions(&self) -> usize {
        self.inner.directory.lock().orphan_count()
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Disconnect every connection with `ServerRequest`, wait (bounded) for
    /// connection tasks to finish, then stop every listener.
    ///
    /// Long-poll peers fetch their `Disconnected` notice through the listener,
    /// which therefore stops last.
    pub async fn shutdown(&self) {
        self.inner.shutdown.shutdown();
        let live = self.inner.directory.lock().connections();
        info!(connections = live.len(), "shutting down");
        let _ = join_all(live.iter().map(|c| c.disconnect(DisconnectReason::ServerRequest))).await;
        let _ = self
            .inner
            .shutdown
            .drain(self.inner.config.shutdown_timeout)
            .await;
        let entries = std::mem::take(&mut *self.inner.listeners.lock().await);
        for entry in entries {
            stop_listener(entry).await;
        }
        info!("shutdown complete");
    }
}

async fn stop_listener(entry: ListenerEntry) {
    entry.listener.stop().await;
    entry.pump.abort();
    info!(endpoint = %entry.endpoint, "listener stopped");
}

async fn accept_pump(server: Server, mut accepted: AcceptedReceiver) {
    while let Some(channel) = accepted.recv().await {
        let _ = server.accept(channel);
    }
}

#[instrument(skip_all, fields(connection_id = %connection.id(), peer = connection.peer()))]
async fn run_connection(server: Server, connection: Arc<ServerConnection>) {
    let mut events = match connection.open().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "failed to open accepted channel");
            return;
        }
    };
    server.inner.directory.lock().insert(Arc::clone(&connection));
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    debug!("connection accepted");
    if server.is_shutting_down() {
        connection.disconnect(DisconnectReason::ServerRequest).await;
    }

    let auth_timeout = server.inner.config.authentication_timeout;
    let mut awaiting_sign_in = auth_timeout.is_some();
    let deadline = tokio::time::sleep(auth_timeout.unwrap_or_default());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Packet(packet)) => {
                    if let Some(event) = connection.interpret(packet) {
                        server.on_event(&connection, event).await;
                    }
                }
                Some(ChannelEvent::Closed) | None => break,
            },
            () = &mut deadline, if awaiting_sign_in => {
                awaiting_sign_in = false;
                if !connection.has_signed_in() {
                    info!("no sign-in before the authentication timeout");
                    connection.disconnect(DisconnectReason::AuthenticationTimeout).await;
                }
            }
        }
    }
    server.on_closed(&connection);
}
