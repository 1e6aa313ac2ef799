//! The client-side connection state machine.
//!
//! `Disconnected → Connecting → Connected → SignedIn`, back to `Connected` on
//! sign-out, and `Disconnected` when the channel ends. A connection is used
//! once: reconnecting means a new [`ClientConnection`] that restores the
//! session kept from the previous one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use linkup_core::protocol::{
    Disconnected, ProtocolMessage, RestoreSession, SignIn, SignOut, SignedOut,
};
use linkup_core::{
    ConnectionState, DisconnectReason, Id, Packet, PacketContent, Session, TypeRegistry,
};
use linkup_transport::{Certificate, Channel, ChannelEvent, ChannelEvents, Endpoint};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};
use crate::events::ClientEvent;
use crate::module::{ClientContext, ClientModule};

/// Capacity of the lifecycle event broadcast.
const EVENT_CAPACITY: usize = 64;

enum SignInReply {
    Accepted(Session),
    Rejected(Id),
}

#[derive(Default)]
struct Waiters {
    connected: Option<oneshot::Sender<()>>,
    sign_in: Option<oneshot::Sender<SignInReply>>,
    sign_out: Option<oneshot::Sender<bool>>,
}

impl Waiters {
    /// A sign-in, restore or sign-out is still waiting for its reply.
    fn request_pending(&self) -> bool {
        self.sign_in.as_ref().is_some_and(|tx| !tx.is_closed())
            || self.sign_out.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

struct Inner {
    config: ClientConfig,
    registry: Arc<TypeRegistry>,
    used: AtomicBool,
    state: Mutex<ConnectionState>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    session: Mutex<Option<Session>>,
    modules: RwLock<Vec<Arc<dyn ClientModule>>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    events: broadcast::Sender<ClientEvent>,
    waiters: Mutex<Waiters>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    finished: CancellationToken,
}

/// A client's link to a Linkup server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConnection {
    /// Connection with default configuration and a fresh type registry.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Connection with `config` and a fresh type registry.
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_registry(config, Arc::new(TypeRegistry::new()))
    }

    /// Connection sharing an existing type registry.
    pub fn with_registry(config: ClientConfig, registry: Arc<TypeRegistry>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                used: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Disconnected),
                channel: Mutex::new(None),
                session: Mutex::new(None),
                modules: RwLock::new(Vec::new()),
                inbox_tx: Mutex::new(Some(inbox_tx)),
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
                events,
                waiters: Mutex::new(Waiters::default()),
                disconnect_reason: Mutex::new(None),
                finished: CancellationToken::new(),
            }),
        }
    }

    /// Types this connection accepts from the server.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    // ── State ───────────────────────────────────────────────────────────────

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether the server acknowledged the connection and it is still live.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::SignedIn
        )
    }

    /// Whether a session is held on a live connection.
    pub fn is_signed_in(&self) -> bool {
        self.state() == ConnectionState::SignedIn
    }

    /// Current or most recent session. Kept after disconnect so it can be
    /// restored on a new connection.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// Identity of the current or most recent session.
    pub fn id(&self) -> Option<Id> {
        self.inner.session.lock().as_ref().map(|s| s.id.clone())
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        if self.state() == ConnectionState::Disconnected {
            *self.inner.disconnect_reason.lock()
        } else {
            None
        }
    }

    /// Lifecycle notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock() = state;
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.channel.lock().clone()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    // ── Connect / disconnect ────────────────────────────────────────────────

    /// Open a channel to `endpoint` and wait for the server's `Connected`.
    ///
    /// `certificate` pins the server certificate for `ssl`, `https` and
    /// `wss`. On failure the connection stays disconnected.
    pub async fn connect(&self, endpoint: &str, certificate: Option<Certificate>) -> Result<()> {
        if self.inner.used.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyUsed);
        }
        let endpoint: Endpoint = endpoint.parse()?;
        self.set_state(ConnectionState::Connecting);

        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().connected = Some(tx);

        let options = self.inner.config.connect_options(certificate);
        let opened = async {
            let channel = linkup_transport::connect(&endpoint, &options).await?;
            let events = channel.open().await?;
            Ok::<_, ClientError>((channel, events))
        };
        let (channel, events) = match opened.await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(%endpoint, error = %e, "connect failed");
                self.abandon();
                return Err(e);
            }
        };
        *self.inner.channel.lock() = Some(Arc::clone(&channel));
        drop(tokio::spawn(receive_loop(self.clone(), events)));

        match tokio::time::timeout(self.inner.config.connect_timeout, rx).await {
            Ok(Ok(())) => {
                info!(%endpoint, "connected");
                Ok(())
            }
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                warn!(%endpoint, "no connection acknowledgement from server");
                channel.close().await;
                Err(ClientError::Timeout("connection acknowledgement"))
            }
        }
    }

    /// Tell the server we are leaving, close the channel and wait for the
    /// receive loop to finish. No-op when not connected.
    pub async fn disconnect(&self) {
        let Some(channel) = self.channel() else {
            return;
        };
        {
            let mut reason = self.inner.disconnect_reason.lock();
            if reason.is_none() {
                *reason = Some(DisconnectReason::ClientRequest);
            }
        }
        match Packet::new(&Disconnected {
            reason: DisconnectReason::ClientRequest,
        }) {
            Ok(packet) => {
                let _ = channel.send(&packet).await;
            }
            Err(e) => warn!(error = %e, "failed to encode disconnect packet"),
        }
        channel.close().await;
        let finished = self.inner.finished.cancelled();
        if tokio::time::timeout(self.inner.config.request_timeout, finished)
            .await
            .is_err()
        {
            warn!("receive loop did not finish after disconnect");
        }
    }

    /// Setup failed before a receive loop existed.
    fn abandon(&self) {
        self.set_state(ConnectionState::Disconnected);
        *self.inner.waiters.lock() = Waiters::default();
        let _ = self.inner.inbox_tx.lock().take();
        self.inner.finished.cancel();
    }

    /// The channel is gone.
    fn finish(&self) {
        let reason = *self
            .inner
            .disconnect_reason
            .lock()
            .get_or_insert(DisconnectReason::ConnectionLost);
        self.set_state(ConnectionState::Disconnected);
        let _ = self.inner.channel.lock().take();
        *self.inner.waiters.lock() = Waiters::default();
        let _ = self.inner.inbox_tx.lock().take();
        self.inner.finished.cancel();
        info!(%reason, "disconnected");
        self.emit(ClientEvent::Disconnected(reason));
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Sign in as `id` without credentials.
    pub async fn sign_in(&self, id: Id) -> Result<Session> {
        self.sign_in_with(SignIn::new(id)).await
    }

    /// Sign in and wait for the server's verdict.
    pub async fn sign_in_with(&self, sign_in: SignIn) -> Result<Session> {
        let rx = self.expect_sign_in()?;
        debug!(id = %sign_in.id, "signing in");
        self.send_protocol(&sign_in).await?;
        self.sign_in_outcome(rx, "sign-in").await
    }

    /// Adopt a session from an earlier connection.
    pub async fn restore_session(&self, session: Session) -> Result<Session> {
        let rx = self.expect_sign_in()?;
        debug!(id = %session.id, "restoring session");
        self.send_protocol(&RestoreSession { session }).await?;
        self.sign_in_outcome(rx, "session restore").await
    }

    /// Close the current session; the connection stays open.
    pub async fn sign_out(&self) -> Result<()> {
        if !self.is_signed_in() {
            return Err(ClientError::NotSignedIn);
        }
        let session = self.session().ok_or(ClientError::NotSignedIn)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.lock();
            if waiters.request_pending() {
                return Err(ClientError::RequestInFlight);
            }
            waiters.sign_out = Some(tx);
        }
        self.send_protocol(&SignOut { session }).await?;
        if self.await_reply(rx, "sign-out").await? {
            Ok(())
        } else {
            Err(ClientError::NotSignedIn)
        }
    }

    fn expect_sign_in(&self) -> Result<oneshot::Receiver<SignInReply>> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let mut waiters = self.inner.waiters.lock();
        if waiters.request_pending() {
            return Err(ClientError::RequestInFlight);
        }
        let (tx, rx) = oneshot::channel();
        waiters.sign_in = Some(tx);
        Ok(rx)
    }

    async fn sign_in_outcome(
        &self,
        rx: oneshot::Receiver<SignInReply>,
        what: &'static str,
    ) -> Result<Session> {
        match self.await_reply(rx, what).await? {
            SignInReply::Accepted(session) => Ok(session),
            SignInReply::Rejected(id) => Err(ClientError::AuthenticationFailed(id)),
        }
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, what: &'static str) -> Result<T> {
        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout(what)),
        }
    }

    async fn send_protocol<T: PacketContent>(&self, content: &T) -> Result<()> {
        let packet = Packet::new(content)?;
        let channel = self.channel().ok_or(ClientError::NotConnected)?;
        if channel.send(&packet).await {
            Ok(())
        } else {
            Err(ClientError::Disconnected)
        }
    }

    // ── Application packets ─────────────────────────────────────────────────

    /// Broadcast `content` to every other signed-in client.
    pub async fn send<T: PacketContent>(&self, content: &T) -> Result<bool> {
        Ok(self.send_packet(Packet::new(content)?).await)
    }

    /// Send `content` to `recipient`.
    pub async fn send_to<T: PacketContent>(&self, recipient: Id, content: &T) -> Result<bool> {
        Ok(self.send_packet(Packet::new(content)?.to(recipient)).await)
    }

    /// Stamp the sender from the current session and send. Returns `false`
    /// when there is no channel or the write failed.
    pub async fn send_packet(&self, mut packet: Packet) -> bool {
        let Some(channel) = self.channel() else {
            return false;
        };
        packet.sender = if self.is_signed_in() { self.id() } else { None };
        channel.send(&packet).await
    }

    /// Next application packet not claimed by a module, in receipt order.
    ///
    /// Returns `None` once the connection is gone and the queue is drained.
    pub async fn receive(&self) -> Option<Packet> {
        self.inner.inbox_rx.lock().await.recv().await
    }

    // ── Modules ─────────────────────────────────────────────────────────────

    /// Install `module` after the existing ones.
    pub fn add_module(&self, module: Arc<dyn ClientModule>) -> Result<()> {
        {
            let mut modules = self.inner.modules.write();
            if modules.iter().any(|m| Arc::ptr_eq(m, &module)) {
                return Err(ClientError::ModuleAlreadyAdded(module.name().to_owned()));
            }
            modules.push(Arc::clone(&module));
        }
        module.on_added(self);
        debug!(module = module.name(), "client module added");
        Ok(())
    }

    /// Remove `module`. Returns `false` if it was not installed.
    pub fn remove_module(&self, module: &Arc<dyn ClientModule>) -> bool {
        let removed = {
            let mut modules = self.inner.modules.write();
            let before = modules.len();
            modules.retain(|m| !Arc::ptr_eq(m, module));
            modules.len() != before
        };
        if removed {
            module.on_removed(self);
            debug!(module = module.name(), "client module removed");
        }
        removed
    }

    /// Installed modules, in dispatch order.
    pub fn modules(&self) -> Vec<Arc<dyn ClientModule>> {
        self.inner.modules.read().clone()
    }

    // ── Receive side ────────────────────────────────────────────────────────

    async fn on_packet(&self, packet: Packet) {
        match ProtocolMessage::parse(&packet) {
            Some(Ok(message)) => self.on_protocol(message).await,
            Some(Err(e)) => {
                warn!(type_name = %packet.type_name, error = %e, "dropping malformed protocol packet");
            }
            None => self.on_application(packet).await,
        }
    }

    async fn on_protocol(&self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Connected(_) => {
                {
                    let mut state = self.inner.state.lock();
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Connected;
                    }
                }
                if let Some(tx) = self.inner.waiters.lock().connected.take() {
                    let _ = tx.send(());
                }
                self.emit(ClientEvent::Connected);
            }
            ProtocolMessage::SignedIn(signed_in) => {
                let session = signed_in.session;
                *self.inner.session.lock() = Some(session.clone());
                self.set_state(ConnectionState::SignedIn);
                info!(id = %session.id, "signed in");
                if let Some(tx) = self.inner.waiters.lock().sign_in.take() {
                    let _ = tx.send(SignInReply::Accepted(session.clone()));
                }
                self.emit(ClientEvent::SignedIn(session));
            }
            ProtocolMessage::AuthenticationFailed(failed) => {
                info!(id = %failed.id, "authentication failed");
                if let Some(tx) = self.inner.waiters.lock().sign_in.take() {
                    let _ = tx.send(SignInReply::Rejected(failed.id.clone()));
                }
                self.emit(ClientEvent::AuthenticationFailed(failed.id));
            }
            ProtocolMessage::SignedOut(signed_out) => self.on_signed_out(signed_out),
            ProtocolMessage::Disconnected(disconnected) => {
                debug!(reason = %disconnected.reason, "server is closing the connection");
                {
                    let mut reason = self.inner.disconnect_reason.lock();
                    if reason.is_none() {
                        *reason = Some(disconnected.reason);
                    }
                }
                if let Some(channel) = self.channel() {
                    channel.close().await;
                }
            }
            ProtocolMessage::SignIn(_)
            | ProtocolMessage::SignOut(_)
            | ProtocolMessage::RestoreSession(_) => {
                warn!("dropping server-bound protocol packet received by a client");
            }
        }
    }

    fn on_signed_out(&self, signed_out: SignedOut) {
        let cleared = signed_out.is_current_session && {
            let mut session = self.inner.session.lock();
            if session.as_ref() == Some(&signed_out.session) {
                *session = None;
                true
            } else {
                false
            }
        };
        if cleared {
            self.set_state(ConnectionState::Connected);
            info!(id = %signed_out.session.id, "signed out");
        }
        if let Some(tx) = self.inner.waiters.lock().sign_out.take() {
            let _ = tx.send(cleared);
        }
        if cleared {
            self.emit(ClientEvent::SignedOut(signed_out.session));
        }
    }

    async fn on_application(&self, packet: Packet) {
        if !self.inner.registry.contains(&packet.type_name) {
            warn!(type_name = %packet.type_name, "dropping packet of unregistered type");
            return;
        }
        let modules = self.modules();
        if !modules.is_empty() {
            let ctx = ClientContext::new(self.clone());
            for module in &modules {
                if module.handlers().dispatch(&packet, &ctx).await {
                    debug!(module = module.name(), type_name = %packet.type_name, "packet handled by module");
                    return;
                }
            }
        }
        if let Some(tx) = self.inner.inbox_tx.lock().as_ref() {
            let _ = tx.send(packet);
        }
    }
}

#[instrument(skip_all, fields(peer))]
async fn receive_loop(connection: ClientConnection, mut events: ChannelEvents) {
    if let Some(channel) = connection.channel() {
        let _ = tracing::Span::current().record("peer", channel.peer());
    }
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Packet(packet) => connection.on_packet(packet).await,
            ChannelEvent::Closed => break,
        }
    }
    connection.finish();
}
