//! The server side of one accepted channel.
//!
//! A [`ServerConnection`] acknowledges the peer, turns inbound protocol
//! packets into [`ConnectionEvent`]s for the server to resolve, and never
//! initiates sign-in itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use linkup_core::protocol::{Connected, Disconnected, ProtocolMessage, SignIn};
use linkup_core::{
    ConnectionId, ConnectionState, DisconnectReason, Id, Packet, PacketContent, Session,
};
use linkup_transport::{Channel, ChannelEvents};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::Result;

/// What an inbound packet asks of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer wants to sign in.
    SignInRequired(SignIn),
    /// The peer wants to close this session.
    SignOutRequired(Session),
    /// The peer wants to adopt an earlier session.
    RestoreSessionRequired(Session),
    /// The peer announced it is leaving.
    DisconnectRequested(DisconnectReason),
    /// An application packet, sender stamped from the connection's session.
    Packet(Packet),
}

/// One accepted client link.
pub struct ServerConnection {
    id: ConnectionId,
    channel: Arc<dyn Channel>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    has_signed_in: AtomicBool,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    accepted_at: Instant,
}

impl ServerConnection {
    /// Wrap an accepted, not yet opened channel.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            id: ConnectionId::new(),
            channel,
            state: Mutex::new(ConnectionState::Connecting),
            session: Mutex::new(None),
            has_signed_in: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            accepted_at: Instant::now(),
        }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Transport peer description.
    pub fn peer(&self) -> &str {
        self.channel.peer()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the channel is open and acknowledged.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::SignedIn
        )
    }

    /// Whether the connection holds a session.
    pub fn is_signed_in(&self) -> bool {
        self.session.lock().is_some()
    }

    /// The held session.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// Identity of the held session.
    pub fn user_id(&self) -> Option<Id> {
        self.session.lock().as_ref().map(|s| s.id.clone())
    }

    /// Time since the channel was accepted.
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Why the connection ended or is ending.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock()
    }

    /// Open the channel and acknowledge the peer with `Connected`.
    pub async fn open(&self) -> Result<ChannelEvents> {
        let events = self.channel.open().await?;
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
            }
        }
        if !self.send_content(&Connected {}).await {
            debug!(connection_id = %self.id, "peer left before acknowledgement");
        }
        Ok(events)
    }

    /// Write a packet as routed; the sender is not restamped.
    pub async fn send(&self, packet: &Packet) -> bool {
        self.channel.send(packet).await
    }

    /// Encode and write `content`.
    pub async fn send_content<T: PacketContent>(&self, content: &T) -> bool {
        match Packet::new(content) {
            Ok(packet) => self.send(&packet).await,
            Err(e) => {
                warn!(connection_id = %self.id, type_name = T::TYPE_NAME, error = %e, "failed to encode packet");
                false
            }
        }
    }

    /// Notify the peer with `Disconnected { reason }` and close the channel.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.close(reason, true).await;
    }

    /// Close the channel, notifying the peer unless it already said goodbye.
    pub(crate) async fn close(&self, reason: DisconnectReason, notify: bool) {
        let reason = self.record_reason(reason);
        if notify && self.channel.is_open() {
            let _ = self.send_content(&Disconnected { reason }).await;
        }
        self.channel.close().await;
    }

    /// Keep the first recorded reason; returns the one in effect.
    pub(crate) fn record_reason(&self, reason: DisconnectReason) -> DisconnectReason {
        *self.disconnect_reason.lock().get_or_insert(reason)
    }

    /// Replace the held session, returning the previous one.
    pub(crate) fn set_session(&self, session: Option<Session>) -> Option<Session> {
        let signed_in = session.is_some();
        let previous = std::mem::replace(&mut *self.session.lock(), session);
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            *state = if signed_in {
                ConnectionState::SignedIn
            } else {
                ConnectionState::Connected
            };
        }
        if signed_in {
            self.has_signed_in.store(true, Ordering::Release);
        }
        previous
    }

    /// Whether the connection ever held a session.
    pub(crate) fn has_signed_in(&self) -> bool {
        self.has_signed_in.load(Ordering::Acquire)
    }

    /// The channel is gone. Returns the reason in effect.
    pub(crate) fn finish(&self) -> DisconnectReason {
        *self.state.lock() = ConnectionState::Disconnected;
        self.record_reason(DisconnectReason::ConnectionLost)
    }

    /// Classify an inbound packet. Protocol faults are logged and yield `None`.
    pub fn interpret(&self, mut packet: Packet) -> Option<ConnectionEvent> {
        match ProtocolMessage::parse(&packet) {
            None => {
                packet.sender = self.user_id();
                Some(ConnectionEvent::Packet(packet))
            }
            Some(Ok(message)) => match message {
                ProtocolMessage::SignIn(sign_in) => Some(ConnectionEvent::SignInRequired(sign_in)),
                ProtocolMessage::SignOut(sign_out) => {
                    Some(ConnectionEvent::SignOutRequired(sign_out.session))
                }
                ProtocolMessage::RestoreSession(restore) => {
                    Some(ConnectionEvent::RestoreSessionRequired(restore.session))
                }
                ProtocolMessage::Disconnected(disconnected) => {
                    let reason = self.record_reason(disconnected.reason);
                    Some(ConnectionEvent::DisconnectRequested(reason))
                }
                ProtocolMessage::Connected(_)
                | ProtocolMessage::SignedIn(_)
                | ProtocolMessage::SignedOut(_)
                | ProtocolMessage::AuthenticationFailed(_) => {
                    warn!(
                        connection_id = %self.id,
                        type_name = %packet.type_name,
                        "dropping client-bound protocol packet received by the server"
                    );
                    None
                }
            },
            Some(Err(e)) => {
                warn!(
                    connection_id = %self.id,
                    type_name = %packet.type_name,
                    error = %e,
                    "dropping malformed protocol packet"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer())
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use linkup_core::protocol::{RestoreSession, SignOut, SignedIn};
    use linkup_transport::{ChannelEvent, StreamChannel};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    impl PacketContent for Chat {
        const TYPE_NAME: &'static str = "test.Chat";
    }

    fn pair() -> (ServerConnection, Arc<dyn Channel>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server: Arc<dyn Channel> = Arc::new(StreamChannel::new(a, "server"));
        let client: Arc<dyn Channel> = Arc::new(StreamChannel::new(b, "client"));
        (ServerConnection::new(server), client)
    }

    fn alice() -> Id {
        "alice@tests".parse().unwrap()
    }

    #[tokio::test]
    async fn open_acknowledges_peer() {
        let (connection, client) = pair();
        let mut client_events = client.open().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connecting);
        let _events = connection.open().await.unwrap();
        assert!(connection.is_connected());
        assert_matches!(
            client_events.recv().await,
            Some(ChannelEvent::Packet(p)) if p.is::<Connected>()
        );
    }

    #[test]
    fn protocol_packets_become_events() {
        let (connection, _client) = pair();
        let session = Session::new(alice());

        let sign_in = Packet::new(&SignIn::new(alice())).unwrap();
        assert_matches!(
            connection.interpret(sign_in),
            Some(ConnectionEvent::SignInRequired(s)) if s.id == alice()
        );

        let sign_out = Packet::new(&SignOut { session: session.clone() }).unwrap();
        assert_matches!(
            connection.interpret(sign_out),
            Some(ConnectionEvent::SignOutRequired(s)) if s == session
        );

        let restore = Packet::new(&RestoreSession { session: session.clone() }).unwrap();
        assert_matches!(
            connection.interpret(restore),
            Some(ConnectionEvent::RestoreSessionRequired(s)) if s == session
        );

        let bye = Packet::new(&Disconnected { reason: DisconnectReason::ClientRequest }).unwrap();
        assert_matches!(
            connection.interpret(bye),
            Some(ConnectionEvent::DisconnectRequested(DisconnectReason::ClientRequest))
        );
        assert_eq!(connection.disconnect_reason(), Some(DisconnectReason::ClientRequest));
    }

    #[test]
    fn client_bound_and_malformed_protocol_packets_are_dropped() {
        let (connection, _client) = pair();
        let echoed = Packet::new(&SignedIn { session: Session::new(alice()) }).unwrap();
        assert!(connection.interpret(echoed).is_none());

        let mut broken = Packet::new(&SignIn::new(alice())).unwrap();
        broken.content = "{not json".into();
        assert!(connection.interpret(broken).is_none());
    }

    #[test]
    fn sender_is_never_taken_from_the_wire() {
        let (connection, _client) = pair();
        let mut forged = Packet::new(&Chat { text: "hi".into() }).unwrap();
        forged.sender = Some("mallory@tests".parse().unwrap());
        assert_matches!(
            connection.interpret(forged.clone()),
            Some(ConnectionEvent::Packet(p)) if p.sender.is_none()
        );

        let _ = connection.set_session(Some(Session::new(alice())));
        assert_matches!(
            connection.interpret(forged),
            Some(ConnectionEvent::Packet(p)) if p.sender == Some(alice())
        );
    }

    #[test]
    fn session_drives_state() {
        let (connection, _client) = pair();
        let session = Session::new(alice());
        assert!(connection.set_session(Some(session.clone())).is_none());
        assert!(connection.is_signed_in());
        assert!(connection.has_signed_in());
        assert_eq!(connection.state(), ConnectionState::SignedIn);
        assert_eq!(connection.set_session(None), Some(session));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.has_signed_in());
    }

    #[tokio::test]
    async fn disconnect_notifies_then_closes() {
        let (connection, client) = pair();
        let mut client_events = client.open().await.unwrap();
        let _events = connection.open().await.unwrap();
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Packet(_)));

        connection.disconnect(DisconnectReason::ServerRequest).await;
        assert_matches!(
            client_events.recv().await,
            Some(ChannelEvent::Packet(p))
                if p.content::<Disconnected>().unwrap().reason == DisconnectReason::ServerRequest
        );
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(connection.finish(), DisconnectReason::ServerRequest);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn first_reason_wins() {
        let (connection, _client) = pair();
        assert_eq!(
            connection.record_reason(DisconnectReason::AnotherSessionOpened),
            DisconnectReason::AnotherSessionOpened
        );
        assert_eq!(connection.finish(), DisconnectReason::AnotherSessionOpened);
    }
}
