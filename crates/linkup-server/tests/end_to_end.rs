//! Client/server scenarios over every endpoint scheme.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use linkup_client::{ClientConfig, ClientConnection, ClientError, ClientEvent};
use linkup_core::protocol::SignIn;
use linkup_core::{DisconnectReason, Id, Packet, PacketContent, Session};
use linkup_server::{Authenticator, DomainAuthenticator, Server, ServerConfig, ServerEvent};
use linkup_transport::Certificate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    text: String,
}

impl PacketContent for Chat {
    const TYPE_NAME: &'static str = "tests.Chat";
}

#[derive(Default)]
struct CountingAuthenticator {
    calls: AtomicUsize,
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self, sign_in: &SignIn) -> Option<Session> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Session::new(sign_in.id.clone()))
    }
}

struct Harness {
    server: Server,
    authenticator: Arc<CountingAuthenticator>,
    endpoint: String,
    certificate: Option<Certificate>,
}

impl Harness {
    async fn start(scheme: &str) -> Self {
        let server = Server::new(ServerConfig {
            authentication_timeout: None,
            ..ServerConfig::default()
        });
        let authenticator = Arc::new(CountingAuthenticator::default());
        server.add_authenticator(authenticator.clone()).unwrap();

        let served = matches!(scheme, "ssl" | "wss" | "https")
            .then(|| Certificate::self_signed(&["localhost"]).unwrap());
        let configured = format!("{scheme}://localhost:0/linkup");
        let addr = server
            .add_listener(&configured, served.as_ref())
            .await
            .unwrap();
        Self {
            server,
            authenticator,
            endpoint: format!("{scheme}://localhost:{}/linkup", addr.port()),
            certificate: served.map(|c| c.public()),
        }
    }

    async fn client(&self) -> ClientConnection {
        let client = ClientConnection::with_config(ClientConfig {
            poll_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        });
        let _ = client.registry().register::<Chat>().unwrap();
        client
            .connect(&self.endpoint, self.certificate.clone())
            .await
            .unwrap();
        assert!(client.is_connected());
        client
    }

    async fn signed_in(&self, who: &str) -> ClientConnection {
        let client = self.client().await;
        let session = client.sign_in(id(who)).await.unwrap();
        assert_eq!(session.id, id(who));
        client
    }

    async fn wait_for(&self, condition: impl Fn(&Server) -> bool) {
        for _ in 0..500 {
            if condition(&self.server) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never reached the expected state");
    }
}

fn id(s: &str) -> Id {
    s.parse().unwrap()
}

async fn receive(client: &ClientConnection) -> Packet {
    timeout(WAIT, client.receive())
        .await
        .expect("no packet in time")
        .expect("connection closed")
}

async fn disconnect_reason(events: &mut broadcast::Receiver<ClientEvent>) -> DisconnectReason {
    loop {
        match timeout(WAIT, events.recv()).await.expect("no event in time") {
            Ok(ClientEvent::Disconnected(reason)) => return reason,
            Ok(_) => {}
            Err(e) => panic!("event stream failed: {e}"),
        }
    }
}

async fn restore_after_reconnect(scheme: &str) {
    let harness = Harness::start(scheme).await;
    let first = harness.signed_in("alice@tests").await;
    let session = first.session().unwrap();
    first.disconnect().await;
    assert!(!first.is_connected());
    harness.wait_for(|s| s.signed_in().is_empty()).await;

    let mut server_events = harness.server.subscribe();
    let second = harness.client().await;
    let restored = second.restore_session(session.clone()).await.unwrap();
    assert_eq!(restored, session);
    assert!(second.is_signed_in());
    assert_eq!(second.id(), Some(id("alice@tests")));
    assert_eq!(harness.authenticator.calls.load(Ordering::SeqCst), 1);
    assert_matches!(
        timeout(WAIT, server_events.recv()).await.unwrap(),
        Ok(ServerEvent::ClientReconnected { session: s, .. }) if s == session
    );
    harness.server.shutdown().await;
}

async fn direct_delivery(scheme: &str) {
    let harness = Harness::start(scheme).await;
    let a = harness.signed_in("a@t").await;
    let b = harness.signed_in("b@t").await;

    assert!(a.send_to(id("b@t"), &Chat { text: "hello b".into() }).await.unwrap());
    let packet = receive(&b).await;
    assert_eq!(packet.sender, Some(id("a@t")));
    assert_eq!(packet.recipient, Some(id("b@t")));
    assert_eq!(packet.content::<Chat>().unwrap().text, "hello b");
    harness.server.shutdown().await;
}

async fn broadcast_skips_sender(scheme: &str) {
    let harness = Harness::start(scheme).await;
    let a = harness.signed_in("a@t").await;
    let b = harness.signed_in("b@t").await;
    let c = harness.signed_in("c@t").await;

    assert!(a.send(&Chat { text: "everyone".into() }).await.unwrap());
    for other in [&b, &c] {
        let packet = receive(other).await;
        assert_eq!(packet.sender, Some(id("a@t")));
        assert_eq!(packet.content::<Chat>().unwrap().text, "everyone");
    }
    assert!(
        timeout(Duration::from_millis(300), a.receive()).await.is_err(),
        "broadcast echoed to its sender"
    );
    harness.server.shutdown().await;
}

async fn second_sign_in_takes_over(scheme: &str) {
    let harness = Harness::start(scheme).await;
    let first = harness.signed_in("x@d").await;
    let mut events = first.subscribe();
    let second = harness.signed_in("x@d").await;

    assert_eq!(
        disconnect_reason(&mut events).await,
        DisconnectReason::AnotherSessionOpened
    );
    assert!(!first.is_connected());
    assert!(second.is_signed_in());
    harness.wait_for(|s| s.connection_count() == 1).await;
    assert_eq!(harness.server.owners_of(&id("x@d")).len(), 1);
    harness.server.shutdown().await;
}

async fn shutdown_reaches_clients(scheme: &str) {
    let harness = Harness::start(scheme).await;
    let client = harness.signed_in("alice@tests").await;
    let mut events = client.subscribe();
    harness.server.shutdown().await;
    assert_eq!(
        disconnect_reason(&mut events).await,
        DisconnectReason::ServerRequest
    );
    assert_matches!(
        client.sign_in(id("alice@tests")).await,
        Err(ClientError::NotConnected)
    );
}

macro_rules! for_each_scheme {
    ($($scheme:ident),* $(,)?) => {
        $(
            mod $scheme {
                #[tokio::test]
                async fn restore_after_reconnect() {
                    super::restore_after_reconnect(stringify!($scheme)).await;
                }

                #[tokio::test]
                async fn direct_delivery() {
                    super::direct_delivery(stringify!($scheme)).await;
                }

                #[tokio::test]
                async fn broadcast_skips_sender() {
                    super::broadcast_skips_sender(stringify!($scheme)).await;
                }

                #[tokio::test]
                async fn second_sign_in_takes_over() {
                    super::second_sign_in_takes_over(stringify!($scheme)).await;
                }

                #[tokio::test]
                async fn shutdown_reaches_clients() {
                    super::shutdown_reaches_clients(stringify!($scheme)).await;
                }
            }
        )*
    };
}

for_each_scheme!(tcp, ssl, ws, wss, http, https);

#[tokio::test]
async fn unreachable_server_leaves_client_disconnected() {
    let client = ClientConnection::new();
    assert!(client.connect("tcp://127.0.0.1:9/", None).await.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn anonymous_client_cannot_sign_out() {
    let harness = Harness::start("tcp").await;
    let client = harness.client().await;
    assert_matches!(client.sign_out().await, Err(ClientError::NotSignedIn));
    harness.server.shutdown().await;
}

#[tokio::test]
async fn sign_out_keeps_connection_open() {
    let harness = Harness::start("tcp").await;
    let client = harness.signed_in("alice@tests").await;
    let session = client.session().unwrap();
    client.sign_out().await.unwrap();
    assert!(client.is_connected());
    assert!(!client.is_signed_in());
    harness.wait_for(|s| s.signed_in().is_empty()).await;
    assert!(!harness.server.repository().contains(&session.token));
    harness.server.shutdown().await;
}

#[tokio::test]
async fn rejected_re_sign_in_leaves_client_anonymous() {
    let server = Server::new(ServerConfig {
        authentication_timeout: None,
        ..ServerConfig::default()
    });
    server
        .add_authenticator(Arc::new(DomainAuthenticator::new(["t"])))
        .unwrap();
    let addr = server.add_listener("tcp://127.0.0.1:0/", None).await.unwrap();
    let client = ClientConnection::new();
    client
        .connect(&format!("tcp://127.0.0.1:{}/", addr.port()), None)
        .await
        .unwrap();

    let first = client.sign_in(id("a@t")).await.unwrap();
    assert_matches!(
        client.sign_in(id("b@elsewhere")).await,
        Err(ClientError::AuthenticationFailed(who)) if who == id("b@elsewhere")
    );
    assert!(client.is_connected());
    assert!(!client.is_signed_in());
    assert_eq!(client.id(), None);
    assert!(server.signed_in().is_empty());
    assert!(!server.repository().contains(&first.token));
    server.shutdown().await;
}
