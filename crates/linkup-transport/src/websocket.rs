//! WebSocket channels (`ws`, `wss`).
//!
//! One binary message carries one packet. Text messages are accepted on
//! receive for peers that cannot send binary.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use linkup_core::{Packet, PacketFramer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{
    AcceptedSender, Channel, ChannelCore, ChannelEvents, ChannelListener, ListenerSlot,
};
use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::serve::spawn_router;

enum Outbound {
    Data(Vec<u8>),
    Close,
}

enum Inbound {
    Data(Vec<u8>),
    Close,
    Control,
}

type FrameSink = Pin<Box<dyn Sink<Outbound, Error = String> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Inbound, String>> + Send>>;

/// A channel over an established WebSocket, client or server side.
pub struct WebSocketChannel {
    peer: String,
    core: Arc<ChannelCore>,
    framer: PacketFramer,
    sink: tokio::sync::Mutex<FrameSink>,
    stream: parking_lot::Mutex<Option<FrameStream>>,
}

impl WebSocketChannel {
    fn from_parts(sink: FrameSink, stream: FrameStream, peer: String) -> Self {
        Self {
            peer,
            core: ChannelCore::new(),
            framer: PacketFramer::message(),
            sink: tokio::sync::Mutex::new(sink),
            stream: parking_lot::Mutex::new(Some(stream)),
        }
    }

    /// Server side: a socket upgraded by axum.
    pub fn from_axum(socket: WebSocket, peer: impl Into<String>) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink.sink_map_err(|e| e.to_string()).with(|out: Outbound| {
            future::ready(Ok::<_, String>(match out {
                Outbound::Data(bytes) => ws::Message::Binary(bytes.into()),
                Outbound::Close => ws::Message::Close(None),
            }))
        });
        let stream = stream.map(|message| match message {
            Ok(ws::Message::Binary(bytes)) => Ok(Inbound::Data(bytes.to_vec())),
            Ok(ws::Message::Text(text)) => Ok(Inbound::Data(text.as_str().as_bytes().to_vec())),
            Ok(ws::Message::Close(_)) => Ok(Inbound::Close),
            Ok(_) => Ok(Inbound::Control),
            Err(e) => Err(e.to_string()),
        });
        Self::from_parts(Box::pin(sink), Box::pin(stream), peer.into())
    }

    /// Client side: a tungstenite stream from a completed handshake.
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink.sink_map_err(|e| e.to_string()).with(|out: Outbound| {
            future::ready(Ok::<_, String>(match out {
                Outbound::Data(bytes) => tungstenite::Message::Binary(bytes.into()),
                Outbound::Close => tungstenite::Message::Close(None),
            }))
        });
        let stream = stream.map(|message| match message {
            Ok(tungstenite::Message::Binary(bytes)) => Ok(Inbound::Data(bytes.to_vec())),
            Ok(tungstenite::Message::Text(text)) => {
                Ok(Inbound::Data(text.as_str().as_bytes().to_vec()))
            }
            Ok(tungstenite::Message::Close(_)) => Ok(Inbound::Close),
            Ok(_) => Ok(Inbound::Control),
            Err(e) => Err(e.to_string()),
        });
        Self::from_parts(Box::pin(sink), Box::pin(stream), peer.into())
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn open(&self) -> Result<ChannelEvents> {
        let events = self.core.take_events()?;
        let Some(mut stream) = self.stream.lock().take() else {
            return Ok(events);
        };
        let core = Arc::clone(&self.core);
        let framer = self.framer.clone();
        let token = core.token();
        let peer = self.peer.clone();
        drop(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = token.cancelled() => break,
                    message = stream.next() => message,
                };
                match message {
                    Some(Ok(Inbound::Data(bytes))) => {
                        if let Some(packet) = framer.decode_message(&bytes) {
                            if !core.deliver(packet) {
                                break;
                            }
                        }
                    }
                    Some(Ok(Inbound::Control)) => {}
                    Some(Ok(Inbound::Close)) | None => {
                        debug!(%peer, "websocket closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%peer, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            core.finish();
        }));
        Ok(events)
    }

    async fn send(&self, packet: &Packet) -> bool {
        if self.core.is_closed() {
            return false;
        }
        let frame = match self.framer.encode_frame(packet) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "packet encode failed");
                return false;
            }
        };
        let mut sink = self.sink.lock().await;
        match sink.send(Outbound::Data(frame)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "websocket write failed");
                self.core.finish();
                false
            }
        }
    }

    async fn close(&self) {
        if self.core.is_closed() {
            return;
        }
        self.core.finish();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Outbound::Close).await;
        let _ = sink.close().await;
    }

    fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

#[derive(Clone)]
struct UpgradeState {
    accepted: AcceptedSender,
    label: Arc<str>,
}

async fn upgrade(State(state): State<UpgradeState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let channel = WebSocketChannel::from_axum(socket, state.label.as_ref());
        debug!(peer = %channel.peer(), "accepted websocket channel");
        if state.accepted.send(Arc::new(channel)).is_err() {
            debug!("accepted channel dropped, nobody is receiving");
        }
    })
}

pub(crate) fn router(path: &str, accepted: AcceptedSender, label: &str) -> Router {
    Router::new().route(path, get(upgrade)).with_state(UpgradeState {
        accepted,
        label: Arc::from(label),
    })
}

/// Accepts WebSocket upgrades on the endpoint's path.
pub struct WebSocketChannelListener {
    endpoint: Endpoint,
    tls: Option<TlsAcceptor>,
    slot: ListenerSlot,
}

impl WebSocketChannelListener {
    /// Listener for `endpoint`; `tls` turns it into a `wss` listener.
    pub fn new(endpoint: Endpoint, tls: Option<TlsAcceptor>) -> Self {
        Self {
            endpoint,
            tls,
            slot: ListenerSlot::default(),
        }
    }
}

#[async_trait]
impl ChannelListener for WebSocketChannelListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start(&self, accepted: AcceptedSender) -> Result<SocketAddr> {
        self.slot.ensure_idle()?;
        let label = format!("{} client", self.endpoint.scheme());
        let router = router(self.endpoint.path(), accepted, &label);
        let task = spawn_router(
            &self.endpoint,
            self.tls.clone(),
            router,
            CancellationToken::new(),
        )
        .await?;
        self.slot.install(task)
    }

    async fn stop(&self) {
        self.slot.stop().await;
        debug!(endpoint = %self.endpoint, "websocket listener stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use assert_matches::assert_matches;
    use linkup_core::PacketContent;
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    #[derive(Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    impl PacketContent for Chat {
        const TYPE_NAME: &'static str = "test.Chat";
    }

    fn chat(text: &str) -> Packet {
        Packet::new(&Chat { text: text.into() }).unwrap()
    }

    async fn start_listener() -> (WebSocketChannelListener, SocketAddr, mpsc::UnboundedReceiver<Arc<dyn Channel>>) {
        let endpoint: Endpoint = "ws://127.0.0.1:0/linkup".parse().unwrap();
        let listener = WebSocketChannelListener::new(endpoint, None);
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = listener.start(tx).await.unwrap();
        (listener, addr, rx)
    }

    #[tokio::test]
    async fn exchange_both_ways() {
        let (listener, addr, mut accepted) = start_listener().await;
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/linkup"))
            .await
            .unwrap();
        let client = WebSocketChannel::from_tungstenite(socket, "server");
        let mut client_events = client.open().await.unwrap();

        let server = accepted.recv().await.unwrap();
        let mut server_events = server.open().await.unwrap();

        assert!(client.send(&chat("up")).await);
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Packet(p)) => {
            assert_eq!(p.content::<Chat>().unwrap().text, "up");
        });

        assert!(server.send(&chat("down")).await);
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Packet(p)) => {
            assert_eq!(p.content::<Chat>().unwrap().text, "down");
        });

        client.close().await;
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Closed));
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Closed));
        listener.stop().await;
    }

    #[tokio::test]
    async fn text_frames_are_accepted() {
        let (listener, addr, mut accepted) = start_listener().await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/linkup"))
            .await
            .unwrap();
        let server = accepted.recv().await.unwrap();
        let mut server_events = server.open().await.unwrap();

        let text = serde_json::to_string(&chat("as text")).unwrap();
        socket
            .send(tungstenite::Message::Text(text.into()))
            .await
            .unwrap();
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Packet(p)) if p.is::<Chat>());
        listener.stop().await;
    }

    #[tokio::test]
    async fn other_paths_are_not_upgraded() {
        let (listener, addr, _accepted) = start_listener().await;
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere")).await;
        assert!(result.is_err());
        listener.stop().await;
    }
}
