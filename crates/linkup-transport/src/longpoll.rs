//! HTTP long-poll channels (`http`, `https`).
//!
//! Every request carries a [`CLIENT_ID_HEADER`] naming the client-side
//! channel; the first request with a new id creates the server-side
//! channel. `POST` bodies carry one packet from the client. A `GET` returns
//! the oldest pending server packet (`200`) or nothing (`204`).
//!
//! Server channels close after a window without requests. A closed server
//! channel flushes what is still queued on the next poll, if one comes
//! before the window ends.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use linkup_core::{Packet, PacketFramer};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{
    AcceptedSender, Channel, ChannelCore, ChannelEvents, ChannelListener, ListenerSlot,
};
use crate::endpoint::Endpoint;
use crate::errors::{Result, TransportError};
use crate::serve::spawn_router;

/// Header naming the client-side channel on every request.
pub const CLIENT_ID_HEADER: &str = "clientid";

/// Default inactivity window for server channels.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_secs(5);

// ── Server side ─────────────────────────────────────────────────────────────

/// Server end of one long-poll client.
pub struct LongPollServerChannel {
    client_id: String,
    core: Arc<ChannelCore>,
    framer: PacketFramer,
    pending: Mutex<VecDeque<Vec<u8>>>,
    activity: Arc<Mutex<Instant>>,
    inactivity: Duration,
    closing: AtomicBool,
}

impl LongPollServerChannel {
    fn new(client_id: String, inactivity: Duration) -> Self {
        Self {
            client_id,
            core: ChannelCore::new(),
            framer: PacketFramer::message(),
            pending: Mutex::new(VecDeque::new()),
            activity: Arc::new(Mutex::new(Instant::now())),
            inactivity,
            closing: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.activity.lock() = Instant::now();
    }

    /// A `POST` body arrived.
    fn data_received(&self, body: &[u8]) {
        self.touch();
        if let Some(packet) = self.framer.decode_message(body) {
            let _ = self.core.deliver(packet);
        }
    }

    /// A `GET` arrived: hand out the oldest pending frame.
    fn take_pending(&self) -> Option<Vec<u8>> {
        self.touch();
        let mut pending = self.pending.lock();
        let frame = pending.pop_front();
        if pending.is_empty() && self.closing.load(Ordering::Acquire) {
            self.core.finish();
        }
        frame
    }

    /// Frames queued for the client.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl Channel for LongPollServerChannel {
    async fn open(&self) -> Result<ChannelEvents> {
        let events = self.core.take_events()?;
        self.touch();
        let core = Arc::clone(&self.core);
        let activity = Arc::clone(&self.activity);
        let inactivity = self.inactivity;
        let token = core.token();
        let client_id = self.client_id.clone();
        drop(tokio::spawn(async move {
            loop {
                let deadline = *activity.lock() + inactivity;
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep_until(deadline) => {
                        if activity.lock().elapsed() >= inactivity {
                            debug!(%client_id, "long-poll client inactive");
                            break;
                        }
                    }
                }
            }
            core.finish();
        }));
        Ok(events)
    }

    async fn send(&self, packet: &Packet) -> bool {
        if self.core.is_closed() || self.closing.load(Ordering::Acquire) {
            return false;
        }
        match self.framer.encode_frame(packet) {
            Ok(frame) => {
                self.pending.lock().push_back(frame);
                true
            }
            Err(e) => {
                debug!(client_id = %self.client_id, error = %e, "packet encode failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if self.pending.lock().is_empty() {
            self.core.finish();
        }
    }

    fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    fn peer(&self) -> &str {
        &self.client_id
    }
}

pub(crate) struct LongPollHub {
    accepted: AcceptedSender,
    inactivity: Duration,
    channels: Mutex<HashMap<String, Arc<LongPollServerChannel>>>,
}

impl LongPollHub {
    pub(crate) fn new(accepted: AcceptedSender, inactivity: Duration) -> Arc<Self> {
        Arc::new(Self {
            accepted,
            inactivity,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Existing channel for `client_id`, or a new one handed to the acceptor.
    fn channel_for(self: &Arc<Self>, client_id: &str) -> Option<Arc<LongPollServerChannel>> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(client_id) {
            return Some(Arc::clone(channel));
        }
        let channel = Arc::new(LongPollServerChannel::new(client_id.to_owned(), self.inactivity));
        if self.accepted.send(Arc::clone(&channel) as Arc<dyn Channel>).is_err() {
            debug!(%client_id, "accepted channel dropped, nobody is receiving");
            return None;
        }
        debug!(%client_id, "accepted long-poll channel");
        let _ = channels.insert(client_id.to_owned(), Arc::clone(&channel));

        let hub: Weak<Self> = Arc::downgrade(self);
        let token = channel.core.token();
        let watched = Arc::downgrade(&channel);
        let id = client_id.to_owned();
        drop(tokio::spawn(async move {
            token.cancelled().await;
            let Some(hub) = hub.upgrade() else { return };
            let mut channels = hub.channels.lock();
            let current = channels
                .get(&id)
                .is_some_and(|c| Weak::ptr_eq(&Arc::downgrade(c), &watched));
            if current {
                let _ = channels.remove(&id);
            }
        }));
        Some(channel)
    }

    fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Finish every channel immediately, pending frames included.
    fn close_all(&self) {
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.closing.store(true, Ordering::Release);
            channel.core.finish();
        }
    }
}

async fn exchange(
    State(hub): State<Arc<LongPollHub>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(client_id) = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(channel) = hub.channel_for(client_id) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    if method == Method::POST {
        channel.data_received(&body);
        return StatusCode::OK.into_response();
    }
    match channel.take_pending() {
        Some(frame) => (StatusCode::OK, frame).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub(crate) fn router(path: &str, hub: Arc<LongPollHub>) -> Router {
    Router::new().route(path, any(exchange)).with_state(hub)
}

/// Serves long-poll requests on the endpoint's path.
pub struct LongPollChannelListener {
    endpoint: Endpoint,
    tls: Option<TlsAcceptor>,
    inactivity: Duration,
    slot: ListenerSlot,
    hub: Mutex<Option<Arc<LongPollHub>>>,
}

impl LongPollChannelListener {
    /// Listener for `endpoint`; `tls` turns it into an `https` listener.
    pub fn new(endpoint: Endpoint, tls: Option<TlsAcceptor>, inactivity: Duration) -> Self {
        Self {
            endpoint,
            tls,
            inactivity,
            slot: ListenerSlot::default(),
            hub: Mutex::new(None),
        }
    }

    /// Live long-poll channels.
    pub fn channel_count(&self) -> usize {
        self.hub.lock().as_ref().map_or(0, |hub| hub.len())
    }
}

#[async_trait]
impl ChannelListener for LongPollChannelListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start(&self, accepted: AcceptedSender) -> Result<SocketAddr> {
        self.slot.ensure_idle()?;
        let hub = LongPollHub::new(accepted, self.inactivity);
        let router = router(self.endpoint.path(), Arc::clone(&hub));
        let task = spawn_router(
            &self.endpoint,
            self.tls.clone(),
            router,
            CancellationToken::new(),
        )
        .await?;
        let addr = self.slot.install(task)?;
        *self.hub.lock() = Some(hub);
        Ok(addr)
    }

    async fn stop(&self) {
        self.slot.stop().await;
        let hub = self.hub.lock().take();
        if let Some(hub) = hub {
            hub.close_all();
        }
        debug!(endpoint = %self.endpoint, "long-poll listener stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.local_addr()
    }
}

// ── Client side ─────────────────────────────────────────────────────────────

/// Client end: polls with `GET`, sends with `POST`.
pub struct LongPollClientChannel {
    url: String,
    client_id: String,
    http: reqwest::Client,
    poll_interval: Duration,
    core: Arc<ChannelCore>,
    framer: PacketFramer,
    send_lock: tokio::sync::Mutex<()>,
}

impl LongPollClientChannel {
    /// Channel polling `url` through `http`, idling `poll_interval` after an
    /// empty poll.
    pub fn new(url: impl Into<String>, http: reqwest::Client, poll_interval: Duration) -> Self {
        Self {
            url: url.into(),
            client_id: uuid::Uuid::now_v7().to_string(),
            http,
            poll_interval,
            core: ChannelCore::new(),
            framer: PacketFramer::message(),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Value sent in [`CLIENT_ID_HEADER`].
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

async fn poll_once(http: &reqwest::Client, url: &str, client_id: &str) -> Result<Option<Bytes>> {
    let response = http
        .get(url)
        .header(CLIENT_ID_HEADER, client_id)
        .send()
        .await?;
    let status = response.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(TransportError::HttpStatus(status.as_u16()));
    }
    let body = response.bytes().await?;
    Ok((!body.is_empty()).then_some(body))
}

#[async_trait]
impl Channel for LongPollClientChannel {
    async fn open(&self) -> Result<ChannelEvents> {
        let events = self.core.take_events()?;
        let first = match poll_once(&self.http, &self.url, &self.client_id).await {
            Ok(first) => first,
            Err(e) => {
                self.core.finish();
                return Err(e);
            }
        };

        let core = Arc::clone(&self.core);
        let framer = self.framer.clone();
        let http = self.http.clone();
        let url = self.url.clone();
        let client_id = self.client_id.clone();
        let poll_interval = self.poll_interval;
        let token = core.token();
        drop(tokio::spawn(async move {
            let mut polled = Ok(first);
            loop {
                match polled {
                    Ok(Some(body)) => {
                        if let Some(packet) = framer.decode_message(&body) {
                            if !core.deliver(packet) {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        debug!(%url, error = %e, "long-poll failed");
                        break;
                    }
                }
                polled = tokio::select! {
                    () = token.cancelled() => break,
                    result = poll_once(&http, &url, &client_id) => result,
                };
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
                debug!(error = %e, "packet encode failed");
                return false;
            }
        };
        let _guard = self.send_lock.lock().await;
        let result = self
            .http
            .post(&self.url)
            .header(CLIENT_ID_HEADER, &self.client_id)
            .body(frame)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "long-poll send rejected");
                self.core.finish();
                false
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "long-poll send failed");
                self.core.finish();
                false
            }
        }
    }

    async fn close(&self) {
        self.core.finish();
    }

    fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    fn peer(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::Request;
    use linkup_core::PacketContent;
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

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

    fn request(method: Method, client_id: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/poll");
        if let Some(id) = client_id {
            builder = builder.header(CLIENT_ID_HEADER, id);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn hub() -> (Arc<LongPollHub>, mpsc::UnboundedReceiver<Arc<dyn Channel>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LongPollHub::new(tx, DEFAULT_INACTIVITY), rx)
    }

    #[tokio::test]
    async fn missing_client_id_is_bad_request() {
        let (hub, _rx) = hub();
        let response = router("/poll", hub)
            .oneshot(request(Method::GET, None, Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn other_methods_rejected() {
        let (hub, _rx) = hub();
        let app = router("/poll", Arc::clone(&hub));
        for client_id in [Some("c1"), None] {
            let response = app
                .clone()
                .oneshot(request(Method::PUT, client_id, Vec::new()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        }
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test]
    async fn first_request_creates_one_channel() {
        let (hub, mut rx) = hub();
        let app = router("/poll", Arc::clone(&hub));
        let response = app
            .clone()
            .oneshot(request(Method::GET, Some("c1"), Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let _ = app
            .oneshot(request(Method::GET, Some("c1"), Vec::new()))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn post_delivers_and_get_drains() {
        let (hub, mut rx) = hub();
        let app = router("/poll", hub);
        let body = PacketFramer::message().encode_frame(&chat("up")).unwrap();
        let response = app
            .clone()
            .oneshot(request(Method::POST, Some("c1"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let channel = rx.recv().await.unwrap();
        let mut events = channel.open().await.unwrap();
        assert_matches!(events.recv().await, Some(ChannelEvent::Packet(p)) if p.is::<Chat>());

        assert!(channel.send(&chat("down")).await);
        let response = app
            .clone()
            .oneshot(request(Method::GET, Some("c1"), Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let packet = PacketFramer::message().decode_message(&bytes).unwrap();
        assert_eq!(packet.content::<Chat>().unwrap().text, "down");

        let response = app
            .oneshot(request(Method::GET, Some("c1"), Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn close_flushes_pending_first() {
        let channel = LongPollServerChannel::new("c1".into(), DEFAULT_INACTIVITY);
        let mut events = channel.open().await.unwrap();
        assert!(channel.send(&chat("last words")).await);
        channel.close().await;
        assert!(channel.is_open());
        assert!(!channel.send(&chat("too late")).await);
        assert!(channel.take_pending().is_some());
        assert!(!channel.is_open());
        assert_matches!(events.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_closes_channel() {
        let channel = LongPollServerChannel::new("c1".into(), Duration::from_secs(5));
        let mut events = channel.open().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(channel.take_pending().is_none());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(channel.is_open());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_matches!(events.recv().await, Some(ChannelEvent::Closed));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn closed_channel_leaves_the_hub() {
        let (hub, mut rx) = hub();
        let first = hub.channel_for("c1").unwrap();
        let _ = rx.recv().await.unwrap();
        first.close().await;
        for _ in 0..50 {
            if hub.len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.len(), 0);
        let second = hub.channel_for("c1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn client_and_server_over_http() {
        let endpoint: Endpoint = "http://127.0.0.1:0/poll".parse().unwrap();
        let listener = LongPollChannelListener::new(endpoint, None, DEFAULT_INACTIVITY);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = listener.start(tx).await.unwrap();

        let client = LongPollClientChannel::new(
            format!("http://{addr}/poll"),
            reqwest::Client::new(),
            Duration::from_millis(20),
        );
        let mut client_events = client.open().await.unwrap();
        let server = rx.recv().await.unwrap();
        let mut server_events = server.open().await.unwrap();
        assert_eq!(listener.channel_count(), 1);

        assert!(client.send(&chat("up")).await);
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Packet(p)) if p.is::<Chat>());
        assert!(server.send(&chat("down")).await);
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Packet(p)) if p.is::<Chat>());

        listener.stop().await;
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Closed));
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn client_open_fails_without_server() {
        let client = LongPollClientChannel::new(
            "http://127.0.0.1:9/poll",
            reqwest::Client::new(),
            Duration::from_millis(20),
        );
        assert!(client.open().await.is_err());
        assert!(!client.is_open());
    }
}
