//! The channel abstraction shared by every transport.
//!
//! A [`Channel`] is a bidirectional, framed packet pipe. Opening it starts
//! the receive side and hands back a stream of [`ChannelEvent`]s; the last
//! event is always exactly one [`ChannelEvent::Closed`]. A
//! [`ChannelListener`] accepts inbound channels on one endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkup_core::Packet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::errors::{Result, TransportError};

/// How long a stopping listener may drain before its task is aborted.
pub const LISTENER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Something that happened on a channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A whole packet arrived.
    Packet(Packet),
    /// The channel is gone. Nothing follows this event.
    Closed,
}

/// Receive side of an opened channel.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Where a listener hands freshly accepted channels.
pub type AcceptedSender = mpsc::UnboundedSender<Arc<dyn Channel>>;

/// Receiving end of [`AcceptedSender`].
pub type AcceptedReceiver = mpsc::UnboundedReceiver<Arc<dyn Channel>>;

/// A framed, bidirectional packet transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Start receiving. Fails with [`TransportError::AlreadyOpen`] on a
    /// second call.
    async fn open(&self) -> Result<ChannelEvents>;

    /// Send one packet. Returns `false` if it could not be written, in which
    /// case the channel closes.
    async fn send(&self, packet: &Packet) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Whether the channel has not closed yet.
    fn is_open(&self) -> bool;

    /// Remote side, for logs.
    fn peer(&self) -> &str;
}

/// Event plumbing every channel implementation embeds.
///
/// The event queue exists from construction, so packets that arrive before
/// `open` are buffered rather than lost.
pub(crate) struct ChannelCore {
    tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    rx: Mutex<Option<ChannelEvents>>,
    cancel: CancellationToken,
}

impl ChannelCore {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Hand out the event receiver once.
    pub(crate) fn take_events(&self) -> Result<ChannelEvents> {
        self.rx.lock().take().ok_or(TransportError::AlreadyOpen)
    }

    /// Queue a received packet. Returns `false` once the channel finished.
    pub(crate) fn deliver(&self, packet: Packet) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(ChannelEvent::Packet(packet)).is_ok(),
            None => false,
        }
    }

    /// Token cancelled when the channel finishes.
    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel background work and emit `Closed` exactly once.
    pub(crate) fn finish(&self) {
        self.cancel.cancel();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(ChannelEvent::Closed);
        }
    }
}

/// Accepts inbound channels on one endpoint.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Endpoint this listener was built for.
    fn endpoint(&self) -> &Endpoint;

    /// Bind and start accepting. Returns the bound address, which differs
    /// from the endpoint when it named port 0.
    async fn start(&self, accepted: AcceptedSender) -> Result<SocketAddr>;

    /// Stop accepting. Channels already handed out stay open, except
    /// long-poll channels, which cannot outlive their HTTP server.
    async fn stop(&self);

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub(crate) struct ListenerTask {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
    pub(crate) addr: SocketAddr,
}

/// The running state behind a listener's `start`/`stop`.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    running: Mutex<Option<ListenerTask>>,
}

impl ListenerSlot {
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    /// Record a started task, rejecting it if another start won the race.
    pub(crate) fn install(&self, task: ListenerTask) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if running.is_some() {
            task.cancel.cancel();
            task.handle.abort();
            return Err(TransportError::AlreadyStarted);
        }
        let addr = task.addr;
        *running = Some(task);
        Ok(addr)
    }

    pub(crate) async fn stop(&self) {
        let Some(mut task) = self.running.lock().take() else {
            return;
        };
        task.cancel.cancel();
        if tokio::time::timeout(LISTENER_STOP_GRACE, &mut task.handle)
            .await
            .is_err()
        {
            warn!(addr = %task.addr, "listener did not stop in time, aborting");
            task.handle.abort();
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|t| t.addr)
    }
}
