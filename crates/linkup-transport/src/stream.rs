//! Byte-stream channels (`tcp`, `ssl`) and their listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use linkup_core::{Packet, PacketFramer};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    AcceptedSender, Channel, ChannelCore, ChannelEvents, ChannelListener, ListenerSlot,
    ListenerTask,
};
use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::tls::HANDSHAKE_TIMEOUT;

/// A channel over any async byte stream, framed with the delimiter token.
pub struct StreamChannel<T> {
    peer: String,
    core: Arc<ChannelCore>,
    reader: parking_lot::Mutex<Option<FramedRead<ReadHalf<T>, PacketFramer>>>,
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<T>, PacketFramer>>,
}

impl<T> StreamChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connected stream.
    pub fn new(stream: T, peer: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            core: ChannelCore::new(),
            reader: parking_lot::Mutex::new(Some(FramedRead::new(read, PacketFramer::delimited()))),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write, PacketFramer::delimited())),
        }
    }
}

#[async_trait]
impl<T> Channel for StreamChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn open(&self) -> Result<ChannelEvents> {
        let events = self.core.take_events()?;
        let Some(mut reader) = self.reader.lock().take() else {
            return Ok(events);
        };
        let core = Arc::clone(&self.core);
        let token = core.token();
        let peer = self.peer.clone();
        drop(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = token.cancelled() => break,
                    frame = reader.next() => frame,
                };
                match frame {
                    Some(Ok(packet)) => {
                        if !core.deliver(packet) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(%peer, error = %e, "stream read failed");
                        break;
                    }
                    None => {
                        debug!(%peer, "stream closed by peer");
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
        let mut writer = self.writer.lock().await;
        match writer.send(packet).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "stream write failed");
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
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }

    fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Accepts `tcp` connections, optionally completing a TLS handshake (`ssl`).
pub struct StreamChannelListener {
    endpoint: Endpoint,
    tls: Option<TlsAcceptor>,
    slot: ListenerSlot,
}

impl StreamChannelListener {
    /// Listener for `endpoint`; `tls` turns it into an `ssl` listener.
    pub fn new(endpoint: Endpoint, tls: Option<TlsAcceptor>) -> Self {
        Self {
            endpoint,
            tls,
            slot: ListenerSlot::default(),
        }
    }
}

#[async_trait]
impl ChannelListener for StreamChannelListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start(&self, accepted: AcceptedSender) -> Result<SocketAddr> {
        self.slot.ensure_idle()?;
        let listener = TcpListener::bind(self.endpoint.authority()).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            self.tls.clone(),
            accepted,
            cancel.clone(),
        ));
        info!(endpoint = %self.endpoint, %addr, "stream listener started");
        self.slot.install(ListenerTask {
            cancel,
            handle,
            addr,
        })
    }

    async fn stop(&self) {
        self.slot.stop().await;
        debug!(endpoint = %self.endpoint, "stream listener stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.local_addr()
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    accepted: AcceptedSender,
    cancel: CancellationToken,
) {
    let mut handshakes: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            result = listener.accept() => {
                let (tcp, addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let _ = tcp.set_nodelay(true);
                match &tls {
                    None => hand_off(&accepted, StreamChannel::new(tcp, addr.to_string())),
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        let accepted = accepted.clone();
                        let _ = handshakes.spawn(async move {
                            handshake(acceptor, tcp, addr, &accepted).await;
                        });
                    }
                }
            }
        }
    }
    handshakes.shutdown().await;
}

async fn handshake(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    addr: SocketAddr,
    accepted: &AcceptedSender,
) {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => hand_off(accepted, StreamChannel::new(stream, addr.to_string())),
        Ok(Err(e)) => debug!(%addr, error = %e, "tls handshake failed"),
        Err(_) => debug!(%addr, "tls handshake timed out"),
    }
}

fn hand_off<T>(accepted: &AcceptedSender, channel: StreamChannel<T>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!(peer = %channel.peer(), "accepted stream channel");
    if accepted.send(Arc::new(channel)).is_err() {
        debug!("accepted channel dropped, nobody is receiving");
    }
}
