//! # linkup-transport
//!
//! Packet channels and listeners for every Linkup endpoint scheme.
//!
//! - [`Channel`]: open, send, close; receive as [`ChannelEvent`]s
//! - [`ChannelListener`]: accepts inbound channels on one [`Endpoint`]
//! - [`connect`] / [`listener_for`]: pick the implementation from the scheme
//! - [`Certificate`]: PEM material and rustls configuration
//!
//! Stream transports (`tcp`, `ssl`) frame packets with the delimiter token;
//! message transports (`ws`, `wss`, `http`, `https`) carry one packet per
//! message.

#![deny(unsafe_code)]

pub mod channel;
pub mod connect;
pub mod endpoint;
pub mod errors;
pub mod longpoll;
mod serve;
pub mod stream;
pub mod tls;
pub mod websocket;

pub use channel::{
    AcceptedReceiver, AcceptedSender, Channel, ChannelEvent, ChannelEvents, ChannelListener,
};
pub use connect::{ConnectOptions, ListenerOptions, connect, listener_for};
pub use endpoint::{Endpoint, Scheme};
pub use errors::{Result, TransportError};
pub use longpoll::{CLIENT_ID_HEADER, LongPollChannelListener, LongPollClientChannel, LongPollServerChannel};
pub use stream::{StreamChannel, StreamChannelListener};
pub use tls::Certificate;
pub use websocket::{WebSocketChannel, WebSocketChannelListener};
