//! # linkup-client
//!
//! Client side of the Linkup substrate.
//!
//! A [`ClientConnection`] connects to any endpoint scheme, signs in or
//! restores a session, sends and receives packets, and hands matching
//! packets to installed [`ClientModule`]s before they reach the receive
//! queue. Lifecycle changes are published as [`ClientEvent`]s.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod module;

pub use config::ClientConfig;
pub use connection::ClientConnection;
pub use errors::{ClientError, Result};
pub use events::ClientEvent;
pub use module::{ClientContext, ClientModule};
