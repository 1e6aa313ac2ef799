//! # linkup-server
//!
//! Server side of the Linkup substrate.
//!
//! - [`Server`]: listeners, the live-connection directory and routing
//! - [`ServerConnection`]: one accepted channel and its protocol handling
//! - [`Authenticator`] / [`Authorizer`]: sign-in and role decisions
//! - [`SessionRepository`]: token-keyed session storage for restores
//! - [`ServerModule`]: declarative handlers consulted before routing
//! - [`ServerEvent`]: sign-in, restore and disconnect notifications
//!
//! When an id signs in on a second connection, the first is disconnected
//! with `AnotherSessionOpened` inside the same directory update that
//! records the new owner.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
mod directory;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod module;
pub mod security;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use connection::{ConnectionEvent, ServerConnection};
pub use errors::{Result, ServerError};
pub use events::ServerEvent;
pub use module::{ServerContext, ServerModule};
pub use security::{
    AcceptAllAuthenticator, Authenticator, Authorizer, DomainAuthenticator, RoleAuthorizer,
};
pub use server::{ListenerInfo, Server};
pub use session::{MemorySessionRepository, SessionRepository};
pub use shutdown::ShutdownCoordinator;
