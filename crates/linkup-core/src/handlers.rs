//! Declarative packet handler tables with authentication/role gating.
//!
//! A module builds a [`HandlerTable`] at construction time, one entry per
//! payload type. Dispatch walks the entries in registration order and stops
//! at the first handler that passes its gate and reports the packet handled.

use std::sync::Arc;

use async_trait::async_trait;

use crate::packet::{Packet, PacketContent};

/// Gating metadata for one handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerRequirements {
    /// The connection must hold a session.
    pub requires_authentication: bool,
    /// At least one of these roles must be granted by an authorizer.
    pub required_roles: Vec<String>,
}

impl HandlerRequirements {
    /// No gating.
    pub fn none() -> Self {
        Self::default()
    }

    /// Signed-in connections only.
    pub fn authenticated() -> Self {
        Self {
            requires_authentication: true,
            required_roles: Vec::new(),
        }
    }

    /// Signed-in connections granted any of `roles`.
    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requires_authentication: true,
            required_roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// What a dispatch context must answer for the gate to be evaluated.
#[async_trait]
pub trait Gate: Send + Sync {
    /// Whether the connection holds a session.
    fn is_signed_in(&self) -> bool;

    /// Whether any authorizer grants one of `roles` to the connection's session.
    async fn is_authorized(&self, roles: &[String]) -> bool;
}

/// A handler for one payload type.
///
/// Returns `true` when the packet was handled and dispatch should stop.
#[async_trait]
pub trait PacketHandler<C: ?Sized + Sync>: Send + Sync {
    /// Handle a packet whose type matched this handler's registration.
    async fn handle(&self, packet: &Packet, ctx: &C) -> bool;
}

struct HandlerEntry<C: ?Sized + Sync> {
    type_name: &'static str,
    requirements: HandlerRequirements,
    handler: Arc<dyn PacketHandler<C>>,
}

/// Ordered handler registrations for one module.
pub struct HandlerTable<C: ?Sized + Sync> {
    entries: Vec<HandlerEntry<C>>,
}

impl<C: Gate + ?Sized + Sync> HandlerTable<C> {
    /// Empty table.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `handler` for payload type `T`.
    pub fn on<T, H>(&mut self, requirements: HandlerRequirements, handler: H) -> &mut Self
    where
        T: PacketContent,
        H: PacketHandler<C> + 'static,
    {
        self.entries.push(HandlerEntry {
            type_name: T::TYPE_NAME,
            requirements,
            handler: Arc::new(handler),
        });
        self
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Payload type names handled by this table, in registration order.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.type_name).collect()
    }

    /// Offer `packet` to each matching handler until one handles it.
    pub async fn dispatch(&self, packet: &Packet, ctx: &C) -> bool {
        for entry in &self.entries {
            if packet.type_name != entry.type_name {
                continue;
            }
            if entry.requirements.requires_authentication && !ctx.is_signed_in() {
                continue;
            }
            if !entry.requirements.required_roles.is_empty()
                && !ctx.is_authorized(&entry.requirements.required_roles).await
            {
                continue;
            }
            if entry.handler.handle(packet, ctx).await {
                return true;
            }
        }
        false
    }
}

impl<C: Gate + ?Sized + Sync> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}
