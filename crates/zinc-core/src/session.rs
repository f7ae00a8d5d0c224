//! Session abstraction.
//!
//! A session describes one inbound interaction (a message, a notice, a
//! request…). The runtime never builds sessions itself: adapters produce them
//! and the context tree only *reads* them: matchable fields for filters, role
//! flags for role predicates and a few hooks that let the adapter take
//! part in matching.
//!
//! [`SessionRecord`] is a ready-made, serde-backed implementation that adapters
//! can fill from their wire format.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{Context, ContextId};
use crate::plugin::Plugin;

/// Shared, type-erased session handle passed through the event bus.
pub type SessionRef = Arc<dyn Session>;

/// An inbound interaction matched against contexts.
pub trait Session: Any + Send + Sync {
    /// The protocol (platform) that produced this session, e.g. `"onebot"`.
    fn protocol(&self) -> &str;

    /// The protocol-level event name, e.g. `"message"`.
    fn event_name(&self) -> &str;

    /// Looks up a matchable field such as `user_id` or `group_id`.
    fn field(&self, key: &str) -> Option<Value>;

    fn user_id(&self) -> Option<Value> {
        self.field("user_id")
    }

    fn group_id(&self) -> Option<Value> {
        self.field("group_id")
    }

    fn channel_id(&self) -> Option<Value> {
        self.field("channel_id")
    }

    /// Whether the sender is a bot master.
    fn is_master(&self) -> bool {
        false
    }

    /// Whether the sender is an administrator of the current group.
    fn is_admin(&self) -> bool {
        false
    }

    /// Whether the sender owns the current group.
    fn is_owner(&self) -> bool {
        false
    }

    /// Whether the sender is an administrator or owner.
    fn is_admins(&self) -> bool {
        self.is_admin() || self.is_owner()
    }

    /// Lets the session decide whether it matches `ctx`.
    ///
    /// `None` (the default) defers to the context's filter.
    fn match_context(&self, _ctx: &Context) -> Option<bool> {
        None
    }

    /// Called by cascading dispatch before the session is tested against `ctx`.
    fn bind_context(&self, _ctx: &Context) {}

    /// Whether the bot that received this session grants `plugin` access.
    fn allows_plugin(&self, _plugin: &Plugin) -> bool {
        true
    }

    /// Returns `self` as `Any` for downcasting to the adapter's concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Role capability flags carried by a [`SessionRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleFlags {
    pub master: bool,
    pub admin: bool,
    pub owner: bool,
}

/// A plain session backed by a JSON field map.
///
/// # Example
///
/// ```rust,ignore
/// let session = SessionRecord::new("onebot", "message")
///     .with_field("user_id", 10001)
///     .with_field("group_id", 42);
/// root.dispatch("onebot", "message", Arc::new(session))?;
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub protocol: String,
    pub event: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub roles: RoleFlags,
    #[serde(skip)]
    bound: Mutex<Option<ContextId>>,
}

impl SessionRecord {
    /// Creates an empty session for `protocol` / `event`.
    pub fn new(protocol: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            event: event.into(),
            ..Default::default()
        }
    }

    /// Sets a matchable field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replaces the role flags.
    pub fn with_roles(mut self, roles: RoleFlags) -> Self {
        self.roles = roles;
        self
    }

    /// The context this session was last bound to during dispatch.
    pub fn bound_context(&self) -> Option<ContextId> {
        *self.bound.lock()
    }

    /// Wraps the record into a [`SessionRef`].
    pub fn into_ref(self) -> SessionRef {
        Arc::new(self)
    }
}

impl Session for SessionRecord {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn event_name(&self) -> &str {
        &self.event
    }

    fn field(&self, key: &str) -> Option<Value> {
        match key {
            "protocol" => Some(Value::String(self.protocol.clone())),
            "event" => Some(Value::String(self.event.clone())),
            _ => self.fields.get(key).cloned(),
        }
    }

    fn is_master(&self) -> bool {
        self.roles.master
    }

    fn is_admin(&self) -> bool {
        self.roles.admin
    }

    fn is_owner(&self) -> bool {
        self.roles.owner
    }

    fn bind_context(&self, ctx: &Context) {
        *self.bound.lock() = Some(ctx.id());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
