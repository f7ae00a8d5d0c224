//! # Zinc Core
//!
//! The hierarchical context runtime of the Zinc bot framework.
//!
//! A Zinc runtime is a tree of [`Context`]s. Each context carries a
//! [`Filter`] that decides which sessions reach it, an event bus, and the
//! plugins, commands, middlewares and components registered on it. Deriving a
//! context (`ctx.group([42])?.admin(..)?`) always creates a new child, so
//! narrowing never affects the parent.
//!
//! Every registration returns a [`Disposer`] and is also recorded in the
//! owning context's dispose chain. Disposing a context (or unmounting the
//! plugin that owns it) therefore reverses everything registered underneath.
//!
//! ## Layout
//!
//! - **Filters**: [`filter`]: predicate algebra over [`Session`]s
//! - **Disposal**: [`dispose`]: ordered, idempotent teardown chains
//! - **Tree**: [`context`]: arena, selectors, cascading dispatch, timers
//! - **Events**: [`event`]: `emit` / `emit_sync` / `bail` / `bail_sync`
//! - **Units**: [`plugin`], [`command`], [`middleware`], [`component`]
//! - **Runtime-wide**: [`service`], [`adapter`], [`resolver`], [`app`]
//!
//! ## Dispatch
//!
//! ```text
//! Adapter ──▶ root.dispatch(protocol, event, session)
//!                 │ depth-first, pruned by filters and plugin gates
//!                 ▼
//!         matched contexts emit "{protocol}.{event}"
//!                 │
//!                 ▼
//!         commands / middlewares / components resolved per session
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use zinc_core::prelude::*;
//!
//! let app = App::new()?;
//! app.plugin(PluginOptions::new("echo", |ctx| {
//!     ctx.command(CommandDecl::new("echo <text:text>").action(|inv| async move {
//!         Ok(inv.arg_str(0).map(str::to_string))
//!     }))?;
//!     Ok(())
//! }))?;
//! app.start().await?;
//! ```

pub mod adapter;
pub mod app;
pub mod command;
pub mod component;
pub mod context;
pub mod dispose;
pub mod error;
pub mod event;
pub mod filter;
pub mod middleware;
pub mod plugin;
pub mod resolver;
pub mod service;
pub mod session;

pub use adapter::{Adapter, AdapterCtor, AdapterSource, adapter_ctor};
pub use app::{App, AppBuilder};
pub use command::{
    ActionResult, ArgDecl, ArgKind, Command, CommandDecl, Invocation, OptionDecl, command_path,
    parse_arg_decls, parse_arg_values, parse_option_values, shell_split,
};
pub use component::Component;
pub use context::{Context, ContextBuilder, ContextId};
pub use dispose::{DisposeChain, Disposer};
pub use error::{BoxError, ContextError, ContextResult, EventError, EventResult};
pub use event::{EventBus, Listener, ListenerResult, Payload, names};
pub use filter::{Filter, Role};
pub use middleware::{Middleware, MiddlewareChain, Next};
pub use plugin::{Plugin, PluginOptions, PluginSource, PluginStatus, PluginTarget};
pub use resolver::{LinkedModules, Module, ModuleKind, ModuleMap, ModuleResolver};
pub use service::{NamedService, ServiceArc, ServiceInfo, ServiceSource};
pub use session::{RoleFlags, Session, SessionRecord, SessionRef};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::adapter::{Adapter, AdapterSource};
    pub use crate::app::App;
    pub use crate::command::{CommandDecl, Invocation};
    pub use crate::component::Component;
    pub use crate::context::Context;
    pub use crate::dispose::Disposer;
    pub use crate::error::{BoxError, ContextError, ContextResult};
    pub use crate::event::{Payload, names};
    pub use crate::filter::{Filter, Role};
    pub use crate::middleware::{Middleware, Next};
    pub use crate::plugin::PluginOptions;
    pub use crate::service::{NamedService, ServiceSource};
    pub use crate::session::{Session, SessionRecord, SessionRef};
}
