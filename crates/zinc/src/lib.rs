//! # Zinc
//!
//! A hierarchical, plugin-scoped bot framework for Rust.
//!
//! ## Overview
//!
//! Every piece of a Zinc bot lives on a tree of contexts. A context narrows
//! which sessions reach it with a filter, and everything registered on it
//! (listeners, commands, middlewares, components, services, adapters and
//! child plugins) is torn down again when the context is disposed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌────────────────────────────────────┐
//! │   Runtime   │────▶│ root context │────▶│ plugin "echo"   (child context)    │──▶ commands
//! │  (Adapter)  │     │  (dispatch)  │────▶│ group([42])     (filtered context) │──▶ listeners
//! └─────────────┘     └──────────────┘────▶│ ...                                │──▶ middlewares
//!                                          └────────────────────────────────────┘
//! ```
//!
//! - **Runtime**: loads configuration, logging and configured modules
//! - **Adapters**: protocol implementations feeding sessions into the root
//! - **Contexts**: filtered scopes with their own event bus and dispose chain
//! - **Plugins**: named units that own a child context
//! - **Services**: runtime-wide shared values looked up by key
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use zinc::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ZincRuntime::new()?;
//!
//!     runtime.root().plugin(PluginOptions::new("echo", |ctx| {
//!         ctx.command(CommandDecl::new("echo <text:text>").action(|inv| async move {
//!             Ok(inv.arg_str(0).map(str::to_string))
//!         }))?;
//!         Ok(())
//!     }))?;
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output
//! - `builtin-plugins`: the `status` plugin

pub use zinc_core as core;
pub use zinc_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use zinc::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use zinc_runtime::{RuntimeInfo, ZincRuntime};

    // Tree, plugins and registrations
    pub use zinc_core::prelude::*;

    // Name-based module registration
    pub use zinc_core::resolver::{
        ADAPTER_MODULES, AdapterModule, PLUGIN_MODULES, PluginModule, SERVICE_MODULES,
        ServiceModule,
    };
}
