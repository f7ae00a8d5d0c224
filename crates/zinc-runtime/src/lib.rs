//! Zinc Runtime - Orchestration layer for the Zinc bot framework.
//!
//! This crate provides:
//! - Layered configuration (`ZincConfig`, `ConfigLoader`)
//! - Logging setup driven by that configuration
//! - Runtime orchestration (`ZincRuntime`): module loading, lifecycle and
//!   signal handling around a `zinc_core::App`
//! - The built-in `status` plugin (`builtin-plugins` feature)
//!
//! ```ignore
//! use zinc_runtime::ZincRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Loads zinc.toml, initializes logging, prepares the data directory
//!     let runtime = ZincRuntime::new()?;
//!
//!     // Plugins can also be mounted programmatically
//!     runtime.root().plugin(my_plugin())?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration-driven modules
//!
//! Services, plugins and adapters named in `zinc.toml` are resolved by name
//! through the link-time registries of `zinc_core::resolver`:
//!
//! ```toml
//! plugins = ["status", "echo"]
//!
//! [services.database]
//! url = "sqlite://data/zinc.db"
//!
//! [adapters.onebot]
//! url = "ws://127.0.0.1:6700"
//! ```

#[cfg(feature = "builtin-plugins")]
pub mod builtin;
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, LoggingConfig, ZincConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, RuntimeInfo, ZincRuntime};

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides the runtime entry points and the commonly used logging
/// macros.
pub mod prelude {
    pub use crate::runtime::{RuntimeInfo, ZincRuntime};
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
