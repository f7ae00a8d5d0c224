//! Runtime orchestration: configuration, logging, module loading and
//! lifecycle.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use zinc_runtime::ZincRuntime;
//!
//! // Loads zinc.toml from the current directory
//! let runtime = ZincRuntime::new()?;
//! runtime.run().await?;
//!
//! // Custom configuration path
//! let runtime = ZincRuntime::builder()
//!     .config_file("config/zinc.toml")
//!     .profile("production")
//!     .build()?;
//! ```
//!
//! Modules named in the configuration are loaded on the first
//! [`ZincRuntime::start`], in this order: services, plugins, adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::signal;
use tracing::{debug, info, warn};
use zinc_core::{
    AdapterSource, App, Context, ContextError, LinkedModules, Module, ModuleKind, ModuleResolver,
    NamedService, ServiceSource,
};

use crate::config::{ConfigLoader, LoggingConfig, ZincConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Process-level facts, provided on the root under the `runtime` key.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    started_at: Instant,
    data_dir: PathBuf,
    logging: LoggingConfig,
}

impl NamedService for RuntimeInfo {
    const KEY: &'static str = "runtime";
}

impl RuntimeInfo {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The file logs are currently written to, if file output is enabled.
    pub fn log_file(&self) -> Option<PathBuf> {
        logging::current_log_file(&self.logging)
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

/// The Zinc runtime: an [`App`] wired up from a [`ZincConfig`].
///
/// ```rust,ignore
/// let runtime = ZincRuntime::new()?;
/// runtime.root().plugin(my_plugin())?;
/// runtime.run().await?;
/// ```
pub struct ZincRuntime {
    config: ZincConfig,
    app: App,
    loaded: AtomicBool,
}

impl ZincRuntime {
    /// Creates a runtime from the configuration found in the current
    /// directory, falling back to defaults when none can be loaded.
    pub fn new() -> RuntimeResult<Self> {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                ZincConfig::default()
            });
        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from configuration, resolving modules from the
    /// link-time registries.
    pub fn from_config(config: &ZincConfig) -> RuntimeResult<Self> {
        Self::assemble(config, Arc::new(LinkedModules))
    }

    fn assemble(config: &ZincConfig, resolver: Arc<dyn ModuleResolver>) -> RuntimeResult<Self> {
        validate_config(config)?;
        logging::init_from_config(&config.logging);

        std::fs::create_dir_all(&config.data_dir).map_err(|source| RuntimeError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;

        let app = App::builder()
            .resolver(resolver)
            .permissions(config.permissions.clone())
            .build()?;
        app.root().provide(RuntimeInfo {
            started_at: Instant::now(),
            data_dir: config.data_dir.clone(),
            logging: config.logging.clone(),
        })?;

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            data_dir = %config.data_dir.display(),
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config: config.clone(),
            app,
            loaded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ZincConfig {
        &self.config
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn root(&self) -> &Context {
        self.app.root()
    }

    /// Loads the configured services, plugins and adapters onto the root.
    ///
    /// Runs once; later calls do nothing.
    pub fn load_modules(&self) -> RuntimeResult<()> {
        if self.loaded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let root = self.root();

        for (key, options) in &self.config.services {
            let source = match root.resolve_module(key, ModuleKind::Service) {
                Some(Module::Service(ServiceSource::Constructor(ctor, defaults))) => {
                    let options = if options.is_null() {
                        defaults
                    } else {
                        options.clone()
                    };
                    ServiceSource::Constructor(ctor, options)
                }
                Some(Module::Service(source)) => source,
                _ => {
                    return Err(ContextError::ModuleNotFound {
                        kind: ModuleKind::Service,
                        name: key.clone(),
                    }
                    .into());
                }
            };
            root.register_service(key, source)?;
            debug!(service = %key, "Loaded configured service");
        }

        for name in &self.config.plugins {
            let plugin = root.plugin(name.as_str())?;
            debug!(plugin = %plugin.full_name(), "Loaded configured plugin");
        }

        for (protocol, options) in &self.config.adapters {
            root.adapter(protocol, AdapterSource::Resolve, options.clone())?;
            debug!(protocol = %protocol, "Loaded configured adapter");
        }

        info!(
            services = self.config.services.len(),
            plugins = self.config.plugins.len(),
            adapters = self.config.adapters.len(),
            "Configured modules loaded"
        );
        Ok(())
    }

    /// Loads modules if needed and starts the app.
    pub async fn start(&self) -> RuntimeResult<()> {
        self.load_modules()?;
        self.app.start().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.app.stop().await;
    }

    /// Stops the app and disposes the context tree.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        self.app.shutdown().await?;
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM, then shuts down.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Zinc runtime is now running. Press Ctrl+C to stop.");

        let waited = wait_for_shutdown().await;
        self.shutdown().await?;
        waited
    }

    /// Runs until `shutdown` completes, then shuts down.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.shutdown().await
    }
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RuntimeError::Signal)?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(RuntimeError::Signal)?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(RuntimeError::Signal)?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`ZincRuntime`] with custom configuration sources.
///
/// ```rust,ignore
/// let runtime = ZincRuntime::builder()
///     .config_file("config/zinc.toml")
///     .resolver(Arc::new(ModuleMap::new().plugin(echo())))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<ZincConfig>,
    resolver: Option<Arc<dyn ModuleResolver>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            resolver: None,
        }
    }

    /// Loads exactly this configuration file.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration below files and environment.
    pub fn merge(mut self, config: ZincConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `config` as is; no files or environment are read.
    pub fn config(mut self, config: ZincConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the default link-time module resolver.
    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> RuntimeResult<ZincRuntime> {
        let config = match self.config {
            Some(config) => config,
            None => self.config_loader.load()?,
        };
        let resolver = self.resolver.unwrap_or_else(|| {
            warn_if_empty();
            Arc::new(LinkedModules)
        });
        ZincRuntime::assemble(&config, resolver)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn warn_if_empty() {
    let linked = [ModuleKind::Plugin, ModuleKind::Adapter, ModuleKind::Service]
        .iter()
        .map(|kind| LinkedModules::names(*kind).len())
        .sum::<usize>();
    if linked == 0 {
        warn!("No modules linked into this binary, only programmatic registration is available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use zinc_core::{Adapter, BoxError, CommandDecl, ModuleMap, PluginOptions, adapter_ctor};

    struct Greeting(String);

    struct CountingAdapter {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for CountingAdapter {
        async fn start(&self, _root: &Context) -> Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn data_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("zinc-runtime-{name}-{}", std::process::id()))
    }

    fn modules(starts: Arc<AtomicUsize>) -> ModuleMap {
        ModuleMap::new()
            .service(
                "greeting",
                ServiceSource::constructor(
                    |_, options: Value| {
                        let word = options["word"].as_str().unwrap_or("hello").to_string();
                        Ok(Greeting(word))
                    },
                    json!({ "word": "hello" }),
                ),
            )
            .plugin(
                PluginOptions::new("greeter", |ctx| {
                    ctx.command(CommandDecl::new("greet").action(|inv| async move {
                        let greeting = inv
                            .context
                            .get_service::<Greeting>("greeting")
                            .map(|g| g.0.clone());
                        Ok(greeting)
                    }))?;
                    Ok(())
                })
                .depends_on(["greeting"]),
            )
            .adapter(
                "mock",
                adapter_ctor(move |_, _, _| {
                    Ok(CountingAdapter {
                        starts: Arc::clone(&starts),
                    })
                }),
            )
    }

    #[tokio::test]
    async fn test_configured_modules_load_in_order() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut config = ZincConfig {
            plugins: vec!["greeter".into()],
            data_dir: data_dir("load"),
            ..Default::default()
        };
        config.services.insert("greeting".into(), json!({ "word": "hi" }));
        config.adapters.insert("mock".into(), Value::Null);

        let runtime = ZincRuntime::builder()
            .config(config)
            .resolver(Arc::new(modules(Arc::clone(&starts))))
            .build()
            .unwrap();
        assert!(runtime.root().service::<RuntimeInfo>().is_some());
        assert!(runtime.config().data_dir.is_dir());

        runtime.start().await.unwrap();
        // A second start neither reloads modules nor restarts adapters.
        runtime.start().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.root().adapters(), vec!["mock".to_string()]);

        let session = zinc_core::SessionRecord::new("mock", "message").into_ref();
        let reply = runtime.root().execute(session, "greet").await.unwrap();
        assert_eq!(reply.as_deref(), Some("hi"));

        runtime.shutdown().await.unwrap();
        assert!(runtime.root().is_disposed());
        let _ = std::fs::remove_dir_all(data_dir("load"));
    }

    #[tokio::test]
    async fn test_unknown_module_fails_start() {
        let config = ZincConfig {
            plugins: vec!["missing".into()],
            data_dir: data_dir("missing"),
            ..Default::default()
        };
        let runtime = ZincRuntime::builder()
            .config(config)
            .resolver(Arc::new(ModuleMap::new()))
            .build()
            .unwrap();

        let result = runtime.start().await;
        assert!(matches!(
            result,
            Err(RuntimeError::Context(ContextError::ModuleNotFound {
                kind: ModuleKind::Plugin,
                ..
            }))
        ));
        assert!(!runtime.root().is_started());
        let _ = std::fs::remove_dir_all(data_dir("missing"));
    }

    #[tokio::test]
    async fn test_run_until_shuts_down() {
        let config = ZincConfig {
            data_dir: data_dir("run"),
            ..Default::default()
        };
        let runtime = ZincRuntime::builder()
            .config(config)
            .resolver(Arc::new(ModuleMap::new()))
            .build()
            .unwrap();

        runtime.run_until(async {}).await.unwrap();
        assert!(runtime.root().is_disposed());
        let _ = std::fs::remove_dir_all(data_dir("run"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ZincConfig {
            plugins: vec!["dup".into(), "dup".into()],
            data_dir: data_dir("invalid"),
            ..Default::default()
        };
        let result = ZincRuntime::builder().config(config).build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
