//! Plugin lifecycle.
//!
//! A plugin is a named unit of functionality with an install function. Mounting
//! a plugin on a context creates a fresh child context, hands it to the
//! install function, and records the plugin on the mounting context. Every
//! registration the install function makes lands in the child's dispose
//! chain, so unmounting the plugin reverses all of it.
//!
//! ```rust,ignore
//! let echo = PluginOptions::new("echo", |ctx: &Context| {
//!     ctx.command(CommandDecl::new("echo <text:string>").action(|inv| async move {
//!         Ok(inv.args.first().map(|v| v.to_string()))
//!     }))?;
//!     Ok(())
//! })
//! .description("Repeats what you say");
//!
//! let plugin = root.plugin(echo)?;
//! root.dispose_plugin(&plugin)?;
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{Context, ContextId, Shared};
use crate::error::{BoxError, ContextError, ContextResult};
use crate::event::{Payload, names};
use crate::filter::Filter;
use crate::resolver::{Module, ModuleKind};
use crate::session::Session;

/// Install function receiving the plugin's own context.
pub type InstallFn = Arc<dyn Fn(&Context) -> Result<(), BoxError> + Send + Sync>;

/// Static description of a plugin.
#[derive(Clone)]
pub struct PluginOptions {
    pub name: String,
    /// Globally unique identity. Defaults to `name`.
    pub full_name: String,
    /// Where the plugin came from, if it was loaded by path or module name.
    pub full_path: Option<String>,
    /// Service keys the plugin needs.
    pub dependencies: Vec<String>,
    pub description: Option<String>,
    /// Extra predicate a session must pass to reach the plugin.
    pub gate: Option<Filter>,
    install: InstallFn,
}

impl PluginOptions {
    pub fn new<F>(name: impl Into<String>, install: F) -> Self
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            full_name: name.clone(),
            name,
            full_path: None,
            dependencies: Vec::new(),
            description: None,
            gate: None,
            install: Arc::new(install),
        }
    }

    pub fn full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = full_name.into();
        self
    }

    pub fn full_path(mut self, path: impl Into<String>) -> Self {
        self.full_path = Some(path.into());
        self
    }

    pub fn depends_on<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(services.into_iter().map(Into::into));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn gate(mut self, gate: Filter) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginOptions")
            .field("name", &self.name)
            .field("full_name", &self.full_name)
            .field("full_path", &self.full_path)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// What to mount: a module name for the resolver, or inline options.
#[derive(Debug, Clone)]
pub enum PluginSource {
    Name(String),
    Options(PluginOptions),
}

impl From<&str> for PluginSource {
    fn from(name: &str) -> Self {
        PluginSource::Name(name.to_string())
    }
}

impl From<String> for PluginSource {
    fn from(name: String) -> Self {
        PluginSource::Name(name)
    }
}

impl From<PluginOptions> for PluginSource {
    fn from(options: PluginOptions) -> Self {
        PluginSource::Options(options)
    }
}

/// A plugin to unmount, by identity or by name.
#[derive(Debug, Clone)]
pub enum PluginTarget {
    Name(String),
    Plugin(Arc<Plugin>),
}

impl From<&str> for PluginTarget {
    fn from(name: &str) -> Self {
        PluginTarget::Name(name.to_string())
    }
}

impl From<&Arc<Plugin>> for PluginTarget {
    fn from(plugin: &Arc<Plugin>) -> Self {
        PluginTarget::Plugin(Arc::clone(plugin))
    }
}

impl From<Arc<Plugin>> for PluginTarget {
    fn from(plugin: Arc<Plugin>) -> Self {
        PluginTarget::Plugin(plugin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Enabled,
    Disabled,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Enabled => f.write_str("enabled"),
            PluginStatus::Disabled => f.write_str("disabled"),
        }
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// A mounted plugin.
pub struct Plugin {
    options: PluginOptions,
    status: Mutex<PluginStatus>,
    context: ContextId,
    mounted_by: ContextId,
    shared: Weak<Shared>,
}

impl Plugin {
    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn full_name(&self) -> &str {
        &self.options.full_name
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn status(&self) -> PluginStatus {
        *self.status.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.status() == PluginStatus::Enabled
    }

    pub fn enable(&self) {
        *self.status.lock() = PluginStatus::Enabled;
        debug!(plugin = %self.full_name(), "Plugin enabled");
    }

    pub fn disable(&self) {
        *self.status.lock() = PluginStatus::Disabled;
        debug!(plugin = %self.full_name(), "Plugin disabled");
    }

    /// Id of the plugin's own context.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Id of the context the plugin was mounted on.
    pub fn mounted_by(&self) -> ContextId {
        self.mounted_by
    }

    /// Handle to the plugin's context, while it is mounted.
    pub fn context(&self) -> Option<Context> {
        let shared = self.shared.upgrade()?;
        let alive = shared.tree.lock().live(self.context).is_some();
        alive.then(|| Context::from_parts(self.context, shared))
    }

    /// Whether the plugin's own gate accepts `session`.
    pub fn matches(&self, session: &dyn Session) -> bool {
        self.options
            .gate
            .as_ref()
            .is_none_or(|gate| gate.test(session))
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("full_name", &self.full_name())
            .field("status", &self.status())
            .field("context", &self.context)
            .finish()
    }
}

// =============================================================================
// Mounting
// =============================================================================

impl Context {
    /// Mounts a plugin on this context.
    ///
    /// If a plugin with the same full name is already mounted anywhere in the
    /// runtime, that plugin is returned and nothing is installed. A failing
    /// install function rolls the mount back. A plugin whose declared service
    /// dependencies are not all registered is mounted disabled.
    pub fn plugin(&self, source: impl Into<PluginSource>) -> ContextResult<Arc<Plugin>> {
        let options = match source.into() {
            PluginSource::Options(options) => options,
            PluginSource::Name(name) => {
                if let Some(existing) = self.find_plugin(&name) {
                    return Ok(existing);
                }
                match self.shared.resolver.resolve(&name, ModuleKind::Plugin) {
                    Some(Module::Plugin(options)) => options,
                    _ => {
                        return Err(ContextError::ModuleNotFound {
                            kind: ModuleKind::Plugin,
                            name,
                        });
                    }
                }
            }
        };

        let (plugin, child) = {
            let tree = self.shared.tree.lock();
            if tree.live(self.id()).is_none() {
                return Err(ContextError::Disposed(self.id()));
            }
            let existing = tree
                .all_plugins()
                .find(|p| p.full_name() == options.full_name)
                .cloned();
            drop(tree);
            if let Some(existing) = existing {
                warn!(plugin = %options.full_name, "Duplicate plugin load, returning the mounted instance");
                return Ok(existing);
            }

            let filter = self.filter()?;
            let child = self.spawn_child(filter, None)?;
            let plugin = Arc::new(Plugin {
                options,
                status: Mutex::new(PluginStatus::Enabled),
                context: child.id(),
                mounted_by: self.id(),
                shared: Arc::downgrade(&self.shared),
            });

            let mut tree = self.shared.tree.lock();
            if let Some(node) = tree.nodes.get_mut(&child.id()) {
                node.owner = Some(Arc::downgrade(&plugin));
            }
            if let Some(node) = tree.nodes.get_mut(&self.id()) {
                node.plugins.push(Arc::clone(&plugin));
            }
            (plugin, child)
        };

        if let Err(source) = (plugin.options.install)(&child) {
            // Never announced, so unmount quietly before tearing the context down.
            {
                let mut tree = self.shared.tree.lock();
                if let Some(node) = tree.nodes.get_mut(&self.id()) {
                    node.plugins.retain(|p| !Arc::ptr_eq(p, &plugin));
                }
                if let Some(node) = tree.nodes.get_mut(&child.id()) {
                    node.owner = None;
                }
            }
            plugin.disable();
            if let Err(error) = child.dispose() {
                warn!(plugin = %plugin.full_name(), %error, "Rollback of failed install incomplete");
            }
            return Err(ContextError::PluginInstall {
                plugin: plugin.full_name().to_string(),
                source,
            });
        }

        debug!(plugin = %plugin.full_name(), context = %child.id(), "Plugin mounted");
        self.shared
            .notify(names::PLUGIN_ADD, Payload::Plugin(Arc::clone(&plugin)));

        let deps = &plugin.options.dependencies;
        if !deps.is_empty() {
            let missing: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|key| !self.shared.services.contains(key))
                .collect();
            if !missing.is_empty() {
                warn!(
                    plugin = %plugin.full_name(),
                    missing = ?missing,
                    "Required services not ready; plugin disabled"
                );
                plugin.disable();
            }
        }
        Ok(plugin)
    }

    /// Mounts a plugin and returns this context for chaining.
    pub fn use_plugin(&self, source: impl Into<PluginSource>) -> ContextResult<&Self> {
        self.plugin(source)?;
        Ok(self)
    }

    /// Looks a plugin up by full name or name in this subtree.
    pub fn find_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        let plugins = self.plugin_list();
        plugins
            .iter()
            .find(|p| p.full_name() == name)
            .or_else(|| plugins.iter().find(|p| p.name() == name))
            .cloned()
    }

    /// Unmounts a plugin found in this subtree.
    ///
    /// Returns `Ok(false)` if no such plugin is mounted here.
    pub fn dispose_plugin(&self, target: impl Into<PluginTarget>) -> ContextResult<bool> {
        let plugin = match target.into() {
            PluginTarget::Name(name) => self.find_plugin(&name),
            PluginTarget::Plugin(plugin) => self
                .plugin_list()
                .into_iter()
                .find(|p| Arc::ptr_eq(p, &plugin)),
        };
        let Some(plugin) = plugin else {
            return Ok(false);
        };

        // Disposing the plugin context unregisters it and emits `plugin-remove`.
        if let Some(ctx) = plugin.context() {
            ctx.dispose()?;
        }
        if let Some(node) = self.shared.tree.lock().nodes.get_mut(&plugin.mounted_by()) {
            node.plugins.retain(|p| !Arc::ptr_eq(p, &plugin));
        }
        debug!(plugin = %plugin.full_name(), "Plugin removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(name: &str, counter: &Arc<AtomicUsize>) -> PluginOptions {
        let counter = Arc::clone(counter);
        PluginOptions::new(name, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_plugin_returns_existing() {
        let root = Context::builder().build();
        let installs = Arc::new(AtomicUsize::new(0));
        let first = root.plugin(counting("echo", &installs)).unwrap();
        let child = root.group([1]).unwrap();
        let second = child.plugin(counting("echo", &installs)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert_eq!(root.plugin_list().len(), 1);
    }

    #[test]
    fn test_plugin_add_event_and_context() {
        let root = Context::builder().build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        root.on(names::PLUGIN_ADD, move |payload| {
            if let Some(p) = payload.plugin() {
                s.lock().push(p.full_name().to_string());
            }
            Ok(None)
        })
        .unwrap();

        let plugin = root
            .plugin(PluginOptions::new("status", |_| Ok(())).full_name("zinc-plugin-status"))
            .unwrap();
        assert_eq!(*seen.lock(), vec!["zinc-plugin-status"]);

        let ctx = plugin.context().unwrap();
        assert_eq!(ctx.parent(), Some(root.clone()));
        assert!(Arc::ptr_eq(&ctx.owner_plugin().unwrap(), &plugin));
        // combinator children inherit the owner
        let derived = ctx.group([1]).unwrap();
        assert!(Arc::ptr_eq(&derived.owner_plugin().unwrap(), &plugin));
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let root = Context::builder().build();
        let result = root.plugin(PluginOptions::new("broken", |ctx: &Context| {
            ctx.on("tick", |_| Ok(None))?;
            Err("boom".into())
        }));

        assert!(matches!(result, Err(ContextError::PluginInstall { ref plugin, .. }) if plugin == "broken"));
        assert!(root.plugin_list().is_empty());
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_missing_dependency_disables() {
        let root = Context::builder().build();
        let plugin = root
            .plugin(PluginOptions::new("db-user", |_| Ok(())).depends_on(["database"]))
            .unwrap();
        assert_eq!(plugin.status(), PluginStatus::Disabled);

        root.register_service("cache", ServiceSource::instance(1u32))
            .unwrap();
        let ok = root
            .plugin(PluginOptions::new("cache-user", |_| Ok(())).depends_on(["cache"]))
            .unwrap();
        assert!(ok.is_enabled());

        let free = root.plugin(PluginOptions::new("free", |_| Ok(()))).unwrap();
        assert!(free.is_enabled());
    }

    #[test]
    fn test_dispose_plugin_leaves_siblings() {
        let root = Context::builder().build();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = root.plugin(counting("a", &counter)).unwrap();
        let b = root.plugin(counting("b", &counter)).unwrap();
        let removed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&removed);
        root.on(names::PLUGIN_REMOVE, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

        assert!(root.dispose_plugin(&a).unwrap());
        assert!(a.context().is_none());
        assert!(!a.is_enabled());
        assert!(b.context().is_some());
        assert_eq!(root.plugin_list().len(), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        assert!(root.dispose_plugin("b").unwrap());
        assert!(!root.dispose_plugin("b").unwrap());
        assert!(root.plugin_list().is_empty());
    }

    #[test]
    fn test_ancestor_dispose_announces_removal() {
        let root = Context::builder().build();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&removed);
        root.on(names::PLUGIN_REMOVE, move |payload| {
            if let Payload::Plugin(plugin) = payload {
                r.lock().push(plugin.full_name().to_string());
            }
            Ok(None)
        })
        .unwrap();

        let group = root.group([1]).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let plugin = group.plugin(counting("scoped", &counter)).unwrap();
        let _ = root.plugin(PluginOptions::new("broken", |_| Err("boom".into())));

        group.dispose().unwrap();
        assert!(!plugin.is_enabled());
        assert_eq!(*removed.lock(), vec!["scoped"]);
        assert!(root.plugin_list().is_empty());
    }

    #[test]
    fn test_unknown_module_name() {
        let root = Context::builder().build();
        assert!(matches!(
            root.plugin("does-not-exist"),
            Err(ContextError::ModuleNotFound { kind: ModuleKind::Plugin, .. })
        ));
    }
}
