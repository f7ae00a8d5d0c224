//! Name-based module resolution.
//!
//! `Context::plugin("name")`, `Context::adapter(protocol, AdapterSource::Resolve, ..)`
//! and `Context::load_service(key)` look modules up through a
//! [`ModuleResolver`]. The default resolver, [`LinkedModules`], reads the
//! `linkme` distributed slices below, so any crate linked into the final
//! binary can contribute modules:
//!
//! ```rust,ignore
//! use zinc_core::resolver::{PLUGIN_MODULES, PluginModule, linkme};
//!
//! #[linkme::distributed_slice(PLUGIN_MODULES)]
//! static ECHO: PluginModule = PluginModule {
//!     name: "echo",
//!     build: || PluginOptions::new("echo", |ctx| {
//!         ctx.command(CommandDecl::new("echo <text:text>").action(|inv| async move {
//!             Ok(inv.arg_str(0).map(str::to_string))
//!         }))?;
//!         Ok(())
//!     }),
//! };
//! ```
//!
//! [`ModuleMap`] is the programmatic alternative, useful in tests and for
//! embedding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use linkme::distributed_slice;
use tracing::warn;

pub use linkme;

use crate::adapter::AdapterCtor;
use crate::context::Context;
use crate::plugin::PluginOptions;
use crate::service::ServiceSource;

/// What kind of module a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Plugin,
    Adapter,
    Service,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Plugin => "plugin",
            ModuleKind::Adapter => "adapter",
            ModuleKind::Service => "service",
        })
    }
}

/// A resolved module.
#[derive(Clone)]
pub enum Module {
    Plugin(PluginOptions),
    Adapter(AdapterCtor),
    Service(ServiceSource),
}

impl Module {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Plugin(_) => ModuleKind::Plugin,
            Module::Adapter(_) => ModuleKind::Adapter,
            Module::Service(_) => ModuleKind::Service,
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Plugin(options) => f.debug_tuple("Module::Plugin").field(options).finish(),
            Module::Adapter(_) => f.write_str("Module::Adapter"),
            Module::Service(source) => f.debug_tuple("Module::Service").field(source).finish(),
        }
    }
}

/// Looks modules up by name.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, name: &str, kind: ModuleKind) -> Option<Module>;
}

// =============================================================================
// Link-time registries (linkme distributed slices)
// =============================================================================

/// A plugin contributed at link time.
pub struct PluginModule {
    pub name: &'static str,
    pub build: fn() -> PluginOptions,
}

/// An adapter constructor contributed at link time.
pub struct AdapterModule {
    pub protocol: &'static str,
    pub build: fn() -> AdapterCtor,
}

/// A service contributed at link time.
pub struct ServiceModule {
    pub key: &'static str,
    pub build: fn() -> ServiceSource,
}

#[distributed_slice]
pub static PLUGIN_MODULES: [PluginModule];

#[distributed_slice]
pub static ADAPTER_MODULES: [AdapterModule];

#[distributed_slice]
pub static SERVICE_MODULES: [ServiceModule];

/// Resolves from the link-time registries.
///
/// When several entries share a name the first one wins and a warning is
/// logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedModules;

impl LinkedModules {
    fn first<'a, T>(entries: impl Iterator<Item = &'a T>, kind: ModuleKind, name: &str) -> Option<&'a T>
    where
        T: 'a,
    {
        let matches: Vec<&T> = entries.collect();
        if matches.len() > 1 {
            warn!(
                count = matches.len(),
                %kind,
                module = name,
                "Multiple module providers registered, using first"
            );
        }
        matches.into_iter().next()
    }

    /// Names of every linked module of `kind`.
    pub fn names(kind: ModuleKind) -> Vec<&'static str> {
        match kind {
            ModuleKind::Plugin => PLUGIN_MODULES.iter().map(|m| m.name).collect(),
            ModuleKind::Adapter => ADAPTER_MODULES.iter().map(|m| m.protocol).collect(),
            ModuleKind::Service => SERVICE_MODULES.iter().map(|m| m.key).collect(),
        }
    }
}

impl ModuleResolver for LinkedModules {
    fn resolve(&self, name: &str, kind: ModuleKind) -> Option<Module> {
        match kind {
            ModuleKind::Plugin => {
                Self::first(PLUGIN_MODULES.iter().filter(|m| m.name == name), kind, name)
                    .map(|m| Module::Plugin((m.build)()))
            }
            ModuleKind::Adapter => {
                Self::first(ADAPTER_MODULES.iter().filter(|m| m.protocol == name), kind, name)
                    .map(|m| Module::Adapter((m.build)()))
            }
            ModuleKind::Service => {
                Self::first(SERVICE_MODULES.iter().filter(|m| m.key == name), kind, name)
                    .map(|m| Module::Service((m.build)()))
            }
        }
    }
}

/// A programmatic module table with an optional fallback resolver.
#[derive(Default, Clone)]
pub struct ModuleMap {
    modules: HashMap<(ModuleKind, String), Module>,
    fallback: Option<Arc<dyn ModuleResolver>>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its `name`.
    pub fn plugin(mut self, options: PluginOptions) -> Self {
        self.modules
            .insert((ModuleKind::Plugin, options.name.clone()), Module::Plugin(options));
        self
    }

    pub fn adapter(mut self, protocol: impl Into<String>, ctor: AdapterCtor) -> Self {
        self.modules
            .insert((ModuleKind::Adapter, protocol.into()), Module::Adapter(ctor));
        self
    }

    pub fn service(mut self, key: impl Into<String>, source: ServiceSource) -> Self {
        self.modules
            .insert((ModuleKind::Service, key.into()), Module::Service(source));
        self
    }

    /// Consulted when no entry of this map matches.
    pub fn fallback(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleResolver for ModuleMap {
    fn resolve(&self, name: &str, kind: ModuleKind) -> Option<Module> {
        self.modules
            .get(&(kind, name.to_string()))
            .cloned()
            .or_else(|| self.fallback.as_ref()?.resolve(name, kind))
    }
}

impl fmt::Debug for ModuleMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .modules
            .keys()
            .map(|(kind, name)| format!("{kind}:{name}"))
            .collect();
        keys.sort();
        f.debug_struct("ModuleMap")
            .field("modules", &keys)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Context {
    /// Resolves `name` through this runtime's module resolver.
    pub fn resolve_module(&self, name: &str, kind: ModuleKind) -> Option<Module> {
        self.shared
            .resolver
            .resolve(name, kind)
            .filter(|module| module.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;

    #[distributed_slice(PLUGIN_MODULES)]
    static LINKED_PING: PluginModule = PluginModule {
        name: "linked-ping",
        build: || PluginOptions::new("linked-ping", |_| Ok(())),
    };

    #[distributed_slice(SERVICE_MODULES)]
    static LINKED_CLOCK: ServiceModule = ServiceModule {
        key: "linked-clock",
        build: || ServiceSource::instance(42u64),
    };

    #[test]
    fn test_linked_modules_resolve() {
        assert!(LinkedModules::names(ModuleKind::Plugin).contains(&"linked-ping"));
        let module = LinkedModules.resolve("linked-ping", ModuleKind::Plugin);
        assert!(matches!(module, Some(Module::Plugin(ref o)) if o.name == "linked-ping"));
        // Kind is part of the key.
        assert!(LinkedModules.resolve("linked-ping", ModuleKind::Service).is_none());

        let root = Context::builder().build();
        let plugin = root.plugin("linked-ping").unwrap();
        assert_eq!(plugin.name(), "linked-ping");
        let clock = root.load_service("linked-clock").unwrap();
        assert_eq!(clock.downcast_ref::<u64>(), Some(&42));
    }

    #[test]
    fn test_module_map_with_fallback() {
        let map = ModuleMap::new()
            .plugin(PluginOptions::new("local", |_| Ok(())))
            .fallback(Arc::new(LinkedModules));
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.resolve("local", ModuleKind::Plugin).map(|m| m.kind()),
            Some(ModuleKind::Plugin)
        );
        assert!(map.resolve("linked-ping", ModuleKind::Plugin).is_some());

        let root = Context::builder().resolver(Arc::new(map)).build();
        assert!(matches!(
            root.plugin("missing"),
            Err(ContextError::ModuleNotFound {
                kind: ModuleKind::Plugin,
                ..
            })
        ));
    }
}
