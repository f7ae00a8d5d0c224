//! Runtime-wide service registry.
//!
//! Services are type-erased values shared by every context of a runtime and
//! addressed by string key. Plugins reach them through
//! [`Context::get_service`] (by key) or [`Context::service`] (by a type that
//! implements [`NamedService`]).
//!
//! Registering a service is owned by the registering context: disposing that
//! context (or the returned [`Disposer`]) removes it and emits
//! `service-remove`.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::context::{Context, ContextId};
use crate::dispose::Disposer;
use crate::error::{BoxError, ContextError, ContextResult};
use crate::event::{Payload, names};
use crate::resolver::{Module, ModuleKind};

/// A type-erased service instance.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// Builds a service from the registering context and its options.
pub type ServiceCtor = Arc<dyn Fn(&Context, Value) -> Result<ServiceArc, BoxError> + Send + Sync>;

/// Keys that name runtime attributes and can never be used for services.
pub const RESERVED_KEYS: &[&str] = &[
    "root",
    "parent",
    "plugins",
    "commands",
    "middlewares",
    "components",
    "adapters",
    "services",
    "permissions",
    "logger",
];

/// A service type with a fixed registry key.
pub trait NamedService: Any + Send + Sync {
    const KEY: &'static str;
}

/// How a service is provided.
#[derive(Clone)]
pub enum ServiceSource {
    Instance(ServiceArc),
    /// Constructor plus the options it is called with.
    Constructor(ServiceCtor, Value),
}

impl ServiceSource {
    pub fn instance<T: Any + Send + Sync>(value: T) -> Self {
        ServiceSource::Instance(Arc::new(value))
    }

    pub fn constructor<T, F>(ctor: F, options: Value) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Context, Value) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        ServiceSource::Constructor(
            Arc::new(move |ctx, options| Ok(Arc::new(ctor(ctx, options)?) as ServiceArc)),
            options,
        )
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Instance(_) => f.write_str("ServiceSource::Instance"),
            ServiceSource::Constructor(_, options) => {
                f.debug_tuple("ServiceSource::Constructor").field(options).finish()
            }
        }
    }
}

struct ServiceEntry {
    value: ServiceArc,
    type_name: &'static str,
    owner: ContextId,
}

/// Key → instance map shared by the runtime.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    entries: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<ServiceArc> {
        self.entries.lock().get(key).map(|e| Arc::clone(&e.value))
    }

    fn insert(&self, key: &str, entry: ServiceEntry) -> ContextResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(ContextError::ServiceExists(key.to_string()));
        }
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str, value: &ServiceArc) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if Arc::ptr_eq(&entry.value, value) => entries.remove(key).is_some(),
            _ => false,
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Summary of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub key: String,
    pub type_name: &'static str,
    pub owner: ContextId,
}

impl Context {
    /// Registers a service under `key`.
    ///
    /// Fails on a reserved key, an existing key, or a failing constructor.
    pub fn register_service(&self, key: &str, source: ServiceSource) -> ContextResult<Disposer> {
        if key.is_empty() || RESERVED_KEYS.contains(&key) {
            return Err(ContextError::ReservedServiceKey(key.to_string()));
        }
        if self.shared.services.contains(key) {
            return Err(ContextError::ServiceExists(key.to_string()));
        }
        let value = match source {
            ServiceSource::Instance(value) => value,
            ServiceSource::Constructor(ctor, options) => {
                ctor(self, options).map_err(|source| ContextError::Construct {
                    key: key.to_string(),
                    source,
                })?
            }
        };
        self.install_service(key, value, "dyn Any")
    }

    /// Registers `service` under its [`NamedService::KEY`].
    pub fn provide<S: NamedService>(&self, service: S) -> ContextResult<Disposer> {
        if RESERVED_KEYS.contains(&S::KEY) {
            return Err(ContextError::ReservedServiceKey(S::KEY.to_string()));
        }
        self.install_service(S::KEY, Arc::new(service), type_name::<S>())
    }

    fn install_service(
        &self,
        key: &str,
        value: ServiceArc,
        type_name: &'static str,
    ) -> ContextResult<Disposer> {
        // Reserve the teardown slot first so a disposed context registers nothing.
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;
        self.shared.services.insert(
            key,
            ServiceEntry {
                value: Arc::clone(&value),
                type_name,
                owner: self.id(),
            },
        )?;
        debug!(service = key, context = %self.id(), "Service mounted");
        self.shared
            .notify(names::SERVICE_ADD, Payload::Service(key.to_string()));

        let shared = Arc::downgrade(&self.shared);
        let key = key.to_string();
        Ok(chain.push(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.services.remove(&key, &value) {
                debug!(service = %key, "Service unmounted");
                shared.notify(names::SERVICE_REMOVE, Payload::Service(key));
            }
        }))
    }

    /// Returns the service registered under `key`, resolving it through the
    /// module resolver and registering it on this context when missing.
    pub fn load_service(&self, key: &str) -> ContextResult<ServiceArc> {
        if let Some(value) = self.shared.services.get(key) {
            return Ok(value);
        }
        let source = match self.shared.resolver.resolve(key, ModuleKind::Service) {
            Some(Module::Service(source)) => source,
            _ => {
                return Err(ContextError::ModuleNotFound {
                    kind: ModuleKind::Service,
                    name: key.to_string(),
                });
            }
        };
        self.register_service(key, source)?;
        self.shared
            .services
            .get(key)
            .ok_or_else(|| ContextError::ModuleNotFound {
                kind: ModuleKind::Service,
                name: key.to_string(),
            })
    }

    /// Downcasts the service under `key` to `T`.
    pub fn get_service<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.services.get(key)?.downcast::<T>().ok()
    }

    /// Returns the [`NamedService`] of type `S`.
    pub fn service<S: NamedService>(&self) -> Option<Arc<S>> {
        self.get_service::<S>(S::KEY)
    }

    pub fn has_service(&self, key: &str) -> bool {
        self.shared.services.contains(key)
    }

    /// Registered services, sorted by key.
    pub fn services(&self) -> Vec<ServiceInfo> {
        let entries = self.shared.services.entries.lock();
        let mut out: Vec<ServiceInfo> = entries
            .iter()
            .map(|(key, entry)| ServiceInfo {
                key: key.clone(),
                type_name: entry.type_name,
                owner: entry.owner,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn service_keys(&self) -> Vec<String> {
        self.shared.services.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl NamedService for Counter {
        const KEY: &'static str = "counter";
    }

    #[test]
    fn test_register_and_downcast() {
        let root = Context::builder().build();
        root.register_service("greeting", ServiceSource::instance(String::from("hi")))
            .unwrap();
        assert_eq!(root.get_service::<String>("greeting").as_deref().map(String::as_str), Some("hi"));
        assert!(root.get_service::<u32>("greeting").is_none());

        root.provide(Counter(AtomicUsize::new(3))).unwrap();
        let counter = root.service::<Counter>().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        assert_eq!(root.service_keys(), vec!["counter", "greeting"]);
    }

    #[test]
    fn test_reserved_and_duplicate_keys() {
        let root = Context::builder().build();
        assert!(matches!(
            root.register_service("plugins", ServiceSource::instance(1u8)),
            Err(ContextError::ReservedServiceKey(_))
        ));
        root.register_service("db", ServiceSource::instance(1u8)).unwrap();
        assert!(matches!(
            root.register_service("db", ServiceSource::instance(2u8)),
            Err(ContextError::ServiceExists(_))
        ));
    }

    #[test]
    fn test_constructor_receives_options() {
        let root = Context::builder().build();
        root.register_service(
            "port",
            ServiceSource::constructor(
                |_ctx: &Context, options: Value| Ok(options["port"].as_u64().unwrap_or(0)),
                json!({ "port": 8080 }),
            ),
        )
        .unwrap();
        assert_eq!(root.get_service::<u64>("port").as_deref(), Some(&8080));

        let failing = ServiceSource::constructor(
            |_: &Context, _: Value| -> Result<u64, BoxError> { Err("no".into()) },
            Value::Null,
        );
        assert!(matches!(
            root.register_service("broken", failing),
            Err(ContextError::Construct { .. })
        ));
    }

    #[test]
    fn test_dispose_removes_service() {
        let root = Context::builder().build();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for event in [names::SERVICE_ADD, names::SERVICE_REMOVE] {
            let events = Arc::clone(&events);
            root.on(event, move |payload| {
                events
                    .lock()
                    .push(format!("{event}:{}", payload.service_key().unwrap_or("")));
                Ok(None)
            })
            .unwrap();
        }

        let ctx = root.group([1]).unwrap();
        ctx.register_service("cache", ServiceSource::instance(0u8)).unwrap();
        assert!(root.has_service("cache"));
        ctx.dispose().unwrap();
        assert!(!root.has_service("cache"));
        assert_eq!(
            *events.lock(),
            vec!["service-add:cache", "service-remove:cache"]
        );
    }
}
