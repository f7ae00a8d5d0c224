//! Protocol adapters.
//!
//! An adapter connects one chat protocol to the runtime. It is registered on
//! a context under its protocol name, started and stopped together with the
//! [`App`](crate::app::App), and produces sessions that it feeds into
//! [`Context::dispatch`].
//!
//! Registration also wires a forwarder on the root: every `"{protocol}.message"`
//! emission is re-emitted as the protocol-agnostic `message` event, which is
//! where the app runs middlewares.
//!
//! ```text
//! network ─→ Adapter ─→ root.dispatch(protocol, event, session)
//!                              │
//!                  "{protocol}.message" ─→ "message" ─→ middlewares
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::context::{Context, ContextId};
use crate::dispose::Disposer;
use crate::error::{BoxError, ContextError, ContextResult};
use crate::event::{Listener, names};
use crate::resolver::{Module, ModuleKind};

// =============================================================================
// Adapter Trait
// =============================================================================

/// A protocol implementation.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Starts receiving events. `root` is the context sessions are dispatched on.
    async fn start(&self, root: &Context) -> Result<(), BoxError>;

    /// Stops receiving events and releases connections.
    async fn stop(&self) -> Result<(), BoxError>;
}

/// Builds an adapter from the registering context, the protocol name and
/// its options.
pub type AdapterCtor =
    Arc<dyn Fn(&Context, &str, Value) -> Result<Arc<dyn Adapter>, BoxError> + Send + Sync>;

/// How an adapter is provided.
#[derive(Clone)]
pub enum AdapterSource {
    Instance(Arc<dyn Adapter>),
    Constructor(AdapterCtor),
    /// Look the protocol up through the module resolver.
    Resolve,
}

impl AdapterSource {
    pub fn instance<A: Adapter + 'static>(adapter: A) -> Self {
        AdapterSource::Instance(Arc::new(adapter))
    }

    pub fn constructor<A, F>(ctor: F) -> Self
    where
        A: Adapter + 'static,
        F: Fn(&Context, &str, Value) -> Result<A, BoxError> + Send + Sync + 'static,
    {
        AdapterSource::Constructor(adapter_ctor(ctor))
    }
}

/// Erases a typed adapter constructor.
pub fn adapter_ctor<A, F>(ctor: F) -> AdapterCtor
where
    A: Adapter + 'static,
    F: Fn(&Context, &str, Value) -> Result<A, BoxError> + Send + Sync + 'static,
{
    Arc::new(move |ctx, protocol, options| Ok(Arc::new(ctor(ctx, protocol, options)?) as Arc<dyn Adapter>))
}

impl fmt::Debug for AdapterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterSource::Instance(_) => "AdapterSource::Instance",
            AdapterSource::Constructor(_) => "AdapterSource::Constructor",
            AdapterSource::Resolve => "AdapterSource::Resolve",
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone)]
pub(crate) struct AdapterEntry {
    pub(crate) protocol: String,
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) owner: ContextId,
}

/// Registered adapters in registration order.
#[derive(Default)]
pub(crate) struct AdapterRegistry {
    entries: Mutex<Vec<AdapterEntry>>,
}

impl AdapterRegistry {
    pub(crate) fn contains(&self, protocol: &str) -> bool {
        self.entries.lock().iter().any(|e| e.protocol == protocol)
    }

    pub(crate) fn get(&self, protocol: &str) -> Option<Arc<dyn Adapter>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.protocol == protocol)
            .map(|e| Arc::clone(&e.adapter))
    }

    pub(crate) fn snapshot(&self) -> Vec<AdapterEntry> {
        self.entries.lock().clone()
    }

    fn insert(&self, entry: AdapterEntry) -> ContextResult<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.protocol == entry.protocol) {
            return Err(ContextError::AdapterExists(entry.protocol));
        }
        entries.push(entry);
        Ok(())
    }

    fn remove(&self, protocol: &str, adapter: &Arc<dyn Adapter>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !(e.protocol == protocol && Arc::ptr_eq(&e.adapter, adapter)));
        entries.len() != before
    }
}

// =============================================================================
// Context API
// =============================================================================

impl Context {
    /// Registers an adapter for `protocol`.
    ///
    /// `options` is handed to constructors. When the runtime has already
    /// started, the adapter is not started automatically; call
    /// [`Adapter::start`] yourself or register before [`App::start`](crate::app::App::start).
    pub fn adapter(
        &self,
        protocol: &str,
        source: AdapterSource,
        options: Value,
    ) -> ContextResult<Disposer> {
        if self.shared.adapters.contains(protocol) {
            return Err(ContextError::AdapterExists(protocol.to_string()));
        }
        let ctor = match source {
            AdapterSource::Instance(adapter) => return self.install_adapter(protocol, adapter),
            AdapterSource::Constructor(ctor) => ctor,
            AdapterSource::Resolve => match self.shared.resolver.resolve(protocol, ModuleKind::Adapter) {
                Some(Module::Adapter(ctor)) => ctor,
                _ => return Err(ContextError::AdapterNotFound(protocol.to_string())),
            },
        };
        let adapter = ctor(self, protocol, options).map_err(|source| ContextError::Construct {
            key: protocol.to_string(),
            source,
        })?;
        self.install_adapter(protocol, adapter)
    }

    fn install_adapter(&self, protocol: &str, adapter: Arc<dyn Adapter>) -> ContextResult<Disposer> {
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;
        self.shared.adapters.insert(AdapterEntry {
            protocol: protocol.to_string(),
            adapter: Arc::clone(&adapter),
            owner: self.id(),
        })?;

        let root = self.root();
        let root_bus = Arc::downgrade(&root.bus()?);
        let forward = self.listen_on(
            &root,
            &names::namespaced(protocol, names::MESSAGE),
            Listener::new_async(move |payload| {
                let bus = root_bus.upgrade();
                async move {
                    if let Some(bus) = bus {
                        bus.emit_sync(names::MESSAGE, payload)
                            .await
                            .map_err(BoxError::from)?;
                    }
                    Ok::<Option<Value>, BoxError>(None)
                }
            }),
        );
        let forward = match forward {
            Ok(disposer) => disposer,
            Err(error) => {
                self.shared.adapters.remove(protocol, &adapter);
                return Err(error);
            }
        };
        debug!(protocol, context = %self.id(), "Adapter registered");

        let shared = Arc::downgrade(&self.shared);
        let protocol = protocol.to_string();
        Ok(chain.push(move || {
            forward.dispose();
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if !shared.adapters.remove(&protocol, &adapter) {
                return;
            }
            debug!(protocol = %protocol, "Adapter removed");
            if !shared.lifecycle.lock().started {
                return;
            }
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(error) = adapter.stop().await {
                            warn!(protocol = %protocol, %error, "Adapter stop failed");
                        }
                    });
                }
                Err(_) => warn!(protocol = %protocol, "No runtime to stop removed adapter"),
            }
        }))
    }

    pub fn get_adapter(&self, protocol: &str) -> Option<Arc<dyn Adapter>> {
        self.shared.adapters.get(protocol)
    }

    /// Registered protocols, in registration order.
    pub fn adapters(&self) -> Vec<String> {
        self.shared
            .adapters
            .snapshot()
            .into_iter()
            .map(|e| e.protocol)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::resolver::ModuleMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Mock {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for Mock {
        async fn start(&self, _root: &Context) -> Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forwards_protocol_messages() {
        let root = Context::builder().build();
        root.adapter("mock", AdapterSource::instance(Mock::default()), Value::Null)
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        root.on(names::MESSAGE, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

        root.emit_sync("mock.message", Payload::None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(root.adapters(), vec!["mock"]);
    }

    #[test]
    fn test_duplicate_and_unresolved() {
        let root = Context::builder().resolver(Arc::new(ModuleMap::new())).build();
        root.adapter("mock", AdapterSource::instance(Mock::default()), Value::Null)
            .unwrap();
        assert!(matches!(
            root.adapter("mock", AdapterSource::instance(Mock::default()), Value::Null),
            Err(ContextError::AdapterExists(_))
        ));
        assert!(matches!(
            root.adapter("qq", AdapterSource::Resolve, Value::Null),
            Err(ContextError::AdapterNotFound(_))
        ));
    }

    #[test]
    fn test_resolved_constructor_and_dispose() {
        let map = ModuleMap::new().adapter(
            "mock",
            adapter_ctor(|_: &Context, protocol: &str, options: Value| {
                assert_eq!(protocol, "mock");
                assert_eq!(options["token"], "abc");
                Ok(Mock::default())
            }),
        );
        let root = Context::builder().resolver(Arc::new(map)).build();
        let disposer = root
            .adapter("mock", AdapterSource::Resolve, serde_json::json!({ "token": "abc" }))
            .unwrap();
        assert!(root.get_adapter("mock").is_some());
        assert_eq!(root.listener_count("mock.message"), 1);

        disposer.dispose();
        assert!(root.get_adapter("mock").is_none());
        assert_eq!(root.listener_count("mock.message"), 0);
    }
}
