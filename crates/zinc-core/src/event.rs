//! Per-context event bus.
//!
//! Each context owns one [`EventBus`]. Listeners are either synchronous
//! closures or async closures returning a boxed future. Four dispatch modes
//! are offered:
//!
//! | Mode | Sync listeners | Async listeners | Result |
//! |------|----------------|-----------------|--------|
//! | [`emit`](EventBus::emit) | run in order | spawned | `()` |
//! | [`emit_sync`](EventBus::emit_sync) | run in order | awaited in order | `()` |
//! | [`bail`](EventBus::bail) | run in order, first non-empty wins | spawned | `Option<Value>` |
//! | [`bail_sync`](EventBus::bail_sync) | awaited in order, first non-empty wins | awaited | `Option<Value>` |
//!
//! A listener returning `Err` aborts the remaining listeners and the error
//! travels back to the caller as [`EventError::Listener`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::command::Command;
use crate::error::{BoxError, EventError, EventResult};
use crate::plugin::Plugin;
use crate::session::SessionRef;

/// Well-known event names.
pub mod names {
    pub const PLUGIN_ADD: &str = "plugin-add";
    pub const PLUGIN_REMOVE: &str = "plugin-remove";
    pub const COMMAND_ADD: &str = "command-add";
    pub const COMMAND_REMOVE: &str = "command-remove";
    pub const SERVICE_ADD: &str = "service-add";
    pub const SERVICE_REMOVE: &str = "service-remove";
    pub const BEFORE_READY: &str = "before-ready";
    pub const AFTER_READY: &str = "after-ready";
    pub const BEFORE_START: &str = "before-start";
    pub const AFTER_START: &str = "after-start";
    pub const BEFORE_DISPOSE: &str = "before-dispose";
    pub const DISPOSE: &str = "dispose";
    pub const AFTER_DISPOSE: &str = "after-dispose";
    pub const MESSAGE: &str = "message";

    /// Builds the `"{protocol}.{event}"` name used by cascading dispatch.
    pub fn namespaced(protocol: &str, event: &str) -> String {
        format!("{protocol}.{event}")
    }
}

// ============================================================================
// Payload
// ============================================================================

/// The value handed to listeners.
#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Session(SessionRef),
    Plugin(Arc<Plugin>),
    Command(Arc<Command>),
    /// A service key.
    Service(String),
    Value(Value),
    Any(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    pub fn session(&self) -> Option<&SessionRef> {
        match self {
            Payload::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn plugin(&self) -> Option<&Arc<Plugin>> {
        match self {
            Payload::Plugin(p) => Some(p),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&Arc<Command>> {
        match self {
            Payload::Command(c) => Some(c),
            _ => None,
        }
    }

    pub fn service_key(&self) -> Option<&str> {
        match self {
            Payload::Service(k) => Some(k),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Downcasts an [`Payload::Any`] payload.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Payload::Any(a) => a.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => f.write_str("None"),
            Payload::Session(s) => f
                .debug_struct("Session")
                .field("protocol", &s.protocol())
                .field("event", &s.event_name())
                .finish(),
            Payload::Plugin(p) => f.debug_tuple("Plugin").field(&p.full_name()).finish(),
            Payload::Command(c) => f.debug_tuple("Command").field(&c.name()).finish(),
            Payload::Service(k) => f.debug_tuple("Service").field(k).finish(),
            Payload::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Payload::Any(_) => f.write_str("Any(..)"),
        }
    }
}

impl From<SessionRef> for Payload {
    fn from(session: SessionRef) -> Self {
        Payload::Session(session)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// What a listener returns. `Ok(Some(v))` with a non-null `v` vetoes a bail.
pub type ListenerResult = Result<Option<Value>, BoxError>;

type SyncListenerFn = dyn Fn(&Payload) -> ListenerResult + Send + Sync;
type AsyncListenerFn = dyn Fn(Payload) -> BoxFuture<'static, ListenerResult> + Send + Sync;

/// A registered event handler.
#[derive(Clone)]
pub enum Listener {
    Sync(Arc<SyncListenerFn>),
    Async(Arc<AsyncListenerFn>),
}

impl Listener {
    /// Wraps a synchronous closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Payload) -> ListenerResult + Send + Sync + 'static,
    {
        Listener::Sync(Arc::new(f))
    }

    /// Wraps an async closure.
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        Listener::Async(Arc::new(move |payload| Box::pin(f(payload))))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Listener::Async(_))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Sync(_) => f.write_str("Listener::Sync"),
            Listener::Async(_) => f.write_str("Listener::Async"),
        }
    }
}

/// Rejects empty names and names containing whitespace.
pub fn validate_event_name(event: &str) -> EventResult<()> {
    if event.is_empty() || event.chars().any(char::is_whitespace) {
        return Err(EventError::InvalidName(event.to_string()));
    }
    Ok(())
}

fn non_empty(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

fn spawn_detached(event: &str, fut: BoxFuture<'static, ListenerResult>) {
    let event = event.to_string();
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(error) = fut.await {
                    warn!(event = %event, %error, "Async listener failed");
                }
            });
        }
        Err(_) => warn!(event = %event, "No tokio runtime, async listener dropped"),
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Listener table for a single context.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener and returns its id for [`off`](Self::off).
    pub fn on(&self, event: &str, listener: Listener) -> EventResult<u64> {
        validate_event_name(event)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        trace!(event, id, "Listener added");
        Ok(id)
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn off(&self, event: &str, id: u64) -> bool {
        let mut table = self.listeners.lock();
        let Some(list) = table.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(entry, _)| *entry != id);
        let removed = list.len() != before;
        if list.is_empty() {
            table.remove(event);
        }
        removed
    }

    /// Snapshot of the listeners for `event`, in registration order.
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        self.listeners
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Drops every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Fire-and-forget emission.
    pub fn emit(&self, event: &str, payload: &Payload) -> EventResult<()> {
        Self::emit_to(event, self.listeners(event), payload)
    }

    /// Emits to an already-taken snapshot of listeners.
    pub(crate) fn emit_to(event: &str, listeners: Vec<Listener>, payload: &Payload) -> EventResult<()> {
        for listener in listeners {
            match listener {
                Listener::Sync(f) => {
                    f(payload).map_err(|e| EventError::listener(event, e))?;
                }
                Listener::Async(f) => spawn_detached(event, f(payload.clone())),
            }
        }
        Ok(())
    }

    /// Awaits every listener in registration order.
    pub async fn emit_sync(&self, event: &str, payload: Payload) -> EventResult<()> {
        for listener in self.listeners(event) {
            match listener {
                Listener::Sync(f) => {
                    f(&payload).map_err(|e| EventError::listener(event, e))?;
                }
                Listener::Async(f) => {
                    f(payload.clone())
                        .await
                        .map_err(|e| EventError::listener(event, e))?;
                }
            }
        }
        Ok(())
    }

    /// Returns the first non-empty synchronous result.
    ///
    /// Async listeners cannot veto in this mode; they are spawned.
    pub fn bail(&self, event: &str, payload: &Payload) -> EventResult<Option<Value>> {
        for listener in self.listeners(event) {
            match listener {
                Listener::Sync(f) => {
                    let result = f(payload).map_err(|e| EventError::listener(event, e))?;
                    if let Some(value) = non_empty(result) {
                        return Ok(Some(value));
                    }
                }
                Listener::Async(f) => {
                    warn!(event, "Async listener cannot veto a synchronous bail, spawning it");
                    spawn_detached(event, f(payload.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Awaits listeners in order and returns the first non-empty result.
    pub async fn bail_sync(&self, event: &str, payload: Payload) -> EventResult<Option<Value>> {
        for listener in self.listeners(event) {
            let result = match listener {
                Listener::Sync(f) => f(&payload),
                Listener::Async(f) => f(payload.clone()).await,
            }
            .map_err(|e| EventError::listener(event, e))?;
            if let Some(value) = non_empty(result) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.listeners.lock();
        let mut events: Vec<_> = table.keys().cloned().collect();
        events.sort();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str, ret: Option<Value>) -> Listener {
        let log = Arc::clone(log);
        Listener::new(move |_| {
            log.lock().push(tag);
            Ok(ret.clone())
        })
    }

    #[test]
    fn test_emit_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("ping", recorder(&log, "a", None)).unwrap();
        bus.on("ping", recorder(&log, "b", None)).unwrap();
        bus.on("pong", recorder(&log, "x", None)).unwrap();

        bus.emit("ping", &Payload::None).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_bail_short_circuits() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("check", recorder(&log, "first", None)).unwrap();
        bus.on("check", recorder(&log, "null", Some(Value::Null))).unwrap();
        bus.on("check", recorder(&log, "veto", Some(json!("denied")))).unwrap();
        bus.on("check", recorder(&log, "never", Some(json!("late")))).unwrap();

        let result = bus.bail("check", &Payload::None).unwrap();
        assert_eq!(result, Some(json!("denied")));
        assert_eq!(*log.lock(), vec!["first", "null", "veto"]);
    }

    #[test]
    fn test_listener_error_aborts_chain() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("e", Listener::new(|_| Err("nope".into()))).unwrap();
        bus.on("e", recorder(&log, "after", None)).unwrap();

        let err = bus.emit("e", &Payload::None).unwrap_err();
        assert!(matches!(err, EventError::Listener { ref event, .. } if event == "e"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_off_and_invalid_names() {
        let bus = EventBus::new();
        let id = bus.on("tick", Listener::new(|_| Ok(None))).unwrap();
        assert_eq!(bus.listener_count("tick"), 1);
        assert!(bus.off("tick", id));
        assert!(!bus.off("tick", id));
        assert_eq!(bus.listener_count("tick"), 0);

        assert!(matches!(
            bus.on("", Listener::new(|_| Ok(None))),
            Err(EventError::InvalidName(_))
        ));
        assert!(bus.on("has space", Listener::new(|_| Ok(None))).is_err());
    }

    #[tokio::test]
    async fn test_emit_sync_awaits_in_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = Arc::clone(&log);
        bus.on(
            "boot",
            Listener::new_async(move |_| {
                let log = Arc::clone(&slow);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    log.lock().push("slow");
                    Ok(None)
                }
            }),
        )
        .unwrap();
        bus.on("boot", recorder(&log, "fast", None)).unwrap();

        bus.emit_sync("boot", Payload::None).await.unwrap();
        assert_eq!(*log.lock(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_bail_spawns_async_listener_without_veto() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.on(
            "gate",
            Listener::new_async(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send("ran");
                    Ok(Some(json!("too late")))
                }
            }),
        )
        .unwrap();

        assert_eq!(bus.bail("gate", &Payload::None).unwrap(), None);
        assert_eq!(rx.recv().await, Some("ran"));
    }

    #[tokio::test]
    async fn test_bail_sync_awaits_async_veto() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(
            "gate",
            Listener::new_async(|payload: Payload| async move {
                Ok(payload.value().cloned())
            }),
        )
        .unwrap();
        bus.on("gate", recorder(&log, "skipped", None)).unwrap();

        let result = bus.bail_sync("gate", Payload::Value(json!(1))).await.unwrap();
        assert_eq!(result, Some(json!(1)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_emit_spawns_async_listeners() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.on(
            "bg",
            Listener::new_async(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                    Ok(None)
                }
            }),
        )
        .unwrap();

        bus.emit("bg", &Payload::None).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
