//! The context tree.
//!
//! A [`Context`] is a cheap handle (`ContextId` + shared runtime state) to one
//! node of a tree of scoped execution contexts. Nodes live in an arena owned
//! by the runtime; handles never keep a node alive, so a disposed context
//! simply stops resolving and every operation on it returns
//! [`ContextError::Disposed`].
//!
//! Each node owns:
//!
//! - a [`Filter`] gating which sessions reach it (children default to the
//!   parent's filter),
//! - ordered child contexts,
//! - the plugins it mounted, its commands, middlewares and components,
//! - an [`EventBus`] and a [`DisposeChain`],
//! - an optional owner plugin, inherited by children derived through the
//!   filter combinators.
//!
//! # Concurrency
//!
//! The arena sits behind a single `parking_lot::Mutex`. The lock is never held
//! while user code runs: every walk takes a snapshot of what it needs first,
//! then releases the lock before calling listeners, install functions or
//! disposers.
//!
//! # Example
//!
//! ```rust,ignore
//! let root = Context::builder().build();
//! let admins = root.group([42])?.admin(Vec::<i64>::new())?;
//! admins.on(names::namespaced("onebot", "message").as_str(), |payload| {
//!     tracing::info!(?payload, "admin spoke in group 42");
//!     Ok(None)
//! })?;
//! ```

mod query;
mod timer;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::AdapterRegistry;
use crate::command::{Command, command_path};
use crate::component::Component;
use crate::dispose::{DisposeChain, Disposer};
use crate::error::{BoxError, ContextError, ContextResult, EventError};
use crate::event::{EventBus, Listener, ListenerResult, Payload, names};
use crate::filter::{Filter, Role};
use crate::middleware::Middleware;
use crate::plugin::Plugin;
use crate::resolver::{LinkedModules, ModuleResolver};
use crate::service::ServiceRegistry;
use crate::session::Session;

/// Identifier of a node in the context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub const ROOT: ContextId = ContextId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Arena
// =============================================================================

pub(crate) struct Node {
    pub(crate) parent: Option<ContextId>,
    pub(crate) children: Vec<ContextId>,
    pub(crate) filter: Filter,
    pub(crate) plugins: Vec<Arc<Plugin>>,
    pub(crate) commands: Vec<Arc<Command>>,
    pub(crate) middlewares: Vec<Middleware>,
    pub(crate) components: HashMap<String, Component>,
    pub(crate) disposes: Arc<DisposeChain>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) owner: Option<Weak<Plugin>>,
    pub(crate) disposing: bool,
}

impl Node {
    fn new(parent: Option<ContextId>, filter: Filter, owner: Option<Weak<Plugin>>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            filter,
            plugins: Vec::new(),
            commands: Vec::new(),
            middlewares: Vec::new(),
            components: HashMap::new(),
            disposes: DisposeChain::new(),
            bus: Arc::new(EventBus::new()),
            owner,
            disposing: false,
        }
    }

    pub(crate) fn owner_plugin(&self) -> Option<Arc<Plugin>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

pub(crate) struct Tree {
    pub(crate) nodes: HashMap<ContextId, Node>,
    next_id: u64,
}

impl Tree {
    fn alloc_id(&mut self) -> ContextId {
        let id = ContextId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn live(&self, id: ContextId) -> Option<&Node> {
        self.nodes.get(&id).filter(|node| !node.disposing)
    }

    pub(crate) fn live_mut(&mut self, id: ContextId) -> Option<&mut Node> {
        self.nodes.get_mut(&id).filter(|node| !node.disposing)
    }

    /// Ids of `start` and all its descendants, parents before children.
    pub(crate) fn subtree(&self, start: ContextId) -> Vec<ContextId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(id);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Every plugin in the arena.
    pub(crate) fn all_plugins(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.nodes.values().flat_map(|node| node.plugins.iter())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Lifecycle {
    pub(crate) ready: bool,
    pub(crate) started: bool,
}

/// Runtime-wide state shared by every context handle.
pub(crate) struct Shared {
    pub(crate) tree: Mutex<Tree>,
    pub(crate) services: ServiceRegistry,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) resolver: Arc<dyn ModuleResolver>,
    pub(crate) permissions: HashMap<String, Vec<Role>>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    pub(crate) fn root_bus(&self) -> Option<Arc<EventBus>> {
        self.tree
            .lock()
            .nodes
            .get(&ContextId::ROOT)
            .map(|node| Arc::clone(&node.bus))
    }

    /// Emits a lifecycle notification on the root bus.
    ///
    /// Notifications never fail the operation that triggered them; listener
    /// errors are logged.
    pub(crate) fn notify(&self, event: &str, payload: Payload) {
        if let Some(bus) = self.root_bus() {
            if let Err(error) = bus.emit(event, &payload) {
                warn!(event, %error, "Lifecycle listener failed");
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds the root context of a new runtime.
pub struct ContextBuilder {
    resolver: Option<Arc<dyn ModuleResolver>>,
    permissions: HashMap<String, Vec<Role>>,
    filter: Filter,
}

impl ContextBuilder {
    /// Module resolver used for name-based plugin, adapter and service loading.
    ///
    /// Defaults to [`LinkedModules`].
    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Roles required per command, keyed by command path (`"admin/kick"`).
    ///
    /// A key written as a full declaration is reduced to its path.
    pub fn permissions(mut self, permissions: HashMap<String, Vec<Role>>) -> Self {
        self.permissions = permissions
            .into_iter()
            .map(|(decl, roles)| (command_path(&decl), roles))
            .collect();
        self
    }

    /// Root filter. Defaults to accepting everything.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn build(self) -> Context {
        let mut nodes = HashMap::new();
        nodes.insert(ContextId::ROOT, Node::new(None, self.filter, None));
        let shared = Shared {
            tree: Mutex::new(Tree { nodes, next_id: 1 }),
            services: ServiceRegistry::default(),
            adapters: AdapterRegistry::default(),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(LinkedModules)),
            permissions: self.permissions,
            lifecycle: Mutex::new(Lifecycle::default()),
        };
        Context {
            id: ContextId::ROOT,
            shared: Arc::new(shared),
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// Handle to one node of the context tree.
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    pub(crate) shared: Arc<Shared>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            resolver: None,
            permissions: HashMap::new(),
            filter: Filter::always(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == ContextId::ROOT
    }

    /// The root context of this runtime.
    pub fn root(&self) -> Context {
        self.handle(ContextId::ROOT)
    }

    pub fn parent(&self) -> Option<Context> {
        let parent = self.shared.tree.lock().nodes.get(&self.id)?.parent?;
        Some(self.handle(parent))
    }

    pub fn children(&self) -> Vec<Context> {
        let ids = self
            .shared
            .tree
            .lock()
            .nodes
            .get(&self.id)
            .map(|node| node.children.clone())
            .unwrap_or_default();
        ids.into_iter().map(|id| self.handle(id)).collect()
    }

    /// Whether this context has been disposed (or is being disposed).
    pub fn is_disposed(&self) -> bool {
        self.shared.tree.lock().live(self.id).is_none()
    }

    /// The plugin this context belongs to, if any.
    pub fn owner_plugin(&self) -> Option<Arc<Plugin>> {
        self.shared
            .tree
            .lock()
            .nodes
            .get(&self.id)
            .and_then(Node::owner_plugin)
    }

    /// A snapshot of this context's filter.
    pub fn filter(&self) -> ContextResult<Filter> {
        self.with_node(|node| node.filter.clone())
    }

    /// Whether `session` matches this context.
    ///
    /// The session may override the decision through
    /// [`Session::match_context`]; otherwise the filter decides. Disposed
    /// contexts accept nothing.
    pub fn accepts(&self, session: &dyn Session) -> bool {
        if self.is_disposed() {
            return false;
        }
        if let Some(decision) = session.match_context(self) {
            return decision;
        }
        match self.filter() {
            Ok(filter) => filter.test(session),
            Err(_) => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lifecycle.lock().ready
    }

    pub fn is_started(&self) -> bool {
        self.shared.lifecycle.lock().started
    }

    // ─── Internal helpers ───────────────────────────────────────────────

    pub(crate) fn from_parts(id: ContextId, shared: Arc<Shared>) -> Context {
        Context { id, shared }
    }

    pub(crate) fn handle(&self, id: ContextId) -> Context {
        Context {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> ContextResult<R> {
        let tree = self.shared.tree.lock();
        tree.live(self.id).map(f).ok_or(ContextError::Disposed(self.id))
    }

    pub(crate) fn with_node_mut<R>(&self, f: impl FnOnce(&mut Node) -> R) -> ContextResult<R> {
        let mut tree = self.shared.tree.lock();
        tree.live_mut(self.id)
            .map(f)
            .ok_or(ContextError::Disposed(self.id))
    }

    pub(crate) fn bus(&self) -> ContextResult<Arc<EventBus>> {
        self.with_node(|node| Arc::clone(&node.bus))
    }

    /// Appends a teardown action to this context's dispose chain.
    pub(crate) fn push_dispose<F>(&self, action: F) -> ContextResult<Disposer>
    where
        F: FnOnce() + Send + 'static,
    {
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;
        Ok(chain.push(action))
    }

    /// Appends a teardown action that edits this context's node, if it still
    /// exists when the action runs.
    pub(crate) fn push_node_teardown<F>(&self, edit: F) -> ContextResult<Disposer>
    where
        F: FnOnce(&mut Node) + Send + 'static,
    {
        let shared = Arc::downgrade(&self.shared);
        let id = self.id;
        self.push_dispose(move || {
            if let Some(shared) = shared.upgrade() {
                if let Some(node) = shared.tree.lock().nodes.get_mut(&id) {
                    edit(node);
                }
            }
        })
    }

    /// Creates a child node under this context.
    pub(crate) fn spawn_child(
        &self,
        filter: Filter,
        owner: Option<Weak<Plugin>>,
    ) -> ContextResult<Context> {
        let mut tree = self.shared.tree.lock();
        if tree.live(self.id).is_none() {
            return Err(ContextError::Disposed(self.id));
        }
        let id = tree.alloc_id();
        tree.nodes.insert(id, Node::new(Some(self.id), filter, owner));
        if let Some(parent) = tree.nodes.get_mut(&self.id) {
            parent.children.push(id);
        }
        drop(tree);
        Ok(self.handle(id))
    }

    // =========================================================================
    // Filter combinators
    // =========================================================================

    fn derive(&self, compose: impl FnOnce(&Filter) -> Filter) -> ContextResult<Context> {
        let (filter, owner) = self.with_node(|node| (node.filter.clone(), node.owner.clone()))?;
        self.spawn_child(compose(&filter), owner)
    }

    /// Child context accepting sessions matched by this context **and** `filter`.
    pub fn and(&self, filter: Filter) -> ContextResult<Context> {
        self.derive(|parent| parent.and(&filter))
    }

    /// Child context accepting sessions matched by this context **or** `filter`.
    pub fn or(&self, filter: Filter) -> ContextResult<Context> {
        self.derive(|parent| parent.or(&filter))
    }

    /// Child context accepting sessions matched by this context but **not** by
    /// `filter`.
    pub fn not(&self, filter: Filter) -> ContextResult<Context> {
        self.derive(|parent| parent.and_not(&filter))
    }

    // ─── Selectors ──────────────────────────────────────────────────────

    /// Narrows to sessions whose `key` field is one of `values`.
    ///
    /// An empty `values` list only requires the field to be present.
    pub fn pick<I, V>(&self, key: &str, values: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.and(Filter::field(key, values))
    }

    pub fn user<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("user_id", ids)
    }

    pub fn group<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("group_id", ids)
    }

    pub fn discuss<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("discuss_id", ids)
    }

    pub fn guild<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("guild_id", ids)
    }

    pub fn channel<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("channel_id", ids)
    }

    /// Narrows to sessions produced by one of `protocols`.
    pub fn platform<I, V>(&self, protocols: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("protocol", protocols)
    }

    /// Narrows to private chats, optionally with the given users.
    pub fn private<I, V>(&self, user_ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pick("detail_type", ["private"])?.user(user_ids)
    }

    /// Narrows to senders holding any of `roles`.
    pub fn role(&self, roles: impl IntoIterator<Item = Role>) -> ContextResult<Context> {
        self.and(Filter::role(roles))
    }

    pub fn admin<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.role([Role::Admin])?.user(ids)
    }

    pub fn owner<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.role([Role::Owner])?.user(ids)
    }

    pub fn admins<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.role([Role::Admins])?.user(ids)
    }

    pub fn master<I, V>(&self, ids: I) -> ContextResult<Context>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.role([Role::Master])?.user(ids)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Registers `listener` on `target`'s bus, owned by this context's chain.
    pub(crate) fn listen_on(
        &self,
        target: &Context,
        event: &str,
        listener: Listener,
    ) -> ContextResult<Disposer> {
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;
        let bus = target.bus()?;
        let id = bus.on(event, listener)?;
        let weak = Arc::downgrade(&bus);
        let event = event.to_string();
        Ok(chain.push(move || {
            if let Some(bus) = weak.upgrade() {
                bus.off(&event, id);
            }
        }))
    }

    /// Adds a listener; the returned disposer removes it.
    pub fn listen(&self, event: &str, listener: Listener) -> ContextResult<Disposer> {
        self.listen_on(self, event, listener)
    }

    /// Adds a synchronous listener.
    pub fn on<F>(&self, event: &str, f: F) -> ContextResult<Disposer>
    where
        F: Fn(&Payload) -> ListenerResult + Send + Sync + 'static,
    {
        self.listen(event, Listener::new(f))
    }

    /// Adds an asynchronous listener.
    pub fn on_async<F, Fut>(&self, event: &str, f: F) -> ContextResult<Disposer>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.listen(event, Listener::new_async(f))
    }

    pub fn emit(&self, event: &str, payload: &Payload) -> ContextResult<()> {
        Ok(self.bus()?.emit(event, payload)?)
    }

    pub async fn emit_sync(&self, event: &str, payload: Payload) -> ContextResult<()> {
        let bus = self.bus()?;
        Ok(bus.emit_sync(event, payload).await?)
    }

    pub fn bail(&self, event: &str, payload: &Payload) -> ContextResult<Option<Value>> {
        Ok(self.bus()?.bail(event, payload)?)
    }

    pub async fn bail_sync(&self, event: &str, payload: Payload) -> ContextResult<Option<Value>> {
        let bus = self.bus()?;
        Ok(bus.bail_sync(event, payload).await?)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.bus().map_or(0, |bus| bus.listener_count(event))
    }

    // ─── Lifecycle hooks ────────────────────────────────────────────────

    async fn lifecycle_hook<F, Fut>(
        &self,
        event: &'static str,
        passed: fn(&Lifecycle) -> bool,
        hook: F,
    ) -> ContextResult<Disposer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let hook = Arc::new(hook);
        let already = passed(&self.shared.lifecycle.lock());
        if already {
            (*hook)()
                .await
                .map_err(|error| EventError::listener(event, error))?;
        }
        let root = self.root();
        self.listen_on(
            &root,
            event,
            Listener::new_async(move |_| {
                let hook = Arc::clone(&hook);
                async move { (*hook)().await.map(|()| None) }
            }),
        )
    }

    /// Runs `hook` before the runtime becomes ready, or right away if it
    /// already is. The hook stays registered for later lifecycle rounds.
    pub async fn before_ready<F, Fut>(&self, hook: F) -> ContextResult<Disposer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.lifecycle_hook(names::BEFORE_READY, |l| l.ready, hook)
            .await
    }

    pub async fn after_ready<F, Fut>(&self, hook: F) -> ContextResult<Disposer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.lifecycle_hook(names::AFTER_READY, |l| l.ready, hook)
            .await
    }

    pub async fn before_start<F, Fut>(&self, hook: F) -> ContextResult<Disposer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.lifecycle_hook(names::BEFORE_START, |l| l.started, hook)
            .await
    }

    pub async fn after_start<F, Fut>(&self, hook: F) -> ContextResult<Disposer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.lifecycle_hook(names::AFTER_START, |l| l.started, hook)
            .await
    }

    pub(crate) fn set_lifecycle(&self, edit: impl FnOnce(&mut Lifecycle)) {
        edit(&mut self.shared.lifecycle.lock());
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Tears this context down together with everything below it.
    ///
    /// Order: `before-dispose` on this context, then every descendant
    /// (deepest first, each running its own full teardown), then this
    /// context's dispose chain, then `dispose` and `after-dispose`, then the
    /// node is detached from its parent. The root is emptied and marked
    /// disposed instead of being removed.
    pub fn dispose(&self) -> ContextResult<()> {
        let bus = self.bus()?;
        emit_logged(&bus, names::BEFORE_DISPOSE);

        let descendants = {
            let mut tree = self.shared.tree.lock();
            let node = tree
                .live_mut(self.id)
                .ok_or(ContextError::Disposed(self.id))?;
            node.disposing = true;
            let mut ids = tree.subtree(self.id);
            // Reversed preorder lists every node after all of its descendants.
            ids.reverse();
            ids.pop();
            ids
        };

        for id in descendants {
            let child = self.handle(id);
            let bus = {
                let mut tree = self.shared.tree.lock();
                match tree.live_mut(id) {
                    Some(node) => {
                        node.disposing = true;
                        Arc::clone(&node.bus)
                    }
                    None => continue,
                }
            };
            emit_logged(&bus, names::BEFORE_DISPOSE);
            child.finish_dispose();
        }

        self.finish_dispose();
        Ok(())
    }

    fn finish_dispose(&self) {
        let Some((chain, bus)) = self
            .shared
            .tree
            .lock()
            .nodes
            .get(&self.id)
            .map(|node| (Arc::clone(&node.disposes), Arc::clone(&node.bus)))
        else {
            return;
        };

        // Draining removes listeners, so the final notifications go to a
        // snapshot taken beforehand.
        let on_dispose = bus.listeners(names::DISPOSE);
        let after_dispose = bus.listeners(names::AFTER_DISPOSE);
        let actions = chain.drain();
        for (event, listeners) in [
            (names::DISPOSE, on_dispose),
            (names::AFTER_DISPOSE, after_dispose),
        ] {
            if let Err(error) = EventBus::emit_to(event, listeners, &Payload::None) {
                warn!(context = %self.id, event, %error, "Dispose listener failed");
            }
        }
        bus.clear();

        let unmounted = {
            let mut tree = self.shared.tree.lock();
            if self.is_root() {
                if let Some(root) = tree.nodes.get_mut(&self.id) {
                    root.children.clear();
                    root.plugins.clear();
                    root.commands.clear();
                    root.middlewares.clear();
                    root.components.clear();
                }
                None
            } else {
                let removed = tree.nodes.remove(&self.id);
                removed.and_then(|node| {
                    if let Some(parent) = node.parent.and_then(|p| tree.nodes.get_mut(&p)) {
                        parent.children.retain(|c| *c != self.id);
                    }
                    let plugin = node.owner_plugin().filter(|p| p.context_id() == self.id)?;
                    if let Some(mounter) = tree.nodes.get_mut(&plugin.mounted_by()) {
                        mounter.plugins.retain(|p| !Arc::ptr_eq(p, &plugin));
                    }
                    Some(plugin)
                })
            }
        };

        if let Some(plugin) = unmounted {
            plugin.disable();
            debug!(plugin = %plugin.full_name(), "Plugin unmounted");
            self.shared
                .notify(names::PLUGIN_REMOVE, Payload::Plugin(plugin));
        }
        debug!(context = %self.id, actions, "Context disposed");
    }
}

fn emit_logged(bus: &EventBus, event: &str) {
    if let Err(error) = bus.emit(event, &Payload::None) {
        warn!(event, %error, "Dispose listener failed");
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RoleFlags, SessionRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(user: i64, group: Option<i64>) -> SessionRecord {
        let s = SessionRecord::new("onebot", "message").with_field("user_id", user);
        match group {
            Some(g) => s.with_field("group_id", g),
            None => s,
        }
    }

    #[test]
    fn test_combinators_create_children() {
        let root = Context::builder().build();
        let g = root.group([1]).unwrap();
        let u = g.user([7]).unwrap();

        assert_eq!(g.parent(), Some(root.clone()));
        assert_eq!(u.parent(), Some(g.clone()));
        assert_eq!(root.children(), vec![g.clone()]);

        assert!(u.accepts(&msg(7, Some(1))));
        assert!(!u.accepts(&msg(7, Some(2))));
        assert!(!u.accepts(&msg(8, Some(1))));
        // parents are untouched
        assert!(root.accepts(&msg(8, None)));
        assert!(g.accepts(&msg(8, Some(1))));
    }

    #[test]
    fn test_or_and_not() {
        let root = Context::builder().build();
        let g = root.group([1]).unwrap();
        let either = g.or(Filter::field("user_id", [9])).unwrap();
        let not_nine = g.not(Filter::field("user_id", [9])).unwrap();

        assert!(either.accepts(&msg(9, None)));
        assert!(either.accepts(&msg(1, Some(1))));
        assert!(!not_nine.accepts(&msg(9, Some(1))));
        assert!(not_nine.accepts(&msg(3, Some(1))));
    }

    #[test]
    fn test_role_selectors() {
        let root = Context::builder().build();
        let admins = root.admin(Vec::<Value>::new()).unwrap();
        let admin = msg(1, Some(1)).with_roles(RoleFlags {
            admin: true,
            ..Default::default()
        });
        assert!(admins.accepts(&admin));
        assert!(!admins.accepts(&msg(1, Some(1))));

        let private = root.private([5]).unwrap();
        assert!(private.accepts(&msg(5, None).with_field("detail_type", "private")));
        assert!(!private.accepts(&msg(5, Some(1))));
    }

    #[test]
    fn test_dispose_order_and_events() {
        let root = Context::builder().build();
        let child = root.group([1]).unwrap();
        let grandchild = child.user([2]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (ctx, tag) in [(&child, "child"), (&grandchild, "grandchild")] {
            for event in [names::BEFORE_DISPOSE, names::DISPOSE, names::AFTER_DISPOSE] {
                let log = Arc::clone(&log);
                ctx.on(event, move |_| {
                    log.lock().push(format!("{tag}:{event}"));
                    Ok(None)
                })
                .unwrap();
            }
        }
        let log2 = Arc::clone(&log);
        child
            .push_dispose(move || log2.lock().push("child:chain".to_string()))
            .unwrap();

        child.dispose().unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "child:before-dispose",
                "grandchild:before-dispose",
                "grandchild:dispose",
                "grandchild:after-dispose",
                "child:chain",
                "child:dispose",
                "child:after-dispose",
            ]
        );
        assert!(child.is_disposed());
        assert!(grandchild.is_disposed());
        assert!(root.children().is_empty());
        assert!(matches!(child.dispose(), Err(ContextError::Disposed(_))));
        assert!(matches!(child.group([1]), Err(ContextError::Disposed(_))));
    }

    #[test]
    fn test_listener_disposer() {
        let root = Context::builder().build();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let disposer = root
            .on("tick", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .unwrap();

        root.emit("tick", &Payload::None).unwrap();
        assert!(disposer.dispose());
        root.emit("tick", &Payload::None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(root.listener_count("tick"), 0);
    }

    #[test]
    fn test_root_dispose_marks_disposed() {
        let root = Context::builder().build();
        let child = root.group([1]).unwrap();
        root.dispose().unwrap();
        assert!(root.is_disposed());
        assert!(child.is_disposed());
        assert!(root.children().is_empty());
        assert!(root.on("x", |_| Ok(None)).is_err());
    }

    struct Everywhere;

    impl Session for Everywhere {
        fn protocol(&self) -> &str {
            "onebot"
        }

        fn event_name(&self) -> &str {
            "message"
        }

        fn field(&self, _key: &str) -> Option<serde_json::Value> {
            None
        }

        fn match_context(&self, _ctx: &Context) -> Option<bool> {
            Some(true)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_disposed_context_rejects_overriding_session() {
        let root = Context::builder().build();
        let group = root.group([1]).unwrap();
        assert!(group.accepts(&Everywhere));

        group.dispose().unwrap();
        assert!(!group.accepts(&Everywhere));
        assert!(root.accepts(&Everywhere));
    }

    #[tokio::test]
    async fn test_lifecycle_hook_runs_immediately_when_passed() {
        let root = Context::builder().build();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        root.after_ready(move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        root.set_lifecycle(|l| l.ready = true);
        let h = Arc::clone(&hits);
        root.after_ready(move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(10, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        root.emit_sync(names::AFTER_READY, Payload::None)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }
}
