//! Cascading dispatch and subtree aggregation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug_span, trace};

use super::{Context, ContextId, Node};
use crate::command::Command;
use crate::component::Component;
use crate::error::ContextResult;
use crate::event::{Payload, names};
use crate::middleware::Middleware;
use crate::plugin::Plugin;
use crate::session::{Session, SessionRef};

/// Whether `plugin` lets `session` through: enabled, granted by the bot,
/// and accepted by the plugin's own gate.
fn plugin_admits(plugin: &Plugin, session: &dyn Session) -> bool {
    plugin.is_enabled() && session.allows_plugin(plugin) && plugin.matches(session)
}

fn push_unique<T: Clone>(out: &mut Vec<T>, items: &[T], same: impl Fn(&T, &T) -> bool) {
    for item in items {
        if !out.iter().any(|seen| same(seen, item)) {
            out.push(item.clone());
        }
    }
}

impl Context {
    /// Delivers `session` down the tree as `"{protocol}.{event}"`.
    ///
    /// Depth-first from this context. Every visited node binds the session
    /// first; a node that rejects it (filter, session override, or a disabled
    /// or gated owner plugin) prunes its whole subtree. Listener errors abort
    /// the walk.
    pub fn dispatch(&self, protocol: &str, event: &str, session: SessionRef) -> ContextResult<()> {
        let span = debug_span!("dispatch", protocol, event, context = %self.id());
        let _enter = span.enter();

        let event_name = names::namespaced(protocol, event);
        let payload = Payload::Session(Arc::clone(&session));
        let mut stack = vec![self.id()];

        while let Some(id) = stack.pop() {
            let Some((bus, children, owner)) = self.shared.tree.lock().live(id).map(|node| {
                (
                    Arc::clone(&node.bus),
                    node.children.clone(),
                    node.owner_plugin(),
                )
            }) else {
                continue;
            };

            let ctx = self.handle(id);
            session.bind_context(&ctx);
            if !ctx.accepts(session.as_ref()) {
                trace!(context = %id, "Session rejected; subtree pruned");
                continue;
            }
            if let Some(plugin) = owner {
                if !plugin_admits(&plugin, session.as_ref()) {
                    trace!(context = %id, plugin = %plugin.full_name(), "Plugin gate closed");
                    continue;
                }
            }

            bus.emit(&event_name, &payload)?;
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    /// Descendants that `session` reaches, in tree order.
    ///
    /// A descendant qualifies when it accepts the session and, if it belongs
    /// to a plugin, that plugin admits the session. A rejected node hides its
    /// subtree. This context itself is not included.
    pub fn matched_contexts(&self, session: &dyn Session) -> Vec<Context> {
        let roots = self
            .shared
            .tree
            .lock()
            .live(self.id())
            .map(|node| node.children.clone())
            .unwrap_or_default();

        let mut matched = Vec::new();
        let mut stack: Vec<ContextId> = roots.into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some((children, owner)) = self
                .shared
                .tree
                .lock()
                .live(id)
                .map(|node| (node.children.clone(), node.owner_plugin()))
            else {
                continue;
            };
            let ctx = self.handle(id);
            let admitted = ctx.accepts(session)
                && owner.is_none_or(|plugin| plugin_admits(&plugin, session));
            if admitted {
                matched.push(ctx);
                stack.extend(children.into_iter().rev());
            }
        }
        matched
    }

    /// Folds `pick` over this context and every descendant, in tree order.
    fn collect_subtree<T: Clone>(
        &self,
        pick: impl Fn(&Node) -> &[T],
        same: impl Fn(&T, &T) -> bool,
    ) -> Vec<T> {
        let tree = self.shared.tree.lock();
        let mut out = Vec::new();
        for id in tree.subtree(self.id()) {
            if let Some(node) = tree.nodes.get(&id) {
                push_unique(&mut out, pick(node), &same);
            }
        }
        out
    }

    /// Folds `pick` over this context followed by the matched descendants.
    fn collect_matched<T: Clone>(
        &self,
        session: &dyn Session,
        pick: impl Fn(&Node) -> &[T],
        same: impl Fn(&T, &T) -> bool,
    ) -> Vec<T> {
        let ids: Vec<ContextId> = std::iter::once(self.id())
            .chain(self.matched_contexts(session).iter().map(Context::id))
            .collect();
        let tree = self.shared.tree.lock();
        let mut out = Vec::new();
        for id in ids {
            if let Some(node) = tree.live(id) {
                push_unique(&mut out, pick(node), &same);
            }
        }
        out
    }

    /// Every plugin mounted in this subtree.
    pub fn plugin_list(&self) -> Vec<Arc<Plugin>> {
        self.collect_subtree(|node| node.plugins.as_slice(), Arc::ptr_eq)
    }

    /// Every command registered in this subtree.
    pub fn command_list(&self) -> Vec<Arc<Command>> {
        self.collect_subtree(|node| node.commands.as_slice(), Arc::ptr_eq)
    }

    /// Every middleware registered in this subtree.
    pub fn middleware_list(&self) -> Vec<Middleware> {
        self.collect_subtree(|node| node.middlewares.as_slice(), Middleware::ptr_eq)
    }

    /// Components of this subtree; deeper registrations override shallower
    /// ones with the same name.
    pub fn component_list(&self) -> HashMap<String, Component> {
        let tree = self.shared.tree.lock();
        let mut out = HashMap::new();
        for id in tree.subtree(self.id()) {
            if let Some(node) = tree.nodes.get(&id) {
                out.extend(node.components.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }

    /// Middlewares of this context and every context `session` reaches,
    /// first-seen order, without duplicates.
    pub fn support_middlewares(&self, session: &dyn Session) -> Vec<Middleware> {
        self.collect_matched(session, |node| node.middlewares.as_slice(), Middleware::ptr_eq)
    }

    /// Commands of this context and every context `session` reaches.
    pub fn support_commands(&self, session: &dyn Session) -> Vec<Arc<Command>> {
        self.collect_matched(session, |node| node.commands.as_slice(), Arc::ptr_eq)
    }

    /// Components visible to `session`; matched descendants override this
    /// context's entries.
    pub fn support_components(&self, session: &dyn Session) -> HashMap<String, Component> {
        let ids: Vec<ContextId> = std::iter::once(self.id())
            .chain(self.matched_contexts(session).iter().map(Context::id))
            .collect();
        let tree = self.shared.tree.lock();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(node) = tree.live(id) {
                out.extend(node.components.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }

    /// Number of live contexts in the runtime, root included.
    pub fn context_count(&self) -> usize {
        self.shared.tree.lock().nodes.len()
    }
}
