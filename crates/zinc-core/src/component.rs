//! Named render components.
//!
//! A component turns JSON props into text. Components are looked up by name
//! through [`Context::component_list`] or, per session,
//! [`Context::support_components`].

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::Context;
use crate::dispose::Disposer;
use crate::error::{BoxError, ContextResult};

type RenderFn = dyn Fn(&Value) -> Result<String, BoxError> + Send + Sync;

#[derive(Clone)]
pub struct Component {
    render: Arc<RenderFn>,
}

impl Component {
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(&Value) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        Self {
            render: Arc::new(render),
        }
    }

    pub fn render(&self, props: &Value) -> Result<String, BoxError> {
        (self.render)(props)
    }

    pub fn ptr_eq(&self, other: &Component) -> bool {
        Arc::ptr_eq(&self.render, &other.render)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({:p})", Arc::as_ptr(&self.render))
    }
}

impl Context {
    /// Registers `component` under `name`, replacing (with a warning) any
    /// component of the same name on this context.
    pub fn component(&self, name: impl Into<String>, component: Component) -> ContextResult<Disposer> {
        let name = name.into();
        let replaced = self.with_node_mut(|node| {
            node.components
                .insert(name.clone(), component.clone())
                .is_some()
        })?;
        if replaced {
            warn!(component = %name, context = %self.id(), "Component already exists; overwritten");
        } else {
            debug!(component = %name, context = %self.id(), "Component added");
        }
        self.push_node_teardown(move |node| {
            // A later overwrite owns the slot now.
            if node.components.get(&name).is_some_and(|c| c.ptr_eq(&component)) {
                node.components.remove(&name);
            }
        })
    }

    /// Registers a functional component from a bare render closure.
    pub fn component_fn<F>(&self, name: impl Into<String>, render: F) -> ContextResult<Disposer>
    where
        F: Fn(&Value) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.component(name, Component::new(render))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_and_overwrite() {
        let root = Context::builder().build();
        let first = root
            .component_fn("hello", |props| Ok(format!("hello {}", props["name"].as_str().unwrap_or("?"))))
            .unwrap();
        root.component_fn("hello", |_| Ok("overwritten".into()))
            .unwrap();

        let list = root.component_list();
        assert_eq!(list["hello"].render(&json!({"name": "zinc"})).unwrap(), "overwritten");

        // the first disposer no longer owns the slot
        first.dispose();
        assert!(root.component_list().contains_key("hello"));
    }

    #[test]
    fn test_disposer_removes_component() {
        let root = Context::builder().build();
        let d = root
            .component_fn("tag", |props| Ok(props.to_string()))
            .unwrap();
        assert_eq!(
            root.component_list()["tag"].render(&json!([1])).unwrap(),
            "[1]"
        );
        d.dispose();
        assert!(root.component_list().is_empty());
    }
}
