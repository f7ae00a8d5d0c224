//! The application shell around a root context.
//!
//! [`App`] owns the root [`Context`] and drives the runtime lifecycle:
//!
//! ```text
//! start:  before-ready → ready → after-ready → before-start
//!         → adapters started (registration order) → started → after-start
//! stop:   adapters stopped (reverse order) → not started
//! ```
//!
//! It also routes the protocol-agnostic `message` event into the middleware
//! chain of the root.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::{Context, ContextBuilder, ContextId};
use crate::error::{BoxError, ContextError, ContextResult};
use crate::event::{Listener, Payload, names};
use crate::filter::Role;
use crate::resolver::ModuleResolver;

pub struct AppBuilder {
    context: ContextBuilder,
}

impl AppBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.context = self.context.resolver(resolver);
        self
    }

    pub fn permissions(mut self, permissions: HashMap<String, Vec<Role>>) -> Self {
        self.context = self.context.permissions(permissions);
        self
    }

    pub fn build(self) -> ContextResult<App> {
        let root = self.context.build();
        let shared = Arc::downgrade(&root.shared);
        root.listen(
            names::MESSAGE,
            Listener::new_async(move |payload: Payload| {
                let run = shared
                    .upgrade()
                    .map(|shared| Context::from_parts(ContextId::ROOT, shared))
                    .zip(payload.session().cloned())
                    .map(|(root, session)| root.run_middlewares(session));
                async move {
                    if let Some(run) = run {
                        run.await?;
                    }
                    Ok::<Option<serde_json::Value>, BoxError>(None)
                }
            }),
        )?;
        Ok(App { root })
    }
}

/// A runtime root with lifecycle control.
pub struct App {
    root: Context,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder {
            context: Context::builder(),
        }
    }

    pub fn new() -> ContextResult<App> {
        Self::builder().build()
    }

    pub fn root(&self) -> &Context {
        &self.root
    }

    /// Runs the ready and start phases and starts every adapter.
    ///
    /// Calling `start` on a started app does nothing. A failing adapter
    /// aborts the start; adapters started before it stay running.
    pub async fn start(&self) -> ContextResult<()> {
        if self.root.is_started() {
            return Ok(());
        }
        let root = &self.root;

        root.emit_sync(names::BEFORE_READY, Payload::None).await?;
        root.set_lifecycle(|l| l.ready = true);
        root.emit_sync(names::AFTER_READY, Payload::None).await?;

        root.emit_sync(names::BEFORE_START, Payload::None).await?;
        for entry in root.shared.adapters.snapshot() {
            entry
                .adapter
                .start(root)
                .await
                .map_err(|source| ContextError::AdapterStart {
                    protocol: entry.protocol.clone(),
                    source,
                })?;
            debug!(protocol = %entry.protocol, owner = %entry.owner, "Adapter started");
        }
        root.set_lifecycle(|l| l.started = true);
        root.emit_sync(names::AFTER_START, Payload::None).await?;

        info!(
            plugins = root.plugin_list().len(),
            adapters = root.adapters().len(),
            "Runtime started"
        );
        Ok(())
    }

    /// Stops every adapter, most recently registered first.
    ///
    /// Stop failures are logged and do not keep other adapters running.
    pub async fn stop(&self) {
        for entry in self.root.shared.adapters.snapshot().into_iter().rev() {
            match entry.adapter.stop().await {
                Ok(()) => debug!(protocol = %entry.protocol, "Adapter stopped"),
                Err(error) => warn!(protocol = %entry.protocol, %error, "Adapter stop failed"),
            }
        }
        self.root.set_lifecycle(|l| l.started = false);
        info!("Runtime stopped");
    }

    /// Stops the app and disposes the whole context tree.
    pub async fn shutdown(&self) -> ContextResult<()> {
        if self.root.is_started() {
            self.stop().await;
        }
        if self.root.is_disposed() {
            return Ok(());
        }
        self.root.dispose()
    }
}

impl Deref for App {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterSource};
    use crate::middleware::Middleware;
    use crate::session::SessionRecord;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Adapter for Recording {
        async fn start(&self, _root: &Context) -> Result<(), BoxError> {
            self.log.lock().push("adapter:start".into());
            Ok(())
        }

        async fn stop(&self) -> Result<(), BoxError> {
            self.log.lock().push("adapter:stop".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_order() {
        let app = App::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        app.adapter(
            "mock",
            AdapterSource::instance(Recording {
                log: Arc::clone(&log),
            }),
            Value::Null,
        )
        .unwrap();
        for event in [
            names::BEFORE_READY,
            names::AFTER_READY,
            names::BEFORE_START,
            names::AFTER_START,
        ] {
            let log = Arc::clone(&log);
            app.on(event, move |_| {
                log.lock().push(event.to_string());
                Ok(None)
            })
            .unwrap();
        }

        app.start().await.unwrap();
        assert!(app.is_ready() && app.is_started());
        app.start().await.unwrap();
        app.shutdown().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "before-ready",
                "after-ready",
                "before-start",
                "adapter:start",
                "after-start",
                "adapter:stop",
            ]
        );
        assert!(app.is_disposed());
    }

    #[tokio::test]
    async fn test_message_runs_middlewares() {
        let app = App::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        app.middleware(
            Middleware::new(move |session, next| {
                let s = Arc::clone(&s);
                async move {
                    s.lock().push(session.protocol().to_string());
                    next.run().await
                }
            }),
            false,
        )
        .unwrap();

        let session = SessionRecord::new("onebot", "message").into_ref();
        app.emit_sync(names::MESSAGE, Payload::Session(session))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["onebot"]);
    }
}
