//! Onion-style middleware.
//!
//! A middleware receives the session and a [`Next`] handle. Awaiting
//! `next.run()` hands control to the rest of the chain; returning without
//! calling it stops the chain there.
//!
//! ```rust,ignore
//! ctx.middleware(
//!     Middleware::new(|session, next| async move {
//!         let started = Instant::now();
//!         next.run().await?;
//!         debug!(elapsed = ?started.elapsed(), protocol = session.protocol(), "handled");
//!         Ok(())
//!     }),
//!     false,
//! )?;
//! ```
//!
//! [`MiddlewareChain`] runs a resolved list as a `tower::Service`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use tower::Service;
use tracing::debug;

use crate::context::Context;
use crate::dispose::Disposer;
use crate::error::{BoxError, ContextResult};
use crate::session::SessionRef;

type MiddlewareFn = dyn Fn(SessionRef, Next) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// A shared middleware function. Identity is pointer identity.
#[derive(Clone)]
pub struct Middleware(Arc<MiddlewareFn>);

impl Middleware {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(SessionRef, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self(Arc::new(move |session, next| Box::pin(f(session, next))))
    }

    pub fn ptr_eq(&self, other: &Middleware) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Middleware({:p})", Arc::as_ptr(&self.0))
    }
}

/// The remainder of a middleware chain.
pub struct Next {
    chain: Arc<[Middleware]>,
    index: usize,
    session: SessionRef,
}

impl Next {
    /// Runs the next middleware, or resolves immediately at the end.
    pub fn run(self) -> BoxFuture<'static, Result<(), BoxError>> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: Arc::clone(&self.chain),
                    index: self.index + 1,
                    session: Arc::clone(&self.session),
                };
                (middleware.0)(self.session, next)
            }
            None => Box::pin(async { Ok(()) }),
        }
    }

    /// How many middlewares are still ahead.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }
}

/// A resolved middleware list as a tower service.
#[derive(Clone)]
pub struct MiddlewareChain {
    chain: Arc<[Middleware]>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Middleware>) -> Self {
        Self {
            chain: middlewares.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs the chain for `session`.
    pub fn run(&self, session: SessionRef) -> BoxFuture<'static, Result<(), BoxError>> {
        Next {
            chain: Arc::clone(&self.chain),
            index: 0,
            session,
        }
        .run()
    }
}

impl Service<SessionRef> for MiddlewareChain {
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, session: SessionRef) -> Self::Future {
        self.run(session)
    }
}

impl Context {
    /// Adds a middleware, at the front when `prepend` is set.
    pub fn middleware(&self, middleware: Middleware, prepend: bool) -> ContextResult<Disposer> {
        self.with_node_mut(|node| match prepend {
            true => node.middlewares.insert(0, middleware.clone()),
            false => node.middlewares.push(middleware.clone()),
        })?;
        debug!(context = %self.id(), prepend, "Middleware added");
        self.push_node_teardown(move |node| {
            node.middlewares.retain(|m| !m.ptr_eq(&middleware));
        })
    }

    /// Runs every middleware visible to `session`, in order.
    ///
    /// The middleware list is resolved when this is called.
    pub fn run_middlewares(&self, session: SessionRef) -> BoxFuture<'static, Result<(), BoxError>> {
        MiddlewareChain::new(self.support_middlewares(session.as_ref())).run(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRecord;
    use tower::ServiceExt;
    use parking_lot::Mutex;

    fn tagged(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Middleware {
        let log = Arc::clone(log);
        Middleware::new(move |_, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{tag}:in"));
                next.run().await?;
                log.lock().push(format!("{tag}:out"));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_onion_order_and_prepend() {
        let root = Context::builder().build();
        let log = Arc::new(Mutex::new(Vec::new()));
        root.middleware(tagged(&log, "b"), false).unwrap();
        root.middleware(tagged(&log, "a"), true).unwrap();

        let session = SessionRecord::new("onebot", "message").into_ref();
        root.run_middlewares(session).await.unwrap();
        assert_eq!(*log.lock(), vec!["a:in", "b:in", "b:out", "a:out"]);
    }

    #[test]
    fn test_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Middleware::new(|_, _next| async { Ok(()) });
        let chain = MiddlewareChain::new(vec![stop, tagged(&log, "never")]);

        let session = SessionRecord::new("onebot", "message").into_ref();
        tokio_test::assert_ok!(tokio_test::block_on(chain.oneshot(session)));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_disposer_removes_middleware() {
        let root = Context::builder().build();
        let mw = Middleware::new(|_, next| next.run());
        let disposer = root.middleware(mw, false).unwrap();
        assert_eq!(root.middleware_list().len(), 1);
        disposer.dispose();
        assert!(root.middleware_list().is_empty());
    }
}
