//! Context-owned timers.
//!
//! Timers are tokio tasks. Disposing the owning context (or the returned
//! [`Disposer`]) aborts the task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use super::Context;
use crate::dispose::Disposer;
use crate::error::{ContextError, ContextResult};

impl Context {
    /// Runs `callback` once after `delay`.
    ///
    /// The timer leaves the dispose chain as soon as it fires, before the
    /// callback runs.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> ContextResult<Disposer>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;

        let slot: Arc<Mutex<Option<Disposer>>> = Arc::new(Mutex::new(None));
        // Held until the disposer is stored so the task cannot miss it.
        let mut guard = slot.lock();
        let task_slot = Arc::clone(&slot);
        let context = self.id();
        let task = handle.spawn(async move {
            time::sleep(delay).await;
            if let Some(disposer) = task_slot.lock().take() {
                disposer.detach();
            }
            trace!(%context, "Timeout fired");
            callback();
        });
        let abort = task.abort_handle();
        let disposer = chain.push(move || abort.abort());
        *guard = Some(disposer.clone());
        drop(guard);
        Ok(disposer)
    }

    /// Runs `callback` every `period`, first after one full period.
    pub fn set_interval<F>(&self, period: Duration, callback: F) -> ContextResult<Disposer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        let chain = self.with_node(|node| Arc::clone(&node.disposes))?;

        let task = handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        let abort = task.abort_handle();
        Ok(chain.push(move || abort.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timers_need_runtime() {
        let root = Context::builder().build();
        assert!(matches!(
            root.set_timeout(Duration::from_millis(1), || {}),
            Err(ContextError::NoRuntime)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_detaches_after_firing() {
        let root = Context::builder().build();
        let ctx = root.group([1]).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let disposer = ctx
            .set_timeout(Duration::from_millis(50), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(disposer.is_pending());

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!disposer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_timers() {
        let root = Context::builder().build();
        let ctx = root.group([1]).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        ctx.set_timeout(Duration::from_millis(50), move || {
            h.fetch_add(100, Ordering::SeqCst);
        })
        .unwrap();
        let h = Arc::clone(&hits);
        ctx.set_interval(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        time::sleep(Duration::from_millis(35)).await;
        let ticks = hits.load(Ordering::SeqCst);
        assert!((2..=3).contains(&ticks));

        ctx.dispose().unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), ticks);
    }
}
