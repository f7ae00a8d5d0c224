//! Dispose chain.
//!
//! Every context owns a [`DisposeChain`]: an ordered list of teardown actions,
//! one per revocable registration (listener, middleware, command, service,
//! timer…). Registering returns a [`Disposer`] so the caller can revoke that
//! single registration early; disposing the whole context drains the chain.
//!
//! Guarantees:
//!
//! - Every action runs **at most once**. Running a disposer removes its action
//!   from the chain before executing it, so a later drain skips it and a second
//!   call is a no-op.
//! - Draining runs the remaining actions in registration order. A panicking
//!   action is caught and logged; the rest still run.
//! - Actions appended while the chain is draining are drained as well. Once
//!   drained the chain is closed: later pushes run their action immediately.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

/// A boxed teardown action.
pub type DisposeFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ChainState {
    next_id: u64,
    entries: VecDeque<(u64, DisposeFn)>,
    closed: bool,
}

/// Ordered list of idempotent teardown actions.
#[derive(Default)]
pub struct DisposeChain {
    state: Mutex<ChainState>,
}

impl DisposeChain {
    /// Creates an empty, open chain.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends `action` and returns the disposer revoking it.
    ///
    /// On a closed chain the action runs right away and the returned disposer
    /// is inert.
    pub fn push<F>(self: &Arc<Self>, action: F) -> Disposer
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            warn!("Registration on a disposed context, tearing it down immediately");
            run_guarded(Box::new(action));
            return Disposer::noop();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back((id, Box::new(action)));
        Disposer {
            id,
            chain: Arc::downgrade(self),
        }
    }

    /// Number of actions still pending.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the chain has been drained and closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Runs every pending action in order and closes the chain.
    ///
    /// Returns how many actions ran.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            // The lock is released before the action runs so actions may
            // register or revoke other entries.
            let next = self.state.lock().entries.pop_front();
            match next {
                Some((_, action)) => {
                    run_guarded(action);
                    count += 1;
                }
                None => break,
            }
        }
        self.state.lock().closed = true;
        trace!(count, "Dispose chain drained");
        count
    }

    fn take(&self, id: u64) -> Option<DisposeFn> {
        let mut state = self.state.lock();
        let pos = state.entries.iter().position(|(entry, _)| *entry == id)?;
        state.entries.remove(pos).map(|(_, action)| action)
    }
}

impl fmt::Debug for DisposeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DisposeChain")
            .field("pending", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn run_guarded(action: DisposeFn) {
    if catch_unwind(AssertUnwindSafe(action)).is_err() {
        warn!("Dispose action panicked, continuing with remaining actions");
    }
}

// ============================================================================
// Disposer
// ============================================================================

/// Handle revoking one registration.
///
/// Cloning a disposer yields another handle to the same registration; only
/// the first call to [`dispose`](Self::dispose) has any effect.
#[derive(Clone)]
pub struct Disposer {
    id: u64,
    chain: Weak<DisposeChain>,
}

impl Disposer {
    /// A disposer that does nothing.
    pub fn noop() -> Self {
        Self {
            id: u64::MAX,
            chain: Weak::new(),
        }
    }

    /// Runs the teardown action if it has not run yet.
    ///
    /// Returns `true` if the action ran.
    pub fn dispose(&self) -> bool {
        let action = self.chain.upgrade().and_then(|chain| chain.take(self.id));
        match action {
            Some(action) => {
                run_guarded(action);
                true
            }
            None => false,
        }
    }

    /// Removes the action from its chain **without** running it.
    ///
    /// Used by resources that have already released themselves, such as a
    /// one-shot timer that fired.
    pub fn detach(&self) -> bool {
        self.chain
            .upgrade()
            .and_then(|chain| chain.take(self.id))
            .is_some()
    }

    /// Whether the action is still pending.
    pub fn is_pending(&self) -> bool {
        self.chain.upgrade().is_some_and(|chain| {
            chain
                .state
                .lock()
                .entries
                .iter()
                .any(|(entry, _)| *entry == self.id)
        })
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}
