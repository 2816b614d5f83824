//! Completion futures with listener support.
//!
//! `DbFuture` carries the result of an asynchronous database operation.
//! It settles exactly once with a value, an error, or a cancellation, and
//! notifies registered listeners in registration order. `get` blocks the
//! calling thread; nothing on a session's I/O thread ever calls `get`.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::error::{DbError, Result};
use crate::session::DbSession;

/// Callback invoked when a future settles.
///
/// Listeners are plain values invoked positionally; they receive the settled
/// future and can read its outcome with [`DbFuture::try_result`].
pub type DbListener<T> = Box<dyn FnOnce(&DbFuture<T>) + Send>;

/// Hook consulted by [`DbFuture::cancel`] to decide whether cancellation is
/// permitted. Returns true when the operation was successfully cancelled.
pub type CancelHook = Box<dyn Fn(bool) -> bool + Send + Sync>;

enum Settled<T> {
    Value(T),
    Error(DbError),
    Cancelled,
}

struct State<T> {
    settled: Option<Settled<T>>,
    listeners: Vec<DbListener<T>>,
}

struct FutureInner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    cancel_hook: Mutex<Option<CancelHook>>,
}

/// A future for the result of a database operation.
pub struct DbFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for DbFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for DbFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DbFuture<T> {
    /// Create a new pending future. Without a cancellation hook, `cancel`
    /// is refused.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(State {
                    settled: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    /// Create a future already settled with a value.
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        let _ = future.set_result(value);
        future
    }

    /// Create a future already settled with an error.
    pub fn completed_err(error: DbError) -> Self {
        let future = Self::new();
        let _ = future.set_error(error);
        future
    }

    /// Install the cancellation hook. The hook decides whether a `cancel`
    /// call takes effect; it runs outside the future's own lock.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        *self.inner.cancel_hook.lock().unwrap() = Some(hook);
    }

    /// True once the future has settled (value, error, or cancellation).
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().settled.is_some()
    }

    /// True if the future settled by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().unwrap().settled,
            Some(Settled::Cancelled)
        )
    }

    /// Settle with a value. Fails with `AlreadySettled` if the future has
    /// already settled.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.settle(Settled::Value(value), "set_result on a settled future")
    }

    /// Settle with an error. Fails with `AlreadySettled` if the future has
    /// already settled.
    pub fn set_error(&self, error: DbError) -> Result<()> {
        self.settle(Settled::Error(error), "set_error on a settled future")
    }

    /// Settle as cancelled. Used by the cancellation path; fails if the
    /// future settled first.
    pub fn settle_cancelled(&self) -> Result<()> {
        self.settle(Settled::Cancelled, "cancel raced with completion")
    }

    fn settle(&self, outcome: Settled<T>, already: &str) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap();
            if state.settled.is_some() {
                return Err(DbError::AlreadySettled(already.to_string()));
            }
            state.settled = Some(outcome);
            self.inner.cond.notify_all();
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            self.run_listener(listener);
        }
        Ok(())
    }

    /// Request cancellation. Returns true when the cancellation took effect.
    ///
    /// A future that has already settled cannot be cancelled. Otherwise the
    /// installed hook decides; without a hook, cancellation is refused.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.is_done() {
            return false;
        }
        let accepted = {
            let hook = self.inner.cancel_hook.lock().unwrap();
            match hook.as_ref() {
                Some(hook) => hook(may_interrupt),
                None => false,
            }
        };
        if !accepted {
            return false;
        }
        // The hook may itself have settled the future (the request
        // cancellation path does); either way the final state is Cancelled.
        self.settle_cancelled().is_ok() || self.is_cancelled()
    }

    /// Register a completion listener. Listeners registered before the
    /// future settles run once, in registration order, when it settles;
    /// a listener registered afterwards runs synchronously on the caller.
    pub fn add_listener(&self, listener: impl FnOnce(&DbFuture<T>) + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock().unwrap();
            if state.settled.is_some() {
                true
            } else {
                state.listeners.push(Box::new(listener));
                return;
            }
        };
        if run_now {
            self.run_listener(Box::new(listener));
        }
    }

    fn run_listener(&self, listener: DbListener<T>) {
        // A panicking listener must not poison the I/O thread.
        if panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            warn!("future listener panicked; continuing");
        }
    }
}

impl<T: Clone> DbFuture<T> {
    /// Block until the future settles and return its outcome.
    pub fn get(&self) -> Result<T> {
        let mut state = self.inner.state.lock().unwrap();
        while state.settled.is_none() {
            state = self.inner.cond.wait(state).unwrap();
        }
        Self::outcome(&state)
    }

    /// Block until the future settles or the deadline passes.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while state.settled.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(DbError::Timeout);
            }
            let (next, timed_out) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if timed_out.timed_out() && state.settled.is_none() {
                return Err(DbError::Timeout);
            }
        }
        Self::outcome(&state)
    }

    /// The outcome if the future has settled, otherwise `None`.
    pub fn try_result(&self) -> Option<Result<T>> {
        let state = self.inner.state.lock().unwrap();
        state.settled.as_ref().map(|_| Self::outcome(&state))
    }

    fn outcome(state: &State<T>) -> Result<T> {
        match state.settled.as_ref().unwrap() {
            Settled::Value(v) => Ok(v.clone()),
            Settled::Error(e) => Err(e.clone()),
            Settled::Cancelled => Err(DbError::Cancelled),
        }
    }
}

/// A future that remembers which session produced it.
pub struct DbSessionFuture<T> {
    future: DbFuture<T>,
    session: Arc<DbSession>,
}

impl<T> Clone for DbSessionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            session: Arc::clone(&self.session),
        }
    }
}

impl<T> DbSessionFuture<T> {
    pub fn new(future: DbFuture<T>, session: Arc<DbSession>) -> Self {
        Self { future, session }
    }

    /// The session this future's operation ran on.
    pub fn session(&self) -> &Arc<DbSession> {
        &self.session
    }

    /// The underlying future.
    pub fn future(&self) -> &DbFuture<T> {
        &self.future
    }
}

impl<T> Deref for DbSessionFuture<T> {
    type Target = DbFuture<T>;

    fn deref(&self) -> &DbFuture<T> {
        &self.future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_result_and_get() {
        let future: DbFuture<i32> = DbFuture::new();
        assert!(!future.is_done());
        future.set_result(7).unwrap();
        assert!(future.is_done());
        assert!(!future.is_cancelled());
        assert_eq!(future.get().unwrap(), 7);
        // get is repeatable
        assert_eq!(future.get().unwrap(), 7);
    }

    #[test]
    fn test_double_settle_fails() {
        let future: DbFuture<i32> = DbFuture::new();
        future.set_result(1).unwrap();
        assert!(matches!(
            future.set_result(2),
            Err(DbError::AlreadySettled(_))
        ));
        assert!(matches!(
            future.set_error(DbError::Timeout),
            Err(DbError::AlreadySettled(_))
        ));
        assert_eq!(future.get().unwrap(), 1);
    }

    #[test]
    fn test_error_propagates_through_get() {
        let future: DbFuture<i32> = DbFuture::new();
        future.set_error(DbError::protocol("bad frame")).unwrap();
        assert!(matches!(future.get(), Err(DbError::Protocol(_))));
    }

    #[test]
    fn test_listener_before_settle_runs_once() {
        let future: DbFuture<i32> = DbFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        future.add_listener(move |f| {
            assert_eq!(f.try_result().unwrap().unwrap(), 42);
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        future.set_result(42).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_after_settle_runs_synchronously() {
        let future: DbFuture<i32> = DbFuture::new();
        future.set_result(5).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        future.add_listener(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let future: DbFuture<()> = DbFuture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            future.add_listener(move |_| order.lock().unwrap().push(i));
        }
        future.set_result(()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_listener_panic_does_not_poison() {
        let future: DbFuture<i32> = DbFuture::new();
        future.add_listener(|_| panic!("boom"));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        future.add_listener(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        future.set_result(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.get().unwrap(), 1);
    }

    #[test]
    fn test_cancel_without_hook_is_refused() {
        let future: DbFuture<i32> = DbFuture::new();
        assert!(!future.cancel(false));
        assert!(!future.is_done());
    }

    #[test]
    fn test_cancel_with_hook() {
        let future: DbFuture<i32> = DbFuture::new();
        future.set_cancel_hook(Box::new(|_| true));
        assert!(future.cancel(false));
        assert!(future.is_done());
        assert!(future.is_cancelled());
        assert!(matches!(future.get(), Err(DbError::Cancelled)));
    }

    #[test]
    fn test_cancel_after_settle_is_refused() {
        let future: DbFuture<i32> = DbFuture::new();
        future.set_cancel_hook(Box::new(|_| true));
        future.set_result(9).unwrap();
        assert!(!future.cancel(true));
        assert!(!future.is_cancelled());
    }

    #[test]
    fn test_get_timeout() {
        let future: DbFuture<i32> = DbFuture::new();
        assert!(matches!(
            future.get_timeout(Duration::from_millis(20)),
            Err(DbError::Timeout)
        ));
        future.set_result(3).unwrap();
        assert_eq!(future.get_timeout(Duration::from_millis(20)).unwrap(), 3);
    }

    #[test]
    fn test_get_blocks_until_settled_from_other_thread() {
        let future: DbFuture<i32> = DbFuture::new();
        let other = future.clone();
        let handle = std::thread::spawn(move || other.get().unwrap());
        std::thread::sleep(Duration::from_millis(10));
        future.set_result(11).unwrap();
        assert_eq!(handle.join().unwrap(), 11);
    }
}
