//! Single-write future values.
//!
//! A [`FutureValue`] is Pending until its [`Promise`] publishes a value,
//! then Resolved forever. Publishing is a compare-and-publish on a
//! `OnceLock`; listeners are taken under a short lock and called after it
//! is released, so a listener may freely register more listeners.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use crate::sync::lock;

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct FutureState<T> {
    value: OnceLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> FutureState<T> {
    fn new() -> Self {
        Self {
            value: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

/// Handle to a value that is produced once, possibly on another thread.
pub struct FutureValue<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Clone for FutureValue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for FutureValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.value.get() {
            Some(v) => f.debug_tuple("FutureValue::Resolved").field(v).finish(),
            None => write!(f, "FutureValue::Pending"),
        }
    }
}

/// Write side of a pending [`FutureValue`].
pub struct Promise<T> {
    state: Arc<FutureState<T>>,
    resolved: bool,
}

impl<T: Clone + Send + Sync + 'static> FutureValue<T> {
    pub fn resolved(value: T) -> Self {
        let state = FutureState::new();
        let _ = state.value.set(value);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn pending() -> (Self, Promise<T>) {
        let state = Arc::new(FutureState::new());
        (
            Self { state: state.clone() },
            Promise { state, resolved: false },
        )
    }

    pub fn is_resolved(&self) -> bool {
        self.state.value.get().is_some()
    }

    /// Resolved values need no locking to read.
    pub fn get(&self) -> Option<&T> {
        self.state.value.get()
    }

    /// Same underlying future.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Run `f` once the value is available: immediately if resolved, else
    /// on the thread that resolves it.
    pub fn on_resolved(&self, f: impl FnOnce(&T) + Send + 'static) {
        let mut listeners = lock(&self.state.listeners);
        if let Some(v) = self.state.value.get() {
            drop(listeners);
            f(v);
            return;
        }
        listeners.push(Box::new(f));
    }

    /// Inline continuation. Keep `f` cheap; heavy work goes through the
    /// scheduler instead.
    pub fn map<U, F>(&self, f: F) -> FutureValue<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        if let Some(v) = self.get() {
            return FutureValue::resolved(f(v));
        }
        let (future, promise) = FutureValue::pending();
        self.on_resolved(move |v| {
            promise.resolve(f(v));
        });
        future
    }

    /// Continuation that itself produces a future.
    pub fn and_then<U, F>(&self, f: F) -> FutureValue<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> FutureValue<U> + Send + 'static,
    {
        if let Some(v) = self.get() {
            return f(v);
        }
        let (future, promise) = FutureValue::pending();
        self.on_resolved(move |v| {
            f(v).on_resolved(move |u| {
                promise.resolve(u.clone());
            });
        });
        future
    }

    /// Resolves once every input resolved, keeping input order.
    pub fn join_all(futures: Vec<FutureValue<T>>) -> FutureValue<Vec<T>> {
        if futures.iter().all(|f| f.is_resolved()) {
            return FutureValue::resolved(futures.iter().filter_map(|f| f.get().cloned()).collect());
        }

        let (future, promise) = FutureValue::pending();
        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        let promise = Arc::new(Mutex::new(Some(promise)));
        let inputs = Arc::new(futures);

        for input in inputs.iter() {
            let remaining = remaining.clone();
            let promise = promise.clone();
            let inputs = inputs.clone();
            input.on_resolved(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let values = inputs.iter().filter_map(|f| f.get().cloned()).collect();
                if let Some(p) = lock(&promise).take() {
                    p.resolve(values);
                }
            });
        }
        future
    }
}

impl<T> Promise<T> {
    /// Publish the value and notify listeners. Returns `false` if the
    /// future was already resolved.
    pub fn resolve(mut self, value: T) -> bool {
        self.resolved = true;
        if self.state.value.set(value).is_err() {
            tracing::warn!("Future value resolved twice, keeping the first value");
            return false;
        }
        let listeners = std::mem::take(&mut *lock(&self.state.listeners));
        if let Some(v) = self.state.value.get() {
            for listener in listeners {
                listener(v);
            }
        }
        true
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.resolved && self.state.value.get().is_none() {
            tracing::warn!("Promise dropped without resolving its future value");
        }
    }
}

impl<T: Clone + Send + Sync + 'static> std::future::Future for FutureValue<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(v) = self.get() {
            return Poll::Ready(v.clone());
        }
        let waker = cx.waker().clone();
        self.on_resolved(move |_| waker.wake());
        Poll::Pending
    }
}

/// Type-erased view used for dependency counting.
pub trait AnyFutureValue: Send + Sync {
    fn is_resolved(&self) -> bool;

    fn subscribe(&self, f: Box<dyn FnOnce() + Send>);
}

impl<T: Clone + Send + Sync + 'static> AnyFutureValue for FutureValue<T> {
    fn is_resolved(&self) -> bool {
        FutureValue::is_resolved(self)
    }

    fn subscribe(&self, f: Box<dyn FnOnce() + Send>) {
        self.on_resolved(move |_| f());
    }
}
