use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::util::lock_unpoisoned;

type Continuation<T> = Box<dyn FnOnce(Arc<T>) + Send>;

struct PromiseState<T> {
    value: Option<Arc<T>>,
    abandoned: bool,
    continuations: Vec<Continuation<T>>,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    ready: Condvar,
}

/// Write-once, read-many completion slot bridging a transport callback thread
/// to blocking and continuation-style consumers.
///
/// Exactly one [`Deliverer`] exists per promise. Every waiter observes the
/// same delivered value; a second delivery fails with
/// [`Error::AlreadyDelivered`] and never changes the stored value. Dropping
/// the deliverer without delivering wakes all waiters with
/// [`Error::Interrupted`].
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

pub struct Deliverer<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> (Self, Deliverer<T>) {
        let inner = Arc::new(PromiseInner {
            state: Mutex::new(PromiseState {
                value: None,
                abandoned: false,
                continuations: Vec::new(),
            }),
            ready: Condvar::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Deliverer { inner },
        )
    }

    /// Blocks the calling thread until a value is delivered.
    pub fn wait(&self) -> Result<Arc<T>, Error> {
        let mut state = lock_unpoisoned(&self.inner.state);
        loop {
            if let Some(value) = &state.value {
                return Ok(Arc::clone(value));
            }
            if state.abandoned {
                return Err(Error::Interrupted);
            }
            state = match self.inner.ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Bounded variant of [`wait`](Self::wait); `Ok(None)` means the timeout
    /// elapsed with no delivery.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Arc<T>>, Error> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = lock_unpoisoned(&self.inner.state);
        loop {
            if let Some(value) = &state.value {
                return Ok(Some(Arc::clone(value)));
            }
            if state.abandoned {
                return Err(Error::Interrupted);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match self.inner.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Non-blocking peek at the delivered value.
    pub fn try_value(&self) -> Option<Arc<T>> {
        lock_unpoisoned(&self.inner.state).value.clone()
    }

    /// Registers a continuation. If the value is already present the
    /// continuation runs immediately on the calling thread; otherwise it runs
    /// on whichever thread delivers.
    pub fn on_delivery(&self, continuation: impl FnOnce(Arc<T>) + Send + 'static) {
        let value = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match &state.value {
                Some(value) => Some(Arc::clone(value)),
                None => {
                    state.continuations.push(Box::new(continuation));
                    return;
                }
            }
        };
        if let Some(value) = value {
            continuation(value);
        }
    }
}

impl<T: Send + Sync + 'static> Deliverer<T> {
    /// Stores the value and releases all current and future waiters.
    ///
    /// A second call is a producer bug: it fails with
    /// [`Error::AlreadyDelivered`] and the originally stored value is kept.
    pub fn deliver(&self, value: T) -> Result<(), Error> {
        let value = Arc::new(value);
        let continuations = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.value.is_some() {
                return Err(Error::AlreadyDelivered);
            }
            state.value = Some(Arc::clone(&value));
            state.abandoned = false;
            std::mem::take(&mut state.continuations)
        };
        self.inner.ready.notify_all();

        for continuation in continuations {
            continuation(Arc::clone(&value));
        }
        Ok(())
    }
}

impl<T> Drop for Deliverer<T> {
    fn drop(&mut self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.value.is_none() {
            state.abandoned = true;
            state.continuations.clear();
            drop(state);
            self.inner.ready.notify_all();
        }
    }
}
