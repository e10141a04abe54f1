//! Reference-counted shared resource with explicit leases.
//!
//! The value is created by the first owner, handed out through [`Lease`] tokens, and dropped as
//! soon as the last lease is released. Waiters block on a condition variable until every lease is
//! gone.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Unique identifier of one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseToken(u64);

impl LeaseToken {
    /// Raw token value.
    pub fn get(self) -> u64 {
        self.0
    }
}

struct State<T> {
    value: Option<Arc<T>>,
    owners: Vec<LeaseToken>,
    next_token: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    released: Condvar,
}

impl<T> Inner<T> {
    fn release(&self, token: LeaseToken) {
        let mut state = self.state.lock();
        state.owners.retain(|owner| *owner != token);
        if state.owners.is_empty() {
            state.value = None;
            self.released.notify_all();
        }
    }
}

/// Lazily created value shared by explicit owners.
pub struct SharedResource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> SharedResource<T> {
    /// Create an empty resource; nothing is allocated until the first acquire.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value: None,
                    owners: Vec::new(),
                    next_token: 1,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Acquire a lease, building the value with `create` when no owner holds it.
    pub fn acquire_with<E>(&self, create: impl FnOnce() -> Result<T, E>) -> Result<Lease<T>, E> {
        let mut state = self.inner.state.lock();
        let value = match &state.value {
            Some(value) => value.clone(),
            None => {
                let value = Arc::new(create()?);
                state.value = Some(value.clone());
                value
            }
        };
        let token = LeaseToken(state.next_token);
        state.next_token += 1;
        state.owners.push(token);
        Ok(Lease {
            value,
            token,
            inner: self.inner.clone(),
        })
    }

    /// Number of outstanding leases.
    pub fn owners(&self) -> usize {
        self.inner.state.lock().owners.len()
    }

    /// Whether the value is currently alive.
    pub fn is_live(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    /// Block until no lease is outstanding or `timeout` elapses. Returns `true` when released.
    pub fn wait_for_no_owners(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.owners.is_empty() {
            if self.inner.released.wait_until(&mut state, deadline).timed_out() {
                return state.owners.is_empty();
            }
        }
        true
    }
}

impl<T> Default for SharedResource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SharedResource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedResource")
            .field("live", &state.value.is_some())
            .field("owners", &state.owners.len())
            .finish()
    }
}

/// Ownership token for a [`SharedResource`] value. Dropping it releases ownership.
pub struct Lease<T> {
    value: Arc<T>,
    token: LeaseToken,
    inner: Arc<Inner<T>>,
}

impl<T> Lease<T> {
    /// Token identifying this lease.
    pub fn token(&self) -> LeaseToken {
        self.token
    }

    /// Release ownership explicitly.
    pub fn release(self) {}
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.inner.release(self.token);
    }
}
