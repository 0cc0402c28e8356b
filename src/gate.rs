// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! A single-permit asynchronous gate.
//!
//! [AsyncGate] owns a resource and hands out at most one [Permit] to it at a time.  It is the
//! async counterpart of a mutex with a permit count of exactly one: acquiring suspends instead of
//! blocking, and a waiter can give up when its [CancellationToken] fires.
//!
//! # Overview
//!
//! The gate is either *free* or *held*.  While held, acquirers park in a queue.  When the
//! permit is released it is handed directly to the oldest waiter that is still waiting, so a
//! waiter can't be overtaken indefinitely by newcomers.  If nobody is waiting the gate becomes free.
//!
//! Releasing happens when the [Permit] is dropped, so every exit path (including unwinding)
//! gives the permit back.  A release against a gate that is already free is a benign no-op.
//!
//! [AsyncGate::close] shuts the gate down: every parked waiter is woken with
//! [AcquireError::Closed], and later acquires fail the same way.  A permit that is already out
//! stays valid until it is dropped.

use crate::cancellation::{CancellationToken, Cancelled};
use crate::wakeup::Wakeup;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why a permit could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum AcquireError {
    #[error("acquire cancelled")]
    Cancelled,
    #[error("gate closed")]
    Closed,
    /// Only from [AsyncGate::try_acquire].
    #[error("gate is held")]
    Held,
}

impl From<Cancelled> for AcquireError {
    fn from(_: Cancelled) -> Self {
        AcquireError::Cancelled
    }
}

struct Waiter {
    wakeup: Arc<Wakeup>,
    //only written under the state lock
    granted: AtomicBool,
}

#[derive(Default)]
struct GateState {
    held: bool,
    closed: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

/// An asynchronous mutual-exclusion gate with a single permit, guarding a `T`.
pub struct AsyncGate<T> {
    state: Mutex<GateState>,
    resource: UnsafeCell<T>,
    debug_label: String,
}

//safety: the resource is only reachable through a Permit, and at most one Permit exists.
unsafe impl<T: Send> Send for AsyncGate<T> {}
unsafe impl<T: Send> Sync for AsyncGate<T> {}

/// Exclusive access to the resource behind an [AsyncGate].
///
/// Dropping the permit releases the gate.
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct Permit<'a, T> {
    gate: &'a AsyncGate<T>,
    _not_sync_unless_t_is: PhantomData<&'a mut T>,
}

impl<T> AsyncGate<T> {
    pub fn new(resource: T, debug_label: impl Into<String>) -> Self {
        AsyncGate {
            state: Mutex::new(GateState::default()),
            resource: UnsafeCell::new(resource),
            debug_label: debug_label.into(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().expect("gate state poisoned")
    }

    /// Takes the permit if it is free, without waiting.
    pub fn try_acquire(&self) -> Result<Permit<'_, T>, AcquireError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(AcquireError::Closed);
        }
        if state.held {
            return Err(AcquireError::Held);
        }
        state.held = true;
        Ok(self.permit())
    }

    /// Suspends until the permit is available, the token fires, or the gate is closed.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<Permit<'_, T>, AcquireError> {
        loop {
            token.check()?;
            let (s, r) = r#continue::continuation();
            let waiter = Arc::new(Waiter {
                wakeup: Arc::new(Wakeup::new(s)),
                granted: AtomicBool::new(false),
            });
            {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(AcquireError::Closed);
                }
                if !state.held {
                    state.held = true;
                    return Ok(self.permit());
                }
                state.waiters.push_back(waiter.clone());
            }
            logwise::trace_sync!(
                "waiting on gate {label}",
                label = self.debug_label.clone()
            );
            let mut parked = Parked {
                gate: self,
                waiter,
                resolved: false,
            };
            //register after enqueueing; if the token already fired this wakes us right away
            token.register(&parked.waiter.wakeup);
            r.await;
            match parked.resolve(token) {
                Resolution::Granted => return Ok(self.permit()),
                Resolution::Failed(e) => return Err(e),
                Resolution::Retry => continue,
            }
        }
    }

    /// Closes the gate, failing every current and future waiter with [AcquireError::Closed].
    pub fn close(&self) {
        let take = {
            let mut state = self.lock_state();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in take {
            waiter.wakeup.fire();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// True while a permit is out.
    pub fn is_held(&self) -> bool {
        self.lock_state().held
    }

    /// Direct access to the resource through an exclusive borrow of the gate.
    pub fn get_mut(&mut self) -> &mut T {
        self.resource.get_mut()
    }

    fn permit(&self) -> Permit<'_, T> {
        Permit {
            gate: self,
            _not_sync_unless_t_is: PhantomData,
        }
    }

    /// Gives the permit back, handing it to the oldest live waiter if there is one.
    ///
    /// Releasing a free gate does nothing.
    pub(crate) fn release(&self) {
        let mut state = self.lock_state();
        if !state.held {
            logwise::trace_sync!(
                "release of free gate {label} ignored",
                label = self.debug_label.clone()
            );
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            //waiters woken by their token are no longer pending; skip them
            if waiter.wakeup.is_pending() {
                waiter.granted.store(true, Ordering::Release);
                drop(state);
                waiter.wakeup.fire();
                return;
            }
        }
        state.held = false;
    }
}

enum Resolution {
    Granted,
    Failed(AcquireError),
    Retry,
}

/// A queued waiter.  If the acquire future is dropped while parked, the waiter leaves the
/// queue, and a permit that was already handed to it is passed on.
struct Parked<'a, T> {
    gate: &'a AsyncGate<T>,
    waiter: Arc<Waiter>,
    resolved: bool,
}

impl<T> Parked<'_, T> {
    fn resolve(&mut self, token: &CancellationToken) -> Resolution {
        let mut state = self.gate.lock_state();
        self.resolved = true;
        if self.waiter.granted.load(Ordering::Acquire) {
            return Resolution::Granted;
        }
        state.waiters.retain(|w| !Arc::ptr_eq(w, &self.waiter));
        if state.closed {
            Resolution::Failed(AcquireError::Closed)
        } else if token.is_cancelled() {
            Resolution::Failed(AcquireError::Cancelled)
        } else {
            Resolution::Retry
        }
    }
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let granted = {
            let mut state = self.gate.lock_state();
            state.waiters.retain(|w| !Arc::ptr_eq(w, &self.waiter));
            self.waiter.granted.load(Ordering::Acquire)
        };
        if granted {
            self.gate.release();
        }
    }
}

impl<T> Permit<'_, T> {
    /// Releases the gate.  Same as dropping the permit.
    pub fn release(self) {
        drop(self)
    }
}

impl<T> Deref for Permit<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        //safety: the permit is the only path to the resource while held
        unsafe { &*self.gate.resource.get() }
    }
}

impl<T> DerefMut for Permit<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.gate.resource.get() }
    }
}

impl<T> Drop for Permit<'_, T> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

// Boilerplate implementations

impl<T> Debug for AsyncGate<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("AsyncGate")
            .field("debug_label", &self.debug_label)
            .field("held", &state.held)
            .field("closed", &state.closed)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<T> Debug for Permit<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("gate", &self.gate.debug_label)
            .finish()
    }
}
