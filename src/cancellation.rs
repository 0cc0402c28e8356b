// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Cooperative cancellation.
//!
//! A [CancellationToken] is a cheap, cloneable flag that flips exactly once.  Work checks it at
//! chunk boundaries and suspension points; parked tasks register a wakeup so they notice the flip
//! without polling.
//!
//! Tokens compose.  [CancellationToken::child] follows one parent, and [CancellationToken::linked]
//! is cancelled when *either* input is, which is how a call-scoped token is combined with the
//! loader's shutdown token.  Parents only hold weak links to their children, so a child that is
//! dropped detaches itself.  Children hold their parents strongly, so a chain stays connected as
//! long as its leaves are alive, even when the tokens in the middle have been dropped.

use crate::wakeup::Wakeup;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Error produced when a [CancellationToken] fired before the work finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

enum Listener {
    Wakeup(Weak<Wakeup>),
    Child(Weak<Shared>),
}

impl Listener {
    fn is_live(&self) -> bool {
        match self {
            Listener::Wakeup(w) => w.upgrade().is_some_and(|w| w.is_pending()),
            Listener::Child(c) => c.strong_count() > 0,
        }
    }
}

struct Shared {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    //upward links; never read, only kept alive
    _parents: Vec<Arc<Shared>>,
}

impl Shared {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let take = std::mem::take(&mut *self.listeners.lock().expect("listeners poisoned"));
        for listener in take {
            match listener {
                Listener::Wakeup(w) => {
                    if let Some(w) = w.upgrade() {
                        w.fire();
                    }
                }
                Listener::Child(c) => {
                    if let Some(c) = c.upgrade() {
                        c.cancel();
                    }
                }
            }
        }
    }

    /// Adds a listener, or fires it right away when already cancelled.
    fn listen(&self, listener: Listener) {
        {
            let mut listeners = self.listeners.lock().expect("listeners poisoned");
            //check under the lock so we can't race cancel()'s drain
            if !self.cancelled.load(Ordering::Acquire) {
                listeners.retain(Listener::is_live);
                listeners.push(listener);
                return;
            }
        }
        match listener {
            Listener::Wakeup(w) => {
                if let Some(w) = w.upgrade() {
                    w.fire();
                }
            }
            Listener::Child(c) => {
                if let Some(c) = c.upgrade() {
                    c.cancel();
                }
            }
        }
    }
}

/// A cloneable cancellation flag.
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::with_parents(Vec::new())
    }

    fn with_parents(parents: Vec<Arc<Shared>>) -> Self {
        let token = CancellationToken {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                _parents: parents,
            }),
        };
        for parent in &token.shared._parents {
            parent.listen(Listener::Child(Arc::downgrade(&token.shared)));
        }
        token
    }

    /// A token that is never cancelled unless someone cancels it.  Same as [Self::new].
    pub fn none() -> Self {
        Self::new()
    }

    /// Creates a token that is cancelled when `self` is cancelled (or when it is cancelled directly).
    pub fn child(&self) -> CancellationToken {
        Self::with_parents(vec![self.shared.clone()])
    }

    /// Creates a token that is cancelled as soon as either `a` or `b` is.
    pub fn linked(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
        Self::with_parents(vec![a.shared.clone(), b.shared.clone()])
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` if the token has fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let (s, r) = r#continue::continuation();
            let wakeup = Arc::new(Wakeup::new(s));
            self.register(&wakeup);
            r.await;
        }
    }

    /// Fires `wakeup` when the token is cancelled; immediately if it already is.
    ///
    /// Only a weak reference is kept, so the caller must hold the wakeup while parked.
    pub(crate) fn register(&self, wakeup: &Arc<Wakeup>) {
        self.shared.listen(Listener::Wakeup(Arc::downgrade(wakeup)));
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for CancellationToken {}
