// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A single-shot wakeup shared between several notifiers.

A waiting task parks on one continuation, but it can be woken by more than one party
(the gate handing over its permit, a cancellation token firing, the gate closing).  Each
party holds the same [Wakeup]; whoever fires first takes the sender, everyone later is a no-op.
*/

use std::sync::Mutex;

#[derive(Debug)]
pub(crate) struct Wakeup(Mutex<Option<r#continue::Sender<()>>>);

impl Wakeup {
    pub fn new(sender: r#continue::Sender<()>) -> Self {
        Wakeup(Mutex::new(Some(sender)))
    }

    /// Wakes the parked task.  Returns false if someone already did.
    pub fn fire(&self) -> bool {
        let take = self.0.lock().expect("Wakeup poisoned").take();
        match take {
            Some(sender) => {
                sender.send(());
                true
            }
            None => false,
        }
    }

    /// True until the wakeup has fired.
    pub fn is_pending(&self) -> bool {
        self.0.lock().expect("Wakeup poisoned").is_some()
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        //never drop a continuation unsent
        if let Ok(slot) = self.0.get_mut() {
            if let Some(sender) = slot.take() {
                sender.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Wakeup;

    #[test]
    fn fires_once() {
        let (s, r) = r#continue::continuation();
        let wakeup = Wakeup::new(s);
        assert!(wakeup.is_pending());
        assert!(wakeup.fire());
        assert!(!wakeup.is_pending());
        assert!(!wakeup.fire());
        test_executors::spin_on(r);
    }
}
