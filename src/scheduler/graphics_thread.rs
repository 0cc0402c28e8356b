// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::{GraphicsJob, GraphicsScheduler};
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle, ThreadId};

/**
A dedicated thread that owns the graphics context.

Jobs are drained from a channel in submission order.  Dropping the scheduler closes the channel
and joins the thread once the queue is empty.
*/
pub struct GraphicsThread {
    sender: Option<Sender<GraphicsJob>>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GraphicsThread {
    /// Spawns the graphics thread.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver): (Sender<GraphicsJob>, Receiver<GraphicsJob>) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // runs until every sender is gone
                while let Ok(job) = receiver.recv() {
                    // keep draining after a panicking job
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        logwise::error_sync!("graphics job panicked");
                    }
                }
            })?;
        Ok(GraphicsThread {
            sender: Some(sender),
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The id of the graphics thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl GraphicsScheduler for GraphicsThread {
    fn begin(&self, job: GraphicsJob) {
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            logwise::error_sync!("graphics thread is gone; job dropped");
        }
    }

    fn is_graphics_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for GraphicsThread {
    fn drop(&mut self) {
        // closing the channel ends the receive loop
        drop(self.sender.take());
        let handle = self
            .thread
            .get_mut()
            .map(|slot| slot.take())
            .unwrap_or(None);
        if let Some(handle) = handle {
            if thread::current().id() == self.thread_id {
                // can't join ourselves; the thread exits on its own once the queue drains
                return;
            }
            if handle.join().is_err() {
                logwise::error_sync!("graphics thread panicked");
            }
        }
    }
}

impl Debug for GraphicsThread {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsThread")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}
