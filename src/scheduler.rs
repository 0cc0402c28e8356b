// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Getting onto the graphics thread.

GPU backends often require you to call their APIs "in context", which is typically, though not
always, a particular thread.  The upload pipeline is written against [GraphicsScheduler], which
knows how to get work into that context, and how to give control back to the host between
time slices.

Everything that touches GPU state (buffer lifetime, shader parameters, dispatches, texture
creation) is sent through [GraphicsScheduler::run_on_graphics_thread].  Everything else
(decoding, bookkeeping) runs wherever the caller's future is polled.

Two schedulers are provided:

* [InlineScheduler]: the caller's context *is* the graphics context.  Work runs immediately.
* [GraphicsThread]: a dedicated thread owns the graphics context and drains a job queue.
*/

mod graphics_thread;

pub use graphics_thread::GraphicsThread;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A unit of work for the graphics thread.
pub type GraphicsJob = Box<dyn FnOnce() + Send + 'static>;

/// Executes work in the context that owns the graphics device.
pub trait GraphicsScheduler: Send + Sync + 'static {
    /// Queues `job` for the graphics context and returns without waiting for it.
    ///
    /// Jobs submitted from one thread run in submission order.
    fn begin(&self, job: GraphicsJob);

    /// True if the calling thread is the graphics context.
    fn is_graphics_thread(&self) -> bool;

    /// Runs `work` in the graphics context and resolves to its result.
    ///
    /// If we're already there, the work runs inline.  If `work` panics on the graphics thread,
    /// the panic is resumed in the awaiting task.
    fn run_on_graphics_thread<F, R>(&self, work: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        async move {
            if self.is_graphics_thread() {
                return work();
            }
            //carry the caller's logging context onto the graphics thread
            let prior_context = logwise::context::Context::current();
            let (s, r) = r#continue::continuation();
            let reply = Reply::new(s, dropped_job::<R>);
            self.begin(Box::new(move || {
                let c = logwise::context::Context::new_task(
                    Some(prior_context),
                    "graphics_job".to_string(),
                );
                let id = c.context_id();
                c.set_current();
                reply.send(panic::catch_unwind(AssertUnwindSafe(work)));
                logwise::context::Context::pop(id);
            }));
            match r.await {
                Ok(value) => value,
                Err(payload) => {
                    logwise::error_sync!("graphics job panicked; resuming on the caller");
                    panic::resume_unwind(payload)
                }
            }
        }
    }

    /// Cooperatively gives control back to the host.
    ///
    /// Anything already queued for the graphics context runs before we resume, and the
    /// calling task is rescheduled once by its executor.  This never blocks.
    fn yield_control(&self) -> impl Future<Output = ()> + Send {
        async move {
            if !self.is_graphics_thread() {
                self.run_on_graphics_thread(|| ()).await;
            }
            YieldNow::new().await;
        }
    }
}

/**
The sending half of a result that crosses threads.

A reply dropped without being sent, because its job was discarded or its thread went away,
delivers `fallback()` instead, so the receiving task is never left parked.
*/
pub(crate) struct Reply<T> {
    sender: Option<r#continue::Sender<T>>,
    fallback: fn() -> T,
}

impl<T> Reply<T> {
    pub(crate) fn new(sender: r#continue::Sender<T>, fallback: fn() -> T) -> Self {
        Reply {
            sender: Some(sender),
            fallback,
        }
    }

    pub(crate) fn send(mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            sender.send(value);
        }
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.send((self.fallback)());
        }
    }
}

fn dropped_job<R>() -> std::thread::Result<R> {
    Err(Box::new("graphics job was dropped before it ran"))
}

/// The caller's context is the graphics context.
///
/// Use this when the futures are polled on the thread that owns the device, or with devices that
/// don't care which thread they're called from.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl GraphicsScheduler for InlineScheduler {
    fn begin(&self, job: GraphicsJob) {
        job()
    }

    fn is_graphics_thread(&self) -> bool {
        true
    }
}

/// A future that returns `Pending` exactly once, asking to be polled again.
#[derive(Debug, Default)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        YieldNow { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
