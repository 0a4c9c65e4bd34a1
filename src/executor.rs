//! Task posting between caller threads and the event loop thread.
//!
//! Any thread may hold an [`ExecutorHandle`] and submit work to the loop.
//! Work is a closure receiving exclusive access to the [`LoopContext`] and
//! returning a future; the loop runs each future to completion before it
//! takes the next one from the queue.
//!
//! ```text
//!   caller thread                          loop thread
//!   ─────────────                          ───────────
//!   run_sync(work) ── post ──► queue ──► work(&mut ctx).await
//!        │                                     │
//!        └── ResultWaiter::wait ◄── ResultSlot::resolve
//! ```
//!
//! Ordering: work posted by one thread runs in the order it was posted.
//! Nothing is promised about interleaving between threads.

use crate::error::BridgeError;
use crate::runtime::LoopContext;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread::ThreadId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::shutdown::ShutdownController;

/// A boxed future that never leaves the loop thread.
pub type LocalFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub(crate) type Work = Box<dyn for<'a> FnOnce(&'a mut LoopContext) -> LocalFuture<'a, ()> + Send>;

/// Cloneable, thread-safe handle used to submit work to the event loop.
#[derive(Clone)]
pub struct ExecutorHandle {
    queue: mpsc::UnboundedSender<Work>,
    shutdown: ShutdownController,
    loop_thread: Arc<OnceLock<ThreadId>>,
}

impl core::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("state", &self.shutdown.state())
            .field("loop_thread", &self.loop_thread.get())
            .finish()
    }
}

impl ExecutorHandle {
    pub(crate) fn new(queue: mpsc::UnboundedSender<Work>, shutdown: ShutdownController) -> Self {
        Self {
            queue,
            shutdown,
            loop_thread: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn bind_loop_thread(&self, id: ThreadId) {
        let _ = self.loop_thread.set(id);
    }

    /// True when called from the event loop thread.
    pub fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&std::thread::current().id())
    }

    /// Fire-and-forget submission. Rejected once shutdown has begun.
    pub fn post<F>(&self, work: F) -> Result<(), BridgeError>
    where
        F: for<'a> FnOnce(&'a mut LoopContext) -> LocalFuture<'a, ()> + Send + 'static,
    {
        if !self.shutdown.is_armed() {
            return Err(BridgeError::ShuttingDown);
        }
        self.queue.send(Box::new(work)).map_err(|_| {
            if self.shutdown.is_armed() {
                BridgeError::LoopStopped
            } else {
                BridgeError::ShuttingDown
            }
        })
    }

    /// Posts `work` and blocks the calling thread until it has run on the
    /// loop thread, returning its output.
    ///
    /// Must not be called from the loop thread (it would wait on itself);
    /// such calls are rejected with [`BridgeError::CalledFromLoopThread`].
    /// Must not be called from inside an async task either: async callers
    /// go through `tokio::task::spawn_blocking` or [`ExecutorHandle::run_async`].
    pub fn run_sync<T, F>(&self, work: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut LoopContext) -> LocalFuture<'a, T> + Send + 'static,
    {
        self.submit(work)?.wait()
    }

    /// Async counterpart of [`ExecutorHandle::run_sync`].
    pub async fn run_async<T, F>(&self, work: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut LoopContext) -> LocalFuture<'a, T> + Send + 'static,
    {
        self.submit(work)?.wait_async().await
    }

    fn submit<T, F>(&self, work: F) -> Result<ResultWaiter<T>, BridgeError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut LoopContext) -> LocalFuture<'a, T> + Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(BridgeError::CalledFromLoopThread);
        }

        let (slot, waiter) = result_slot();
        self.post(move |ctx| {
            Box::pin(async move {
                let outcome = CatchUnwind::new(async move { work(ctx).await }).await;
                slot.resolve(outcome.map_err(|_| BridgeError::TaskPanicked));
            })
        })?;
        Ok(waiter)
    }
}

/// Write half of a single-resolution result slot. Resolving consumes it.
pub struct ResultSlot<T> {
    tx: oneshot::Sender<Result<T, BridgeError>>,
}

/// Read half of a single-resolution result slot. Waiting consumes it.
pub struct ResultWaiter<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

pub fn result_slot<T>() -> (ResultSlot<T>, ResultWaiter<T>) {
    let (tx, rx) = oneshot::channel();
    (ResultSlot { tx }, ResultWaiter { rx })
}

impl<T> ResultSlot<T> {
    pub fn resolve(self, outcome: Result<T, BridgeError>) {
        if self.tx.send(outcome).is_err() {
            debug!("result slot resolved after its waiter went away");
        }
    }
}

impl<T> ResultWaiter<T> {
    /// Blocks the current thread. A slot dropped without being resolved
    /// yields [`BridgeError::Abandoned`].
    pub fn wait(self) -> Result<T, BridgeError> {
        self.rx.blocking_recv().unwrap_or(Err(BridgeError::Abandoned))
    }

    pub async fn wait_async(self) -> Result<T, BridgeError> {
        self.rx.await.unwrap_or(Err(BridgeError::Abandoned))
    }
}

/// Resolves to `Err` with the panic payload if the inner future panics.
struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    fn new(inner: F) -> Self {
        Self { inner: Box::pin(inner) }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}
