//! FIFO serialization of cache operations.
//!
//! Every public cache operation is funneled through an [`OperationQueue`] so
//! that read-modify-write sequences (tag index updates in particular) never
//! interleave. The queue is a chain of shared futures: each enqueued
//! operation waits for the previous tail, then runs, then releases its own
//! slot. A failing, panicking or dropped operation still releases its slot,
//! so one bad caller cannot stall the chain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

type Tail = Shared<BoxFuture<'static, ()>>;

struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs enqueued operations one at a time in enqueue order.
pub struct OperationQueue {
    tail: Mutex<Tail>,
    pending: Arc<AtomicUsize>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(futures_util::future::ready(()).boxed().shared()),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve the next slot and return a future that runs `op` in it.
    ///
    /// The slot is taken when `enqueue` is called, not when the returned
    /// future is first polled, so two calls made in sequence always run in
    /// that sequence. The operation's own result, success or error, is
    /// returned unchanged.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> impl Future<Output = T> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let prev = {
            let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            let prev = tail.clone();
            let chained = prev.clone();
            // First polling a tail also polls every unpolled predecessor, so
            // poll depth is bounded by the number of pending operations.
            *tail = async move {
                chained.await;
                // Resolves on send or when the sender is dropped.
                let _ = done_rx.await;
            }
            .boxed()
            .shared();
            prev
        };
        let guard = PendingGuard::new(Arc::clone(&self.pending));

        async move {
            let _guard = guard;
            let _slot = done_tx;
            prev.await;
            op().await
        }
    }

    /// Operations enqueued and not yet finished, including the running one.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("pending", &self.pending())
            .finish()
    }
}
