/// Join counter over a growing tree of asynchronous work.
///
/// A propagation round starts with a handful of lookups, and every lookup
/// that resolves may start more. The number of leaves is unknown until the
/// intermediate lookups finish, so "wait for N tasks" does not work. A
/// [`TaskQueue`] instead counts outstanding units:
///
/// - [`TaskQueue::push`] increments the counter before spawning the unit
/// - a unit decrements the counter when it completes, panics, or is dropped
/// - [`TaskQueue::when_finished`] arms a callback that fires once the counter
///   is zero; [`TaskQueue::finished`] is the awaitable form
///
/// A unit that pushes more work does so before its own decrement, so the
/// counter cannot touch zero while the tree is still growing.
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send>;

struct QueueState {
    pending: AtomicUsize,
    armed: Mutex<Vec<Callback>>,
}

impl QueueState {
    fn armed(&self) -> MutexGuard<'_, Vec<Callback>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fire_if_idle(&self) {
        let callbacks = {
            let mut armed = self.armed();
            if self.pending.load(Ordering::Acquire) != 0 {
                return;
            }
            std::mem::take(&mut *armed)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// Decrements the counter when a unit ends, however it ends.
struct Completion {
    state: Arc<QueueState>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.fire_if_idle();
        }
    }
}

/// Tracks a dynamically growing set of spawned units.
///
/// Cloning is cheap; clones share the same counter, which is how running
/// units push nested work.
#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<QueueState>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(QueueState {
                pending: AtomicUsize::new(0),
                armed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn a unit of work on the tokio runtime.
    pub fn push<F>(&self, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        let completion = Completion {
            state: Arc::clone(&self.state),
        };
        tokio::spawn(async move {
            let _completion = completion;
            unit.await;
        });
    }

    /// Number of units that have not completed yet.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Run `callback` once every unit, including nested ones, has completed.
    ///
    /// Fires immediately when nothing is pending. Each armed callback fires
    /// at most once.
    pub fn when_finished<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.armed().push(Box::new(callback));
        self.state.fire_if_idle();
    }

    /// Wait until every unit, including nested ones, has completed.
    pub async fn finished(&self) {
        let (sender, receiver) = oneshot::channel();
        self.when_finished(move || {
            let _ = sender.send(());
        });
        let _ = receiver.await;
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.pending())
            .finish()
    }
}
