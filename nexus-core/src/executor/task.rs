//! Tasks, priorities and result handles.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

use crate::error::TaskError;

/// Scheduling tier of a task.  Higher tiers always run first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Number of tiers.
    pub const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Future-style handle to the outcome of a submitted task.
///
/// Either block with [`wait`](Self::wait), poll with
/// [`try_take`](Self::try_take), or `.await` it.  Dropping the handle does
/// not cancel the task; its result is simply discarded.
pub struct TaskHandle<R> {
    id: u64,
    priority: Priority,
    rx: oneshot::Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Pool-unique task id, assigned in submission order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Block the calling thread until the task finishes.
    ///
    /// Must not be called from inside an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> Result<R, TaskError> {
        self.rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Take the outcome if the task already finished.
    ///
    /// Returns `None` while it is still queued or running.  Once an outcome
    /// has been taken, later calls report [`TaskError::Cancelled`].
    pub fn try_take(&mut self) -> Option<Result<R, TaskError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskError::Cancelled)),
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Cancelled)))
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A type-erased unit of work owned by the pool until it runs.
pub(crate) struct Job {
    pub(crate) id: u64,
    pub(crate) priority: Priority,
    pub(crate) submitted_at: Instant,
    run: Box<dyn FnOnce() -> bool + Send>,
}

impl Job {
    /// Wrap `work` and pair it with the handle that will receive its outcome.
    ///
    /// Panics inside `work` are caught and delivered as
    /// [`TaskError::Panicked`]; they never unwind into the worker.
    pub(crate) fn new<F, R>(id: u64, priority: Priority, work: F) -> (Self, TaskHandle<R>)
    where
        F: FnOnce() -> Result<R, TaskError> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let run = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            let success = outcome.is_ok();
            // The submitter may have dropped its handle.
            let _ = tx.send(outcome);
            success
        });
        let job = Self {
            id,
            priority,
            submitted_at: Instant::now(),
            run,
        };
        (job, TaskHandle { id, priority, rx })
    }

    /// Execute the payload; returns `true` when it produced a value.
    pub(crate) fn run(self) -> bool {
        (self.run)()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
