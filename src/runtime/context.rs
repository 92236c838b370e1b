//! Thread-local execution context.
//!
//! While the loop steps a task, the task's cell and the loop's shared
//! request buffers are installed here. Suspension primitives use the
//! context to publish wakeup requests and consume injections; group
//! handles use it to queue spawns and cancellations. Everything is
//! single-threaded; the context is the only channel between user code and
//! the scheduler.

use crate::error::Error;
use crate::runtime::Shared;
use crate::task::{Injection, Payload, TaskId, TaskRef, WakeRequest};
use std::cell::RefCell;
use std::rc::Rc;

struct Current {
    cell: TaskRef,
    shared: Rc<RefCell<Shared>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
    static LOOP_ACTIVE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Installs `cell` as the current task for the duration of `f`.
///
/// Restores the previous context on exit, including on unwind, so a panic
/// in a task body cannot leave a stale context behind.
pub(crate) fn enter<R>(cell: &TaskRef, shared: &Rc<RefCell<Shared>>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Current>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT.with(|current| *current.borrow_mut() = previous);
        }
    }

    let previous = CURRENT.with(|current| {
        current.borrow_mut().replace(Current {
            cell: cell.clone(),
            shared: shared.clone(),
        })
    });
    let _restore = Restore(previous);
    f()
}

fn with_current<R>(f: impl FnOnce(&Current) -> R) -> Result<R, Error> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(f)
            .ok_or_else(|| Error::misuse("not inside a running task"))
    })
}

/// Publishes a wakeup request for the current task.
///
/// Fails with `Misuse` when called outside a running task (for example
/// when a primitive future is polled by a foreign executor).
pub(crate) fn publish(request: WakeRequest) -> Result<(), Error> {
    with_current(|current| {
        current.cell.borrow_mut().request = Some(request);
    })
}

/// Consumes the injection recorded when the current task was made ready.
///
/// Returns the payload on a normal wakeup and the failure (typically
/// `Cancelled`) when the wait was terminated.
pub(crate) fn take_payload() -> Result<Payload, Error> {
    let injection = with_current(|current| current.cell.borrow_mut().injection.take())?;
    match injection {
        Some(Injection::Value(payload)) => Ok(payload),
        Some(Injection::Failure(error)) => Err(error),
        None => Err(Error::misuse("resumed without a recorded injection")),
    }
}

/// Returns the id of the currently running task.
pub(crate) fn current_task_id() -> Result<TaskId, Error> {
    with_current(|current| current.cell.borrow().id)
}

/// Runs `f` against the loop's shared request buffers.
pub(crate) fn with_shared<R>(f: impl FnOnce(&mut Shared) -> R) -> Result<R, Error> {
    with_current(|current| f(&mut current.shared.borrow_mut()))
}

/// Queues a cancellation request for `task`, delivered by the loop right
/// after the current step. A no-op outside a running task.
pub(crate) fn enqueue_cancel(task: TaskId) {
    let _ = with_shared(|shared| shared.cancels.push(task));
}

/// Queues cancellation requests for every task in `tasks`.
pub(crate) fn enqueue_cancels(tasks: impl IntoIterator<Item = TaskId>) {
    let _ = with_shared(|shared| shared.cancels.extend(tasks));
}

/// Guard marking the loop as active on this thread.
///
/// Re-entering `run` from inside a running loop is a `Misuse` error.
pub(crate) struct LoopGuard(());

impl LoopGuard {
    pub(crate) fn acquire() -> Result<Self, Error> {
        LOOP_ACTIVE.with(|active| {
            if active.get() {
                Err(Error::misuse("run called from inside a running loop"))
            } else {
                active.set(true);
                Ok(Self(()))
            }
        })
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        LOOP_ACTIVE.with(|active| active.set(false));
    }
}
