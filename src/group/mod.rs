//! Structured concurrency task groups.
//!
//! A group is a scoped owner of child tasks: the scope body spawns
//! children through a [`GroupHandle`], and the scope does not exit until
//! every child is done. The first non-cancellation failure observed —
//! from a child or from the body itself — wins: it cancels every other
//! live child (and the parent body, if it is still running) and is
//! re-raised when the scope closes. Later failures from children that are
//! cleaning up are discarded.
//!
//! ```ignore
//! let value = task_group(|g| async move {
//!     let child = g.spawn(async { Ok(2) })?;
//!     let doubled = child.join().await? * 2;
//!     Ok(doubled)
//! })
//! .await?;
//! ```
//!
//! Cancellation is cooperative: a cancelled child observes `Cancelled` at
//! its next suspension point and may keep awaiting during cleanup; those
//! cleanup awaits are not cancelled again unless a new cancellation is
//! issued.

use crate::error::Error;
use crate::runtime::context;
use crate::runtime::PendingSpawn;
use crate::task::{
    erase_into_slot, new_result_slot, Payload, ResultSlot, TaskCell, TaskId, TaskRef, WakeRequest,
};
use core::fmt;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Scheduler-side record for one task group.
#[derive(Debug)]
pub(crate) struct GroupState {
    /// Live (non-terminal) children.
    pub(crate) children: Vec<TaskId>,
    /// The task that opened the group.
    pub(crate) parent: TaskId,
    /// First non-cancellation failure observed; write-once.
    pub(crate) first_failure: Option<Error>,
    /// True once fan-out cancellation has begun.
    pub(crate) cancelling: bool,
    /// True once the scope body has returned and the join has begun.
    pub(crate) body_exited: bool,
    /// The parent task while it is suspended on the group join.
    pub(crate) join_waiter: Option<TaskId>,
}

/// Handle for spawning children into an open task group.
///
/// Cheap to clone; all clones refer to the same group.
#[derive(Clone)]
pub struct GroupHandle {
    state: Rc<RefCell<GroupState>>,
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("GroupHandle")
            .field("parent", &state.parent)
            .field("children", &state.children.len())
            .field("cancelling", &state.cancelling)
            .finish()
    }
}

impl GroupHandle {
    /// Opens a group bound to the currently running task.
    fn open() -> Result<Self, Error> {
        let parent = context::current_task_id()
            .map_err(|_| Error::misuse("task group opened outside a running task"))?;
        tracing::debug!(parent = ?parent, "group opened");
        Ok(Self {
            state: Rc::new(RefCell::new(GroupState {
                children: Vec::new(),
                parent,
                first_failure: None,
                cancelling: false,
                body_exited: false,
                join_waiter: None,
            })),
        })
    }

    /// Spawns a child task into this group.
    ///
    /// The child starts in the ready state and first runs when the current
    /// task next suspends. Spawning is permitted while the body runs, even
    /// after cancellation has begun; once the body has exited the group is
    /// closed and spawning is a `Misuse` error.
    pub fn spawn<T, F>(&self, future: F) -> Result<ChildHandle<T>, Error>
    where
        F: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let id = context::with_shared(|shared| shared.allocate_id())?;
        {
            let mut state = self.state.borrow_mut();
            if state.body_exited {
                return Err(Error::misuse("spawn into a closed group"));
            }
            state.children.push(id);
        }
        let slot = new_result_slot::<T>();
        let cell = TaskCell::new(id, Some(Rc::downgrade(&self.state)));
        let erased = erase_into_slot(future, slot.clone());
        context::with_shared(|shared| {
            shared.spawns.push(PendingSpawn {
                cell: cell.clone(),
                future: erased,
            });
        })?;
        tracing::debug!(task = ?id, parent = ?self.state.borrow().parent, "child spawned");
        Ok(ChildHandle { id, cell, slot })
    }

    /// Returns true once fan-out cancellation has begun.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.state.borrow().cancelling
    }

    /// Records `error` as the first failure (if none is set) and cancels
    /// every live child.
    fn record_failure_and_fan_out(&self, error: Error) {
        let targets = {
            let mut state = self.state.borrow_mut();
            if state.first_failure.is_none() {
                state.first_failure = Some(error);
            }
            state.cancelling = true;
            state.children.clone()
        };
        context::enqueue_cancels(targets);
    }

    /// Fans a received cancellation out to every live child without
    /// touching the first failure.
    fn cancel_children(&self) {
        let targets = {
            let mut state = self.state.borrow_mut();
            state.cancelling = true;
            state.children.clone()
        };
        context::enqueue_cancels(targets);
    }

    /// Runs the close protocol: join until drained, then re-raise the
    /// first failure if one was recorded.
    async fn close<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        self.state.borrow_mut().body_exited = true;
        if let Err(error) = &result {
            if !error.is_cancelled() {
                self.record_failure_and_fan_out(error.clone());
            }
        }
        loop {
            if self.state.borrow().children.is_empty() {
                break;
            }
            match JoinGroupWait::new(self.state.clone()).await {
                Ok(()) => break,
                Err(error) if error.is_cancelled() => {
                    // Cancellation at the scope boundary tears down the
                    // children; the join is then re-entered and is not
                    // cancelled again.
                    self.cancel_children();
                }
                Err(error) => return Err(error),
            }
        }
        let failure = self.state.borrow_mut().first_failure.take();
        match failure {
            Some(error) => {
                tracing::debug!(%error, "group re-raising first failure");
                Err(error)
            }
            None => result,
        }
    }
}

/// Opens a task group around `body` and joins it on every exit path.
///
/// The body receives a [`GroupHandle`] for spawning children. When the
/// body returns — successfully or not — the parent suspends until every
/// child is done. A non-cancellation body failure is a candidate first
/// failure for the group, exactly like a child failure.
///
/// Fails with `Misuse` when no task is running.
pub async fn task_group<T, F, Fut>(body: F) -> Result<T, Error>
where
    F: FnOnce(GroupHandle) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let handle = GroupHandle::open()?;
    let result = body(handle.clone()).await;
    handle.close(result).await
}

/// Handle to a spawned child task.
///
/// Dropping the handle does not cancel the child; the owning group joins
/// it regardless.
pub struct ChildHandle<T> {
    id: TaskId,
    cell: TaskRef,
    slot: ResultSlot<T>,
}

impl<T> fmt::Debug for ChildHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle").field("id", &self.id).finish()
    }
}

impl<T> ChildHandle<T> {
    /// Returns the id of the child task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true once the child has reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.borrow().state.is_terminal()
    }

    /// Requests cancellation of the child.
    ///
    /// Delivered as a `Cancelled` failure at the child's next suspension
    /// point; a no-op if the child is already done.
    pub fn cancel(&self) {
        context::enqueue_cancel(self.id);
    }

    /// Suspends until the child is terminal and returns its result.
    ///
    /// If the *awaiting* task is cancelled first, the cancellation is
    /// raised here and the child keeps running under its group.
    pub async fn join(self) -> Result<T, Error> {
        AwaitTask {
            target: self.id,
            registered: false,
        }
        .await?;
        self.harvest()
    }

    /// Takes the result of a terminal child without suspending.
    pub(crate) fn harvest(self) -> Result<T, Error> {
        let taken = self.slot.borrow_mut().take();
        if let Some(result) = taken {
            return result;
        }
        // A child cancelled before its first step never ran its body; the
        // cell still records the terminal failure.
        match self.cell.borrow().result.clone() {
            Some(Err(error)) => Err(error),
            _ => Err(Error::misuse("child task has no result yet")),
        }
    }
}

/// Future for `ChildHandle::join`: suspends until the target task is
/// terminal.
struct AwaitTask {
    target: TaskId,
    registered: bool,
}

impl Future for AwaitTask {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.registered {
            match context::take_payload() {
                Ok(Payload::Unit) => Poll::Ready(Ok(())),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for join"))),
                Err(error) => Poll::Ready(Err(error)),
            }
        } else {
            self.registered = true;
            match context::publish(WakeRequest::AwaitTask(self.target)) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            }
        }
    }
}

/// Future for the close protocol: suspends until the group has no live
/// children.
struct JoinGroupWait {
    group: Option<Rc<RefCell<GroupState>>>,
}

impl JoinGroupWait {
    fn new(group: Rc<RefCell<GroupState>>) -> Self {
        Self { group: Some(group) }
    }
}

impl Future for JoinGroupWait {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.group.take() {
            Some(group) => match context::publish(WakeRequest::JoinGroup(group)) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            },
            None => match context::take_payload() {
                Ok(Payload::Unit) => Poll::Ready(Ok(())),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for group join"))),
                Err(error) => Poll::Ready(Err(error)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Waker;

    struct NoopWaker;
    impl std::task::Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn task_group_outside_runtime_is_misuse() {
        crate::test_utils::init_test_logging();
        let mut future = Box::pin(task_group(|_g| async { Ok::<(), Error>(()) }));
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(Err(error)) => {
                assert_eq!(error.kind(), crate::ErrorKind::Misuse);
            }
            other => panic!("expected Misuse, got {other:?}"),
        }
    }
}
