//! Task objects and the suspension contract.
//!
//! A task wraps a suspendable computation (a pinned future) together with a
//! shared [`TaskCell`] record. The contract with the scheduler is
//! [`Task::step`]: advance the computation by exactly one poll, injecting a
//! value or a failure at the most recent suspension point, and report
//! `Completed`, `Failed`, or `Suspended(request)`.
//!
//! Suspension primitives are two-phase futures: on their first poll they
//! publish a [`WakeRequest`] into the current task's cell and return
//! `Pending`; on the resuming poll they consume the injection the scheduler
//! recorded when it made the task ready.

use crate::error::{Error, ErrorKind};
use crate::group::GroupState;
use crate::runtime::context;
use crate::runtime::Shared;
use core::fmt;
use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Identifier for a task.
///
/// Ids are allocated from a monotonically increasing counter and never
/// reused, so a stale id can always be detected as "no longer live".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the ready queue; the next step can be taken.
    Ready,
    /// Suspended on a registered wakeup source.
    Waiting,
    /// Terminated successfully.
    DoneOk,
    /// Terminated with a failure (including cancellation).
    DoneErr,
}

impl TaskState {
    /// Returns true for `DoneOk` and `DoneErr`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::DoneOk | Self::DoneErr)
    }
}

/// The successful payload injected when a wakeup fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Timer elapsed, yield completed, or a join finished.
    Unit,
    /// Bytes produced by the loop's non-blocking read (empty on EOF).
    Bytes(Vec<u8>),
    /// Number of bytes accepted by the loop's non-blocking write.
    Written(usize),
}

/// The value injected into a task when the scheduler resumes it.
#[derive(Debug, Clone)]
pub enum Injection {
    /// The wakeup fired normally; the payload is delivered at the
    /// suspension point.
    Value(Payload),
    /// The wait was terminated; the failure is raised at the suspension
    /// point.
    Failure(Error),
}

/// A wakeup request returned by a suspending step.
pub enum WakeRequest {
    /// Resume on the next loop iteration, behind everything already ready.
    Yield,
    /// Resume no earlier than now + duration.
    Sleep(Duration),
    /// Resume when `fd` is readable; the loop then reads up to `max` bytes.
    Readable {
        /// The descriptor to watch.
        fd: RawFd,
        /// Upper bound for the single non-blocking read.
        max: usize,
    },
    /// Resume when `fd` is writable; the loop then writes `data`.
    Writable {
        /// The descriptor to watch.
        fd: RawFd,
        /// Bytes for the single non-blocking write.
        data: Vec<u8>,
    },
    /// Resume when the group has no live children.
    JoinGroup(Rc<RefCell<GroupState>>),
    /// Resume when the task reaches a terminal state.
    AwaitTask(TaskId),
}

impl fmt::Debug for WakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yield => f.write_str("Yield"),
            Self::Sleep(d) => write!(f, "Sleep({d:?})"),
            Self::Readable { fd, max } => write!(f, "Readable(fd={fd}, max={max})"),
            Self::Writable { fd, data } => write!(f, "Writable(fd={fd}, len={})", data.len()),
            Self::JoinGroup(_) => f.write_str("JoinGroup"),
            Self::AwaitTask(id) => write!(f, "AwaitTask({id:?})"),
        }
    }
}

/// The wakeup source a waiting task is registered with.
///
/// This is the loop's memory of how to unregister the task if the wait is
/// terminated by cancellation.
pub(crate) enum WakeSource {
    /// Parked on the deferred-yield list.
    Yield,
    /// A live timer heap entry.
    Timer,
    /// A read watch; `max` is replayed when readiness fires.
    Read { fd: RawFd, max: usize },
    /// A write watch; `data` is replayed when readiness fires.
    Write { fd: RawFd, data: Vec<u8> },
    /// Registered as the group's join waiter.
    Group(Weak<RefCell<GroupState>>),
    /// Registered in the target task's waiter list.
    Task(TaskId),
}

impl fmt::Debug for WakeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yield => f.write_str("Yield"),
            Self::Timer => f.write_str("Timer"),
            Self::Read { fd, .. } => write!(f, "Read(fd={fd})"),
            Self::Write { fd, .. } => write!(f, "Write(fd={fd})"),
            Self::Group(_) => f.write_str("Group"),
            Self::Task(id) => write!(f, "Task({id:?})"),
        }
    }
}

/// The outcome of one step of a task.
#[derive(Debug)]
pub enum StepResult {
    /// Terminal success.
    Completed,
    /// Terminal failure (including cancellation).
    Failed(Error),
    /// The task suspended on a wakeup request.
    Suspended(WakeRequest),
}

/// The shared mutable record for one task.
///
/// The cell is reachable from the scheduler (via the task table), from the
/// primitives the task awaits (via the current-task context), and from any
/// [`ChildHandle`](crate::group::ChildHandle). It carries everything except
/// the future itself.
#[derive(Debug)]
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    /// Injection recorded for the next step; consumed by the resuming
    /// primitive.
    pub(crate) injection: Option<Injection>,
    /// Request published by a primitive during the current poll.
    pub(crate) request: Option<WakeRequest>,
    /// Registered wakeup while `Waiting`; `None` otherwise.
    pub(crate) waiting_on: Option<WakeSource>,
    /// Cancellation requested but not yet delivered.
    pub(crate) cancel_pending: bool,
    /// Whether the future has been polled at least once.
    pub(crate) polled: bool,
    /// Terminal result, retained after the task leaves the table.
    pub(crate) result: Option<Result<(), Error>>,
    /// Owning group; `None` for the root task.
    pub(crate) group: Option<Weak<RefCell<GroupState>>>,
    /// Tasks suspended on `AwaitTask(self)`.
    pub(crate) waiters: Vec<TaskId>,
}

/// Shared handle to a task cell.
pub(crate) type TaskRef = Rc<RefCell<TaskCell>>;

impl TaskCell {
    pub(crate) fn new(id: TaskId, group: Option<Weak<RefCell<GroupState>>>) -> TaskRef {
        Rc::new(RefCell::new(Self {
            id,
            state: TaskState::Ready,
            injection: None,
            request: None,
            waiting_on: None,
            cancel_pending: false,
            polled: false,
            result: None,
            group,
            waiters: Vec::new(),
        }))
    }
}

/// A task owned by the event loop: the future plus its cell.
pub(crate) struct Task {
    pub(crate) cell: TaskRef,
    pub(crate) future: Pin<Box<dyn Future<Output = Result<(), Error>>>>,
}

impl Task {
    pub(crate) fn new(cell: TaskRef, future: Pin<Box<dyn Future<Output = Result<(), Error>>>>) -> Self {
        Self { cell, future }
    }

    /// Advances the computation from its most recent suspension point.
    ///
    /// A pending cancellation supersedes the recorded injection and is
    /// delivered as a `Cancelled` failure; a task that has never been
    /// polled short-circuits to `Failed` without running.
    pub(crate) fn step(&mut self, injection: Injection, shared: &Rc<RefCell<Shared>>) -> StepResult {
        {
            let mut cell = self.cell.borrow_mut();
            if cell.cancel_pending {
                cell.cancel_pending = false;
                if !cell.polled {
                    tracing::trace!(task = ?cell.id, "cancelled before first step");
                    return StepResult::Failed(Error::cancelled());
                }
                cell.injection = Some(Injection::Failure(Error::cancelled()));
            } else {
                cell.injection = Some(injection);
            }
            cell.polled = true;
            cell.request = None;
        }

        let waker = noop_waker();
        let mut poll_cx = Context::from_waker(&waker);
        let poll = context::enter(&self.cell, shared, || {
            self.future.as_mut().poll(&mut poll_cx)
        });

        match poll {
            Poll::Ready(Ok(())) => StepResult::Completed,
            Poll::Ready(Err(error)) => StepResult::Failed(error),
            Poll::Pending => match self.cell.borrow_mut().request.take() {
                Some(request) => StepResult::Suspended(request),
                None => StepResult::Failed(
                    Error::new(ErrorKind::Misuse)
                        .with_message("task suspended on a foreign future"),
                ),
            },
        }
    }
}

/// Slot receiving the typed result of a wrapped computation.
///
/// The scheduler sees only `Result<(), Error>`; the typed value travels
/// through the slot to whoever holds the other end (a child handle or
/// `run` itself).
pub(crate) type ResultSlot<T> = Rc<RefCell<Option<Result<T, Error>>>>;

pub(crate) fn new_result_slot<T>() -> ResultSlot<T> {
    Rc::new(RefCell::new(None))
}

/// Wraps a typed future so its output lands in `slot` while the scheduler
/// observes only success or failure.
pub(crate) fn erase_into_slot<T, F>(
    future: F,
    slot: ResultSlot<T>,
) -> Pin<Box<dyn Future<Output = Result<(), Error>>>>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    Box::pin(async move {
        match future.await {
            Ok(value) => {
                *slot.borrow_mut() = Some(Ok(value));
                Ok(())
            }
            Err(error) => {
                *slot.borrow_mut() = Some(Err(error.clone()));
                Err(error)
            }
        }
    })
}

struct NoopWaker;

impl std::task::Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// The scheduler never sleeps on wakers; readiness flows through the wake
/// request protocol instead.
fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWaker))
}
