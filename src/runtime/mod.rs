//! The event loop.
//!
//! One iteration drains the ready queue by stepping tasks, then blocks on
//! the readiness poller until the next timer deadline or I/O event, then
//! enqueues the wakeups that fired: I/O-ready tasks in poller report
//! order, then expired timers in heap order, then deferred yields. The
//! loop runs until the root task reaches a terminal state.
//!
//! User code never touches the loop state directly; spawns and
//! cancellations issued during a step land in the [`Shared`] request
//! buffers and are applied by the loop immediately after that step
//! (cancellations go to the head of the ready queue for prompt delivery).

pub(crate) mod context;
pub(crate) mod poller;
pub(crate) mod timer;
pub mod yield_now;

use crate::error::Error;
use crate::group::GroupState;
use crate::task::{
    erase_into_slot, new_result_slot, Injection, Payload, StepResult, Task, TaskCell, TaskId,
    TaskRef, TaskState, WakeRequest, WakeSource,
};
use poller::{Direction, Poller, ReadyWatch};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::time::{Duration, Instant};
use timer::TimerHeap;

pub use yield_now::{yield_now, YieldNow};

/// A task queued for insertion into the loop.
pub(crate) struct PendingSpawn {
    pub(crate) cell: TaskRef,
    pub(crate) future: Pin<Box<dyn Future<Output = Result<(), Error>>>>,
}

/// Request buffers filled by user code through the current-task context
/// and drained by the loop after every step.
pub(crate) struct Shared {
    next_task: u64,
    pub(crate) spawns: Vec<PendingSpawn>,
    pub(crate) cancels: Vec<TaskId>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            next_task: 0,
            spawns: Vec::new(),
            cancels: Vec::new(),
        }
    }

    pub(crate) fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        id
    }
}

/// The scheduler: ready queue, timer heap, I/O watch set, and task table.
struct EventLoop {
    shared: Rc<RefCell<Shared>>,
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<(TaskId, Injection)>,
    yields: Vec<TaskId>,
    timers: TimerHeap,
    poller: Poller,
    root: TaskId,
    root_done: bool,
}

enum IoAction {
    Read { fd: RawFd, max: usize },
    Write { fd: RawFd, data: Vec<u8> },
}

impl EventLoop {
    fn new(shared: Rc<RefCell<Shared>>, root: TaskId) -> Result<Self, Error> {
        Ok(Self {
            shared,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            yields: Vec::new(),
            timers: TimerHeap::new(),
            poller: Poller::new().map_err(Error::io)?,
            root,
            root_done: false,
        })
    }

    fn run_to_completion(&mut self) -> Result<(), Error> {
        while !self.root_done {
            self.turn()?;
        }
        Ok(())
    }

    /// One loop iteration: drain the ready queue, then wait for wakeups.
    fn turn(&mut self) -> Result<(), Error> {
        if self.ready.is_empty()
            && self.yields.is_empty()
            && self.timers.is_empty()
            && self.poller.is_empty()
        {
            return Err(Error::deadlock());
        }

        while let Some((id, injection)) = self.ready.pop_front() {
            self.step_task(id, injection);
            self.drain_requests();
            if self.root_done {
                return Ok(());
            }
        }

        let timeout = if self.yields.is_empty() {
            self.timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            // Deferred yields must run next iteration; only collect
            // already-pending readiness.
            Some(Duration::ZERO)
        };

        if timeout.is_none() && self.poller.is_empty() {
            // Nothing can produce a wakeup; the next turn reports deadlock.
            return Ok(());
        }

        tracing::trace!(?timeout, watches = self.poller.len(), "polling");
        let ready_io = self.poller.wait(timeout).map_err(Error::io)?;
        let now = Instant::now();

        for watch in ready_io {
            self.complete_io(watch);
        }
        for id in self.timers.pop_expired(now) {
            tracing::trace!(task = ?id, "timer fired");
            self.make_ready(id, Injection::Value(Payload::Unit));
        }
        for id in std::mem::take(&mut self.yields) {
            self.make_ready(id, Injection::Value(Payload::Unit));
        }
        Ok(())
    }

    fn step_task(&mut self, id: TaskId, injection: Injection) {
        let shared = self.shared.clone();
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        tracing::trace!(task = ?id, "step");
        let result = task.step(injection, &shared);
        // Tasks spawned during the step must be live before the stepped
        // task registers a wait on one of them.
        self.drain_spawns();
        match result {
            StepResult::Suspended(request) => self.register(id, request),
            StepResult::Completed => self.finish(id, Ok(())),
            StepResult::Failed(error) => self.finish(id, Err(error)),
        }
    }

    /// Registers a wakeup request for a task that just suspended.
    fn register(&mut self, id: TaskId, request: WakeRequest) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let cell = task.cell.clone();
        tracing::trace!(task = ?id, request = ?request, "suspended");
        match request {
            WakeRequest::Yield => {
                set_waiting(&cell, WakeSource::Yield);
                self.yields.push(id);
            }
            WakeRequest::Sleep(duration) => {
                set_waiting(&cell, WakeSource::Timer);
                self.timers.insert(id, Instant::now() + duration);
            }
            WakeRequest::Readable { fd, max } => {
                match self.poller.add_watch(fd, Direction::Read, id) {
                    Ok(()) => set_waiting(&cell, WakeSource::Read { fd, max }),
                    Err(error) => self
                        .ready
                        .push_back((id, Injection::Failure(Error::io(error)))),
                }
            }
            WakeRequest::Writable { fd, data } => {
                match self.poller.add_watch(fd, Direction::Write, id) {
                    Ok(()) => set_waiting(&cell, WakeSource::Write { fd, data }),
                    Err(error) => self
                        .ready
                        .push_back((id, Injection::Failure(Error::io(error)))),
                }
            }
            WakeRequest::JoinGroup(group) => {
                let drained = group.borrow().children.is_empty();
                if drained {
                    self.ready.push_back((id, Injection::Value(Payload::Unit)));
                } else {
                    group.borrow_mut().join_waiter = Some(id);
                    set_waiting(&cell, WakeSource::Group(Rc::downgrade(&group)));
                }
            }
            WakeRequest::AwaitTask(target) => {
                if let Some(target_task) = self.tasks.get(&target) {
                    target_task.cell.borrow_mut().waiters.push(id);
                    set_waiting(&cell, WakeSource::Task(target));
                } else {
                    // Target already terminal: resume on the next turn of
                    // the queue.
                    self.ready.push_back((id, Injection::Value(Payload::Unit)));
                }
            }
        }
    }

    /// Handles a terminal transition: records the result, wakes joiners,
    /// and delivers the outcome to the owning group.
    fn finish(&mut self, id: TaskId, result: Result<(), Error>) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        match &result {
            Ok(()) => tracing::debug!(task = ?id, "task completed"),
            Err(error) => tracing::debug!(task = ?id, %error, "task failed"),
        }
        let (waiters, group) = {
            let mut cell = task.cell.borrow_mut();
            cell.state = if result.is_ok() {
                TaskState::DoneOk
            } else {
                TaskState::DoneErr
            };
            cell.result = Some(result.clone());
            cell.waiting_on = None;
            cell.cancel_pending = false;
            (std::mem::take(&mut cell.waiters), cell.group.clone())
        };
        for waiter in waiters {
            self.make_ready(waiter, Injection::Value(Payload::Unit));
        }
        if let Some(group) = group.and_then(|weak| weak.upgrade()) {
            self.child_finished(&group, id, &result);
        }
        if id == self.root {
            self.root_done = true;
        }
    }

    /// Applies the group rules for a finished child: first-failure capture,
    /// fan-out cancellation, and join wakeup.
    fn child_finished(
        &mut self,
        group: &Rc<RefCell<GroupState>>,
        id: TaskId,
        result: &Result<(), Error>,
    ) {
        let mut fan_out = Vec::new();
        let mut cancel_parent = None;
        let mut wake_join = None;
        {
            let mut state = group.borrow_mut();
            state.children.retain(|child| *child != id);
            match result {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => {}
                Err(error) => {
                    if state.first_failure.is_none() {
                        tracing::debug!(task = ?id, %error, "group first failure, fanning out");
                        state.first_failure = Some(error.clone());
                        state.cancelling = true;
                        fan_out = state.children.clone();
                        if !state.body_exited {
                            cancel_parent = Some(state.parent);
                        }
                    }
                }
            }
            if state.children.is_empty() {
                wake_join = state.join_waiter.take();
            }
        }
        for child in fan_out {
            self.request_cancel(child);
        }
        if let Some(parent) = cancel_parent {
            self.request_cancel(parent);
        }
        if let Some(parent) = wake_join {
            self.make_ready(parent, Injection::Value(Payload::Unit));
        }
    }

    /// Requests cancellation of a task.
    ///
    /// Terminal tasks are untouched; a waiting task is unregistered from
    /// its wakeup source and moved to the head of the ready queue with a
    /// `Cancelled` injection; a ready task delivers the cancellation at
    /// its next step.
    fn request_cancel(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let cell = task.cell.clone();
        let source = {
            let mut c = cell.borrow_mut();
            match c.state {
                TaskState::DoneOk | TaskState::DoneErr => return,
                TaskState::Ready => {
                    tracing::debug!(task = ?id, "cancel pending delivery");
                    c.cancel_pending = true;
                    return;
                }
                TaskState::Waiting => {
                    c.state = TaskState::Ready;
                    c.waiting_on.take()
                }
            }
        };
        match source {
            Some(WakeSource::Timer) => self.timers.remove(id),
            Some(WakeSource::Yield) => self.yields.retain(|pending| *pending != id),
            Some(WakeSource::Read { fd, .. }) => self.poller.remove_watch(fd, Direction::Read),
            Some(WakeSource::Write { fd, .. }) => self.poller.remove_watch(fd, Direction::Write),
            Some(WakeSource::Group(weak)) => {
                if let Some(group) = weak.upgrade() {
                    let mut state = group.borrow_mut();
                    if state.join_waiter == Some(id) {
                        state.join_waiter = None;
                    }
                }
            }
            Some(WakeSource::Task(target)) => {
                if let Some(target_task) = self.tasks.get(&target) {
                    target_task
                        .cell
                        .borrow_mut()
                        .waiters
                        .retain(|waiter| *waiter != id);
                }
            }
            None => {}
        }
        tracing::debug!(task = ?id, "cancel delivered at suspension point");
        self.ready.push_front((id, Injection::Failure(Error::cancelled())));
    }

    /// Moves a waiting task back to the ready queue with its injection.
    fn make_ready(&mut self, id: TaskId, injection: Injection) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        {
            let mut cell = task.cell.borrow_mut();
            if cell.state != TaskState::Waiting {
                return;
            }
            cell.state = TaskState::Ready;
            cell.waiting_on = None;
        }
        self.ready.push_back((id, injection));
    }

    /// Applies buffered spawn requests issued during a step.
    fn drain_spawns(&mut self) {
        let spawns = std::mem::take(&mut self.shared.borrow_mut().spawns);
        for spawn in spawns {
            self.insert_task(spawn);
        }
    }

    /// Applies buffered spawn and cancel requests issued during a step.
    fn drain_requests(&mut self) {
        loop {
            let (spawns, cancels) = {
                let mut shared = self.shared.borrow_mut();
                (
                    std::mem::take(&mut shared.spawns),
                    std::mem::take(&mut shared.cancels),
                )
            };
            if spawns.is_empty() && cancels.is_empty() {
                break;
            }
            for spawn in spawns {
                self.insert_task(spawn);
            }
            for id in cancels {
                self.request_cancel(id);
            }
        }
    }

    fn insert_task(&mut self, spawn: PendingSpawn) {
        let id = spawn.cell.borrow().id;
        tracing::debug!(task = ?id, "task spawned");
        self.tasks.insert(id, Task::new(spawn.cell, spawn.future));
        self.ready.push_back((id, Injection::Value(Payload::Unit)));
    }

    /// Completes a ready watch: performs the single non-blocking syscall
    /// and injects its outcome, or re-arms on spurious readiness.
    fn complete_io(&mut self, watch: ReadyWatch) {
        let Some(task) = self.tasks.get(&watch.task) else {
            return;
        };
        let action = {
            let cell = task.cell.borrow();
            if cell.state != TaskState::Waiting {
                return;
            }
            // A completion earlier in this batch may have replaced the
            // watch; only act on the registration we armed.
            match (&cell.waiting_on, watch.direction) {
                (Some(WakeSource::Read { fd, max }), Direction::Read) if *fd == watch.fd => {
                    IoAction::Read { fd: *fd, max: *max }
                }
                (Some(WakeSource::Write { fd, data }), Direction::Write) if *fd == watch.fd => {
                    IoAction::Write {
                        fd: *fd,
                        data: data.clone(),
                    }
                }
                _ => return,
            }
        };
        match action {
            IoAction::Read { fd, max } => match poller::nonblocking_read(fd, max) {
                Ok(Some(bytes)) => {
                    self.poller.remove_watch(fd, Direction::Read);
                    tracing::trace!(task = ?watch.task, fd, n = bytes.len(), "read ready");
                    self.make_ready(watch.task, Injection::Value(Payload::Bytes(bytes)));
                }
                Ok(None) => {
                    let _ = self.poller.rearm(fd);
                }
                Err(error) => {
                    self.poller.remove_watch(fd, Direction::Read);
                    self.make_ready(watch.task, Injection::Failure(Error::io(error)));
                }
            },
            IoAction::Write { fd, data } => match poller::nonblocking_write(fd, &data) {
                Ok(Some(written)) => {
                    self.poller.remove_watch(fd, Direction::Write);
                    tracing::trace!(task = ?watch.task, fd, written, "write ready");
                    self.make_ready(watch.task, Injection::Value(Payload::Written(written)));
                }
                Ok(None) => {
                    let _ = self.poller.rearm(fd);
                }
                Err(error) => {
                    self.poller.remove_watch(fd, Direction::Write);
                    self.make_ready(watch.task, Injection::Failure(Error::io(error)));
                }
            },
        }
    }
}

fn set_waiting(cell: &TaskRef, source: WakeSource) {
    let mut cell = cell.borrow_mut();
    cell.state = TaskState::Waiting;
    cell.waiting_on = Some(source);
}

/// Bootstraps the loop with `future` as the root task and blocks the
/// calling thread until it is terminal.
///
/// Returns the root's result, re-raises its failure, fails with `Deadlock`
/// when no ready tasks, timers, or I/O watches remain while the root is
/// alive, and with `Misuse` when called from inside a running loop.
pub fn run<T, F>(future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let _guard = context::LoopGuard::acquire()?;
    let shared = Rc::new(RefCell::new(Shared::new()));
    let root = shared.borrow_mut().allocate_id();
    let slot = new_result_slot::<T>();
    let cell = TaskCell::new(root, None);
    let erased = erase_into_slot(future, slot.clone());

    let mut event_loop = EventLoop::new(shared, root)?;
    event_loop.tasks.insert(root, Task::new(cell, erased));
    event_loop
        .ready
        .push_back((root, Injection::Value(Payload::Unit)));
    tracing::debug!(task = ?root, "root task started");

    event_loop.run_to_completion()?;

    let result = slot.borrow_mut().take();
    match result {
        Some(result) => result,
        None => Err(Error::misuse("root task finished without a result")),
    }
}
