//! Readiness poller over the `polling` crate.
//!
//! A thin wrapper that turns the loop's watch set — at most one watch per
//! (fd, direction) — into OS registrations and answers "which watches
//! became ready within the timeout". Read and write interest on the same
//! descriptor are merged into a single registration and re-armed with
//! `modify` as watches come and go.
//!
//! Watches are level-triggered semantically: a descriptor that is already
//! ready at registration is reported by the next wait, so a wakeup can
//! never be lost to a registration race.
//!
//! # Safety
//!
//! The `fcntl`, `read`, and `write` calls below operate on raw descriptors
//! the caller promised to keep open while a watch or operation is
//! outstanding. Each call site carries a SAFETY comment with the exact
//! invariant relied upon.
#![allow(unsafe_code)]

use crate::task::TaskId;
use polling::{Event as PollEvent, Poller as OsPoller};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Direction of an I/O watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Readiness for reading.
    Read,
    /// Readiness for writing.
    Write,
}

/// Per-descriptor registration bookkeeping.
#[derive(Debug, Default)]
struct FdWatch {
    read: Option<TaskId>,
    write: Option<TaskId>,
}

impl FdWatch {
    fn slot(&mut self, direction: Direction) -> &mut Option<TaskId> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn interest(&self, fd: RawFd) -> PollEvent {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => PollEvent::all(key(fd)),
            (true, false) => PollEvent::readable(key(fd)),
            (false, true) => PollEvent::writable(key(fd)),
            (false, false) => PollEvent::none(key(fd)),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

fn key(fd: RawFd) -> usize {
    usize::try_from(fd).unwrap_or_default()
}

/// A watch reported ready by [`Poller::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyWatch {
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
    pub(crate) task: TaskId,
}

/// The readiness poller: OS registrations plus the watch table mapping
/// readiness back to the owning task.
pub(crate) struct Poller {
    os: OsPoller,
    watches: HashMap<RawFd, FdWatch>,
    events: Vec<PollEvent>,
    watch_count: usize,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("watch_count", &self.watch_count)
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            os: OsPoller::new()?,
            watches: HashMap::new(),
            events: Vec::new(),
            watch_count: 0,
        })
    }

    /// Returns the number of live watches.
    pub(crate) fn len(&self) -> usize {
        self.watch_count
    }

    /// Returns true if no watches are registered.
    pub(crate) fn is_empty(&self) -> bool {
        self.watch_count == 0
    }

    /// Registers interest in `direction` readiness of `fd` on behalf of
    /// `task`, putting the descriptor into non-blocking mode.
    pub(crate) fn add_watch(
        &mut self,
        fd: RawFd,
        direction: Direction,
        task: TaskId,
    ) -> io::Result<()> {
        set_nonblocking(fd)?;
        let fresh = !self.watches.contains_key(&fd);
        let watch = self.watches.entry(fd).or_default();
        let slot = watch.slot(direction);
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already watched in this direction",
            ));
        }
        *slot = Some(task);
        let interest = watch.interest(fd);
        let result = if fresh {
            self.os.add(fd, interest)
        } else {
            self.os.modify(fd, interest)
        };
        if let Err(error) = result {
            // Roll back the table entry so bookkeeping matches the OS.
            if let Some(watch) = self.watches.get_mut(&fd) {
                *watch.slot(direction) = None;
                if watch.is_empty() {
                    self.watches.remove(&fd);
                }
            }
            return Err(error);
        }
        self.watch_count += 1;
        tracing::trace!(fd, ?direction, task = ?task, "watch added");
        Ok(())
    }

    /// Drops the watch for `(fd, direction)` and re-programs or deletes the
    /// OS registration.
    pub(crate) fn remove_watch(&mut self, fd: RawFd, direction: Direction) {
        let Some(watch) = self.watches.get_mut(&fd) else {
            return;
        };
        if watch.slot(direction).take().is_none() {
            return;
        }
        self.watch_count -= 1;
        if watch.is_empty() {
            self.watches.remove(&fd);
            let _ = self.os.delete(fd);
        } else {
            let interest = self.watches[&fd].interest(fd);
            let _ = self.os.modify(fd, interest);
        }
        tracing::trace!(fd, ?direction, "watch removed");
    }

    /// Re-arms the one-shot OS registration for `fd` after a spurious
    /// wakeup, leaving the watch table unchanged.
    pub(crate) fn rearm(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(watch) = self.watches.get(&fd) {
            self.os.modify(fd, watch.interest(fd))?;
        }
        Ok(())
    }

    /// Waits until a watch becomes ready or the timeout elapses.
    ///
    /// Ready watches are returned in the order the OS reported them, read
    /// direction before write direction for a descriptor that became both
    /// at once. An interrupted wait reports no events.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<SmallVec<[ReadyWatch; 8]>> {
        self.events.clear();
        match self.os.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }

        let mut ready = SmallVec::new();
        for event in &self.events {
            let fd = event.key as RawFd;
            let Some(watch) = self.watches.get(&fd) else {
                continue;
            };
            if event.readable {
                if let Some(task) = watch.read {
                    ready.push(ReadyWatch {
                        fd,
                        direction: Direction::Read,
                        task,
                    });
                }
            }
            if event.writable {
                if let Some(task) = watch.write {
                    ready.push(ReadyWatch {
                        fd,
                        direction: Direction::Write,
                        task,
                    });
                }
            }
        }
        Ok(ready)
    }
}

/// Puts `fd` into non-blocking mode.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor the caller keeps open for the duration
    // of the watch; F_GETFL/F_SETFL do not affect descriptor ownership.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        // SAFETY: same descriptor, only the O_NONBLOCK status flag changes.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Performs one non-blocking read of up to `max` bytes.
///
/// Returns `Ok(None)` when the read would block (spurious readiness) and
/// an empty buffer on EOF.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn nonblocking_read(fd: RawFd, max: usize) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; max.max(1)];
    // SAFETY: the buffer is owned, valid for `buf.len()` bytes, and the
    // caller keeps the descriptor open while the watch is outstanding.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(error);
    }
    buf.truncate((n as usize).min(max));
    Ok(Some(buf))
}

/// Performs one non-blocking write of `data`.
///
/// Returns `Ok(None)` when the write would block.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn nonblocking_write(fd: RawFd, data: &[u8]) -> io::Result<Option<usize>> {
    // SAFETY: the slice is valid for `data.len()` bytes and the caller
    // keeps the descriptor open while the watch is outstanding.
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(error);
    }
    Ok(Some(n as usize))
}
