//! Readiness-based I/O suspension primitives.
//!
//! [`read`] and [`write`] suspend until the descriptor is ready, then the
//! *loop* performs a single non-blocking syscall and injects its outcome,
//! so the value delivered at the suspension point is the bytes themselves
//! (or the count written). Descriptors stay owned by the caller, who must
//! keep them open until the operation resumes or is cancelled; the loop
//! puts them into non-blocking mode at registration.

use crate::error::Error;
use crate::runtime::context;
use crate::task::{Payload, WakeRequest};
use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future returned by [`read`].
#[derive(Debug)]
pub struct Read {
    fd: RawFd,
    max: usize,
    registered: bool,
}

impl Future for Read {
    type Output = Result<Vec<u8>, Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.registered {
            match context::take_payload() {
                Ok(Payload::Bytes(bytes)) => Poll::Ready(Ok(bytes)),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for read"))),
                Err(error) => Poll::Ready(Err(error)),
            }
        } else {
            self.registered = true;
            match context::publish(WakeRequest::Readable {
                fd: self.fd,
                max: self.max,
            }) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            }
        }
    }
}

/// Suspends until `source` is readable, then reads up to `max` bytes.
///
/// The returned buffer may be shorter than `max` and is empty on EOF.
/// Exactly one OS read is performed per readiness event. On cancellation
/// raises `Cancelled` without reading.
#[must_use]
pub fn read<S: AsRawFd>(source: &S, max: usize) -> Read {
    Read {
        fd: source.as_raw_fd(),
        max,
        registered: false,
    }
}

/// Future returned by [`write`].
#[derive(Debug)]
pub struct Write {
    fd: RawFd,
    data: Option<Vec<u8>>,
}

impl Future for Write {
    type Output = Result<usize, Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.data.take() {
            Some(data) => match context::publish(WakeRequest::Writable { fd: self.fd, data }) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            },
            None => match context::take_payload() {
                Ok(Payload::Written(written)) => Poll::Ready(Ok(written)),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for write"))),
                Err(error) => Poll::Ready(Err(error)),
            },
        }
    }
}

/// Suspends until `source` is writable, then writes `data` once.
///
/// Returns the number of bytes the single non-blocking write accepted,
/// which may be less than `data.len()`. On cancellation raises
/// `Cancelled` without writing.
#[must_use]
pub fn write<S: AsRawFd>(source: &S, data: &[u8]) -> Write {
    Write {
        fd: source.as_raw_fd(),
        data: Some(data.to_vec()),
    }
}
