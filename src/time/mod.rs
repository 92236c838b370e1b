//! Timer suspension primitive.

use crate::error::Error;
use crate::runtime::context;
use crate::task::{Payload, WakeRequest};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Future returned by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    registered: bool,
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.registered {
            match context::take_payload() {
                Ok(Payload::Unit) => Poll::Ready(Ok(())),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for sleep"))),
                Err(error) => Poll::Ready(Err(error)),
            }
        } else {
            self.registered = true;
            match context::publish(WakeRequest::Sleep(self.duration)) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            }
        }
    }
}

/// Suspends the current task for at least `duration`.
///
/// Resumes no earlier than `now + duration` (bounded above only by poll
/// granularity and scheduling). Raises `Cancelled` if the task is
/// cancelled while sleeping.
#[must_use]
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        registered: false,
    }
}
