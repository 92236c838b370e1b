//! Yield primitive.

use crate::error::Error;
use crate::runtime::context;
use crate::task::{Payload, WakeRequest};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future that yields execution back to the loop once.
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            match context::take_payload() {
                Ok(Payload::Unit) => Poll::Ready(Ok(())),
                Ok(_) => Poll::Ready(Err(Error::misuse("unexpected payload for yield"))),
                Err(error) => Poll::Ready(Err(error)),
            }
        } else {
            self.yielded = true;
            match context::publish(WakeRequest::Yield) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            }
        }
    }
}

/// Returns control to the scheduler once.
///
/// The yielding task is re-queued behind every task that is already ready,
/// so a yield loop cannot starve its peers. On cancellation the yield
/// raises `Cancelled` instead of resuming.
#[must_use]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}
