//! soloio: a minimal single-threaded cooperative async runtime.
//!
//! One event loop multiplexes many logical tasks onto the calling thread,
//! suspending them at explicit points — timers, I/O readiness, yields, and
//! joins — and resuming them when the world is ready. There is no
//! parallelism, no preemption, and no work stealing: exactly one task runs
//! at a time, and only the primitives in this crate suspend.
//!
//! - [`runtime`]: the event loop, [`run`], and [`yield_now`]
//! - [`group`]: structured-concurrency task groups with cancellation
//!   fan-out and first-failure propagation
//! - [`time`]: [`sleep`]
//! - [`io`]: readiness-based [`read`] and [`write`]
//! - [`combinator`]: [`gather`] and [`timeout`], built on the group
//!   contract
//! - [`error`]: the typed [`Error`] used throughout, with cancellation as
//!   a first-class kind
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let result = soloio::run(async {
//!     soloio::task_group(|g| async move {
//!         let child = g.spawn(async {
//!             soloio::sleep(Duration::from_millis(10)).await?;
//!             Ok(21)
//!         })?;
//!         let value = child.join().await?;
//!         Ok(value * 2)
//!     })
//!     .await
//! });
//! assert_eq!(result.unwrap(), 42);
//! ```

pub mod combinator;
pub mod error;
pub mod group;
pub mod io;
pub mod runtime;
pub mod time;

mod task;

#[cfg(test)]
pub mod test_utils;

pub use combinator::{gather, timeout};
pub use error::{Error, ErrorKind};
pub use group::{task_group, ChildHandle, GroupHandle};
pub use io::{read, write};
pub use runtime::{run, yield_now};
pub use task::TaskId;
pub use time::sleep;
