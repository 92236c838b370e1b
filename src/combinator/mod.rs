//! Combinators built strictly on top of the task-group contract.

use crate::error::{Error, ErrorKind};
use crate::group::{task_group, ChildHandle};
use crate::time::sleep;
use std::future::Future;
use std::time::Duration;

/// Runs every future concurrently and returns their results in input
/// order.
///
/// Opens a group, spawns one child per future, and closes the group. The
/// first non-cancellation failure cancels the remaining children and is
/// returned. `gather(vec![])` returns an empty vec without suspending.
pub async fn gather<T, F>(futures: Vec<F>) -> Result<Vec<T>, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let handles = task_group(|group| async move {
        let mut handles = Vec::with_capacity(futures.len());
        for future in futures {
            handles.push(group.spawn(future)?);
        }
        Ok(handles)
    })
    .await?;
    handles.into_iter().map(ChildHandle::harvest).collect()
}

/// Bounds `future` to complete within `duration`.
///
/// Expressed on the group contract: the guarded future runs next to a
/// sibling that sleeps and then fails the group with `DeadlineExceeded`.
/// On inner completion the sibling is cancelled; on expiry the guarded
/// future observes `Cancelled` at its next suspension point and the
/// deadline failure is re-raised at the scope boundary.
pub async fn timeout<T, F>(duration: Duration, future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    task_group(move |group| async move {
        let guarded = group.spawn(future)?;
        let deadline = group.spawn(async move {
            sleep(duration).await?;
            Err::<(), Error>(
                Error::new(ErrorKind::DeadlineExceeded).with_message("timeout elapsed"),
            )
        })?;
        let result = guarded.join().await;
        deadline.cancel();
        result
    })
    .await
}
