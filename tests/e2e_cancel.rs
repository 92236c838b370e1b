//! End-to-end cancellation scenarios: fan-out, the lost-exceptions rule,
//! cancellation idempotence, timeouts, and misuse.

#[macro_use]
mod common;

use common::{boxed, init_test_logging};
use soloio::{gather, run, sleep, task_group, timeout, yield_now, Error, ErrorKind};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

type Log = Rc<RefCell<Vec<&'static str>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// S3: a failing sibling cancels the whole group promptly; the slow
/// sibling observes `Cancelled` at its sleep and the group re-raises the
/// first failure.
#[test]
fn sibling_failure_fans_out() {
    init_test_logging();
    test_phase!("sibling_failure_fans_out");

    let log = new_log();
    let slow_log = log.clone();
    let start = Instant::now();
    let error = run(async move {
        gather(vec![
            boxed(async move {
                match sleep(Duration::from_secs(1)).await {
                    Err(error) if error.is_cancelled() => {
                        slow_log.borrow_mut().push("A cancelled");
                        Err(error)
                    }
                    other => {
                        slow_log.borrow_mut().push("A finished");
                        other
                    }
                }
            }),
            boxed(async move {
                sleep(Duration::from_millis(10)).await?;
                Err(Error::user("BOOM"))
            }),
        ])
        .await
    })
    .expect_err("group must re-raise BOOM");

    assert_eq!(error.kind(), ErrorKind::User);
    assert_eq!(error.message(), Some("BOOM"));
    assert_eq!(*log.borrow(), vec!["A cancelled"]);
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "fan-out must not wait out the 1s sleep (took {:?})",
        start.elapsed()
    );
    test_complete!("sibling_failure_fans_out");
}

/// S4: a failure raised during cancellation cleanup is discarded; only
/// the first non-cancellation failure survives.
#[test]
fn secondary_failure_is_lost() {
    init_test_logging();
    test_phase!("secondary_failure_is_lost");

    let error = run(async {
        gather(vec![
            boxed(async {
                match sleep(Duration::from_secs(1)).await {
                    Err(error) if error.is_cancelled() => Err(Error::user("X")),
                    other => other,
                }
            }),
            boxed(async { Err::<(), Error>(Error::user("Y")) }),
        ])
        .await
    })
    .expect_err("group must re-raise Y");

    assert_eq!(error.message(), Some("Y"));
    test_complete!("secondary_failure_is_lost");
}

/// Cancelling a task that already completed is a no-op, and its result
/// stays joinable.
#[test]
fn cancel_after_done_is_noop() {
    init_test_logging();
    test_phase!("cancel_after_done_is_noop");

    let value = run(async {
        task_group(|g| async move {
            let child = g.spawn(async { Ok(7) })?;
            yield_now().await?;
            assert!(child.is_finished(), "child should have run during the yield");
            child.cancel();
            child.join().await
        })
        .await
    })
    .expect("run should succeed");

    assert_eq!(value, 7);
    test_complete!("cancel_after_done_is_noop");
}

/// A child cancelled before its first step never runs its body.
#[test]
fn cancel_before_start_skips_body() {
    init_test_logging();
    test_phase!("cancel_before_start_skips_body");

    let ran = Rc::new(RefCell::new(false));
    let flag = ran.clone();
    let error = run(async move {
        task_group(|g| async move {
            let child = g.spawn(async move {
                *flag.borrow_mut() = true;
                Ok(())
            })?;
            child.cancel();
            child.join().await
        })
        .await
    })
    .expect_err("join must observe the cancellation");

    assert!(error.is_cancelled());
    assert!(!*ran.borrow(), "cancelled child must not start");
    test_complete!("cancel_before_start_skips_body");
}

/// Cancellation is one-shot: cleanup awaits after delivery run normally.
#[test]
fn cleanup_awaits_are_not_recancelled() {
    init_test_logging();
    test_phase!("cleanup_awaits_are_not_recancelled");

    let log = new_log();
    let cleanup_log = log.clone();
    let error = run(async move {
        gather(vec![
            boxed(async move {
                match sleep(Duration::from_secs(1)).await {
                    Err(error) if error.is_cancelled() => {
                        // Re-awaiting during cleanup is permitted and is
                        // not cancelled a second time.
                        sleep(Duration::from_millis(5)).await?;
                        cleanup_log.borrow_mut().push("cleanup finished");
                        Err(error)
                    }
                    other => other,
                }
            }),
            boxed(async { Err::<(), Error>(Error::user("first")) }),
        ])
        .await
    })
    .expect_err("group must re-raise the first failure");

    assert_eq!(error.message(), Some("first"));
    assert_eq!(*log.borrow(), vec!["cleanup finished"]);
    test_complete!("cleanup_awaits_are_not_recancelled");
}

/// The timeout combinator: expiry cancels the guarded future and raises
/// `DeadlineExceeded`; completion cancels the deadline sibling.
#[test]
fn timeout_expires_and_completes() {
    init_test_logging();
    test_phase!("timeout_expires_and_completes");

    test_section!("expiry");
    let start = Instant::now();
    let error = run(async {
        timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(1)).await?;
            Ok(())
        })
        .await
    })
    .expect_err("deadline must win");
    assert_eq!(error.kind(), ErrorKind::DeadlineExceeded);
    assert!(start.elapsed() < Duration::from_millis(500));

    test_section!("completion");
    let value = run(async {
        timeout(Duration::from_secs(5), async {
            sleep(Duration::from_millis(5)).await?;
            Ok(42)
        })
        .await
    })
    .expect("guarded future should win");
    assert_eq!(value, 42);
    test_complete!("timeout_expires_and_completes");
}

/// A body failure is a candidate first failure: it cancels the children
/// and is re-raised at the scope boundary.
#[test]
fn body_failure_cancels_children() {
    init_test_logging();
    test_phase!("body_failure_cancels_children");

    let log = new_log();
    let child_log = log.clone();
    let error = run(async move {
        task_group(|g| async move {
            g.spawn(async move {
                match sleep(Duration::from_secs(1)).await {
                    Err(error) if error.is_cancelled() => {
                        child_log.borrow_mut().push("child cancelled");
                        Err(error)
                    }
                    other => other,
                }
            })?;
            yield_now().await?;
            Err::<(), Error>(Error::user("body failed"))
        })
        .await
    })
    .expect_err("body failure must surface");

    assert_eq!(error.message(), Some("body failed"));
    assert_eq!(*log.borrow(), vec!["child cancelled"]);
    test_complete!("body_failure_cancels_children");
}

/// Spawning into a group whose body has exited is refused.
#[test]
fn spawn_after_close_is_misuse() {
    init_test_logging();
    test_phase!("spawn_after_close_is_misuse");

    let kind = run(async {
        let leaked = task_group(|g| async move { Ok(g) }).await?;
        match leaked.spawn(async { Ok(()) }) {
            Err(error) => Ok(error.kind()),
            Ok(_) => Err(Error::user("spawn into closed group succeeded")),
        }
    })
    .expect("run should succeed");

    assert_eq!(kind, ErrorKind::Misuse);
    test_complete!("spawn_after_close_is_misuse");
}

/// Spawning is still permitted while the group is cancelling.
#[test]
fn spawn_during_cancellation_is_permitted() {
    init_test_logging();
    test_phase!("spawn_during_cancellation_is_permitted");

    let log = new_log();
    let late_log = log.clone();
    let error = run(async move {
        task_group(|g| async move {
            let group = g.clone();
            g.spawn(async { Err::<(), Error>(Error::user("first")) })?;
            match sleep(Duration::from_secs(1)).await {
                Err(error) if error.is_cancelled() => {
                    // The group is tearing down; a cleanup child may still
                    // be spawned and runs to completion.
                    assert!(group.is_cancelling());
                    group.spawn(async move {
                        late_log.borrow_mut().push("late child ran");
                        Ok(())
                    })?;
                    Err(error)
                }
                other => other,
            }
        })
        .await
    })
    .expect_err("group must re-raise the first failure");

    assert_eq!(error.message(), Some("first"));
    assert_eq!(*log.borrow(), vec!["late child ran"]);
    test_complete!("spawn_during_cancellation_is_permitted");
}
