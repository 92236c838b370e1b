//! End-to-end readiness I/O scenarios over local socket pairs.

#[macro_use]
mod common;

use common::{boxed, init_test_logging};
use soloio::{gather, run, sleep, task_group, Error};
use std::io::Write as _;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// S5: buffered bytes are delivered without blocking past readiness, and
/// a short read leaves the rest buffered in the OS.
#[test]
fn read_sees_buffered_bytes() {
    init_test_logging();
    test_phase!("read_sees_buffered_bytes");

    let (mut writer, reader) = UnixStream::pair().expect("socket pair");
    writer.write_all(b"hello").expect("write");

    let (first, second) = run(async move {
        let first = soloio::read(&reader, 2).await?;
        let second = soloio::read(&reader, 32).await?;
        Ok((first, second))
    })
    .expect("run should succeed");

    assert_eq!(first, b"he");
    assert_eq!(second, b"llo");
    test_complete!("read_sees_buffered_bytes");
}

/// A reader parked on an idle descriptor resumes once a sibling writes to
/// the peer; both directions flow through the same loop.
#[test]
fn read_waits_for_sibling_write() {
    init_test_logging();
    test_phase!("read_waits_for_sibling_write");

    let (writer, reader) = UnixStream::pair().expect("socket pair");
    let (bytes, written) = run(async move {
        task_group(|g| async move {
            let read_side = g.spawn(async move { soloio::read(&reader, 16).await })?;
            let write_side = g.spawn(async move {
                sleep(Duration::from_millis(10)).await?;
                soloio::write(&writer, b"ping").await
            })?;
            let bytes = read_side.join().await?;
            let written = write_side.join().await?;
            Ok((bytes, written))
        })
        .await
    })
    .expect("run should succeed");

    assert_eq!(bytes, b"ping");
    assert_eq!(written, 4);
    test_complete!("read_waits_for_sibling_write");
}

/// EOF injects an empty buffer.
#[test]
fn read_at_eof_is_empty() {
    init_test_logging();
    test_phase!("read_at_eof_is_empty");

    let (writer, reader) = UnixStream::pair().expect("socket pair");
    drop(writer);

    let bytes = run(async move { soloio::read(&reader, 8).await }).expect("run should succeed");
    assert!(bytes.is_empty());
    test_complete!("read_at_eof_is_empty");
}

/// A pending read observes cancellation without consuming any bytes.
#[test]
fn pending_read_is_cancellable() {
    init_test_logging();
    test_phase!("pending_read_is_cancellable");

    let (_writer, reader) = UnixStream::pair().expect("socket pair");
    let error = run(async move {
        gather(vec![
            boxed(async move {
                match soloio::read(&reader, 8).await {
                    Err(error) if error.is_cancelled() => Err::<(), Error>(error),
                    Err(error) => Err(error),
                    Ok(_) => Err(Error::user("read completed unexpectedly")),
                }
            }),
            boxed(async {
                sleep(Duration::from_millis(5)).await?;
                Err::<(), Error>(Error::user("abort"))
            }),
        ])
        .await
    })
    .expect_err("group must re-raise the abort");

    assert_eq!(error.message(), Some("abort"));
    test_complete!("pending_read_is_cancellable");
}
