//! Scenario: waiting on a pipe's read end resolves once data is written,
//! and resolves with `ClosedResourceError` once the write end is closed
//! out from under the wait (§4.H).

#![cfg(unix)]

use std::os::unix::io::RawFd;

use kestrel_runtime::io::{wait_readable, UnixPollBackend};
use kestrel_runtime::{open_nursery, run, RuntimeConfig, TaskError};

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    (fds[0], fds[1])
}

#[test]
fn wait_readable_resolves_once_data_arrives() {
    let (read_fd, write_fd) = make_pipe();

    let config = RuntimeConfig::new()
        .with_io_backend(Box::new(UnixPollBackend::new().expect("poll backend")));

    let result = run(config, move || async move {
        open_nursery(|nursery| async move {
            nursery.start_soon(move || async move {
                let byte = [7u8];
                unsafe {
                    libc::write(write_fd, byte.as_ptr() as *const _, 1);
                }
                Ok(())
            });
            Ok::<(), TaskError>(())
        })
        .await?;

        wait_readable(read_fd).await
    });

    assert!(result.is_ok());

    let mut buf = [0u8; 1];
    let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, 1) };
    assert_eq!(n, 1);
    assert_eq!(buf[0], 7);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn wait_readable_reports_closed_resource_on_hangup() {
    let (read_fd, write_fd) = make_pipe();

    let config = RuntimeConfig::new()
        .with_io_backend(Box::new(UnixPollBackend::new().expect("poll backend")));

    let result = run(config, move || async move {
        open_nursery(|nursery| async move {
            nursery.start_soon(move || async move {
                unsafe {
                    libc::close(write_fd);
                }
                Ok(())
            });
            Ok::<(), TaskError>(())
        })
        .await?;

        wait_readable(read_fd).await
    });

    match result {
        Err(TaskError::ClosedResource(_)) => {}
        other => panic!("expected ClosedResource, got {other:?}"),
    }

    unsafe {
        libc::close(read_fd);
    }
}
