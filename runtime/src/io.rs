//! I/O wait adapter (component H).
//!
//! `ReadinessBackend` is the seam between the parking lot and a concrete OS
//! readiness source. The full socket/pipe/TLS stream stack is a named
//! out-of-scope external collaborator (§1); `UnixPollBackend` is the
//! crate's own reference implementation of the *interface*, built the same
//! self-pipe way the rest of the pack's reactor-shaped code wakes a
//! blocking `poll`/`select` call from another thread.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::TaskError;

/// Which direction a task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// Abstracts the OS readiness multiplexer so the run loop's I/O step can
/// be exercised without a real file descriptor (`NullBackend`, used in
/// unit tests that only touch the scheduler core).
pub trait ReadinessBackend {
    /// Start watching `fd` for `interest`.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd` for `interest`. Safe to call even if never
    /// registered. Does not disturb a registration for the other
    /// interest on the same `fd` — the two directions are independent.
    fn unregister(&mut self, fd: RawFd, interest: Interest);

    /// Block for up to `timeout` (or forever if `None`) and return the fds
    /// that became ready, or were closed, since the last call.
    fn poll(&mut self, timeout: Option<std::time::Duration>) -> io::Result<Vec<ReadinessEvent>>;

    /// Interrupt a concurrent or future `poll` call. Must be safe to call
    /// from any thread (the foreign-thread handoff path, §5, is the only
    /// caller that isn't the loop thread itself).
    fn wake(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    pub fd: RawFd,
    pub interest: Interest,
    pub closed: bool,
}

/// Always reports nothing ready and never blocks. The default backend
/// when the crate is built without an OS-facing reactor, or for tests
/// that only exercise the parking lot and scope tree.
#[derive(Default)]
pub struct NullBackend;

impl ReadinessBackend for NullBackend {
    fn register(&mut self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn unregister(&mut self, _fd: RawFd, _interest: Interest) {}

    fn poll(&mut self, _timeout: Option<std::time::Duration>) -> io::Result<Vec<ReadinessEvent>> {
        Ok(Vec::new())
    }

    fn wake(&self) {}
}

/// Turns a `ClosedResourceError`/`Cancelled` pairing into a `TaskError`,
/// used by the run loop when an fd wait is torn down.
pub(crate) fn closed() -> TaskError {
    TaskError::ClosedResource(crate::error::ClosedResourceError)
}

/// Suspend until `fd` is readable, or return `ClosedResourceError` if it's
/// torn down while waited on. Only one task may wait on a given `(fd,
/// interest)` pair at a time (§4.H): a second concurrent waiter gets
/// `BusyResourceError` immediately.
pub async fn wait_readable(fd: RawFd) -> Result<(), TaskError> {
    wait_for(fd, Interest::Readable).await
}

pub async fn wait_writable(fd: RawFd) -> Result<(), TaskError> {
    wait_for(fd, Interest::Writable).await
}

async fn wait_for(fd: RawFd, interest: Interest) -> Result<(), TaskError> {
    let task = crate::runloop::current_task_id();
    crate::runloop::with_kernel(|k| {
        let mut kernel = k.borrow_mut();
        if kernel.io_waiters.contains_key(&(fd, interest)) {
            return Err(TaskError::BusyResource(crate::error::BusyResourceError));
        }
        kernel.io_waiters.insert((fd, interest), task);
        let _ = kernel.io().register(fd, interest);
        Ok(())
    })?;

    // Unregisters on every exit path, including cancellation, without the
    // abort function itself needing to touch kernel state (it would be
    // invoked while the kernel is already borrowed by the cancellation
    // walk; see runloop's module doc).
    struct Unregister {
        fd: RawFd,
        interest: Interest,
    }
    impl Drop for Unregister {
        fn drop(&mut self) {
            crate::runloop::with_kernel(|k| {
                let mut kernel = k.borrow_mut();
                kernel.io_waiters.remove(&(self.fd, self.interest));
                kernel.io().unregister(self.fd, self.interest);
            });
        }
    }
    let _guard = Unregister { fd, interest };

    crate::task::wait_task_rescheduled(Box::new(|_raise_cancel| crate::task::Abort::Succeeded))
        .await
        .unwrap()
}

#[cfg(unix)]
pub use unix::UnixPollBackend;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::collections::HashSet;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    /// `libc::poll` plus a self-pipe, the classic trick for waking a
    /// blocking `poll()` call from another thread without a signal.
    ///
    /// Keyed by `(fd, interest)`, not bare `fd`: a readable-wait and a
    /// writable-wait on the same fd are independent registrations (§4.H),
    /// and collapsing them onto one key would let the second `register()`
    /// silently displace the first direction.
    pub struct UnixPollBackend {
        interests: HashSet<(RawFd, Interest)>,
        wake_reader: RawFd,
        wake_writer: RawFd,
    }

    impl UnixPollBackend {
        pub fn new() -> io::Result<Self> {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            Ok(Self {
                interests: HashSet::new(),
                wake_reader: fds[0],
                wake_writer: fds[1],
            })
        }
    }

    impl Drop for UnixPollBackend {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.wake_reader);
                libc::close(self.wake_writer);
            }
        }
    }

    impl ReadinessBackend for UnixPollBackend {
        fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.interests.insert((fd, interest));
            Ok(())
        }

        fn unregister(&mut self, fd: RawFd, interest: Interest) {
            self.interests.remove(&(fd, interest));
        }

        fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadinessEvent>> {
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.interests.len() + 1);
            fds.push(libc::pollfd {
                fd: self.wake_reader,
                events: libc::POLLIN,
                revents: 0,
            });
            let watched: Vec<(RawFd, Interest)> = self.interests.iter().copied().collect();
            for (fd, interest) in &watched {
                let events = match interest {
                    Interest::Readable => libc::POLLIN,
                    Interest::Writable => libc::POLLOUT,
                };
                fds.push(libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                });
            }

            let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(err);
            }

            if fds[0].revents != 0 {
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe {
                        libc::read(self.wake_reader, buf.as_mut_ptr() as *mut _, buf.len())
                    };
                    if n <= 0 {
                        break;
                    }
                }
            }

            let mut events = Vec::new();
            for (pfd, (fd, interest)) in fds[1..].iter().zip(watched.iter()) {
                if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                    events.push(ReadinessEvent {
                        fd: *fd,
                        interest: *interest,
                        closed: true,
                    });
                } else if pfd.revents != 0 {
                    events.push(ReadinessEvent {
                        fd: *fd,
                        interest: *interest,
                        closed: false,
                    });
                }
            }
            Ok(events)
        }

        fn wake(&self) {
            let byte = [1u8];
            unsafe {
                libc::write(self.wake_writer, byte.as_ptr() as *const _, 1);
            }
        }
    }

    impl AsRawFd for UnixPollBackend {
        fn as_raw_fd(&self) -> RawFd {
            self.wake_reader
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_reports_nothing() {
        let mut backend = NullBackend;
        assert!(backend.register(0, Interest::Readable).is_ok());
        let events = backend.poll(Some(std::time::Duration::from_millis(1))).unwrap();
        assert!(events.is_empty());
        backend.unregister(0, Interest::Readable);
        backend.wake();
    }

    #[cfg(unix)]
    #[test]
    fn poll_backend_keeps_both_directions_on_the_same_fd() {
        use unix::UnixPollBackend;

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        let mut backend = UnixPollBackend::new().unwrap();
        backend.register(a, Interest::Readable).unwrap();
        backend.register(a, Interest::Writable).unwrap();

        // `a` is writable immediately (empty socket buffer) but not yet
        // readable (nothing written). Registering the writable interest
        // must not have displaced the readable one.
        let events = backend.poll(Some(std::time::Duration::from_millis(50))).unwrap();
        assert!(events.iter().any(|e| e.fd == a && e.interest == Interest::Writable));
        assert!(!events.iter().any(|e| e.fd == a && e.interest == Interest::Readable));

        unsafe {
            libc::write(b, [9u8].as_ptr() as *const _, 1);
        }
        let events = backend.poll(Some(std::time::Duration::from_millis(50))).unwrap();
        assert!(events.iter().any(|e| e.fd == a && e.interest == Interest::Readable));

        backend.unregister(a, Interest::Writable);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
