//! Single-descriptor readiness waits with an absolute deadline.

use std::io;
use std::os::fd::RawFd;

use girder_core::clock::Deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Wait until `fd` is ready for `interest` or `deadline` passes.
///
/// Returns `Ok(false)` on deadline expiry. A peer hangup counts as readable:
/// the following read observes the EOF.
pub fn wait(fd: RawFd, interest: Interest, deadline: Deadline) -> io::Result<bool> {
    let events = match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    };
    loop {
        let left = deadline.left();
        // poll(2) has millisecond granularity; round up so a sub-millisecond
        // remainder does not turn into a busy loop.
        let timeout_ms = left
            .as_millis()
            .saturating_add(u128::from(left.subsec_nanos() % 1_000_000 != 0))
            .min(i32::MAX as u128) as i32;
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pollfd is a valid, initialised structure for one descriptor.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(false);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "polled descriptor is not open",
            ));
        }
        return Ok(true);
    }
}
