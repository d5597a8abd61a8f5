use std::{
    collections::HashMap,
    io::{Error, ErrorKind, Result},
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use libc::{
    epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT,
    EPOLLRDHUP, EPOLL_CTL_ADD, EPOLL_CTL_MOD,
};

use super::{EventName, Key};

/// Milliseconds for `epoll_wait`, rounded up so a short non-zero timeout
/// still sleeps.
fn timeout_millis(timeout: Duration) -> i32 {
    let millis = (timeout.as_nanos() + 999_999) / 1_000_000;

    millis.min(i32::MAX as u128) as i32
}

/// epoll backed poller.
#[derive(Clone, Debug)]
pub struct SysPoller {
    handle: Arc<RawFd>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle) == 1 {
            log::debug!("Close epoll handle({:?})", *self.handle);
            unsafe { libc::close(*self.handle) };
        }
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Arm `fd` for one notification of `events`, adding it to the epoll set
    /// on first use. Descriptors are dropped from the set by the kernel when
    /// they are closed, so a stale entry is never removed explicitly.
    fn arm(&self, fd: RawFd, events: u32) -> Result<()> {
        let mut event = epoll_event {
            events: events | EPOLLONESHOT as u32,
            u64: fd as u64,
        };

        if unsafe { epoll_ctl(*self.handle, EPOLL_CTL_MOD, fd, &mut event) } == 0 {
            return Ok(());
        }

        let err = Error::last_os_error();

        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }

        if unsafe { epoll_ctl(*self.handle, EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    /// Wait up to `timeout` for any of `keys`; returns the keys that fired.
    pub fn poll_once(&self, keys: &[Key], timeout: Duration) -> Result<Vec<Key>> {
        let mut fds = HashMap::new();

        for key in keys {
            let mask = match key.1 {
                EventName::Read => EPOLLIN | EPOLLRDHUP,
                EventName::Write => EPOLLOUT,
            } as u32;

            fds.entry(key.0)
                .and_modify(|c| *c |= mask)
                .or_insert(mask);
        }

        fds.retain(|fd, events| match self.arm(*fd, *events) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("epoll arm fd({}) error({})", fd, err);
                false
            }
        });

        let mut fired_events: Vec<epoll_event> =
            vec![epoll_event { events: 0, u64: 0 }; fds.len().max(1)];

        let fired = unsafe {
            epoll_wait(
                *self.handle,
                fired_events.as_mut_ptr(),
                fired_events.len() as i32,
                timeout_millis(timeout),
            )
        };

        if fired < 0 {
            let err = Error::last_os_error();

            if err.kind() == ErrorKind::Interrupted {
                return Ok(vec![]);
            }

            log::debug!("epoll_wait error({})", err);

            return Err(err);
        }

        let mut events = Vec::with_capacity(fired as usize);

        for event in &fired_events[..fired as usize] {
            let fd = event.u64 as RawFd;
            let raised = event.events;

            let Some(armed) = fds.get(&fd) else {
                continue;
            };

            let failed = raised & (EPOLLERR | EPOLLHUP) as u32 != 0;

            if armed & EPOLLIN as u32 != 0
                && (failed || raised & (EPOLLIN | EPOLLRDHUP) as u32 != 0)
            {
                events.push(Key(fd, EventName::Read));
            }

            if armed & EPOLLOUT as u32 != 0 && (failed || raised & EPOLLOUT as u32 != 0) {
                events.push(Key(fd, EventName::Write));
            }
        }

        log::trace!("raised {:?}", events);

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::timeout_millis;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(500)), 1);
        assert_eq!(timeout_millis(Duration::from_millis(10)), 10);
        assert_eq!(timeout_millis(Duration::from_micros(10_001)), 11);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
