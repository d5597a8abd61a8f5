use std::{
    io::{Error, ErrorKind, Result},
    mem::zeroed,
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use libc::{kevent, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_ENABLE, EV_ERROR, EV_ONESHOT};

use super::{EventName, Key};

/// kqueue backed poller.
#[derive(Clone, Debug)]
pub struct SysPoller {
    kq_handle: Arc<RawFd>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        if Arc::strong_count(&self.kq_handle) == 1 {
            log::debug!("Close kqueue handle({:?})", *self.kq_handle);
            unsafe { libc::close(*self.kq_handle) };
        }
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let kq_handle = unsafe { libc::kqueue() };

        if kq_handle < 0 {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            kq_handle: Arc::new(kq_handle),
        })
    }

    /// Wait up to `timeout` for any of `keys`; returns the keys that fired.
    pub fn poll_once(&self, keys: &[Key], timeout: Duration) -> Result<Vec<Key>> {
        let mut changes = Vec::<kevent>::with_capacity(keys.len());

        for key in keys {
            // SAFETY: kevent is plain old data.
            let mut k_event: kevent = unsafe { zeroed() };

            k_event.ident = key.0 as _;
            k_event.filter = match key.1 {
                EventName::Read => EVFILT_READ,
                EventName::Write => EVFILT_WRITE,
            };
            k_event.flags = EV_ADD | EV_ONESHOT | EV_ENABLE;

            changes.push(k_event);
        }

        // SAFETY: kevent is plain old data.
        let mut fired_events: Vec<kevent> = vec![unsafe { zeroed() }; keys.len().max(1)];

        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        let fired = unsafe {
            libc::kevent(
                *self.kq_handle,
                changes.as_ptr(),
                changes.len() as _,
                fired_events.as_mut_ptr(),
                fired_events.len() as _,
                &timeout,
            )
        };

        if fired < 0 {
            let err = Error::last_os_error();

            if err.kind() == ErrorKind::Interrupted {
                return Ok(vec![]);
            }

            return Err(err);
        }

        let mut ret = Vec::with_capacity(fired as usize);

        for event in &fired_events[..fired as usize] {
            let fd = event.ident as RawFd;

            if event.flags & EV_ERROR != 0 {
                log::error!(target:"kevent","fd({}) fired error,{}", fd, Error::from_raw_os_error(event.data as i32));
                continue;
            }

            match event.filter {
                EVFILT_READ => ret.push(Key(fd, EventName::Read)),
                EVFILT_WRITE => ret.push(Key(fd, EventName::Write)),
                _ => continue,
            }
        }

        log::trace!("raised {:?}", ret);

        Ok(ret)
    }
}
