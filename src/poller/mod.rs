//! System io multiplexer used by [`IoReactor`](crate::reactor::IoReactor).
//!
//! The poller is stateless from the caller's point of view: every
//! [`poll_once`](SysPoller::poll_once) call arms exactly the keys it is given,
//! each for a single notification.

#[cfg_attr(target_os = "macos", path = "kqueue.rs")]
#[cfg_attr(target_os = "ios", path = "kqueue.rs")]
#[cfg_attr(target_os = "freebsd", path = "kqueue.rs")]
#[cfg_attr(target_os = "openbsd", path = "kqueue.rs")]
#[cfg_attr(target_os = "netbsd", path = "kqueue.rs")]
#[cfg_attr(target_os = "dragonfly", path = "kqueue.rs")]
#[cfg_attr(target_os = "linux", path = "epoll.rs")]
#[cfg_attr(target_os = "android", path = "epoll.rs")]
mod impls;

use std::{fmt::Display, os::fd::RawFd};

pub use impls::*;

/// Readiness kind a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq)]
pub enum EventName {
    /// Data available or peer closed.
    Read,
    /// Send buffer has room.
    Write,
}

/// Poll key: descriptor plus readiness kind.
#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq)]
pub struct Key(pub RawFd, pub EventName);

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.1 {
            EventName::Read => write!(f, "readable({})", self.0),
            EventName::Write => write!(f, "writable({})", self.0),
        }
    }
}
