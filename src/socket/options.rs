use std::{fmt::Display, os::fd::RawFd};

use libc::c_int;

use crate::sys;

/// `SOL_SOCKET` level options understood by [`SocketOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    ReuseAddress,
    KeepAlive,
    DontRoute,
    Debug,
    SendBufferSize,
    ReceiveBufferSize,
    /// Pending socket error, read only.
    Error,
}

impl SocketOption {
    /// Option name passed to `getsockopt(2)`/`setsockopt(2)`.
    pub fn name(self) -> c_int {
        match self {
            Self::ReuseAddress => libc::SO_REUSEADDR,
            Self::KeepAlive => libc::SO_KEEPALIVE,
            Self::DontRoute => libc::SO_DONTROUTE,
            Self::Debug => libc::SO_DEBUG,
            Self::SendBufferSize => libc::SO_SNDBUF,
            Self::ReceiveBufferSize => libc::SO_RCVBUF,
            Self::Error => libc::SO_ERROR,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Error)
    }
}

impl Display for SocketOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReuseAddress => "SO_REUSEADDR",
            Self::KeepAlive => "SO_KEEPALIVE",
            Self::DontRoute => "SO_DONTROUTE",
            Self::Debug => "SO_DEBUG",
            Self::SendBufferSize => "SO_SNDBUF",
            Self::ReceiveBufferSize => "SO_RCVBUF",
            Self::Error => "SO_ERROR",
        };

        write!(f, "{}", name)
    }
}

/// Socket option access for anything that owns a socket descriptor.
///
/// Getters return [`None`] when the socket is closed or the OS call fails,
/// setters return whether the OS accepted the value. Failures are logged.
pub trait SocketOptions {
    /// Descriptor the options apply to, [`None`] once closed.
    fn socket_fd(&self) -> Option<RawFd>;

    fn socket_option(&self, option: SocketOption) -> Option<c_int> {
        let fd = self.socket_fd()?;

        match sys::getsockopt(fd, libc::SOL_SOCKET, option.name()) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("Could not get option {} from fd({}), {}", option, fd, err);
                None
            }
        }
    }

    fn set_socket_option(&self, option: SocketOption, value: c_int) -> bool {
        let Some(fd) = self.socket_fd() else {
            return false;
        };

        if option.is_read_only() {
            log::warn!("Option {} is read only", option);
            return false;
        }

        match sys::setsockopt(fd, libc::SOL_SOCKET, option.name(), value) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Could not set option {} on fd({}), {}", option, fd, err);
                false
            }
        }
    }

    /// Boolean view of an option: zero is false, anything else true.
    fn flag(&self, option: SocketOption) -> Option<bool> {
        self.socket_option(option).map(|value| value != 0)
    }

    fn set_flag(&self, option: SocketOption, on: bool) -> bool {
        self.set_socket_option(option, on as c_int)
    }

    fn reuse_address(&self) -> Option<bool> {
        self.flag(SocketOption::ReuseAddress)
    }

    fn set_reuse_address(&self, on: bool) -> bool {
        self.set_flag(SocketOption::ReuseAddress, on)
    }

    fn keep_alive(&self) -> Option<bool> {
        self.flag(SocketOption::KeepAlive)
    }

    fn set_keep_alive(&self, on: bool) -> bool {
        self.set_flag(SocketOption::KeepAlive, on)
    }

    fn dont_route(&self) -> Option<bool> {
        self.flag(SocketOption::DontRoute)
    }

    fn set_dont_route(&self, on: bool) -> bool {
        self.set_flag(SocketOption::DontRoute, on)
    }

    fn socket_debug(&self) -> Option<bool> {
        self.flag(SocketOption::Debug)
    }

    fn set_socket_debug(&self, on: bool) -> bool {
        self.set_flag(SocketOption::Debug, on)
    }

    fn send_buffer_size(&self) -> Option<c_int> {
        self.socket_option(SocketOption::SendBufferSize)
    }

    fn set_send_buffer_size(&self, size: c_int) -> bool {
        self.set_socket_option(SocketOption::SendBufferSize, size)
    }

    fn receive_buffer_size(&self) -> Option<c_int> {
        self.socket_option(SocketOption::ReceiveBufferSize)
    }

    fn set_receive_buffer_size(&self, size: c_int) -> bool {
        self.set_socket_option(SocketOption::ReceiveBufferSize, size)
    }

    /// Pending error (`SO_ERROR`); reading it clears it.
    fn socket_error(&self) -> Option<c_int> {
        self.socket_option(SocketOption::Error)
    }
}
