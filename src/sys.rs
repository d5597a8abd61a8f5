//! OS socket calls.
//!
//! Everything here is a thin `io::Result` wrapper over `libc`; callers in
//! [`socket`](crate::socket) map the results onto their own return values.

use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, zeroed},
    os::fd::RawFd,
};

use errno::{errno, set_errno, Errno};
use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

use crate::addr::SocketAddress;

/// Create a socket in `domain` of type `ty`.
pub fn socket(domain: c_int, ty: c_int) -> Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, 0) };

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    log::trace!(target:"unix_net","socket({}, {}) fd({})", domain, ty, fd);

    Ok(fd)
}

pub fn close(fd: RawFd) -> Result<()> {
    log::trace!(target:"unix_net","close fd({})", fd);

    if unsafe { libc::close(fd) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn bind<A: SocketAddress>(fd: RawFd, addr: &A) -> Result<()> {
    if unsafe { libc::bind(fd, addr.as_ptr(), addr.socklen()) } < 0 {
        return Err(Error::last_os_error());
    }

    log::trace!(target:"unix_net","fd({}) bind {}", fd, addr);

    Ok(())
}

/// Blocking connect, retried when interrupted by a signal.
pub fn connect<A: SocketAddress>(fd: RawFd, addr: &A) -> Result<()> {
    loop {
        if unsafe { libc::connect(fd, addr.as_ptr(), addr.socklen()) } == 0 {
            log::trace!(target:"unix_net","fd({}) connect {}", fd, addr);

            return Ok(());
        }

        let err = Error::last_os_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn listen(fd: RawFd, backlog: c_int) -> Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// Blocking accept. The peer address is [`None`] if it is not of family `A`.
pub fn accept<A: SocketAddress>(fd: RawFd) -> Result<(RawFd, Option<A>)> {
    loop {
        // SAFETY: sockaddr_storage is plain old data.
        let mut storage: sockaddr_storage = unsafe { zeroed() };
        let mut len = size_of::<sockaddr_storage>() as socklen_t;

        let conn_fd = unsafe {
            libc::accept(
                fd,
                (&mut storage as *mut sockaddr_storage).cast::<sockaddr>(),
                &mut len as *mut socklen_t,
            )
        };

        if conn_fd >= 0 {
            let peer = A::from_storage(&storage, len);

            log::trace!(target:"unix_net","fd({}) accept connection({}) from ({:?})", fd, conn_fd, peer);

            return Ok((conn_fd, peer));
        }

        let err = Error::last_os_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

type NameFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;

fn query_name<A: SocketAddress>(fd: RawFd, f: NameFn) -> Result<Option<A>> {
    // SAFETY: sockaddr_storage is plain old data.
    let mut storage: sockaddr_storage = unsafe { zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe {
        f(
            fd,
            (&mut storage as *mut sockaddr_storage).cast::<sockaddr>(),
            &mut len as *mut socklen_t,
        )
    };

    if rc < 0 {
        return Err(Error::last_os_error());
    }

    Ok(A::from_storage(&storage, len))
}

/// Local address of `fd`.
pub fn getsockname<A: SocketAddress>(fd: RawFd) -> Result<Option<A>> {
    query_name(fd, libc::getsockname)
}

/// Remote address of a connected `fd`.
pub fn getpeername<A: SocketAddress>(fd: RawFd) -> Result<Option<A>> {
    query_name(fd, libc::getpeername)
}

pub fn getsockopt(fd: RawFd, level: c_int, name: c_int) -> Result<c_int> {
    let mut value: c_int = 0;
    let mut len = size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            (&mut value as *mut c_int).cast::<c_void>(),
            &mut len as *mut socklen_t,
        )
    };

    if rc < 0 {
        return Err(Error::last_os_error());
    }

    Ok(value)
}

pub fn setsockopt(fd: RawFd, level: c_int, name: c_int, value: c_int) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const c_int).cast::<c_void>(),
            size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// Raw `read(2)`; negative on error with `errno` set.
pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let len = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len()) };

    let e = errno();

    log::trace!(target:"unix_net","fd({}) read bytes({})", fd, len);

    set_errno(e);

    len
}

/// Raw `write(2)`; negative on error with `errno` set.
pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let len = unsafe { libc::write(fd, buf.as_ptr().cast::<c_void>(), buf.len()) };

    let e = errno();

    log::trace!(target:"unix_net","fd({}) write bytes({})", fd, len);

    set_errno(e);

    len
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = libc::MSG_DONTWAIT;

/// `send(2)` that never blocks, whatever the descriptor's mode.
///
/// Fails with [`ErrorKind::WouldBlock`] when the send buffer is full.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let len = unsafe { libc::send(fd, buf.as_ptr().cast::<c_void>(), buf.len(), SEND_FLAGS) };

    if len < 0 {
        let err = Error::last_os_error();

        log::trace!(target:"unix_net","fd({}) send error, {}", fd, err);

        return Err(err);
    }

    log::trace!(target:"unix_net","fd({}) send bytes({})", fd, len);

    Ok(len as usize)
}

/// Number of bytes readable without blocking.
pub fn available(fd: RawFd) -> Result<usize> {
    let mut len: c_int = 0;

    loop {
        if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut len as *mut c_int) } == 0 {
            return Ok(len.max(0) as usize);
        }

        let err = Error::last_os_error();

        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Mark the calling thread's `errno` as "bad descriptor".
pub fn set_bad_fd() {
    set_errno(Errno(libc::EBADF));
}

/// Connected pair of unix stream sockets.
pub fn socketpair() -> Result<(RawFd, RawFd)> {
    let mut fds: [c_int; 2] = [-1; 2];

    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok((fds[0], fds[1]))
}

/// Switch `fd` to non blocking mode.
pub fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socketpair_read_write() {
        let (a, b) = socketpair().unwrap();

        assert_eq!(write(a, b"ping"), 4);

        assert_eq!(available(b).unwrap(), 4);

        let mut buf = [0u8; 8];

        assert_eq!(read(b, &mut buf), 4);
        assert_eq!(&buf[..4], b"ping");

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (a, b) = socketpair().unwrap();

        set_nonblocking(b, true).unwrap();

        let mut buf = [0u8; 8];

        assert!(read(b, &mut buf) < 0);
        assert_eq!(Error::last_os_error().kind(), ErrorKind::WouldBlock);

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn read_error_keeps_errno() {
        _ = pretty_env_logger::try_init();

        let mut buf = [0u8; 8];

        assert!(read(-1, &mut buf) < 0);
        assert_eq!(errno().0, libc::EBADF);

        assert!(write(-1, b"x") < 0);
        assert_eq!(errno().0, libc::EBADF);
    }

    #[test]
    fn send_nonblocking_on_blocking_fd() {
        let (a, b) = socketpair().unwrap();

        let chunk = [1u8; 64 * 1024];

        // fills the buffer of a blocking descriptor without ever blocking
        let err = loop {
            match send_nonblocking(a, &chunk) {
                Ok(len) => assert!(len > 0),
                Err(err) => break err,
            }
        };

        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        close(b).unwrap();

        assert_eq!(
            send_nonblocking(a, &chunk).unwrap_err().kind(),
            ErrorKind::BrokenPipe
        );

        close(a).unwrap();
    }

    #[test]
    fn getsockopt_reads_type() {
        let (a, b) = socketpair().unwrap();

        assert_eq!(
            getsockopt(a, libc::SOL_SOCKET, libc::SO_TYPE).unwrap(),
            libc::SOCK_STREAM
        );

        close(a).unwrap();
        close(b).unwrap();
    }
}
