//! Socket lifecycle: descriptor ownership, bind, options and close.

mod active;
mod options;
mod passive;
mod write;

pub use active::*;
pub use options::*;
pub use passive::*;

use std::{fmt::Display, os::fd::RawFd};

use libc::c_int;

use crate::{addr::SocketAddress, sys};

/// One-shot callback fired with the released descriptor.
pub type CloseCallback = Box<dyn FnOnce(RawFd) + Send + 'static>;

/// Owner of one OS socket descriptor.
///
/// A socket whose descriptor could not be created is *invalid*: every
/// operation on it fails with its usual failure value. Dropping a socket
/// closes it.
pub struct Socket<A: SocketAddress> {
    fd: Option<RawFd>,
    bound_address: Option<A>,
    on_close: Option<CloseCallback>,
}

impl<A: SocketAddress> Socket<A> {
    /// Wrap an existing descriptor, e.g. one returned by `accept`.
    pub fn from_fd(fd: Option<RawFd>) -> Self {
        Self {
            fd,
            bound_address: None,
            on_close: None,
        }
    }

    /// Create a stream socket in the family of `A`.
    pub fn new() -> Self {
        Self::with_type(libc::SOCK_STREAM)
    }

    /// Create a socket of type `ty` in the family of `A`.
    pub fn with_type(ty: c_int) -> Self {
        match sys::socket(A::DOMAIN, ty) {
            Ok(fd) => Self::from_fd(Some(fd)),
            Err(err) => {
                log::error!("Could not create socket, {}", err);
                Self::from_fd(None)
            }
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.bound_address.is_some()
    }

    pub fn bound_address(&self) -> Option<A> {
        self.bound_address
    }

    /// Register the callback fired once the descriptor is released.
    /// Replaces any earlier callback.
    pub fn set_on_close<F>(&mut self, callback: F)
    where
        F: FnOnce(RawFd) + Send + 'static,
    {
        self.on_close = Some(Box::new(callback));
    }

    /// Close the descriptor. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some((fd, Some(callback))) = self.release() {
            callback(fd);
        }
    }

    /// Release the descriptor and hand back the close callback so the caller
    /// can fire it after dropping its locks.
    pub(crate) fn release(&mut self) -> Option<(RawFd, Option<CloseCallback>)> {
        self.bound_address = None;

        let fd = self.fd.take()?;

        if let Err(err) = sys::close(fd) {
            log::trace!("close fd({}) error, {}", fd, err);
        }

        Some((fd, self.on_close.take()))
    }

    /// Bind to `address`. Fails if the socket is invalid or already bound.
    ///
    /// On success the bound address is re-read from the OS, so a wildcard
    /// port shows up resolved.
    pub fn bind(&mut self, address: &A) -> bool {
        let Some(fd) = self.fd else {
            return false;
        };

        if self.is_bound() {
            log::debug!("Socket fd({}) is already bound", fd);
            return false;
        }

        if let Err(err) = sys::bind(fd, address) {
            log::debug!("Could not bind fd({}) to {}, {}", fd, address, err);
            return false;
        }

        self.bound_address = Some(self.getsockname().unwrap_or(*address));

        true
    }

    /// Local address as reported by the OS.
    pub fn getsockname(&self) -> Option<A> {
        sys::getsockname(self.fd?).ok().flatten()
    }

    pub(crate) fn fmt_attributes(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.fd {
            Some(fd) => write!(f, " fd={}", fd)?,
            None => write!(f, " closed")?,
        }

        if let Some(address) = &self.bound_address {
            write!(f, " {}", address)?;
        }

        Ok(())
    }
}

impl<A: SocketAddress> Default for Socket<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: SocketAddress> Drop for Socket<A> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<A: SocketAddress> SocketOptions for Socket<A> {
    fn socket_fd(&self) -> Option<RawFd> {
        self.fd
    }
}

impl<A: SocketAddress> Display for Socket<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Socket:")?;
        self.fmt_attributes(f)?;
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::addr::{Inet4Address, UnixAddress};

    use super::*;

    #[test]
    fn fresh_socket_is_valid_and_unbound() {
        let socket = Socket::<Inet4Address>::new();

        assert!(socket.is_valid());
        assert!(!socket.is_bound());
        assert!(socket.to_string().starts_with("<Socket: fd="));
    }

    #[test]
    fn invalid_socket_fails_everything() {
        let mut socket = Socket::<Inet4Address>::from_fd(None);

        assert!(!socket.is_valid());
        assert!(!socket.bind(&Inet4Address::localhost()));
        assert!(!socket.is_bound());
        assert_eq!(socket.getsockname(), None);
        assert_eq!(socket.reuse_address(), None);
        assert!(!socket.set_reuse_address(true));
        assert_eq!(socket.to_string(), "<Socket: closed>");

        socket.close();
    }

    #[test]
    fn close_is_idempotent_and_fires_callback_once() {
        let mut socket = Socket::<Inet4Address>::new();

        let fd = socket.fd().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let closed_fd = Arc::new(AtomicUsize::new(usize::MAX));

        let callback_hits = hits.clone();
        let callback_fd = closed_fd.clone();

        socket.set_on_close(move |fd| {
            callback_hits.fetch_add(1, Ordering::SeqCst);
            callback_fd.store(fd as usize, Ordering::SeqCst);
        });

        socket.close();
        socket.close();

        assert!(!socket.is_valid());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(closed_fd.load(Ordering::SeqCst), fd as usize);
    }

    #[test]
    fn drop_closes_descriptor() {
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let mut socket = Socket::<Inet4Address>::new();

            let callback_hits = hits.clone();

            socket.set_on_close(move |_| {
                callback_hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bind_resolves_wildcard_port_and_refuses_rebind() {
        let mut socket = Socket::<Inet4Address>::new();

        assert!(socket.bind(&Inet4Address::localhost()));

        let bound = socket.bound_address().unwrap();

        assert!(!bound.is_wildcard_port());
        assert_eq!(socket.getsockname(), Some(bound));

        let fd = socket.fd();

        assert!(!socket.bind(&Inet4Address::localhost()));
        assert_eq!(socket.bound_address(), Some(bound));
        assert_eq!(socket.fd(), fd);
        assert!(socket.to_string().contains(&bound.to_string()));

        socket.close();

        assert!(!socket.is_bound());
    }

    #[test]
    fn bind_unix_path() {
        let path = std::env::temp_dir().join(format!("reactor-sockets-{}.sock", std::process::id()));

        _ = std::fs::remove_file(&path);

        let mut socket = Socket::<UnixAddress>::new();

        let address = UnixAddress::new(&path).unwrap();

        assert!(socket.bind(&address));
        assert_eq!(socket.bound_address(), Some(address));

        socket.close();

        _ = std::fs::remove_file(&path);
    }
}
