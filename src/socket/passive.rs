use std::{fmt::Display, os::fd::RawFd};

use libc::c_int;

use crate::{
    addr::SocketAddress,
    context::SocketContext,
    reactor::{IoReactor, Reactor},
    sys,
};

use super::{ActiveSocket, Socket, SocketOptions};

/// Listening stream socket producing [`ActiveSocket`]s.
pub struct PassiveSocket<A: SocketAddress, R: Reactor = IoReactor> {
    socket: Socket<A>,
    context: SocketContext<R>,
    backlog: Option<c_int>,
}

impl<A: SocketAddress, R: Reactor> PassiveSocket<A, R> {
    pub fn new(context: &SocketContext<R>) -> Self {
        Self::with_socket(context, Socket::new())
    }

    pub fn from_fd(context: &SocketContext<R>, fd: Option<RawFd>) -> Self {
        Self::with_socket(context, Socket::from_fd(fd))
    }

    fn with_socket(context: &SocketContext<R>, socket: Socket<A>) -> Self {
        Self {
            socket,
            context: context.clone(),
            backlog: None,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.socket.fd()
    }

    pub fn is_valid(&self) -> bool {
        self.socket.is_valid()
    }

    pub fn is_bound(&self) -> bool {
        self.socket.is_bound()
    }

    pub fn bound_address(&self) -> Option<A> {
        self.socket.bound_address()
    }

    /// Backlog passed to the successful [`listen`](PassiveSocket::listen).
    pub fn backlog(&self) -> Option<c_int> {
        self.backlog
    }

    pub fn is_listening(&self) -> bool {
        self.socket.is_valid() && self.backlog.is_some()
    }

    /// See [`Socket::bind`].
    pub fn bind(&mut self, address: &A) -> bool {
        self.socket.bind(address)
    }

    pub fn getsockname(&self) -> Option<A> {
        self.socket.getsockname()
    }

    pub fn set_on_close<F>(&mut self, callback: F)
    where
        F: FnOnce(RawFd) + Send + 'static,
    {
        self.socket.set_on_close(callback);
    }

    /// Start listening with a queue of `backlog` pending connections.
    ///
    /// An unbound socket is bound by the OS to a wildcard address first, so
    /// [`bound_address`](PassiveSocket::bound_address) is set afterwards.
    pub fn listen(&mut self, backlog: c_int) -> bool {
        let Some(fd) = self.socket.fd() else {
            return false;
        };

        if let Err(err) = sys::listen(fd, backlog) {
            log::debug!("Could not listen on fd({}), {}", fd, err);
            return false;
        }

        self.backlog = Some(backlog);

        if !self.socket.is_bound() {
            if let Some(address) = self.socket.getsockname() {
                self.socket.bound_address = Some(address);
            }
        }

        true
    }

    /// Accept one pending connection, blocking until one arrives.
    ///
    /// The new socket carries the peer address and shares this socket's
    /// context. Returns [`None`] on failure.
    pub fn accept(&self) -> Option<ActiveSocket<A, R>> {
        let fd = self.socket.fd()?;

        match sys::accept::<A>(fd) {
            Ok((conn, remote_address)) => {
                log::trace!("fd({}) accepted fd({}) from {:?}", fd, conn, remote_address);

                Some(ActiveSocket::from_fd(&self.context, Some(conn), remote_address))
            }
            Err(err) => {
                log::debug!("fd({}) accept failed, {}", fd, err);
                None
            }
        }
    }

    pub fn close(&mut self) {
        self.backlog = None;
        self.socket.close();
    }
}

impl<A: SocketAddress, R: Reactor> SocketOptions for PassiveSocket<A, R> {
    fn socket_fd(&self) -> Option<RawFd> {
        self.socket.fd()
    }
}

impl<A: SocketAddress, R: Reactor> Display for PassiveSocket<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<PassiveSocket:")?;

        self.socket.fmt_attributes(f)?;

        if let Some(backlog) = self.backlog {
            write!(f, " listening({})", backlog)?;
        }

        write!(f, ">")
    }
}
