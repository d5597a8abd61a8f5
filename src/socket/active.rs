use std::{
    fmt::Display,
    io,
    ops::Deref,
    os::fd::RawFd,
    sync::{Arc, Mutex, MutexGuard},
};

use errno::{errno, set_errno};

use crate::{
    addr::SocketAddress,
    context::SocketContext,
    poller::EventName,
    queue::EventQueue,
    reactor::{lock, IoReactor, Reactor, Subscription},
    sys,
};

use super::{write::PendingWrite, Socket, SocketOptions};

/// Callback run for each readiness event of an [`ActiveSocket`].
pub type ReadCallback<A, R> = Arc<Mutex<dyn FnMut(&ActiveSocket<A, R>) + Send + 'static>>;

/// Fixed capacity buffer reused by [`ActiveSocket::read`].
///
/// Holds `read_size + 2` bytes so the terminating zero written after a full
/// read always fits.
pub struct ReadBuffer {
    bytes: Box<[u8]>,
    read_size: usize,
}

impl ReadBuffer {
    fn new(read_size: usize) -> Self {
        Self {
            bytes: vec![0u8; read_size + 2].into_boxed_slice(),
            read_size,
        }
    }

    /// Total bytes, including the room for the terminating zero.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Maximum bytes a single read asks for.
    pub fn read_size(&self) -> usize {
        self.read_size
    }
}

impl Deref for ReadBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

/// Locked view of the read buffer returned by [`ActiveSocket::read`].
pub type ReadBufferGuard<'a> = MutexGuard<'a, ReadBuffer>;

struct State<A: SocketAddress, R: Reactor> {
    socket: Socket<A>,
    remote_address: Option<A>,
    event_queue: Option<EventQueue>,
    read_subscription: Option<Subscription>,
    on_read: Option<ReadCallback<A, R>>,
    pending_writes: usize,
    close_requested: bool,
}

pub(crate) struct Shared<A: SocketAddress, R: Reactor> {
    context: SocketContext<R>,
    state: Mutex<State<A, R>>,
    read_buffer: Mutex<ReadBuffer>,
}

impl<A: SocketAddress, R: Reactor> Drop for Shared<A, R> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(subscription) = state.read_subscription.take() {
            self.context.reactor().cancel(subscription);
        }

        state.on_read = None;

        // Socket's own drop releases the descriptor and fires on_close.
    }
}

/// Connected (or connectable) stream socket.
///
/// This is a shared handle: clones refer to the same socket, and the socket
/// is closed when the last handle goes away. Asynchronous writes keep a
/// handle of their own until they complete.
///
/// States: unconnected (valid, no remote address), connected (remote address
/// set) and closed (no descriptor, terminal).
pub struct ActiveSocket<A: SocketAddress, R: Reactor = IoReactor> {
    shared: Arc<Shared<A, R>>,
}

impl<A: SocketAddress, R: Reactor> Clone for ActiveSocket<A, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: SocketAddress, R: Reactor> ActiveSocket<A, R> {
    /// Create a new, unconnected stream socket in the family of `A`.
    pub fn new(context: &SocketContext<R>) -> Self {
        Self::with_socket(context, Socket::new(), None)
    }

    /// Wrap an existing descriptor, typically one returned by `accept`,
    /// together with its peer address.
    pub fn from_fd(context: &SocketContext<R>, fd: Option<RawFd>, remote_address: Option<A>) -> Self {
        Self::with_socket(context, Socket::from_fd(fd), remote_address)
    }

    fn with_socket(context: &SocketContext<R>, socket: Socket<A>, remote_address: Option<A>) -> Self {
        Self {
            shared: Arc::new(Shared {
                context: context.clone(),
                state: Mutex::new(State {
                    socket,
                    remote_address,
                    event_queue: None,
                    read_subscription: None,
                    on_read: None,
                    pending_writes: 0,
                    close_requested: false,
                }),
                read_buffer: Mutex::new(ReadBuffer::new(context.read_size())),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<A, R>> {
        lock(&self.shared.state)
    }

    pub(crate) fn reactor(&self) -> &R {
        self.shared.context.reactor()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.lock_state().socket.fd()
    }

    pub fn is_valid(&self) -> bool {
        self.lock_state().socket.is_valid()
    }

    pub fn is_bound(&self) -> bool {
        self.lock_state().socket.is_bound()
    }

    pub fn bound_address(&self) -> Option<A> {
        self.lock_state().socket.bound_address()
    }

    pub fn remote_address(&self) -> Option<A> {
        self.lock_state().remote_address
    }

    /// True while the socket is open and has a remote address.
    pub fn is_connected(&self) -> bool {
        let state = self.lock_state();

        state.socket.is_valid() && state.remote_address.is_some()
    }

    /// See [`Socket::bind`].
    pub fn bind(&self, address: &A) -> bool {
        self.lock_state().socket.bind(address)
    }

    pub fn getsockname(&self) -> Option<A> {
        self.lock_state().socket.getsockname()
    }

    /// Peer address as reported by the OS.
    pub fn getpeername(&self) -> Option<A> {
        let fd = self.fd()?;

        sys::getpeername(fd).ok().flatten()
    }

    /// See [`Socket::set_on_close`].
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: FnOnce(RawFd) + Send + 'static,
    {
        self.lock_state().socket.set_on_close(callback);
    }

    /// Queue used for read notifications and write completions.
    pub fn event_queue(&self) -> Option<EventQueue> {
        self.lock_state().event_queue.clone()
    }

    /// Select the queue for callbacks set up from now on.
    pub fn set_event_queue(&self, queue: EventQueue) {
        self.lock_state().event_queue = Some(queue);
    }

    /// Asynchronous writes issued and not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.lock_state().pending_writes
    }

    /// True if [`close`](ActiveSocket::close) was deferred by pending writes.
    pub fn close_requested(&self) -> bool {
        self.lock_state().close_requested
    }

    pub fn has_read_subscription(&self) -> bool {
        self.lock_state().read_subscription.is_some()
    }

    /// Bytes readable right now without blocking, 0 if unknown.
    pub fn available_bytes(&self) -> usize {
        self.fd()
            .and_then(|fd| sys::available(fd).ok())
            .unwrap_or(0)
    }

    fn ensure_queue(&self, state: &mut State<A, R>) -> EventQueue {
        if let Some(queue) = &state.event_queue {
            return queue.clone();
        }

        let queue = self.shared.context.default_queue().clone();

        log::debug!(
            "fd({:?}) has no event queue set, using default queue '{}'",
            state.socket.fd(),
            queue.label()
        );

        state.event_queue = Some(queue.clone());

        queue
    }

    /// Connect to `address`, blocking until the OS call returns.
    ///
    /// Fails if the socket is closed or already connected. On success
    /// `on_connect` runs before this returns.
    pub fn connect<F>(&self, address: &A, on_connect: F) -> bool
    where
        F: FnOnce(),
    {
        let fd = {
            let state = self.lock_state();

            let Some(fd) = state.socket.fd() else {
                return false;
            };

            if state.remote_address.is_some() {
                log::debug!("Socket fd({}) is already connected", fd);
                return false;
            }

            fd
        };

        if let Err(err) = sys::connect(fd, address) {
            log::debug!("Could not connect fd({}) to {}, {}", fd, address, err);
            set_errno(errno::Errno(err.raw_os_error().unwrap_or(0)));
            return false;
        }

        self.lock_state().remote_address = Some(*address);

        on_connect();

        true
    }

    /// Close the socket.
    ///
    /// With asynchronous writes outstanding the close is only recorded and
    /// happens once the last of them completes; until then the socket stays
    /// fully usable. Calling it on a closed socket does nothing.
    pub fn close(&self) {
        let (released, on_read) = {
            let mut state = self.lock_state();

            if !state.socket.is_valid() {
                return;
            }

            if state.pending_writes > 0 {
                log::debug!(
                    "fd({:?}) close deferred, {} writes pending",
                    state.socket.fd(),
                    state.pending_writes
                );

                state.close_requested = true;

                return;
            }

            if let Some(subscription) = state.read_subscription.take() {
                self.reactor().cancel(subscription);
            }

            let on_read = state.on_read.take();

            state.event_queue = None;

            (state.socket.release(), on_read)
        };

        drop(on_read);

        if let Some((fd, Some(on_close))) = released {
            on_close(fd);
        }
    }

    /// Install the read callback, registering for readiness events if no
    /// subscription exists yet.
    ///
    /// The callback runs on the event queue once per readiness event and is
    /// expected to drain the socket, usually with [`read`](ActiveSocket::read).
    /// Returns whether a subscription is active.
    ///
    /// Use the `&ActiveSocket` argument rather than capturing a clone of this
    /// socket: the socket owns its callback, so a captured handle keeps the
    /// socket alive and its descriptor open until
    /// [`close`](ActiveSocket::close) or
    /// [`clear_on_read`](ActiveSocket::clear_on_read) is called.
    pub fn set_on_read<F>(&self, callback: F) -> bool
    where
        F: FnMut(&ActiveSocket<A, R>) + Send + 'static,
    {
        let callback: ReadCallback<A, R> = Arc::new(Mutex::new(callback));

        let mut state = self.lock_state();

        let previous = state.on_read.replace(callback);

        let subscribed = state.read_subscription.is_some() || self.start_event_handler(&mut state);

        drop(state);
        drop(previous);

        subscribed
    }

    /// Remove the read callback and cancel the readiness subscription.
    /// A notification already queued finds no callback and does nothing.
    pub fn clear_on_read(&self) {
        let (subscription, on_read) = {
            let mut state = self.lock_state();

            (state.read_subscription.take(), state.on_read.take())
        };

        if let Some(subscription) = subscription {
            self.reactor().cancel(subscription);
        }

        drop(on_read);
    }

    fn start_event_handler(&self, state: &mut State<A, R>) -> bool {
        let Some(fd) = state.socket.fd() else {
            log::debug!("Socket closed, can't watch for read events");
            return false;
        };

        let queue = self.ensure_queue(state);

        let reactor = self.reactor();

        let subscription = match reactor.register(fd, EventName::Read, &queue) {
            Ok(subscription) => subscription,
            Err(err) => {
                log::error!("Could not register read events for fd({}), {}", fd, err);
                return false;
            }
        };

        let socket = Arc::downgrade(&self.shared);

        reactor.set_handler(
            &subscription,
            Box::new(move || {
                if let Some(shared) = socket.upgrade() {
                    ActiveSocket { shared }.notify_readable();
                }
            }),
        );

        reactor.resume(&subscription);

        state.read_subscription = Some(subscription);

        true
    }

    fn notify_readable(&self) {
        let callback = self.lock_state().on_read.clone();

        if let Some(callback) = callback {
            let mut callback = lock(&callback);
            (*callback)(self);
        }
    }

    /// Read up to the buffer's read size, blocking until data arrives.
    ///
    /// Returns the OS result and the socket's reusable buffer. On success the
    /// first `count` bytes are valid and followed by a zero byte. A negative
    /// count means failure: consult `errno` (`EBADF` for a closed socket);
    /// the buffer's first byte is zeroed.
    pub fn read(&self) -> (isize, ReadBufferGuard<'_>) {
        let fd = self.fd();

        let mut buffer = lock(&self.shared.read_buffer);

        let Some(fd) = fd else {
            buffer.bytes[0] = 0;
            sys::set_bad_fd();
            return (-1, buffer);
        };

        let read_size = buffer.read_size;

        let len = sys::read(fd, &mut buffer.bytes[..read_size]);

        if len < 0 {
            let e = errno();

            log::debug!("fd({}) read error, {}", fd, e);

            buffer.bytes[0] = 0;

            set_errno(e);

            return (len, buffer);
        }

        buffer.bytes[len as usize] = 0;

        (len, buffer)
    }

    /// Blocking write of `buffer`; returns the OS result (negative on error,
    /// `errno` set).
    pub fn send(&self, buffer: &[u8]) -> isize {
        let Some(fd) = self.fd() else {
            sys::set_bad_fd();
            return -1;
        };

        sys::write(fd, buffer)
    }

    /// Copy `buffer` and write it from the event queue.
    ///
    /// Fails if the socket is closed. An empty buffer succeeds without doing
    /// anything. Completion, successful or not, decrements
    /// [`pending_writes`](ActiveSocket::pending_writes) and performs a close
    /// deferred by [`close`](ActiveSocket::close); failures are only logged.
    pub fn async_write(&self, buffer: &[u8]) -> bool {
        let (fd, queue) = {
            let mut state = self.lock_state();

            let Some(fd) = state.socket.fd() else {
                log::debug!("Socket closed, can't do async writes anymore");
                return false;
            };

            if buffer.is_empty() {
                return true;
            }

            let queue = self.ensure_queue(&mut state);

            state.pending_writes += 1;

            (fd, queue)
        };

        let write = PendingWrite::new(self.clone(), fd, buffer.to_vec(), queue.clone());

        if !queue.dispatch(move || write.start()) {
            self.complete_write(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "event queue closed",
            )));

            return false;
        }

        true
    }

    /// Send the UTF-8 bytes of `string` with
    /// [`async_write`](ActiveSocket::async_write). Empty strings are ignored.
    pub fn write_string(&self, string: &str) {
        if !string.is_empty() {
            self.async_write(string.as_bytes());
        }
    }

    pub(crate) fn complete_write(&self, result: io::Result<usize>) {
        if let Err(err) = &result {
            log::warn!("fd({:?}) async write failed, {}", self.fd(), err);
        }

        let close_now = {
            let mut state = self.lock_state();

            state.pending_writes = state.pending_writes.saturating_sub(1);

            state.pending_writes == 0 && state.close_requested
        };

        if close_now {
            self.close();
            self.lock_state().close_requested = false;
        }
    }
}

impl<A: SocketAddress, R: Reactor> SocketOptions for ActiveSocket<A, R> {
    fn socket_fd(&self) -> Option<RawFd> {
        self.fd()
    }
}

impl<A: SocketAddress, R: Reactor> std::fmt::Write for ActiveSocket<A, R> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.write_string(s);

        Ok(())
    }
}

impl<A: SocketAddress, R: Reactor> Display for ActiveSocket<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();

        write!(f, "<ActiveSocket:")?;

        state.socket.fmt_attributes(f)?;

        if let Some(remote) = &state.remote_address {
            write!(f, " remote={}", remote)?;
        }

        write!(f, ">")
    }
}
