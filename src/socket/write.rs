use std::{
    io,
    os::fd::RawFd,
    sync::{Arc, Mutex},
    task::Poll,
};

use crate::{
    addr::SocketAddress,
    poller::EventName,
    queue::EventQueue,
    reactor::{lock, Reactor, Subscription},
    sys,
};

use super::ActiveSocket;

type WriteCell<A, R> = Arc<Mutex<Option<PendingWrite<A, R>>>>;

/// One in-progress [`ActiveSocket::async_write`].
///
/// Owns a copy of the caller's bytes and a handle to the socket. Sends as
/// much as the descriptor accepts without blocking, even on a blocking
/// descriptor; if it stops accepting, waits for write readiness on the
/// socket's queue and continues there.
pub(crate) struct PendingWrite<A: SocketAddress, R: Reactor> {
    socket: ActiveSocket<A, R>,
    fd: RawFd,
    data: Vec<u8>,
    written: usize,
    queue: EventQueue,
    subscription: Option<Subscription>,
}

impl<A: SocketAddress, R: Reactor> PendingWrite<A, R> {
    pub(crate) fn new(socket: ActiveSocket<A, R>, fd: RawFd, data: Vec<u8>, queue: EventQueue) -> Self {
        Self {
            socket,
            fd,
            data,
            written: 0,
            queue,
            subscription: None,
        }
    }

    /// Write until all data is out, the descriptor would block or an error
    /// occurs.
    fn poll_flush(&mut self) -> Poll<io::Result<usize>> {
        while self.written < self.data.len() {
            // the socket may have been closed under us
            if self.socket.fd() != Some(self.fd) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket closed during write",
                )));
            }

            let len = match sys::send_nonblocking(self.fd, &self.data[self.written..]) {
                Ok(0) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            };

            self.written += len;
        }

        Poll::Ready(Ok(self.written))
    }

    /// Run the first flush; called on the socket's queue.
    pub(crate) fn start(self) {
        Self::resume(&Arc::new(Mutex::new(Some(self))));
    }

    fn resume(cell: &WriteCell<A, R>) {
        let mut slot = lock(cell);

        let Some(write) = slot.as_mut() else {
            return;
        };

        let result = match write.poll_flush() {
            Poll::Pending if write.subscription.is_some() => return,
            Poll::Pending => match write.wait_writable(cell) {
                Ok(()) => return,
                Err(err) => Err(err),
            },
            Poll::Ready(result) => result,
        };

        let Some(mut write) = slot.take() else {
            return;
        };

        drop(slot);

        if let Some(subscription) = write.subscription.take() {
            write.socket.reactor().cancel(subscription);
        }

        log::trace!(
            "fd({}) async write done, {} of {} bytes",
            write.fd,
            write.written,
            write.data.len()
        );

        write.socket.complete_write(result);
    }

    fn wait_writable(&mut self, cell: &WriteCell<A, R>) -> io::Result<()> {
        let reactor = self.socket.reactor();

        let subscription = reactor.register(self.fd, EventName::Write, &self.queue)?;

        // the reactor keeps the write alive until the subscription is cancelled
        let cell = cell.clone();

        reactor.set_handler(
            &subscription,
            Box::new(move || {
                Self::resume(&cell);
            }),
        );

        reactor.resume(&subscription);

        self.subscription = Some(subscription);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        addr::UnixAddress, context::ContextBuilder, queue::EventQueue, reactor::IoReactor,
        socket::ActiveSocket, sys,
    };

    #[test]
    fn large_write_on_blocking_fd_resumes_on_writable() {
        _ = pretty_env_logger::try_init();

        let queue = EventQueue::new("write");

        let reactor = IoReactor::new().unwrap();

        let context = ContextBuilder::new()
            .default_queue(queue.clone())
            .reactor(reactor.clone());

        // descriptors stay in blocking mode
        let (a, peer) = sys::socketpair().unwrap();

        let socket = ActiveSocket::<UnixAddress, _>::from_fd(&context, Some(a), None);

        let data = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        assert!(socket.async_write(&data));

        // returns with the buffer full instead of blocking the queue
        assert_eq!(queue.run_pending(), 1);

        // the socket buffer is full, the write now waits for readiness
        assert_eq!(socket.pending_writes(), 1);
        assert_eq!(reactor.subscriptions(), 1);

        let mut received = Vec::with_capacity(data.len());
        let mut buf = vec![0u8; 64 * 1024];

        while received.len() < data.len() {
            let len = sys::read(peer, &mut buf);

            assert!(len > 0);

            received.extend_from_slice(&buf[..len as usize]);

            reactor.poll_once(Duration::from_millis(10)).unwrap();
            queue.run_pending();
        }

        assert_eq!(received, data);
        assert_eq!(socket.pending_writes(), 0);
        assert_eq!(reactor.subscriptions(), 0);

        sys::close(peer).unwrap();
    }
}
