//! Explicit configuration shared by the sockets of one event loop.

use crate::{queue::EventQueue, reactor::Reactor};

/// Bytes a synchronous read asks the OS for by default.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Reactor, default event queue and read buffer sizing handed to every
/// [`ActiveSocket`](crate::socket::ActiveSocket) and
/// [`PassiveSocket`](crate::socket::PassiveSocket).
///
/// The default queue is adopted by a socket that needs to schedule work
/// before anybody called `set_event_queue` on it.
#[derive(Clone, Debug)]
pub struct SocketContext<R: Reactor> {
    reactor: R,
    default_queue: EventQueue,
    read_size: usize,
}

impl<R: Reactor> SocketContext<R> {
    /// Context with a fresh `"default"` queue and [`DEFAULT_READ_SIZE`].
    pub fn new(reactor: R) -> Self {
        ContextBuilder::default().reactor(reactor)
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn default_queue(&self) -> &EventQueue {
        &self.default_queue
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }
}

/// Builder for [`SocketContext`].
#[derive(Default, Debug)]
pub struct ContextBuilder {
    pub default_queue: Option<EventQueue>,
    pub read_size: Option<usize>,
}

impl ContextBuilder {
    /// Create a context builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_queue(mut self, queue: EventQueue) -> Self {
        self.default_queue = Some(queue);

        self
    }

    /// Maximum bytes per synchronous read. The buffer keeps two extra bytes
    /// for the terminating zero.
    pub fn read_size(mut self, read_size: usize) -> Self {
        self.read_size = Some(read_size);

        self
    }

    pub fn reactor<R: Reactor>(self, reactor: R) -> SocketContext<R> {
        SocketContext {
            reactor,
            default_queue: self
                .default_queue
                .unwrap_or_else(|| EventQueue::new("default")),
            read_size: self.read_size.unwrap_or(DEFAULT_READ_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{queue::EventQueue, reactor::IoReactor};

    use super::*;

    #[test]
    fn defaults() {
        let context = SocketContext::new(IoReactor::new().unwrap());

        assert_eq!(context.read_size(), DEFAULT_READ_SIZE);
        assert_eq!(context.default_queue().label(), "default");
    }

    #[test]
    fn builder_overrides() {
        let queue = EventQueue::new("main");

        let context = ContextBuilder::new()
            .default_queue(queue.clone())
            .read_size(16)
            .reactor(IoReactor::new().unwrap());

        assert_eq!(context.read_size(), 16);
        assert_eq!(context.default_queue(), &queue);
    }
}
