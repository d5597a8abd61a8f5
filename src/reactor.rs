//! Readiness subscriptions and the poller backed reactor.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    io::Result,
    os::fd::RawFd,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use crate::{
    poller::{EventName, Key, SysPoller},
    queue::EventQueue,
};

/// Readiness handler, invoked on the subscription's queue once per event.
pub type Handler = Box<dyn FnMut() + Send + 'static>;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a registration returned by [`Reactor::register`].
///
/// Owned by whoever registered it and given back through
/// [`Reactor::cancel`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    key: Key,
}

impl Subscription {
    /// Build a handle; reactor implementations pick `id`.
    pub fn new(id: u64, fd: RawFd, event: EventName) -> Self {
        Self {
            id,
            key: Key(fd, event),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.key.0
    }

    pub fn event(&self) -> EventName {
        self.key.1
    }
}

/// Readiness notification service consumed by the sockets.
///
/// A subscription is inert until it has a handler and has been resumed.
/// Sockets always resume a subscription before they cancel it.
pub trait Reactor: Clone + Send + Sync + 'static {
    /// Watch `fd` for `event`; handlers will be scheduled on `queue`.
    fn register(&self, fd: RawFd, event: EventName, queue: &EventQueue) -> Result<Subscription>;

    /// Install the handler called for each readiness event.
    fn set_handler(&self, subscription: &Subscription, handler: Handler);

    /// Start delivering events.
    fn resume(&self, subscription: &Subscription);

    /// Stop delivering events. A handler already queued still runs.
    fn cancel(&self, subscription: Subscription);
}

struct Entry {
    key: Key,
    queue: EventQueue,
    handler: Option<Arc<Mutex<Handler>>>,
    resumed: bool,
    in_flight: bool,
}

impl Entry {
    fn armed(&self) -> bool {
        self.resumed && !self.in_flight && self.handler.is_some()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// [`Reactor`] backed by the system poller (epoll or kqueue).
///
/// Cloning is cheap; clones share the registrations. Somebody has to call
/// [`poll_once`](IoReactor::poll_once) in a loop to deliver events, and the
/// queues the handlers land on have to be drained.
#[derive(Clone)]
pub struct IoReactor {
    poller: SysPoller,
    registry: Arc<Mutex<Registry>>,
}

impl Debug for IoReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoReactor")
            .field("poller", &self.poller)
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

impl IoReactor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poller: SysPoller::new()?,
            registry: Default::default(),
        })
    }

    /// Number of live subscriptions.
    pub fn subscriptions(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// Poll io events once and dispatch the fired handlers onto their queues.
    ///
    /// A handler is not armed again until its queued invocation has run, so
    /// it never runs concurrently with itself. Registrations made while this
    /// call blocks are picked up by the next call. Returns the number of
    /// handlers dispatched.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        let keys = {
            let registry = lock(&self.registry);

            registry
                .entries
                .values()
                .filter(|entry| entry.armed())
                .map(|entry| entry.key)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
        };

        let fired = self.poller.poll_once(&keys, timeout)?;

        if fired.is_empty() {
            return Ok(0);
        }

        let fired = fired.into_iter().collect::<HashSet<_>>();

        let mut registry = lock(&self.registry);

        let mut dispatched = 0;

        for (id, entry) in registry.entries.iter_mut() {
            if !entry.armed() || !fired.contains(&entry.key) {
                continue;
            }

            let Some(handler) = entry.handler.clone() else {
                continue;
            };

            entry.in_flight = true;

            let id = *id;
            let weak_registry = Arc::downgrade(&self.registry);

            if entry
                .queue
                .dispatch(move || Self::run_handler(id, handler, weak_registry))
            {
                dispatched += 1;
            } else {
                entry.in_flight = false;
            }
        }

        log::trace!("poll_once({})", dispatched);

        Ok(dispatched)
    }

    fn run_handler(id: u64, handler: Arc<Mutex<Handler>>, registry: Weak<Mutex<Registry>>) {
        {
            let mut handler = lock(&handler);
            (*handler)();
        }

        if let Some(registry) = registry.upgrade() {
            if let Some(entry) = lock(&registry).entries.get_mut(&id) {
                entry.in_flight = false;
            }
        }
    }
}

impl Reactor for IoReactor {
    fn register(&self, fd: RawFd, event: EventName, queue: &EventQueue) -> Result<Subscription> {
        let mut registry = lock(&self.registry);

        registry.next_id += 1;

        let id = registry.next_id;

        registry.entries.insert(
            id,
            Entry {
                key: Key(fd, event),
                queue: queue.clone(),
                handler: None,
                resumed: false,
                in_flight: false,
            },
        );

        log::trace!("register subscription({}) {} on '{}'", id, Key(fd, event), queue.label());

        Ok(Subscription::new(id, fd, event))
    }

    fn set_handler(&self, subscription: &Subscription, handler: Handler) {
        if let Some(entry) = lock(&self.registry).entries.get_mut(&subscription.id) {
            entry.handler = Some(Arc::new(Mutex::new(handler)));
        }
    }

    fn resume(&self, subscription: &Subscription) {
        if let Some(entry) = lock(&self.registry).entries.get_mut(&subscription.id) {
            entry.resumed = true;
        }
    }

    fn cancel(&self, subscription: Subscription) {
        let removed = lock(&self.registry).entries.remove(&subscription.id);

        log::trace!("cancel subscription({}) {}", subscription.id, subscription.key);

        // drop the handler outside the registry lock
        drop(removed);
    }
}
