//! Serial event queue that socket callbacks are scheduled onto.

use std::{fmt::Debug, sync::Arc};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    lock::Mutex,
    FutureExt, StreamExt,
};

/// Unit of work executed by an [`EventQueue`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Clonable handle to a FIFO of tasks that run one after another.
///
/// The queue owns no thread. Tasks run when somebody drains it, either with
/// [`run_pending`](EventQueue::run_pending) from a plain thread or by awaiting
/// [`run`](EventQueue::run) on an executor. Drains never overlap, so tasks on
/// one queue never run concurrently with each other.
#[derive(Clone)]
pub struct EventQueue {
    label: Arc<str>,
    sender: UnboundedSender<Task>,
    receiver: Arc<Mutex<UnboundedReceiver<Task>>>,
}

impl EventQueue {
    /// Create a new queue. `label` only shows up in diagnostics.
    pub fn new<L: AsRef<str>>(label: L) -> Self {
        let (sender, receiver) = unbounded();

        Self {
            label: Arc::from(label.as_ref()),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Schedule `task` at the end of the queue.
    ///
    /// Returns false if the queue was closed; the task is dropped unrun.
    pub fn dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.unbounded_send(Box::new(task)) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("event queue '{}' closed, task dropped", self.label);
                false
            }
        }
    }

    /// Run queued tasks until the queue is empty, including tasks dispatched
    /// while draining. Returns the number of tasks run.
    ///
    /// Returns 0 immediately if another drain is in progress.
    pub fn run_pending(&self) -> usize {
        let Some(mut receiver) = self.receiver.try_lock() else {
            return 0;
        };

        let mut count = 0;

        while let Some(Some(task)) = receiver.next().now_or_never() {
            task();
            count += 1;
        }

        if count > 0 {
            log::trace!("event queue '{}' ran {} tasks", self.label, count);
        }

        count
    }

    /// Run tasks as they arrive until the queue is [`closed`](EventQueue::close)
    /// and empty. Returns the number of tasks run.
    pub async fn run(&self) -> usize {
        let mut receiver = self.receiver.lock().await;

        let mut count = 0;

        while let Some(task) = receiver.next().await {
            task();
            count += 1;
        }

        count
    }

    /// Stop accepting tasks. Tasks already queued still run.
    pub fn close(&self) {
        self.sender.close_channel();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl PartialEq for EventQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

impl Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
