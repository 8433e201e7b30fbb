//! Replay-capable, reference-counted multicast streams.
//!
//! One producer, N subscribers. Built once and reused by `Job::output`,
//! `Job::outbound`, job channels, and the reuse/memoize strategies.
//!
//! `tokio::sync::broadcast` cannot replay to late joiners nor carry a
//! terminal error, so this is built from per-subscriber queues behind a
//! mutex. Subscriber queues are unbounded: fan-out must never block the
//! producing relay, and a subscriber that stops polling only grows its own
//! queue.
//!
//! The producer-side teardown callback runs exactly once, when the stream
//! has completed or errored *and* the last subscriber has detached.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::SharedError;

/// How much history a late subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Future items only.
    None,
    /// The most recent item, then future items.
    Latest,
    /// Every item since the start.
    All,
}

/// How a multicast terminated.
#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Errored(SharedError),
}

enum Event<T> {
    Item(T),
    Error(SharedError),
    Complete,
}

struct Shared<T> {
    replay: Replay,
    buffer: Vec<T>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Event<T>>>,
    next_subscriber: u64,
    /// Live `Subscription` handles, including ones already past the
    /// terminal event. Teardown waits for this to reach zero.
    attached: usize,
    terminal: Option<Terminal>,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

/// A multicast stream handle. Cheap to clone; all clones share the stream.
pub struct Multicast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    /// Create a multicast with the given replay depth.
    pub fn new(replay: Replay) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                replay,
                buffer: Vec::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
                attached: 0,
                terminal: None,
                teardown: None,
            })),
        }
    }

    /// Install the teardown callback. If the teardown condition already
    /// holds, the callback runs immediately.
    pub fn set_teardown(&self, teardown: impl FnOnce() + Send + 'static) {
        let pending = {
            let mut shared = self.shared.lock().expect("multicast lock poisoned");
            shared.teardown = Some(Box::new(teardown));
            take_teardown_if_ready(&mut shared)
        };
        if let Some(teardown) = pending {
            teardown();
        }
    }

    /// Publish an item. Dropped silently after termination.
    pub fn send(&self, item: T) {
        let mut shared = self.shared.lock().expect("multicast lock poisoned");
        if shared.terminal.is_some() {
            return;
        }
        match shared.replay {
            Replay::None => {}
            Replay::Latest => {
                shared.buffer.clear();
                shared.buffer.push(item.clone());
            }
            Replay::All => shared.buffer.push(item.clone()),
        }
        shared
            .subscribers
            .retain(|_, tx| tx.send(Event::Item(item.clone())).is_ok());
    }

    /// Complete the stream. First termination wins.
    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    /// Error the stream. First termination wins.
    pub fn fail(&self, error: SharedError) {
        self.terminate(Terminal::Errored(error));
    }

    /// Whether the stream has completed or errored.
    pub fn is_terminated(&self) -> bool {
        self.shared
            .lock()
            .expect("multicast lock poisoned")
            .terminal
            .is_some()
    }

    /// Attach a new subscriber.
    ///
    /// The subscriber first receives the replay window, then future items.
    /// Subscribing after termination still yields the replay window
    /// followed by the terminal completion or error.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.shared.lock().expect("multicast lock poisoned");
        let shared = &mut *guard;
        for item in &shared.buffer {
            let _ = tx.send(Event::Item(item.clone()));
        }
        let id = shared.next_subscriber;
        shared.next_subscriber += 1;
        match &shared.terminal {
            Some(Terminal::Completed) => {
                let _ = tx.send(Event::Complete);
            }
            Some(Terminal::Errored(error)) => {
                let _ = tx.send(Event::Error(Arc::clone(error)));
            }
            None => {
                shared.subscribers.insert(id, tx);
            }
        }
        shared.attached += 1;
        Subscription {
            id,
            rx,
            finished: false,
            shared: Arc::clone(&self.shared),
        }
    }

    fn terminate(&self, terminal: Terminal) {
        let pending = {
            let mut shared = self.shared.lock().expect("multicast lock poisoned");
            if shared.terminal.is_some() {
                return;
            }
            for (_, tx) in shared.subscribers.drain() {
                let _ = match &terminal {
                    Terminal::Completed => tx.send(Event::Complete),
                    Terminal::Errored(error) => tx.send(Event::Error(Arc::clone(error))),
                };
            }
            shared.terminal = Some(terminal);
            take_teardown_if_ready(&mut shared)
        };
        if let Some(teardown) = pending {
            teardown();
        }
    }
}

fn take_teardown_if_ready<T>(shared: &mut Shared<T>) -> Option<Box<dyn FnOnce() + Send>> {
    if shared.terminal.is_some() && shared.attached == 0 {
        shared.teardown.take()
    } else {
        None
    }
}

/// One subscriber's view of a multicast.
///
/// Yields `Ok` items until the stream completes (end of stream) or errors
/// (a final `Err`). Dropping the subscription detaches it.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event<T>>,
    finished: bool,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Clone + Send + 'static> Stream for Subscription<T> {
    type Item = Result<T, SharedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Event::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Event::Error(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(Event::Complete)) | Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let pending = {
            let mut shared = self.shared.lock().expect("multicast lock poisoned");
            shared.subscribers.remove(&self.id);
            shared.attached = shared.attached.saturating_sub(1);
            take_teardown_if_ready(&mut shared)
        };
        if let Some(teardown) = pending {
            teardown();
        }
    }
}
