//! Event queue between request handlers and the single streaming consumer.
//!
//! Producers call [`EventBus::publish`], which never blocks or fails.  One
//! consumer at a time holds a [`Drain`] and receives events in publish order.
//! The queue is bounded; on overflow the oldest queued event is discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::Stream;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

use crate::events::Event;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("an event consumer is already attached")]
    ConsumerBusy,
}

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    leased: AtomicBool,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
                leased: AtomicBool::new(false),
            }),
        }
    }

    pub fn publish(&self, event: Event) {
        {
            let mut queue = self.inner.queue();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = self.inner.capacity,
                    dropped, "event queue full; dropped oldest event"
                );
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
    }

    /// Attach the consumer.  Fails while another [`Drain`] is alive.
    pub fn drain(&self) -> Result<Drain, BusError> {
        self.inner
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BusError::ConsumerBusy)?;
        Ok(Drain {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded due to overflow since start-up.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn has_consumer(&self) -> bool {
        self.inner.leased.load(Ordering::Acquire)
    }
}

/// Exclusive consumer lease.  Dropping it lets another consumer attach;
/// events not yet received stay queued.
pub struct Drain {
    inner: Arc<Inner>,
}

impl Drain {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.inner.queue().pop_front() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Endless stream of events.  An event is removed from the queue when the
    /// stream yields it, whether or not the consumer ever sees it.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |mut drain| async move {
            let event = drain.recv().await;
            Some((event, drain))
        })
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.inner.leased.store(false, Ordering::Release);
    }
}
