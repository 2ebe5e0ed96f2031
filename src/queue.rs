//! Generic FIFO with suspending dequeue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// FIFO handoff between a synchronous producer and suspended consumers.
///
/// `push` appends and then hands buffered items to registered waiters,
/// oldest waiter first, one item each. `shift` returns the head
/// immediately when the buffer is non-empty and otherwise suspends until
/// a later push satisfies it. `unshift` splices an item ahead of
/// everything buffered, which is how a timed-out dequeue returns its
/// item without losing or reordering it.
///
/// `len` counts buffered-but-undelivered items only; waiters are not
/// counted.
pub struct WaitQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

impl<T: Send + 'static> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Append an item, then wake waiters while both the buffer and the
    /// waiter list are non-empty.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.buffer.push_back(item);
        inner.wake();
    }

    /// Prepend an item ahead of everything buffered, then run the same
    /// wake logic as [`push`](Self::push).
    pub fn unshift(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.buffer.push_front(item);
        inner.wake();
    }

    /// Dequeue the oldest item, suspending until one is available.
    pub async fn shift(&self) -> T {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.buffer.pop_front() {
                return item;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        rx.await.expect("wait queue dropped a registered waiter")
    }

    /// Dequeue with a deadline. Returns `None` when the timer wins the
    /// race; an item handed to the abandoned waiter afterwards is spliced
    /// back to the front of the queue so delivery stays exactly-once and
    /// in order.
    pub async fn shift_timeout(self: Arc<Self>, timeout: Duration) -> Option<T> {
        let mut rx = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.buffer.pop_front() {
                return Some(item);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(item)) => Some(item),
            Ok(Err(_)) => None,
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(item) = rx.await {
                        self.unshift(item);
                    }
                });
                None
            }
        }
    }
}

impl<T> Inner<T> {
    fn wake(&mut self) {
        while !self.buffer.is_empty() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let item = self.buffer.pop_front().expect("buffer checked non-empty");
            if let Err(item) = waiter.send(item) {
                // Receiver gave up (timed out or dropped); the item stays
                // at the head for the next taker.
                self.buffer.push_front(item);
            }
        }
    }
}

impl<T: Send + 'static> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WaitQueue")
            .field("len", &inner.buffer.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
