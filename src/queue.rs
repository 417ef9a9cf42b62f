//! Ordered admission gate
//!
//! A [`Queue`] hands out [`Entry`] handles in FIFO order. Only the head entry
//! is admitted; every other entry waits until the entries ahead of it are
//! released. Clearing the queue cancels every waiter and starts a new
//! generation, so handles that survive a clear can never disturb entries
//! added afterwards.

use crate::error::Error;
use crate::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Admitted,
    Cancelled,
}

struct Slot {
    id: u64,
    /// `None` once the slot has been admitted
    signal: Option<oneshot::Sender<Release>>,
}

struct QueueState {
    slots: VecDeque<Slot>,
    generation: u64,
    next_id: u64,
}

impl QueueState {
    fn admit_head(&mut self) {
        if let Some(head) = self.slots.front_mut() {
            if let Some(signal) = head.signal.take() {
                // A dropped receiver means the entry is going away and will
                // remove its own slot.
                let _ = signal.send(Release::Admitted);
            }
        }
    }

    fn pop_head(&mut self) {
        self.slots.pop_front();
        self.admit_head();
    }
}

/// FIFO admission gate shared by one consumer.
pub struct Queue<T> {
    state: Arc<Mutex<QueueState>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                slots: VecDeque::new(),
                generation: 0,
                next_id: 0,
            })),
            _marker: PhantomData,
        }
    }

    /// Append `value` and return its handle.
    ///
    /// The entry is admitted immediately when nothing is ahead of it.
    pub fn add(&self, value: T) -> Entry<T> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let status = if state.slots.is_empty() {
            state.slots.push_back(Slot { id, signal: None });
            Status::Admitted
        } else {
            let (tx, rx) = oneshot::channel();
            state.slots.push_back(Slot {
                id,
                signal: Some(tx),
            });
            Status::Pending(rx)
        };

        Entry {
            value,
            id,
            generation: state.generation,
            status,
            state: Arc::clone(&self.state),
        }
    }

    /// Remove the head entry and admit the next one.
    pub fn next(&self) {
        self.state.lock().pop_head();
    }

    /// Cancel every entry and empty the queue.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        for slot in state.slots.drain(..) {
            if let Some(signal) = slot.signal {
                let _ = signal.send(Release::Cancelled);
            }
        }
    }

    /// Number of entries, including the admitted head.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("len", &state.slots.len())
            .field("generation", &state.generation)
            .finish()
    }
}

enum Status {
    Pending(oneshot::Receiver<Release>),
    Admitted,
    Cancelled,
}

/// Handle to one queued value.
///
/// Dropping the handle releases it: the queue advances if this was the
/// admitted head, and a still-pending entry is removed from the line.
pub struct Entry<T> {
    value: T,
    id: u64,
    generation: u64,
    status: Status,
    state: Arc<Mutex<QueueState>>,
}

impl<T> Entry<T> {
    /// Wait until every entry ahead of this one has been released.
    ///
    /// Returns [`Error::Cancelled`] if the queue was cleared first. Waiting
    /// again on an admitted entry returns immediately.
    pub async fn wait(&mut self) -> Result<()> {
        if let Status::Pending(rx) = &mut self.status {
            let outcome = rx.await;
            self.status = match outcome {
                Ok(Release::Admitted) => Status::Admitted,
                Ok(Release::Cancelled) | Err(_) => Status::Cancelled,
            };
        }

        if matches!(self.status, Status::Admitted) && self.is_current() {
            return Ok(());
        }
        self.status = Status::Cancelled;
        Err(Error::Cancelled)
    }

    /// Whether the queue has not been cleared since this entry was added.
    pub fn is_current(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    /// The queued value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Release the entry, advancing the queue if it is the admitted head.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Drop for Entry<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.generation != self.generation {
            return;
        }
        match state.slots.iter().position(|slot| slot.id == self.id) {
            Some(0) => state.pop_head(),
            Some(index) => {
                state.slots.remove(index);
            }
            None => {}
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            Status::Pending(_) => "pending",
            Status::Admitted => "admitted",
            Status::Cancelled => "cancelled",
        };
        f.debug_struct("Entry")
            .field("value", &self.value)
            .field("id", &self.id)
            .field("status", &status)
            .finish()
    }
}
