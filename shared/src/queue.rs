//! Import work queue
//!
//! A two-lane queue shared by the loader and every import worker. Fresh
//! batches from the loader go to the back of a bounded lane; batches with
//! unprocessed records come back on a separate retry lane that is always
//! drained first, so retries never starve behind a long stream of fresh work.
//!
//! Every popped item is owned by exactly one worker until it hands it back
//! with [`ImportQueue::complete`] or [`ImportQueue::requeue`].
//!
//! Workers register as consumers. Once the last one has left, pushes fail
//! instead of parking batches nobody will ever write.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::errors::{Error, Result};
use crate::models::{Record, WorkItem};

#[derive(Debug, Default)]
struct Lanes {
    retry: VecDeque<WorkItem>,
    fresh: VecDeque<WorkItem>,
    /// Items currently claimed by a worker
    in_flight: usize,
    next_sequence: u64,
    closed: bool,
    consumers: usize,
    /// Every registered consumer has left
    abandoned: bool,
}

/// What a worker gets back from [`ImportQueue::pop`]
#[derive(Debug)]
pub enum Pop {
    Item(WorkItem),
    /// Nothing available right now
    Empty,
    /// Loader finished, both lanes empty, nothing in flight
    Drained,
}

/// Shared import queue
#[derive(Debug)]
pub struct ImportQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl ImportQueue {
    /// Create a queue whose fresh lane holds at most `capacity` batches
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a fresh batch, waiting while the fresh lane is full
    ///
    /// Returns the batch's sequence number, or an error once every consumer
    /// has left.
    pub async fn push(&self, records: Vec<Record>) -> Result<u64> {
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut lanes = self.lock();
                if lanes.abandoned {
                    return Err(Error::Internal(
                        "import workers stopped before the source was fully loaded".into(),
                    ));
                }
                if lanes.fresh.len() < self.capacity {
                    let sequence = lanes.next_sequence;
                    lanes.next_sequence += 1;
                    lanes.fresh.push_back(WorkItem::new(sequence, records));
                    drop(lanes);
                    self.item_ready.notify_one();
                    return Ok(sequence);
                }
            }
            space.await;
        }
    }

    /// Put a partially written batch back at the front of the retry lane
    ///
    /// The caller must have popped an item before; this releases its claim.
    pub fn requeue(&self, item: WorkItem) {
        let mut lanes = self.lock();
        lanes.in_flight = lanes.in_flight.saturating_sub(1);
        lanes.retry.push_front(item);
        drop(lanes);
        self.item_ready.notify_one();
    }

    /// Release the claim on a popped item that needs no more work
    pub fn complete(&self) {
        let mut lanes = self.lock();
        lanes.in_flight = lanes.in_flight.saturating_sub(1);
        let drained = lanes.closed && lanes.in_flight == 0 && lanes.retry.is_empty() && lanes.fresh.is_empty();
        drop(lanes);
        if drained {
            self.item_ready.notify_waiters();
        }
    }

    /// Register a worker that will pop from this queue
    pub fn join_consumer(&self) {
        self.lock().consumers += 1;
    }

    /// A registered worker stopped popping
    pub fn leave_consumer(&self) {
        let mut lanes = self.lock();
        lanes.consumers = lanes.consumers.saturating_sub(1);
        if lanes.consumers == 0 {
            lanes.abandoned = true;
            drop(lanes);
            self.space_ready.notify_waiters();
        }
    }

    /// Mark the loader as finished; no more fresh batches will arrive
    pub fn close(&self) {
        self.lock().closed = true;
        self.item_ready.notify_waiters();
    }

    fn try_pop(&self) -> Pop {
        let mut lanes = self.lock();
        if let Some(item) = lanes.retry.pop_front() {
            lanes.in_flight += 1;
            return Pop::Item(item);
        }
        if let Some(item) = lanes.fresh.pop_front() {
            lanes.in_flight += 1;
            drop(lanes);
            self.space_ready.notify_one();
            return Pop::Item(item);
        }
        if lanes.closed && lanes.in_flight == 0 {
            Pop::Drained
        } else {
            Pop::Empty
        }
    }

    /// Claim the next item, waiting at most `wait` for one to show up
    pub async fn pop(&self, wait: Duration) -> Pop {
        let deadline = Instant::now() + wait;
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            match self.try_pop() {
                Pop::Empty => {}
                other => return other,
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Batches waiting in both lanes
    pub fn len(&self) -> usize {
        let lanes = self.lock();
        lanes.retry.len() + lanes.fresh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }
}
