//! Bounded SDU Queue
//!
//! FIFO between the upper layer and the Tx engine. Writers may block while
//! the queue is full; closing the queue wakes them and rejects the SDU.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug)]
struct QueueState {
    sdus: VecDeque<Bytes>,
    capacity: usize,
    size_bytes: usize,
    closed: bool,
}

/// Bounded, byte-accounted SDU queue
#[derive(Debug)]
pub struct SduQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
}

impl SduQueue {
    /// Create a queue holding at most `capacity` SDUs
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                sdus: VecDeque::with_capacity(capacity),
                capacity,
                size_bytes: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue, waiting while the queue is full
    ///
    /// Returns the SDU if the queue was closed before space became available.
    pub fn write(&self, sdu: Bytes) -> Result<(), Bytes> {
        let mut state = self.state.lock();
        while !state.closed && state.sdus.len() >= state.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(sdu);
        }
        state.size_bytes += sdu.len();
        state.sdus.push_back(sdu);
        Ok(())
    }

    /// Enqueue without waiting, handing the SDU back when full or closed
    pub fn try_write(&self, sdu: Bytes) -> Result<(), Bytes> {
        let mut state = self.state.lock();
        if state.closed || state.sdus.len() >= state.capacity {
            return Err(sdu);
        }
        state.size_bytes += sdu.len();
        state.sdus.push_back(sdu);
        Ok(())
    }

    /// Dequeue the oldest SDU
    pub fn read(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let sdu = state.sdus.pop_front()?;
        state.size_bytes -= sdu.len();
        self.not_full.notify_one();
        Some(sdu)
    }

    pub fn size(&self) -> usize {
        self.state.lock().sdus.len()
    }

    /// Total payload bytes queued
    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sdus.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Drop all queued SDUs, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.sdus.len();
        state.sdus.clear();
        state.size_bytes = 0;
        self.not_full.notify_all();
        dropped
    }

    /// Change the capacity; SDUs beyond it stay queued until read
    pub fn resize(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        self.not_full.notify_all();
    }

    /// Reject further writes and release blocked writers
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
    }

    pub fn open(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
