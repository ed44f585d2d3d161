//! Per-connection queue of outstanding writes.
//!
//! Every send takes a [`WriteHandle`] from a small free-list pool and parks
//! the message next to it until the transport reports completion. The writer
//! task for a connection drains its commands in order, so completions
//! normally retire the queue head; the handle is still matched explicitly so
//! a stray completion can never retire the wrong message.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::message::MessageBuffer;

/// Identifies one in-flight write. Slots are reused, the generation tells
/// two uses of the same slot apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    issued_at: Option<Instant>,
}

/// Index-addressed pool of reusable write slots.
#[derive(Debug, Default)]
pub struct HandlePool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandlePool {
    pub fn acquire(&mut self) -> WriteHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    issued_at: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.issued_at = Some(Instant::now());
        WriteHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Returns the slot to the free list. Yields how long the write was
    /// outstanding, or `None` when the handle is stale.
    pub fn release(&mut self, handle: WriteHandle) -> Option<Duration> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let issued_at = slot.issued_at.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(issued_at.elapsed())
    }

    /// Slots ever allocated, busy or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// A write retired from the queue.
#[derive(Debug)]
pub struct Completed {
    pub message: MessageBuffer,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<(WriteHandle, MessageBuffer)>,
    pool: HandlePool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message` and returns the handle the transport must echo back
    /// on completion.
    pub fn push(&mut self, message: MessageBuffer) -> WriteHandle {
        let handle = self.pool.acquire();
        self.pending.push_back((handle, message));
        handle
    }

    /// Retires the write identified by `handle`, reclaiming its slot.
    pub fn complete(&mut self, handle: WriteHandle) -> Option<Completed> {
        let position = match self.pending.front() {
            Some((head, _)) if *head == handle => 0,
            _ => self.pending.iter().position(|(queued, _)| *queued == handle)?,
        };

        let (handle, message) = self.pending.remove(position)?;
        let elapsed = self.pool.release(handle).unwrap_or_default();
        Some(Completed { message, elapsed })
    }

    /// Drops every queued message and frees their slots.
    pub fn clear(&mut self) {
        for (handle, _) in self.pending.drain(..) {
            self.pool.release(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }
}
