//! Growable ring buffer of `(event, payload)` pairs backing a machine's
//! mailbox.

use hsm_value::{EventId, Payload};

use crate::event_set::EventSet;

/// Returned when an enqueue would exceed the triggering event's
/// max-instances bound. The caller (the executor) attaches the machine id
/// before surfacing [`crate::error::RuntimeError::QueueOverflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// A single-producer-multi-consumer-in-effect queue, serialized externally by
/// the owning machine's lock. None of these methods take their own lock.
#[derive(Debug)]
pub struct EventQueue<P: Payload> {
    entries: Vec<Option<(EventId, P)>>,
    head: usize,
    len: usize,
}

impl<P: Payload> EventQueue<P> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn physical(&self, logical_index: usize) -> usize {
        (self.head + logical_index) % self.capacity()
    }

    /// Number of entries currently queued for `event`, for max-instances
    /// enforcement.
    pub fn count(&self, event: EventId) -> usize {
        (0..self.len)
            .filter(|&i| self.entries[self.physical(i)].as_ref().unwrap().0 == event)
            .count()
    }

    /// Appends `(event, payload)` at the tail. Grows the backing storage by
    /// doubling when full. Fails without mutating the queue if `event`'s
    /// max-instances bound (0 = unbounded) is already met.
    pub fn enqueue(
        &mut self,
        event: EventId,
        payload: P,
        max_instances: u32,
    ) -> Result<(), QueueFull> {
        if max_instances != 0 && self.count(event) >= max_instances as usize {
            return Err(QueueFull);
        }
        if self.len == self.capacity() {
            self.grow();
        }
        let tail = self.physical(self.len);
        self.entries[tail] = Some((event, payload));
        self.len += 1;
        Ok(())
    }

    fn grow(&mut self) {
        let old_capacity = self.capacity();
        let new_capacity = old_capacity * 2;
        let mut grown = Vec::with_capacity(new_capacity);
        for i in 0..self.len {
            let phys = self.physical(i);
            grown.push(self.entries[phys].take());
        }
        grown.resize_with(new_capacity, || None);
        self.entries = grown;
        self.head = 0;
    }

    /// Scans from the head for the first entry whose event id is not a
    /// member of `deferred`, returning its logical index. Entries ahead of it
    /// that *are* deferred are skipped in place, preserving their relative
    /// order.
    pub fn find_deliverable(&self, deferred: &EventSet) -> Option<usize> {
        (0..self.len).find(|&i| {
            let (event, _) = self.entries[self.physical(i)].as_ref().unwrap();
            !deferred.member(event.0)
        })
    }

    /// Removes the entry at `logical_index`, shifting the tail region back by
    /// one so FIFO order of the remaining entries is preserved.
    pub fn remove_at(&mut self, logical_index: usize) -> (EventId, P) {
        assert!(logical_index < self.len, "remove_at out of bounds");
        let phys = self.physical(logical_index);
        let removed = self.entries[phys].take().expect("slot occupied");
        for i in logical_index..self.len - 1 {
            let from = self.physical(i + 1);
            let to = self.physical(i);
            self.entries[to] = self.entries[from].take();
        }
        self.len -= 1;
        removed
    }

    /// Convenience combining [`Self::find_deliverable`] and
    /// [`Self::remove_at`] under one borrow, used by `DequeuePhase`.
    pub fn take_deliverable(&mut self, deferred: &EventSet) -> Option<(EventId, P)> {
        let index = self.find_deliverable(deferred)?;
        Some(self.remove_at(index))
    }
}
