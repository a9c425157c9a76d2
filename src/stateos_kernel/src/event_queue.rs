//! Bounded event queues.
//!
//! An event queue is a circular buffer of machine words with a blocking
//! producer/consumer rendezvous. Parked peers carry their in-flight word in
//! the wait record: a consumer freeing a slot re-injects a blocked
//! producer's word, and a producer filling an empty buffer hands its word to
//! a blocked consumer, so FIFO order is preserved across the block/wake
//! boundary in both directions.
use core::{alloc::Layout, cell::Cell, fmt, ptr::NonNull};

use crate::{
    clock::Tick,
    error::{PollError, WaitError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockToken, CpuLockTokenRefMut},
    object::{ObjectHeader, ResourceHandle},
    state, task,
    wait::{QueueOrder, WaitPayload},
    Port,
};

/// The element type of an event queue: one unsigned machine word.
pub type EventWord = usize;

/// Circular-buffer indices.
///
/// `count == (tail - head) mod limit` except at `count == limit`, where both
/// indices coincide as well.
struct Ring {
    /// Next position to read from.
    head: usize,
    /// Next position to write to.
    tail: usize,
    /// Number of stored words.
    count: usize,
}

impl Ring {
    const EMPTY: Self = Self {
        head: 0,
        tail: 0,
        count: 0,
    };

    /// Claim the slot at `head` for reading and advance the ring state.
    fn pop_slot(&mut self, limit: usize) -> usize {
        debug_assert!(self.count > 0);
        let slot = self.head;
        self.head += 1;
        if self.head == limit {
            self.head = 0;
        }
        self.count -= 1;
        slot
    }

    /// Claim the slot at `tail` for writing and advance the ring state.
    fn push_slot(&mut self, limit: usize) -> usize {
        debug_assert!(self.count < limit);
        let slot = self.tail;
        self.tail += 1;
        if self.tail == limit {
            self.tail = 0;
        }
        self.count += 1;
        slot
    }
}

impl Clone for Ring {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for Ring {}

/// The buffer an event queue stores words in.
struct Storage {
    data: NonNull<EventWord>,
    limit: usize,
}

// Safety: the buffer is only accessed under the CPU Lock
unsafe impl Send for Storage {}

impl Clone for Storage {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for Storage {}

/// A bounded FIFO of [`EventWord`]s with blocking producer/consumer
/// rendezvous and a non-blocking overwrite mode.
///
/// While a consumer is parked the buffer is empty, and while a producer is
/// parked the buffer is full; the two parked populations never coexist.
pub struct EventQueue<Traits: Port> {
    obj: ObjectHeader<Traits>,

    ring: CpuLockCell<Traits, Ring>,

    storage: CpuLockCell<Traits, Option<Storage>>,
}

impl<Traits: Port> EventQueue<Traits> {
    /// Construct an event queue with a FIFO waiter queue. The queue is
    /// unusable until [`Self::initialize`] attaches a buffer.
    pub const fn new() -> Self {
        Self::with_queue_order(QueueOrder::Fifo)
    }

    /// Construct an event queue with the given waiter-queue order.
    pub const fn with_queue_order(order: QueueOrder) -> Self {
        Self {
            obj: ObjectHeader::new(order),
            ring: CpuLockCell::new(Ring::EMPTY),
            storage: CpuLockCell::new(None),
        }
    }

    /// Attach backing storage and reset the queue to its empty state.
    ///
    /// The buffer must not be empty.
    pub fn initialize(&self, buffer: &'static mut [EventWord]) {
        debug_assert!(!buffer.is_empty(), "zero-length event queue buffer");

        let mut lock = klock::lock_cpu::<Traits>();
        self.ring.replace(&mut *lock, Ring::EMPTY);
        self.storage.replace(
            &mut *lock,
            Some(Storage {
                // Safety: a slice pointer is never null
                data: unsafe { NonNull::new_unchecked(buffer.as_mut_ptr()) },
                limit: buffer.len(),
            }),
        );
    }

    /// Create an event queue of capacity `limit` in dynamically allocated
    /// storage. The ring buffer lives in the same allocation, right after
    /// the header.
    ///
    /// Returns `None` if `limit` is zero or the allocation fails. The
    /// storage is released by [`Self::delete`].
    pub fn create(limit: usize) -> Option<&'static Self> {
        if limit == 0 {
            return None;
        }

        let (layout, buf_offset) = Layout::new::<Self>()
            .extend(Layout::array::<EventWord>(limit).ok()?)
            .ok()?;

        // Safety: `layout` has a non-zero size
        let base = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?;
        let ptr = base.cast::<Self>();
        // Safety: `ptr` is valid for writes and properly aligned
        unsafe { ptr.as_ptr().write(Self::new()) };

        // Safety: the allocation is live until `delete` consumes the
        // resource handle
        let queue = unsafe { &*ptr.as_ptr() };

        // Safety: `buf_offset` is within the allocation by construction
        let data = unsafe { base.as_ptr().add(buf_offset) }.cast::<EventWord>();

        let mut lock = klock::lock_cpu::<Traits>();
        queue.storage.replace(
            &mut *lock,
            Some(Storage {
                // Safety: derived from a non-null allocation pointer
                data: unsafe { NonNull::new_unchecked(data) },
                limit,
            }),
        );
        queue.obj.res.replace(&mut *lock, Some(ResourceHandle(base)));

        Some(queue)
    }

    /// The number of words currently stored.
    pub fn count(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        self.ring.get(&*lock).count
    }

    /// The number of free slots.
    pub fn space(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        let storage = self.buf_storage(&*lock);
        storage.limit - self.ring.get(&*lock).count
    }

    /// The capacity of the buffer.
    pub fn limit(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        let storage = self.buf_storage(&*lock);
        storage.limit
    }

    /// Receive the oldest word without blocking. Usable from an interrupt
    /// handler.
    pub fn take(&self, out: &mut EventWord) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count > 0 {
            if self.get_and_drain(lock.borrow_mut(), storage, out) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Receive the oldest word, parking until one arrives.
    pub fn wait(&'static self, out: &mut EventWord) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count > 0 {
            if self.get_and_drain(lock.borrow_mut(), storage, out) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        let payload = self.obj.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::EventQueueReceive {
                slot: CpuLockCell::new(Cell::new(0)),
            },
        )?;

        // The producer that released us deposited the word into our wait
        // record.
        match payload {
            WaitPayload::EventQueueReceive { slot } => *out = slot.read(&*lock).get(),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Receive the oldest word, parking for at most `delay` ticks.
    pub fn wait_for(&'static self, out: &mut EventWord, delay: Tick) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count > 0 {
            if self.get_and_drain(lock.borrow_mut(), storage, out) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        let payload = self.obj.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::EventQueueReceive {
                slot: CpuLockCell::new(Cell::new(0)),
            },
            delay,
        )?;

        match payload {
            WaitPayload::EventQueueReceive { slot } => *out = slot.read(&*lock).get(),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Receive the oldest word, parking until the time point `deadline` at
    /// the latest.
    pub fn wait_until(
        &'static self,
        out: &mut EventWord,
        deadline: Tick,
    ) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count > 0 {
            if self.get_and_drain(lock.borrow_mut(), storage, out) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        let payload = self.obj.wait_queue.wait_until(
            lock.borrow_mut(),
            WaitPayload::EventQueueReceive {
                slot: CpuLockCell::new(Cell::new(0)),
            },
            deadline,
        )?;

        match payload {
            WaitPayload::EventQueueReceive { slot } => *out = slot.read(&*lock).get(),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Append a word without blocking. Usable from an interrupt handler.
    ///
    /// Fails with `Timeout` if the buffer is full.
    pub fn give(&self, word: EventWord) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count < storage.limit {
            if self.put_and_drain(lock.borrow_mut(), storage, word) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Append a word, parking until a slot becomes available.
    pub fn send(&'static self, word: EventWord) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count < storage.limit {
            if self.put_and_drain(lock.borrow_mut(), storage, word) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        self.obj
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::EventQueueSend { value: word })?;
        Ok(())
    }

    /// Append a word, parking for at most `delay` ticks.
    pub fn send_for(&'static self, word: EventWord, delay: Tick) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count < storage.limit {
            if self.put_and_drain(lock.borrow_mut(), storage, word) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        self.obj.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::EventQueueSend { value: word },
            delay,
        )?;
        Ok(())
    }

    /// Append a word, parking until the time point `deadline` at the latest.
    pub fn send_until(&'static self, word: EventWord, deadline: Tick) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        let storage = self.buf_storage(&*lock);

        if self.ring.get(&*lock).count < storage.limit {
            if self.put_and_drain(lock.borrow_mut(), storage, word) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        self.obj.wait_queue.wait_until(
            lock.borrow_mut(),
            WaitPayload::EventQueueSend { value: word },
            deadline,
        )?;
        Ok(())
    }

    /// Append a word unconditionally, dropping the oldest stored words until
    /// it fits. Never blocks, never fails. Usable from an interrupt handler.
    pub fn push(&self, word: EventWord) {
        let mut lock = klock::lock_cpu::<Traits>();
        let storage = self.buf_storage(&*lock);

        let mut woke = self.overwrite_drain(lock.borrow_mut(), storage);
        woke |= self.put_and_drain(lock.borrow_mut(), storage, word);
        if woke {
            task::unlock_cpu_and_check_preemption(lock);
        }
    }

    /// Discard the buffer contents and release every parked task with
    /// [`WaitTimeoutError::Stopped`].
    pub fn kill(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.ring.replace(&mut *lock, Ring::EMPTY);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
    }

    /// Release every parked task with [`WaitTimeoutError::Deleted`] and free
    /// the backing storage if the queue was created dynamically.
    ///
    /// # Safety
    ///
    /// The queue must not be used again after this call: for a dynamically
    /// created queue the reference is dangling from this point on.
    pub unsafe fn delete(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        let storage = self.storage.get(&*lock);
        self.ring.replace(&mut *lock, Ring::EMPTY);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Deleted));
        let res = self.obj.res.replace(&mut *lock, None);
        task::unlock_cpu_and_check_preemption(lock);

        if let Some(res) = res {
            let limit = storage.unwrap().limit;
            // The layout recomputed here is identical to the one `create`
            // allocated with.
            let (layout, _) = Layout::new::<Self>()
                .extend(Layout::array::<EventWord>(limit).unwrap())
                .unwrap();
            // Safety: the handle was produced by `create` with this layout,
            // and the caller promises the object is not used again
            unsafe { alloc::alloc::dealloc(res.0.as_ptr(), layout) };
        }
    }

    /// Read the attached buffer descriptor.
    ///
    /// Calling a queue operation before [`Self::initialize`] (or
    /// [`Self::create`]) attached a buffer is a contract violation trapped
    /// in debug builds.
    fn buf_storage(&self, lock: &CpuLockToken<Traits>) -> Storage {
        let storage = self.storage.get(lock);
        debug_assert!(storage.is_some(), "uninitialized event queue");
        // Safety: the buffer is attached before the object is used
        unsafe { storage.unwrap_unchecked() }
    }

    /// Read the word at `head`, advance `head`, decrement `count`.
    fn buf_get(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, storage: Storage) -> EventWord {
        let mut ring = self.ring.get(&*lock);
        let slot = ring.pop_slot(storage.limit);
        // Safety: the slot index is within the buffer per the ring invariants
        let word = unsafe { storage.data.as_ptr().add(slot).read() };
        self.ring.replace(&mut *lock, ring);
        word
    }

    /// Write a word at `tail`, advance `tail`, increment `count`.
    fn buf_put(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, storage: Storage, word: EventWord) {
        let mut ring = self.ring.get(&*lock);
        let slot = ring.push_slot(storage.limit);
        // Safety: the slot index is within the buffer per the ring invariants
        unsafe { storage.data.as_ptr().add(slot).write(word) };
        self.ring.replace(&mut *lock, ring);
    }

    /// Advance `head` without reading, decrement `count`.
    fn buf_skip(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, storage: Storage) {
        let mut ring = self.ring.get(&*lock);
        ring.pop_slot(storage.limit);
        self.ring.replace(&mut *lock, ring);
    }

    /// Read the oldest word into `out`, then refill the freed slot from a
    /// parked producer, if any. Returns `true` if a task was woken.
    ///
    /// A producer can only be parked while the buffer is full, so the
    /// re-injected word lands in the slot this read just freed, keeping the
    /// buffer full and the arrival order intact.
    fn get_and_drain(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        storage: Storage,
        out: &mut EventWord,
    ) -> bool {
        *out = self.buf_get(lock.borrow_mut(), storage);
        self.obj
            .wait_queue
            .wake_up_one_with(lock.borrow_mut(), |payload, mut lock| match payload {
                WaitPayload::EventQueueSend { value } => {
                    self.buf_put(lock.borrow_mut(), storage, *value);
                }
                _ => unreachable!(),
            })
    }

    /// Append `word`, then satisfy a parked consumer from the buffer, if
    /// any. Returns `true` if a task was woken.
    ///
    /// A consumer can only be parked while the buffer is empty, so the word
    /// it receives is the one just appended.
    fn put_and_drain(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        storage: Storage,
        word: EventWord,
    ) -> bool {
        self.buf_put(lock.borrow_mut(), storage, word);
        self.obj
            .wait_queue
            .wake_up_one_with(lock.borrow_mut(), |payload, mut lock| match payload {
                WaitPayload::EventQueueReceive { slot } => {
                    let word = self.buf_get(lock.borrow_mut(), storage);
                    slot.read(&*lock).set(word);
                }
                _ => unreachable!(),
            })
    }

    /// Drop oldest words (waking parked producers into the freed slots)
    /// until the buffer has room. Returns `true` if any task was woken.
    fn overwrite_drain(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, storage: Storage) -> bool {
        let mut woke = false;
        while self.ring.get(&*lock).count == storage.limit {
            self.buf_skip(lock.borrow_mut(), storage);
            woke |= self
                .obj
                .wait_queue
                .wake_up_one_with(lock.borrow_mut(), |payload, mut lock| match payload {
                    WaitPayload::EventQueueSend { value } => {
                        self.buf_put(lock.borrow_mut(), storage, *value);
                    }
                    _ => unreachable!(),
                });
        }
        woke
    }
}

impl<Traits: Port> fmt::Debug for EventQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    use super::*;

    #[quickcheck]
    fn ring_count_matches_index_distance(ops: Vec<bool>, limit_seed: u8) {
        let limit = usize::from(limit_seed % 7) + 1;
        let mut ring = Ring::EMPTY;

        for put in ops {
            if put {
                if ring.count < limit {
                    ring.push_slot(limit);
                }
            } else if ring.count > 0 {
                ring.pop_slot(limit);
            }

            assert!(ring.head < limit);
            assert!(ring.tail < limit);
            if ring.count < limit {
                assert_eq!((ring.tail + limit - ring.head) % limit, ring.count);
            } else {
                // Both indices coincide when the ring is full.
                assert_eq!(ring.head, ring.tail);
            }
        }
    }

    #[quickcheck]
    fn ring_slots_preserve_fifo_order(words: Vec<usize>, limit_seed: u8) {
        let limit = usize::from(limit_seed % 7) + 1;
        let mut ring = Ring::EMPTY;
        let mut buffer = vec![0usize; limit];
        let mut expected = VecDeque::new();

        for word in words {
            if ring.count == limit {
                let got = buffer[ring.pop_slot(limit)];
                assert_eq!(got, expected.pop_front().unwrap());
            }
            buffer[ring.push_slot(limit)] = word;
            expected.push_back(word);
        }
        while ring.count > 0 {
            let got = buffer[ring.pop_slot(limit)];
            assert_eq!(got, expected.pop_front().unwrap());
        }
        assert!(expected.is_empty());
    }

    #[quickcheck]
    fn ring_skip_behaves_like_an_unread_pop(skips: u8, limit_seed: u8) {
        let limit = usize::from(limit_seed % 7) + 1;
        let skips = usize::from(skips) % (limit + 1);

        let mut ring = Ring::EMPTY;
        for _ in 0..limit {
            ring.push_slot(limit);
        }
        for _ in 0..skips {
            ring.pop_slot(limit);
        }

        assert_eq!(ring.count, limit - skips);
        assert_eq!(ring.head, skips % limit);
        assert_eq!(ring.tail, 0);
    }
}
