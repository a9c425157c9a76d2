//! Semaphores.
//!
//! A semaphore distributes permits. `take`/`wait*` consume one, `give`
//! releases one. When a `give` finds a parked taker, the permit is handed
//! straight to it and the counter is never touched: the giver performs the
//! conceptual decrement on the waiter's behalf.
use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::{
    clock::Tick,
    error::{PollError, WaitError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockGuard},
    object::{ObjectHeader, ResourceHandle},
    state, task,
    wait::{QueueOrder, WaitPayload},
    Port,
};

/// The operating mode of a [`Semaphore`], fixing the upper bound of its
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreMode {
    /// The counter is pinned at zero. `give` succeeds only by handing the
    /// permit directly to a task already parked in a wait operation;
    /// otherwise it fails.
    Direct,
    /// The counter saturates at one.
    Binary,
    /// The counter is bounded only by the counter width.
    Counting,
    /// The counter saturates at the given limit.
    Limited(u32),
}

impl SemaphoreMode {
    /// The maximum value the counter can reach in this mode.
    pub const fn limit(self) -> u32 {
        match self {
            Self::Direct => 0,
            Self::Binary => 1,
            Self::Counting => u32::MAX,
            Self::Limited(limit) => limit,
        }
    }
}

/// A counting/binary/direct semaphore.
///
/// `0 ≤ count ≤ mode.limit()` holds at every critical-section boundary, and
/// the counter is positive only while no task is parked on the semaphore.
pub struct Semaphore<Traits: Port> {
    obj: ObjectHeader<Traits>,

    count: CpuLockCell<Traits, u32>,

    /// Construction-time counter value, restored by [`Self::reset`].
    init: u32,

    mode: SemaphoreMode,
}

impl<Traits: Port> Semaphore<Traits> {
    /// Construct a semaphore with a FIFO waiter queue.
    ///
    /// The initial value is clamped to the mode's limit.
    pub const fn new(init: u32, mode: SemaphoreMode) -> Self {
        Self::with_queue_order(QueueOrder::Fifo, init, mode)
    }

    /// Construct a semaphore with the given waiter-queue order.
    pub const fn with_queue_order(order: QueueOrder, init: u32, mode: SemaphoreMode) -> Self {
        let limit = mode.limit();
        let init = if init < limit { init } else { limit };
        Self {
            obj: ObjectHeader::new(order),
            count: CpuLockCell::new(init),
            init,
            mode,
        }
    }

    /// Create a semaphore in dynamically allocated storage.
    ///
    /// Returns `None` if the allocation fails. The storage is released by
    /// [`Self::destroy`].
    pub fn create(init: u32, mode: SemaphoreMode) -> Option<&'static Self> {
        let layout = Layout::new::<Self>();
        // Safety: `Self` is not a zero-sized type
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?.cast::<Self>();
        // Safety: `ptr` is valid for writes and properly aligned
        unsafe { ptr.as_ptr().write(Self::new(init, mode)) };

        // Safety: the allocation is live until `destroy` consumes the
        // resource handle
        let sem = unsafe { &*ptr.as_ptr() };

        let mut lock = klock::lock_cpu::<Traits>();
        sem.obj.res.replace(&mut *lock, Some(ResourceHandle(ptr.cast())));

        Some(sem)
    }

    /// The operating mode the semaphore was constructed with.
    pub fn mode(&self) -> SemaphoreMode {
        self.mode
    }

    /// Read the current value of the counter.
    pub fn value(&self) -> u32 {
        let lock = klock::lock_cpu::<Traits>();
        self.count.get(&*lock)
    }

    /// Take a permit without blocking. Usable from an interrupt handler.
    pub fn take(&self) -> Result<(), PollError> {
        let lock = klock::lock_cpu::<Traits>();
        poll_one(self, lock)
    }

    /// Take a permit, parking until one becomes available.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        wait_one(self, lock)
    }

    /// Take a permit, parking for at most `delay` ticks.
    pub fn wait_for(&'static self, delay: Tick) -> Result<(), WaitTimeoutError> {
        let lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        wait_one_timeout(self, lock, delay)
    }

    /// Take a permit, parking until the time point `deadline` at the latest.
    pub fn wait_until(&'static self, deadline: Tick) -> Result<(), WaitTimeoutError> {
        let lock = klock::lock_cpu::<Traits>();
        state::assert_waitable_context::<Traits>();
        wait_one_until(self, lock, deadline)
    }

    /// Release a permit without blocking. Usable from an interrupt handler.
    ///
    /// Fails with `Timeout` if the counter is already at its limit — for a
    /// direct semaphore, whenever no task is parked on the semaphore.
    pub fn give(&self) -> Result<(), PollError> {
        let lock = klock::lock_cpu::<Traits>();
        signal(self, lock)
    }

    /// Restore the counter to its construction-time value and release every
    /// parked task with [`WaitTimeoutError::Stopped`].
    ///
    /// Resetting an idle semaphore is idempotent.
    pub fn reset(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.count.replace(&mut *lock, self.init);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
    }

    /// Release every parked task with [`WaitTimeoutError::Deleted`] and free
    /// the backing storage if the semaphore was created dynamically.
    ///
    /// # Safety
    ///
    /// The semaphore must not be used again after this call: for a
    /// dynamically created semaphore the reference is dangling from this
    /// point on.
    pub unsafe fn destroy(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.count.replace(&mut *lock, self.init);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Deleted));
        let res = self.obj.res.replace(&mut *lock, None);
        task::unlock_cpu_and_check_preemption(lock);

        if let Some(res) = res {
            // Safety: the handle was produced by `create` with this exact
            // layout, and the caller promises the object is not used again
            unsafe { alloc::alloc::dealloc(res.0.as_ptr(), Layout::new::<Self>()) };
        }
    }
}

impl<Traits: Port> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("mode", &self.mode)
            .finish()
    }
}

fn poll_one<Traits: Port>(
    sem: &Semaphore<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), PollError> {
    if poll_core(sem.count.write(&mut *lock)) {
        Ok(())
    } else {
        Err(PollError::Timeout)
    }
}

fn wait_one<Traits: Port>(
    sem: &'static Semaphore<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), WaitError> {
    if poll_core(sem.count.write(&mut *lock)) {
        Ok(())
    } else {
        // The current state does not satisfy the wait condition. Start
        // waiting; the giver performs the conceptual decrement on our
        // behalf, so the woken task does not touch the counter.
        sem.obj
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;

        Ok(())
    }
}

fn wait_one_timeout<Traits: Port>(
    sem: &'static Semaphore<Traits>,
    mut lock: CpuLockGuard<Traits>,
    delay: Tick,
) -> Result<(), WaitTimeoutError> {
    if poll_core(sem.count.write(&mut *lock)) {
        Ok(())
    } else {
        sem.obj
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, delay)?;

        Ok(())
    }
}

fn wait_one_until<Traits: Port>(
    sem: &'static Semaphore<Traits>,
    mut lock: CpuLockGuard<Traits>,
    deadline: Tick,
) -> Result<(), WaitTimeoutError> {
    if poll_core(sem.count.write(&mut *lock)) {
        Ok(())
    } else {
        sem.obj
            .wait_queue
            .wait_until(lock.borrow_mut(), WaitPayload::Semaphore, deadline)?;

        Ok(())
    }
}

/// Check if the current state of a semaphore, `count`, satisfies the wait
/// condition.
///
/// If `count` satisfies the wait condition, this function updates `count`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(count: &mut u32) -> bool {
    if *count > 0 {
        *count -= 1;
        true
    } else {
        false
    }
}

fn signal<Traits: Port>(
    sem: &Semaphore<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), PollError> {
    if sem.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
        // Rendezvous: the permit went straight to the waiter, bypassing the
        // counter.
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let count = sem.count.write(&mut *lock);
    if *count < sem.mode.limit() {
        *count += 1;
        Ok(())
    } else {
        Err(PollError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_core_consumes_one_permit() {
        let mut count = 2;
        assert!(poll_core(&mut count));
        assert_eq!(count, 1);
        assert!(poll_core(&mut count));
        assert_eq!(count, 0);
        assert!(!poll_core(&mut count));
        assert_eq!(count, 0);
    }

    #[test]
    fn mode_limits() {
        assert_eq!(SemaphoreMode::Direct.limit(), 0);
        assert_eq!(SemaphoreMode::Binary.limit(), 1);
        assert_eq!(SemaphoreMode::Counting.limit(), u32::MAX);
        assert_eq!(SemaphoreMode::Limited(7).limit(), 7);
    }
}
