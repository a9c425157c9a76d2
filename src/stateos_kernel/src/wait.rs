//! Waiter queues — the blocking-object protocol shared by every
//! wait-capable primitive.
//!
//! Each blocking object embeds a [`WaitQueue`] through its object header. A
//! blocking operation constructs a [`Wait`] record on the waiting task's
//! stack, links it into the queue, and suspends the task. The counterpart
//! operation (the *wake-upper*) unlinks the head record, moves any in-flight
//! data between the object and the record's payload, and releases the task.
//! Because the transfer happens on the waker's side of the critical section,
//! the woken task never has to re-examine the object's state.
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::{
    clock::{self, Tick, IMMEDIATE, INFINITE},
    error::{expect_not_timeout, BadObjectStateError, WaitError, WaitTimeoutError},
    event_queue::EventWord,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskCb, TaskPriority, TaskSt},
    timeout,
    utils::Init,
    Port, PortThreading,
};

// Type definitions for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

/// The links of one node in a doubly-linked wait list.
struct Link<Traits: PortThreading> {
    prev: Option<WaitRef<Traits>>,
    next: Option<WaitRef<Traits>>,
}

impl<Traits: PortThreading> Clone for Link<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for Link<Traits> {}

/// The endpoints of a doubly-linked wait list.
struct ListHead<Traits: PortThreading> {
    first: Option<WaitRef<Traits>>,
    last: Option<WaitRef<Traits>>,
}

impl<Traits: PortThreading> Clone for ListHead<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for ListHead<Traits> {}

impl<Traits: PortThreading> Init for ListHead<Traits> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// Dereference a `WaitRef`.
///
/// # Safety
///
/// The pointee must be extant. This holds for every reference stored in a
/// wait list: a `Wait` only lives on its task's stack while the task is
/// parked, and it is unlinked before the task resumes.
unsafe fn wait_from_ref<'a, Traits: PortThreading>(wait_ref: WaitRef<Traits>) -> &'a Wait<Traits> {
    unsafe { &*wait_ref.0.as_ptr() }
}

// ---------------------------------------------------------------------------

/// *A wait record* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting task's
/// stack, and only survives until the method returns. This means that `Wait`
/// can expire only when the waiting task is not waiting anymore.
struct Wait<Traits: PortThreading> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// The containing [`WaitQueue`].
    wait_queue: &'static WaitQueue<Traits>,

    payload: WaitPayload<Traits>,
}

/// Additional information attached to a [`Wait`], specific to waitable
/// object types. Carries in-flight data across the block/wake boundary.
pub(super) enum WaitPayload<Traits: PortThreading> {
    /// Waiting to take a semaphore permit. The giver consumes the permit on
    /// the waiter's behalf, so there is nothing to carry.
    Semaphore,
    /// Waiting to receive a word from an event queue. The wake-upper
    /// deposits the received word into `slot`.
    EventQueueReceive {
        slot: CpuLockCell<Traits, Cell<EventWord>>,
    },
    /// Waiting to append a word to a full event queue. The wake-upper reads
    /// `value` and appends it on the waiter's behalf.
    EventQueueSend { value: EventWord },
}

/// A queue of wait records ([`Wait`]) parked on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// Wait records parked on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting tasks (`Wait::task`) must be in
    /// a Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, ListHead<Traits>>,

    order: QueueOrder,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    const INIT: Self = Self::new(QueueOrder::Fifo);
}

/// Wake-up order of a waiter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

/// The wait state of a task.
pub(super) struct TaskWait<Traits: PortThreading> {
    /// The wait record describing the ongoing Waiting state of the task.
    /// Should be `None` iff the task is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper. Returned
    /// by [`WaitQueue::wait`].
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> TaskWait<Traits> {
    pub(super) const fn new() -> Self {
        Self {
            current_wait: CpuLockCell::new(None),
            wait_result: CpuLockCell::new(Ok(())),
        }
    }
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(super) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(ListHead::INIT),
            order,
        }
    }
}

// Linked-list maintenance
// ---------------------------------------------------------------------------

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Link `wait_ref` at the back of the list.
    fn list_push_back(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        let mut head = self.waits.get(&*lock);

        let link = match head.last {
            None => {
                head.first = Some(wait_ref);
                Link {
                    prev: None,
                    next: None,
                }
            }
            Some(last) => {
                // Safety: `last` is linked in `self.waits`, so it's extant
                let last_wait = unsafe { wait_from_ref(last) };
                let mut last_link = last_wait.link.get(&*lock).unwrap();
                last_link.next = Some(wait_ref);
                last_wait.link.replace(&mut *lock, Some(last_link));
                Link {
                    prev: Some(last),
                    next: None,
                }
            }
        };

        head.last = Some(wait_ref);
        self.waits.replace(&mut *lock, head);

        // Safety: `wait_ref` was created by the caller and is not yet linked
        unsafe { wait_from_ref(wait_ref) }
            .link
            .replace(&mut *lock, Some(link));
    }

    /// Link `wait_ref` immediately before `pos`, or at the back of the list
    /// if `pos` is `None`.
    fn list_insert(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_ref: WaitRef<Traits>,
        pos: Option<WaitRef<Traits>>,
    ) {
        let Some(pos) = pos else {
            return self.list_push_back(lock, wait_ref);
        };

        // Safety: `pos` is linked in `self.waits`, so it's extant
        let pos_wait = unsafe { wait_from_ref(pos) };
        let mut pos_link = pos_wait.link.get(&*lock).unwrap();
        let prev = pos_link.prev;
        pos_link.prev = Some(wait_ref);
        pos_wait.link.replace(&mut *lock, Some(pos_link));

        match prev {
            None => {
                let mut head = self.waits.get(&*lock);
                head.first = Some(wait_ref);
                self.waits.replace(&mut *lock, head);
            }
            Some(prev_ref) => {
                // Safety: linked, hence extant
                let prev_wait = unsafe { wait_from_ref(prev_ref) };
                let mut prev_link = prev_wait.link.get(&*lock).unwrap();
                prev_link.next = Some(wait_ref);
                prev_wait.link.replace(&mut *lock, Some(prev_link));
            }
        }

        // Safety: `wait_ref` was created by the caller and is not yet linked
        unsafe { wait_from_ref(wait_ref) }.link.replace(
            &mut *lock,
            Some(Link {
                prev,
                next: Some(pos),
            }),
        );
    }

    /// Unlink `wait_ref` from the list.
    fn list_remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        // Safety: the caller guarantees `wait_ref` is linked in `self.waits`
        let wait = unsafe { wait_from_ref(wait_ref) };
        let link = wait.link.replace(&mut *lock, None).unwrap();

        let mut head = self.waits.get(&*lock);

        match link.prev {
            None => head.first = link.next,
            Some(prev_ref) => {
                // Safety: linked, hence extant
                let prev_wait = unsafe { wait_from_ref(prev_ref) };
                let mut prev_link = prev_wait.link.get(&*lock).unwrap();
                prev_link.next = link.next;
                prev_wait.link.replace(&mut *lock, Some(prev_link));
            }
        }

        match link.next {
            None => head.last = link.prev,
            Some(next_ref) => {
                // Safety: linked, hence extant
                let next_wait = unsafe { wait_from_ref(next_ref) };
                let mut next_link = next_wait.link.get(&*lock).unwrap();
                next_link.prev = link.prev;
                next_wait.link.replace(&mut *lock, Some(next_link));
            }
        }

        self.waits.replace(&mut *lock, head);
    }

    /// Unlink and return the first wait record, if any.
    fn list_pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<WaitRef<Traits>> {
        let first = self.waits.get(&*lock).first?;
        self.list_remove(lock.borrow_mut(), first);
        Some(first)
    }

    /// Find the insertion position for a wait record owned by a task whose
    /// priority is `cur_task_pri`: the earliest linked record whose task is
    /// strictly less urgent. Walking from the back keeps same-priority
    /// records in FIFO order.
    fn find_insertion_position_by_task_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        cur_task_pri: TaskPriority,
    ) -> Option<WaitRef<Traits>> {
        let mut insert_at = None;
        let mut cursor = self.waits.get(&*lock).last;
        while let Some(next_cursor) = cursor {
            // Safety: linked, hence extant
            let next_wait = unsafe { wait_from_ref(next_cursor) };
            let next_cursor_task_pri = next_wait.task.priority.get(&*lock);
            if next_cursor_task_pri > cur_task_pri {
                // A less urgent waiter; the new record goes at this or an
                // even earlier position.
                insert_at = Some(next_cursor);
                cursor = next_wait.link.get(&*lock).unwrap().prev;
            } else {
                break;
            }
        }
        insert_at
    }
}

// Parking and waking
// ---------------------------------------------------------------------------

impl<Traits: Port> WaitQueue<Traits> {
    /// Insert a wait record pertaining to the currently running task into
    /// `self`, transitioning the task into the Waiting state.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `state::assert_waitable_context` to do
    /// that.
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let task = Traits::running_task().unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: self,
            payload,
        };

        self.wait_inner(lock.borrow_mut(), &wait)
            .map_err(expect_not_timeout)?;

        Ok(wait.payload)
    }

    /// Like [`Self::wait`], but the operation will time out `delay` ticks
    /// from now.
    ///
    /// `IMMEDIATE` fails with `Timeout` right away without parking;
    /// `INFINITE` never times out.
    pub(super) fn wait_timeout(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        delay: Tick,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        match delay {
            INFINITE => return self.wait(lock, payload).map_err(Into::into),
            IMMEDIATE => return Err(WaitTimeoutError::Timeout),
            _ => {}
        }

        let deadline = clock::deadline_after(clock::now::<Traits>(), delay);
        self.wait_deadline(lock, payload, deadline)
    }

    /// Like [`Self::wait`], but the operation will time out once the
    /// absolute time point `deadline` is reached.
    pub(super) fn wait_until(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: Tick,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        if clock::reached(deadline, clock::now::<Traits>()) {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_deadline(lock, payload, deadline)
    }

    fn wait_deadline(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: Tick,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        let task = Traits::running_task().unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: self,
            payload,
        };

        // Arm the timer subsystem. The guard disarms it when the wait
        // concludes for any reason other than expiry.
        task.alarm.replace(&mut *lock, Some(deadline));
        // Safety: CPU Lock active
        unsafe { Traits::set_alarm(task, deadline) };
        let mut alarm_guard = timeout::AlarmGuard { task, lock };
        let lock = alarm_guard.lock.borrow_mut();

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// The core portion of `Self::wait`: link the record, park the task, and
    /// read out the result deposited by the wake-upper.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
    ) -> Result<(), WaitTimeoutError> {
        let task = wait.task;
        let wait_ref = WaitRef(NonNull::from(wait));

        debug_assert!(core::ptr::eq(wait.task, Traits::running_task().unwrap()));
        debug_assert!(core::ptr::eq(wait.wait_queue, self));

        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::TaskPriority => {
                let cur_task_pri = task.priority.get(&*lock);
                self.find_insertion_position_by_task_priority(lock.borrow_mut(), cur_task_pri)
            }
        };

        self.list_insert(lock.borrow_mut(), wait_ref, insert_at);

        // Set `task.current_wait`
        task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        // Transition the task into Waiting. This statement will complete
        // when the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper
        assert!(wait.link.get(&*lock).is_none());
        assert!(task.wait.current_wait.get(&*lock).is_none());

        // Return the wait result deposited by the wake-upper
        task.wait.wait_result.get(&*lock)
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task runnable, but doesn't yield the
    /// processor. Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.wake_up_one_with(lock.borrow_mut(), |_, _| {})
    }

    /// Wake up up to one waiting task, invoking `transfer` on the wait
    /// record's payload before the task is released.
    ///
    /// `transfer` runs inside the same critical section, so any data it
    /// moves between the object and the payload is observed atomically by
    /// the woken task.
    pub(super) fn wake_up_one_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        transfer: impl FnOnce(&WaitPayload<Traits>, CpuLockTokenRefMut<'_, Traits>),
    ) -> bool {
        let Some(wait_ref) = self.list_pop_front(lock.borrow_mut()) else {
            return false;
        };

        // Safety: `wait_ref` was in `self.waits` at the beginning of this
        // function call, so it points to a valid `Wait`
        let wait = unsafe { wait_from_ref(wait_ref) };

        debug_assert!(core::ptr::eq(wait.wait_queue, self));

        transfer(&wait.payload, lock.borrow_mut());

        complete_wait(lock.borrow_mut(), wait, Ok(()));

        true
    }

    /// Wake up every waiting task in queue order, each with the given wait
    /// result.
    ///
    /// This method may make tasks runnable, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_result: Result<(), WaitTimeoutError>,
    ) {
        while let Some(wait_ref) = self.list_pop_front(lock.borrow_mut()) {
            // Safety: `wait_ref` was in `self.waits`, so it points to a
            // valid `Wait`
            let wait = unsafe { wait_from_ref(wait_ref) };
            complete_wait(lock.borrow_mut(), wait, wait_result);
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Deassociate the specified wait record from its waiting task (`wait.task`)
/// and wake up the task.
///
/// Panics if `wait` is not associated (anymore) with its waiting task.
///
/// This function doesn't remove `wait` from `WaitQueue::waits`.
///
/// This function may make a task runnable, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    let task_cb = wait.task;

    // Clear `TaskWait::current_wait`
    assert_eq!(
        task_cb.wait.current_wait.get(&*lock),
        Some(WaitRef(NonNull::from(wait)))
    );
    task_cb.wait.current_wait.replace(&mut *lock, None);

    // Set a wait result
    let _ = task_cb.wait.wait_result.replace(&mut *lock, wait_result);

    assert_eq!(*task_cb.st.read(&*lock), TaskSt::Waiting);

    // Make the task runnable
    //
    // Safety: The task is in the Waiting state, and a proper clean up for
    // exiting the Waiting state is already done.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Interrupt any ongoing wait operation on the task.
///
/// This function may make the task runnable, but doesn't yield the
/// processor. Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadObjectState)` if the task is not in the Waiting state.
pub(super) fn interrupt_task<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) -> Result<(), BadObjectStateError> {
    match *task_cb.st.read(&*lock) {
        TaskSt::Waiting => {
            // The task is in the Waiting state, so `current_wait` must be
            // `Some(_)`
            let wait_ref = task_cb.wait.current_wait.get(&*lock).unwrap();

            // Safety: ... and `wait_ref` must point to an existing `Wait`
            let wait = unsafe { wait_from_ref(wait_ref) };

            // Remove `wait` from the wait queue it belongs to
            wait.wait_queue.list_remove(lock.borrow_mut(), wait_ref);

            // Wake up the task
            complete_wait(lock.borrow_mut(), wait, wait_result);

            Ok(())
        }
        _ => Err(BadObjectStateError::BadObjectState),
    }
}
