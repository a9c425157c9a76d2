//! Task control blocks and the block/wake handshake with the port.
//!
//! The dispatcher, the ready queue, and the context switcher live in the
//! port; the kernel's view of a task is reduced to what the synchronization
//! layer needs: a scheduling state, a priority for priority-ordered waiter
//! queues, and the bookkeeping of an ongoing wait.
use core::fmt;

use crate::{
    clock::Tick,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    utils::Init,
    wait::TaskWait,
    PortThreading,
};

/// Task priority. Lower values are more urgent.
pub type TaskPriority = u32;

/// *Task control block* — the kernel-side state of a task.
///
/// The port owns task creation and destruction; it hands out
/// `&'static TaskCb` references that stay valid for the life of the system.
pub struct TaskCb<Traits: PortThreading> {
    /// The port-specific part of the task state (e.g., the saved context or
    /// the backing thread).
    pub port_task_state: Traits::PortTaskState,

    pub(super) priority: CpuLockCell<Traits, TaskPriority>,

    pub(super) st: CpuLockCell<Traits, TaskSt>,

    /// The wait state of the task.
    pub(super) wait: TaskWait<Traits>,

    /// The deadline of the alarm currently armed for this task, if any.
    /// Validates expiry notifications arriving from the timer subsystem.
    pub(super) alarm: CpuLockCell<Traits, Option<Tick>>,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    /// Construct a task control block for a task of the given priority.
    pub const fn new(priority: TaskPriority) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            priority: CpuLockCell::new(priority),
            st: CpuLockCell::new(TaskSt::Running),
            wait: TaskWait::new(),
            alarm: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("priority", &self.priority)
            .field("st", &self.st)
            .finish()
    }
}

/// Task state, as far as the synchronization layer is concerned.
///
/// Whether a `Running` task actually owns the processor is the port's
/// business; the kernel only distinguishes "runnable" from "parked on a
/// waitable object".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TaskSt {
    /// The task is runnable.
    Running,
    /// The task is parked on a waiter queue.
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Running;
}

/// Transition the currently running task into the Waiting state. Returns
/// when a wake-upper has transitioned it back.
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `state::assert_waitable_context` to do that.
pub(super) fn wait_until_woken_up<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Transition the current task to Waiting
    let running_task = Traits::running_task().unwrap();
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // The port releases the CPU Lock around the actual suspension and
        // re-acquires it before returning.
        //
        // Safety: CPU Lock active, task context
        unsafe { Traits::suspend_current_task() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(*running_task.st.read(&*lock), TaskSt::Waiting);
    }
}

/// Transition the task out of the Waiting state and hand it back to the
/// port for scheduling.
///
/// This method may make a task runnable, but doesn't yield the processor.
/// Call [`unlock_cpu_and_check_preemption`] as needed.
///
/// # Safety
///
/// The task must be in the Waiting state, with its wait bookkeeping already
/// cleaned up.
pub(super) unsafe fn make_ready<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.st.replace(&mut *lock, TaskSt::Running);

    // Safety: CPU Lock active, and the task was suspended
    unsafe { Traits::resume_task(task_cb) };
}

/// Relinquish CPU Lock and let the port reconsider which task should own
/// the processor.
///
/// System services that make another task runnable should call this before
/// returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: PortThreading>(
    lock: CpuLockGuard<Traits>,
) {
    // Relinquish CPU Lock
    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };
}
