//! Interface to the external timer subsystem.
//!
//! The kernel does not keep a timer wheel of its own. When a task parks with
//! a finite deadline, the wait path arms a single per-task alarm through
//! [`PortTimer::set_alarm`] and records the deadline in the task control
//! block. The timer subsystem calls back into [`notify_expired`] when the
//! alarm fires; the recorded deadline validates the notification, so a stale
//! expiry that races with a regular wake-up (or with a subsequent wait on
//! the same task) is discarded.
//!
//! [`PortTimer::set_alarm`]: crate::PortTimer::set_alarm
use crate::{
    clock,
    error::{BadObjectStateError, WaitTimeoutError},
    klock::{self, CpuLockTokenRefMut},
    task::{self, TaskCb},
    wait, Port,
};

/// Disarms the alarm of `task` when dropped.
///
/// Used inside a blocking operation with a timeout: the wait path arms the
/// alarm, and the guard guarantees it is disarmed on every exit path other
/// than the expiry itself (which disarms in [`notify_expired`]).
pub(super) struct AlarmGuard<'b, Traits: Port> {
    pub(super) task: &'static TaskCb<Traits>,
    pub(super) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: Port> Drop for AlarmGuard<'_, Traits> {
    fn drop(&mut self) {
        let mut lock = self.lock.borrow_mut();
        self.task.alarm.replace(&mut *lock, None);
        // Safety: CPU Lock active
        unsafe { Traits::clear_alarm(self.task) };
    }
}

/// Called by the timer subsystem when the alarm armed for `task` comes due.
///
/// Cancels the task's ongoing wait with a timeout result. The call is a
/// no-op if the task has already been released or if the armed deadline has
/// not actually been reached (a stale notification).
///
/// The current context must not hold the CPU Lock. Interrupt context is
/// allowed.
pub fn notify_expired<Traits: Port>(task: &'static TaskCb<Traits>) {
    let mut lock = klock::lock_cpu::<Traits>();

    let due = match task.alarm.get(&*lock) {
        Some(deadline) => clock::reached(deadline, clock::now::<Traits>()),
        None => false,
    };
    if !due {
        return;
    }

    task.alarm.replace(&mut *lock, None);

    match wait::interrupt_task(lock.borrow_mut(), task, Err(WaitTimeoutError::Timeout)) {
        // Even if the task is not waiting anymore, we don't care
        Ok(()) | Err(BadObjectStateError::BadObjectState) => {}
    }

    task::unlock_cpu_and_check_preemption(lock);
}
