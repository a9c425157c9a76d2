//! A StateOS-style synchronization core for preemptive real-time kernels.
//!
//! This crate implements the scheduler-coupled synchronization layer of a
//! small-microcontroller RTOS: a steady tick clock, the blocking-object
//! protocol shared by every wait-capable primitive, and two primitives built
//! on it — the tri-mode [`Semaphore`] and the bounded [`EventQueue`] with
//! blocking rendezvous and overwrite semantics.
//!
//! The crate is generic over a *port*: the environment-specific layer owning
//! the context switcher, the CPU Lock, the tick source, and the timer
//! subsystem. A port implements [`PortThreading`] and [`PortTimer`]; the
//! kernel calls into it through these traits and never touches the hardware
//! (or host OS) directly. `stateos_port_std` provides a hosted simulation
//! port for development and testing.
//!
//! # Contexts
//!
//! Non-blocking services (`take`, `give`, `push`, the accessors) may be
//! called from both task and interrupt context. Blocking services (`wait*`,
//! `send*`) are restricted to task context; violations are trapped by debug
//! assertions.
#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod clock;
pub mod error;
pub mod event_queue;
mod klock;
mod object;
pub mod semaphore;
mod state;
pub mod task;
pub mod timeout;
pub mod utils;
mod wait;

pub use self::{
    clock::{Tick, IMMEDIATE, INFINITE},
    error::{PollError, WaitError, WaitTimeoutError},
    event_queue::{EventQueue, EventWord},
    semaphore::{Semaphore, SemaphoreMode},
    task::{TaskCb, TaskPriority},
    wait::QueueOrder,
};

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and task suspension.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing the scheduling
/// machinery the kernel builds on.
///
/// The `unsafe fn` items are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// The port-specific part of every task control block.
    type PortTaskState: Send + Sync + 'static;

    /// The initial value of [`TaskCb::port_task_state`] for all tasks.
    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Attempt to enter the CPU Lock state: disable preemption and maskable
    /// interrupts up to the kernel priority.
    ///
    /// Returns `false` if the CPU Lock is already active. The lock nests at
    /// the port level (a cookie saved by the port); the kernel itself always
    /// acquires it exactly once per service call.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state entered by a successful
    /// [`Self::try_enter_cpu_lock`].
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether the CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context — i.e., a task is current and no interrupt handler is
    /// executing.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// handler.
    fn is_interrupt_context() -> bool;

    /// The task whose context the processor is currently executing, if any.
    fn running_task() -> Option<&'static TaskCb<Self>>;

    /// Suspend the currently running task until [`Self::resume_task`] is
    /// called for it.
    ///
    /// The CPU Lock is active on entry; the port releases it around the
    /// actual suspension and re-acquires it before returning, so from the
    /// kernel's perspective the critical section is held across the wait.
    ///
    /// Precondition: CPU Lock active, task context
    unsafe fn suspend_current_task();

    /// Make a task suspended by [`Self::suspend_current_task`] runnable
    /// again.
    ///
    /// The wake-up takes effect at the next scheduling point; in particular,
    /// a task woken from an interrupt handler starts running only after the
    /// handler returns.
    ///
    /// Precondition: CPU Lock active
    unsafe fn resume_task(task: &'static TaskCb<Self>);

    /// Yield the processor, letting the port reconsider which task should
    /// run.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();
}

/// Implemented by a port. This trait contains items related to the tick
/// source and the timer subsystem.
///
/// # Safety
///
/// The `unsafe fn` items are only meant to be called by the kernel.
pub unsafe trait PortTimer: PortThreading {
    /// The tick frequency in ticks per second.
    const FREQUENCY: u32;

    /// Read the current value of the system tick counter.
    ///
    /// The counter is free-running and wraps around at the 32-bit boundary.
    fn tick_count() -> Tick;

    /// Ask the timer subsystem to call [`timeout::notify_expired`] for
    /// `task` once `deadline` is reached.
    ///
    /// At most one alarm per task is armed at any time. The timer subsystem
    /// must not deliver the notification before the deadline; a late
    /// delivery is harmless.
    ///
    /// Precondition: CPU Lock active
    unsafe fn set_alarm(task: &'static TaskCb<Self>, deadline: Tick);

    /// Disarm the alarm armed for `task`, if any.
    ///
    /// Precondition: CPU Lock active
    unsafe fn clear_alarm(task: &'static TaskCb<Self>);
}

/// Represents the group of traits a port implements.
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}
