//! Simulation environment for running the StateOS core on a hosted
//! environment.
//!
//! Each kernel task is backed by an OS thread. The CPU Lock is a process-wide
//! mutex, and task suspension is a condition-variable handshake on that
//! mutex, so the kernel's invariant — the critical section is held across a
//! wait, released only around the actual suspension — carries over directly.
//! Alarms armed by the kernel are served by a dedicated timer thread, which
//! plays the role of the tick interrupt handler.
//!
//! True preemption is not emulated: every runnable task is scheduled by the
//! host OS, and task priorities only select the wake-up order of
//! priority-ordered waiter queues.
use std::{
    cell::{Cell, RefCell},
    sync::{mpsc, Condvar, Mutex, MutexGuard, OnceLock},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use spin::Mutex as SpinMutex;
use stateos_kernel::{task::TaskCb, timeout, Port, Tick};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate stateos_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// The tick frequency of this port: one tick per microsecond.
pub const FREQUENCY: u32 = 1_000_000;

/// Offset applied to the tick counter so that nothing can accidentally rely
/// on the count starting from zero.
const TICK_COUNT_OFFSET: Tick = 0x00c0_de00;

/// Implemented on a system trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: Port {
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// A thread created outside the port (e.g., the test harness's main
    /// thread). Non-blocking kernel services are available.
    Unknown,
    /// The backing thread for an interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. Assigned when the port creates or adopts
    /// a thread.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The task backed by the current thread, type-erased.
    static CURRENT_TASK: Cell<Option<SendPtr>> = Cell::new(None);

    /// The CPU Lock guard held by the current thread, if any.
    static CPU_LOCK_GUARD: RefCell<Option<MutexGuard<'static, ()>>> =
        const { RefCell::new(None) };
}

/// A type-erased pointer that is safe to move between threads because it is
/// only ever dereferenced back to the `&'static` reference it was created
/// from.
#[derive(Debug, Clone, Copy)]
struct SendPtr(*const ());

unsafe impl Send for SendPtr {}

/// The port-specific part of every task control block: the suspension
/// handshake state.
#[derive(Debug)]
pub struct TaskState {
    /// A pending wake-up token. Written under the kernel mutex.
    wakeup: AtomicBool,
    /// Signaled when `wakeup` is set. Always used with the kernel mutex.
    condvar: Condvar,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            wakeup: AtomicBool::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

enum TimerCmd {
    Set {
        key: usize,
        at: Instant,
        fire: unsafe fn(*const ()),
        arg: SendPtr,
    },
    Clear {
        key: usize,
    },
}

struct Alarm {
    key: usize,
    at: Instant,
    fire: unsafe fn(*const ()),
    arg: SendPtr,
}

/// The internal state of the port.
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of [`stateos_kernel::PortThreading`]
/// and [`stateos_kernel::PortTimer`].
#[doc(hidden)]
pub struct State {
    kernel_mutex: Mutex<()>,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    origin: OnceLock<Instant>,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            kernel_mutex: Mutex::new(()),
            timer_cmd_send: SpinMutex::new(None),
            origin: OnceLock::new(),
        }
    }

    pub unsafe fn try_enter_cpu_lock(&'static self) -> bool {
        CPU_LOCK_GUARD.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return false;
            }
            log::trace!("enter_cpu_lock");
            // Block until every other simulated context has left its
            // critical section. On a real single-core target the other
            // contexts simply wouldn't be running.
            let guard = self.kernel_mutex.lock().unwrap();
            *slot = Some(guard);
            true
        })
    }

    pub unsafe fn leave_cpu_lock(&'static self) {
        log::trace!("leave_cpu_lock");
        CPU_LOCK_GUARD.with(|slot| {
            let guard = slot.borrow_mut().take();
            assert!(guard.is_some(), "CPU Lock is not active");
        });
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        // "Active" means held by the current context. Cross-context
        // exclusion is provided by the blocking mutex acquisition instead.
        CPU_LOCK_GUARD.with(|slot| slot.borrow().is_some())
    }

    pub fn is_task_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get() == ThreadRole::Task)
    }

    pub fn is_interrupt_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get() == ThreadRole::Interrupt)
    }

    pub fn running_task<Traits: PortInstance>(&self) -> Option<&'static TaskCb<Traits>> {
        CURRENT_TASK.with(|current| {
            current.get().map(|ptr| {
                // Safety: the pointer was created from a
                // `&'static TaskCb<Traits>` by `spawn_task`
                unsafe { &*(ptr.0 as *const TaskCb<Traits>) }
            })
        })
    }

    pub unsafe fn suspend_current_task<Traits: PortInstance<PortTaskState = TaskState>>(
        &'static self,
    ) {
        let task = self.running_task::<Traits>().unwrap();
        let pts = &task.port_task_state;
        log::trace!("suspending task {task:p}");

        // Relinquish the CPU Lock for the duration of the suspension and
        // re-acquire it before returning, as the kernel expects.
        let mut guard = CPU_LOCK_GUARD
            .with(|slot| slot.borrow_mut().take())
            .expect("CPU Lock is not active");

        while !pts.wakeup.swap(false, Ordering::Relaxed) {
            guard = pts.condvar.wait(guard).unwrap();
        }

        log::trace!("task {task:p} is running again");
        CPU_LOCK_GUARD.with(|slot| *slot.borrow_mut() = Some(guard));
    }

    pub unsafe fn resume_task<Traits: PortInstance<PortTaskState = TaskState>>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("resuming task {task:p}");
        let pts = &task.port_task_state;
        // The caller holds the kernel mutex, so this cannot race with the
        // check in `suspend_current_task`.
        pts.wakeup.store(true, Ordering::Relaxed);
        pts.condvar.notify_one();
    }

    pub unsafe fn yield_cpu(&self) {
        thread::yield_now();
    }

    pub fn tick_count(&self) -> Tick {
        let origin = *self.origin.get_or_init(Instant::now);
        let micros = Instant::now().duration_since(origin).as_micros();
        (micros as Tick).wrapping_add(TICK_COUNT_OFFSET)
    }

    pub unsafe fn set_alarm<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
        deadline: Tick,
    ) {
        let delta = deadline.wrapping_sub(self.tick_count()) as i32;
        // A couple of microseconds of slack keep the notification from
        // arriving before the deadline tick.
        let at = if delta <= 0 {
            Instant::now()
        } else {
            Instant::now() + Duration::from_micros(delta as u64 + 2)
        };
        log::trace!("set_alarm({task:p}, {deadline}) firing in {delta}us");

        self.timer_sender()
            .send(TimerCmd::Set {
                key: task as *const _ as usize,
                at,
                fire: alarm_trampoline::<Traits>,
                arg: SendPtr(task as *const _ as *const ()),
            })
            .unwrap();
    }

    pub unsafe fn clear_alarm<Traits: PortInstance>(&self, task: &'static TaskCb<Traits>) {
        log::trace!("clear_alarm({task:p})");
        self.timer_sender()
            .send(TimerCmd::Clear {
                key: task as *const _ as usize,
            })
            .unwrap();
    }

    /// Get the timer thread's command sender, starting the thread on first
    /// use.
    fn timer_sender(&self) -> mpsc::Sender<TimerCmd> {
        let mut slot = self.timer_cmd_send.lock();
        if slot.is_none() {
            log::trace!("starting the timer thread");
            let (send, recv) = mpsc::channel();
            thread::spawn(move || timer_thread_body(recv));
            *slot = Some(send);
        }
        slot.as_ref().unwrap().clone()
    }
}

/// The timer thread: the simulated tick interrupt handler. Maintains the
/// armed alarms and calls back into the kernel when they come due.
fn timer_thread_body(recv: mpsc::Receiver<TimerCmd>) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));

    let mut alarms: Vec<Alarm> = Vec::new();
    loop {
        // Deliver everything that has come due.
        let now = Instant::now();
        let mut i = 0;
        while i < alarms.len() {
            if alarms[i].at <= now {
                let alarm = alarms.swap_remove(i);
                log::trace!("alarm for {:#x} fired", alarm.key);
                // Safety: `fire` and `arg` were paired up by `set_alarm`
                unsafe { (alarm.fire)(alarm.arg.0) };
            } else {
                i += 1;
            }
        }

        let next = alarms.iter().map(|alarm| alarm.at).min();
        let cmd = match next {
            Some(at) => match recv.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            },
            None => match recv.recv() {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvError) => break,
            },
        };

        match cmd {
            Some(TimerCmd::Set { key, at, fire, arg }) => {
                // A task has at most one alarm armed.
                alarms.retain(|alarm| alarm.key != key);
                alarms.push(Alarm { key, at, fire, arg });
            }
            Some(TimerCmd::Clear { key }) => {
                alarms.retain(|alarm| alarm.key != key);
            }
            None => {}
        }
    }
}

/// Deliver an alarm expiry to the kernel.
///
/// # Safety
///
/// `arg` must have been created from a `&'static TaskCb<Traits>`.
unsafe fn alarm_trampoline<Traits: PortInstance>(arg: *const ()) {
    // Safety: upheld by the caller
    let task = unsafe { &*(arg as *const TaskCb<Traits>) };
    timeout::notify_expired::<Traits>(task);
}

/// A handle to a spawned task, used to await its completion.
pub struct TaskJoinHandle {
    inner: thread::JoinHandle<()>,
}

impl TaskJoinHandle {
    /// Wait for the task to run to completion, propagating any panic it
    /// raised.
    pub fn join(self) {
        self.inner.join().unwrap();
    }
}

/// Start a task of the given priority backed by a new OS thread.
///
/// The task control block is leaked; it stays valid for the life of the
/// process, as the kernel requires.
pub fn spawn_task<Traits: PortInstance>(
    priority: stateos_kernel::TaskPriority,
    body: impl FnOnce() + Send + 'static,
) -> TaskJoinHandle {
    let task: &'static TaskCb<Traits> = Box::leak(Box::new(TaskCb::new(priority)));
    let inner = thread::Builder::new()
        .name(format!("task-{task:p}"))
        .spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
            CURRENT_TASK.with(|current| {
                current.set(Some(SendPtr(task as *const _ as *const ())));
            });
            log::debug!("task {task:p} is now running");
            body();
            log::debug!("task {task:p} exited");
        })
        .unwrap();
    TaskJoinHandle { inner }
}

/// Run `body` in a simulated interrupt context and return its result once
/// the handler completes.
///
/// The handler may use the non-blocking, ISR-safe kernel services.
pub fn run_in_interrupt<R: Send>(body: impl FnOnce() -> R + Send) -> R {
    thread::scope(|scope| {
        scope
            .spawn(|| {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                body()
            })
            .join()
            .unwrap()
    })
}

/// Initialize `env_logger` for a test binary. Repeated calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::stateos_kernel::{PortThreading, PortTimer, TaskCb, Tick};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                fn running_task() -> Option<&'static TaskCb<Self>> {
                    PORT_STATE.running_task::<Self>()
                }

                unsafe fn suspend_current_task() {
                    unsafe { PORT_STATE.suspend_current_task::<Self>() }
                }

                unsafe fn resume_task(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.resume_task::<Self>(task) }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu() }
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                const FREQUENCY: u32 = $crate::FREQUENCY;

                fn tick_count() -> Tick {
                    PORT_STATE.tick_count()
                }

                unsafe fn set_alarm(task: &'static TaskCb<Self>, deadline: Tick) {
                    unsafe { PORT_STATE.set_alarm::<Self>(task, deadline) }
                }

                unsafe fn clear_alarm(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.clear_alarm::<Self>(task) }
                }
            }
        }
    };
}
