//! Execution context checks.
use crate::PortThreading;

/// Assert that the current context may block.
///
/// Blocking services are callable from task context only; calling one from
/// an interrupt handler or the boot phase is a contract violation trapped in
/// debug builds.
#[inline]
pub(super) fn assert_waitable_context<Traits: PortThreading>() {
    debug_assert!(
        Traits::is_task_context(),
        "blocking kernel service called outside a task context"
    );
    debug_assert!(
        !Traits::is_interrupt_context(),
        "blocking kernel service called from an interrupt handler"
    );
}
