//! Result types for the kernel services.
//!
//! Every blocking or polling operation reports its outcome through one of
//! the enums below; a getter never mixes its value with an event code. The
//! kernel has no global error state and no panicking path for correctly used
//! APIs.

/// Error type for non-blocking operations such as [`Semaphore::take`] and
/// [`EventQueue::give`].
///
/// [`Semaphore::take`]: crate::semaphore::Semaphore::take
/// [`EventQueue::give`]: crate::event_queue::EventQueue::give
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// The operation could not complete immediately.
    Timeout,
}

/// Error type for blocking operations without a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The object was reset while the caller was waiting on it. The caller
    /// may retry once the object is reinitialized.
    Stopped,
    /// The object was destroyed while the caller was waiting on it. The
    /// object reference is dangling and must not be used again.
    Deleted,
}

/// Error type for blocking operations with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeoutError {
    /// The timeout expired before the wait condition was satisfied.
    Timeout,
    /// The object was reset while the caller was waiting on it.
    Stopped,
    /// The object was destroyed while the caller was waiting on it.
    Deleted,
}

impl From<WaitError> for WaitTimeoutError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Stopped => Self::Stopped,
            WaitError::Deleted => Self::Deleted,
        }
    }
}

/// Internal error type for [`wait::interrupt_task`], reporting that the
/// target task was not in the Waiting state.
///
/// [`wait::interrupt_task`]: crate::wait::interrupt_task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BadObjectStateError {
    BadObjectState,
}

/// Convert `e` to `WaitError`, panicking if `e == WaitTimeoutError::Timeout`.
///
/// Used by untimed wait operations, which can never observe a timeout.
#[inline]
pub(super) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Stopped => WaitError::Stopped,
        WaitTimeoutError::Deleted => WaitError::Deleted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
