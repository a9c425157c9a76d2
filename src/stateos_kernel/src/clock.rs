//! The steady clock.
//!
//! Time is measured in ticks of a free-running 32-bit counter advancing at
//! [`PortTimer::FREQUENCY`] ticks per second. Tick arithmetic is modular;
//! deadline comparisons interpret the difference as a signed quantity, so
//! timeout horizons of up to half the counter range survive wrap-around.
use core::time::Duration;

use crate::PortTimer;

/// A point in time or a duration, measured in timer ticks.
pub type Tick = u32;

/// A delay value requesting that a wait operation fail immediately instead
/// of blocking.
pub const IMMEDIATE: Tick = 0;

/// A delay value requesting that a wait operation never time out.
pub const INFINITE: Tick = Tick::MAX;

/// Read the current value of the system tick counter.
#[inline]
pub fn now<Traits: PortTimer>() -> Tick {
    Traits::tick_count()
}

/// The absolute deadline lying `delay` ticks after `now`.
#[inline]
pub(super) fn deadline_after(now: Tick, delay: Tick) -> Tick {
    now.wrapping_add(delay)
}

/// Whether `deadline` has been reached at time `now`.
///
/// The difference is interpreted as a signed quantity, which makes this
/// correct across counter wrap-around for deadlines within half the counter
/// range.
#[inline]
pub(super) fn reached(deadline: Tick, now: Tick) -> bool {
    deadline.wrapping_sub(now) as i32 <= 0
}

/// Convert a wall-clock duration to a tick count, truncating sub-tick
/// precision.
///
/// The result is clamped below [`INFINITE`], which is reserved as the
/// "never" sentinel.
pub fn ticks_from_duration<Traits: PortTimer>(duration: Duration) -> Tick {
    let ticks = duration.as_nanos() * Traits::FREQUENCY as u128 / 1_000_000_000;
    ticks.min((INFINITE - 1) as u128) as Tick
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[quickcheck]
    fn deadline_is_reached_at_and_after_expiry(now: Tick, delay: u16) {
        let deadline = deadline_after(now, delay as Tick);
        assert!(reached(deadline, deadline));
        assert!(reached(deadline, deadline.wrapping_add(1)));
        assert!(reached(deadline, now.wrapping_add(delay as Tick)));
    }

    #[quickcheck]
    fn deadline_is_pending_before_expiry(now: Tick, delay: u16) {
        // A zero delay is due immediately by definition.
        if delay == 0 {
            return;
        }
        let deadline = deadline_after(now, delay as Tick);
        assert!(!reached(deadline, now));
        assert!(!reached(deadline, deadline.wrapping_sub(1)));
    }

    #[quickcheck]
    fn comparison_survives_wrap_around(delay: u16) {
        // Start so close to the counter limit that the deadline wraps.
        let now = Tick::MAX - 1;
        let deadline = deadline_after(now, delay as Tick + 2);
        assert!(deadline < now);
        assert!(!reached(deadline, now));
        assert!(reached(deadline, deadline));
    }
}
