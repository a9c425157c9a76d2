//! Tick clock behavior on the hosted simulation port.
use std::time::Duration;

use stateos_kernel::clock;

mod common;
use common::init;

stateos_port_std::use_port!(unsafe struct SystemTraits);

#[test]
fn tick_counter_advances_with_wall_time() {
    init();
    let t0 = clock::now::<SystemTraits>();
    std::thread::sleep(Duration::from_millis(20));
    let t1 = clock::now::<SystemTraits>();

    let delta = t1.wrapping_sub(t0);
    assert!(delta >= 19_000, "counter advanced by only {delta} ticks");
    assert!(delta < 5_000_000, "counter advanced by {delta} ticks");
}

#[test]
fn ticks_from_duration_uses_the_port_frequency() {
    assert_eq!(
        clock::ticks_from_duration::<SystemTraits>(Duration::from_millis(3)),
        3_000
    );
    assert_eq!(
        clock::ticks_from_duration::<SystemTraits>(Duration::from_secs(2)),
        2_000_000
    );
}
