//! Context-misuse trapping.
//!
//! This lives in its own test binary: the trapped violation happens with the
//! CPU Lock held, so the simulated kernel mutex ends up poisoned afterwards.
use stateos_kernel::{Semaphore, SemaphoreMode};
use stateos_port_std::run_in_interrupt;

mod common;
use common::init;

stateos_port_std::use_port!(unsafe struct SystemTraits);

#[test]
#[should_panic]
fn blocking_wait_from_interrupt_context_is_trapped() {
    init();
    let sem = Semaphore::<SystemTraits>::create(0, SemaphoreMode::Binary).unwrap();
    run_in_interrupt(|| {
        let _ = sem.wait();
    });
}
