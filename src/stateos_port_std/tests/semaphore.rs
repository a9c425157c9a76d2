//! Semaphore behavior on the hosted simulation port.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use stateos_kernel::{
    clock, PollError, QueueOrder, Semaphore, SemaphoreMode, WaitError, WaitTimeoutError, IMMEDIATE,
};
use stateos_port_std::{run_in_interrupt, spawn_task};

mod common;
use common::{init, settle, SeqTracker};

stateos_port_std::use_port!(unsafe struct SystemTraits);

type Sem = Semaphore<SystemTraits>;

#[test]
fn counting_give_take_round_trip() {
    init();
    let sem = Sem::create(1, SemaphoreMode::Counting).unwrap();
    assert_eq!(sem.value(), 1);

    sem.give().unwrap();
    assert_eq!(sem.value(), 2);

    sem.take().unwrap();
    assert_eq!(sem.value(), 1);

    sem.take().unwrap();
    assert_eq!(sem.take(), Err(PollError::Timeout));
    assert_eq!(sem.value(), 0);
}

#[test]
fn binary_give_saturates_at_one() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();
    sem.give().unwrap();
    assert_eq!(sem.give(), Err(PollError::Timeout));
    assert_eq!(sem.value(), 1);
}

#[test]
fn initial_value_is_clamped_to_the_limit() {
    init();
    let sem = Sem::create(5, SemaphoreMode::Binary).unwrap();
    assert_eq!(sem.value(), 1);

    let sem = Sem::create(7, SemaphoreMode::Limited(3)).unwrap();
    assert_eq!(sem.value(), 3);
}

#[test]
fn direct_give_fails_without_a_waiter() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Direct).unwrap();
    assert_eq!(sem.give(), Err(PollError::Timeout));
    assert_eq!(sem.value(), 0);
}

#[test]
fn direct_hand_off_from_interrupt_context() {
    init();
    static SEQ: SeqTracker = SeqTracker::new();
    let sem = Sem::create(0, SemaphoreMode::Direct).unwrap();

    let waiter = spawn_task::<SystemTraits>(1, move || {
        SEQ.expect_and_replace(0, 1);
        sem.wait().unwrap();
        SEQ.expect_and_replace(2, 3);
    });

    settle();
    SEQ.expect_and_replace(1, 2);
    run_in_interrupt(|| sem.give()).unwrap();

    waiter.join();
    assert_eq!(SEQ.get(), 3);
    assert_eq!(sem.value(), 0);
}

#[test]
fn give_prefers_waiters_over_the_counter() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let a = spawn_task::<SystemTraits>(1, move || sem.wait().unwrap());
    let b = spawn_task::<SystemTraits>(1, move || sem.wait().unwrap());
    settle();

    // Both permits go straight to the parked tasks; the counter never moves.
    sem.give().unwrap();
    sem.give().unwrap();
    a.join();
    b.join();
    assert_eq!(sem.value(), 0);

    // With the queue empty again, a permit lands in the counter.
    sem.give().unwrap();
    assert_eq!(sem.value(), 1);
}

#[test]
fn reset_releases_waiters_with_stopped() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let a = spawn_task::<SystemTraits>(1, move || {
        assert_eq!(sem.wait(), Err(WaitError::Stopped));
    });
    let b = spawn_task::<SystemTraits>(1, move || {
        assert_eq!(sem.wait(), Err(WaitError::Stopped));
    });
    settle();

    sem.reset();
    a.join();
    b.join();

    // The counter is back at the construction-time value, and resetting an
    // idle semaphore changes nothing.
    assert_eq!(sem.value(), 0);
    sem.reset();
    assert_eq!(sem.value(), 0);
}

#[test]
fn destroy_releases_waiters_with_deleted() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Counting).unwrap();

    let a = spawn_task::<SystemTraits>(1, move || {
        assert_eq!(sem.wait(), Err(WaitError::Deleted));
    });
    let b = spawn_task::<SystemTraits>(1, move || {
        assert_eq!(sem.wait(), Err(WaitError::Deleted));
    });
    settle();

    unsafe { sem.destroy() };
    a.join();
    b.join();
}

#[test]
fn wait_for_times_out() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let started = Instant::now();
        assert_eq!(sem.wait_for(50_000), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    });
    t.join();
    assert_eq!(sem.value(), 0);
}

#[test]
fn wait_for_immediate_behaves_like_take() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let started = Instant::now();
        assert_eq!(sem.wait_for(IMMEDIATE), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(20));
    });
    t.join();
}

#[test]
fn wait_for_succeeds_when_signaled_in_time() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        sem.wait_for(5_000_000).unwrap();
    });
    settle();
    sem.give().unwrap();
    t.join();
    assert_eq!(sem.value(), 0);
}

#[test]
fn wait_until_with_reached_deadline_fails_fast() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let deadline = clock::now::<SystemTraits>().wrapping_sub(1_000);
        let started = Instant::now();
        assert_eq!(sem.wait_until(deadline), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(20));
    });
    t.join();
}

#[test]
fn wait_until_times_out_at_the_deadline() {
    init();
    let sem = Sem::create(0, SemaphoreMode::Binary).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let deadline = clock::now::<SystemTraits>().wrapping_add(40_000);
        let started = Instant::now();
        assert_eq!(sem.wait_until(deadline), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(40));
    });
    t.join();
}

#[test]
fn priority_ordered_queue_wakes_the_urgent_waiter_first() {
    init();
    static SEM: Semaphore<SystemTraits> =
        Semaphore::with_queue_order(QueueOrder::TaskPriority, 0, SemaphoreMode::Binary);
    static WOKEN: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    // The lenient task starts waiting first...
    let lenient = spawn_task::<SystemTraits>(5, || {
        SEM.wait().unwrap();
        WOKEN.lock().unwrap().push(5);
    });
    settle();
    let urgent = spawn_task::<SystemTraits>(1, || {
        SEM.wait().unwrap();
        WOKEN.lock().unwrap().push(1);
    });
    settle();

    // ...but the urgent one is satisfied first.
    SEM.give().unwrap();
    settle();
    assert_eq!(*WOKEN.lock().unwrap(), [1]);

    SEM.give().unwrap();
    lenient.join();
    urgent.join();
    assert_eq!(*WOKEN.lock().unwrap(), [1, 5]);
}
