//! Event queue behavior on the hosted simulation port.
use std::time::{Duration, Instant};

use stateos_kernel::{EventQueue, EventWord, PollError, WaitError, WaitTimeoutError};
use stateos_port_std::{run_in_interrupt, spawn_task};

mod common;
use common::{init, settle, SeqTracker};

stateos_port_std::use_port!(unsafe struct SystemTraits);

type Queue = EventQueue<SystemTraits>;

#[test]
fn give_take_fifo_round_trip() {
    init();
    let q = Queue::create(4).unwrap();
    assert_eq!(q.limit(), 4);
    assert_eq!(q.count(), 0);
    assert_eq!(q.space(), 4);

    q.give(1).unwrap();
    q.give(2).unwrap();
    assert_eq!(q.count(), 2);
    assert_eq!(q.space(), 2);

    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 1);
    q.take(&mut word).unwrap();
    assert_eq!(word, 2);
    assert_eq!(q.take(&mut word), Err(PollError::Timeout));
    assert_eq!(q.count(), 0);
}

#[test]
fn give_fails_when_full() {
    init();
    let q = Queue::create(2).unwrap();
    q.give(1).unwrap();
    q.give(2).unwrap();
    assert_eq!(q.give(3), Err(PollError::Timeout));
    assert_eq!(q.count(), 2);
}

#[test]
fn rendezvous_on_empty_queue() {
    init();
    static SEQ: SeqTracker = SeqTracker::new();
    let q = Queue::create(4).unwrap();

    let consumer = spawn_task::<SystemTraits>(1, move || {
        SEQ.expect_and_replace(0, 1);
        let mut word = 0;
        q.wait(&mut word).unwrap();
        SEQ.expect_and_replace(2, 3);
        assert_eq!(word, 0xDEAD_BEEF);
    });

    settle();
    SEQ.expect_and_replace(1, 2);
    q.give(0xDEAD_BEEF).unwrap();

    consumer.join();
    assert_eq!(SEQ.get(), 3);
    assert_eq!(q.count(), 0);
}

#[test]
fn blocked_producer_refills_the_freed_slot() {
    init();
    let q = Queue::create(2).unwrap();
    q.give(1).unwrap();
    q.give(2).unwrap();

    let producer = spawn_task::<SystemTraits>(1, move || {
        q.send(3).unwrap();
    });
    settle();
    assert_eq!(q.count(), 2);

    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 1);
    producer.join();

    // The parked producer's word was appended in FIFO position.
    assert_eq!(q.count(), 2);
    q.take(&mut word).unwrap();
    assert_eq!(word, 2);
    q.take(&mut word).unwrap();
    assert_eq!(word, 3);
}

#[test]
fn push_overwrites_the_oldest_word() {
    init();
    let q = Queue::create(3).unwrap();
    q.give(10).unwrap();
    q.give(11).unwrap();
    q.give(12).unwrap();

    q.push(13);
    assert_eq!(q.count(), 3);

    let mut word = 0;
    for expected in [11usize, 12, 13] {
        q.take(&mut word).unwrap();
        assert_eq!(word, expected);
    }
}

#[test]
fn single_slot_mailbox() {
    init();
    let q = Queue::create(1).unwrap();

    q.give(7).unwrap();
    assert_eq!(q.give(8), Err(PollError::Timeout));

    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 7);

    q.push(21);
    q.push(42);
    q.take(&mut word).unwrap();
    assert_eq!(word, 42);
}

#[test]
fn fifo_order_is_preserved_across_blocked_producers() {
    init();
    let q = Queue::create(1).unwrap();
    q.give(1).unwrap();

    let p2 = spawn_task::<SystemTraits>(1, move || q.send(2).unwrap());
    settle();
    let p3 = spawn_task::<SystemTraits>(1, move || q.send(3).unwrap());
    settle();

    let mut word = 0;
    for expected in 1usize..=3 {
        q.take(&mut word).unwrap();
        assert_eq!(word, expected);
    }
    p2.join();
    p3.join();
    assert_eq!(q.count(), 0);
}

#[test]
fn push_drains_every_blocked_producer() {
    init();
    let q = Queue::create(1).unwrap();
    q.give(1).unwrap();

    let p2 = spawn_task::<SystemTraits>(1, move || q.send(2).unwrap());
    settle();
    let p3 = spawn_task::<SystemTraits>(1, move || q.send(3).unwrap());
    settle();

    // The push drops `1`, then drains both parked producers' words before
    // appending its own.
    q.push(4);
    p2.join();
    p3.join();

    assert_eq!(q.count(), 1);
    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 4);
}

#[test]
fn send_round_trip_restores_the_count() {
    init();
    let q = Queue::create(2).unwrap();
    q.give(5).unwrap();
    let before = q.count();

    let sender = spawn_task::<SystemTraits>(1, move || q.send(6).unwrap());
    sender.join();
    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 5);
    assert_eq!(q.count(), before);
}

#[test]
fn kill_releases_waiters_with_stopped() {
    init();
    let q = Queue::create(2).unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            spawn_task::<SystemTraits>(1, move || {
                let mut word = 0;
                assert_eq!(q.wait(&mut word), Err(WaitError::Stopped));
            })
        })
        .collect();
    settle();

    q.kill();
    for consumer in consumers {
        consumer.join();
    }
    assert_eq!(q.count(), 0);
}

#[test]
fn delete_releases_waiters_with_deleted() {
    init();
    let q = Queue::create(2).unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            spawn_task::<SystemTraits>(1, move || {
                let mut word = 0;
                assert_eq!(q.wait(&mut word), Err(WaitError::Deleted));
            })
        })
        .collect();
    settle();

    unsafe { q.delete() };
    for consumer in consumers {
        consumer.join();
    }
}

#[test]
fn non_blocking_services_work_from_interrupt_context() {
    init();
    let q = Queue::create(2).unwrap();

    run_in_interrupt(|| q.give(5)).unwrap();
    run_in_interrupt(|| q.push(6));
    assert_eq!(q.count(), 2);

    let word = run_in_interrupt(|| {
        let mut word = 0;
        q.take(&mut word).unwrap();
        word
    });
    assert_eq!(word, 5);
    assert_eq!(q.count(), 1);
}

#[test]
fn interrupt_give_wakes_a_parked_consumer() {
    init();
    let q = Queue::create(1).unwrap();

    let consumer = spawn_task::<SystemTraits>(1, move || {
        let mut word = 0;
        q.wait(&mut word).unwrap();
        assert_eq!(word, 9);
    });
    settle();

    run_in_interrupt(|| q.give(9)).unwrap();
    consumer.join();
    assert_eq!(q.count(), 0);
}

#[test]
fn wait_for_times_out_without_a_producer() {
    init();
    let q = Queue::create(1).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let mut word = 0;
        let started = Instant::now();
        assert_eq!(q.wait_for(&mut word, 30_000), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
    });
    t.join();
}

#[test]
fn send_for_times_out_on_a_full_queue() {
    init();
    let q = Queue::create(1).unwrap();
    q.give(1).unwrap();

    let t = spawn_task::<SystemTraits>(1, move || {
        let started = Instant::now();
        assert_eq!(q.send_for(2, 30_000), Err(WaitTimeoutError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
    });
    t.join();

    // The queue is untouched by the timed-out send.
    assert_eq!(q.count(), 1);
    let mut word = 0;
    q.take(&mut word).unwrap();
    assert_eq!(word, 1);
}

#[test]
fn statically_allocated_queue() {
    init();
    static Q: EventQueue<SystemTraits> = EventQueue::new();
    let buffer: &'static mut [EventWord; 4] = Box::leak(Box::new([0; 4]));
    Q.initialize(buffer);

    Q.give(1).unwrap();
    Q.give(2).unwrap();
    let mut word = 0;
    Q.take(&mut word).unwrap();
    assert_eq!(word, 1);
    Q.take(&mut word).unwrap();
    assert_eq!(word, 2);
}
