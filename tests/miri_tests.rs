#![cfg(miri)]

use pooled_mpsc::{MpscQueue, Pool};
use std::sync::Arc;
use std::thread;

const MIRI_PRODUCERS: usize = 2;
const MIRI_ITEMS_PER_PRODUCER: usize = 25;

#[test]
fn miri_pool_fill_seal_reuse() {
    let mut pool = Pool::new(1, 4).expect("pool");

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let mut data = pool.try_acquire(32).expect("room");
        data.emplace([i; 32]);
        handles.push(data);
    }
    let first_addr = handles[0].raw() as usize;

    assert!(pool.try_acquire(32).is_none());
    handles.clear();

    let reused = pool.try_acquire(32).expect("reset block");
    assert_eq!(reused.raw() as usize, first_addr);

    drop(reused);
    assert!(pool.is_quiescent());
}

#[test]
fn miri_queue_roundtrip() {
    let mut pool = Pool::new(1, 8).expect("pool");
    let queue = MpscQueue::new().expect("queue");

    for i in 0..5u64 {
        let mut data = pool.acquire(8).expect("handle");
        data.emplace(i);
        queue.push(data).expect("push");
    }

    let mut popped = Vec::new();
    for expected in 0..5u64 {
        let data = queue.pop().expect("node");
        assert_eq!(unsafe { *data.get::<u64>() }, expected);
        popped.push(data);
    }
    assert!(queue.pop().is_none());

    drop(queue);
    drop(popped);
    assert!(pool.is_quiescent());
}

#[test]
fn miri_concurrent_producers() {
    let queue = Arc::new(MpscQueue::new().expect("queue"));

    let mut producers = Vec::new();
    for producer_id in 0..MIRI_PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            let mut pool = Pool::new(1, 16).expect("pool");
            for seq in 0..MIRI_ITEMS_PER_PRODUCER {
                let tag = ((producer_id as u64) << 32) | seq as u64;
                let mut data = pool.acquire(8).expect("handle");
                data.emplace(tag);
                queue.push(data).expect("push");
            }
            pool
        }));
    }

    let consumer_queue = Arc::clone(&queue);
    let consumer = thread::spawn(move || {
        let total = MIRI_PRODUCERS * MIRI_ITEMS_PER_PRODUCER;
        let mut next_seq = [0u64; MIRI_PRODUCERS];
        let mut handles = Vec::with_capacity(total);

        while handles.len() < total {
            match consumer_queue.pop() {
                Some(data) => {
                    let tag: u64 = unsafe { *data.get() };
                    let producer_id = (tag >> 32) as usize;
                    assert_eq!(tag & 0xffff_ffff, next_seq[producer_id]);
                    next_seq[producer_id] += 1;
                    handles.push(data);
                }
                None => thread::yield_now(),
            }
        }

        handles
    });

    let pools: Vec<Pool> = producers
        .into_iter()
        .map(|producer| producer.join().expect("producer"))
        .collect();
    let handles = consumer.join().expect("consumer");

    drop(Arc::try_unwrap(queue).ok().expect("sole owner"));
    drop(handles);
    for pool in &pools {
        assert!(pool.is_quiescent());
    }
}
