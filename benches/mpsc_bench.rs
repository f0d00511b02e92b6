use criterion::{criterion_group, criterion_main, Criterion};
use pooled_mpsc::{MpscQueue, Pool};
use std::sync::{Arc, Barrier};
use std::thread;

const NUM_PRODUCERS: usize = 4;
const ITEMS_PER_PRODUCER: usize = 1_000;

fn bench_single_producer_roundtrip(c: &mut Criterion) {
    c.bench_function("single_producer_roundtrip", |b| {
        let mut pool = Pool::new(2, 64).expect("pool");
        let queue = MpscQueue::new().expect("queue");

        b.iter(|| {
            let mut data = pool.acquire(8).expect("handle");
            data.emplace(0xabcd_ef01u64);
            queue.push(data).expect("push");

            let popped = queue.pop().expect("node");
            let value: u64 = unsafe { *popped.get() };
            assert_eq!(value, 0xabcd_ef01);
            popped
        });
    });
}

fn bench_mpsc_throughput(c: &mut Criterion) {
    c.bench_function("mpsc_throughput_4p1c", |b| {
        b.iter(|| {
            let queue = Arc::new(MpscQueue::new().expect("queue"));
            let barrier = Arc::new(Barrier::new(NUM_PRODUCERS + 1));

            let mut producers = Vec::new();
            for producer_id in 0..NUM_PRODUCERS {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);

                producers.push(thread::spawn(move || {
                    let mut pool = Pool::new(2, 64).expect("pool");
                    barrier.wait();

                    for seq in 0..ITEMS_PER_PRODUCER {
                        let tag = ((producer_id as u64) << 32) | seq as u64;
                        let mut data = pool.acquire(8).expect("handle");
                        data.emplace(tag);
                        queue.push(data).expect("push");
                    }

                    pool
                }));
            }

            barrier.wait();

            let total = NUM_PRODUCERS * ITEMS_PER_PRODUCER;
            let mut handles = Vec::with_capacity(total);
            while handles.len() < total {
                match queue.pop() {
                    Some(data) => handles.push(data),
                    None => thread::yield_now(),
                }
            }

            let pools: Vec<Pool> = producers
                .into_iter()
                .map(|producer| producer.join().expect("producer"))
                .collect();

            // Retirement order: chain roots in handle storage, handles
            // release into pool blocks.
            drop(Arc::try_unwrap(queue).ok().expect("sole owner"));
            drop(handles);
            drop(pools);
        });
    });
}

criterion_group!(benches, bench_single_producer_roundtrip, bench_mpsc_throughput);
criterion_main!(benches);
