//! Ring buffer throughput: uncontended put/take and a ping-pong pair.

use criterion::{criterion_group, criterion_main, Criterion};
use squall::RingBuffer;
use std::sync::Arc;
use std::thread;

fn bench_ring(c: &mut Criterion) {
    c.bench_function("ring_put_take_uncontended", |b| {
        let ring = RingBuffer::new(1024);
        b.iter(|| {
            ring.try_put(1u64).ok();
            ring.try_take()
        });
    });

    c.bench_function("ring_spsc_handoff_4k", |b| {
        b.iter(|| {
            let ring: Arc<RingBuffer<u64>> = Arc::new(RingBuffer::new(256));
            let producer = {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..4096u64 {
                        let mut item = i;
                        while let Err(back) = ring.try_put(item) {
                            item = back;
                            std::hint::spin_loop();
                        }
                    }
                })
            };
            let mut taken = 0;
            while taken < 4096 {
                if ring.try_take().is_some() {
                    taken += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            producer.join().unwrap();
        });
    });
}

criterion_group!(benches, bench_ring);
criterion_main!(benches);
