#![cfg(all(test, feature = "loom"))]

use loom::sync::Arc;

use crate::region::HeapRegion;
use crate::spsc::SpscRing;
use crate::sync::thread;
use crate::syncword::{SyncStats, SyncWord};

#[test]
fn signal_is_never_lost() {
    loom::model(|| {
        let word = Arc::new(SyncWord::new(0));

        let waker = thread::spawn({
            let word = word.clone();
            move || {
                word.wake(0b1, &SyncStats::default()).unwrap();
            }
        });

        word.wait(0b1, 0, &SyncStats::default()).unwrap();
        waker.join().unwrap();
        assert_eq!(word.load() & 0b1, 0);
    });
}

#[test]
fn each_waiter_consumes_only_its_bit() {
    loom::model(|| {
        let word = Arc::new(SyncWord::new(0));

        let waiter = thread::spawn({
            let word = word.clone();
            move || word.wait(0b10, 0, &SyncStats::default())
        });

        let stats = SyncStats::default();
        word.wake(0b01, &stats).unwrap();
        word.wake(0b10, &stats).unwrap();

        waiter.join().unwrap().unwrap();
        // The waiter on 0b10 never clears 0b01.
        assert_eq!(word.load(), 0b01);
    });
}

#[test]
fn ring_slices_arrive_in_order() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let ring: Arc<SpscRing<u64>> = Arc::new(unsafe { SpscRing::init(owner.region(), 0, 2) });

        let producer = thread::spawn({
            let ring = ring.clone();
            let owner = owner.clone();
            move || {
                let _keep = owner;
                let mut tx = ring.producer();
                let items = [1u64, 2, 3];
                let mut sent = 0;
                while sent < items.len() {
                    let n = tx.push_slice(&items[sent..]);
                    if n == 0 {
                        thread::yield_now();
                    }
                    sent += n;
                }
            }
        });

        let mut rx = ring.consumer();
        let mut got = Vec::new();
        let mut buf = [0u64; 2];
        while got.len() < 3 {
            let n = rx.pop_slice(&mut buf);
            if n == 0 {
                thread::yield_now();
            }
            got.extend_from_slice(&buf[..n]);
        }

        producer.join().unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    });
}
