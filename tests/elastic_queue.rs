use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::thread::scope;
use elastic_queue::ElasticQueue;
use rand::{thread_rng, Rng};

#[test]
fn smoke() {
    let q = ElasticQueue::new(1);

    q.push(7);
    assert_eq!(q.pop(), Some(7));

    q.push(8);
    assert_eq!(q.pop(), Some(8));
    assert!(q.pop().is_none());
}

#[test]
fn capacity() {
    for i in 1..10 {
        let q = ElasticQueue::<i32>::new(i);
        assert_eq!(q.capacity(), i);
    }
}

#[test]
#[should_panic(expected = "capacity must be non-zero")]
fn zero_capacity() {
    let _ = ElasticQueue::<i32>::new(0);
}

#[test]
fn len_empty() {
    let q = ElasticQueue::new(4);

    assert_eq!(q.len(), 0);
    assert!(q.is_empty());

    q.push(10);
    q.push(20);
    assert_eq!(q.len(), 2);
    assert!(!q.is_empty());

    q.pop().unwrap();
    assert_eq!(q.len(), 1);

    q.pop().unwrap();
    assert!(q.is_empty());
}

#[test]
fn pop_empty() {
    let q = ElasticQueue::<i32>::new(5);

    assert!(q.pop().is_none());
    assert!(q.pop_indexed().is_none());
    assert_eq!(q.pop_batch(4), None);
}

#[test]
fn grow_on_fill() {
    let q = ElasticQueue::new(5);

    for i in 1..=6 {
        q.push(i);
    }
    // The push that filled the buffer grew it once, to double the capacity.
    assert_eq!(q.capacity(), 10);
    assert_eq!(q.len(), 6);

    for i in 1..=6 {
        assert_eq!(q.pop(), Some(i));
    }
    assert!(q.pop().is_none());
}

#[test]
fn batch_roundtrip_through_growth() {
    let q = ElasticQueue::new(5);

    assert_eq!(q.push_batch((1..=12).collect()), 0);
    assert!(q.capacity() >= 12);
    assert_eq!(q.len(), 12);

    let (seq, values) = q.pop_batch(12).unwrap();
    assert_eq!(seq, 0);
    assert_eq!(values, (1..=12).collect::<Vec<_>>());
    assert!(q.is_empty());
}

#[test]
fn resize_transparency() {
    let q = ElasticQueue::new(1);

    for i in 0..100 {
        assert_eq!(q.push(i), i);
    }
    for i in 0..100 {
        assert_eq!(q.pop_indexed(), Some((i, i)));
    }
    assert!(q.pop().is_none());
}

#[test]
fn spsc() {
    #[cfg(miri)]
    const COUNT: usize = 50;
    #[cfg(not(miri))]
    const COUNT: usize = 100_000;

    let q = ElasticQueue::new(3);

    scope(|scope| {
        scope.spawn(|_| {
            for i in 0..COUNT {
                loop {
                    if let Some(x) = q.pop() {
                        assert_eq!(x, i);
                        break;
                    }
                }
            }
            assert!(q.pop().is_none());
        });

        scope.spawn(|_| {
            for i in 0..COUNT {
                q.push(i);
            }
        });
    })
    .unwrap();
}

#[test]
fn mpmc() {
    #[cfg(miri)]
    const COUNT: usize = 50;
    #[cfg(not(miri))]
    const COUNT: usize = 25_000;
    const THREADS: usize = 4;

    let q = ElasticQueue::<usize>::new(3);
    let v = (0..COUNT).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();

    scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|_| {
                for _ in 0..COUNT {
                    let n = loop {
                        if let Some(x) = q.pop() {
                            break x;
                        }
                    };
                    v[n].fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        for _ in 0..THREADS {
            scope.spawn(|_| {
                for i in 0..COUNT {
                    q.push(i);
                }
            });
        }
    })
    .unwrap();

    for c in v {
        assert_eq!(c.load(Ordering::SeqCst), THREADS);
    }
    assert!(q.is_empty());
}

// The delicate path: batched pushes that keep straddling the capacity boundary, so growth
// events race with fills from other producers and with draining consumers. Every element
// must come out exactly once.
#[test]
fn mpmc_batch_straddle() {
    #[cfg(miri)]
    const COUNT: usize = 48;
    #[cfg(not(miri))]
    const COUNT: usize = 24_000;
    const THREADS: usize = 4;

    let q = ElasticQueue::<usize>::new(3);
    let v = (0..COUNT).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
    let popped = AtomicUsize::new(0);

    scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|_| {
                let mut rng = thread_rng();
                let mut i = 0;
                while i < COUNT {
                    let n = rng.gen_range(1..=7).min(COUNT - i);
                    q.push_batch((i..i + n).collect());
                    i += n;
                }
            });
        }
        for _ in 0..THREADS {
            scope.spawn(|_| {
                let mut rng = thread_rng();
                while popped.load(Ordering::SeqCst) < THREADS * COUNT {
                    let max = rng.gen_range(1..=7);
                    if let Some((_, values)) = q.pop_batch(max) {
                        popped.fetch_add(values.len(), Ordering::SeqCst);
                        for n in values {
                            v[n].fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    for c in v {
        assert_eq!(c.load(Ordering::SeqCst), THREADS);
    }
    assert!(q.is_empty());
}

#[test]
fn conservation() {
    #[cfg(miri)]
    const OPS: usize = 100;
    #[cfg(not(miri))]
    const OPS: usize = 10_000;
    const THREADS: usize = 4;

    let q = ElasticQueue::<usize>::new(5);
    let enqueued = AtomicUsize::new(0);
    let dequeued = AtomicUsize::new(0);

    scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|_| {
                let mut rng = thread_rng();
                for i in 0..OPS {
                    match rng.gen_range(0..4) {
                        0 => {
                            q.push(i);
                            enqueued.fetch_add(1, Ordering::SeqCst);
                        }
                        1 => {
                            let batch: Vec<usize> = (0..rng.gen_range(1..=6)).collect();
                            enqueued.fetch_add(batch.len(), Ordering::SeqCst);
                            q.push_batch(batch);
                        }
                        2 => {
                            if q.pop().is_some() {
                                dequeued.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        _ => {
                            if let Some((_, values)) = q.pop_batch(rng.gen_range(1..=6)) {
                                dequeued.fetch_add(values.len(), Ordering::SeqCst);
                            }
                        }
                    }
                    assert!(q.len() <= q.capacity());
                }
            });
        }
    })
    .unwrap();

    assert_eq!(
        enqueued.load(Ordering::SeqCst) - dequeued.load(Ordering::SeqCst),
        q.len()
    );
}

#[test]
fn drops() {
    let runs: usize = if cfg!(miri) { 3 } else { 100 };
    let steps: usize = if cfg!(miri) { 50 } else { 10_000 };
    let additional: usize = if cfg!(miri) { 10 } else { 50 };

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, PartialEq)]
    struct DropCounter;

    impl Drop for DropCounter {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let mut rng = thread_rng();

    for _ in 0..runs {
        let steps = rng.gen_range(0..steps);
        let additional = rng.gen_range(0..additional);

        DROPS.store(0, Ordering::SeqCst);
        let q = ElasticQueue::new(50);

        scope(|scope| {
            scope.spawn(|_| {
                for _ in 0..steps {
                    while q.pop().is_none() {}
                }
            });

            scope.spawn(|_| {
                for _ in 0..steps {
                    q.push(DropCounter);
                }
            });
        })
        .unwrap();

        for _ in 0..additional {
            q.push(DropCounter);
        }

        assert_eq!(DROPS.load(Ordering::SeqCst), steps);
        drop(q);
        assert_eq!(DROPS.load(Ordering::SeqCst), steps + additional);
    }
}

#[test]
fn into_iter() {
    let q = ElasticQueue::new(4);
    for i in 0..100 {
        q.push(i);
    }
    for (i, j) in q.into_iter().enumerate() {
        assert_eq!(i, j);
    }
}

#[test]
fn into_iter_partial() {
    let q = ElasticQueue::new(4);
    for i in 0..8 {
        q.push(i);
    }
    for _ in 0..3 {
        q.pop().unwrap();
    }
    assert_eq!(q.into_iter().collect::<Vec<_>>(), [3, 4, 5, 6, 7]);
}
