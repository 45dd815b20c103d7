use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    *l.lock() += 1;
    assert_eq!(*l.lock(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1_u8);

    let g1 = l.try_lock().expect("uncontended try_lock");
    assert_eq!(*g1, 1);
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_value() {
    let l = SpinLock::new(Vec::<u32>::new());
    let len = l.with_lock(|v| {
        v.extend([0x1000, 0x2000]);
        v.len()
    });
    assert_eq!(len, 2);
    assert!(!l.is_locked());
}

#[test]
fn get_mut_and_into_inner_bypass_the_lock() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn frame_counter_survives_contention() {
    let threads = 8;
    let iters = 5_000;

    // (handed out, returned) pairs must stay balanced under contention.
    let lock = Arc::new(SpinLock::new((0_usize, 0_usize)));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|(taken, returned)| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                        *taken += 1;
                        *returned += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let (taken, returned) = *lock.lock();
    assert_eq!(taken, threads * iters);
    assert_eq!(taken, returned);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0_u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn debug_shows_lock_state() {
    let l = SpinLock::new(5_u8);
    let g = l.lock();
    assert!(format!("{l:?}").contains("locked: true"));
    drop(g);
    assert!(format!("{l:?}").contains("locked: false"));
}
