//! Lock, FIFO list and semaphore tests across real threads

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::thread;
use libtask::fifo::{FifoList, FifoNode};
use libtask::lock::{LockKind, Locked, NativeMutex, RawLock, TasLock, TryLock, TtasLock};
use libtask::semaphore::{BlockingSemaphore, Semaphore, SpinSemaphore};

const ALL_KINDS: [LockKind; 6] = [
    LockKind::Tas,
    LockKind::Ttas,
    LockKind::Ticket,
    LockKind::Anderson { slots: 8 },
    LockKind::Clh,
    LockKind::Native,
];

#[test]
fn test_locked_vec_under_contention() {
    for kind in ALL_KINDS {
        let shared = Locked::new(Vec::new(), kind);
        thread::scope(|s| {
            for t in 0..4 {
                let shared = &shared;
                s.spawn(move |_| {
                    for i in 0..1_000 {
                        shared.lock().push(t * 1_000 + i);
                    }
                });
            }
        })
        .unwrap();

        let mut values = shared.into_inner();
        values.sort_unstable();
        assert_eq!(values, (0..4_000).collect::<Vec<_>>(), "lock kind {:?}", kind);
    }
}

fn check_try_lock<L: TryLock>(lock: L) {
    assert!(!lock.is_locked());
    assert!(lock.try_lock());
    assert!(lock.is_locked());

    thread::scope(|s| {
        s.spawn(|_| assert!(!lock.try_lock()));
    })
    .unwrap();

    // SAFETY: acquired by try_lock above
    unsafe { lock.unlock() };
    assert!(!lock.is_locked());
    lock.lock();
    // SAFETY: acquired just above
    unsafe { lock.unlock() };
}

#[test]
fn test_try_lock_from_other_thread() {
    check_try_lock(TasLock::new());
    check_try_lock(TtasLock::new());
    check_try_lock(NativeMutex::new());
}

#[test]
fn test_fifo_list_across_threads() {
    const PER_PRODUCER: usize = 500;
    let nodes: Vec<FifoNode<usize>> = (0..4 * PER_PRODUCER).map(FifoNode::new).collect();
    let list = FifoList::new();
    let consumed = AtomicUsize::new(0);
    let sum = AtomicUsize::new(0);

    thread::scope(|s| {
        for chunk in nodes.chunks(PER_PRODUCER) {
            let list = &list;
            s.spawn(move |_| {
                for node in chunk {
                    list.insert(node);
                }
            });
        }
        for _ in 0..2 {
            s.spawn(|_| {
                while consumed.load(Ordering::SeqCst) < nodes.len() {
                    if let Some(node) = list.consume() {
                        sum.fetch_add(*node.get(), Ordering::SeqCst);
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    })
    .unwrap();

    let n = nodes.len();
    assert!(list.is_empty());
    assert_eq!(sum.load(Ordering::SeqCst), n * (n - 1) / 2);
    assert!(nodes.iter().all(|node| !node.is_on_list(None)));
}

#[test]
fn test_semaphores_bound_concurrency() {
    fn bounded<S: Semaphore>(sem: S) {
        let inside = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|_| {
                    for _ in 0..200 {
                        sem.down();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.up();
                    }
                });
            }
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(inside.load(Ordering::SeqCst), 0);
    }

    bounded(SpinSemaphore::new(2));
    bounded(BlockingSemaphore::new(2));
}
