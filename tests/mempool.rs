use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::bounded;
use ztl::error::Error;
use ztl::mempool::{Mempool, MpEntry, PoolMode, PoolType, MP_THREADS};

#[test]
fn create_and_destroy_one_bucket() {
    let pool = Mempool::new();
    pool.create(PoolType::Mcmd, 0, 128, 1024, PoolMode::Spsc, None)
        .unwrap();
    assert!(pool.is_active(PoolType::Mcmd, 0));
    assert_eq!(pool.left(PoolType::Mcmd, 0), 128);
    pool.destroy(PoolType::Mcmd, 0).unwrap();
    assert!(!pool.is_active(PoolType::Mcmd, 0));
}

#[test]
fn create_parallel_buckets_across_all_threads() {
    let pool = Arc::new(Mempool::new());
    let mut handles = Vec::new();
    for tid in 0..MP_THREADS {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            pool.create(PoolType::Mcmd, tid, 128, 1024, PoolMode::Spsc, None)
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    for tid in 0..MP_THREADS {
        assert_eq!(pool.left(PoolType::Mcmd, tid), 128);
    }
    pool.exit();
    assert!(!pool.is_active(PoolType::Mcmd, 0));
}

#[test]
fn double_create_is_reported() {
    let pool = Mempool::new();
    pool.create(PoolType::ProCtx, 1, 16, 256, PoolMode::Locked, None)
        .unwrap();
    assert_eq!(
        pool.create(PoolType::ProCtx, 1, 16, 256, PoolMode::Locked, None),
        Err(Error::MempoolActive(PoolType::ProCtx as u16, 1))
    );
    pool.destroy(PoolType::ProCtx, 1).unwrap();
}

/// One getter thread, one putter thread, slots cycling between them through
/// a channel: the lock-free discipline the mcmd buckets run under.
#[test]
fn spsc_get_put_cycles_return_every_slot() {
    const ENTRIES: u32 = 64;
    const CYCLES: usize = 50_000;

    let pool = Arc::new(Mempool::new());
    pool.create(PoolType::Mcmd, 0, ENTRIES, 64, PoolMode::Spsc, None)
        .unwrap();

    let (tx, rx) = bounded::<usize>(ENTRIES as usize);

    let getter_pool = pool.clone();
    let getter = thread::spawn(move || {
        for _ in 0..CYCLES {
            let ent = getter_pool.get(PoolType::Mcmd, 0).unwrap();
            // A free count sampled by the getter never exceeds the capacity.
            assert!(getter_pool.left(PoolType::Mcmd, 0) <= ENTRIES);
            tx.send(ent.as_ptr() as usize).unwrap();
        }
    });

    let putter_pool = pool.clone();
    let putter = thread::spawn(move || {
        let mut seen = 0usize;
        while seen < CYCLES {
            let raw = rx.recv().unwrap() as *mut MpEntry;
            putter_pool.put(NonNull::new(raw).unwrap(), PoolType::Mcmd, 0);
            seen += 1;
        }
    });

    getter.join().unwrap();
    putter.join().unwrap();
    assert_eq!(pool.left(PoolType::Mcmd, 0), ENTRIES);
    pool.destroy(PoolType::Mcmd, 0).unwrap();
}

/// A locked bucket accepts takers and returners from many threads at once.
#[test]
fn locked_bucket_survives_many_producers_and_consumers() {
    const ENTRIES: u32 = 32;

    let pool = Arc::new(Mempool::new());
    pool.create(PoolType::ClientBuffer, 0, ENTRIES, 512, PoolMode::Locked, None)
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..2_000 {
                let ent = pool.get(PoolType::ClientBuffer, 0).unwrap();
                pool.put(ent, PoolType::ClientBuffer, 0);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.left(PoolType::ClientBuffer, 0), ENTRIES);
    pool.destroy(PoolType::ClientBuffer, 0).unwrap();
}

#[test]
fn getter_sleeps_through_starvation_instead_of_failing() {
    const ENTRIES: u32 = 4;

    let pool = Arc::new(Mempool::new());
    pool.create(PoolType::Mcmd, 2, ENTRIES, 64, PoolMode::Spsc, None)
        .unwrap();

    // Drain to the slack; the next get blocks until the putter catches up.
    let first = pool.get(PoolType::Mcmd, 2).unwrap();
    let held = pool.get(PoolType::Mcmd, 2).unwrap();

    let putter_pool = pool.clone();
    let first_raw = first.as_ptr() as usize;
    let putter = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(20));
        putter_pool.put(
            NonNull::new(first_raw as *mut MpEntry).unwrap(),
            PoolType::Mcmd,
            2,
        );
    });

    let ent = pool.get(PoolType::Mcmd, 2).unwrap();
    putter.join().unwrap();

    pool.put(ent, PoolType::Mcmd, 2);
    // Returns cross threads, so the getter-side count reconciles lazily; the
    // remaining slots are still accounted for.
    assert!(pool.left(PoolType::Mcmd, 2) >= ENTRIES - 1);
    pool.put(held, PoolType::Mcmd, 2);
    pool.destroy(PoolType::Mcmd, 2).unwrap();
}
