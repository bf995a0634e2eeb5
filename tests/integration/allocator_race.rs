#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use sombra_ids::idgen::{CounterMonitor, IdGeneratorOptions, QueueKind};
use sombra_ids::{IdGenerator, NoFreeIds, Result, Unlimited};
use tempfile::tempdir;

use common::open_with;

const THREADS: usize = 6;
const ROUNDS: usize = 2_000;
const SEED: u64 = 0x1d5_cafe;

/// Each worker allocates, commits, and now and then deletes one of its own
/// live ids; no id may ever be live twice. With `clear_cache` another thread
/// keeps emptying the cache while the workers run.
fn churn(generator: Arc<IdGenerator>, consecutive_ranges: bool, clear_cache: bool) -> Result<HashSet<u64>> {
    let live = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));
    let done = Arc::new(AtomicBool::new(false));
    let clearer = clear_cache.then(|| {
        let generator = Arc::clone(&generator);
        let done = Arc::clone(&done);
        thread::spawn(move || -> Result<usize> {
            let mut clears = 0;
            loop {
                generator.clear_cache()?;
                clears += 1;
                if done.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(Duration::from_micros(200));
            }
            Ok(clears)
        })
    });
    let mut handles = Vec::with_capacity(THREADS);
    for worker in 0..THREADS {
        let generator = Arc::clone(&generator);
        let live = Arc::clone(&live);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(SEED + worker as u64);
            let mut owned: Vec<(u64, usize)> = Vec::new();
            barrier.wait();
            for round in 0..ROUNDS {
                let (id, len) = if consecutive_ranges && rng.gen_bool(0.3) {
                    let len = 1 << rng.gen_range(0..3);
                    (generator.next_consecutive_id_range(len)?, len)
                } else {
                    (generator.next_id()?, 1)
                };
                generator.marker()?.mark_used_range(id, len)?;
                {
                    let mut live = live.lock();
                    for candidate in id..id + len as u64 {
                        assert!(live.insert(candidate), "id {candidate} handed out twice");
                    }
                }
                owned.push((id, len));

                if rng.gen_bool(0.5) && !owned.is_empty() {
                    let (victim, victim_len) = owned.swap_remove(rng.gen_range(0..owned.len()));
                    {
                        let mut live = live.lock();
                        for candidate in victim..victim + victim_len as u64 {
                            live.remove(&candidate);
                        }
                    }
                    generator.commit_marker()?.mark_deleted_range(victim, victim_len)?;
                    generator.reuse_marker()?.mark_free_range(victim, victim_len)?;
                }
                if round % 97 == 0 {
                    generator.maintenance()?;
                }
            }
            Ok(())
        }));
    }
    let joined = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect::<Result<Vec<_>>>();
    done.store(true, Ordering::Release);
    if let Some(clearer) = clearer {
        assert!(clearer.join().expect("clearer panicked")? > 0);
    }
    joined?;
    let live = live.lock().clone();
    Ok(live)
}

/// Every id below the high id is either live or not USED in the store.
fn assert_not_used_is_complement_of_live(generator: &IdGenerator, live: &HashSet<u64>) -> Result<()> {
    let high = generator.high_id();
    let not_used = generator.not_used_ids(0, high)?.collect::<Result<BTreeSet<_>>>()?;
    let expected: BTreeSet<u64> = (0..high).filter(|id| !live.contains(id)).collect();
    assert_eq!(not_used, expected);
    Ok(())
}

#[test]
fn concurrent_allocation_never_duplicates() -> Result<()> {
    let dir = tempdir()?;
    let monitor = Arc::new(CounterMonitor::default());
    let generator = Arc::new(open_with(
        &dir.path().join("race.id"),
        IdGeneratorOptions::default(),
        monitor.clone(),
    )?);
    generator.start(&NoFreeIds)?;
    let live = churn(Arc::clone(&generator), false, false)?;

    let snapshot = monitor.snapshot();
    assert!(snapshot.allocated_from_reused > 0, "freed ids were never reused");
    assert!(generator.high_id() < (THREADS * ROUNDS) as u64);
    assert!(live.iter().all(|id| *id < generator.high_id()));
    assert!(generator.consistency_report()?.success);
    assert_not_used_is_complement_of_live(&generator, &live)?;
    generator.checkpoint(&Unlimited)?;
    generator.close()?;
    Ok(())
}

#[test]
fn concurrent_clear_cache_loses_no_ids() -> Result<()> {
    let dir = tempdir()?;
    let monitor = Arc::new(CounterMonitor::default());
    let generator = Arc::new(open_with(
        &dir.path().join("clear.id"),
        IdGeneratorOptions::default(),
        monitor.clone(),
    )?);
    generator.start(&NoFreeIds)?;
    let live = churn(Arc::clone(&generator), false, true)?;

    assert!(monitor.snapshot().cache_clears > 0);
    assert!(generator.consistency_report()?.success);
    assert_not_used_is_complement_of_live(&generator, &live)?;

    // Ids released by the clears are found again by the next scan.
    generator.clear_cache()?;
    generator.maintenance()?;
    let high = generator.high_id();
    let reusable = generator.not_used_ids(0, high)?.count();
    let mut handed_out = HashSet::new();
    for _ in 0..reusable.min(64) {
        let id = generator.next_id()?;
        assert!(!live.contains(&id), "live id {id} handed out again");
        assert!(handed_out.insert(id));
    }
    generator.close()?;
    Ok(())
}

#[test]
fn concurrent_ranges_with_wide_slots_never_overlap() -> Result<()> {
    let dir = tempdir()?;
    let options = IdGeneratorOptions::new()
        .power_of_two_slots(4)
        .queue_kind(QueueKind::Mpmc)
        .cache_capacity(1024);
    let generator = Arc::new(open_with(
        &dir.path().join("ranges.id"),
        options,
        Arc::new(CounterMonitor::default()),
    )?);
    generator.start(&NoFreeIds)?;
    let live = churn(Arc::clone(&generator), true, false)?;
    assert!(generator.consistency_report()?.success);
    assert_not_used_is_complement_of_live(&generator, &live)?;
    generator.close()?;
    Ok(())
}

#[test]
fn strict_freelist_prefers_reuse_over_growth() -> Result<()> {
    let dir = tempdir()?;
    let options = IdGeneratorOptions::new().strictly_prioritize_freelist(true);
    let generator = open_with(&dir.path().join("strict.id"), options, Arc::new(CounterMonitor::default()))?;
    generator.start(&NoFreeIds)?;
    let ids: Vec<u64> = (0..64).map(|_| generator.next_id()).collect::<Result<_>>()?;
    {
        let mut marker = generator.marker()?;
        for id in &ids {
            marker.mark_used(*id)?;
        }
        for id in ids.iter().step_by(2) {
            marker.mark_deleted_and_free(*id)?;
        }
    }
    let high = generator.high_id();
    for _ in 0..32 {
        let id = generator.next_id()?;
        assert!(id % 2 == 0 && id < high, "expected a reused id, got {id}");
    }
    assert_eq!(generator.high_id(), high);
    generator.close()?;
    Ok(())
}
