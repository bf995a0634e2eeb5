use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

const LOCKED: u64 = 0b01;
const CLOSED: u64 = 0b10;
const STAMP_SHIFT: u32 = 2;
const SPINS_BEFORE_YIELD: u32 = 64;

/// Single-flight lock with an optimistic stamp.
///
/// The state word packs `stamp << 2 | CLOSED | LOCKED`. Every successful
/// acquisition bumps the stamp, so a reader that remembers [`ScanLock::stamp`]
/// can [`ScanLock::validate`] that no lock holder ran in between.
///
/// `try_lock` backs off while a blocking `lock` caller is waiting, which keeps
/// a thread looping on `try_lock` from starving it.
#[derive(Default)]
pub struct ScanLock {
    state: AtomicU64,
    waiters: AtomicU32,
}

/// Releases the [`ScanLock`] on drop.
#[must_use = "the scan lock is released as soon as the guard is dropped"]
pub struct ScanGuard<'a> {
    lock: &'a ScanLock,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!LOCKED, Ordering::Release);
    }
}

impl ScanLock {
    /// Creates an unlocked, open lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock if it is free, open and nobody is queued for it.
    pub fn try_lock(&self) -> Option<ScanGuard<'_>> {
        if self.waiters.load(Ordering::Acquire) > 0 {
            return None;
        }
        self.try_acquire()
    }

    /// Acquires the lock, waiting for the current holder. Returns `None` once
    /// the lock is closed.
    pub fn lock(&self) -> Option<ScanGuard<'_>> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0u32;
        let acquired = loop {
            let state = self.state.load(Ordering::Acquire);
            if state & CLOSED != 0 {
                break None;
            }
            if state & LOCKED == 0 {
                if let Some(guard) = self.try_acquire() {
                    break Some(guard);
                }
            }
            backoff(&mut spins);
        };
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        acquired
    }

    /// Waits for any holder, then marks the lock dead. Later `lock` and
    /// `try_lock` calls fail.
    pub fn close(&self) {
        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & CLOSED != 0 {
                return;
            }
            if state & LOCKED == 0
                && self
                    .state
                    .compare_exchange(state, state | CLOSED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff(&mut spins);
        }
    }

    /// Returns true once [`ScanLock::close`] has completed.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Returns true while some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & LOCKED != 0
    }

    /// Current acquisition stamp.
    pub fn stamp(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> STAMP_SHIFT
    }

    /// Returns true if the lock is free and was not acquired since `stamp`.
    pub fn validate(&self, stamp: u64) -> bool {
        let state = self.state.load(Ordering::Acquire);
        state & LOCKED == 0 && state >> STAMP_SHIFT == stamp
    }

    fn try_acquire(&self) -> Option<ScanGuard<'_>> {
        let state = self.state.load(Ordering::Acquire);
        if state & (LOCKED | CLOSED) != 0 {
            return None;
        }
        let next = state.wrapping_add(1 << STAMP_SHIFT) | LOCKED;
        self.state
            .compare_exchange(state, next, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| ScanGuard { lock: self })
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::time::{Duration, Instant};

    #[test]
    fn try_lock_is_exclusive_and_bumps_stamp() {
        let lock = ScanLock::new();
        let stamp = lock.stamp();
        let guard = lock.try_lock().expect("free lock");
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        assert!(!lock.validate(stamp));
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(lock.stamp(), stamp + 1);
        assert!(lock.validate(stamp + 1));
    }

    #[test]
    fn closed_lock_refuses_everyone() {
        let lock = ScanLock::new();
        lock.close();
        assert!(lock.is_closed());
        assert!(lock.try_lock().is_none());
        assert!(lock.lock().is_none());
    }

    #[test]
    fn close_waits_for_holder() {
        let lock = Arc::new(ScanLock::new());
        let guard = lock.try_lock().expect("free lock");
        let closer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.close())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!lock.is_closed());
        drop(guard);
        closer.join().unwrap();
        assert!(lock.is_closed());
    }

    #[test]
    fn blocking_lock_is_not_starved_by_try_lock_loop() {
        let lock = Arc::new(ScanLock::new());
        let stop = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));
        let hog = {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut held = 0u64;
                while !stop.load(Ordering::Acquire) {
                    if let Some(_guard) = lock.try_lock() {
                        held += 1;
                        hint::spin_loop();
                    }
                }
                held
            })
        };
        barrier.wait();
        let deadline = Instant::now() + Duration::from_secs(10);
        for _ in 0..100 {
            let guard = lock.lock().expect("open lock");
            drop(guard);
            assert!(Instant::now() < deadline, "blocking lock starved");
        }
        stop.store(true, Ordering::Release);
        hog.join().unwrap();
    }
}
