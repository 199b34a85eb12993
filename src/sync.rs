//! A minimal spin mutex.  Every lock in the allocator is a leaf or
//! near-leaf held for a handful of pointer operations, so spinning
//! beats parking; the fork hooks additionally need to acquire and
//! release across callback boundaries, hence the raw entry points.
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub(crate) struct SpinMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// The mutex hands out at most one guard at a time.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }

        SpinGuard { lock: self }
    }

    /// Acquires the lock without producing a guard.  Callers must pair
    /// this with `raw_unlock`, possibly from another callback frame
    /// (the fork hooks hold locks across `fork(2)` itself).
    pub unsafe fn raw_lock(&self) {
        std::mem::forget(self.lock());
    }

    /// Releases a lock taken with `raw_lock`.
    pub unsafe fn raw_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_under_contention() {
        let shared = Arc::new(SpinMutex::new(0usize));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *shared.lock() += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*shared.lock(), 40_000);
    }

    #[test]
    fn raw_lock_round_trip() {
        let lock = SpinMutex::new(());

        unsafe {
            lock.raw_lock();
            lock.raw_unlock();
        }

        // The mutex must be free again.
        drop(lock.lock());
    }
}
