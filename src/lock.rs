use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

std::thread_local! {
    static THREAD_TOKEN: u8 = 0;
}

/// Returns a nonzero identifier unique among live threads, the address of
/// a thread-local cell.
fn current_thread() -> usize {
    THREAD_TOKEN.with(|token| token as *const u8 as usize)
}

/// A reentrant mutex that knows which thread holds it.
///
/// The raw mutex is acquired at most once per owning thread; re-entry only
/// bumps a depth counter. `unlock` is deliberately asymmetric with `lock`:
/// one call fully releases the mutex whatever the re-entry depth, so a
/// caller can discard a whole lock stack without tracking how many times
/// each lock was taken.
pub(crate) struct HolderMutex {
    raw: RawMutex,
    /// Thread token of the current holder, 0 when unheld. Only the holder
    /// stores to this field while the raw mutex is held, so `Relaxed` is
    /// enough; other threads read it only to conclude "not me".
    holder: AtomicUsize,
    depth: AtomicUsize,
}

impl HolderMutex {
    pub(crate) fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            holder: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) {
        let me = current_thread();
        if self.holder.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.raw.lock();
        self.holder.store(me, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    pub(crate) fn try_lock(&self) -> bool {
        let me = current_thread();
        if self.holder.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self.raw.try_lock() {
            self.holder.store(me, Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fully releases the mutex, discarding any re-entry depth.
    pub(crate) fn unlock(&self) {
        debug_assert!(self.owns_lock());
        self.holder.store(0, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
        // The holder check above is the safety condition of the raw unlock.
        unsafe { self.raw.unlock() };
    }

    /// True iff the calling thread holds this mutex.
    pub(crate) fn owns_lock(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == current_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentry_and_bulk_release() {
        let mutex = Arc::new(HolderMutex::new());
        mutex.lock();
        mutex.lock();
        assert!(mutex.try_lock());
        assert!(mutex.owns_lock());
        // One unlock must release all three acquisitions.
        mutex.unlock();
        assert!(!mutex.owns_lock());

        let other = Arc::clone(&mutex);
        let acquired = thread::spawn(move || {
            let ok = other.try_lock();
            if ok {
                other.unlock();
            }
            ok
        })
        .join()
        .unwrap();
        assert!(acquired);
    }

    #[test]
    fn try_lock_fails_across_threads() {
        let mutex = Arc::new(HolderMutex::new());
        mutex.lock();

        let other = Arc::clone(&mutex);
        let acquired = thread::spawn(move || {
            assert!(!other.owns_lock());
            other.try_lock()
        })
        .join()
        .unwrap();
        assert!(!acquired);

        mutex.unlock();
    }
}
