use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};

use rusqlite::Connection;

use super::{LockName, LockStrategy};
use crate::error::Result;

/// Process-local named locks for a single non-clustered instance.
///
/// A waiter parks on the condition variable until the name is released.
#[derive(Debug, Default)]
pub struct InProcessLockStrategy {
    held: Mutex<HashSet<LockName>>,
    released: Condvar,
}

impl InProcessLockStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStrategy for InProcessLockStrategy {
    fn acquire(&self, _conn: Option<&Connection>, lock: LockName) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(&lock) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(lock);
        Ok(())
    }

    fn release(&self, lock: LockName) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&lock);
        drop(held);
        self.released.notify_all();
    }

    fn requires_connection(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::{LockHandle, Semaphore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn waiters_block_until_release() {
        let sem = Arc::new(Semaphore::new(InProcessLockStrategy::new()));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for i in 0..4 {
                let sem = Arc::clone(&sem);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                s.spawn(move || {
                    for _ in 0..25 {
                        let mut handle = LockHandle::new(format!("worker-{i}"));
                        sem.obtain(None, &mut handle, LockName::TriggerAccess)
                            .unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.release(&mut handle, LockName::TriggerAccess);
                    }
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_names_do_not_contend() {
        let sem = Semaphore::new(InProcessLockStrategy::new());
        let mut a = LockHandle::new("a");
        let mut b = LockHandle::new("b");
        sem.obtain(None, &mut a, LockName::TriggerAccess).unwrap();
        sem.obtain(None, &mut b, LockName::StateAccess).unwrap();
        sem.release_all(&mut a);
        sem.release_all(&mut b);
    }
}
