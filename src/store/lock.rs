//! Per-observation writer locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{FindError, Result};
use crate::ObsInd;

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<ObsInd, u64>>,
    released: Condvar,
    next_token: AtomicU64,
}

impl LockTable {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait up to `wait` for `obsind` to be free, then take it.
    pub(crate) fn acquire(self: &Arc<Self>, obsind: ObsInd, wait: Duration) -> Result<ObservationLock> {
        let deadline = Instant::now() + wait;
        let mut held = self.held.lock();
        while held.contains_key(&obsind) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains_key(&obsind) {
                debug!("Observation {} still locked after {:?}", obsind, wait);
                return Err(FindError::PersistenceConflict(obsind));
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(obsind, token);
        Ok(ObservationLock {
            obsind,
            token,
            table: Arc::clone(self),
        })
    }

    pub(crate) fn is_held_by(self: &Arc<Self>, lock: &ObservationLock) -> bool {
        Arc::ptr_eq(self, &lock.table) && self.held.lock().get(&lock.obsind) == Some(&lock.token)
    }

    fn release(&self, obsind: ObsInd, token: u64) {
        let mut held = self.held.lock();
        if held.get(&obsind) == Some(&token) {
            held.remove(&obsind);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Exclusive right to write one observation. Released on drop.
#[derive(Debug)]
pub struct ObservationLock {
    obsind: ObsInd,
    token: u64,
    table: Arc<LockTable>,
}

impl ObservationLock {
    pub fn obsind(&self) -> ObsInd {
        self.obsind
    }
}

impl Drop for ObservationLock {
    fn drop(&mut self) {
        self.table.release(self.obsind, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_holder_times_out() {
        let table = LockTable::shared();
        let first = table.acquire(ObsInd(1), Duration::ZERO).unwrap();
        let err = table.acquire(ObsInd(1), Duration::from_millis(20));
        assert!(matches!(err, Err(FindError::PersistenceConflict(ObsInd(1)))));
        assert!(table.acquire(ObsInd(2), Duration::ZERO).is_ok());
        drop(first);
        assert!(table.acquire(ObsInd(1), Duration::ZERO).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let table = LockTable::shared();
        let first = table.acquire(ObsInd(3), Duration::ZERO).unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.acquire(ObsInd(3), Duration::from_secs(5)).map(|l| l.obsind()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(first);
        assert_eq!(waiter.join().unwrap().unwrap(), ObsInd(3));
    }

    #[test]
    fn foreign_lock_not_honoured() {
        let a = LockTable::shared();
        let b = LockTable::shared();
        let lock = a.acquire(ObsInd(4), Duration::ZERO).unwrap();
        assert!(a.is_held_by(&lock));
        assert!(!b.is_held_by(&lock));
    }
}
