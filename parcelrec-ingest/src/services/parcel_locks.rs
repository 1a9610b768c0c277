//! Per-parcel mutual exclusion
//!
//! Every write to a parcel goes through a guard from this table, so two
//! appliers never mutate the same parcel concurrently. Waiters are served in
//! FIFO order (tokio's Mutex is fair). Entries are dropped once no guard or
//! waiter references them.

use parcelrec_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<i64, Arc<AsyncMutex<()>>>;

#[derive(Default)]
pub struct ParcelLocks {
    locks: Mutex<LockMap>,
}

/// Held lock on one parcel; released on drop
pub struct ParcelGuard {
    parcel_id: i64,
    owner: Arc<ParcelLocks>,
    _guard: OwnedMutexGuard<()>,
}

impl ParcelLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockMap> {
        // The map stays consistent even if a holder panicked
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait up to `timeout` for the parcel's lock
    ///
    /// Returns `WriteConflict` when the wait times out.
    pub async fn acquire(self: &Arc<Self>, parcel_id: i64, timeout: Duration) -> Result<ParcelGuard> {
        let mutex = self
            .table()
            .entry(parcel_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let started = Instant::now();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                let waited = started.elapsed();
                if waited > Duration::from_millis(100) {
                    tracing::debug!(parcel_id, waited_ms = waited.as_millis() as u64, "Long parcel lock wait");
                }
                Ok(ParcelGuard {
                    parcel_id,
                    owner: Arc::clone(self),
                    _guard: guard,
                })
            }
            Err(_) => {
                self.release_entry(parcel_id);
                Err(Error::WriteConflict { parcel_id, attempts: 1 })
            }
        }
    }

    /// Drop the map entry if nobody else holds or awaits it
    fn release_entry(&self, parcel_id: i64) {
        let mut table = self.table();
        if table.get(&parcel_id).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            table.remove(&parcel_id);
        }
    }

    /// Parcels currently locked or awaited
    pub fn tracked(&self) -> usize {
        self.table().len()
    }
}

impl ParcelGuard {
    pub fn parcel_id(&self) -> i64 {
        self.parcel_id
    }
}

impl Drop for ParcelGuard {
    fn drop(&mut self) {
        let mut table = self.owner.table();
        if let Some(mutex) = table.get(&self.parcel_id) {
            // Map + this guard: no waiter is queued, safe to forget the entry
            if Arc::strong_count(mutex) <= 2 {
                table.remove(&self.parcel_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = ParcelLocks::new();
        let guard = locks.acquire(7, Duration::from_millis(50)).await.unwrap();
        assert_eq!(guard.parcel_id(), 7);

        let second = locks.acquire(7, Duration::from_millis(20)).await;
        assert!(matches!(second, Err(Error::WriteConflict { parcel_id: 7, .. })));

        drop(guard);
        assert!(locks.acquire(7, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_parcels_do_not_block() {
        let locks = ParcelLocks::new();
        let _a = locks.acquire(1, Duration::from_millis(20)).await.unwrap();
        let _b = locks.acquire(2, Duration::from_millis(20)).await.unwrap();
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn test_entries_cleaned_up() {
        let locks = ParcelLocks::new();
        {
            let _guard = locks.acquire(3, Duration::from_millis(20)).await.unwrap();
            assert_eq!(locks.tracked(), 1);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = ParcelLocks::new();
        let guard = locks.acquire(5, Duration::from_millis(50)).await.unwrap();

        let waiter_locks = locks.clone();
        let waiter = tokio::spawn(async move {
            waiter_locks.acquire(5, Duration::from_secs(2)).await.map(|g| g.parcel_id())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(waiter.await.unwrap().unwrap(), 5);
        assert_eq!(locks.tracked(), 0);
    }
}
