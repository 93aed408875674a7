//! Lock acquisition that survives poisoning.
//!
//! A listener or fetcher that panics must not take the whole cache down with
//! it, so poisoned guards are recovered and the event is logged.

use std::sync::{
    LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use metrics::counter;
use tracing::warn;

const METRIC_POISON_RECOVERED: &str = "almanac_sync_lock_poison_recovered_total";

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op,
            target_module = target,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned sync lock; state written before the panic is kept"
        );
        counter!(METRIC_POISON_RECOVERED, "lock_kind" => lock_kind).increment(1);
        poisoned.into_inner()
    })
}

pub(crate) fn read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

pub(crate) fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(mutex.lock(), target, op, "mutex.lock")
}
