//! Poison-tolerant lock helpers
//!
//! Shared state is only ever replaced wholesale or mutated by small,
//! non-panicking operations, so a poisoned lock still guards consistent data.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Safe RwLock read helper that recovers from poisoning
#[inline]
pub fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
pub fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recovers_after_poisoning() {
        let lock = Arc::new(RwLock::new(vec![1, 2, 3]));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned(), "Lock should be poisoned by the panic");
        assert_eq!(safe_read(&lock).len(), 3, "Data survives poisoning");
        safe_write(&lock).push(4);
        assert_eq!(safe_read(&lock).len(), 4);
    }
}
