//! Transactional intent locks.
//!
//! Each key under transactional control maps to an intent lock with shared
//! and exclusive reference counts. Acquisition over a key set is
//! all-or-nothing in its return value only: refused acquisitions leave the
//! already-taken references held, and the caller releases them on failure.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};

/// Lock mode requested by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn name(self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

/// An intent lock: reference counts per mode.
#[derive(Debug, Default, Clone)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    /// Try to take a reference in `mode`. Shared admits shared; exclusive
    /// admits nothing else.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        let granted = self.check(mode);
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
        granted
    }

    /// Whether a request in `mode` would be granted right now.
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive == 0,
            LockMode::Exclusive => self.exclusive == 0 && self.shared == 0,
        }
    }

    /// Drop one reference of `mode`.
    pub fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                debug_assert!(self.shared > 0);
                self.shared = self.shared.saturating_sub(1);
            }
            LockMode::Exclusive => {
                debug_assert!(self.exclusive > 0);
                self.exclusive = self.exclusive.saturating_sub(1);
            }
        }
    }

    pub fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }
}

/// The per-database lock table.
///
/// Keys are owned `Bytes` so a lock taken by a multi transaction stays valid
/// after the command's argument buffers are gone; lookups borrow as `&[u8]`.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<Bytes, IntentLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take all `keys` in `mode`, deduplicating. Returns false when
    /// any key refused; refused or not, taken references stay recorded and
    /// the caller is responsible for releasing on failure.
    pub fn acquire<'a>(&mut self, mode: LockMode, keys: impl IntoIterator<Item = &'a [u8]>) -> bool {
        let mut acquired = true;
        let mut seen: HashSet<&[u8]> = HashSet::new();
        for key in keys {
            if seen.insert(key) {
                acquired &= self
                    .locks
                    .entry(Bytes::copy_from_slice(key))
                    .or_default()
                    .acquire(mode);
            }
        }
        acquired
    }

    /// Drop one reference per distinct key; erases entries that become free.
    pub fn release<'a>(&mut self, mode: LockMode, keys: impl IntoIterator<Item = &'a [u8]>) {
        let mut seen: HashSet<&[u8]> = HashSet::new();
        for key in keys {
            if seen.insert(key) {
                let lock = self
                    .locks
                    .get_mut(key)
                    .unwrap_or_else(|| panic!("releasing a lock that was never taken"));
                lock.release(mode);
                if lock.is_free() {
                    self.locks.remove(key);
                }
            }
        }
    }

    /// Non-mutating test: would all `keys` be granted in `mode`?
    pub fn check<'a>(&self, mode: LockMode, keys: impl IntoIterator<Item = &'a [u8]>) -> bool {
        keys.into_iter()
            .all(|key| self.locks.get(key).map_or(true, |l| l.check(mode)))
    }

    /// Whether the key currently holds any lock references.
    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_admits_shared() {
        let mut lt = LockTable::new();
        assert!(lt.acquire(LockMode::Shared, [b"k".as_slice()]));
        assert!(lt.acquire(LockMode::Shared, [b"k".as_slice()]));
        assert!(!lt.acquire(LockMode::Exclusive, [b"k".as_slice()]));
    }

    #[test]
    fn test_exclusive_blocks_all() {
        let mut lt = LockTable::new();
        assert!(lt.acquire(LockMode::Exclusive, [b"k".as_slice()]));
        assert!(!lt.check(LockMode::Shared, [b"k".as_slice()]));
        assert!(!lt.check(LockMode::Exclusive, [b"k".as_slice()]));
    }

    #[test]
    fn test_failed_acquire_keeps_references() {
        let mut lt = LockTable::new();
        assert!(lt.acquire(LockMode::Exclusive, [b"a".as_slice()]));
        // Second acquisition over {a, b} fails on a, but both references
        // are recorded; releasing both leaves only the original.
        assert!(!lt.acquire(LockMode::Exclusive, [b"a".as_slice(), b"b".as_slice()]));
        assert!(lt.is_locked(b"b"));
        lt.release(LockMode::Exclusive, [b"a".as_slice(), b"b".as_slice()]);
        assert!(lt.is_locked(b"a"));
        assert!(!lt.is_locked(b"b"));
    }

    #[test]
    fn test_release_erases_free_entries() {
        let mut lt = LockTable::new();
        lt.acquire(LockMode::Shared, [b"k".as_slice()]);
        assert_eq!(lt.len(), 1);
        lt.release(LockMode::Shared, [b"k".as_slice()]);
        assert!(lt.is_empty());
    }

    #[test]
    fn test_duplicate_keys_deduplicated() {
        let mut lt = LockTable::new();
        assert!(lt.acquire(LockMode::Exclusive, [b"k".as_slice(), b"k".as_slice()]));
        // One reference only: a single release frees the entry.
        lt.release(LockMode::Exclusive, [b"k".as_slice()]);
        assert!(lt.is_empty());
    }

    #[test]
    fn test_check_unknown_key_is_free() {
        let lt = LockTable::new();
        assert!(lt.check(LockMode::Exclusive, [b"nope".as_slice()]));
    }
}
