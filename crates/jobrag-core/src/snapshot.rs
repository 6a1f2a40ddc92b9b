//! Copy-on-write snapshots for index state.
//!
//! Readers take an `Arc` of the current version and search it without holding
//! any lock. Writers serialize on a separate mutex, build the next version from
//! a clone of the current one and publish it with a single pointer swap, so a
//! query sees either the whole of a write or none of it.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub published_at: DateTime<Utc>,
    pub value: T,
}

impl<T> std::ops::Deref for Versioned<T> {
    type Target = T;
    fn deref(&self) -> &T { &self.value }
}

#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: RwLock<Arc<Versioned<T>>>,
    writer: Mutex<()>,
}

impl<T: Clone> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(Versioned { version: 0, published_at: Utc::now(), value })),
            writer: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Arc<Versioned<T>> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 { self.load().version }

    /// Apply `edit` to a private copy and publish it if `edit` succeeds.
    /// On error the published snapshot is left untouched.
    pub fn update<R, E>(&self, edit: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.load();
        let mut next = base.value.clone();
        let out = edit(&mut next)?;
        self.swap(base.version + 1, next);
        Ok(out)
    }

    /// Replace the whole value, e.g. after a full rebuild.
    pub fn publish(&self, value: T) -> u64 {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let version = self.load().version + 1;
        self.swap(version, value);
        version
    }

    fn swap(&self, version: u64, value: T) {
        let next = Arc::new(Versioned { version, published_at: Utc::now(), value });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl<T: Clone + Default> Default for SnapshotCell<T> {
    fn default() -> Self { Self::new(T::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_update_keeps_previous_version() {
        let cell = SnapshotCell::new(vec![1u32]);
        let err: Result<(), &str> = cell.update(|v| {
            v.push(2);
            Err("boom")
        });
        assert!(err.is_err());
        let snap = cell.load();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.value, vec![1]);
    }

    #[test]
    fn reader_keeps_its_snapshot_across_writes() {
        let cell = SnapshotCell::new(vec![1u32]);
        let before = cell.load();
        cell.update(|v| { v.push(2); Ok::<_, ()>(()) }).unwrap();
        assert_eq!(before.value, vec![1]);
        assert_eq!(cell.load().value, vec![1, 2]);
        assert_eq!(cell.version(), 1);
    }
}
