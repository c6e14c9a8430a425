//! # Cache Entries
//!
//! Last successfully fetched value of one category, tagged with the scope
//! assignment it belongs to.
//!
//! ```text
//!   bind(tag#7)      value := None, current := tag#7
//!   commit(tag#6, v) rejected (stale)
//!   commit(tag#7, v) value := Arc(v), watchers woken
//! ```
//!
//! Values are replaced wholesale; readers hold an `Arc` and never observe a
//! half-written update.

use medsync_core::Scope;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Identifies one scope assignment. Two assignments of an equal scope get
/// different generations, so a late response to the first never lands in
/// the second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTag {
    pub scope: Option<Scope>,
    pub generation: u64,
}

impl ScopeTag {
    pub fn unbound() -> Self {
        ScopeTag {
            scope: None,
            generation: 0,
        }
    }
}

pub struct CacheEntry<T> {
    current: Mutex<ScopeTag>,
    tx: watch::Sender<Option<Arc<T>>>,
}

impl<T> Default for CacheEntry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheEntry<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            current: Mutex::new(ScopeTag::unbound()),
            tx,
        }
    }

    fn tag(&self) -> std::sync::MutexGuard<'_, ScopeTag> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes `tag` the current assignment and drops the old value.
    pub fn bind(&self, tag: ScopeTag) {
        let mut current = self.tag();
        *current = tag;
        self.tx.send_replace(None);
    }

    pub fn is_current(&self, tag: &ScopeTag) -> bool {
        *self.tag() == *tag
    }

    /// Stores `value` if `tag` is still current. Returns false for stale
    /// results, which are discarded.
    pub fn commit(&self, tag: &ScopeTag, value: T) -> bool {
        self.commit_with(tag, value, || {})
    }

    /// Like [`CacheEntry::commit`], running `on_commit` under the tag lock
    /// so no `bind` or `clear` can land between the store and `on_commit`.
    pub fn commit_with(&self, tag: &ScopeTag, value: T, on_commit: impl FnOnce()) -> bool {
        let current = self.tag();
        if *current != *tag {
            return false;
        }
        self.tx.send_replace(Some(Arc::new(value)));
        on_commit();
        true
    }

    /// Runs `f` under the tag lock if `tag` is still current.
    pub fn settle_if_current(&self, tag: &ScopeTag, f: impl FnOnce()) -> bool {
        let current = self.tag();
        if *current != *tag {
            return false;
        }
        f();
        true
    }

    /// Drops the value and unbinds the entry.
    pub fn clear(&self) {
        let mut current = self.tag();
        let generation = current.generation;
        *current = ScopeTag {
            scope: None,
            generation,
        };
        self.tx.send_replace(None);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<T>>> {
        self.tx.subscribe()
    }
}
