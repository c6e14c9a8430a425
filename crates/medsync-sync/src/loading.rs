//! # Aggregate Loading State
//!
//! One flag per category; the engine is "initially loading" while any flag
//! of the initial set is raised.
//!
//! ```text
//!   calendars ─┐
//!   shared    ─┤
//!   tokens    ─┼──► OR ──► is_initial_loading()  (watch channel)
//!   notifs    ─┤
//!   medicines ─┤
//!   boxes     ─┘        schedule has a flag but stays out of the OR
//! ```

use medsync_core::ResourceCategory;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Serializable view of every flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingSnapshot {
    pub initial_loading: bool,
    pub categories: BTreeMap<ResourceCategory, bool>,
}

#[derive(Clone)]
pub struct LoadingState {
    flags: Arc<Mutex<BTreeMap<ResourceCategory, bool>>>,
    aggregate: Arc<watch::Sender<bool>>,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingState {
    /// Starts with every flag raised.
    pub fn new() -> Self {
        let flags = ResourceCategory::ALL
            .iter()
            .map(|c| (*c, true))
            .collect();
        let (aggregate, _rx) = watch::channel(true);
        Self {
            flags: Arc::new(Mutex::new(flags)),
            aggregate: Arc::new(aggregate),
        }
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<ResourceCategory, bool>)) {
        let mut flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut flags);
        let any = initial_loading(&flags);
        self.aggregate.send_if_modified(|current| {
            let changed = *current != any;
            *current = any;
            changed
        });
    }

    /// Raises the flag for `category`.
    pub fn begin(&self, category: ResourceCategory) {
        self.update(|flags| {
            flags.insert(category, true);
        });
    }

    /// Clears the flag for `category`.
    pub fn settle(&self, category: ResourceCategory) {
        self.update(|flags| {
            flags.insert(category, false);
        });
        debug!(%category, "Loading settled");
    }

    /// Raises every flag (identity change).
    pub fn reset(&self) {
        self.update(|flags| flags.values_mut().for_each(|raised| *raised = true));
    }

    pub fn is_loading(&self, category: ResourceCategory) -> bool {
        let flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        flags.get(&category).copied().unwrap_or(false)
    }

    pub fn is_initial_loading(&self) -> bool {
        *self.aggregate.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.aggregate.subscribe()
    }

    pub fn snapshot(&self) -> LoadingSnapshot {
        let flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        LoadingSnapshot {
            initial_loading: initial_loading(&flags),
            categories: flags.clone(),
        }
    }
}

fn initial_loading(flags: &BTreeMap<ResourceCategory, bool>) -> bool {
    flags
        .iter()
        .any(|(category, raised)| *raised && category.is_initial())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_is_or_of_flags() {
        let loading = LoadingState::new();
        assert!(loading.is_initial_loading());

        for category in ResourceCategory::INITIAL {
            assert!(loading.is_initial_loading());
            loading.settle(category);
        }
        assert!(!loading.is_initial_loading());

        loading.begin(ResourceCategory::Boxes);
        assert!(loading.is_initial_loading());
        assert!(loading.is_loading(ResourceCategory::Boxes));
    }

    #[test]
    fn test_schedule_stays_out_of_aggregate() {
        let loading = LoadingState::new();
        ResourceCategory::INITIAL.iter().for_each(|c| loading.settle(*c));

        assert!(loading.is_loading(ResourceCategory::Schedule));
        assert!(!loading.is_initial_loading());

        loading.settle(ResourceCategory::Schedule);
        loading.begin(ResourceCategory::Schedule);
        assert!(!loading.is_initial_loading());
    }

    #[test]
    fn test_reset_raises_everything() {
        let loading = LoadingState::new();
        ResourceCategory::INITIAL.iter().for_each(|c| loading.settle(*c));
        loading.reset();
        assert!(ResourceCategory::ALL.iter().all(|c| loading.is_loading(*c)));
    }

    #[test]
    fn test_snapshot_shape() {
        let loading = LoadingState::new();
        loading.settle(ResourceCategory::Calendars);
        let json = serde_json::to_value(loading.snapshot()).unwrap();
        assert_eq!(json["initialLoading"], true);
        assert_eq!(json["categories"]["calendars"], false);
        assert_eq!(json["categories"]["boxes"], true);
        assert_eq!(json["categories"]["schedule"], true);
    }

    #[tokio::test]
    async fn test_watchers_see_aggregate_flip() {
        let loading = LoadingState::new();
        let mut rx = loading.subscribe();
        ResourceCategory::INITIAL.iter().for_each(|c| loading.settle(*c));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
