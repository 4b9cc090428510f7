//! In-memory availability index.
//!
//! A derived cache over persisted windows: every mutation here must follow
//! the durable write it mirrors, and `load()` rebuilds it from scratch.

mod tree;

pub use tree::{IndexedWindow, IntervalTree};

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{error, info};
use ulid::Ulid;

use crate::db::Database;
use crate::engine::EngineError;
use crate::model::{AvailabilityWindow, Ms, Span};
use crate::observability;

struct Index {
    tree: IntervalTree,
    /// window id → entry, so removal by id can find the tree key.
    lookup: HashMap<Ulid, IndexedWindow>,
}

impl Index {
    fn from_windows(windows: &[AvailabilityWindow]) -> Self {
        let mut index = Self {
            tree: IntervalTree::new(),
            lookup: HashMap::with_capacity(windows.len()),
        };
        for w in windows {
            index.insert(w);
        }
        index
    }

    fn insert(&mut self, w: &AvailabilityWindow) {
        let entry = IndexedWindow {
            window_id: w.id,
            spot_id: w.spot_id,
            span: w.span,
        };
        if let Some(old) = self.lookup.insert(w.id, entry) {
            self.tree.remove(old.span.start, old.window_id);
        }
        self.tree.insert(entry);
    }

    fn remove(&mut self, window_id: &Ulid) -> bool {
        match self.lookup.remove(window_id) {
            Some(entry) => self.tree.remove(entry.span.start, entry.window_id).is_some(),
            None => false,
        }
    }
}

/// Process-wide index of available windows across all spots.
///
/// Starts out not loaded; every operation other than `load` fails with
/// `EngineError::NotLoaded` until a load succeeds.
#[derive(Default)]
pub struct IntervalStore {
    inner: RwLock<Option<Index>>,
}

impl IntervalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Clear and rebuild from persisted windows that are available and not
    /// over at `now`. On failure the store is left not loaded.
    pub async fn load(&self, db: &Database, now: Ms) -> Result<usize, EngineError> {
        let windows = match db.available_windows(now).await {
            Ok(w) => w,
            Err(e) => {
                *self.inner.write() = None;
                metrics::counter!(observability::INDEX_LOADS_TOTAL, "status" => "error").increment(1);
                error!(error = %e, "availability index load failed; index is not loaded");
                return Err(e.into());
            }
        };
        let index = Index::from_windows(&windows);
        let len = index.tree.len();
        *self.inner.write() = Some(index);

        metrics::counter!(observability::INDEX_LOADS_TOTAL, "status" => "ok").increment(1);
        metrics::gauge!(observability::INDEX_WINDOWS).set(len as f64);
        info!(windows = len, "availability index loaded");
        Ok(len)
    }

    /// Index a window whose persisted write has already committed.
    pub fn add(&self, window: &AvailabilityWindow) -> Result<(), EngineError> {
        self.apply(&[], std::slice::from_ref(window)).map(|_| ())
    }

    /// Drop a window from the index. Returns whether it was present; absence
    /// after a persisted removal is logged as an integrity violation.
    pub fn remove(&self, window_id: &Ulid) -> Result<bool, EngineError> {
        self.apply(std::slice::from_ref(window_id), &[])
            .map(|missing| missing == 0)
    }

    /// Mirror one committed change set in a single critical section:
    /// readers never observe `removed` gone while `added` is still absent.
    /// Returns how many removed ids were missing from the index.
    pub fn apply(
        &self,
        removed: &[Ulid],
        added: &[AvailabilityWindow],
    ) -> Result<usize, EngineError> {
        let mut guard = self.inner.write();
        let index = guard.as_mut().ok_or(EngineError::NotLoaded)?;

        let mut missing = 0;
        for id in removed {
            if !index.remove(id) {
                missing += 1;
                metrics::counter!(observability::INDEX_INCONSISTENCIES_TOTAL).increment(1);
                error!(
                    integrity = true,
                    window_id = %id,
                    "window missing from availability index after persisted removal; next load will repair"
                );
            }
        }
        for w in added.iter().filter(|w| w.is_available) {
            index.insert(w);
        }

        metrics::gauge!(observability::INDEX_WINDOWS).set(index.tree.len() as f64);
        Ok(missing)
    }

    /// Every indexed window overlapping `[span.start, span.end)`.
    pub fn search(&self, span: &Span) -> Result<Vec<IndexedWindow>, EngineError> {
        let guard = self.inner.read();
        let index = guard.as_ref().ok_or(EngineError::NotLoaded)?;
        Ok(index.tree.overlapping(span))
    }

    /// Indexed windows of one spot overlapping `span`.
    pub fn search_spot(&self, spot_id: &Ulid, span: &Span) -> Result<Vec<IndexedWindow>, EngineError> {
        let mut hits = self.search(span)?;
        hits.retain(|e| e.spot_id == *spot_id);
        Ok(hits)
    }

    pub fn get(&self, window_id: &Ulid) -> Result<Option<IndexedWindow>, EngineError> {
        let guard = self.inner.read();
        let index = guard.as_ref().ok_or(EngineError::NotLoaded)?;
        Ok(index.lookup.get(window_id).copied())
    }

    /// Sorted contents, for comparisons and diagnostics.
    pub fn snapshot(&self) -> Result<Vec<IndexedWindow>, EngineError> {
        let guard = self.inner.read();
        let index = guard.as_ref().ok_or(EngineError::NotLoaded)?;
        Ok(index.tree.iter_sorted())
    }

    pub fn len(&self) -> Result<usize, EngineError> {
        let guard = self.inner.read();
        let index = guard.as_ref().ok_or(EngineError::NotLoaded)?;
        Ok(index.tree.len())
    }
}
