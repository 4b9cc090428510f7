mod error;
mod mutations;
mod split;

pub use error::{EngineError, ValidationError};
pub use mutations::{AllocationRequest, BookingDetails, Cancellation};
pub use split::{abutting_windows, carve, merge_abutting, Carve};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::error;
use ulid::Ulid;

use crate::db::{Database, Transaction};
use crate::index::IntervalStore;
use crate::model::*;
use crate::notify::NotifyHub;

/// Interactive allocation, cancellation and window publishing against the
/// persisted store, with the availability index kept in step after commit.
///
/// Built once at startup and shared behind an `Arc`.
pub struct AllocationEngine {
    pub db: Arc<Database>,
    pub index: Arc<IntervalStore>,
    pub notify: Arc<NotifyHub>,
    /// Serializes search → commit → index sync per spot.
    spot_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

/// A booking staged inside a transaction together with the window change it
/// implies. Apply to the index with `sync_index` once the commit succeeds.
#[derive(Debug, Clone)]
pub(crate) struct StagedBooking {
    pub booking: Booking,
    pub consumed: Ulid,
    pub remainders: Vec<AvailabilityWindow>,
}

impl AllocationEngine {
    pub fn new(db: Arc<Database>, index: Arc<IntervalStore>, notify: Arc<NotifyHub>) -> Self {
        Self {
            db,
            index,
            notify,
            spot_locks: DashMap::new(),
        }
    }

    pub(crate) async fn lock_spot(&self, spot_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .spot_locks
            .entry(spot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Stage consumption of `window` by a booking of `span`: the window is
    /// removed, 0–2 remainders are added with new ids, the booking is created.
    /// Returns `None` (staging nothing) when `window` cannot host `span`.
    pub(crate) fn stage_booking(
        txn: &mut Transaction<'_>,
        spot: &Spot,
        window: &AvailabilityWindow,
        span: Span,
        user_id: Ulid,
        details: &BookingDetails,
    ) -> Option<StagedBooking> {
        if !window.is_available {
            return None;
        }
        let cut = carve(&window.span, &span)?;

        txn.remove_window(spot.id, window.id);
        let remainders: Vec<AvailabilityWindow> = cut
            .spans()
            .map(|s| AvailabilityWindow::new(spot.id, s, window.category))
            .collect();
        for w in &remainders {
            txn.add_window(w.clone());
        }

        let booking = Booking {
            id: Ulid::new(),
            user_id,
            spot_id: spot.id,
            source_window_id: Some(window.id),
            span,
            status: BookingStatus::Active,
            base_rate: details.base_rate.unwrap_or(spot.hourly_price),
            payment_status: PaymentStatus::Pending,
            category: window.category,
            kind: details.kind,
        };
        txn.create_booking(booking.clone());

        Some(StagedBooking {
            booking,
            consumed: window.id,
            remainders,
        })
    }

    /// Mirror a committed window change into the index. Never fails the
    /// caller: the durable write already happened and `load()` repairs drift.
    pub(crate) fn sync_index(&self, removed: &[Ulid], added: &[AvailabilityWindow]) {
        if let Err(e) = self.index.apply(removed, added) {
            error!(
                integrity = true,
                error = %e,
                ?removed,
                added = added.len(),
                "index update failed after commit; next load will repair"
            );
        }
    }
}
