use tokio::sync::MutexGuard;
use ulid::Ulid;

use crate::model::*;

use super::{Database, StoreError, Tables};

/// An open transaction.
///
/// Reads observe the state as of `begin()`; writes are staged and become
/// visible only after `commit()` has made them durable. Dropping the
/// transaction without committing discards every staged write.
pub struct Transaction<'a> {
    db: &'a Database,
    tables: MutexGuard<'a, Tables>,
    staged: Vec<Event>,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(db: &'a Database, tables: MutexGuard<'a, Tables>) -> Self {
        Self {
            db,
            tables,
            staged: Vec::new(),
        }
    }

    /// Committed state as of `begin()`.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn spot(&self, id: &Ulid) -> Option<&Spot> {
        self.tables.spot(id)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.tables.booking(id)
    }

    pub fn request(&self, id: &Ulid) -> Option<&ParkingRequest> {
        self.tables.request(id)
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn remove_window(&mut self, spot_id: Ulid, window_id: Ulid) {
        self.stage(Event::WindowRemoved { spot_id, window_id });
    }

    pub fn add_window(&mut self, window: AvailabilityWindow) {
        self.stage(Event::WindowAdded { window });
    }

    pub fn set_window_available(&mut self, spot_id: Ulid, window_id: Ulid, is_available: bool) {
        self.stage(Event::WindowAvailabilityChanged {
            spot_id,
            window_id,
            is_available,
        });
    }

    pub fn create_booking(&mut self, booking: Booking) {
        self.stage(Event::BookingCreated { booking });
    }

    pub fn set_booking_status(&mut self, id: Ulid, status: BookingStatus) {
        self.stage(Event::BookingStatusChanged { id, status });
    }

    pub fn update_request(&mut self, id: Ulid, status: RequestStatus, assigned_spot_id: Option<Ulid>) {
        self.stage(Event::RequestUpdated {
            id,
            status,
            assigned_spot_id,
        });
    }

    pub fn adjust_priority(&mut self, user_id: Ulid, delta: i64) {
        self.stage(Event::PriorityAdjusted { user_id, delta });
    }

    /// Durably write every staged event as one record, then apply them.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.staged);
        self.db.wal_append(events.clone()).await?;
        for event in &events {
            self.tables.apply_event(event);
        }
        Ok(())
    }
}
