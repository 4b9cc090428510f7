use std::time::Instant;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::time;

use super::split::{abutting_windows, merge_abutting, overlaps_any};
use super::{AllocationEngine, EngineError, StagedBooking};

/// Optional booking metadata supplied by intake.
#[derive(Debug, Clone, Default)]
pub struct BookingDetails {
    /// Overrides the spot's hourly price as the booking's base rate.
    pub base_rate: Option<f64>,
    pub kind: BookingKind,
}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub spot_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Trusted caller identity; `None` means unauthenticated.
    pub user_id: Option<Ulid>,
    pub details: BookingDetails,
}

/// Result of a successful cancellation.
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub booking: Booking,
    /// The window now covering the freed range, merged with abutting windows.
    pub restored: AvailabilityWindow,
    /// Ids of the abutting windows folded into `restored`.
    pub merged: Vec<Ulid>,
}

enum Attempt {
    Booked(Booking),
    NoMatch,
    Race,
}

fn kind_label(kind: BookingKind) -> &'static str {
    match kind {
        BookingKind::Interactive => "interactive",
        BookingKind::Batch => "batch",
    }
}

impl AllocationEngine {
    /// Book `[start, end)` on a spot, splitting the window that contains it.
    ///
    /// `Ok(None)` covers every expected negative: invalid input, no
    /// containing window, or a concurrent allocation winning the window.
    pub async fn allocate(&self, req: AllocationRequest) -> Result<Option<Booking>, EngineError> {
        let started = Instant::now();
        let result = self.try_allocate(&req).await;
        let outcome = match &result {
            Ok(Attempt::Booked(_)) => "booked",
            Ok(Attempt::NoMatch) => "no_match",
            Ok(Attempt::Race) => "race",
            Err(_) => "error",
        };
        metrics::counter!(
            observability::ALLOCATIONS_TOTAL,
            "kind" => kind_label(req.details.kind),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(observability::ALLOCATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        result.map(|attempt| match attempt {
            Attempt::Booked(b) => Some(b),
            Attempt::NoMatch | Attempt::Race => None,
        })
    }

    async fn try_allocate(&self, req: &AllocationRequest) -> Result<Attempt, EngineError> {
        if !self.index.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        let Some(user_id) = req.user_id else {
            debug!(spot_id = %req.spot_id, "allocation without a user id");
            return Ok(Attempt::NoMatch);
        };
        let Some(span) = Span::try_new(req.start, req.end) else {
            debug!(spot_id = %req.spot_id, start = req.start, end = req.end, "allocation with empty range");
            return Ok(Attempt::NoMatch);
        };
        if let Err(e) = time::validate_span(&span) {
            debug!(spot_id = %req.spot_id, error = %e, "allocation range rejected");
            return Ok(Attempt::NoMatch);
        }

        let _spot_guard = self.lock_spot(req.spot_id).await;

        // Candidate windows from the (possibly stale) index.
        let candidates: Vec<Ulid> = self
            .index
            .search_spot(&req.spot_id, &span)?
            .into_iter()
            .filter(|e| e.span.contains_span(&span))
            .map(|e| e.window_id)
            .collect();
        if candidates.is_empty() {
            debug!(spot_id = %req.spot_id, ?span, "no indexed window contains the range");
            return Ok(Attempt::NoMatch);
        }

        let mut txn = self.db.begin().await?;
        let Some(spot) = txn.spot(&req.spot_id).cloned() else {
            debug!(spot_id = %req.spot_id, "spot vanished before allocation");
            return Ok(Attempt::NoMatch);
        };
        let Some(window) = candidates
            .iter()
            .filter_map(|id| spot.window(id))
            .find(|w| w.can_host(&span))
            .cloned()
        else {
            debug!(spot_id = %spot.id, ?span, "indexed window no longer hosts the range; aborting");
            return Ok(Attempt::Race);
        };
        if let Some(clash) = txn.tables().active_bookings_overlapping(&spot.id, &span).next() {
            error!(
                integrity = true,
                spot_id = %spot.id,
                window_id = %window.id,
                booking_id = %clash.id,
                "available window overlaps an active booking; refusing allocation"
            );
            return Ok(Attempt::Race);
        }

        let Some(staged) = Self::stage_booking(&mut txn, &spot, &window, span, user_id, &req.details)
        else {
            return Ok(Attempt::Race);
        };
        txn.commit().await?;

        self.finish_booking(&staged, None);
        Ok(Attempt::Booked(staged.booking))
    }

    /// Post-commit half of a booking: index sync, then notify.
    pub(crate) fn finish_booking(&self, staged: &StagedBooking, request_id: Option<Ulid>) {
        self.sync_index(std::slice::from_ref(&staged.consumed), &staged.remainders);
        let b = &staged.booking;
        info!(
            booking_id = %b.id,
            spot_id = %b.spot_id,
            user_id = %b.user_id,
            start = b.span.start,
            end = b.span.end,
            remainders = staged.remainders.len(),
            "booking created"
        );
        self.notify.send(
            b.user_id,
            Notice::BookingConfirmed {
                booking_id: b.id,
                spot_id: b.spot_id,
                span: b.span,
                request_id,
            },
        );
    }

    /// Cancel a future booking and give its range back to the spot, merged
    /// with exactly-abutting available windows of the same category.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        now: Ms,
    ) -> Result<Cancellation, EngineError> {
        let result = self.try_cancel(booking_id, user_id, now).await;
        let status = if result.is_ok() { "ok" } else { "rejected" };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "status" => status).increment(1);
        result
    }

    async fn try_cancel(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        now: Ms,
    ) -> Result<Cancellation, EngineError> {
        if !self.index.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        let spot_id = self
            .db
            .get_booking(&booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?
            .spot_id;
        let _spot_guard = self.lock_spot(spot_id).await;

        let mut txn = self.db.begin().await?;
        let mut booking = txn
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.user_id != user_id {
            return Err(EngineError::NotOwner {
                user: user_id,
                entity: booking_id,
            });
        }
        if !booking.is_active() {
            return Err(EngineError::NotActive(booking_id));
        }
        if now >= booking.span.start {
            return Err(EngineError::AlreadyStarted(booking_id));
        }
        let spot = txn
            .spot(&booking.spot_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking.spot_id))?;

        if let Some(clash) = overlaps_any(&booking.span, spot.available_windows().map(|w| &w.span)) {
            error!(
                integrity = true,
                booking_id = %booking_id,
                spot_id = %spot.id,
                "booked range is also published as available"
            );
            return Err(EngineError::Overlap(clash));
        }

        let neighbours = abutting_windows(&spot.windows, &booking.span, booking.category);
        let merged: Vec<Ulid> = neighbours.iter().map(|w| w.id).collect();
        let neighbour_spans: Vec<Span> = neighbours.iter().map(|w| w.span).collect();
        let restored = AvailabilityWindow::new(
            spot.id,
            merge_abutting(booking.span, &neighbour_spans),
            booking.category,
        );

        txn.set_booking_status(booking_id, BookingStatus::Cancelled);
        for id in &merged {
            txn.remove_window(spot.id, *id);
        }
        txn.add_window(restored.clone());
        txn.commit().await?;

        self.sync_index(&merged, std::slice::from_ref(&restored));
        booking.status = BookingStatus::Cancelled;
        info!(
            booking_id = %booking_id,
            spot_id = %spot.id,
            merged = merged.len(),
            "booking cancelled, window restored"
        );
        self.notify.send(
            user_id,
            Notice::BookingCancelled {
                booking_id,
                spot_id: spot.id,
                span: booking.span,
            },
        );

        Ok(Cancellation {
            booking,
            restored,
            merged,
        })
    }

    /// Publish a new availability window on a spot.
    ///
    /// Private spots may only be released by their owner; building spots
    /// have no owner and accept any trusted caller.
    pub async fn release_window(
        &self,
        spot_id: Ulid,
        by: Ulid,
        span: Span,
        category: WindowCategory,
    ) -> Result<AvailabilityWindow, EngineError> {
        if !self.index.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        time::validate_span(&span)?;
        let _spot_guard = self.lock_spot(spot_id).await;

        let mut txn = self.db.begin().await?;
        let spot = txn.spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        if spot.owner_id.is_some_and(|owner| owner != by) {
            return Err(EngineError::NotOwner {
                user: by,
                entity: spot_id,
            });
        }
        if spot.windows.len() >= MAX_WINDOWS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many windows on spot"));
        }
        let clash = overlaps_any(
            &span,
            spot.available_windows()
                .map(|w| &w.span)
                .chain(txn.tables().active_bookings_overlapping(&spot_id, &span).map(|b| &b.span)),
        );
        if let Some(clash) = clash {
            return Err(EngineError::Overlap(clash));
        }

        let window = AvailabilityWindow::new(spot_id, span, category);
        txn.add_window(window.clone());
        txn.commit().await?;

        self.sync_index(&[], std::slice::from_ref(&window));
        info!(spot_id = %spot_id, window_id = %window.id, start = span.start, end = span.end, "window released");
        Ok(window)
    }

    /// Withdraw or re-publish an existing window without deleting it.
    pub async fn set_window_available(
        &self,
        spot_id: Ulid,
        window_id: Ulid,
        by: Ulid,
        available: bool,
    ) -> Result<(), EngineError> {
        if !self.index.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        let _spot_guard = self.lock_spot(spot_id).await;

        let mut txn = self.db.begin().await?;
        let spot = txn.spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        if spot.owner_id.is_some_and(|owner| owner != by) {
            return Err(EngineError::NotOwner {
                user: by,
                entity: spot_id,
            });
        }
        let mut window = spot
            .window(&window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))?;
        if window.is_available == available {
            return Ok(());
        }
        if available {
            let clash = overlaps_any(
                &window.span,
                spot.available_windows()
                    .map(|w| &w.span)
                    .chain(
                        txn.tables()
                            .active_bookings_overlapping(&spot_id, &window.span)
                            .map(|b| &b.span),
                    ),
            );
            if let Some(clash) = clash {
                return Err(EngineError::Overlap(clash));
            }
        }

        txn.set_window_available(spot_id, window_id, available);
        txn.commit().await?;

        if available {
            window.is_available = true;
            self.sync_index(&[], std::slice::from_ref(&window));
        } else if matches!(self.index.get(&window_id), Ok(Some(_))) {
            self.sync_index(&[window_id], &[]);
        } else {
            // Windows already over at load time are never indexed.
            debug!(window_id = %window_id, "withdrawn window was not indexed");
        }
        info!(spot_id = %spot_id, window_id = %window_id, available, "window availability changed");
        Ok(())
    }

    /// Mark every active booking that has ended by `now` as Completed.
    /// Windows are untouched. Returns how many bookings changed.
    pub async fn complete_elapsed(&self, now: Ms) -> Result<usize, EngineError> {
        let mut txn = self.db.begin().await?;
        let ids: Vec<Ulid> = txn
            .tables()
            .active_bookings_ended_by(now)
            .iter()
            .map(|b| b.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        for id in &ids {
            txn.set_booking_status(*id, BookingStatus::Completed);
        }
        txn.commit().await?;

        metrics::counter!(observability::BOOKINGS_COMPLETED_TOTAL).increment(ids.len() as u64);
        debug!(completed = ids.len(), now, "elapsed bookings completed");
        Ok(ids.len())
    }
}
