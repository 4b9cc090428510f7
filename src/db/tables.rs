use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::SpotFilter;

/// Materialized persisted state, rebuilt from the WAL on open.
#[derive(Debug, Default)]
pub struct Tables {
    pub(super) spots: HashMap<Ulid, Spot>,
    pub(super) bookings: HashMap<Ulid, Booking>,
    pub(super) requests: HashMap<Ulid, ParkingRequest>,
    pub(super) users: HashMap<Ulid, i64>,
    /// spot id → booking ids, in creation order.
    pub(super) bookings_by_spot: HashMap<Ulid, Vec<Ulid>>,
}

impl Tables {
    pub fn spot(&self, id: &Ulid) -> Option<&Spot> {
        self.spots.get(id)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    pub fn request(&self, id: &Ulid) -> Option<&ParkingRequest> {
        self.requests.get(id)
    }

    pub fn priority_score(&self, user_id: &Ulid) -> i64 {
        self.users.get(user_id).copied().unwrap_or(0)
    }

    pub fn spots_matching<'a>(&'a self, filter: &'a SpotFilter) -> impl Iterator<Item = &'a Spot> {
        self.spots.values().filter(move |s| filter.matches(s))
    }

    pub fn bookings_for_spot(&self, spot_id: &Ulid) -> impl Iterator<Item = &Booking> {
        self.bookings_by_spot
            .get(spot_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bookings.get(id))
    }

    /// Active bookings of `spot_id` overlapping `span`.
    pub fn active_bookings_overlapping<'a>(
        &'a self,
        spot_id: &Ulid,
        span: &'a Span,
    ) -> impl Iterator<Item = &'a Booking> {
        self.bookings_for_spot(spot_id)
            .filter(move |b| b.is_active() && b.span.overlaps(span))
    }

    /// Active bookings whose end is at or before `now`, sorted by id.
    pub fn active_bookings_ended_by(&self, now: Ms) -> Vec<&Booking> {
        let mut out: Vec<&Booking> = self
            .bookings
            .values()
            .filter(|b| b.is_active() && b.span.end <= now)
            .collect();
        out.sort_by_key(|b| b.id);
        out
    }

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::SpotCreated { spot } => {
                self.spots.insert(spot.id, spot.clone());
            }
            Event::WindowAdded { window } => {
                if let Some(spot) = self.spots.get_mut(&window.spot_id) {
                    spot.insert_window(window.clone());
                }
            }
            Event::WindowRemoved { spot_id, window_id } => {
                if let Some(spot) = self.spots.get_mut(spot_id) {
                    spot.remove_window(window_id);
                }
            }
            Event::WindowAvailabilityChanged {
                spot_id,
                window_id,
                is_available,
            } => {
                if let Some(w) = self
                    .spots
                    .get_mut(spot_id)
                    .and_then(|s| s.windows.iter_mut().find(|w| w.id == *window_id))
                {
                    w.is_available = *is_available;
                }
            }
            Event::BookingCreated { booking } => {
                self.bookings_by_spot
                    .entry(booking.spot_id)
                    .or_default()
                    .push(booking.id);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.status = *status;
                }
            }
            Event::RequestCreated { request } => {
                self.requests.insert(request.id, request.clone());
            }
            Event::RequestUpdated {
                id,
                status,
                assigned_spot_id,
            } => {
                if let Some(r) = self.requests.get_mut(id) {
                    r.status = *status;
                    r.assigned_spot_id = *assigned_spot_id;
                }
            }
            Event::UserUpserted { id, priority_score } => {
                self.users.insert(*id, *priority_score);
            }
            Event::PriorityAdjusted { user_id, delta } => {
                *self.users.entry(*user_id).or_insert(0) += delta;
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(
            self.users.len() + self.spots.len() + self.bookings.len() + self.requests.len(),
        );
        for (id, score) in &self.users {
            events.push(Event::UserUpserted {
                id: *id,
                priority_score: *score,
            });
        }
        for spot in self.spots.values() {
            events.push(Event::SpotCreated { spot: spot.clone() });
        }
        // Preserve per-spot creation order for bookings.
        for ids in self.bookings_by_spot.values() {
            for id in ids {
                if let Some(b) = self.bookings.get(id) {
                    events.push(Event::BookingCreated { booking: b.clone() });
                }
            }
        }
        for request in self.requests.values() {
            events.push(Event::RequestCreated {
                request: request.clone(),
            });
        }
        events
    }
}
