use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type inside the core.
pub type Ms = i64;

/// Half-open interval `[start, end)`. Orders by start, then end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied ranges.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Exact abutment on either side, no gap and no overlap.
    pub fn abuts(&self, other: &Span) -> bool {
        self.end == other.start || other.end == self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowCategory {
    Standard,
    EvCharging,
}

/// A contiguous range during which a spot accepts bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub span: Span,
    pub is_available: bool,
    pub category: WindowCategory,
}

impl AvailabilityWindow {
    pub fn new(spot_id: Ulid, span: Span, category: WindowCategory) -> Self {
        Self {
            id: Ulid::new(),
            spot_id,
            span,
            is_available: true,
            category,
        }
    }

    /// Available and covering `span` entirely.
    pub fn can_host(&self, span: &Span) -> bool {
        self.is_available && self.span.contains_span(span)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotKind {
    /// Owned by an individual and rented out through search.
    Private,
    /// Belongs to a building pool and is assigned by the daily batch.
    Building,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargerType {
    Level1,
    Level2,
    DcFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: Ulid,
    pub kind: SpotKind,
    pub owner_id: Option<Ulid>,
    pub building_id: Option<Ulid>,
    pub lat: f64,
    pub lon: f64,
    pub hourly_price: f64,
    pub charger: Option<ChargerType>,
    /// Availability windows, sorted by `span.start`.
    pub windows: Vec<AvailabilityWindow>,
}

impl Spot {
    pub fn new(kind: SpotKind, lat: f64, lon: f64, hourly_price: f64) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            owner_id: None,
            building_id: None,
            lat,
            lon,
            hourly_price,
            charger: None,
            windows: Vec::new(),
        }
    }

    pub fn window(&self, id: &Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == *id)
    }

    /// First available window that fully contains `span`.
    pub fn containing_window(&self, span: &Span) -> Option<&AvailabilityWindow> {
        let right_bound = self.windows.partition_point(|w| w.span.start <= span.start);
        self.windows[..right_bound].iter().find(|w| w.can_host(span))
    }

    pub fn available_windows(&self) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(|w| w.is_available)
    }

    /// Insert a window maintaining sort order by span.start.
    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.span.start, |w| w.span.start)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: &Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == *id)?;
        Some(self.windows.remove(pos))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    #[default]
    Interactive,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub spot_id: Ulid,
    pub source_window_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub base_rate: f64,
    pub payment_status: PaymentStatus,
    pub category: WindowCategory,
    pub kind: BookingKind,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    PendingBatch,
    WaitingQueue,
    Confirmed,
    Cancelled,
}

/// A durable ask for a building spot on a future day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub building_id: Ulid,
    pub span: Span,
    pub status: RequestStatus,
    pub assigned_spot_id: Option<Ulid>,
}

impl ParkingRequest {
    pub fn new(user_id: Ulid, building_id: Ulid, span: Span) -> Self {
        Self {
            id: Ulid::new(),
            user_id,
            building_id,
            span,
            status: RequestStatus::PendingBatch,
            assigned_spot_id: None,
        }
    }
}

/// The event types. A WAL record is a `Vec<Event>` committed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpotCreated {
        spot: Spot,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        spot_id: Ulid,
        window_id: Ulid,
    },
    WindowAvailabilityChanged {
        spot_id: Ulid,
        window_id: Ulid,
        is_available: bool,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
    RequestCreated {
        request: ParkingRequest,
    },
    RequestUpdated {
        id: Ulid,
        status: RequestStatus,
        assigned_spot_id: Option<Ulid>,
    },
    UserUpserted {
        id: Ulid,
        priority_score: i64,
    },
    PriorityAdjusted {
        user_id: Ulid,
        delta: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(spot: &Spot, start: Ms, end: Ms) -> AvailabilityWindow {
        AvailabilityWindow::new(spot.id, Span::new(start, end), WindowCategory::Standard)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 200), Some(Span::new(100, 200)));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.abuts(&c));
        assert!(c.abuts(&a));
        assert!(!a.abuts(&b));
    }

    #[test]
    fn span_orders_by_start_then_end() {
        let mut spans = vec![Span::new(200, 300), Span::new(100, 400), Span::new(100, 150)];
        spans.sort();
        assert_eq!(spans, vec![Span::new(100, 150), Span::new(100, 400), Span::new(200, 300)]);
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn windows_stay_sorted() {
        let mut spot = Spot::new(SpotKind::Private, 0.0, 0.0, 5.0);
        let w3 = window(&spot, 300, 400);
        let w1 = window(&spot, 100, 200);
        let w2 = window(&spot, 200, 300);
        spot.insert_window(w3);
        spot.insert_window(w1);
        spot.insert_window(w2);
        let starts: Vec<Ms> = spot.windows.iter().map(|w| w.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn containing_window_requires_full_cover() {
        let mut spot = Spot::new(SpotKind::Private, 0.0, 0.0, 5.0);
        let w = window(&spot, 100, 200);
        let wid = w.id;
        spot.insert_window(w);
        spot.insert_window(window(&spot, 300, 500));

        assert_eq!(spot.containing_window(&Span::new(120, 180)).map(|w| w.id), Some(wid));
        assert_eq!(spot.containing_window(&Span::new(100, 200)).map(|w| w.id), Some(wid));
        assert!(spot.containing_window(&Span::new(150, 350)).is_none());
        assert!(spot.containing_window(&Span::new(250, 280)).is_none());
        assert!(spot.containing_window(&Span::new(450, 501)).is_none());
    }

    #[test]
    fn unavailable_window_cannot_host() {
        let mut spot = Spot::new(SpotKind::Private, 0.0, 0.0, 5.0);
        let mut w = window(&spot, 100, 200);
        w.is_available = false;
        spot.insert_window(w);
        assert!(spot.containing_window(&Span::new(120, 180)).is_none());
        assert_eq!(spot.available_windows().count(), 0);
    }

    #[test]
    fn remove_nonexistent_window_returns_none() {
        let mut spot = Spot::new(SpotKind::Private, 0.0, 0.0, 5.0);
        spot.insert_window(window(&spot, 100, 200));
        assert!(spot.remove_window(&Ulid::new()).is_none());
        assert_eq!(spot.windows.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let spot = Spot::new(SpotKind::Building, 40.4, -3.7, 2.5);
        let event = Event::SpotCreated { spot };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
