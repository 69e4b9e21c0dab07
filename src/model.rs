use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// What an authenticated caller is allowed to act as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Provider,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Provider => "provider",
            Role::Consumer => "consumer",
        };
        f.write_str(s)
    }
}

/// The `(user_id, role)` pair every request is resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: Ulid,
    pub role: Role,
}

impl Identity {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn provider(id: Ulid) -> Self {
        Self::new(id, Role::Provider)
    }

    pub fn consumer(id: Ulid) -> Self {
        Self::new(id, Role::Consumer)
    }
}

/// Occupancy of a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    #[default]
    Available,
    Booked,
}

/// Lifecycle status of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Cancelled,
        BookingStatus::Completed,
    ];

    /// Everything except `cancelled` holds capacity.
    pub fn is_active(self) -> bool {
        self != BookingStatus::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A provider's published unit of availability, half-open `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: SlotStatus,
}

impl Slot {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end_time)
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at.date() == self.date && self.start_time <= at.time() && at.time() < self.end_time
    }

    pub fn is_available(&self) -> bool {
        self.status == SlotStatus::Available
    }

    pub fn same_window(&self, date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> bool {
        self.date == date && self.start_time == start_time && self.end_time == end_time
    }
}

/// One entry of a bulk availability publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCandidate {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub status: SlotStatus,
}

impl SlotCandidate {
    pub fn new(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            date,
            start_time,
            end_time,
            status: SlotStatus::Available,
        }
    }

    pub fn with_status(mut self, status: SlotStatus) -> Self {
        self.status = status;
        self
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }
}

/// A consumer's reservation of one slot's time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub consumer_id: Ulid,
    pub provider_id: Ulid,
    /// The slot claimed at creation. The slot window, not `date_time`, decides conflicts.
    pub slot_id: Ulid,
    pub date_time: NaiveDateTime,
    pub notes: Option<String>,
    pub status: BookingStatus,
}

/// Everything the engine knows about one provider. Guarded by one lock, so every
/// read-check-write sequence over a provider's slots and bookings is exclusive.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider_id: Ulid,
    /// Sorted by `(date, start_time)`.
    pub slots: Vec<Slot>,
    /// Sorted by `date_time`.
    pub bookings: Vec<Booking>,
}

impl ProviderState {
    pub fn new(provider_id: Ulid) -> Self {
        Self {
            provider_id,
            slots: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn insert_slot(&mut self, slot: Slot) {
        let key = (slot.date, slot.start_time);
        let pos = self
            .slots
            .partition_point(|s| (s.date, s.start_time) <= key);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn has_window(&self, date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> bool {
        self.slots
            .iter()
            .any(|s| s.same_window(date, start_time, end_time))
    }

    /// Slots whose window contains `at`, earliest start first.
    /// Slots starting after `at` are skipped by binary search.
    pub fn covering(&self, at: NaiveDateTime) -> impl Iterator<Item = &Slot> {
        let key = (at.date(), at.time());
        let right_bound = self
            .slots
            .partition_point(|s| (s.date, s.start_time) <= key);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.contains(at))
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.date_time <= booking.date_time);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The non-cancelled booking scheduled exactly at `at`, if any.
    pub fn active_booking_at(&self, at: NaiveDateTime) -> Option<&Booking> {
        let start = self.bookings.partition_point(|b| b.date_time < at);
        self.bookings[start..]
            .iter()
            .take_while(|b| b.date_time == at)
            .find(|b| b.status.is_active())
    }

    /// The non-cancelled booking currently holding `slot_id`, if any.
    pub fn active_holder(&self, slot_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.slot_id == slot_id && b.status.is_active())
    }
}

/// The event types. This is the log record format; each committed operation is
/// exactly one event, so a multi-row change is atomic on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsPublished {
        provider_id: Ulid,
        slots: Vec<Slot>,
    },
    SlotClaimed {
        id: Ulid,
        provider_id: Ulid,
    },
    SlotReleased {
        id: Ulid,
        provider_id: Ulid,
    },
    SlotDeleted {
        id: Ulid,
        provider_id: Ulid,
    },
    /// Claims `booking.slot_id` and inserts the booking.
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: BookingStatus,
        release_slot: Option<Ulid>,
        claim_slot: Option<Ulid>,
    },
    /// Snapshot record written by compaction. No slot side effects.
    BookingRestored {
        booking: Booking,
    },
}

impl Event {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::SlotsPublished { provider_id, .. }
            | Event::SlotClaimed { provider_id, .. }
            | Event::SlotReleased { provider_id, .. }
            | Event::SlotDeleted { provider_id, .. }
            | Event::BookingStatusChanged { provider_id, .. } => *provider_id,
            Event::BookingCreated { booking } | Event::BookingRestored { booking } => {
                booking.provider_id
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// One page of an ordered result set. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Cut one page out of an already ordered list. `limit` must be non-zero.
    pub fn from_sorted(items: Vec<T>, page: usize, limit: usize) -> Self {
        let total = items.len();
        // A page too far out to address is simply past the end.
        let offset = page.saturating_sub(1).checked_mul(limit).unwrap_or(usize::MAX);
        let data = items
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        Self {
            data,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAvailability {
    pub provider_id: Ulid,
    pub name: String,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider_id: Ulid,
    pub completed_bookings: usize,
    pub distinct_consumers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn slot(date: &str, start: &str, end: &str) -> Slot {
        Slot {
            id: Ulid::new(),
            provider_id: Ulid::nil(),
            date: d(date),
            start_time: t(start),
            end_time: t(end),
            status: SlotStatus::Available,
        }
    }

    fn booking_at(at: &str, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            consumer_id: Ulid::new(),
            provider_id: Ulid::nil(),
            slot_id: Ulid::new(),
            date_time: dt(at),
            notes: None,
            status,
        }
    }

    #[test]
    fn slot_window_is_half_open() {
        let s = slot("2025-07-13", "10:00", "11:00");
        assert!(s.contains(dt("2025-07-13T10:00:00")));
        assert!(s.contains(dt("2025-07-13T10:59:59")));
        assert!(!s.contains(dt("2025-07-13T11:00:00")));
        assert!(!s.contains(dt("2025-07-14T10:30:00")));
    }

    #[test]
    fn slots_stay_sorted_by_date_then_start() {
        let mut ps = ProviderState::new(Ulid::nil());
        ps.insert_slot(slot("2025-07-14", "09:00", "10:00"));
        ps.insert_slot(slot("2025-07-13", "15:00", "16:00"));
        ps.insert_slot(slot("2025-07-13", "09:00", "10:00"));
        let order: Vec<_> = ps.slots.iter().map(|s| (s.date, s.start_time)).collect();
        assert_eq!(
            order,
            vec![
                (d("2025-07-13"), t("09:00")),
                (d("2025-07-13"), t("15:00")),
                (d("2025-07-14"), t("09:00")),
            ]
        );
    }

    #[test]
    fn covering_finds_overlapping_windows_in_start_order() {
        let mut ps = ProviderState::new(Ulid::nil());
        ps.insert_slot(slot("2025-07-13", "10:30", "11:30"));
        ps.insert_slot(slot("2025-07-13", "10:00", "11:00"));
        ps.insert_slot(slot("2025-07-13", "11:00", "12:00"));

        let hits: Vec<_> = ps.covering(dt("2025-07-13T10:45:00")).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start_time, t("10:00"));
        assert_eq!(hits[1].start_time, t("10:30"));

        assert_eq!(ps.covering(dt("2025-07-13T09:59:00")).count(), 0);
    }

    #[test]
    fn has_window_matches_exact_tuple_only() {
        let mut ps = ProviderState::new(Ulid::nil());
        ps.insert_slot(slot("2025-07-13", "10:00", "11:00"));
        assert!(ps.has_window(d("2025-07-13"), t("10:00"), t("11:00")));
        assert!(!ps.has_window(d("2025-07-13"), t("10:00"), t("11:30")));
    }

    #[test]
    fn active_booking_at_ignores_cancelled() {
        let mut ps = ProviderState::new(Ulid::nil());
        ps.insert_booking(booking_at("2025-07-13T10:30:00", BookingStatus::Cancelled));
        assert!(ps.active_booking_at(dt("2025-07-13T10:30:00")).is_none());

        let live = booking_at("2025-07-13T10:30:00", BookingStatus::Pending);
        let live_id = live.id;
        ps.insert_booking(live);
        ps.insert_booking(booking_at("2025-07-13T09:00:00", BookingStatus::Confirmed));
        assert_eq!(
            ps.active_booking_at(dt("2025-07-13T10:30:00")).map(|b| b.id),
            Some(live_id)
        );
    }

    #[test]
    fn remove_slot_returns_removed() {
        let mut ps = ProviderState::new(Ulid::nil());
        let s = slot("2025-07-13", "10:00", "11:00");
        let id = s.id;
        ps.insert_slot(s);
        assert!(ps.remove_slot(Ulid::new()).is_none());
        assert_eq!(ps.remove_slot(id).map(|s| s.id), Some(id));
        assert!(ps.slots.is_empty());
    }

    #[test]
    fn page_math() {
        let page = Page::from_sorted((1..=25).collect::<Vec<_>>(), 3, 10);
        assert_eq!(page.data, vec![21, 22, 23, 24, 25]);
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);

        let past_end = Page::from_sorted(vec![1, 2], 5, 10);
        assert!(past_end.data.is_empty());
        assert_eq!(past_end.total_pages, 1);

        let empty: Page<u8> = Page::from_sorted(Vec::new(), 1, 10);
        assert_eq!(empty.total_pages, 0);
    }

    #[test]
    fn far_page_is_empty_not_overflow() {
        let page = Page::from_sorted(vec![1, 2, 3], usize::MAX / 2, 100);
        assert!(page.data.is_empty());
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn booking_status_parses_case_insensitively() {
        assert_eq!("Cancelled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("archived".parse::<BookingStatus>().is_err());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(BookingStatus::Completed.is_active());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotsPublished {
            provider_id: Ulid::new(),
            slots: vec![slot("2025-07-13", "10:00", "11:00")],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
