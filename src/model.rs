use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Error for enum columns that receive an unknown label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownLabel {}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using
/// the snake_case labels that appear on the wire.
macro_rules! labelled_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($label => Ok($ty::$variant),)+
                    _ => Err(UnknownLabel { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

/// Projected room status. Never stored independently: see `RoomState::derive_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Available,
    Occupied,
    Maintenance,
    Cleaning,
    Reserved,
}

labelled_enum!(RoomStatus, "room status", {
    Available => "available",
    Occupied => "occupied",
    Maintenance => "maintenance",
    Cleaning => "cleaning",
    Reserved => "reserved",
});

/// Externally set states that take a room out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Maintenance,
    Cleaning,
}

impl ServiceState {
    pub fn as_status(&self) -> RoomStatus {
        match self {
            ServiceState::Maintenance => RoomStatus::Maintenance,
            ServiceState::Cleaning => RoomStatus::Cleaning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Lab,
    Patient,
    Surgery,
    Icu,
    Emergency,
    Consultation,
}

labelled_enum!(RoomType, "room type", {
    Lab => "lab",
    Patient => "patient",
    Surgery => "surgery",
    Icu => "icu",
    Emergency => "emergency",
    Consultation => "consultation",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

labelled_enum!(BookingStatus, "booking status", {
    Scheduled => "scheduled",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl BookingStatus {
    /// Active bookings hold their interval; only they take part in conflict checks.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Scheduled | BookingStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// scheduled → in_progress → completed, or scheduled → cancelled.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Scheduled, BookingStatus::InProgress)
                | (BookingStatus::InProgress, BookingStatus::Completed)
                | (BookingStatus::Scheduled, BookingStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    /// Optional secondary party (the patient).
    pub patient_id: Option<Ulid>,
    pub span: Span,
    pub purpose: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    pub room_type: RoomType,
    pub floor: i32,
    /// Informational head count; bookings are still exclusive.
    pub capacity: u32,
    pub description: Option<String>,
    pub service: Option<ServiceState>,
    pub occupant: Option<Ulid>,
    /// Cached projection of `service`, `occupant` and `bookings`.
    pub status: RoomStatus,
    /// All bookings (active and terminal), sorted by `span.start`.
    pub bookings: Vec<Booking>,
    pub created_at: Ms,
}

impl RoomState {
    pub fn new(
        id: Ulid,
        name: String,
        room_type: RoomType,
        floor: i32,
        capacity: u32,
        description: Option<String>,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            name,
            room_type,
            floor,
            capacity,
            description,
            service: None,
            occupant: None,
            status: RoomStatus::Available,
            bookings: Vec::new(),
            created_at,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// First active booking overlapping `span`, if any.
    pub fn first_conflict(&self, span: &Span) -> Option<&Booking> {
        self.overlapping(span).find(|b| b.status.is_active())
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| b.status.is_active())
    }

    pub fn active_requesters(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.requester_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Service state wins, then occupancy, then active bookings.
    pub fn derive_status(&self) -> RoomStatus {
        if let Some(service) = self.service {
            service.as_status()
        } else if self.occupant.is_some() {
            RoomStatus::Occupied
        } else if self.has_active_bookings() {
            RoomStatus::Reserved
        } else {
            RoomStatus::Available
        }
    }

    pub fn refresh_status(&mut self) {
        self.status = self.derive_status();
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            room_type: self.room_type,
            floor: self.floor,
            capacity: self.capacity,
            description: self.description.clone(),
            status: self.status,
            occupant_id: self.occupant,
            created_at: self.created_at,
        }
    }
}

/// Per-user notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub email_notifications: bool,
    pub push_notifications: bool,
    pub room_updates: bool,
    pub system_updates: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            email_notifications: true,
            push_notifications: true,
            room_updates: true,
            system_updates: false,
        }
    }
}

/// Partial update of `NotificationPrefs`; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefsPatch {
    pub email_notifications: Option<bool>,
    pub push_notifications: Option<bool>,
    pub room_updates: Option<bool>,
    pub system_updates: Option<bool>,
}

impl PrefsPatch {
    pub fn is_empty(&self) -> bool {
        *self == PrefsPatch::default()
    }

    pub fn apply(&self, prefs: &NotificationPrefs) -> NotificationPrefs {
        NotificationPrefs {
            email_notifications: self.email_notifications.unwrap_or(prefs.email_notifications),
            push_notifications: self.push_notifications.unwrap_or(prefs.push_notifications),
            room_updates: self.room_updates.unwrap_or(prefs.room_updates),
            system_updates: self.system_updates.unwrap_or(prefs.system_updates),
        }
    }
}

/// The event types. Flat, no nesting. This is the WAL record format and
/// the payload broadcast to room subscribers after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
        room_type: RoomType,
        floor: i32,
        capacity: u32,
        description: Option<String>,
        created_at: Ms,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        room_type: RoomType,
        floor: i32,
        capacity: u32,
        description: Option<String>,
    },
    RoomDeleted {
        id: Ulid,
    },
    ServiceChanged {
        id: Ulid,
        service: Option<ServiceState>,
    },
    RoomOccupied {
        id: Ulid,
        occupant_id: Ulid,
    },
    RoomVacated {
        id: Ulid,
        occupant_id: Ulid,
    },
    BookingReserved {
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        patient_id: Option<Ulid>,
        span: Span,
        purpose: Option<String>,
        created_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
    },
    PreferencesUpdated {
        user_id: Ulid,
        prefs: NotificationPrefs,
    },
}

impl Event {
    /// The room an event belongs to. `None` for user-level events.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomCreated { id, .. }
            | Event::RoomUpdated { id, .. }
            | Event::RoomDeleted { id }
            | Event::ServiceChanged { id, .. }
            | Event::RoomOccupied { id, .. }
            | Event::RoomVacated { id, .. } => Some(*id),
            Event::BookingReserved { room_id, .. }
            | Event::BookingStatusChanged { room_id, .. } => Some(*room_id),
            Event::PreferencesUpdated { .. } => None,
        }
    }
}

// ── Command inputs ───────────────────────────────────────────────

/// A booking request as received at the boundary; bounds are unchecked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub patient_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub purpose: Option<String>,
}

/// Partial room update. `description: Some(None)` clears the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub room_type: Option<RoomType>,
    pub floor: Option<i32>,
    pub capacity: Option<u32>,
    pub description: Option<Option<String>>,
    pub status: Option<RoomStatus>,
}

impl RoomPatch {
    pub fn touches_metadata(&self) -> bool {
        self.name.is_some()
            || self.room_type.is_some()
            || self.floor.is_some()
            || self.capacity.is_some()
            || self.description.is_some()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub room_type: RoomType,
    pub floor: i32,
    pub capacity: u32,
    pub description: Option<String>,
    pub status: RoomStatus,
    pub occupant_id: Option<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub room_type: Option<RoomType>,
    pub status: Option<RoomStatus>,
    pub floor: Option<i32>,
    /// Case-insensitive substring of name or description.
    pub search: Option<String>,
}

impl RoomFilter {
    pub fn matches(&self, room: &RoomInfo) -> bool {
        if self.room_type.is_some_and(|t| t != room.room_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != room.status) {
            return false;
        }
        if self.floor.is_some_and(|f| f != room.floor) {
            return false;
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            let in_name = room.name.to_lowercase().contains(&needle);
            let in_desc = room
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
            if !in_name && !in_desc {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Ulid>,
    /// Keep bookings with `start >= start_from`.
    pub start_from: Option<Ms>,
    /// Keep bookings with `end <= end_until`.
    pub end_until: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub requester_id: Option<Ulid>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.room_id.is_none_or(|r| r == booking.room_id)
            && self.start_from.is_none_or(|s| booking.span.start >= s)
            && self.end_until.is_none_or(|e| booking.span.end <= e)
            && self.status.is_none_or(|s| s == booking.status)
            && self.requester_id.is_none_or(|r| r == booking.requester_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Appointment,
    RoomUpdate,
}

labelled_enum!(NoticeKind, "notice kind", {
    Appointment => "appointment",
    RoomUpdate => "room_update",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

labelled_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub kind: NoticeKind,
    pub priority: Priority,
    pub message: String,
    pub seen: bool,
    pub created_at: Ms,
}
