use std::str::FromStr;

use crate::model::*;

use super::EngineError;

/// How the room status gates new bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservePolicy {
    /// Reserved rooms still accept bookings; the overlap test decides.
    #[default]
    Interval,
    /// Only `available` rooms accept bookings: one reservation per room at a time.
    Exclusive,
}

impl FromStr for ReservePolicy {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interval" => Ok(ReservePolicy::Interval),
            "exclusive" => Ok(ReservePolicy::Exclusive),
            _ => Err(UnknownLabel { kind: "reserve policy", value: s.to_string() }),
        }
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a span from untrusted bounds and check it against the limits.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::try_new(start, end).ok_or(EngineError::Validation("start must be before end"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Status gate applied before the overlap scan.
pub(crate) fn check_bookable(rs: &RoomState, policy: ReservePolicy) -> Result<(), EngineError> {
    let admitted = match policy {
        ReservePolicy::Interval => matches!(rs.status, RoomStatus::Available | RoomStatus::Reserved),
        ReservePolicy::Exclusive => rs.status == RoomStatus::Available,
    };
    if admitted {
        Ok(())
    } else {
        Err(EngineError::Unavailable { room: rs.id, status: rs.status })
    }
}

/// Strict half-open overlap test against scheduled and in-progress bookings.
pub(crate) fn check_no_conflict(rs: &RoomState, span: &Span) -> Result<(), EngineError> {
    match rs.first_conflict(span) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
