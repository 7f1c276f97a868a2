use ulid::Ulid;

use crate::model::{BookingStatus, RoomStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input, e.g. an interval with start >= end.
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Room is not in a bookable/occupiable state.
    Unavailable { room: Ulid, status: RoomStatus },
    /// Overlaps the named active booking.
    Conflict(Ulid),
    /// Unoccupy attempted by someone other than the current occupant.
    NotOccupant { room: Ulid, occupant: Ulid },
    NotOccupied(Ulid),
    InvalidTransition {
        booking: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to Postgres clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound(_) => "02000",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Unavailable { .. } => "55006",
            EngineError::Conflict(_) => "23P01",
            EngineError::NotOccupant { .. } => "42501",
            EngineError::NotOccupied(_) | EngineError::InvalidTransition { .. } => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotOccupant { .. } => "permission",
            EngineError::NotOccupied(_) | EngineError::InvalidTransition { .. } => "state",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Unavailable { room, status } => {
                write!(f, "room {room} is not available (status: {status})")
            }
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::NotOccupant { room, occupant } => {
                write!(f, "{occupant} is not occupying room {room}")
            }
            EngineError::NotOccupied(room) => write!(f, "room {room} is not occupied"),
            EngineError::InvalidTransition { booking, from, to } => {
                write!(f, "booking {booking} cannot move from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
