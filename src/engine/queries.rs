use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Rooms matching `filter`, ordered by floor then name.
    pub async fn list_rooms(&self, filter: &RoomFilter) -> Vec<RoomInfo> {
        let mut out = Vec::new();
        for rs in self.room_handles() {
            let info = rs.read().await.info();
            if filter.matches(&info) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.floor.cmp(&b.floor).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub async fn get_room_info(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let info = rs.read().await.info();
        Ok(info)
    }

    /// Bookings matching `filter`, ordered by start time.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let rooms = match filter.room_id {
            Some(id) => self.get_room(&id).into_iter().collect(),
            None => self.room_handles(),
        };
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.get_room_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Free windows of a room inside `[start, end)`, optionally dropping
    /// windows shorter than `min_duration_ms`.
    pub async fn compute_free_windows(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = Span::try_new(start, end).ok_or(EngineError::Validation("start must be before end"))?;
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        if min_duration_ms.is_some_and(|d| d < 0) {
            return Err(EngineError::Validation("min_duration must not be negative"));
        }
        if query.start < MIN_VALID_TIMESTAMP_MS || query.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let mut free = free_windows(&guard, &query);
        if let Some(min) = min_duration_ms {
            free.retain(|s| s.duration_ms() >= min);
        }
        Ok(free)
    }
}
