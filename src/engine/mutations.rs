use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_bookable, check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("room name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(())
}

fn check_description(description: Option<&str>) -> Result<(), EngineError> {
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

/// Map a requested status onto the externally settable service state.
fn service_for_status(room: Ulid, status: RoomStatus) -> Result<Option<ServiceState>, EngineError> {
    match status {
        RoomStatus::Available => Ok(None),
        RoomStatus::Maintenance => Ok(Some(ServiceState::Maintenance)),
        RoomStatus::Cleaning => Ok(Some(ServiceState::Cleaning)),
        RoomStatus::Occupied | RoomStatus::Reserved => {
            tracing::debug!("refusing to set derived status {status} on room {room}");
            Err(EngineError::Validation(
                "occupied and reserved are derived from occupancy and bookings",
            ))
        }
    }
}

impl Engine {
    /// Get a room and take its write lock. Fails if the room was deleted, or
    /// its creation rolled back, while we waited for the lock.
    async fn lock_room(&self, room_id: Ulid) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.clone().write_owned().await;
        if !self.is_live(&room_id, &rs) {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(guard)
    }

    pub async fn create_room(
        &self,
        id: Ulid,
        name: String,
        room_type: RoomType,
        floor: i32,
        capacity: u32,
        description: Option<String>,
    ) -> Result<RoomInfo, EngineError> {
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        check_name(&name)?;
        check_description(description.as_deref())?;
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _catalog = self.catalog_lock.read().await;
        let created_at = now_ms();
        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            room_type,
            floor,
            capacity,
            description: description.clone(),
            created_at,
        };
        let rs = RoomState::new(id, name, room_type, floor, capacity, description, created_at);
        let info = rs.info();
        let shared = Arc::new(RwLock::new(rs));

        // Claim the id before the append; the room stays write-locked until
        // the create is durable.
        let pending = shared.clone().write_owned().await;
        match self.rooms.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.rooms.remove(&id);
            return Err(e);
        }
        drop(pending);
        self.notify.send(id, &event);
        tracing::info!("created room {id} ({})", info.name);
        Ok(info)
    }

    /// Update metadata and/or the service state. A `status` of maintenance or
    /// cleaning takes the room out of service; `available` puts it back.
    pub async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<RoomInfo, EngineError> {
        if let Some(name) = &patch.name {
            check_name(name)?;
        }
        if let Some(description) = &patch.description {
            check_description(description.as_deref())?;
        }
        if patch.capacity == Some(0) {
            return Err(EngineError::Validation("capacity must be at least 1"));
        }
        let service = patch.status.map(|s| service_for_status(id, s)).transpose()?;

        let mut guard = self.lock_room(id).await?;

        if patch.touches_metadata() {
            let event = Event::RoomUpdated {
                id,
                name: patch.name.unwrap_or_else(|| guard.name.clone()),
                room_type: patch.room_type.unwrap_or(guard.room_type),
                floor: patch.floor.unwrap_or(guard.floor),
                capacity: patch.capacity.unwrap_or(guard.capacity),
                description: patch.description.unwrap_or_else(|| guard.description.clone()),
            };
            self.persist_and_apply(id, &mut guard, &event).await?;
        }
        if let Some(service) = service
            && service != guard.service
        {
            let event = Event::ServiceChanged { id, service };
            self.persist_and_apply(id, &mut guard, &event).await?;
            tracing::info!("room {id} service state now {}", guard.status);
        }
        Ok(guard.info())
    }

    pub async fn set_service(&self, id: Ulid, service: Option<ServiceState>) -> Result<RoomInfo, EngineError> {
        let status = service.map_or(RoomStatus::Available, |s| s.as_status());
        self.update_room(
            id,
            RoomPatch {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a room together with its bookings.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.read().await;
        let guard = self.lock_room(id).await?;
        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_to_room.remove(&b.id);
        }
        self.rooms.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!("deleted room {id} with {} bookings", guard.bookings.len());
        Ok(())
    }

    /// Admit a booking if the room is bookable and no active booking overlaps
    /// `[start, end)`. Gate, scan, persist and status refresh happen under the
    /// room's write lock.
    pub async fn validate_and_reserve(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let span = validate_span(req.start, req.end)?;
        if req.purpose.as_ref().is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }
        if self.booking_to_room.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let mut guard = self.lock_room(req.room_id).await?;
        // History does not count against the limit.
        let active = guard.bookings.iter().filter(|b| !b.status.is_terminal()).count();
        if active >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many active bookings on room"));
        }

        check_bookable(&guard, self.policy)?;
        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!("booking {} on room {} rejected: {e}", req.id, req.room_id);
            return Err(e);
        }

        // Booking ids are unique across rooms: claim it before the append.
        match self.booking_to_room.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(req.room_id);
            }
        }

        let event = Event::BookingReserved {
            id: req.id,
            room_id: req.room_id,
            requester_id: req.requester_id,
            patient_id: req.patient_id,
            span,
            purpose: req.purpose,
            created_at: now_ms(),
        };
        if let Err(e) = self.persist_and_apply(req.room_id, &mut guard, &event).await {
            self.booking_to_room.remove(&req.id);
            return Err(e);
        }
        guard
            .booking(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    pub async fn occupy(&self, room_id: Ulid, occupant_id: Ulid) -> Result<RoomInfo, EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        if guard.status != RoomStatus::Available {
            return Err(EngineError::Unavailable {
                room: room_id,
                status: guard.status,
            });
        }
        let event = Event::RoomOccupied { id: room_id, occupant_id };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn unoccupy(&self, room_id: Ulid, occupant_id: Ulid) -> Result<RoomInfo, EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        if guard.status != RoomStatus::Occupied {
            return Err(EngineError::NotOccupied(room_id));
        }
        if guard.occupant != Some(occupant_id) {
            return Err(EngineError::NotOccupant {
                room: room_id,
                occupant: occupant_id,
            });
        }
        let event = Event::RoomVacated { id: room_id, occupant_id };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Move a booking along its lifecycle; the room status is re-derived.
    pub async fn transition_booking(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let from = guard.booking(&id).ok_or(EngineError::NotFound(id))?.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { booking: id, from, to });
        }
        let event = Event::BookingStatusChanged { id, room_id, status: to };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn start_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::InProgress).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }

    pub async fn update_preferences(
        &self,
        user_id: Ulid,
        patch: PrefsPatch,
    ) -> Result<NotificationPrefs, EngineError> {
        let _serial = self.prefs_lock.lock().await;
        let current = self.inbox.prefs(&user_id);
        if patch.is_empty() {
            return Ok(current);
        }
        let prefs = patch.apply(&current);
        let event = Event::PreferencesUpdated { user_id, prefs };
        self.wal_append(&event).await?;
        self.inbox.set_prefs(user_id, prefs);
        Ok(prefs)
    }

    pub async fn reset_preferences(&self, user_id: Ulid) -> Result<NotificationPrefs, EngineError> {
        let _serial = self.prefs_lock.lock().await;
        let prefs = NotificationPrefs::default();
        let event = Event::PreferencesUpdated { user_id, prefs };
        self.wal_append(&event).await?;
        self.inbox.set_prefs(user_id, prefs);
        Ok(prefs)
    }

    /// In-progress bookings whose interval has ended by `now`.
    /// Contended rooms are skipped; the next sweep picks them up.
    pub fn collect_finished_bookings(&self, now: Ms) -> Vec<Ulid> {
        let mut finished = Vec::new();
        for entry in self.rooms.iter() {
            if let Ok(guard) = entry.value().try_read() {
                finished.extend(
                    guard
                        .bookings
                        .iter()
                        .filter(|b| b.status == BookingStatus::InProgress && b.span.end <= now)
                        .map(|b| b.id),
                );
            }
        }
        finished
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// The room set, every room and the preferences stay locked until the
    /// writer has swapped the file, so no append can land between the
    /// snapshot and the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(rooms.len());
        for rs in rooms {
            guards.push(rs.read_owned().await);
        }
        let _prefs = self.prefs_lock.lock().await;

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
                room_type: guard.room_type,
                floor: guard.floor,
                capacity: guard.capacity,
                description: guard.description.clone(),
                created_at: guard.created_at,
            });
            if guard.service.is_some() {
                events.push(Event::ServiceChanged {
                    id: guard.id,
                    service: guard.service,
                });
            }
            if let Some(occupant_id) = guard.occupant {
                events.push(Event::RoomOccupied {
                    id: guard.id,
                    occupant_id,
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingReserved {
                    id: b.id,
                    room_id: b.room_id,
                    requester_id: b.requester_id,
                    patient_id: b.patient_id,
                    span: b.span,
                    purpose: b.purpose.clone(),
                    created_at: b.created_at,
                });
                if b.status != BookingStatus::Scheduled {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        room_id: b.room_id,
                        status: b.status,
                    });
                }
            }
        }
        for (user_id, prefs) in self.inbox.stored_prefs() {
            events.push(Event::PreferencesUpdated { user_id, prefs });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
