mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use conflict::ReservePolicy;
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Inbox, NotifyHub};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer for {} stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The Interval Booking Validator for one tenant.
///
/// Every room sits behind its own `RwLock`. Mutations hold the room's write
/// lock across validation, WAL append, apply and status refresh, so two
/// requests for the same room are serialized and cannot both pass the
/// overlap check.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub inbox: Inbox,
    pub(super) policy: ReservePolicy,
    /// Reverse lookup: booking id → room id
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Serializes read-modify-write of notification preferences.
    pub(super) prefs_lock: Mutex<()>,
    /// Room creation and deletion hold this shared; compaction holds it
    /// exclusively so the room set cannot change under a snapshot.
    pub(super) catalog_lock: RwLock<()>,
}

/// Apply a room-level event (caller holds the lock), then re-derive the status.
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated {
            name,
            room_type,
            floor,
            capacity,
            description,
            ..
        } => {
            rs.name = name.clone();
            rs.room_type = *room_type;
            rs.floor = *floor;
            rs.capacity = *capacity;
            rs.description = description.clone();
        }
        Event::ServiceChanged { service, .. } => rs.service = *service,
        Event::RoomOccupied { occupant_id, .. } => rs.occupant = Some(*occupant_id),
        Event::RoomVacated { .. } => rs.occupant = None,
        Event::BookingReserved {
            id,
            room_id,
            requester_id,
            patient_id,
            span,
            purpose,
            created_at,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                room_id: *room_id,
                requester_id: *requester_id,
                patient_id: *patient_id,
                span: *span,
                purpose: purpose.clone(),
                status: BookingStatus::Scheduled,
                created_at: *created_at,
            });
            booking_map.insert(*id, *room_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = rs.booking_mut(id) {
                booking.status = *status;
            }
        }
        // Handled at the engine level
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } | Event::PreferencesUpdated { .. } => {}
    }
    rs.refresh_status();
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: ReservePolicy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_room = DashMap::new();
        let inbox = Inbox::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();

        for event in &events {
            match event {
                Event::RoomCreated {
                    id,
                    name,
                    room_type,
                    floor,
                    capacity,
                    description,
                    created_at,
                } => {
                    let rs = RoomState::new(
                        *id,
                        name.clone(),
                        *room_type,
                        *floor,
                        *capacity,
                        description.clone(),
                        *created_at,
                    );
                    rooms.insert(*id, rs);
                }
                Event::RoomDeleted { id } => {
                    if let Some(rs) = rooms.remove(id) {
                        for b in &rs.bookings {
                            booking_to_room.remove(&b.id);
                        }
                    }
                }
                Event::PreferencesUpdated { user_id, prefs } => inbox.set_prefs(*user_id, *prefs),
                other => {
                    if let Some(rs) = other.room_id().and_then(|rid| rooms.get_mut(&rid)) {
                        apply_to_room(rs, other, &booking_to_room);
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} events from {} ({} rooms)",
            events.len(),
            wal_path.display(),
            rooms.len()
        );

        let rooms = rooms
            .into_iter()
            .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
            .collect();

        Ok(Self {
            rooms,
            wal_tx,
            notify,
            inbox,
            policy,
            booking_to_room,
            prefs_lock: Mutex::new(()),
            catalog_lock: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn policy(&self) -> ReservePolicy {
        self.policy
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL append, apply, status refresh, then post-commit emission
    /// (room subscribers and inbox fan-out). Caller holds the write lock.
    pub(super) async fn persist_and_apply(
        &self,
        room_id: Ulid,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let before = rs.status;
        apply_to_room(rs, event, &self.booking_to_room);
        if before != rs.status {
            tracing::debug!("room {room_id}: {before} -> {}", rs.status);
        }
        self.notify.send(room_id, event);
        self.inbox.fan_out(rs, event, conflict::now_ms());
        Ok(())
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .get_room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.clone().write_owned().await;
        if guard.booking(booking_id).is_none() || !self.is_live(&room_id, &rs) {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok((room_id, guard))
    }

    /// Whether `rs` is still the state registered for `room_id`.
    pub(super) fn is_live(&self, room_id: &Ulid, rs: &SharedRoomState) -> bool {
        self.rooms.get(room_id).is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }
}
