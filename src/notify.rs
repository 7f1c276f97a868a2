use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::MAX_NOTICES_PER_USER;
use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: live subscribers receive every committed event for a room.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a room's channel; subscribers see the stream close.
    pub fn remove(&self, room_id: &Ulid) {
        self.channels.remove(room_id);
    }
}

/// Per-user notices and notification preferences.
///
/// Committed room events are turned into notices by `fan_out`. Notices are
/// volatile; preferences are persisted through `Event::PreferencesUpdated`.
pub struct Inbox {
    notices: DashMap<Ulid, VecDeque<Notice>>,
    prefs: DashMap<Ulid, NotificationPrefs>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            notices: DashMap::new(),
            prefs: DashMap::new(),
        }
    }

    pub fn prefs(&self, user_id: &Ulid) -> NotificationPrefs {
        self.prefs.get(user_id).map(|p| *p.value()).unwrap_or_default()
    }

    pub(crate) fn set_prefs(&self, user_id: Ulid, prefs: NotificationPrefs) {
        self.prefs.insert(user_id, prefs);
    }

    /// Users whose preferences differ from the defaults.
    pub(crate) fn stored_prefs(&self) -> Vec<(Ulid, NotificationPrefs)> {
        self.prefs
            .iter()
            .filter(|e| *e.value() != NotificationPrefs::default())
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    /// Notices for a user, newest first.
    pub fn notices(&self, user_id: &Ulid) -> Vec<Notice> {
        self.notices
            .get(user_id)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark every unseen notice as seen. Returns how many changed.
    pub fn mark_all_seen(&self, user_id: &Ulid) -> usize {
        let Some(mut queue) = self.notices.get_mut(user_id) else {
            return 0;
        };
        let mut changed = 0;
        for notice in queue.iter_mut().filter(|n| !n.seen) {
            notice.seen = true;
            changed += 1;
        }
        changed
    }

    /// Fan-out rules, applied after an event is committed to `room`.
    pub fn fan_out(&self, room: &RoomState, event: &Event, now: Ms) {
        match event {
            Event::BookingReserved {
                id,
                requester_id,
                patient_id,
                span,
                ..
            } => {
                let msg = format!(
                    "Room {} booked for [{}, {}) (booking {id})",
                    room.name, span.start, span.end
                );
                self.deliver(*requester_id, room.id, NoticeKind::Appointment, Priority::Medium, &msg, now);
                if let Some(patient) = patient_id {
                    self.deliver(*patient, room.id, NoticeKind::Appointment, Priority::Low, &msg, now);
                }
            }
            Event::BookingStatusChanged {
                id,
                status: BookingStatus::Cancelled,
                ..
            } => {
                let Some(booking) = room.booking(id) else { return };
                let msg = format!(
                    "Booking {id} for room {} at [{}, {}) was cancelled",
                    room.name, booking.span.start, booking.span.end
                );
                self.deliver(booking.requester_id, room.id, NoticeKind::Appointment, Priority::Medium, &msg, now);
                if let Some(patient) = booking.patient_id {
                    self.deliver(patient, room.id, NoticeKind::Appointment, Priority::Medium, &msg, now);
                }
            }
            Event::ServiceChanged {
                service: Some(service),
                ..
            } => {
                let msg = format!(
                    "Room {} is now under {}; check your upcoming bookings",
                    room.name,
                    service.as_status()
                );
                for requester in room.active_requesters() {
                    self.deliver(requester, room.id, NoticeKind::RoomUpdate, Priority::High, &msg, now);
                }
            }
            Event::RoomOccupied { occupant_id, .. } => {
                let msg = format!("You are now occupying room {}", room.name);
                self.deliver(*occupant_id, room.id, NoticeKind::RoomUpdate, Priority::Low, &msg, now);
            }
            Event::RoomVacated { occupant_id, .. } => {
                let msg = format!("You have left room {}", room.name);
                self.deliver(*occupant_id, room.id, NoticeKind::RoomUpdate, Priority::Low, &msg, now);
            }
            _ => {}
        }
    }

    fn deliver(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        kind: NoticeKind,
        priority: Priority,
        message: &str,
        now: Ms,
    ) {
        if kind == NoticeKind::RoomUpdate && !self.prefs(&user_id).room_updates {
            tracing::debug!("room update for {user_id} suppressed by preferences");
            return;
        }
        let mut queue = self.notices.entry(user_id).or_default();
        if queue.len() >= MAX_NOTICES_PER_USER {
            queue.pop_front();
        }
        queue.push_back(Notice {
            id: Ulid::new(),
            user_id,
            room_id,
            kind,
            priority,
            message: message.to_string(),
            seen: false,
            created_at: now,
        });
        metrics::counter!(crate::observability::NOTICES_DELIVERED_TOTAL, "kind" => kind.as_str())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with_booking(requester: Ulid, patient: Option<Ulid>) -> (RoomState, Ulid) {
        let mut rs = RoomState::new(Ulid::new(), "OR 2".into(), RoomType::Surgery, 3, 1, None, 0);
        let booking_id = Ulid::new();
        rs.insert_booking(Booking {
            id: booking_id,
            room_id: rs.id,
            requester_id: requester,
            patient_id: patient,
            span: Span::new(1000, 2000),
            purpose: None,
            status: BookingStatus::Scheduled,
            created_at: 0,
        });
        (rs, booking_id)
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::ServiceChanged { id: rid, service: None };
        hub.send(rid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &Event::RoomDeleted { id: rid });
    }

    #[tokio::test]
    async fn remove_closes_channel() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.remove(&rid);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn reservation_notifies_requester_and_patient() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        let patient = Ulid::new();
        let (rs, booking_id) = room_with_booking(doctor, Some(patient));
        let event = Event::BookingReserved {
            id: booking_id,
            room_id: rs.id,
            requester_id: doctor,
            patient_id: Some(patient),
            span: Span::new(1000, 2000),
            purpose: None,
            created_at: 0,
        };
        inbox.fan_out(&rs, &event, 10);

        let doc = inbox.notices(&doctor);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc[0].kind, NoticeKind::Appointment);
        assert_eq!(doc[0].priority, Priority::Medium);
        assert!(doc[0].message.contains("OR 2"));

        let pat = inbox.notices(&patient);
        assert_eq!(pat.len(), 1);
        assert_eq!(pat[0].priority, Priority::Low);
    }

    #[test]
    fn maintenance_alerts_active_requesters() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        let (rs, _) = room_with_booking(doctor, None);
        let event = Event::ServiceChanged {
            id: rs.id,
            service: Some(ServiceState::Maintenance),
        };
        inbox.fan_out(&rs, &event, 10);

        let doc = inbox.notices(&doctor);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc[0].priority, Priority::High);
        assert!(doc[0].message.contains("maintenance"));
    }

    #[test]
    fn room_updates_respect_preferences() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        inbox.set_prefs(
            doctor,
            NotificationPrefs {
                room_updates: false,
                ..Default::default()
            },
        );
        let rs = RoomState::new(Ulid::new(), "Lab A".into(), RoomType::Lab, 0, 1, None, 0);
        inbox.fan_out(&rs, &Event::RoomOccupied { id: rs.id, occupant_id: doctor }, 1);
        assert!(inbox.notices(&doctor).is_empty());
    }

    #[test]
    fn appointment_notices_ignore_room_update_preference() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        inbox.set_prefs(
            doctor,
            NotificationPrefs {
                room_updates: false,
                ..Default::default()
            },
        );
        let (mut rs, booking_id) = room_with_booking(doctor, None);
        rs.booking_mut(&booking_id).unwrap().status = BookingStatus::Cancelled;
        let event = Event::BookingStatusChanged {
            id: booking_id,
            room_id: rs.id,
            status: BookingStatus::Cancelled,
        };
        inbox.fan_out(&rs, &event, 1);
        assert_eq!(inbox.notices(&doctor).len(), 1);
    }

    #[test]
    fn mark_all_seen_and_ordering() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        let rs = RoomState::new(Ulid::new(), "Consult 4".into(), RoomType::Consultation, 1, 1, None, 0);
        inbox.fan_out(&rs, &Event::RoomOccupied { id: rs.id, occupant_id: doctor }, 1);
        inbox.fan_out(&rs, &Event::RoomVacated { id: rs.id, occupant_id: doctor }, 2);

        let notices = inbox.notices(&doctor);
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].created_at, 2); // newest first
        assert_eq!(inbox.mark_all_seen(&doctor), 2);
        assert_eq!(inbox.mark_all_seen(&doctor), 0);
        assert!(inbox.notices(&doctor).iter().all(|n| n.seen));
    }

    #[test]
    fn inbox_is_bounded() {
        let inbox = Inbox::new();
        let doctor = Ulid::new();
        let rs = RoomState::new(Ulid::new(), "ER 1".into(), RoomType::Emergency, 0, 1, None, 0);
        for t in 0..(MAX_NOTICES_PER_USER as Ms + 5) {
            inbox.fan_out(&rs, &Event::RoomOccupied { id: rs.id, occupant_id: doctor }, t);
        }
        let notices = inbox.notices(&doctor);
        assert_eq!(notices.len(), MAX_NOTICES_PER_USER);
        assert_eq!(notices.last().unwrap().created_at, 5); // oldest five dropped
    }
}
