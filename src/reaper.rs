use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep: complete every in-progress booking whose interval has ended.
/// Returns how many bookings were completed.
pub async fn sweep_finished_bookings(engine: &Engine, now: Ms) -> usize {
    let mut completed = 0;
    for booking_id in engine.collect_finished_bookings(now) {
        match engine.complete_booking(booking_id).await {
            Ok(_) => {
                completed += 1;
                info!("auto-completed booking {booking_id}");
            }
            // Completed or deleted by a client in the meantime.
            Err(e) => tracing::debug!("sweeper skip {booking_id}: {e}"),
        }
    }
    if completed > 0 {
        metrics::counter!(crate::observability::BOOKINGS_SWEPT_TOTAL).increment(completed as u64);
    }
    completed
}

/// Background task that periodically auto-completes finished bookings.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0);
        sweep_finished_bookings(&engine, now).await;
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReservePolicy;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const DAY0: Ms = 1_767_225_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_completes_finished_bookings() {
        let path = test_wal_path("sweep.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), ReservePolicy::default()).unwrap();

        let room = Ulid::new();
        engine
            .create_room(room, "Consult 1".into(), RoomType::Consultation, 1, 1, None)
            .await
            .unwrap();
        let booking = engine
            .validate_and_reserve(NewBooking {
                id: Ulid::new(),
                room_id: room,
                requester_id: Ulid::new(),
                patient_id: None,
                start: DAY0,
                end: DAY0 + H,
                purpose: None,
            })
            .await
            .unwrap();

        // Scheduled bookings are left alone even when past.
        assert_eq!(sweep_finished_bookings(&engine, DAY0 + 2 * H).await, 0);

        engine.start_booking(booking.id).await.unwrap();
        assert_eq!(sweep_finished_bookings(&engine, DAY0 + H / 2).await, 0);
        assert_eq!(sweep_finished_bookings(&engine, DAY0 + H).await, 1);

        let info = engine.get_room_info(room).await.unwrap();
        assert_eq!(info.status, RoomStatus::Available);
        assert_eq!(
            engine.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Completed
        );
        assert_eq!(sweep_finished_bookings(&engine, DAY0 + 2 * H).await, 0);
    }
}
