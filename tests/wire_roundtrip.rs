use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roomd::tenant::{TenantManager, TenantSettings};
use roomd::wire;

const DAY0: i64 = 1_767_225_600_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "roomd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("roomd")
        .password("roomd");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_room(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, room_type, floor, capacity) VALUES ('{rid}', '{name}', 'surgery', 2, 4)"
        ))
        .await
        .unwrap();
    rid
}

fn book_sql(room: Ulid, requester: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO bookings (id, room_id, requester_id, start, "end") VALUES ('{}', '{room}', '{requester}', {start}, {end})"#,
        Ulid::new()
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_select_room() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let rid = create_room(&client, "OR 1").await;
    let found = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{rid}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some("OR 1"));
    assert_eq!(found[0].get("room_type"), Some("surgery"));
    assert_eq!(found[0].get("floor"), Some("2"));
    assert_eq!(found[0].get("status"), Some("available"));
    assert_eq!(found[0].get("occupant_id"), None);

    let on_floor = rows(&client, "SELECT * FROM rooms WHERE floor = 2").await;
    assert_eq!(on_floor.len(), 1);
    assert!(rows(&client, "SELECT * FROM rooms WHERE floor = 3").await.is_empty());
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "OR 2").await;
    let requester = Ulid::new();

    client.batch_execute(&book_sql(rid, requester, DAY0 + 9 * H, DAY0 + 10 * H)).await.unwrap();

    let err = client
        .batch_execute(&book_sql(rid, Ulid::new(), DAY0 + 9 * H + H / 2, DAY0 + 11 * H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    // Touching intervals are fine.
    client.batch_execute(&book_sql(rid, Ulid::new(), DAY0 + 10 * H, DAY0 + 11 * H)).await.unwrap();

    let room = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{rid}'")).await;
    assert_eq!(room[0].get("status"), Some("reserved"));

    let booked = rows(&client, &format!("SELECT * FROM bookings WHERE room_id = '{rid}'")).await;
    assert_eq!(booked.len(), 2);
    assert_eq!(booked[0].get("status"), Some("scheduled"));
}

#[tokio::test]
async fn invalid_interval_and_unknown_room() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "Lab").await;

    let err = client.batch_execute(&book_sql(rid, Ulid::new(), DAY0 + H, DAY0)).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .batch_execute(&book_sql(Ulid::new(), Ulid::new(), DAY0, DAY0 + H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));

    let err = client.batch_execute("SELECT * FROM patients").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn occupancy_is_owner_only() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "Ward 4").await;
    let nurse = Ulid::new();

    client
        .batch_execute(&format!("INSERT INTO occupancy (room_id, occupant_id) VALUES ('{rid}', '{nurse}')"))
        .await
        .unwrap();
    let room = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{rid}'")).await;
    assert_eq!(room[0].get("status"), Some("occupied"));
    assert_eq!(room[0].get("occupant_id"), Some(nurse.to_string().as_str()));

    let err = client
        .batch_execute(&format!(
            "DELETE FROM occupancy WHERE room_id = '{rid}' AND occupant_id = '{}'",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    client
        .batch_execute(&format!("DELETE FROM occupancy WHERE room_id = '{rid}' AND occupant_id = '{nurse}'"))
        .await
        .unwrap();
    let room = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{rid}'")).await;
    assert_eq!(room[0].get("status"), Some("available"));

    let err = client
        .batch_execute(&format!("DELETE FROM occupancy WHERE room_id = '{rid}' AND occupant_id = '{nurse}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));
}

#[tokio::test]
async fn free_windows_around_bookings() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "Consult 3").await;

    client.batch_execute(&book_sql(rid, Ulid::new(), DAY0 + 10 * H, DAY0 + 11 * H)).await.unwrap();

    let windows = rows(
        &client,
        &format!(
            r#"SELECT * FROM free_windows WHERE room_id = '{rid}' AND start >= {} AND "end" <= {}"#,
            DAY0 + 8 * H,
            DAY0 + 12 * H
        ),
    )
    .await;
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].get("start"), Some((DAY0 + 8 * H).to_string().as_str()));
    assert_eq!(windows[0].get("end"), Some((DAY0 + 10 * H).to_string().as_str()));
    assert_eq!(windows[1].get("start"), Some((DAY0 + 11 * H).to_string().as_str()));

    let long_only = rows(
        &client,
        &format!(
            r#"SELECT * FROM free_windows WHERE room_id = '{rid}' AND start >= {} AND "end" <= {} AND min_duration = {}"#,
            DAY0 + 8 * H,
            DAY0 + 12 * H,
            2 * H
        ),
    )
    .await;
    assert_eq!(long_only.len(), 1);
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "ICU 1").await;
    let bid = Ulid::new();
    let requester = Ulid::new();

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", patient_id, purpose) VALUES ('{bid}', '{rid}', '{requester}', {}, {}, NULL, 'post-op')"#,
            DAY0,
            DAY0 + H
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("UPDATE bookings SET status = 'completed' WHERE id = '{bid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    client
        .batch_execute(&format!("UPDATE bookings SET status = 'in_progress' WHERE id = '{bid}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'completed' WHERE id = '{bid}'"))
        .await
        .unwrap();

    let room = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{rid}'")).await;
    assert_eq!(room[0].get("status"), Some("available"));

    let notices = rows(&client, &format!("SELECT * FROM notifications WHERE user_id = '{requester}'")).await;
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].get("kind"), Some("appointment"));
    assert_eq!(notices[0].get("seen"), Some("f"));

    client
        .batch_execute(&format!("UPDATE notifications SET seen = true WHERE user_id = '{requester}'"))
        .await
        .unwrap();
    let notices = rows(&client, &format!("SELECT * FROM notifications WHERE user_id = '{requester}'")).await;
    assert_eq!(notices[0].get("seen"), Some("t"));
}

#[tokio::test]
async fn settings_round_trip() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let user = Ulid::new();

    let settings = rows(&client, &format!("SELECT * FROM settings WHERE user_id = '{user}'")).await;
    assert_eq!(settings[0].get("room_updates"), Some("t"));

    client
        .batch_execute(&format!("UPDATE settings SET room_updates = false WHERE user_id = '{user}'"))
        .await
        .unwrap();
    let settings = rows(&client, &format!("SELECT * FROM settings WHERE user_id = '{user}'")).await;
    assert_eq!(settings[0].get("room_updates"), Some("f"));
    assert_eq!(settings[0].get("email_notifications"), Some("t"));

    client
        .batch_execute(&format!("DELETE FROM settings WHERE user_id = '{user}'"))
        .await
        .unwrap();
    let settings = rows(&client, &format!("SELECT * FROM settings WHERE user_id = '{user}'")).await;
    assert_eq!(settings[0].get("room_updates"), Some("t"));
}

#[tokio::test]
async fn extended_query_with_params() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_room(&client, "Emergency 1").await;

    let booking_id = Ulid::new().to_string();
    let room = rid.to_string();
    let requester = Ulid::new().to_string();
    let start = DAY0.to_string();
    let end = (DAY0 + H).to_string();
    let inserted = client
        .execute(
            r#"INSERT INTO bookings (id, room_id, requester_id, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[&booking_id, &room, &requester, &start, &end],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let booked = rows(&client, &format!("SELECT * FROM bookings WHERE room_id = '{rid}'")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("id"), Some(booking_id.as_str()));
}

#[tokio::test]
async fn listen_delivers_room_events() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _rx2) = connect(addr).await;

    let rid = create_room(&writer, "OR 5").await;
    let other = create_room(&writer, "OR 6").await;
    listener.batch_execute(&format!("LISTEN room_{rid}")).await.unwrap();

    writer.batch_execute(&book_sql(other, Ulid::new(), DAY0, DAY0 + H)).await.unwrap();
    writer.batch_execute(&book_sql(rid, Ulid::new(), DAY0, DAY0 + H)).await.unwrap();

    // Pending events go out at the listener's next statement.
    listener.batch_execute("SELECT * FROM rooms").await.unwrap();

    let notif = recv_notification(&mut rx).await.expect("expected notification");
    assert_eq!(notif.channel(), format!("room_{rid}"));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(payload.get("BookingReserved").is_some());

    // Nothing from the room we did not subscribe to.
    assert!(rx.try_recv().is_err());

    listener.batch_execute(&format!("UNLISTEN room_{rid}")).await.unwrap();
    writer.batch_execute(&book_sql(rid, Ulid::new(), DAY0 + H, DAY0 + 2 * H)).await.unwrap();
    listener.batch_execute("SELECT * FROM rooms").await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn listen_rejects_bad_channel() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let err = client.batch_execute("LISTEN resource_abc").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42000"));
}
