use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

const CHANNEL_PREFIX: &str = "room_";

/// A LISTEN registration held by one connection.
struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

pub struct RoomdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoomdQueryParser>,
    listens: Mutex<Vec<Subscription>>,
}

impl RoomdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoomdQueryParser),
            listens: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql_text: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertRoom {
                id,
                name,
                room_type,
                floor,
                capacity,
                description,
            } => {
                engine
                    .create_room(id, name, room_type, floor, capacity, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom { id, patch } => {
                engine.update_room(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRoom { id } => {
                let room = engine.get_room_info(id).await.map_err(engine_err)?;
                Ok(vec![rooms_response(vec![room])])
            }
            Command::SelectRooms { filter } => {
                let rooms = engine.list_rooms(&filter).await;
                Ok(vec![rooms_response(rooms)])
            }
            Command::InsertBooking(req) => {
                engine.validate_and_reserve(req).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBookingStatus { id, status } => {
                engine.transition_booking(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(&filter).await;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.room_id.to_string())?;
                        encoder.encode_field(&b.requester_id.to_string())?;
                        encoder.encode_field(&b.patient_id.map(|p| p.to_string()))?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.purpose)?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Occupy { room_id, occupant_id } => {
                engine.occupy(room_id, occupant_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Unoccupy { room_id, occupant_id } => {
                engine.unoccupy(room_id, occupant_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectFreeWindows {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let windows = engine
                    .compute_free_windows(room_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(free_windows_schema());
                let rid_str = room_id.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&w.start)?;
                        encoder.encode_field(&w.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectNotifications { user_id } => {
                let notices = engine.inbox.notices(&user_id);
                let schema = Arc::new(notifications_schema());
                let rows: Vec<PgWireResult<_>> = notices
                    .iter()
                    .map(|n| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&n.id.to_string())?;
                        encoder.encode_field(&n.room_id.to_string())?;
                        encoder.encode_field(&n.kind.as_str())?;
                        encoder.encode_field(&n.priority.as_str())?;
                        encoder.encode_field(&n.message)?;
                        encoder.encode_field(&n.seen)?;
                        encoder.encode_field(&n.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::MarkNotificationsSeen { user_id } => {
                let changed = engine.inbox.mark_all_seen(&user_id);
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(changed))])
            }
            Command::SelectSettings { user_id } => {
                let prefs = engine.inbox.prefs(&user_id);
                Ok(vec![settings_response(user_id, prefs)])
            }
            Command::UpdateSettings { user_id, patch } => {
                engine.update_preferences(user_id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ResetSettings { user_id } => {
                engine.reset_preferences(user_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Listen { channel } => {
                let room_id = parse_channel(&channel)?;
                let mut listens = self.listens.lock().await;
                if !listens.iter().any(|s| s.channel == channel) {
                    let rx = engine.notify.subscribe(room_id);
                    listens.push(Subscription { channel, rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut listens = self.listens.lock().await;
                match channel {
                    Some(channel) => listens.retain(|s| s.channel != channel),
                    None => listens.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Forward events queued on this connection's LISTEN channels as
    /// `NotificationResponse` messages with a JSON payload.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listens = self.listens.lock().await;
            listens.retain_mut(|sub| loop {
                match sub.rx.try_recv() {
                    Ok(event) => pending.push((sub.channel.clone(), event)),
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Lagged(missed)) => {
                        tracing::warn!("listener on {} lagged, {missed} events dropped", sub.channel);
                    }
                    // Room deleted.
                    Err(TryRecvError::Closed) => return false,
                }
            });
        }

        let pid = std::process::id() as i32;
        for (channel, event) in pending {
            let payload = serde_json::to_string(&event).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        user_error("42000", format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"))
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("room_type"),
        typed_field("floor", Type::INT4),
        typed_field("capacity", Type::INT8),
        text_field("description"),
        text_field("status"),
        text_field("occupant_id"),
        typed_field("created_at", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("requester_id"),
        text_field("patient_id"),
        typed_field("start", Type::INT8),
        typed_field("end", Type::INT8),
        text_field("purpose"),
        text_field("status"),
        typed_field("created_at", Type::INT8),
    ]
}

fn free_windows_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id"),
        typed_field("start", Type::INT8),
        typed_field("end", Type::INT8),
    ]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("kind"),
        text_field("priority"),
        text_field("message"),
        typed_field("seen", Type::BOOL),
        typed_field("created_at", Type::INT8),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("user_id"),
        typed_field("email_notifications", Type::BOOL),
        typed_field("push_notifications", Type::BOOL),
        typed_field("room_updates", Type::BOOL),
        typed_field("system_updates", Type::BOOL),
    ]
}

/// Result columns for a statement, from the table named after FROM.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("rooms") => rooms_schema(),
        Some("bookings") => bookings_schema(),
        Some("free_windows") => free_windows_schema(),
        Some("notifications") => notifications_schema(),
        Some("settings") => settings_schema(),
        _ => vec![],
    }
}

fn rooms_response(rooms: Vec<RoomInfo>) -> Response {
    let schema = Arc::new(rooms_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.room_type.as_str())?;
            encoder.encode_field(&r.floor)?;
            encoder.encode_field(&i64::from(r.capacity))?;
            encoder.encode_field(&r.description)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.occupant_id.map(|o| o.to_string()))?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn settings_row(schema: Arc<Vec<FieldInfo>>, user_id: Ulid, prefs: &NotificationPrefs) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&user_id.to_string())?;
    encoder.encode_field(&prefs.email_notifications)?;
    encoder.encode_field(&prefs.push_notifications)?;
    encoder.encode_field(&prefs.room_updates)?;
    encoder.encode_field(&prefs.system_updates)?;
    Ok(encoder.take_row())
}

fn settings_response(user_id: Ulid, prefs: NotificationPrefs) -> Response {
    let schema = Arc::new(settings_schema());
    let row = settings_row(schema.clone(), user_id, &prefs);
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = self.run(&engine, query).await;
        self.flush_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql_text = substitute_params(portal);
        let result = self.run(&engine, &sql_text).await;
        self.flush_notifications(client).await?;
        let mut responses = result?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... with bound parameter values as quoted text.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user and tenant.
#[derive(Debug)]
pub struct RoomdAuthSource {
    password: String,
}

impl RoomdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("login attempt by {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoomdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection. Each connection gets its own handler, so
/// LISTEN registrations are per connection.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    tracing::debug!("engine rejected command: {e}");
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
