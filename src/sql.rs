use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
        room_type: RoomType,
        floor: i32,
        capacity: u32,
        description: Option<String>,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRoom {
        id: Ulid,
    },
    SelectRooms {
        filter: RoomFilter,
    },
    InsertBooking(NewBooking),
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    Occupy {
        room_id: Ulid,
        occupant_id: Ulid,
    },
    Unoccupy {
        room_id: Ulid,
        occupant_id: Ulid,
    },
    SelectFreeWindows {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectNotifications {
        user_id: Ulid,
    },
    MarkNotificationsSeen {
        user_id: Ulid,
    },
    SelectSettings {
        user_id: Ulid,
    },
    UpdateSettings {
        user_id: Ulid,
        patch: PrefsPatch,
    },
    ResetSettings {
        user_id: Ulid,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        let channel = (channel != "*").then(|| channel.to_string());
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    if upper.starts_with("UPDATE") {
        return parse_update(&dialect, trimmed);
    }

    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("rooms", 3, values.len()));
            }
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                name: parse_text(&values[1])?,
                room_type: parse_label(&values[2])?,
                floor: values.get(3).map(parse_i32).transpose()?.unwrap_or(0),
                capacity: values.get(4).map(parse_u32).transpose()?.unwrap_or(1),
                description: values.get(5).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            Ok(Command::InsertBooking(NewBooking {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                requester_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
                patient_id: values.get(5).map(parse_ulid_or_null).transpose()?.flatten(),
                purpose: values.get(6).map(parse_text_or_null).transpose()?.flatten(),
            }))
        }
        "occupancy" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("occupancy", 2, values.len()));
            }
            Ok(Command::Occupy {
                room_id: parse_ulid(&values[0])?,
                occupant_id: parse_ulid(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(dialect: &PostgreSqlDialect, sql: &str) -> Result<Command, SqlError> {
    let perr = |e: sqlparser::parser::ParserError| SqlError::Parse(e.to_string());
    let mut parser = Parser::new(dialect).try_with_sql(sql).map_err(perr)?;
    parser.expect_keyword(Keyword::UPDATE).map_err(perr)?;
    let name = parser.parse_object_name(false).map_err(perr)?;
    parser.expect_keyword(Keyword::SET).map_err(perr)?;
    let assignments = parser.parse_comma_separated(Parser::parse_assignment).map_err(perr)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(perr)?)
    } else {
        None
    };

    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in &assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(col) => object_name_last(col),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((column, &a.value));
    }

    match table.as_str() {
        "rooms" => {
            let id = extract_where_ulid(&selection, "id")?;
            let mut patch = RoomPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "room_type" => patch.room_type = Some(parse_label(value)?),
                    "floor" => patch.floor = Some(parse_i32(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "description" => patch.description = Some(parse_text_or_null(value)?),
                    "status" => patch.status = Some(parse_label(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateRoom { id, patch })
        }
        "bookings" => {
            let id = extract_where_ulid(&selection, "id")?;
            let mut status = None;
            for (column, value) in sets {
                match column.as_str() {
                    "status" => status = Some(parse_label(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;
            Ok(Command::UpdateBookingStatus { id, status })
        }
        "notifications" => {
            let user_id = extract_where_ulid(&selection, "user_id")?;
            for (column, value) in sets {
                match column.as_str() {
                    "seen" if parse_bool(value)? => {}
                    "seen" => return Err(SqlError::Unsupported("notices cannot be marked unseen".into())),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::MarkNotificationsSeen { user_id })
        }
        "settings" => {
            let user_id = extract_where_ulid(&selection, "user_id")?;
            let mut patch = PrefsPatch::default();
            for (column, value) in sets {
                let flag = Some(parse_bool(value)?);
                match column.as_str() {
                    "email_notifications" => patch.email_notifications = flag,
                    "push_notifications" => patch.push_notifications = flag,
                    "room_updates" => patch.room_updates = flag,
                    "system_updates" => patch.system_updates = flag,
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateSettings { user_id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom {
            id: extract_where_ulid(&delete.selection, "id")?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_ulid(&delete.selection, "id")?,
        }),
        "occupancy" => Ok(Command::Unoccupy {
            room_id: extract_where_ulid(&delete.selection, "room_id")?,
            occupant_id: extract_where_ulid(&delete.selection, "occupant_id")?,
        }),
        "settings" => Ok(Command::ResetSettings {
            user_id: extract_where_ulid(&delete.selection, "user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        conjuncts(selection, &mut preds)?;
    }

    match table.as_str() {
        "rooms" => {
            let mut filter = RoomFilter::default();
            for p in preds {
                match (p.column.as_str(), &p.op) {
                    ("id", BinaryOperator::Eq) => return Ok(Command::SelectRoom { id: parse_ulid(p.value)? }),
                    ("room_type", BinaryOperator::Eq) => filter.room_type = Some(parse_label(p.value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_label(p.value)?),
                    ("floor", BinaryOperator::Eq) => filter.floor = Some(parse_i32(p.value)?),
                    ("search", BinaryOperator::Eq) => filter.search = Some(parse_text(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectRooms { filter })
        }
        "bookings" => {
            let mut filter = BookingFilter::default();
            for p in preds {
                match (p.column.as_str(), &p.op) {
                    ("room_id", BinaryOperator::Eq) => filter.room_id = Some(parse_ulid(p.value)?),
                    ("start", BinaryOperator::GtEq) => filter.start_from = Some(parse_i64(p.value)?),
                    ("end", BinaryOperator::LtEq) => filter.end_until = Some(parse_i64(p.value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_label(p.value)?),
                    ("requester_id", BinaryOperator::Eq) => filter.requester_id = Some(parse_ulid(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectBookings { filter })
        }
        "free_windows" => {
            let (mut room_id, mut start, mut end, mut min_duration) = (None, None, None, None);
            for p in preds {
                match (p.column.as_str(), &p.op) {
                    ("room_id", BinaryOperator::Eq) => room_id = Some(parse_ulid(p.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_i64(p.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_i64(p.value)?),
                    ("min_duration", BinaryOperator::Eq) => min_duration = Some(parse_i64(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectFreeWindows {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                min_duration,
            })
        }
        "notifications" => Ok(Command::SelectNotifications {
            user_id: single_user_id(preds)?,
        }),
        "settings" => Ok(Command::SelectSettings {
            user_id: single_user_id(preds)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One `column <op> value` term of a WHERE conjunction.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

impl Predicate<'_> {
    fn unsupported(&self) -> SqlError {
        SqlError::Unsupported(format!("filter {} {}", self.column, self.op))
    }
}

/// Flatten `a AND (b AND c)` into predicates. OR and other shapes are refused.
fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => conjuncts(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out)?;
            conjuncts(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("expression {left}")))?;
            out.push(Predicate {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn single_user_id(preds: Vec<Predicate<'_>>) -> Result<Ulid, SqlError> {
    let mut user_id = None;
    for p in preds {
        match (p.column.as_str(), &p.op) {
            ("user_id", BinaryOperator::Eq) => user_id = Some(parse_ulid(p.value)?),
            _ => return Err(p.unsupported()),
        }
    }
    user_id.ok_or(SqlError::MissingFilter("user_id"))
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Find `column = <ulid>` among the WHERE conjuncts.
fn extract_where_ulid(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    let mut preds = Vec::new();
    conjuncts(sel, &mut preds)?;
    let p = preds
        .iter()
        .find(|p| p.column == column && p.op == BinaryOperator::Eq)
        .ok_or(SqlError::MissingFilter(column))?;
    parse_ulid(p.value)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::DollarQuotedString(s)) => Ok(s.value.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_text(expr).map(Some)
    }
}

fn parse_label<T: FromStr<Err = UnknownLabel>>(expr: &Expr) -> Result<T, SqlError> {
    let s = parse_text(expr)?;
    s.parse().map_err(|e: UnknownLabel| SqlError::Parse(e.to_string()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid(expr).map(Some)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_room_with_defaults() {
        let sql = format!("INSERT INTO rooms (id, name, room_type) VALUES ('{A}', 'Lab A', 'lab')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertRoom {
                id: ulid(A),
                name: "Lab A".into(),
                room_type: RoomType::Lab,
                floor: 0,
                capacity: 1,
                description: None,
            }
        );
    }

    #[test]
    fn parse_insert_room_full() {
        let sql = format!(
            "INSERT INTO rooms (id, name, room_type, floor, capacity, description) \
             VALUES ('{A}', 'ICU 2', 'ICU', -1, 3, 'negative pressure')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRoom { room_type, floor, capacity, description, .. } => {
                assert_eq!(room_type, RoomType::Icu);
                assert_eq!(floor, -1);
                assert_eq!(capacity, 3);
                assert_eq!(description.as_deref(), Some("negative pressure"));
            }
            cmd => panic!("expected InsertRoom, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_room_bad_type() {
        let sql = format!("INSERT INTO rooms (id, name, room_type) VALUES ('{A}', 'X', 'garage')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", patient_id, purpose) VALUES ('{A}', '{B}', '{A}', 1000, 2000, NULL, 'follow-up')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking(NewBooking {
                id: ulid(A),
                room_id: ulid(B),
                requester_id: ulid(A),
                patient_id: None,
                start: 1000,
                end: 2000,
                purpose: Some("follow-up".into()),
            })
        );
    }

    #[test]
    fn parse_insert_booking_arity() {
        let sql = format!(r#"INSERT INTO bookings (id, room_id, requester_id, start) VALUES ('{A}', '{B}', '{A}', 1000)"#);
        assert_eq!(parse_sql(&sql), Err(SqlError::WrongArity("bookings", 5, 4)));
    }

    #[test]
    fn parse_occupancy() {
        let insert = format!("INSERT INTO occupancy (room_id, occupant_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&insert).unwrap(),
            Command::Occupy { room_id: ulid(A), occupant_id: ulid(B) }
        );
        let delete = format!("DELETE FROM occupancy WHERE occupant_id = '{B}' AND room_id = '{A}'");
        assert_eq!(
            parse_sql(&delete).unwrap(),
            Command::Unoccupy { room_id: ulid(A), occupant_id: ulid(B) }
        );
    }

    #[test]
    fn parse_update_room() {
        let sql = format!("UPDATE rooms SET name = 'OR 3', description = NULL, status = 'maintenance' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateRoom {
                id: ulid(A),
                patch: RoomPatch {
                    name: Some("OR 3".into()),
                    description: Some(None),
                    status: Some(RoomStatus::Maintenance),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_update_booking_status() {
        let sql = format!("UPDATE bookings SET status = 'in_progress' WHERE id = '{A}';");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBookingStatus { id: ulid(A), status: BookingStatus::InProgress }
        );
    }

    #[test]
    fn parse_update_requires_where() {
        assert_eq!(
            parse_sql("UPDATE bookings SET status = 'completed'"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE rooms SET colour = 'blue' WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownColumn("colour".into())));
    }

    #[test]
    fn parse_settings_and_notifications() {
        let update = format!("UPDATE settings SET room_updates = false, push_notifications = 't' WHERE user_id = '{A}'");
        assert_eq!(
            parse_sql(&update).unwrap(),
            Command::UpdateSettings {
                user_id: ulid(A),
                patch: PrefsPatch {
                    room_updates: Some(false),
                    push_notifications: Some(true),
                    ..Default::default()
                },
            }
        );
        let seen = format!("UPDATE notifications SET seen = true WHERE user_id = '{A}'");
        assert_eq!(parse_sql(&seen).unwrap(), Command::MarkNotificationsSeen { user_id: ulid(A) });
        let select = format!("SELECT * FROM settings WHERE user_id = '{A}'");
        assert_eq!(parse_sql(&select).unwrap(), Command::SelectSettings { user_id: ulid(A) });
        let reset = format!("DELETE FROM settings WHERE user_id = '{A}'");
        assert_eq!(parse_sql(&reset).unwrap(), Command::ResetSettings { user_id: ulid(A) });
        assert!(matches!(
            parse_sql("SELECT * FROM notifications"),
            Err(SqlError::MissingFilter("user_id"))
        ));
    }

    #[test]
    fn parse_select_rooms_filters() {
        let sql = "SELECT * FROM rooms WHERE room_type = 'surgery' AND (floor = 2 AND search = 'east')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectRooms {
                filter: RoomFilter {
                    room_type: Some(RoomType::Surgery),
                    floor: Some(2),
                    search: Some("east".into()),
                    status: None,
                },
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM rooms").unwrap(),
            Command::SelectRooms { filter: RoomFilter::default() }
        );
        let by_id = format!("SELECT * FROM rooms WHERE id = '{A}'");
        assert_eq!(parse_sql(&by_id).unwrap(), Command::SelectRoom { id: ulid(A) });
    }

    #[test]
    fn parse_select_bookings_filters() {
        let sql = format!(
            r#"SELECT * FROM bookings WHERE room_id = '{A}' AND start >= 1000 AND "end" <= 5000 AND status = 'scheduled'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter {
                    room_id: Some(ulid(A)),
                    start_from: Some(1000),
                    end_until: Some(5000),
                    status: Some(BookingStatus::Scheduled),
                    requester_id: None,
                },
            }
        );
    }

    #[test]
    fn parse_select_rejects_or() {
        let sql = "SELECT * FROM rooms WHERE floor = 1 OR floor = 2";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_free_windows() {
        let sql = format!(
            r#"SELECT * FROM free_windows WHERE room_id = '{A}' AND start >= 1000 AND "end" <= 2000 AND min_duration = 300"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectFreeWindows { room_id: ulid(A), start: 1000, end: 2000, min_duration: Some(300) }
        );
        let missing = format!("SELECT * FROM free_windows WHERE room_id = '{A}' AND start >= 1000");
        assert_eq!(parse_sql(&missing), Err(SqlError::MissingFilter("end")));
    }

    #[test]
    fn parse_delete_room_and_booking() {
        let room = format!("DELETE FROM rooms WHERE id = '{A}'");
        assert_eq!(parse_sql(&room).unwrap(), Command::DeleteRoom { id: ulid(A) });
        let booking = format!("DELETE FROM bookings WHERE id = '{B}'");
        assert_eq!(parse_sql(&booking).unwrap(), Command::DeleteBooking { id: ulid(B) });
    }

    #[test]
    fn parse_listen_and_unlisten() {
        let sql = format!("LISTEN room_{A};");
        assert_eq!(parse_sql(&sql).unwrap(), Command::Listen { channel: format!("room_{A}") });
        let sql = format!("unlisten room_{A}");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Unlisten { channel: Some(format!("room_{A}")) }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::Unlisten { channel: None });
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO patients (id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownTable("patients".into())));
    }

    #[test]
    fn parse_bad_ulid_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM rooms WHERE id = 'not-a-ulid'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
