use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO requests (vehicle_id, zone_id) VALUES ('V1', 1)`
    SubmitRequest {
        vehicle_id: String,
        zone_id: ZoneId,
    },
    /// `DELETE FROM requests WHERE id = 1`
    CancelRequest {
        id: RequestId,
    },
    /// `DELETE FROM occupancy WHERE id = 1`
    LeaveParking {
        id: RequestId,
    },
    /// `ROLLBACK 3`. A bare `ROLLBACK` is what drivers send to abort a
    /// transaction, so it parses with `k = 0` and undoes nothing.
    Rollback {
        k: i64,
    },
    SelectZones,
    SelectSlots {
        zone_id: Option<ZoneId>,
    },
    SelectRequests {
        filter: RequestFilter,
    },
    SelectHistory,
    SelectAnalytics,
    SelectZoneUtilization,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let upper = trimmed.to_ascii_uppercase();

    // Handled before sqlparser: ROLLBACK takes a count, LISTEN/UNLISTEN a bare channel.
    if upper == "ROLLBACK" {
        return Ok(Command::Rollback { k: 0 });
    }
    if let Some(rest) = keyword_arg(trimmed, &upper, "ROLLBACK ") {
        // bound parameters arrive quoted
        let k = rest
            .trim_matches('\'')
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad rollback count: {rest}")))?;
        return Ok(Command::Rollback { k });
    }
    if let Some(channel) = keyword_arg(trimmed, &upper, "LISTEN ") {
        return Ok(Command::Listen {
            channel: unquote(channel),
        });
    }
    if let Some(channel) = keyword_arg(trimmed, &upper, "UNLISTEN ") {
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: unquote(channel),
        });
    }

    let dialect = PostgreSqlDialect {};
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

fn keyword_arg<'a>(trimmed: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    if upper.starts_with(keyword) {
        Some(trimmed[keyword.len()..].trim())
    } else {
        None
    }
}

fn unquote(channel: &str) -> String {
    channel.trim_matches('"').to_string()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "requests" {
        return Err(SqlError::UnknownTable(table));
    }

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT into requests".into()));
    }
    let values = &rows[0];
    if values.len() < 2 {
        return Err(SqlError::WrongArity("requests", 2, values.len()));
    }

    // Column list is optional; without one the order is (vehicle_id, zone_id).
    let column = |name: &str, default: usize| -> usize {
        insert
            .columns
            .iter()
            .position(|c| c.value.eq_ignore_ascii_case(name))
            .unwrap_or(default)
    };
    let vehicle_expr = values
        .get(column("vehicle_id", 0))
        .ok_or(SqlError::WrongArity("requests", 2, values.len()))?;
    let zone_expr = values
        .get(column("zone_id", 1))
        .ok_or(SqlError::WrongArity("requests", 2, values.len()))?;

    Ok(Command::SubmitRequest {
        vehicle_id: parse_string(vehicle_expr)?,
        zone_id: parse_i64(zone_expr)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "requests" => Ok(Command::CancelRequest { id }),
        "occupancy" => Ok(Command::LeaveParking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "zones" => Ok(Command::SelectZones),
        "slots" => {
            let mut filter = RequestFilter::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &["zone_id"], &mut filter)?;
            }
            Ok(Command::SelectSlots {
                zone_id: filter.zone_id,
            })
        }
        "requests" => {
            let mut filter = RequestFilter::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &["id", "state", "vehicle_id", "zone_id"], &mut filter)?;
            }
            Ok(Command::SelectRequests { filter })
        }
        "history" => Ok(Command::SelectHistory),
        "analytics" => Ok(Command::SelectAnalytics),
        "zone_utilization" => Ok(Command::SelectZoneUtilization),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` terms joined by AND. Only columns in `allowed` may
/// appear; anything else is rejected rather than silently ignored.
fn extract_filters(
    expr: &Expr,
    allowed: &[&'static str],
    filter: &mut RequestFilter,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, allowed, filter),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, allowed, filter)?;
                extract_filters(right, allowed, filter)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                if !allowed.iter().any(|a| *a == col) {
                    return Err(SqlError::Unsupported(format!("filter on column {col}")));
                }
                match col.as_str() {
                    "id" => filter.id = Some(parse_request_id(right)?),
                    "state" => {
                        let s = parse_string(right)?;
                        filter.state = Some(s.parse().map_err(SqlError::Parse)?);
                    }
                    "vehicle_id" => filter.vehicle_id = Some(parse_string(right)?),
                    "zone_id" => filter.zone_id = Some(parse_i64(right)?),
                    _ => unreachable!("column checked against allowed list"),
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<RequestId, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_request_id(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_request_id(expr: &Expr) -> Result<RequestId, SqlError> {
    let v = parse_i64(expr)?;
    RequestId::try_from(v).map_err(|_| SqlError::Parse(format!("bad request id: {v}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
