use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
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
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::auth::ParklineAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{channel_name, parse_channel};
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ParklineFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Query handler for a single connection. LISTEN subscriptions live here;
/// pending events are delivered as NotificationResponse messages ahead of
/// the result of the connection's next query.
pub struct ParklineHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ParklineQueryParser>,
    subscriptions: Mutex<HashMap<ZoneId, Subscription>>,
    pid: i32,
}

/// A LISTEN on one zone. Holds the engine so the hub entry can be
/// released when the connection goes away.
struct Subscription {
    engine: Arc<Engine>,
    rx: broadcast::Receiver<Event>,
}

impl Drop for ParklineHandler {
    fn drop(&mut self) {
        for (zone_id, sub) in self.subscriptions.get_mut().drain() {
            let Subscription { engine, rx } = sub;
            drop(rx);
            engine.notify.remove_if_idle(zone_id);
        }
    }
}

impl ParklineHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ParklineQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
            pid: std::process::id() as i32,
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(
        &self,
        engine: &Arc<Engine>,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Arc<Engine>,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::SubmitRequest {
                vehicle_id,
                zone_id,
            } => {
                let sub = engine
                    .submit(&vehicle_id, zone_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(submission_schema(format), [sub], |enc, sub| {
                    enc.encode_field(&(sub.request_id as i64))?;
                    enc.encode_field(&sub.outcome.is_success())?;
                    match sub.outcome {
                        AllocationOutcome::Allocated {
                            slot_id,
                            zone_id,
                            cross_zone,
                        } => {
                            enc.encode_field(&RequestState::Allocated.as_str().to_string())?;
                            enc.encode_field(&Some(slot_id))?;
                            enc.encode_field(&Some(zone_id))?;
                            enc.encode_field(&cross_zone)?;
                            enc.encode_field(&None::<String>)
                        }
                        AllocationOutcome::Failed(reason) => {
                            enc.encode_field(&RequestState::Requested.as_str().to_string())?;
                            enc.encode_field(&None::<i64>)?;
                            enc.encode_field(&None::<i64>)?;
                            enc.encode_field(&false)?;
                            enc.encode_field(&Some(reason.as_str().to_string()))
                        }
                    }
                }))
            }
            Command::CancelRequest { id } => {
                let cancelled = rejection_as_false(engine.cancel(id).await)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(cancelled as usize)))
            }
            Command::LeaveParking { id } => {
                let left = rejection_as_false(engine.leave(id).await)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(left as usize)))
            }
            Command::Rollback { k } => {
                let summary = engine.rollback(k).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("ROLLBACK").with_rows(summary.applied()),
                ))
            }
            Command::SelectZones => {
                let zones = engine.zones().await;
                Ok(rows_response(zones_schema(format), zones, |enc, z| {
                    let neighbors = z
                        .neighbors
                        .iter()
                        .map(|n| n.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    enc.encode_field(&z.id)?;
                    enc.encode_field(&(z.area_count as i64))?;
                    enc.encode_field(&(z.slot_count as i64))?;
                    enc.encode_field(&(z.occupied as i64))?;
                    enc.encode_field(&neighbors)
                }))
            }
            Command::SelectSlots { zone_id } => {
                let slots = engine.slots(zone_id).await;
                Ok(rows_response(slots_schema(format), slots, |enc, s| {
                    enc.encode_field(&s.id)?;
                    enc.encode_field(&s.zone_id)?;
                    enc.encode_field(&s.area_id)?;
                    enc.encode_field(&s.occupied)
                }))
            }
            Command::SelectRequests { filter } => {
                let requests = engine.requests(&filter).await;
                Ok(rows_response(requests_schema(format), requests, |enc, r| {
                    enc.encode_field(&(r.id() as i64))?;
                    enc.encode_field(&r.vehicle_id().to_string())?;
                    enc.encode_field(&r.requested_zone())?;
                    enc.encode_field(&r.assigned_slot())?;
                    enc.encode_field(&r.state().as_str().to_string())?;
                    enc.encode_field(&r.created_at())?;
                    enc.encode_field(&r.ended_at())?;
                    enc.encode_field(&r.duration_ms())
                }))
            }
            Command::SelectHistory => {
                let history = engine.history().await;
                Ok(rows_response(
                    history_schema(format),
                    history.into_iter().enumerate(),
                    |enc, (i, op)| {
                        enc.encode_field(&(i as i64 + 1))?;
                        enc.encode_field(&op.kind.as_str().to_string())?;
                        enc.encode_field(&(op.request_id as i64))?;
                        enc.encode_field(&op.slot_id)?;
                        enc.encode_field(&op.zone_id)
                    },
                ))
            }
            Command::SelectAnalytics => {
                let a = engine.analytics().await;
                Ok(rows_response(analytics_schema(format), [a], |enc, a| {
                    enc.encode_field(&(a.total_requests as i64))?;
                    enc.encode_field(&(a.cancelled as i64))?;
                    enc.encode_field(&(a.completed as i64))?;
                    enc.encode_field(&a.average_duration_ms)?;
                    enc.encode_field(&a.peak_zone)
                }))
            }
            Command::SelectZoneUtilization => {
                let zones = engine.analytics().await.zones;
                Ok(rows_response(zone_utilization_schema(format), zones, |enc, z| {
                    enc.encode_field(&z.zone_id)?;
                    enc.encode_field(&(z.occupied as i64))?;
                    enc.encode_field(&(z.capacity as i64))?;
                    enc.encode_field(&z.utilization)
                }))
            }
            Command::Listen { channel } => {
                let zone_id = parse_channel(&channel).ok_or_else(|| {
                    channel_err(format!("invalid channel: {channel} (expected zone_{{id}})"))
                })?;
                if !engine.has_zone(zone_id).await {
                    return Err(channel_err(format!("unknown zone: {channel}")));
                }
                let rx = engine.notify.subscribe(zone_id);
                let sub = Subscription {
                    engine: engine.clone(),
                    rx,
                };
                self.subscriptions.lock().await.insert(zone_id, sub);
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                if let Some(zone_id) = parse_channel(&channel) {
                    let removed = self.subscriptions.lock().await.remove(&zone_id);
                    drop(removed);
                    engine.notify.remove_if_idle(zone_id);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                let zones: Vec<ZoneId> = {
                    let mut subs = self.subscriptions.lock().await;
                    subs.drain().map(|(zone_id, _)| zone_id).collect()
                };
                for zone_id in zones {
                    engine.notify.remove_if_idle(zone_id);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Take everything queued on this connection's subscriptions.
    async fn drain_events(&self) -> Vec<Event> {
        let mut subs = self.subscriptions.lock().await;
        let mut events = Vec::new();
        for (zone_id, sub) in subs.iter_mut() {
            loop {
                match sub.rx.try_recv() {
                    Ok(event) => events.push(event),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!("listener on {} dropped {n} events", channel_name(*zone_id));
                        metrics::counter!(observability::NOTIFICATIONS_LAGGED_TOTAL).increment(n);
                    }
                    Err(_) => break,
                }
            }
        }
        events
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        for event in self.drain_events().await {
            let payload =
                serde_json::to_string(&event).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(self.pid, channel_name(event.zone_id()), payload),
                ))
                .await?;
        }
        Ok(())
    }
}

/// Cancel and leave answer "no" with zero affected rows, not an error.
fn rejection_as_false<T>(result: Result<T, EngineError>) -> PgWireResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_rejection() => {
            debug!("rejected: {e}");
            Ok(false)
        }
        Err(e) => Err(engine_err(e)),
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

/// Row description for `columns`, each encoded as the client asked for.
fn columns(format: &Format, cols: &[(&str, Type)]) -> Vec<FieldInfo> {
    cols.iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn submission_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("request_id", Type::INT8),
            ("allocated", Type::BOOL),
            ("state", Type::VARCHAR),
            ("slot_id", Type::INT8),
            ("zone_id", Type::INT8),
            ("cross_zone", Type::BOOL),
            ("reason", Type::VARCHAR),
        ],
    )
}

fn zones_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("id", Type::INT8),
            ("area_count", Type::INT8),
            ("slot_count", Type::INT8),
            ("occupied", Type::INT8),
            ("neighbors", Type::VARCHAR),
        ],
    )
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("id", Type::INT8),
            ("zone_id", Type::INT8),
            ("area_id", Type::INT8),
            ("occupied", Type::BOOL),
        ],
    )
}

fn requests_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("id", Type::INT8),
            ("vehicle_id", Type::VARCHAR),
            ("zone_id", Type::INT8),
            ("slot_id", Type::INT8),
            ("state", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("ended_at", Type::INT8),
            ("duration_ms", Type::INT8),
        ],
    )
}

fn history_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("position", Type::INT8),
            ("kind", Type::VARCHAR),
            ("request_id", Type::INT8),
            ("slot_id", Type::INT8),
            ("zone_id", Type::INT8),
        ],
    )
}

fn analytics_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("total_requests", Type::INT8),
            ("cancelled", Type::INT8),
            ("completed", Type::INT8),
            ("average_duration_ms", Type::FLOAT8),
            ("peak_zone", Type::INT8),
        ],
    )
}

fn zone_utilization_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        format,
        &[
            ("zone_id", Type::INT8),
            ("occupied", Type::INT8),
            ("capacity", Type::INT8),
            ("utilization", Type::FLOAT8),
        ],
    )
}

/// Row description for a statement that has not been bound yet.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let upper = upper.trim_start();
    if upper.starts_with("INSERT") && upper.contains("REQUESTS") {
        return submission_schema(format);
    }
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("ZONE_UTILIZATION") {
        zone_utilization_schema(format)
    } else if upper.contains("ANALYTICS") {
        analytics_schema(format)
    } else if upper.contains("HISTORY") {
        history_schema(format)
    } else if upper.contains("FROM SLOTS") {
        slots_schema(format)
    } else if upper.contains("FROM ZONES") {
        zones_schema(format)
    } else if upper.contains("REQUESTS") {
        requests_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParklineHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self.run(&engine, cmd, &Format::UnifiedText).await?;
        self.flush_notifications(client).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParklineQueryParser;

#[async_trait]
impl QueryParser for ParklineQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedBinary),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParklineHandler {
    type Statement = String;
    type QueryParser = ParklineQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let response = self
            .run(&engine, cmd, &portal.result_column_format)
            .await?;
        self.flush_notifications(client).await?;
        Ok(response)
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
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, &Format::UnifiedBinary),
        ))
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(
        &portal.statement.statement,
        portal.parameters.iter().map(|p| p.as_deref()),
    )
}

/// Single pass over `sql`: each `$N` outside a quoted literal is replaced by
/// its bound value. Values are never rescanned, so text like `$1` inside a
/// value stays literal.
fn bind_text_params<'a>(
    sql: &str,
    params: impl IntoIterator<Item = Option<&'a [u8]>>,
) -> String {
    let params: Vec<Option<&[u8]>> = params.into_iter().collect();
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = bound {
                    out.push_str(&sql[copied..i]);
                    out.push_str(&quote_param(*param));
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

fn quote_param(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParklineFactory {
    handler: Arc<ParklineHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ParklineAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ParklineFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ParklineAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParklineHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParklineFactory {
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

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn channel_err(message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42000".into(),
        message,
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
