//! The generic SQL connector (C2): one pooled engine per
//! [`ConnectionConfig`], backed by `sqlx`'s `Any` driver for
//! postgresql/mysql/sqlite and by `tiberius` for mssql.
//!
//! Grounded on the teacher's `database::ConnectionPool` (`#[bon::bon]`
//! builder-constructed pool, `acquire`, `in_transaction`, manual `Debug`)
//! generalized from a single `MySqlPool` to the three `sqlx`-native
//! dialects plus `tiberius`.

use std::fmt;
use std::time::Instant;

use serde_json::Value as Json;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row, ValueRef};
use tiberius::{AuthMethod, Client as TiberiusClient, Config as TiberiusConfig, Row as TiberiusRow, ToSql};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use url::Url;

use super::params::Params;
use super::policy::{self, LimitStyle};
use super::{Connector, ConnectionInfo, TableInfo};
use crate::error::{DatabaseError, Error, Result};
use crate::metrics::ConnectionMetrics;
use crate::model::{ColumnMetadata, ConnectionConfig, ConnectorKind, QueryResult, Record};
use crate::sanitize::{looks_like_credential_failure, sanitize_error_message};

/// The pooled backend a [`GenericSqlConnector`] actually talks to.
enum Backend
{
	/// postgresql / mysql / sqlite, via `sqlx`'s dialect-erased driver.
	Any(AnyPool),
	/// mssql, via `tiberius`. `tiberius` has no built-in pool and isn't
	/// `Clone`-friendly without an extra pooling crate this workspace
	/// doesn't otherwise depend on, so this is a pool of exactly one
	/// connection guarded by a mutex — enough to satisfy the uniform
	/// `Connector` contract without fabricating a dependency.
	Mssql(Mutex<TiberiusClient<Compat<TcpStream>>>),
	/// Not yet connected.
	Disconnected,
}

impl fmt::Debug for Backend
{
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		let name = match self {
			Self::Any(_) => "Any",
			Self::Mssql(_) => "Mssql",
			Self::Disconnected => "Disconnected",
		};
		fmt.debug_tuple("Backend").field(&name).finish()
	}
}

#[derive(Debug)]
pub struct GenericSqlConnector
{
	config: ConnectionConfig,
	backend: Backend,
	metrics: ConnectionMetrics,
}

impl GenericSqlConnector
{
	pub fn new(config: ConnectionConfig) -> Self
	{
		Self { config, backend: Backend::Disconnected, metrics: ConnectionMetrics::new() }
	}

	fn limit_style(&self) -> LimitStyle
	{
		match self.config.kind {
			ConnectorKind::Mssql => LimitStyle::LeadingTop,
			_ => LimitStyle::TrailingLimit,
		}
	}

	fn connection_url(&self) -> Result<Url>
	{
		if let Some(url) = &self.config.connection_string {
			return Url::parse(url)
				.map_err(|err| DatabaseError::with_source("invalid connection string", err).into());
		}

		let scheme = match self.config.kind {
			ConnectorKind::Postgresql => "postgres",
			ConnectorKind::Mysql => "mysql",
			ConnectorKind::Sqlite => "sqlite",
			ConnectorKind::Mssql => "mssql",
			_ => unreachable!("generic connector only handles generic kinds"),
		};

		if self.config.kind == ConnectorKind::Sqlite {
			let path = self.config.database.as_deref().unwrap_or(":memory:");
			return Url::parse(&format!("sqlite:{path}"))
				.map_err(|err| DatabaseError::with_source("invalid sqlite path", err).into());
		}

		let mut url = format!("{scheme}://");
		if let Some(user) = &self.config.user {
			url.push_str(user);
			if let Some(password) = &self.config.password {
				url.push(':');
				url.push_str(password);
			}
			url.push('@');
		}
		url.push_str(self.config.host.as_deref().unwrap_or("localhost"));
		if let Some(port) = self.config.port {
			url.push(':');
			url.push_str(&port.to_string());
		}
		if let Some(database) = &self.config.database {
			url.push('/');
			url.push_str(database);
		}

		Url::parse(&url).map_err(|err| DatabaseError::with_source("invalid connection url", err).into())
	}

	fn sanitize(&self, message: impl AsRef<str>) -> String
	{
		sanitize_error_message(message.as_ref(), self.config.user.as_deref(), self.config.password.as_deref())
	}

	async fn connect_mssql(&self) -> Result<TiberiusClient<Compat<TcpStream>>>
	{
		let mut config = TiberiusConfig::new();
		config.host(self.config.host.as_deref().unwrap_or("localhost"));
		config.port(self.config.port.unwrap_or(1433));
		if let Some(database) = &self.config.database {
			config.database(database);
		}
		match (&self.config.user, &self.config.password) {
			(Some(user), Some(password)) => config.authentication(AuthMethod::sql_server(user, password)),
			_ => config.authentication(AuthMethod::Integrated),
		}
		// Driver-manager-issued certs are out of scope for this core; trust
		// whatever the server presents, same posture as the ODBC connector's
		// DSN-level TLS configuration.
		config.trust_cert();

		let tcp = TcpStream::connect(config.get_addr())
			.await
			.map_err(|err| self.classify_connect_error(self.sanitize(err.to_string())))?;
		tcp.set_nodelay(true).map_err(|err| DatabaseError::with_source("failed to set tcp nodelay", err))?;

		TiberiusClient::connect(config, tcp.compat_write())
			.await
			.map_err(|err| self.classify_connect_error(self.sanitize(err.to_string())))
	}

	fn classify_connect_error(&self, message: String) -> Error
	{
		if looks_like_credential_failure(&message) {
			crate::error::SecurityError::new(message).into()
		} else {
			DatabaseError::new(message).into()
		}
	}

	/// The pool backing this connector, for [`crate::session::Session`] to
	/// `begin()` a transaction on. `None` for `mssql` (not yet wired
	/// through to a transactional session) and before `connect()`.
	pub(crate) fn any_pool(&self) -> Option<&AnyPool>
	{
		match &self.backend {
			Backend::Any(pool) => Some(pool),
			Backend::Mssql(_) | Backend::Disconnected => None,
		}
	}

	/// Runs an already-rewritten statement against whichever backend is
	/// connected, recording metrics, and returns the decoded rows alongside
	/// how long the driver round-trip took. Does not run [`policy`] checks —
	/// callers that execute caller-supplied SQL must do that themselves.
	async fn run_statement(
		&self,
		sql: &str,
		params: Option<&Params>,
	) -> Result<(Vec<Record>, Vec<ColumnMetadata>, std::time::Duration)>
	{
		let (rewritten, names) = super::params::rewrite_named_placeholders(sql);
		let values = params.map(|p| super::params::ordered_values(&names, p)).transpose()?;

		let start = Instant::now();
		match &self.backend {
			Backend::Any(pool) => {
				let mut query = sqlx::query(&rewritten);
				if let Some(values) = &values {
					for value in values {
						query = bind_any(query, value);
					}
				}

				let rows = query.fetch_all(pool).await;
				let execution_time = start.elapsed();

				let rows = match rows {
					Ok(rows) => {
						self.metrics.record_query(&self.config.name, sql, execution_time).await;
						rows
					},
					Err(err) => {
						self.metrics.record_failure().await;
						return Err(DatabaseError::with_source(self.sanitize(err.to_string()), err).into());
					},
				};

				let (records, columns) = decode_rows(&rows);
				Ok((records, columns, execution_time))
			},
			Backend::Mssql(client) => {
				let owned_params: Vec<Box<dyn ToSql + Send + Sync>> =
					values.unwrap_or_default().iter().map(to_mssql_param).collect();
				let bound: Vec<&dyn ToSql> = owned_params.iter().map(AsRef::as_ref).collect();

				let mut guard = client.lock().await;
				let rows = async {
					let stream = guard.query(&rewritten, &bound).await?;
					stream.into_first_result().await
				}
				.await;
				let execution_time = start.elapsed();
				drop(guard);

				let rows = match rows {
					Ok(rows) => {
						self.metrics.record_query(&self.config.name, sql, execution_time).await;
						rows
					},
					Err(err) => {
						self.metrics.record_failure().await;
						return Err(DatabaseError::with_source(self.sanitize(err.to_string()), err).into());
					},
				};

				let (records, columns) = decode_mssql_rows(&rows);
				Ok((records, columns, execution_time))
			},
			Backend::Disconnected => Err(DatabaseError::new("connection is not connected").into()),
		}
	}
}

impl Connector for GenericSqlConnector
{
	async fn connect(&mut self) -> Result<()>
	{
		if self.config.kind == ConnectorKind::Mssql {
			self.backend = Backend::Mssql(Mutex::new(self.connect_mssql().await?));
			return Ok(());
		}

		let url = self.connection_url()?;
		let connect_options: AnyConnectOptions = url.as_str().parse().map_err(|err: sqlx::Error| {
			self.classify_connect_error(self.sanitize(err.to_string()))
		})?;

		let pool = AnyPoolOptions::new()
			.max_connections(self.config.pool_size + self.config.max_overflow)
			.min_connections(1)
			.acquire_timeout(self.config.connection_timeout.unwrap_or(std::time::Duration::from_secs(30)))
			.connect_with(connect_options)
			.await
			.map_err(|err| self.classify_connect_error(self.sanitize(err.to_string())))?;

		self.backend = Backend::Any(pool);

		Ok(())
	}

	async fn disconnect(&mut self) -> Result<()>
	{
		match std::mem::replace(&mut self.backend, Backend::Disconnected) {
			Backend::Any(pool) => pool.close().await,
			Backend::Mssql(_) | Backend::Disconnected => {},
		}

		Ok(())
	}

	#[tracing::instrument(level = "debug", skip(self, params), err(Debug))]
	async fn execute_query(
		&mut self,
		sql: &str,
		params: Option<&Params>,
		limit: Option<u64>,
	) -> Result<QueryResult>
	{
		policy::validate_statement(&self.config, sql)?;
		let expanded = policy::expand_bare_table_name(sql, limit, self.limit_style());

		let (records, columns, execution_time) = self.run_statement(&expanded, params).await?;
		let row_count = records.len();

		Ok(QueryResult {
			query: expanded,
			connection_id: self.config.name.clone(),
			executed_at: OffsetDateTime::now_utc(),
			records,
			columns,
			row_count,
			execution_time_ms: u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
			truncated: limit.is_some_and(|limit| row_count as u64 >= limit),
			has_error: false,
			error_message: None,
			mapped_fields: None,
		})
	}

	async fn get_tables(&mut self, schema: Option<&str>) -> Result<Vec<TableInfo>>
	{
		let (sql, params) = match self.config.kind {
			ConnectorKind::Sqlite => {
				("SELECT name, NULL AS table_schema FROM sqlite_master WHERE type = 'table'".to_owned(), None)
			},
			_ => match schema {
				Some(schema) => (
					"SELECT table_name, table_schema FROM information_schema.tables WHERE table_schema = :schema"
						.to_owned(),
					Some(Params::from([("schema".to_owned(), super::params::ParamValue::Text(schema.to_owned()))])),
				),
				None => ("SELECT table_name, table_schema FROM information_schema.tables".to_owned(), None),
			},
		};

		// Catalog introspection targets a system view, not user data, so it
		// is dispatched directly rather than through `execute_query`'s
		// table-whitelist enforcement (spec §4.1's whitelist governs the
		// tables a caller's statements may target, not this connector's own
		// metadata lookups).
		let (records, _columns, _) = self.run_statement(&sql, params.as_ref()).await?;

		Ok(records
			.into_iter()
			.map(|record| TableInfo {
				name: record
					.get("table_name")
					.or_else(|| record.get("name"))
					.and_then(Json::as_str)
					.unwrap_or_default()
					.to_owned(),
				schema: record.get("table_schema").and_then(Json::as_str).map(str::to_owned),
			})
			.collect())
	}

	async fn get_table_columns(
		&mut self,
		table: &str,
		schema: Option<&str>,
	) -> Result<Vec<ColumnMetadata>>
	{
		let result = self.execute_query(&format!("SELECT * FROM {table}"), None, Some(0)).await?;
		let _ = schema;
		Ok(result.columns)
	}

	async fn test_connection(&mut self) -> (bool, Option<String>)
	{
		let was_connected = !matches!(self.backend, Backend::Disconnected);

		if !was_connected && self.connect().await.is_err() {
			return (false, Some("failed to connect".to_owned()));
		}

		let result = self.execute_query("SELECT 1", None, None).await;

		if !was_connected {
			let _ = self.disconnect().await;
		}

		match result {
			Ok(_) => (true, None),
			Err(err) => (false, Some(self.sanitize(err.to_string()))),
		}
	}

	fn cancel_current_query(&self) -> bool
	{
		false
	}

	fn connection_info(&self) -> ConnectionInfo
	{
		ConnectionInfo {
			name: self.config.name.clone(),
			kind: self.config.kind,
			read_only: self.config.read_only,
			connected: !matches!(self.backend, Backend::Disconnected),
		}
	}

	async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot
	{
		self.metrics.snapshot().await
	}
}

fn bind_any<'q>(
	query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
	value: &'q super::params::ParamValue,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>
{
	use super::params::ParamValue;

	match value {
		ParamValue::Null => query.bind(None::<String>),
		ParamValue::Bool(b) => query.bind(*b),
		ParamValue::Int(i) => query.bind(*i),
		ParamValue::Float(f) => query.bind(*f),
		ParamValue::Text(s) => query.bind(s.as_str()),
		ParamValue::DateTime(dt) => query.bind(dt.unix_timestamp()),
		ParamValue::Date(date) => query.bind(date.to_string()),
		ParamValue::Bytes(bytes) => query.bind(bytes.as_slice()),
	}
}

/// Decodes rows into `(records, columns)`, trying candidate Rust types per
/// column value until one succeeds — the `sqlx::Any` analogue of the
/// original system inferring a column's type from the already-decoded
/// Python value rather than from static driver metadata.
fn decode_rows(rows: &[AnyRow]) -> (Vec<Record>, Vec<ColumnMetadata>)
{
	let mut records = Vec::with_capacity(rows.len());
	let mut columns: Vec<ColumnMetadata> = Vec::new();

	for row in rows {
		let mut record = Record::new();

		for (index, column) in row.columns().iter().enumerate() {
			let name = column.name().to_owned();
			let (value, type_name, type_code) = decode_any_value(row, index);

			if columns.iter().all(|c| c.name != name) {
				columns.push(ColumnMetadata {
					name: name.clone(),
					type_name: type_name.to_owned(),
					type_code,
					precision: 0,
					scale: 0,
					nullable: true,
					table_name: None,
				});
			}

			record.insert(name, value);
		}

		records.push(record);
	}

	(records, columns)
}

fn decode_any_value(row: &AnyRow, index: usize) -> (Json, &'static str, i32)
{
	let raw = row.try_get_raw(index);

	let Ok(raw) = raw else {
		return (Json::Null, "NULL", 0);
	};

	if raw.is_null() {
		return (Json::Null, "NULL", 0);
	}

	if let Ok(v) = row.try_get::<i64, _>(index) {
		return (Json::from(v), "INTEGER", 4);
	}
	if let Ok(v) = row.try_get::<f64, _>(index) {
		return (Json::from(v), "REAL", 7);
	}
	if let Ok(v) = row.try_get::<bool, _>(index) {
		return (Json::from(v), "BOOLEAN", 16);
	}
	if let Ok(v) = row.try_get::<String, _>(index) {
		return (Json::from(v), "VARCHAR", 12);
	}
	if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
		let array: Vec<Json> = v.into_iter().map(Json::from).collect();
		return (Json::Array(array), "BINARY", -2);
	}

	(Json::Null, "NULL", 0)
}

/// Converts a bound parameter into an owned `tiberius` value. Temporal
/// values go through their `Display` impl rather than `tiberius`'s
/// `time`/`chrono` feature flags, which this workspace doesn't enable —
/// the same text-based tradeoff the ODBC connector makes.
fn to_mssql_param(value: &super::params::ParamValue) -> Box<dyn ToSql + Send + Sync>
{
	use super::params::ParamValue;

	match value {
		ParamValue::Null => Box::new(Option::<String>::None),
		ParamValue::Bool(b) => Box::new(*b),
		ParamValue::Int(i) => Box::new(*i),
		ParamValue::Float(f) => Box::new(*f),
		ParamValue::Text(s) => Box::new(s.clone()),
		ParamValue::DateTime(dt) => Box::new(dt.to_string()),
		ParamValue::Date(date) => Box::new(date.to_string()),
		ParamValue::Bytes(bytes) => Box::new(bytes.clone()),
	}
}

/// Decodes `tiberius` rows into `(records, columns)`, trying candidate Rust
/// types per cell the same way [`decode_any_value`] does for `sqlx::Any`.
fn decode_mssql_rows(rows: &[TiberiusRow]) -> (Vec<Record>, Vec<ColumnMetadata>)
{
	let mut records = Vec::with_capacity(rows.len());
	let mut columns: Vec<ColumnMetadata> = Vec::new();

	for row in rows {
		let mut record = Record::new();

		for (index, column) in row.columns().iter().enumerate() {
			let name = column.name().to_owned();
			let (value, type_name, type_code) = decode_mssql_value(row, index);

			if columns.iter().all(|c| c.name != name) {
				columns.push(ColumnMetadata {
					name: name.clone(),
					type_name: type_name.to_owned(),
					type_code,
					precision: 0,
					scale: 0,
					nullable: true,
					table_name: None,
				});
			}

			record.insert(name, value);
		}

		records.push(record);
	}

	(records, columns)
}

fn decode_mssql_value(row: &TiberiusRow, index: usize) -> (Json, &'static str, i32)
{
	if let Ok(Some(v)) = row.try_get::<i64, _>(index) {
		return (Json::from(v), "BIGINT", -5);
	}
	if let Ok(Some(v)) = row.try_get::<i32, _>(index) {
		return (Json::from(v), "INTEGER", 4);
	}
	if let Ok(Some(v)) = row.try_get::<f64, _>(index) {
		return (Json::from(v), "FLOAT", 8);
	}
	if let Ok(Some(v)) = row.try_get::<bool, _>(index) {
		return (Json::from(v), "BIT", 16);
	}
	if let Ok(Some(v)) = row.try_get::<&str, _>(index) {
		return (Json::from(v), "NVARCHAR", 12);
	}
	if let Ok(Some(v)) = row.try_get::<&[u8], _>(index) {
		let array: Vec<Json> = v.iter().map(|b| Json::from(*b)).collect();
		return (Json::Array(array), "VARBINARY", -2);
	}

	(Json::Null, "NULL", 0)
}
