//! The AS/400 (IBM i) connector (C4): talks to a small out-of-process JDBC
//! bridge over stdio instead of embedding a JVM in-process (spec §4.4, §9).
//!
//! The system this core was distilled from loads the JT400 driver into an
//! embedded JVM via JNI and calls it directly; this workspace carries no
//! `jni` crate, and the specification's design notes explicitly sanction an
//! out-of-process helper as the idiomatic Rust alternative. The bridge is
//! any small JVM program speaking newline-delimited JSON on stdin/stdout:
//! one request object in, one response object out, per call. This
//! connector only knows the wire protocol, not the helper's implementation.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::params::{ParamValue, Params};
use super::policy::{self, LimitStyle};
use super::{Connector, ConnectionInfo, TableInfo};
use crate::error::{ConfigurationError, DatabaseError, Result};
use crate::metrics::ConnectionMetrics;
use crate::model::{ColumnMetadata, ConnectionConfig, QueryResult, Record};
use crate::sanitize::sanitize_error_message;

/// One request sent to the bridge process.
#[derive(Debug, Serialize)]
struct BridgeRequest<'a>
{
	op: &'a str,
	connection_id: &'a str,
	payload: Json,
}

/// One response read back from the bridge process.
#[derive(Debug, Deserialize)]
struct BridgeResponse
{
	ok: bool,
	result: Option<Json>,
	error: Option<String>,
}

struct BridgeProcess
{
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
}

pub struct As400Connector
{
	config: ConnectionConfig,
	bridge: Mutex<Option<BridgeProcess>>,
	metrics: ConnectionMetrics,
}

impl std::fmt::Debug for As400Connector
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("As400Connector").field("config", &self.config.name).finish_non_exhaustive()
	}
}

impl As400Connector
{
	pub fn new(config: ConnectionConfig) -> Self
	{
		Self { config, bridge: Mutex::new(None), metrics: ConnectionMetrics::new() }
	}

	fn jdbc_url(&self) -> String
	{
		let mut url = format!("jdbc:as400://{}", self.config.host.as_deref().unwrap_or("localhost"));
		if let Some(database) = &self.config.database {
			url.push('/');
			url.push_str(database);
		}
		url
	}

	fn sanitize(&self, message: impl AsRef<str>) -> String
	{
		sanitize_error_message(message.as_ref(), self.config.user.as_deref(), self.config.password.as_deref())
	}

	async fn call(&self, op: &str, payload: Json) -> Result<Json>
	{
		let mut guard = self.bridge.lock().await;
		let Some(bridge) = guard.as_mut() else {
			return Err(DatabaseError::new("as400 bridge is not connected").into());
		};

		let request = BridgeRequest { op, connection_id: &self.config.name, payload };
		let mut line = serde_json::to_string(&request)
			.map_err(|err| DatabaseError::with_source("failed to encode bridge request", err))?;
		line.push('\n');

		bridge
			.stdin
			.write_all(line.as_bytes())
			.await
			.map_err(|err| DatabaseError::with_source("failed to write to as400 bridge", err))?;
		bridge
			.stdin
			.flush()
			.await
			.map_err(|err| DatabaseError::with_source("failed to flush as400 bridge stdin", err))?;

		let mut response_line = String::new();
		let bytes_read = bridge
			.stdout
			.read_line(&mut response_line)
			.await
			.map_err(|err| DatabaseError::with_source("failed to read from as400 bridge", err))?;

		if bytes_read == 0 {
			return Err(DatabaseError::new("as400 bridge closed its stdout unexpectedly").into());
		}

		let response: BridgeResponse = serde_json::from_str(response_line.trim())
			.map_err(|err| DatabaseError::with_source("failed to decode bridge response", err))?;

		if !response.ok {
			return Err(DatabaseError::new(
				self.sanitize(response.error.unwrap_or_else(|| "unknown bridge error".to_owned())),
			)
			.into());
		}

		Ok(response.result.unwrap_or(Json::Null))
	}
}

impl Connector for As400Connector
{
	async fn connect(&mut self) -> Result<()>
	{
		let jar = self.config.as400_driver_jar.as_deref().ok_or_else(|| {
			ConfigurationError::new("as400_driver_jar is required for as400 connections")
		})?;

		let mut child = Command::new("java")
			.arg("-cp")
			.arg(jar)
			.arg("com.as400bridge.Main")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| DatabaseError::with_source("failed to spawn as400 bridge process", err))?;

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| DatabaseError::new("as400 bridge process has no stdin"))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| DatabaseError::new("as400 bridge process has no stdout"))?;

		*self.bridge.lock().await = Some(BridgeProcess { child, stdin, stdout: BufReader::new(stdout) });

		self.call(
			"connect",
			serde_json::json!({
				"url": self.jdbc_url(),
				"user": self.config.user,
				"password": self.config.password,
			}),
		)
		.await?;

		Ok(())
	}

	async fn disconnect(&mut self) -> Result<()>
	{
		let mut guard = self.bridge.lock().await;
		if let Some(mut bridge) = guard.take() {
			let _ = bridge.child.start_kill();
			let _ = bridge.child.wait().await;
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
		let expanded = policy::expand_bare_table_name(sql, limit, LimitStyle::FetchFirst);

		// Rewrite named placeholders to `?` before forwarding, same as
		// every other connector (spec §9 open question (b)).
		let (rewritten, names) = super::params::rewrite_named_placeholders(&expanded);
		let values = params.map(|p| super::params::ordered_values(&names, p)).transpose()?;

		let bound_params: Vec<Json> =
			values.unwrap_or_default().into_iter().map(param_to_bridge_json).collect();

		let start = OffsetDateTime::now_utc();
		let result = self
			.call("execute_query", serde_json::json!({ "sql": rewritten, "params": bound_params }))
			.await;
		let execution_time_ms =
			u64::try_from((OffsetDateTime::now_utc() - start).whole_milliseconds().max(0)).unwrap_or(u64::MAX);

		let result = match result {
			Ok(result) => {
				self.metrics
					.record_query(&self.config.name, &expanded, std::time::Duration::from_millis(execution_time_ms))
					.await;
				result
			},
			Err(err) => {
				self.metrics.record_failure().await;
				return Err(err);
			},
		};

		let (records, columns) = decode_bridge_rows(&result)?;
		let row_count = records.len();

		Ok(QueryResult {
			query: expanded,
			connection_id: self.config.name.clone(),
			executed_at: OffsetDateTime::now_utc(),
			records,
			columns,
			row_count,
			execution_time_ms,
			truncated: limit.is_some_and(|limit| row_count as u64 >= limit),
			has_error: false,
			error_message: None,
			mapped_fields: None,
		})
	}

	async fn get_tables(&mut self, schema: Option<&str>) -> Result<Vec<TableInfo>>
	{
		let result = self.call("get_tables", serde_json::json!({ "schema": schema })).await?;

		let Json::Array(entries) = result else {
			return Ok(Vec::new());
		};

		Ok(entries
			.into_iter()
			.filter_map(|entry| {
				let name = entry.get("name")?.as_str()?.to_owned();
				let schema = entry.get("schema").and_then(Json::as_str).map(str::to_owned);
				Some(TableInfo { name, schema })
			})
			.collect())
	}

	async fn get_table_columns(
		&mut self,
		table: &str,
		schema: Option<&str>,
	) -> Result<Vec<ColumnMetadata>>
	{
		let result = self
			.call("get_table_columns", serde_json::json!({ "table": table, "schema": schema }))
			.await?;

		let Json::Array(entries) = result else {
			return Ok(Vec::new());
		};

		Ok(entries.into_iter().filter_map(decode_bridge_column).collect())
	}

	async fn test_connection(&mut self) -> (bool, Option<String>)
	{
		let was_connected = self.bridge.lock().await.is_some();

		if !was_connected && self.connect().await.is_err() {
			return (false, Some("failed to connect".to_owned()));
		}

		let result = self.execute_query("SELECT 1 FROM SYSIBM.SYSDUMMY1", None, None).await;

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
			connected: self.bridge.try_lock().map(|guard| guard.is_some()).unwrap_or(true),
		}
	}

	async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot
	{
		self.metrics.snapshot().await
	}
}

fn param_to_bridge_json(value: ParamValue) -> Json
{
	match value {
		ParamValue::Null => Json::Null,
		ParamValue::Bool(b) => Json::from(b),
		ParamValue::Int(i) => Json::from(i),
		ParamValue::Float(f) => Json::from(f),
		ParamValue::Text(s) => Json::from(s),
		ParamValue::DateTime(dt) => Json::from(dt.to_string()),
		ParamValue::Date(date) => Json::from(date.to_string()),
		ParamValue::Bytes(bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
	}
}

/// Decodes the bridge's `{columns: [...], rows: [...]}` payload. Column
/// type codes follow `java.sql.Types`, the same codes JT400 reports them
/// as, so callers comparing `type_code` against JDBC constants see
/// consistent values regardless of connector.
fn decode_bridge_rows(result: &Json) -> Result<(Vec<Record>, Vec<ColumnMetadata>)>
{
	let columns: Vec<ColumnMetadata> = result
		.get("columns")
		.and_then(Json::as_array)
		.map(|entries| entries.iter().cloned().filter_map(decode_bridge_column).collect())
		.unwrap_or_default();

	let rows = result
		.get("rows")
		.and_then(Json::as_array)
		.ok_or_else(|| DatabaseError::new("bridge response missing \"rows\""))?;

	let records = rows
		.iter()
		.map(|row| {
			let mut record = Record::new();
			if let Json::Object(map) = row {
				for (key, value) in map {
					record.insert(key.clone(), value.clone());
				}
			}
			record
		})
		.collect();

	Ok((records, columns))
}

fn decode_bridge_column(entry: Json) -> Option<ColumnMetadata>
{
	Some(ColumnMetadata {
		name: entry.get("name")?.as_str()?.to_owned(),
		type_name: entry.get("type_name").and_then(Json::as_str).unwrap_or("VARCHAR").to_owned(),
		type_code: i32::try_from(entry.get("type_code").and_then(Json::as_i64).unwrap_or(12)).unwrap_or(i32::MAX),
		precision: u32::try_from(entry.get("precision").and_then(Json::as_u64).unwrap_or(0)).unwrap_or(u32::MAX),
		scale: u32::try_from(entry.get("scale").and_then(Json::as_u64).unwrap_or(0)).unwrap_or(u32::MAX),
		nullable: entry.get("nullable").and_then(Json::as_bool).unwrap_or(true),
		table_name: entry.get("table_name").and_then(Json::as_str).map(str::to_owned),
	})
}
