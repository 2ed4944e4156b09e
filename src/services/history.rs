//! The History Manager (C9): scheduled periodic captures of saved
//! queries into snapshot storage (spec §4.10).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value as Json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connector::params::{ParamValue, Params};
use crate::error::{DatabaseError, Result};
use crate::model::{HistoryEntry, HistorySchedule, HistoryStatus};
use crate::registry::ConnectionRegistry;

const CREATE_SCHEDULES_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_history_schedules ( \
	id TEXT PRIMARY KEY, connection_id TEXT NOT NULL, query_id TEXT NOT NULL, name TEXT NOT NULL, \
	description TEXT, frequency TEXT NOT NULL, retention_days INTEGER NOT NULL, active INTEGER NOT NULL, \
	last_run TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL)";

const CREATE_ENTRIES_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_history_entries ( \
	id TEXT PRIMARY KEY, schedule_id TEXT NOT NULL REFERENCES db_history_schedules(id) ON DELETE CASCADE, \
	connection_id TEXT NOT NULL, query_id TEXT NOT NULL, table_name TEXT, collected_at TEXT NOT NULL, \
	snapshot_id TEXT NOT NULL, record_count INTEGER NOT NULL, status TEXT NOT NULL, error_message TEXT)";

const CREATE_DATA_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_history_data ( \
	id TEXT PRIMARY KEY, snapshot_id TEXT NOT NULL, records TEXT NOT NULL, schema TEXT NOT NULL, \
	created_at TEXT NOT NULL)";

/// Seconds per frequency-grammar unit (spec §4.10 invariant 5).
fn unit_seconds(unit: char) -> Option<u64>
{
	match unit {
		's' => Some(1),
		'm' => Some(60),
		'h' => Some(3_600),
		'd' => Some(86_400),
		'w' => Some(604_800),
		_ => None,
	}
}

/// Parses `^\d+[smhdw]$` into a duration, or `None` for anything else.
pub fn parse_frequency(frequency: &str) -> Option<Duration>
{
	let mut chars = frequency.chars();
	let unit = chars.next_back()?;
	let digits = chars.as_str();

	if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
		return None;
	}

	let count: u64 = digits.parse().ok()?;
	let seconds = unit_seconds(unit)?;

	Some(Duration::from_secs(count * seconds))
}

struct RunningSchedule
{
	cancellation: CancellationToken,
	handle: JoinHandle<()>,
}

/// Owns one cooperative task per active [`HistorySchedule`] (spec §4.10).
pub struct HistoryManager
{
	registry: Arc<ConnectionRegistry>,
	connection_name: Option<String>,
	initialized: AtomicBool,
	running: Mutex<HashMap<Uuid, RunningSchedule>>,
}

impl std::fmt::Debug for HistoryManager
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("HistoryManager")
			.field("connection_name", &self.connection_name)
			.field("initialized", &self.initialized.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl HistoryManager
{
	pub fn new(registry: Arc<ConnectionRegistry>, connection_name: Option<String>) -> Self
	{
		Self { registry, connection_name, initialized: AtomicBool::new(false), running: Mutex::new(HashMap::new()) }
	}

	pub fn is_initialized(&self) -> bool
	{
		self.initialized.load(Ordering::Relaxed)
	}

	pub fn connection_name(&self) -> Option<&str>
	{
		self.connection_name.as_deref()
	}

	/// Only runs when a history connection is configured (spec §4.10:
	/// "only when a `history.connection_id` is configured and
	/// registered").
	pub async fn initialize(self: &Arc<Self>)
	{
		let Some(connection_name) = self.connection_name.clone() else {
			return;
		};

		let result = async {
			self.registry.execute_query(&connection_name, CREATE_SCHEDULES_TABLE, None, None).await?;
			self.registry.execute_query(&connection_name, CREATE_ENTRIES_TABLE, None, None).await?;
			self.registry.execute_query(&connection_name, CREATE_DATA_TABLE, None, None).await
		}
		.await;

		if let Err(err) = result {
			tracing::warn!(connection_name, error = %err, "history manager table creation failed; feature disabled");
			return;
		}

		self.initialized.store(true, Ordering::Relaxed);

		if let Ok(schedules) = self.list_schedules(None).await {
			for schedule in schedules.into_iter().filter(|schedule| schedule.active) {
				Self::start_schedule(Arc::clone(self), schedule).await;
			}
		}
	}

	fn require_initialized(&self) -> Result<&str>
	{
		match &self.connection_name {
			Some(name) if self.is_initialized() => Ok(name.as_str()),
			_ => Err(DatabaseError::new("history manager is not initialized").into()),
		}
	}

	pub async fn create_schedule(
		&self,
		connection_id: &str,
		query_id: &str,
		name: &str,
		description: Option<&str>,
		frequency: &str,
		retention_days: u32,
	) -> Result<HistorySchedule>
	{
		let connection_name = self.require_initialized()?;

		if parse_frequency(frequency).is_none() {
			return Err(crate::error::ConfigurationError::new(format!("invalid frequency {frequency:?}")).into());
		}

		let id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();

		let params = Params::from([
			("id".to_owned(), ParamValue::Text(id.to_string())),
			("connection_id".to_owned(), ParamValue::Text(connection_id.to_owned())),
			("query_id".to_owned(), ParamValue::Text(query_id.to_owned())),
			("name".to_owned(), ParamValue::Text(name.to_owned())),
			("description".to_owned(), param_nullable_text(description)),
			("frequency".to_owned(), ParamValue::Text(frequency.to_owned())),
			("retention_days".to_owned(), ParamValue::Int(i64::from(retention_days))),
			("created_at".to_owned(), ParamValue::DateTime(now)),
			("updated_at".to_owned(), ParamValue::DateTime(now)),
		]);
		self.registry
			.execute_query(
				connection_name,
				"INSERT INTO db_history_schedules (id, connection_id, query_id, name, description, frequency, \
				 retention_days, active, last_run, created_at, updated_at) VALUES \
				 (:id, :connection_id, :query_id, :name, :description, :frequency, :retention_days, 1, NULL, \
				 :created_at, :updated_at)",
				Some(&params),
				None,
			)
			.await?;

		Ok(HistorySchedule {
			id,
			connection_id: connection_id.to_owned(),
			query_id: query_id.to_owned(),
			name: name.to_owned(),
			description: description.map(str::to_owned),
			frequency: frequency.to_owned(),
			retention_days,
			active: true,
			last_run: None,
			created_at: now,
			updated_at: now,
		})
	}

	pub async fn list_schedules(&self, connection_id: Option<&str>) -> Result<Vec<HistorySchedule>>
	{
		let connection_name = self.require_initialized()?;

		let (sql, params) = match connection_id {
			Some(id) => (
				"SELECT * FROM db_history_schedules WHERE connection_id = :connection_id",
				Some(Params::from([("connection_id".to_owned(), ParamValue::Text(id.to_owned()))])),
			),
			None => ("SELECT * FROM db_history_schedules", None),
		};
		let result = self.registry.execute_query(connection_name, sql, params.as_ref(), None).await?;

		Ok(result.records.iter().filter_map(decode_schedule).collect())
	}

	/// Updates mutable fields of a schedule (spec §4.10: "Fail create/update
	/// with a descriptive message" for frequency; restarts the running task
	/// when the frequency or active flag changes).
	pub async fn update_schedule(
		self: &Arc<Self>,
		schedule_id: Uuid,
		name: Option<&str>,
		description: Option<Option<&str>>,
		frequency: Option<&str>,
		retention_days: Option<u32>,
		active: Option<bool>,
	) -> Result<HistorySchedule>
	{
		let connection_name = self.require_initialized()?;

		if let Some(frequency) = frequency {
			if parse_frequency(frequency).is_none() {
				return Err(crate::error::ConfigurationError::new(format!("invalid frequency {frequency:?}")).into());
			}
		}

		let existing = self
			.list_schedules(None)
			.await?
			.into_iter()
			.find(|schedule| schedule.id == schedule_id)
			.ok_or_else(|| DatabaseError::new(format!("no history schedule with id {schedule_id}")))?;

		let name = name.map(str::to_owned).unwrap_or_else(|| existing.name.clone());
		let description = description.map(|d| d.map(str::to_owned)).unwrap_or_else(|| existing.description.clone());
		let frequency = frequency.map(str::to_owned).unwrap_or_else(|| existing.frequency.clone());
		let retention_days = retention_days.unwrap_or(existing.retention_days);
		let active = active.unwrap_or(existing.active);
		let now = OffsetDateTime::now_utc();

		let params = Params::from([
			("id".to_owned(), ParamValue::Text(schedule_id.to_string())),
			("name".to_owned(), ParamValue::Text(name.clone())),
			("description".to_owned(), param_nullable_text(description.as_deref())),
			("frequency".to_owned(), ParamValue::Text(frequency.clone())),
			("retention_days".to_owned(), ParamValue::Int(i64::from(retention_days))),
			("active".to_owned(), ParamValue::Int(i64::from(active))),
			("updated_at".to_owned(), ParamValue::DateTime(now)),
		]);
		self.registry
			.execute_query(
				connection_name,
				"UPDATE db_history_schedules SET name = :name, description = :description, \
				 frequency = :frequency, retention_days = :retention_days, active = :active, \
				 updated_at = :updated_at WHERE id = :id",
				Some(&params),
				None,
			)
			.await?;

		let updated = HistorySchedule { name, description, frequency, retention_days, active, updated_at: now, ..existing };

		let mut running = self.running.lock().await;
		if let Some(running_schedule) = running.remove(&schedule_id) {
			running_schedule.cancellation.cancel();
			let _ = running_schedule.handle.await;
		}
		drop(running);
		if updated.active {
			Self::start_schedule(Arc::clone(self), updated.clone()).await;
		}

		Ok(updated)
	}

	/// Stops a running task (if any) and removes the schedule row (spec
	/// §4.10, mirrors `delete_rule`'s existence check).
	pub async fn delete_schedule(self: &Arc<Self>, schedule_id: Uuid) -> Result<bool>
	{
		let connection_name = self.require_initialized()?;

		let exists = self.list_schedules(None).await?.into_iter().any(|schedule| schedule.id == schedule_id);
		if !exists {
			return Ok(false);
		}

		let mut running = self.running.lock().await;
		if let Some(running_schedule) = running.remove(&schedule_id) {
			running_schedule.cancellation.cancel();
			let _ = running_schedule.handle.await;
		}
		drop(running);

		let params = Params::from([("id".to_owned(), ParamValue::Text(schedule_id.to_string()))]);
		self.registry
			.execute_query(connection_name, "DELETE FROM db_history_schedules WHERE id = :id", Some(&params), None)
			.await?;
		Ok(true)
	}

	async fn start_schedule(manager: Arc<Self>, schedule: HistorySchedule)
	{
		let Some(interval) = parse_frequency(&schedule.frequency) else {
			return;
		};

		let cancellation = CancellationToken::new();
		let token = cancellation.clone();
		let schedule_id = schedule.id;

		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					() = token.cancelled() => break,
					_ = tokio::time::sleep(interval) => {},
				}

				if token.is_cancelled() {
					break;
				}

				if let Err(err) = manager.execute_schedule_now(&schedule).await {
					tracing::warn!(schedule_id = %schedule_id, error = %err, "history schedule run failed");
				}
				if let Err(err) = manager.cleanup_old_data(&schedule).await {
					tracing::warn!(schedule_id = %schedule_id, error = %err, "history cleanup failed");
				}
			}
		});

		self.running.lock().await.insert(schedule_id, RunningSchedule { cancellation, handle });
	}

	/// Runs one snapshot immediately: fetches the saved query, executes
	/// it against the data connection, writes one [`HistoryEntry`] plus
	/// (on success) one [`crate::model::HistoryData`] row.
	pub async fn execute_schedule_now(&self, schedule: &HistorySchedule) -> Result<HistoryEntry>
	{
		let connection_name = self.require_initialized()?;

		let saved_query_params =
			Params::from([("query_id".to_owned(), ParamValue::Text(schedule.query_id.clone()))]);
		let saved_query = self
			.registry
			.execute_query(
				connection_name,
				"SELECT query_text FROM db_saved_queries WHERE id = :query_id",
				Some(&saved_query_params),
				None,
			)
			.await?;
		let query_text = saved_query
			.records
			.first()
			.and_then(|record| record.get("query_text"))
			.and_then(Json::as_str)
			.map(str::to_owned);

		let snapshot_id = Uuid::new_v4();
		let entry_id = Uuid::new_v4();
		let collected_at = OffsetDateTime::now_utc();

		let outcome = match query_text {
			Some(query_text) => {
				self.registry.execute_query(&schedule.connection_id, &query_text, None, None).await
			},
			None => Err(DatabaseError::new(format!("no saved query with id {}", schedule.query_id)).into()),
		};

		let (status, record_count, error_message) = match &outcome {
			Ok(result) => (HistoryStatus::Success, result.row_count, None),
			Err(err) => (HistoryStatus::Error, 0, Some(err.to_string())),
		};

		if let Ok(result) = &outcome {
			let records_json = serde_json::to_string(&result.records)
				.map_err(|err| DatabaseError::with_source("failed to encode snapshot records", err))?;
			let schema_json = serde_json::to_string(&result.columns)
				.map_err(|err| DatabaseError::with_source("failed to encode snapshot schema", err))?;

			let data_params = Params::from([
				("id".to_owned(), ParamValue::Text(Uuid::new_v4().to_string())),
				("snapshot_id".to_owned(), ParamValue::Text(snapshot_id.to_string())),
				("records".to_owned(), ParamValue::Text(records_json)),
				("schema".to_owned(), ParamValue::Text(schema_json)),
				("created_at".to_owned(), ParamValue::DateTime(collected_at)),
			]);
			self.registry
				.execute_query(
					connection_name,
					"INSERT INTO db_history_data (id, snapshot_id, records, schema, created_at) VALUES \
					 (:id, :snapshot_id, :records, :schema, :created_at)",
					Some(&data_params),
					None,
				)
				.await?;
		}

		let status_text = match status {
			HistoryStatus::Success => "success",
			HistoryStatus::Error => "error",
		};
		let entry_params = Params::from([
			("id".to_owned(), ParamValue::Text(entry_id.to_string())),
			("schedule_id".to_owned(), ParamValue::Text(schedule.id.to_string())),
			("connection_id".to_owned(), ParamValue::Text(schedule.connection_id.clone())),
			("query_id".to_owned(), ParamValue::Text(schedule.query_id.clone())),
			("collected_at".to_owned(), ParamValue::DateTime(collected_at)),
			("snapshot_id".to_owned(), ParamValue::Text(snapshot_id.to_string())),
			("record_count".to_owned(), ParamValue::Int(i64::try_from(record_count).unwrap_or(i64::MAX))),
			("status".to_owned(), ParamValue::Text(status_text.to_owned())),
			("error_message".to_owned(), param_nullable_text(error_message.as_deref())),
		]);
		self.registry
			.execute_query(
				connection_name,
				"INSERT INTO db_history_entries (id, schedule_id, connection_id, query_id, table_name, \
				 collected_at, snapshot_id, record_count, status, error_message) VALUES \
				 (:id, :schedule_id, :connection_id, :query_id, NULL, :collected_at, :snapshot_id, \
				 :record_count, :status, :error_message)",
				Some(&entry_params),
				None,
			)
			.await?;

		Ok(HistoryEntry {
			id: entry_id,
			schedule_id: schedule.id,
			connection_id: schedule.connection_id.clone(),
			query_id: schedule.query_id.clone(),
			table_name: None,
			collected_at,
			snapshot_id,
			record_count,
			status,
			error_message,
		})
	}

	/// Deletes every entry (and its data) older than `retention_days`
	/// (spec §4.10, §8 invariant 6).
	pub async fn cleanup_old_data(&self, schedule: &HistorySchedule) -> Result<()>
	{
		let connection_name = self.require_initialized()?;
		let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(schedule.retention_days));

		let scope_params = Params::from([
			("schedule_id".to_owned(), ParamValue::Text(schedule.id.to_string())),
			("cutoff".to_owned(), ParamValue::DateTime(cutoff)),
		]);
		let stale = self
			.registry
			.execute_query(
				connection_name,
				"SELECT snapshot_id FROM db_history_entries WHERE schedule_id = :schedule_id AND collected_at < \
				 :cutoff",
				Some(&scope_params),
				None,
			)
			.await?;

		for record in &stale.records {
			if let Some(snapshot_id) = record.get("snapshot_id").and_then(Json::as_str) {
				let params = Params::from([("snapshot_id".to_owned(), ParamValue::Text(snapshot_id.to_owned()))]);
				self.registry
					.execute_query(
						connection_name,
						"DELETE FROM db_history_data WHERE snapshot_id = :snapshot_id",
						Some(&params),
						None,
					)
					.await?;
			}
		}

		self.registry
			.execute_query(
				connection_name,
				"DELETE FROM db_history_entries WHERE schedule_id = :schedule_id AND collected_at < :cutoff",
				Some(&scope_params),
				None,
			)
			.await?;

		Ok(())
	}

	pub async fn get_history_entries(&self, schedule_id: Uuid) -> Result<Vec<HistoryEntry>>
	{
		let connection_name = self.require_initialized()?;
		let params = Params::from([("schedule_id".to_owned(), ParamValue::Text(schedule_id.to_string()))]);
		let result = self
			.registry
			.execute_query(
				connection_name,
				"SELECT * FROM db_history_entries WHERE schedule_id = :schedule_id",
				Some(&params),
				None,
			)
			.await?;
		Ok(result.records.iter().filter_map(decode_entry).collect())
	}

	pub async fn get_history_data(&self, snapshot_id: Uuid) -> Result<Option<Json>>
	{
		let connection_name = self.require_initialized()?;
		let params = Params::from([("snapshot_id".to_owned(), ParamValue::Text(snapshot_id.to_string()))]);
		let result = self
			.registry
			.execute_query(
				connection_name,
				"SELECT records FROM db_history_data WHERE snapshot_id = :snapshot_id",
				Some(&params),
				None,
			)
			.await?;

		Ok(result
			.records
			.first()
			.and_then(|record| record.get("records"))
			.and_then(Json::as_str)
			.and_then(|text| serde_json::from_str(text).ok()))
	}

	pub async fn delete_history_data(&self, snapshot_id: Uuid) -> Result<()>
	{
		let connection_name = self.require_initialized()?;
		let params = Params::from([("snapshot_id".to_owned(), ParamValue::Text(snapshot_id.to_string()))]);
		self.registry
			.execute_query(
				connection_name,
				"DELETE FROM db_history_data WHERE snapshot_id = :snapshot_id",
				Some(&params),
				None,
			)
			.await?;
		Ok(())
	}

	/// Cancels every running schedule's token and awaits its `JoinHandle`
	/// (spec §4.10).
	pub async fn shutdown(&self)
	{
		let mut running = self.running.lock().await;
		for (_, schedule) in running.drain() {
			schedule.cancellation.cancel();
			let _ = schedule.handle.await;
		}
	}
}

fn param_nullable_text(value: Option<&str>) -> ParamValue
{
	match value {
		Some(text) => ParamValue::Text(text.to_owned()),
		None => ParamValue::Null,
	}
}

fn decode_schedule(record: &crate::model::Record) -> Option<HistorySchedule>
{
	Some(HistorySchedule {
		id: record.get("id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		connection_id: record.get("connection_id")?.as_str()?.to_owned(),
		query_id: record.get("query_id")?.as_str()?.to_owned(),
		name: record.get("name")?.as_str()?.to_owned(),
		description: record.get("description").and_then(Json::as_str).map(str::to_owned),
		frequency: record.get("frequency")?.as_str()?.to_owned(),
		retention_days: u32::try_from(record.get("retention_days")?.as_u64()?).unwrap_or(u32::MAX),
		active: truthy(record.get("active")),
		last_run: record.get("last_run").and_then(Json::as_str).and_then(parse_rfc3339),
		created_at: record.get("created_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
		updated_at: record.get("updated_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
	})
}

fn decode_entry(record: &crate::model::Record) -> Option<HistoryEntry>
{
	Some(HistoryEntry {
		id: record.get("id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		schedule_id: record.get("schedule_id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		connection_id: record.get("connection_id")?.as_str()?.to_owned(),
		query_id: record.get("query_id")?.as_str()?.to_owned(),
		table_name: record.get("table_name").and_then(Json::as_str).map(str::to_owned),
		collected_at: record.get("collected_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
		snapshot_id: record.get("snapshot_id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		record_count: usize::try_from(record.get("record_count")?.as_u64()?).unwrap_or(usize::MAX),
		status: match record.get("status")?.as_str()? {
			"success" => HistoryStatus::Success,
			_ => HistoryStatus::Error,
		},
		error_message: record.get("error_message").and_then(Json::as_str).map(str::to_owned),
	})
}

fn truthy(value: Option<&Json>) -> bool
{
	match value {
		Some(Json::Bool(b)) => *b,
		Some(Json::Number(n)) => n.as_i64().unwrap_or(0) != 0,
		_ => false,
	}
}

fn parse_rfc3339(text: &str) -> Option<OffsetDateTime>
{
	OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339).ok()
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_frequency_grammar()
	{
		assert_eq!(parse_frequency("30s"), Some(Duration::from_secs(30)));
		assert_eq!(parse_frequency("5m"), Some(Duration::from_secs(300)));
		assert_eq!(parse_frequency("2h"), Some(Duration::from_secs(7_200)));
		assert_eq!(parse_frequency("1d"), Some(Duration::from_secs(86_400)));
		assert_eq!(parse_frequency("1w"), Some(Duration::from_secs(604_800)));
		assert_eq!(parse_frequency("bogus"), None);
		assert_eq!(parse_frequency("5x"), None);
		assert_eq!(parse_frequency(""), None);
	}
}
