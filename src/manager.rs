//! The Database Manager (C7 + C11): the crate's public entry point,
//! wiring the connection registry to the three feature services and
//! routing `execute_query` through the field-mapping pre/post step
//! (spec §4.7, §6).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::config::Config;
use crate::connector::params::Params;
use crate::connector::{ConnectionInfo, TableInfo};
use crate::error::Result;
use crate::model::{
	ColumnMetadata, ConnectionConfig, FieldMapping, HistoryEntry, HistorySchedule, QueryResult, Record,
	ValidationResult, ValidationRule, ValidationRuleType,
};
use crate::registry::{ConnectionRegistry, ConnectionStatus, DEFAULT_CONNECTION};
use crate::session::Session;
use crate::services::field_mapper::FieldMapper;
use crate::services::history::HistoryManager;
use crate::services::validation::ValidationEngine;

static FROM_TABLE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)FROM\s+([^\s,;()]+)").unwrap_or_else(|err| {
		panic!("hard-coded FROM-clause pattern should be valid\n{err}");
	}));

/// Extracts the first `FROM <table>` target, quoting stripped (spec §4.7).
fn extract_table_name(query: &str) -> Option<String>
{
	let captures = FROM_TABLE.captures(query)?;
	let raw = captures.get(1)?.as_str();
	Some(raw.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']').to_owned())
}

/// Aggregate status payload for `DatabaseManager::status()` (spec §6),
/// supplementing the per-connection metrics with each feature service's
/// initialization state.
#[derive(Debug, Clone)]
pub struct ManagerStatus
{
	pub connections: Vec<ConnectionStatus>,
	pub field_mapper_initialized: bool,
	pub history_initialized: bool,
	pub validation_initialized: bool,
}

/// The crate's public entry point: owns the connection registry and the
/// three feature services, and implements the query dispatcher (C7) that
/// layers field mapping on top of raw connector execution.
pub struct DatabaseManager
{
	registry: Arc<ConnectionRegistry>,
	field_mapper: FieldMapper,
	history: Arc<HistoryManager>,
	validation: ValidationEngine,
	mapping_enabled: bool,
	history_enabled: bool,
	validation_enabled: bool,
}

impl std::fmt::Debug for DatabaseManager
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("DatabaseManager").finish_non_exhaustive()
	}
}

impl DatabaseManager
{
	/// Builds a manager from `config`, wiring the Field Mapper, History
	/// Manager, and Validation Engine to whichever connections their
	/// respective `*.connection_id` settings name (spec §4.9–§4.11). Does
	/// not register any connection or run any service's `initialize` — call
	/// [`Self::start`] for that.
	pub fn new(config: &Config) -> Self
	{
		let registry = Arc::new(ConnectionRegistry::new());
		let database = &config.database;

		let mapping_connection =
			database.field_mapping.connection_id.clone().unwrap_or_else(|| DEFAULT_CONNECTION.to_owned());
		let history_connection =
			database.history.enabled.then(|| database.history.connection_id.clone()).flatten();
		let validation_connection =
			database.validation.enabled.then(|| database.validation.connection_id.clone()).flatten();

		Self {
			field_mapper: FieldMapper::new(Arc::clone(&registry), mapping_connection),
			history: Arc::new(HistoryManager::new(Arc::clone(&registry), history_connection)),
			validation: ValidationEngine::new(Arc::clone(&registry), validation_connection),
			mapping_enabled: database.field_mapping.enabled,
			history_enabled: database.history.enabled,
			validation_enabled: database.validation.enabled,
			registry,
		}
	}

	/// Registers the `"default"` connection described by `config`, then
	/// initializes whichever feature services are enabled (spec §6, §11).
	pub async fn start(&self, config: &Config) -> Result<()>
	{
		self.registry.register(config.database.default_connection_config()).await?;

		if self.mapping_enabled {
			self.field_mapper.initialize().await;
		}
		if self.history_enabled {
			self.history.initialize().await;
		}
		if self.validation_enabled {
			self.validation.initialize().await;
		}

		Ok(())
	}

	/// Cancels every running history schedule and disconnects every
	/// registered connection (spec §4.10, §5).
	pub async fn shutdown(&self)
	{
		self.history.shutdown().await;
		self.registry.shutdown().await;
	}

	/// Compares `new` against `previous` and logs a warning for every
	/// differing field without applying any of the changes live (spec §6).
	pub fn on_config_changed(&self, previous: &Config, new: &Config)
	{
		crate::config::on_config_changed(previous, new);
	}

	// --- Connection lifecycle ------------------------------------------

	pub async fn register_connection(&self, config: ConnectionConfig) -> Result<()>
	{
		self.registry.register(config).await
	}

	pub async fn unregister_connection(&self, name: &str) -> Result<bool>
	{
		self.registry.unregister(name).await
	}

	pub async fn has_connection(&self, name: &str) -> bool
	{
		self.registry.has_connection(name).await
	}

	pub async fn get_connection_names(&self) -> Vec<String>
	{
		self.registry.connection_names().await
	}

	pub async fn acquire_session(&self, name: Option<&str>) -> Result<Session>
	{
		self.registry.acquire_session(name.unwrap_or(DEFAULT_CONNECTION)).await
	}

	pub async fn connection_info(&self, name: Option<&str>) -> Result<ConnectionInfo>
	{
		self.registry.connection_info(name.unwrap_or(DEFAULT_CONNECTION)).await
	}

	// --- Query execution --------------------------------------------------

	/// Convenience wrapper over [`Self::execute_raw`] for a parameterless
	/// statement (spec §6: `execute(statement, name?)`).
	pub async fn execute(&self, statement: &str, name: Option<&str>) -> Result<Vec<Record>>
	{
		self.execute_raw(statement, None, name, None).await
	}

	/// Executes `sql` and returns only the rows, applying the
	/// caller-supplied row limit if the connector doesn't already see one
	/// in the text (spec §6).
	pub async fn execute_raw(
		&self,
		sql: &str,
		params: Option<&Params>,
		name: Option<&str>,
		limit: Option<u64>,
	) -> Result<Vec<Record>>
	{
		let name = name.unwrap_or(DEFAULT_CONNECTION);
		let result = self.registry.execute_query(name, sql, params, limit).await?;
		Ok(result.records)
	}

	/// The query dispatcher (C7): resolves the connection, optionally
	/// rewrites the query and the result through the Field Mapper, and
	/// delegates execution to the connector (spec §4.7).
	pub async fn execute_query(
		&self,
		sql: &str,
		params: Option<&Params>,
		name: Option<&str>,
		limit: Option<u64>,
		apply_mapping: bool,
	) -> Result<QueryResult>
	{
		let name = name.unwrap_or(DEFAULT_CONNECTION);

		let mapping = if apply_mapping && self.field_mapper.is_initialized() {
			self.resolve_mapping(name, sql).await
		} else {
			None
		};

		let rewritten = match &mapping {
			Some(mapping) => FieldMapper::apply_mapping_to_query(sql, mapping),
			None => sql.to_owned(),
		};

		let mut result = self.registry.execute_query(name, &rewritten, params, limit).await?;

		if let Some(mapping) = &mapping {
			FieldMapper::apply_mapping_to_results(&mut result, mapping);
		}

		Ok(result)
	}

	/// Looks up the mapping for the query's target table, but only when
	/// `name`'s own [`ConnectionConfig`] has `mapping_enabled` set; failures
	/// degrade to "no mapping" with a warning rather than propagating (spec
	/// §4.7 mirrors the original's "log and use the original query" path).
	async fn resolve_mapping(&self, name: &str, sql: &str) -> Option<FieldMapping>
	{
		let config = self.registry.connection_config(name).await.ok()?;
		if !config.mapping_enabled {
			return None;
		}

		let table_name = extract_table_name(sql)?;
		match self.field_mapper.get_mapping(name, &table_name).await {
			Ok(mapping) => mapping,
			Err(err) => {
				tracing::warn!(connection_name = name, error = %err, "error resolving field mapping; using original query");
				None
			},
		}
	}

	pub async fn get_tables(&self, name: Option<&str>, schema: Option<&str>) -> Result<Vec<TableInfo>>
	{
		self.registry.get_tables(name.unwrap_or(DEFAULT_CONNECTION), schema).await
	}

	pub async fn get_table_columns(
		&self,
		table: &str,
		name: Option<&str>,
		schema: Option<&str>,
	) -> Result<Vec<ColumnMetadata>>
	{
		self.registry.get_table_columns(name.unwrap_or(DEFAULT_CONNECTION), table, schema).await
	}

	pub async fn check_connection(&self, name: Option<&str>) -> bool
	{
		self.registry.test_connection(name.unwrap_or(DEFAULT_CONNECTION)).await.map(|(ok, _)| ok).unwrap_or(false)
	}

	/// Ensures the management tables for whichever feature services target
	/// `name` exist (there is no schema-migration/ORM layer in this core —
	/// ambient table bootstrap is all `create_tables` covers here).
	pub async fn create_tables(&self, name: Option<&str>) -> Result<()>
	{
		let name = name.unwrap_or(DEFAULT_CONNECTION);

		if self.mapping_enabled && self.field_mapper.connection_name() == name {
			self.field_mapper.initialize().await;
		}
		if self.validation_enabled && self.validation.connection_name() == Some(name) {
			self.validation.initialize().await;
		}
		if self.history_enabled && self.history.connection_name() == Some(name) {
			self.history.initialize().await;
		}

		Ok(())
	}

	pub async fn status(&self) -> ManagerStatus
	{
		ManagerStatus {
			connections: self.registry.status().await,
			field_mapper_initialized: self.field_mapper.is_initialized(),
			history_initialized: self.history.is_initialized(),
			validation_initialized: self.validation.is_initialized(),
		}
	}

	// --- Field Mapper (C8) -------------------------------------------------

	pub async fn create_mapping(
		&self,
		connection_id: &str,
		table_name: &str,
		description: Option<&str>,
		fields: &HashMap<String, String>,
	) -> Result<FieldMapping>
	{
		self.field_mapper.create_mapping(connection_id, table_name, description, fields).await
	}

	pub async fn update_mapping(
		&self,
		id: Uuid,
		description: Option<&str>,
		fields: &HashMap<String, String>,
	) -> Result<FieldMapping>
	{
		self.field_mapper.update_mapping(id, description, fields).await
	}

	pub async fn delete_mapping(&self, id: Uuid) -> Result<bool>
	{
		self.field_mapper.delete_mapping(id).await
	}

	pub async fn get_mapping(&self, connection_id: &str, table_name: &str) -> Result<Option<FieldMapping>>
	{
		self.field_mapper.get_mapping(connection_id, table_name).await
	}

	pub async fn get_all_mappings(&self, connection_id: Option<&str>) -> Result<Vec<FieldMapping>>
	{
		self.field_mapper.get_all_mappings(connection_id).await
	}

	// --- History Manager (C9) ----------------------------------------------

	pub async fn create_history_schedule(
		&self,
		connection_id: &str,
		query_id: &str,
		name: &str,
		description: Option<&str>,
		frequency: &str,
		retention_days: u32,
	) -> Result<HistorySchedule>
	{
		self.history.create_schedule(connection_id, query_id, name, description, frequency, retention_days).await
	}

	pub async fn get_history_schedules(&self, connection_id: Option<&str>) -> Result<Vec<HistorySchedule>>
	{
		self.history.list_schedules(connection_id).await
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn update_history_schedule(
		&self,
		schedule_id: Uuid,
		name: Option<&str>,
		description: Option<Option<&str>>,
		frequency: Option<&str>,
		retention_days: Option<u32>,
		active: Option<bool>,
	) -> Result<HistorySchedule>
	{
		self.history.update_schedule(schedule_id, name, description, frequency, retention_days, active).await
	}

	pub async fn delete_history_schedule(&self, schedule_id: Uuid) -> Result<bool>
	{
		self.history.delete_schedule(schedule_id).await
	}

	pub async fn execute_history_schedule_now(&self, schedule: &HistorySchedule) -> Result<HistoryEntry>
	{
		self.history.execute_schedule_now(schedule).await
	}

	pub async fn get_history_entries(&self, schedule_id: Uuid) -> Result<Vec<HistoryEntry>>
	{
		self.history.get_history_entries(schedule_id).await
	}

	pub async fn get_history_data(&self, snapshot_id: Uuid) -> Result<Option<Json>>
	{
		self.history.get_history_data(snapshot_id).await
	}

	pub async fn delete_history_data(&self, snapshot_id: Uuid) -> Result<()>
	{
		self.history.delete_history_data(snapshot_id).await
	}

	// --- Validation Engine (C10) --------------------------------------------

	#[allow(clippy::too_many_arguments)]
	pub async fn create_validation_rule(
		&self,
		rule_type: ValidationRuleType,
		connection_id: &str,
		table_name: &str,
		field_name: &str,
		parameters: HashMap<String, Json>,
		error_message: &str,
		name: Option<&str>,
		description: Option<&str>,
	) -> Result<ValidationRule>
	{
		self.validation
			.create_rule(rule_type, connection_id, table_name, field_name, parameters, error_message, name, description)
			.await
	}

	pub async fn delete_validation_rule(&self, rule_id: Uuid) -> Result<bool>
	{
		self.validation.delete_rule(rule_id).await
	}

	pub async fn update_validation_rule(
		&self,
		rule_id: Uuid,
		parameters: Option<HashMap<String, Json>>,
		error_message: Option<&str>,
		active: Option<bool>,
	) -> Result<ValidationRule>
	{
		self.validation.update_rule(rule_id, parameters, error_message, active).await
	}

	pub async fn get_validation_rules(
		&self,
		connection_id: Option<&str>,
		table_name: Option<&str>,
	) -> Result<Vec<ValidationRule>>
	{
		self.validation.get_all_rules(connection_id, table_name).await
	}

	pub async fn validate_data(&self, rule: &ValidationRule, data: &QueryResult) -> Result<ValidationResult>
	{
		self.validation.validate_data(rule, data).await
	}

	pub async fn validate_all_rules(
		&self,
		connection_id: &str,
		table_name: &str,
		data: &QueryResult,
	) -> Result<Vec<ValidationResult>>
	{
		self.validation.validate_all_rules(connection_id, table_name, data).await
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn extracts_table_name_from_from_clause()
	{
		assert_eq!(extract_table_name("SELECT * FROM \"Users\" WHERE id = 1"), Some("Users".to_owned()));
		assert_eq!(extract_table_name("select a,b from accounts"), Some("accounts".to_owned()));
		assert_eq!(extract_table_name("not a query"), None);
	}
}
