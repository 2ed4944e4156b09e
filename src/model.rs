//! The data model shared by every component (spec §3).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use time::OffsetDateTime;
use uuid::Uuid;

/// Which backend a [`ConnectionConfig`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind
{
	Postgresql,
	Mysql,
	Sqlite,
	Mssql,
	Oracle,
	Odbc,
	As400,
}

impl ConnectorKind
{
	/// Whether the generic SQL connector (C2) backs this kind directly,
	/// as opposed to a specialized connector (C3/C4).
	pub fn is_generic(self) -> bool
	{
		matches!(self, Self::Postgresql | Self::Mysql | Self::Sqlite | Self::Mssql)
	}
}

/// Immutable descriptor for a database endpoint (spec §3).
#[derive(Debug, Clone)]
pub struct ConnectionConfig
{
	pub name: String,
	pub kind: ConnectorKind,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub database: Option<String>,
	pub user: Option<String>,
	pub password: Option<String>,
	pub pool_size: u32,
	pub max_overflow: u32,
	pub pool_recycle_seconds: u64,
	pub echo: bool,
	pub connection_string: Option<String>,
	pub connection_timeout: Option<Duration>,
	pub query_timeout: Option<Duration>,
	pub properties: HashMap<String, String>,
	pub read_only: bool,
	pub ssl: bool,
	pub allowed_tables: Option<HashSet<String>>,
	pub odbc_dsn: Option<String>,
	pub as400_driver_jar: Option<String>,
	pub mapping_enabled: bool,
	pub history_enabled: bool,
	pub validation_enabled: bool,
	pub history_connection_id: Option<String>,
	pub validation_connection_id: Option<String>,
}

#[bon::bon]
impl ConnectionConfig
{
	#[builder]
	pub fn new(
		name: impl Into<String>,
		kind: ConnectorKind,
		host: Option<String>,
		port: Option<u16>,
		database: Option<String>,
		user: Option<String>,
		password: Option<String>,
		#[builder(default = 5)] pool_size: u32,
		#[builder(default = 10)] max_overflow: u32,
		#[builder(default = 3_600)] pool_recycle_seconds: u64,
		#[builder(default)] echo: bool,
		connection_string: Option<String>,
		connection_timeout: Option<Duration>,
		query_timeout: Option<Duration>,
		#[builder(default)] properties: HashMap<String, String>,
		#[builder(default)] read_only: bool,
		#[builder(default)] ssl: bool,
		allowed_tables: Option<HashSet<String>>,
		odbc_dsn: Option<String>,
		as400_driver_jar: Option<String>,
		#[builder(default)] mapping_enabled: bool,
		#[builder(default)] history_enabled: bool,
		#[builder(default)] validation_enabled: bool,
		history_connection_id: Option<String>,
		validation_connection_id: Option<String>,
	) -> Self
	{
		Self {
			name: name.into(),
			kind,
			host,
			port,
			database,
			user,
			password,
			pool_size,
			max_overflow,
			pool_recycle_seconds,
			echo,
			connection_string,
			connection_timeout,
			query_timeout,
			properties,
			read_only,
			ssl,
			allowed_tables: allowed_tables
				.map(|tables| tables.into_iter().map(|table| table.to_uppercase()).collect()),
			odbc_dsn,
			as400_driver_jar,
			mapping_enabled,
			history_enabled,
			validation_enabled,
			history_connection_id,
			validation_connection_id,
		}
	}
}

/// Structural description of a single result column (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetadata
{
	pub name: String,
	pub type_name: String,
	pub type_code: i32,
	pub precision: u32,
	pub scale: u32,
	pub nullable: bool,
	pub table_name: Option<String>,
}

/// One row of a [`QueryResult`], keyed by column name.
pub type Record = HashMap<String, Json>;

/// The uniform result envelope returned by `execute_query` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult
{
	pub query: String,
	pub connection_id: String,
	#[serde(with = "time::serde::rfc3339")]
	pub executed_at: OffsetDateTime,
	pub records: Vec<Record>,
	pub columns: Vec<ColumnMetadata>,
	pub row_count: usize,
	pub execution_time_ms: u64,
	pub truncated: bool,
	pub has_error: bool,
	pub error_message: Option<String>,
	pub mapped_fields: Option<HashMap<String, String>>,
}

impl QueryResult
{
	pub fn empty_error(query: impl Into<String>, connection_id: impl Into<String>, error: impl Into<String>) -> Self
	{
		Self {
			query: query.into(),
			connection_id: connection_id.into(),
			executed_at: OffsetDateTime::now_utc(),
			records: Vec::new(),
			columns: Vec::new(),
			row_count: 0,
			execution_time_ms: 0,
			truncated: false,
			has_error: true,
			error_message: Some(error.into()),
			mapped_fields: None,
		}
	}
}

/// Per-(connection, table) original→mapped field name dictionary (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping
{
	pub id: Uuid,
	pub connection_id: String,
	pub table_name: String,
	pub description: Option<String>,
	pub fields: HashMap<String, String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

/// A periodic snapshot schedule over a saved query (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySchedule
{
	pub id: Uuid,
	pub connection_id: String,
	pub query_id: String,
	pub name: String,
	pub description: Option<String>,
	pub frequency: String,
	pub retention_days: u32,
	pub active: bool,
	#[serde(with = "time::serde::rfc3339::option")]
	pub last_run: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus
{
	Success,
	Error,
}

/// Snapshot metadata for one execution of a [`HistorySchedule`] (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry
{
	pub id: Uuid,
	pub schedule_id: Uuid,
	pub connection_id: String,
	pub query_id: String,
	pub table_name: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub collected_at: OffsetDateTime,
	pub snapshot_id: Uuid,
	pub record_count: usize,
	pub status: HistoryStatus,
	pub error_message: Option<String>,
}

/// The payload of one successful snapshot (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryData
{
	pub id: Uuid,
	pub snapshot_id: Uuid,
	pub records: Json,
	pub schema: Json,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

/// The kind of predicate a [`ValidationRule`] evaluates (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRuleType
{
	Range,
	Pattern,
	NotNull,
	Unique,
	Length,
	Reference,
	Enumeration,
	Custom,
}

/// A declarative constraint over one column (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule
{
	pub id: Uuid,
	pub name: String,
	pub description: Option<String>,
	pub connection_id: String,
	pub table_name: String,
	pub field_name: String,
	pub rule_type: ValidationRuleType,
	pub parameters: HashMap<String, Json>,
	pub error_message: Option<String>,
	pub active: bool,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

/// One failing row reported by [`ValidationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure
{
	pub row_index: usize,
	pub field: String,
	pub value: Json,
	pub error: String,
}

/// The outcome of evaluating a [`ValidationRule`] over a batch (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult
{
	pub id: Uuid,
	pub rule_id: Uuid,
	pub table_name: String,
	pub field_name: String,
	#[serde(with = "time::serde::rfc3339")]
	pub validated_at: OffsetDateTime,
	pub success: bool,
	pub failures: Vec<ValidationFailure>,
	pub total_records: usize,
	pub failed_records: usize,
}
