//! The Field Mapper (C8): a persistent original→mapped field-name
//! dictionary per (connection, table), plus the query/result rewriting
//! rules the dispatcher (C7) uses to apply it (spec §4.9, §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::connector::params::{ParamValue, Params};
use crate::error::{DatabaseError, Result};
use crate::model::FieldMapping;
use crate::registry::ConnectionRegistry;

const CREATE_MAPPINGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_field_mappings ( \
	id TEXT PRIMARY KEY, connection_id TEXT NOT NULL, table_name TEXT NOT NULL, \
	description TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL, \
	UNIQUE(connection_id, table_name))";

const CREATE_MAPPING_ENTRIES_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_field_mapping_entries ( \
	id TEXT PRIMARY KEY, mapping_id TEXT NOT NULL REFERENCES db_field_mappings(id) ON DELETE CASCADE, \
	original_field TEXT NOT NULL, mapped_field TEXT NOT NULL, \
	UNIQUE(mapping_id, original_field))";

/// Looks up `database.field_mapping.connection_id`, falling back to
/// `"default"` (spec §4.9); lazily ensures its two management tables
/// exist. Initialization failures degrade the feature silently rather
/// than propagating (spec §4.9, §7).
pub struct FieldMapper
{
	registry: Arc<ConnectionRegistry>,
	connection_name: String,
	initialized: AtomicBool,
}

impl std::fmt::Debug for FieldMapper
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("FieldMapper")
			.field("connection_name", &self.connection_name)
			.field("initialized", &self.initialized.load(Ordering::Relaxed))
			.finish()
	}
}

impl FieldMapper
{
	pub fn new(registry: Arc<ConnectionRegistry>, connection_name: impl Into<String>) -> Self
	{
		Self { registry, connection_name: connection_name.into(), initialized: AtomicBool::new(false) }
	}

	pub fn is_initialized(&self) -> bool
	{
		self.initialized.load(Ordering::Relaxed)
	}

	pub fn connection_name(&self) -> &str
	{
		&self.connection_name
	}

	pub async fn initialize(&self)
	{
		let result = async {
			self.registry.execute_query(&self.connection_name, CREATE_MAPPINGS_TABLE, None, None).await?;
			self.registry
				.execute_query(&self.connection_name, CREATE_MAPPING_ENTRIES_TABLE, None, None)
				.await
		}
		.await;

		match result {
			Ok(_) => self.initialized.store(true, Ordering::Relaxed),
			Err(err) => tracing::warn!(
				connection_name = self.connection_name,
				error = %err,
				"field mapper table creation failed; feature disabled",
			),
		}
	}

	fn require_initialized(&self) -> Result<()>
	{
		if self.is_initialized() {
			Ok(())
		} else {
			Err(DatabaseError::new("field mapper is not initialized").into())
		}
	}

	pub async fn create_mapping(
		&self,
		connection_id: &str,
		table_name: &str,
		description: Option<&str>,
		fields: &HashMap<String, String>,
	) -> Result<FieldMapping>
	{
		self.require_initialized()?;

		let id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();

		let mut session = self.registry.acquire_session(&self.connection_name).await?;
		let insert_result = insert_mapping(&mut session, id, connection_id, table_name, description, now, fields).await;

		match insert_result {
			Ok(()) => session.commit().await?,
			Err(err) => {
				let _ = session.rollback().await;
				return Err(err);
			},
		}

		Ok(FieldMapping {
			id,
			connection_id: connection_id.to_owned(),
			table_name: table_name.to_owned(),
			description: description.map(str::to_owned),
			fields: fields.clone(),
			created_at: now,
			updated_at: now,
		})
	}

	/// Replace-all update: deletes every entry then re-inserts, in one
	/// transaction (spec §4.9).
	pub async fn update_mapping(
		&self,
		id: Uuid,
		description: Option<&str>,
		fields: &HashMap<String, String>,
	) -> Result<FieldMapping>
	{
		self.require_initialized()?;

		let existing = self
			.get_mapping_by_id(id)
			.await?
			.ok_or_else(|| DatabaseError::new(format!("no field mapping with id {id}")))?;

		let now = OffsetDateTime::now_utc();
		let mut session = self.registry.acquire_session(&self.connection_name).await?;

		let result = async {
			sqlx::query("DELETE FROM db_field_mapping_entries WHERE mapping_id = ?")
				.bind(id.to_string())
				.execute(session.executor())
				.await?;
			sqlx::query("UPDATE db_field_mappings SET description = ?, updated_at = ? WHERE id = ?")
				.bind(description)
				.bind(now.to_string())
				.bind(id.to_string())
				.execute(session.executor())
				.await?;
			for (original, mapped) in fields {
				sqlx::query(
					"INSERT INTO db_field_mapping_entries (id, mapping_id, original_field, mapped_field) \
					 VALUES (?, ?, ?, ?)",
				)
				.bind(Uuid::new_v4().to_string())
				.bind(id.to_string())
				.bind(original)
				.bind(mapped)
				.execute(session.executor())
				.await?;
			}
			Ok::<(), sqlx::Error>(())
		}
		.await;

		match result {
			Ok(()) => session.commit().await?,
			Err(err) => {
				let _ = session.rollback().await;
				return Err(DatabaseError::with_source("failed to update field mapping", err).into());
			},
		}

		Ok(FieldMapping {
			id,
			connection_id: existing.connection_id,
			table_name: existing.table_name,
			description: description.map(str::to_owned),
			fields: fields.clone(),
			created_at: existing.created_at,
			updated_at: now,
		})
	}

	pub async fn delete_mapping(&self, id: Uuid) -> Result<bool>
	{
		self.require_initialized()?;

		let existing = self.get_mapping_by_id(id).await?;
		if existing.is_none() {
			return Ok(false);
		}

		let params = Params::from([("id".to_owned(), ParamValue::Text(id.to_string()))]);
		self.registry
			.execute_query(
				&self.connection_name,
				"DELETE FROM db_field_mappings WHERE id = :id",
				Some(&params),
				None,
			)
			.await?;

		Ok(true)
	}

	pub async fn get_mapping(&self, connection_id: &str, table_name: &str) -> Result<Option<FieldMapping>>
	{
		self.require_initialized()?;

		let params = Params::from([
			("connection_id".to_owned(), ParamValue::Text(connection_id.to_owned())),
			("table_name".to_owned(), ParamValue::Text(table_name.to_owned())),
		]);
		let result = self
			.registry
			.execute_query(
				&self.connection_name,
				"SELECT id FROM db_field_mappings WHERE connection_id = :connection_id AND table_name = :table_name",
				Some(&params),
				None,
			)
			.await?;

		let Some(record) = result.records.into_iter().next() else {
			return Ok(None);
		};
		let Some(Json::String(id)) = record.get("id").cloned() else {
			return Ok(None);
		};
		let Ok(id) = Uuid::parse_str(&id) else {
			return Ok(None);
		};

		self.get_mapping_by_id(id).await
	}

	pub async fn get_mapping_by_id(&self, id: Uuid) -> Result<Option<FieldMapping>>
	{
		self.require_initialized()?;

		let params = Params::from([("id".to_owned(), ParamValue::Text(id.to_string()))]);
		let result = self
			.registry
			.execute_query(
				&self.connection_name,
				"SELECT connection_id, table_name, description, created_at, updated_at FROM db_field_mappings \
				 WHERE id = :id",
				Some(&params),
				None,
			)
			.await?;
		let Some(record) = result.records.into_iter().next() else {
			return Ok(None);
		};

		let entries = self
			.registry
			.execute_query(
				&self.connection_name,
				"SELECT original_field, mapped_field FROM db_field_mapping_entries WHERE mapping_id = :id",
				Some(&params),
				None,
			)
			.await?;

		let fields = entries
			.records
			.iter()
			.filter_map(|row| {
				let original = row.get("original_field")?.as_str()?.to_owned();
				let mapped = row.get("mapped_field")?.as_str()?.to_owned();
				Some((original, mapped))
			})
			.collect();

		Ok(Some(FieldMapping {
			id,
			connection_id: json_string(&record, "connection_id"),
			table_name: json_string(&record, "table_name"),
			description: record.get("description").and_then(Json::as_str).map(str::to_owned),
			fields,
			created_at: parse_timestamp(&record, "created_at"),
			updated_at: parse_timestamp(&record, "updated_at"),
		}))
	}

	pub async fn get_all_mappings(&self, connection_id: Option<&str>) -> Result<Vec<FieldMapping>>
	{
		self.require_initialized()?;

		let (sql, params) = match connection_id {
			Some(id) => (
				"SELECT id FROM db_field_mappings WHERE connection_id = :connection_id",
				Some(Params::from([("connection_id".to_owned(), ParamValue::Text(id.to_owned()))])),
			),
			None => ("SELECT id FROM db_field_mappings", None),
		};
		let result = self.registry.execute_query(&self.connection_name, sql, params.as_ref(), None).await?;

		let mut mappings = Vec::new();
		for record in result.records {
			let Some(id) = record.get("id").and_then(Json::as_str).and_then(|s| Uuid::parse_str(s).ok()) else {
				continue;
			};
			if let Some(mapping) = self.get_mapping_by_id(id).await? {
				mappings.push(mapping);
			}
		}

		Ok(mappings)
	}

	/// Pre-rewrite rules, spec §4.7: bare table name, `SELECT *`, or a
	/// select list walk that appends `AS "mapped"` to unaliased columns
	/// with a mapping entry.
	pub fn apply_mapping_to_query(query: &str, mapping: &FieldMapping) -> String
	{
		let trimmed = query.trim();
		let projection = || {
			mapping
				.fields
				.iter()
				.map(|(original, mapped)| format!("\"{original}\" AS \"{mapped}\""))
				.collect::<Vec<_>>()
				.join(", ")
		};

		if !trimmed.chars().any(char::is_whitespace) {
			return format!("SELECT {} FROM {trimmed}", projection());
		}

		let upper = trimmed.to_uppercase();
		if let Some(from_index) = upper.find(" FROM ") {
			let select_list = trimmed[..from_index].trim();
			if select_list.eq_ignore_ascii_case("select *") {
				return format!("SELECT {}{}", projection(), &trimmed[from_index..]);
			}

			if select_list.len() > 6 && select_list[..6].eq_ignore_ascii_case("select") {
				let items = select_list[6..].split(',').map(str::trim);
				let rewritten: Vec<String> = items
					.map(|item| {
						if item.contains('(') || item.to_uppercase().contains(" AS ") {
							return item.to_owned();
						}
						let bare = item.trim_matches(|c| c == '"' || c == '`');
						match mapping.fields.get(bare) {
							Some(mapped) if mapped != bare => format!("{item} AS \"{mapped}\""),
							_ => item.to_owned(),
						}
					})
					.collect();
				return format!("SELECT {}{}", rewritten.join(", "), &trimmed[from_index..]);
			}
		}

		trimmed.to_owned()
	}

	/// Post-transform: renames result columns and every record's keys
	/// through the original→mapped map, and attaches it as
	/// `mapped_fields` (spec §4.7).
	pub fn apply_mapping_to_results(result: &mut crate::model::QueryResult, mapping: &FieldMapping)
	{
		for column in &mut result.columns {
			if let Some(mapped) = mapping.fields.get(&column.name) {
				column.name = mapped.clone();
			}
		}

		for record in &mut result.records {
			let renamed: HashMap<String, Json> = std::mem::take(record)
				.into_iter()
				.map(|(key, value)| {
					let key = mapping.fields.get(&key).cloned().unwrap_or(key);
					(key, value)
				})
				.collect();
			*record = renamed;
		}

		result.mapped_fields = Some(mapping.fields.clone());
	}

	/// Normalizes a storage field name into a caller-facing one: strip
	/// non-word/space characters, insert underscores at
	/// lowercase→uppercase transitions, collapse whitespace/underscores,
	/// lowercase, trim (spec §4.9).
	pub fn standardize_field_name(name: &str) -> String
	{
		let mut with_boundaries = String::with_capacity(name.len() + 4);
		let mut previous_lowercase = false;

		for ch in name.chars() {
			if !(ch.is_alphanumeric() || ch.is_whitespace() || ch == '_') {
				with_boundaries.push(' ');
				previous_lowercase = false;
				continue;
			}

			if ch.is_uppercase() && previous_lowercase {
				with_boundaries.push('_');
			}
			with_boundaries.push(ch);
			previous_lowercase = ch.is_lowercase();
		}

		let mut normalized = String::with_capacity(with_boundaries.len());
		let mut last_was_separator = false;
		for ch in with_boundaries.chars() {
			if ch.is_whitespace() || ch == '_' {
				if !last_was_separator {
					normalized.push('_');
				}
				last_was_separator = true;
			} else {
				normalized.push(ch.to_ascii_lowercase());
				last_was_separator = false;
			}
		}

		normalized.trim_matches('_').to_owned()
	}
}

async fn insert_mapping(
	session: &mut crate::session::Session,
	id: Uuid,
	connection_id: &str,
	table_name: &str,
	description: Option<&str>,
	now: OffsetDateTime,
	fields: &HashMap<String, String>,
) -> Result<()>
{
	let outcome = async {
		sqlx::query(
			"INSERT INTO db_field_mappings (id, connection_id, table_name, description, created_at, updated_at) \
			 VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(id.to_string())
		.bind(connection_id)
		.bind(table_name)
		.bind(description)
		.bind(now.to_string())
		.bind(now.to_string())
		.execute(session.executor())
		.await?;

		for (original, mapped) in fields {
			sqlx::query(
				"INSERT INTO db_field_mapping_entries (id, mapping_id, original_field, mapped_field) \
				 VALUES (?, ?, ?, ?)",
			)
			.bind(Uuid::new_v4().to_string())
			.bind(id.to_string())
			.bind(original)
			.bind(mapped)
			.execute(session.executor())
			.await?;
		}

		Ok::<(), sqlx::Error>(())
	}
	.await;

	outcome.map_err(|err| DatabaseError::with_source("failed to create field mapping", err).into())
}

fn json_string(record: &crate::model::Record, key: &str) -> String
{
	record.get(key).and_then(Json::as_str).unwrap_or_default().to_owned()
}

fn parse_timestamp(record: &crate::model::Record, key: &str) -> OffsetDateTime
{
	record
		.get(key)
		.and_then(Json::as_str)
		.and_then(|text| OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339).ok())
		.unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn standardizes_field_names()
	{
		assert_eq!(FieldMapper::standardize_field_name("FirstName"), "first_name");
		assert_eq!(FieldMapper::standardize_field_name(" First  Name! "), "first_name");
		assert_eq!(FieldMapper::standardize_field_name("already_snake"), "already_snake");
	}

	#[test]
	fn rewrites_bare_table_name_with_projection()
	{
		let mapping = FieldMapping {
			id: Uuid::new_v4(),
			connection_id: "t".to_owned(),
			table_name: "x".to_owned(),
			description: None,
			fields: HashMap::from([("FirstName".to_owned(), "first_name".to_owned())]),
			created_at: OffsetDateTime::UNIX_EPOCH,
			updated_at: OffsetDateTime::UNIX_EPOCH,
		};

		let rewritten = FieldMapper::apply_mapping_to_query("x", &mapping);
		assert_eq!(rewritten, "SELECT \"FirstName\" AS \"first_name\" FROM x");
	}
}
