//! The Validation Engine (C10): declarative, per-field rules evaluated
//! against query batches (spec §4.11).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use serde_json::Value as Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::connector::params::{ParamValue, Params};
use crate::error::{ConfigurationError, DatabaseError, Result, ValidationError};
use crate::model::{QueryResult, ValidationFailure, ValidationRule, ValidationRuleType, ValidationResult};
use crate::registry::ConnectionRegistry;

const CREATE_RULES_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_validation_rules ( \
	id TEXT PRIMARY KEY, name TEXT NOT NULL, description TEXT, connection_id TEXT NOT NULL, \
	table_name TEXT NOT NULL, field_name TEXT NOT NULL, rule_type TEXT NOT NULL, parameters TEXT NOT NULL, \
	error_message TEXT NOT NULL, active INTEGER NOT NULL, created_at TEXT NOT NULL, updated_at TEXT NOT NULL)";

const CREATE_RESULTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS db_validation_results ( \
	id TEXT PRIMARY KEY, rule_id TEXT NOT NULL REFERENCES db_validation_rules(id) ON DELETE CASCADE, \
	table_name TEXT NOT NULL, field_name TEXT NOT NULL, validated_at TEXT NOT NULL, success INTEGER NOT NULL, \
	failures TEXT, total_records INTEGER NOT NULL, failed_records INTEGER NOT NULL)";

/// Checks a rule's `parameters` map against the required-parameters
/// table for its type (spec §4.11).
fn validate_rule_parameters(rule_type: ValidationRuleType, parameters: &HashMap<String, Json>) -> Result<()>
{
	use ValidationRuleType::*;

	match rule_type {
		Range => {
			if !parameters.contains_key("min") && !parameters.contains_key("max") {
				return Err(ValidationError::new("range rule must have a min or max parameter").into());
			}
		},
		Pattern => {
			let pattern = parameters.get("pattern").and_then(Json::as_str);
			let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
				return Err(ValidationError::new("pattern rule must have a pattern parameter").into());
			};
			Regex::new(pattern)
				.map_err(|err| ValidationError::new(format!("invalid regular expression: {err}")))?;
		},
		Length => {
			if !parameters.contains_key("min_length") && !parameters.contains_key("max_length") {
				return Err(
					ValidationError::new("length rule must have a min_length or max_length parameter").into()
				);
			}
		},
		Enumeration => {
			let values = parameters.get("allowed_values").and_then(Json::as_array);
			if values.is_none_or(Vec::is_empty) {
				return Err(ValidationError::new("enumeration rule must have an allowed_values parameter").into());
			}
		},
		Reference => {
			let values = parameters.get("reference_values").and_then(Json::as_array);
			if values.is_none_or(Vec::is_empty) {
				return Err(ValidationError::new("reference rule must have a reference_values parameter").into());
			}
		},
		Custom => {
			let expression = parameters.get("expression").and_then(Json::as_str);
			if expression.is_none_or(str::is_empty) {
				return Err(ValidationError::new("custom rule must have an expression parameter").into());
			}
		},
		NotNull | Unique => {},
	}

	Ok(())
}

fn json_to_string(value: &Json) -> String
{
	match value {
		Json::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn value_as_f64(value: &Json) -> Option<f64>
{
	match value {
		Json::Number(n) => n.as_f64(),
		Json::String(s) => s.parse().ok(),
		_ => None,
	}
}

fn validate_range(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let Some(value) = value_as_f64(value) else {
		return false;
	};

	if let Some(min) = parameters.get("min").and_then(value_as_f64)
		&& value < min
	{
		return false;
	}
	if let Some(max) = parameters.get("max").and_then(value_as_f64)
		&& value > max
	{
		return false;
	}

	true
}

fn validate_pattern(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let Some(pattern) = parameters.get("pattern").and_then(Json::as_str) else {
		return false;
	};
	let Ok(regex) = Regex::new(pattern) else {
		return false;
	};

	regex.is_match(&json_to_string(value))
}

fn validate_not_null(value: Option<&Json>, _parameters: &HashMap<String, Json>) -> bool
{
	value.is_some_and(|v| !v.is_null())
}

/// `unique_counts` is the batch-scoped frequency map computed once per
/// `validate_data` call, keyed by stringified value (open question (a)).
fn validate_unique(value: Option<&Json>, unique_counts: &HashMap<String, usize>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};

	unique_counts.get(&json_to_string(value)).copied().unwrap_or(0) <= 1
}

fn validate_length(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let length = json_to_string(value).chars().count();

	if let Some(min) = parameters.get("min_length").and_then(Json::as_u64)
		&& (length as u64) < min
	{
		return false;
	}
	if let Some(max) = parameters.get("max_length").and_then(Json::as_u64)
		&& (length as u64) > max
	{
		return false;
	}

	true
}

fn validate_reference(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let Some(references) = parameters.get("reference_values").and_then(Json::as_array) else {
		return false;
	};
	if references.is_empty() {
		return false;
	}

	let text = json_to_string(value);
	references.iter().any(|candidate| json_to_string(candidate) == text)
}

fn validate_enumeration(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let Some(allowed) = parameters.get("allowed_values").and_then(Json::as_array) else {
		return false;
	};
	if allowed.is_empty() {
		return false;
	}

	let text = json_to_string(value);
	allowed.iter().any(|candidate| json_to_string(candidate) == text)
}

/// Evaluates `expression` with only a `value` binding (spec §4.11: "no
/// ambient bindings beyond the row's own value").
fn validate_custom(value: Option<&Json>, parameters: &HashMap<String, Json>) -> bool
{
	let Some(value) = value.filter(|v| !v.is_null()) else {
		return false;
	};
	let Some(expression) = parameters.get("expression").and_then(Json::as_str) else {
		return false;
	};

	let mut context = evalexpr::HashMapContext::new();
	let bound = match value {
		Json::Bool(b) => evalexpr::Value::Boolean(*b),
		Json::Number(n) => n.as_f64().map(evalexpr::Value::Float).unwrap_or(evalexpr::Value::Empty),
		Json::String(s) => evalexpr::Value::String(s.clone()),
		_ => evalexpr::Value::String(json_to_string(value)),
	};

	if evalexpr::ContextWithMutableVariables::set_value(&mut context, "value".to_owned(), bound).is_err() {
		return false;
	}

	evalexpr::eval_boolean_with_context(expression, &context).unwrap_or(false)
}

/// Persists rule CRUD and evaluation history inside a designated
/// connection, and runs the nine built-in predicates (spec §4.11).
pub struct ValidationEngine
{
	registry: Arc<ConnectionRegistry>,
	connection_name: Option<String>,
	initialized: AtomicBool,
}

impl std::fmt::Debug for ValidationEngine
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("ValidationEngine")
			.field("connection_name", &self.connection_name)
			.field("initialized", &self.initialized.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl ValidationEngine
{
	pub fn new(registry: Arc<ConnectionRegistry>, connection_name: Option<String>) -> Self
	{
		Self { registry, connection_name, initialized: AtomicBool::new(false) }
	}

	pub fn is_initialized(&self) -> bool
	{
		self.initialized.load(Ordering::Relaxed)
	}

	pub fn connection_name(&self) -> Option<&str>
	{
		self.connection_name.as_deref()
	}

	pub async fn initialize(&self)
	{
		let Some(connection_name) = &self.connection_name else {
			return;
		};

		let result = async {
			self.registry.execute_query(connection_name, CREATE_RULES_TABLE, None, None).await?;
			self.registry.execute_query(connection_name, CREATE_RESULTS_TABLE, None, None).await
		}
		.await;

		match result {
			Ok(_) => self.initialized.store(true, Ordering::Relaxed),
			Err(err) => {
				tracing::warn!(connection_name, error = %err, "validation engine table creation failed; feature disabled");
			},
		}
	}

	fn require_initialized(&self) -> Result<&str>
	{
		match &self.connection_name {
			Some(name) if self.is_initialized() => Ok(name.as_str()),
			_ => Err(ConfigurationError::new("validation engine is not initialized").into()),
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn create_rule(
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
		let connection_name = self.require_initialized()?;
		validate_rule_parameters(rule_type, &parameters)?;

		let id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();
		let name = name.map(str::to_owned).unwrap_or_else(|| format!("{rule_type:?} check for {field_name}"));
		let parameters_json = serde_json::to_string(&parameters)
			.map_err(|err| DatabaseError::with_source("failed to encode rule parameters", err))?;

		let params = Params::from([
			("id".to_owned(), ParamValue::Text(id.to_string())),
			("name".to_owned(), ParamValue::Text(name.clone())),
			("description".to_owned(), param_nullable_text(description)),
			("connection_id".to_owned(), ParamValue::Text(connection_id.to_owned())),
			("table_name".to_owned(), ParamValue::Text(table_name.to_owned())),
			("field_name".to_owned(), ParamValue::Text(field_name.to_owned())),
			("rule_type".to_owned(), ParamValue::Text(rule_type_text(rule_type).to_owned())),
			("parameters".to_owned(), ParamValue::Text(parameters_json)),
			("error_message".to_owned(), ParamValue::Text(error_message.to_owned())),
			("created_at".to_owned(), ParamValue::DateTime(now)),
			("updated_at".to_owned(), ParamValue::DateTime(now)),
		]);
		self.registry
			.execute_query(
				connection_name,
				"INSERT INTO db_validation_rules (id, name, description, connection_id, table_name, field_name, \
				 rule_type, parameters, error_message, active, created_at, updated_at) VALUES \
				 (:id, :name, :description, :connection_id, :table_name, :field_name, :rule_type, :parameters, \
				 :error_message, 1, :created_at, :updated_at)",
				Some(&params),
				None,
			)
			.await?;

		Ok(ValidationRule {
			id,
			name,
			description: description.map(str::to_owned),
			connection_id: connection_id.to_owned(),
			table_name: table_name.to_owned(),
			field_name: field_name.to_owned(),
			rule_type,
			parameters,
			error_message: Some(error_message.to_owned()),
			active: true,
			created_at: now,
			updated_at: now,
		})
	}

	pub async fn delete_rule(&self, rule_id: Uuid) -> Result<bool>
	{
		let connection_name = self.require_initialized()?;

		if self.get_rule(rule_id).await?.is_none() {
			return Ok(false);
		}

		let params = Params::from([("id".to_owned(), ParamValue::Text(rule_id.to_string()))]);
		self.registry
			.execute_query(connection_name, "DELETE FROM db_validation_rules WHERE id = :id", Some(&params), None)
			.await?;
		Ok(true)
	}

	pub async fn get_rule(&self, rule_id: Uuid) -> Result<Option<ValidationRule>>
	{
		let connection_name = self.require_initialized()?;
		let params = Params::from([("id".to_owned(), ParamValue::Text(rule_id.to_string()))]);
		let result = self
			.registry
			.execute_query(connection_name, "SELECT * FROM db_validation_rules WHERE id = :id", Some(&params), None)
			.await?;
		Ok(result.records.first().and_then(decode_rule))
	}

	pub async fn update_rule(
		&self,
		rule_id: Uuid,
		parameters: Option<HashMap<String, Json>>,
		error_message: Option<&str>,
		active: Option<bool>,
	) -> Result<ValidationRule>
	{
		let connection_name = self.require_initialized()?;
		let Some(existing) = self.get_rule(rule_id).await? else {
			return Err(ValidationError::new(format!("no validation rule with id {rule_id}")).into());
		};

		if let Some(parameters) = &parameters {
			validate_rule_parameters(existing.rule_type, parameters)?;
		}

		let parameters = parameters.unwrap_or_else(|| existing.parameters.clone());
		let error_message = error_message.map(str::to_owned).or_else(|| existing.error_message.clone());
		let active = active.unwrap_or(existing.active);
		let now = OffsetDateTime::now_utc();

		let parameters_json = serde_json::to_string(&parameters)
			.map_err(|err| DatabaseError::with_source("failed to encode rule parameters", err))?;

		let params = Params::from([
			("id".to_owned(), ParamValue::Text(rule_id.to_string())),
			("parameters".to_owned(), ParamValue::Text(parameters_json)),
			("error_message".to_owned(), param_nullable_text(error_message.as_deref())),
			("active".to_owned(), ParamValue::Int(i64::from(active))),
			("updated_at".to_owned(), ParamValue::DateTime(now)),
		]);
		self.registry
			.execute_query(
				connection_name,
				"UPDATE db_validation_rules SET parameters = :parameters, error_message = :error_message, \
				 active = :active, updated_at = :updated_at WHERE id = :id",
				Some(&params),
				None,
			)
			.await?;

		Ok(ValidationRule { parameters, error_message, active, updated_at: now, ..existing })
	}

	pub async fn get_all_rules(
		&self,
		connection_id: Option<&str>,
		table_name: Option<&str>,
	) -> Result<Vec<ValidationRule>>
	{
		let connection_name = self.require_initialized()?;

		let mut sql = "SELECT * FROM db_validation_rules".to_owned();
		let mut params = Params::new();
		match (connection_id, table_name) {
			(Some(connection_id), Some(table_name)) => {
				sql.push_str(" WHERE connection_id = :connection_id AND table_name = :table_name");
				params.insert("connection_id".to_owned(), ParamValue::Text(connection_id.to_owned()));
				params.insert("table_name".to_owned(), ParamValue::Text(table_name.to_owned()));
			},
			(Some(connection_id), None) => {
				sql.push_str(" WHERE connection_id = :connection_id");
				params.insert("connection_id".to_owned(), ParamValue::Text(connection_id.to_owned()));
			},
			(None, Some(table_name)) => {
				sql.push_str(" WHERE table_name = :table_name");
				params.insert("table_name".to_owned(), ParamValue::Text(table_name.to_owned()));
			},
			(None, None) => {},
		}
		sql.push_str(" ORDER BY name");

		let params = if params.is_empty() { None } else { Some(&params) };
		let result = self.registry.execute_query(connection_name, &sql, params, None).await?;
		Ok(result.records.iter().filter_map(decode_rule).collect())
	}

	/// Evaluates one rule over an already-fetched [`QueryResult`] batch
	/// (spec §4.11). The field-existence and unique-frequency checks are
	/// batch-scoped, computed once per call.
	pub async fn validate_data(&self, rule: &ValidationRule, data: &QueryResult) -> Result<ValidationResult>
	{
		let field_exists =
			data.columns.iter().any(|column| column.name.eq_ignore_ascii_case(&rule.field_name));
		if !field_exists {
			return Err(ValidationError::new(format!(
				"field {:?} not found in the query results",
				rule.field_name
			))
			.into());
		}

		let unique_counts = if rule.rule_type == ValidationRuleType::Unique {
			let mut counts = HashMap::new();
			for record in &data.records {
				if let Some(value) = find_field(record, &rule.field_name).filter(|v| !v.is_null()) {
					*counts.entry(json_to_string(value)).or_insert(0usize) += 1;
				}
			}
			Some(counts)
		} else {
			None
		};

		let default_error = rule.error_message.clone().unwrap_or_else(|| "validation failed".to_owned());
		let mut failures = Vec::new();

		for (row_index, record) in data.records.iter().enumerate() {
			let field_value = find_field(record, &rule.field_name);
			let is_valid = match rule.rule_type {
				ValidationRuleType::Range => validate_range(field_value, &rule.parameters),
				ValidationRuleType::Pattern => validate_pattern(field_value, &rule.parameters),
				ValidationRuleType::NotNull => validate_not_null(field_value, &rule.parameters),
				ValidationRuleType::Unique => validate_unique(
					field_value,
					unique_counts.as_ref().unwrap_or_else(|| unreachable!("computed above for the Unique rule type")),
				),
				ValidationRuleType::Length => validate_length(field_value, &rule.parameters),
				ValidationRuleType::Reference => validate_reference(field_value, &rule.parameters),
				ValidationRuleType::Enumeration => validate_enumeration(field_value, &rule.parameters),
				ValidationRuleType::Custom => validate_custom(field_value, &rule.parameters),
			};

			if !is_valid {
				failures.push(ValidationFailure {
					row_index,
					field: rule.field_name.clone(),
					value: field_value.cloned().unwrap_or(Json::Null),
					error: default_error.clone(),
				});
			}
		}

		let result = ValidationResult {
			id: Uuid::new_v4(),
			rule_id: rule.id,
			table_name: rule.table_name.clone(),
			field_name: rule.field_name.clone(),
			validated_at: OffsetDateTime::now_utc(),
			success: failures.is_empty(),
			failed_records: failures.len(),
			total_records: data.records.len(),
			failures,
		};

		if self.connection_name.is_some() {
			if let Err(err) = self.save_validation_result(&result).await {
				tracing::warn!(rule_id = %rule.id, error = %err, "failed to persist validation result");
			}
		}

		Ok(result)
	}

	/// Validates `data` against every active rule registered for
	/// `(connection_id, table_name)` (spec §4.11).
	pub async fn validate_all_rules(
		&self,
		connection_id: &str,
		table_name: &str,
		data: &QueryResult,
	) -> Result<Vec<ValidationResult>>
	{
		let rules = self.get_all_rules(Some(connection_id), Some(table_name)).await?;
		let mut results = Vec::new();

		for rule in rules.into_iter().filter(|rule| rule.active) {
			match self.validate_data(&rule, data).await {
				Ok(result) => results.push(result),
				Err(err) => tracing::warn!(rule_id = %rule.id, error = %err, "rule evaluation failed"),
			}
		}

		Ok(results)
	}

	async fn save_validation_result(&self, result: &ValidationResult) -> Result<()>
	{
		let connection_name = self.require_initialized()?;
		let failures_json = serde_json::to_string(&result.failures)
			.map_err(|err| DatabaseError::with_source("failed to encode validation failures", err))?;

		let params = Params::from([
			("id".to_owned(), ParamValue::Text(result.id.to_string())),
			("rule_id".to_owned(), ParamValue::Text(result.rule_id.to_string())),
			("table_name".to_owned(), ParamValue::Text(result.table_name.clone())),
			("field_name".to_owned(), ParamValue::Text(result.field_name.clone())),
			("validated_at".to_owned(), ParamValue::DateTime(result.validated_at)),
			("success".to_owned(), ParamValue::Int(i64::from(result.success))),
			("failures".to_owned(), ParamValue::Text(failures_json)),
			("total_records".to_owned(), ParamValue::Int(i64::try_from(result.total_records).unwrap_or(i64::MAX))),
			(
				"failed_records".to_owned(),
				ParamValue::Int(i64::try_from(result.failed_records).unwrap_or(i64::MAX)),
			),
		]);
		self.registry
			.execute_query(
				connection_name,
				"INSERT INTO db_validation_results (id, rule_id, table_name, field_name, validated_at, success, \
				 failures, total_records, failed_records) VALUES (:id, :rule_id, :table_name, :field_name, \
				 :validated_at, :success, :failures, :total_records, :failed_records)",
				Some(&params),
				None,
			)
			.await?;
		Ok(())
	}

	pub async fn get_validation_results(&self, rule_id: Option<Uuid>, limit: u32) -> Result<Vec<ValidationResult>>
	{
		let connection_name = self.require_initialized()?;

		let (sql, params) = match rule_id {
			Some(rule_id) => (
				"SELECT * FROM db_validation_results WHERE rule_id = :rule_id ORDER BY validated_at DESC \
				 LIMIT :limit"
					.to_owned(),
				Params::from([
					("rule_id".to_owned(), ParamValue::Text(rule_id.to_string())),
					("limit".to_owned(), ParamValue::Int(i64::from(limit))),
				]),
			),
			None => (
				"SELECT * FROM db_validation_results ORDER BY validated_at DESC LIMIT :limit".to_owned(),
				Params::from([("limit".to_owned(), ParamValue::Int(i64::from(limit)))]),
			),
		};

		let result = self.registry.execute_query(connection_name, &sql, Some(&params), None).await?;
		Ok(result.records.iter().filter_map(decode_result).collect())
	}
}

fn find_field<'a>(record: &'a crate::model::Record, field_name: &str) -> Option<&'a Json>
{
	record.iter().find(|(key, _)| key.eq_ignore_ascii_case(field_name)).map(|(_, value)| value)
}

fn param_nullable_text(value: Option<&str>) -> ParamValue
{
	match value {
		Some(text) => ParamValue::Text(text.to_owned()),
		None => ParamValue::Null,
	}
}

fn rule_type_text(rule_type: ValidationRuleType) -> &'static str
{
	match rule_type {
		ValidationRuleType::Range => "range",
		ValidationRuleType::Pattern => "pattern",
		ValidationRuleType::NotNull => "not_null",
		ValidationRuleType::Unique => "unique",
		ValidationRuleType::Length => "length",
		ValidationRuleType::Reference => "reference",
		ValidationRuleType::Enumeration => "enumeration",
		ValidationRuleType::Custom => "custom",
	}
}

fn parse_rule_type(text: &str) -> Option<ValidationRuleType>
{
	Some(match text {
		"range" => ValidationRuleType::Range,
		"pattern" => ValidationRuleType::Pattern,
		"not_null" => ValidationRuleType::NotNull,
		"unique" => ValidationRuleType::Unique,
		"length" => ValidationRuleType::Length,
		"reference" => ValidationRuleType::Reference,
		"enumeration" => ValidationRuleType::Enumeration,
		"custom" => ValidationRuleType::Custom,
		_ => return None,
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

fn decode_rule(record: &crate::model::Record) -> Option<ValidationRule>
{
	let parameters: HashMap<String, Json> =
		record.get("parameters").and_then(Json::as_str).and_then(|text| serde_json::from_str(text).ok())?;

	Some(ValidationRule {
		id: record.get("id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		name: record.get("name")?.as_str()?.to_owned(),
		description: record.get("description").and_then(Json::as_str).map(str::to_owned),
		connection_id: record.get("connection_id")?.as_str()?.to_owned(),
		table_name: record.get("table_name")?.as_str()?.to_owned(),
		field_name: record.get("field_name")?.as_str()?.to_owned(),
		rule_type: parse_rule_type(record.get("rule_type")?.as_str()?)?,
		parameters,
		error_message: record.get("error_message").and_then(Json::as_str).map(str::to_owned),
		active: truthy(record.get("active")),
		created_at: record.get("created_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
		updated_at: record.get("updated_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
	})
}

fn decode_result(record: &crate::model::Record) -> Option<ValidationResult>
{
	let failures: Vec<ValidationFailure> =
		record.get("failures").and_then(Json::as_str).and_then(|text| serde_json::from_str(text).ok())
			.unwrap_or_default();

	Some(ValidationResult {
		id: record.get("id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		rule_id: record.get("rule_id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
		table_name: record.get("table_name")?.as_str()?.to_owned(),
		field_name: record.get("field_name")?.as_str()?.to_owned(),
		validated_at: record.get("validated_at").and_then(Json::as_str).and_then(parse_rfc3339)?,
		success: truthy(record.get("success")),
		failures,
		total_records: usize::try_from(record.get("total_records")?.as_u64()?).unwrap_or(usize::MAX),
		failed_records: usize::try_from(record.get("failed_records")?.as_u64()?).unwrap_or(usize::MAX),
	})
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn params(pairs: &[(&str, Json)]) -> HashMap<String, Json>
	{
		pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
	}

	#[test]
	fn range_validator_respects_bounds()
	{
		let parameters = params(&[("min", Json::from(10)), ("max", Json::from(20))]);
		assert!(validate_range(Some(&Json::from(15)), &parameters));
		assert!(!validate_range(Some(&Json::from(5)), &parameters));
		assert!(!validate_range(None, &parameters));
	}

	#[test]
	fn pattern_validator_matches_prefix()
	{
		let parameters = params(&[("pattern", Json::from("^[A-Z]{3}$"))]);
		assert!(validate_pattern(Some(&Json::from("ABC")), &parameters));
		assert!(!validate_pattern(Some(&Json::from("abcd")), &parameters));
	}

	#[test]
	fn unique_validator_flags_duplicates()
	{
		let mut counts = HashMap::new();
		counts.insert("x".to_owned(), 2usize);
		counts.insert("y".to_owned(), 1usize);

		assert!(!validate_unique(Some(&Json::from("x")), &counts));
		assert!(validate_unique(Some(&Json::from("y")), &counts));
	}

	#[test]
	fn custom_validator_evaluates_expression_with_value_only()
	{
		let parameters = params(&[("expression", Json::from("value > 10"))]);
		assert!(validate_custom(Some(&Json::from(42)), &parameters));
		assert!(!validate_custom(Some(&Json::from(1)), &parameters));
	}

	#[test]
	fn rule_parameter_validation_requires_pattern()
	{
		let parameters = params(&[]);
		assert!(validate_rule_parameters(ValidationRuleType::Pattern, &parameters).is_err());
	}
}
