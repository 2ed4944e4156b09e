//! End-to-end scenarios against sqlite connections (spec §8), exercising
//! [`crate::DatabaseManager`] the way an embedding application would
//! rather than any single module in isolation.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Config;
use crate::model::{ColumnMetadata, ConnectionConfig, ConnectorKind, QueryResult, ValidationRule, ValidationRuleType};
use crate::DatabaseManager;

fn temp_sqlite_path(label: &str) -> String
{
	std::env::temp_dir().join(format!("dbcore-test-{label}-{}.sqlite3", Uuid::new_v4())).display().to_string()
}

async fn started_manager() -> (DatabaseManager, Config)
{
	let config = Config::default();
	let manager = DatabaseManager::new(&config);
	manager.start(&config).await.expect("manager should start against an in-memory default connection");
	(manager, config)
}

// S1: generic execute against a freshly registered sqlite connection.
#[tokio::test]
async fn executes_a_round_trip_query()
{
	let (manager, _config) = started_manager().await;

	manager.execute("CREATE TABLE x (a INT)", None).await.expect("create table");
	manager.execute("INSERT INTO x VALUES (1)", None).await.expect("insert row");

	let result = manager.execute_query("SELECT a FROM x", None, None, None, false).await.expect("select");

	assert_eq!(result.row_count, 1);
	assert!(!result.truncated);
	assert_eq!(result.records[0].get("a"), Some(&json!(1)));
}

// S2: a read-only connection rejects every write verb before it reaches sqlite.
#[tokio::test]
async fn read_only_connection_rejects_writes()
{
	let (manager, _config) = started_manager().await;
	manager.execute("CREATE TABLE x (a INT)", None).await.expect("create table");
	manager.execute("INSERT INTO x VALUES (1)", None).await.expect("insert row");

	let path = temp_sqlite_path("read-only");
	let ro_config =
		ConnectionConfig::builder().name("ro").kind(ConnectorKind::Sqlite).database(path).read_only(true).build();
	manager.register_connection(ro_config).await.expect("register read-only connection");

	let outcome = manager.execute_query("DELETE FROM x", None, Some("ro"), None, false).await;
	assert!(outcome.is_err(), "a write verb must be rejected on a read-only connection");
}

// S3: a whitelisted connection accepts a bare table name for a listed table.
#[tokio::test]
async fn whitelist_allows_listed_table_and_expands_bare_name()
{
	let path = temp_sqlite_path("whitelist");

	let plain_config =
		ConnectionConfig::builder().name("shared").kind(ConnectorKind::Sqlite).database(path.clone()).build();
	let (manager, _config) = started_manager().await;
	manager.register_connection(plain_config).await.expect("register shared connection");
	manager.execute("CREATE TABLE x (a INT)", Some("shared")).await.expect("create table");
	manager.execute("INSERT INTO x VALUES (1)", Some("shared")).await.expect("insert row");

	let mut allowed = std::collections::HashSet::new();
	allowed.insert("X".to_owned());
	let wl_config = ConnectionConfig::builder()
		.name("wl")
		.kind(ConnectorKind::Sqlite)
		.database(path)
		.maybe_allowed_tables(Some(allowed))
		.build();
	manager.register_connection(wl_config).await.expect("register whitelisted connection");

	let blocked = manager.execute_query("SELECT * FROM y", None, Some("wl"), None, false).await;
	assert!(blocked.is_err(), "a table outside the whitelist must be rejected");

	let result = manager.execute_query("x", None, Some("wl"), Some(5), false).await.expect("bare table expansion");
	assert_eq!(result.query, "SELECT * FROM x LIMIT 5");
	assert_eq!(result.row_count, 1);
}

// S4: field mapping rewrites the query and renames the result columns back.
#[tokio::test]
async fn field_mapping_round_trips_through_query_and_results()
{
	let mut config = Config::default();
	config.database.field_mapping.enabled = true;
	config.database.field_mapping.connection_id = Some("default".to_owned());

	let manager = DatabaseManager::new(&config);
	manager.start(&config).await.expect("manager should start with field mapping enabled");

	// The default connection's own `mapping_enabled` flag mirrors the
	// feature toggle (see `DatabaseSection::default_connection_config`).
	manager.execute("CREATE TABLE x (a INT)", None).await.expect("create table");
	manager.execute("INSERT INTO x VALUES (1)", None).await.expect("insert row");

	let fields = HashMap::from([("a".to_owned(), "value_a".to_owned())]);
	manager.create_mapping("default", "x", None, &fields).await.expect("create mapping");

	let result = manager.execute_query("SELECT * FROM x", None, None, None, true).await.expect("mapped select");

	assert_eq!(result.records[0].get("value_a"), Some(&json!(1)));
	assert_eq!(result.mapped_fields, Some(fields));
}

// S5: the range validator reports exactly the out-of-bounds and null rows.
#[tokio::test]
async fn range_rule_flags_out_of_bounds_and_null_rows()
{
	let (manager, _config) = started_manager().await;

	let rule = ValidationRule {
		id: Uuid::new_v4(),
		name: "age range".to_owned(),
		description: None,
		connection_id: "default".to_owned(),
		table_name: "people".to_owned(),
		field_name: "age".to_owned(),
		rule_type: ValidationRuleType::Range,
		parameters: HashMap::from([("min".to_owned(), json!(0)), ("max".to_owned(), json!(120))]),
		error_message: Some("age out of range".to_owned()),
		active: true,
		created_at: OffsetDateTime::now_utc(),
		updated_at: OffsetDateTime::now_utc(),
	};

	let data = QueryResult {
		query: "SELECT age FROM people".to_owned(),
		connection_id: "default".to_owned(),
		executed_at: OffsetDateTime::now_utc(),
		records: vec![
			HashMap::from([("age".to_owned(), json!(30))]),
			HashMap::from([("age".to_owned(), json!(-1))]),
			HashMap::from([("age".to_owned(), json!(null))]),
		],
		columns: vec![ColumnMetadata {
			name: "age".to_owned(),
			type_name: "INTEGER".to_owned(),
			type_code: 4,
			precision: 0,
			scale: 0,
			nullable: true,
			table_name: None,
		}],
		row_count: 3,
		execution_time_ms: 0,
		truncated: false,
		has_error: false,
		error_message: None,
		mapped_fields: None,
	};

	let result = manager.validate_data(&rule, &data).await.expect("validate_data");

	assert!(!result.success);
	assert_eq!(result.total_records, 3);
	assert_eq!(result.failed_records, 2);
	assert_eq!(result.failures.iter().map(|f| f.row_index).collect::<Vec<_>>(), vec![1, 2]);
}

// S6: a 1-second schedule accumulates entries while it runs, then an
// updated retention of 0 days sweeps every one of them away on its next
// cleanup pass (spec §8 scenario S6).
#[tokio::test]
async fn history_schedule_ticks_and_cleanup_sweeps_entries()
{
	let mut config = Config::default();
	config.database.history.enabled = true;
	config.database.history.connection_id = Some("default".to_owned());

	let manager = DatabaseManager::new(&config);
	manager.start(&config).await.expect("manager should start with history enabled");

	manager
		.execute("CREATE TABLE db_saved_queries (id TEXT PRIMARY KEY, query_text TEXT NOT NULL)", None)
		.await
		.expect("create saved-query table");

	let query_id = Uuid::new_v4();
	manager
		.execute(&format!("INSERT INTO db_saved_queries VALUES ('{query_id}', 'SELECT 1 AS a')"), None)
		.await
		.expect("insert saved query");

	let schedule = manager
		.create_history_schedule("default", &query_id.to_string(), "tick", None, "1s", 10)
		.await
		.expect("create schedule");

	tokio::time::sleep(Duration::from_millis(2_200)).await;

	let entries = manager.get_history_entries(schedule.id).await.expect("list entries mid-run");
	assert!(entries.len() >= 2, "expected at least 2 ticks within 2.2s, got {}", entries.len());
	assert!(entries.iter().all(|entry| entry.status == crate::model::HistoryStatus::Success));

	manager
		.update_history_schedule(schedule.id, None, None, None, Some(0), None)
		.await
		.expect("drop retention to 0 days");

	tokio::time::sleep(Duration::from_millis(1_200)).await;

	let entries = manager.get_history_entries(schedule.id).await.expect("list entries after cleanup");
	assert!(entries.is_empty(), "cleanup with 0-day retention should have swept every entry");

	let deleted = manager.delete_history_schedule(schedule.id).await.expect("delete schedule");
	assert!(deleted);
}
