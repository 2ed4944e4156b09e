//! Shared read-only / whitelist / bare-table-expansion policy (spec §4.1),
//! used identically by every connector so the write-verb list cannot drift
//! between implementations the way it did in the system this core was
//! distilled from (see DESIGN.md).

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SecurityError};
use crate::model::ConnectionConfig;

/// Verbs that mutate data or schema; a `read_only` connection must reject
/// any statement whose uppercased form contains one of these as a whole
/// word (spec §4.1, §8 invariant 2).
const WRITE_VERBS: &[&str] =
	&["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "RENAME"];

static WRITE_VERB_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	let alternation = WRITE_VERBS.join("|");
	Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).unwrap_or_else(|err| {
		panic!("hard-coded write-verb pattern should be valid\n{err}");
	})
});

static FROM_TABLE_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#"(?i)\bFROM\s+(["\[\]`]?[\w.]+["\[\]`]?)"#).unwrap_or_else(|err| {
		panic!("hard-coded FROM-table pattern should be valid\n{err}");
	}));

/// Rejects `statement` if `config.read_only` is set and the statement
/// contains a write verb.
pub fn enforce_read_only(config: &ConnectionConfig, statement: &str) -> Result<()>
{
	if config.read_only && WRITE_VERB_PATTERN.is_match(statement) {
		return Err(SecurityError::new(format!(
			"connection {:?} is read-only; statement contains a write verb",
			config.name
		))
		.into());
	}

	Ok(())
}

/// Extracts the table a statement targets, per spec §4.1: the whole input
/// if it contains no whitespace, otherwise the first `FROM <name>`.
pub fn extract_target_table(statement: &str) -> Option<String>
{
	let trimmed = statement.trim();

	if !trimmed.chars().any(char::is_whitespace) {
		return Some(strip_quoting(trimmed));
	}

	FROM_TABLE_PATTERN
		.captures(trimmed)
		.and_then(|captures| captures.get(1))
		.map(|m| strip_quoting(m.as_str()))
}

fn strip_quoting(identifier: &str) -> String
{
	identifier.trim_matches(|c| c == '"' || c == '[' || c == ']' || c == '`').to_owned()
}

/// Rejects `statement` if `config.allowed_tables` is set and the target
/// table (per [`extract_target_table`]) is not a member (spec §4.1, §8
/// invariant 3).
pub fn enforce_table_whitelist(config: &ConnectionConfig, statement: &str) -> Result<()>
{
	let Some(allowed) = config.allowed_tables.as_ref() else {
		return Ok(());
	};

	let Some(table) = extract_target_table(statement) else {
		return Err(SecurityError::new("could not determine target table for whitelist check").into());
	};

	if !allowed.contains(&table.to_uppercase()) {
		return Err(SecurityError::new(format!(
			"table {table:?} is not in the allowed_tables whitelist for connection {:?}",
			config.name
		))
		.into());
	}

	Ok(())
}

/// The row-limiting SQL syntax a dialect uses, per spec §4.1/§4.3/§4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle
{
	/// `SELECT ... LIMIT n`
	TrailingLimit,
	/// `SELECT TOP n ...`
	LeadingTop,
	/// `SELECT ... FETCH FIRST n ROWS ONLY`
	FetchFirst,
}

/// If `statement` is a bare table name, expands it to
/// `SELECT * FROM <table>[ <dialect limit>]` (spec §4.1).
pub fn expand_bare_table_name(statement: &str, limit: Option<u64>, style: LimitStyle) -> String
{
	let trimmed = statement.trim();

	if trimmed.chars().any(char::is_whitespace) {
		return trimmed.to_owned();
	}

	match (style, limit) {
		(LimitStyle::TrailingLimit, Some(n)) => format!("SELECT * FROM {trimmed} LIMIT {n}"),
		(LimitStyle::TrailingLimit, None) => format!("SELECT * FROM {trimmed}"),
		(LimitStyle::LeadingTop, Some(n)) => format!("SELECT TOP {n} * FROM {trimmed}"),
		(LimitStyle::LeadingTop, None) => format!("SELECT * FROM {trimmed}"),
		(LimitStyle::FetchFirst, Some(n)) => {
			format!("SELECT * FROM {trimmed} FETCH FIRST {n} ROWS ONLY")
		},
		(LimitStyle::FetchFirst, None) => format!("SELECT * FROM {trimmed}"),
	}
}

/// Runs the full pre-execution policy check: read-only enforcement then
/// table whitelist enforcement.
pub fn validate_statement(config: &ConnectionConfig, statement: &str) -> Result<()>
{
	enforce_read_only(config, statement)?;
	enforce_table_whitelist(config, statement)?;
	Ok(())
}

/// The case-insensitive write-verb set, exposed for property tests.
pub fn write_verbs() -> HashSet<&'static str>
{
	WRITE_VERBS.iter().copied().collect()
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn config(read_only: bool, allowed_tables: Option<&[&str]>) -> ConnectionConfig
	{
		ConnectionConfig::builder()
			.name("t")
			.kind(crate::model::ConnectorKind::Sqlite)
			.read_only(read_only)
			.maybe_allowed_tables(
				allowed_tables.map(|tables| tables.iter().map(|t| (*t).to_owned()).collect()),
			)
			.build()
	}

	#[test]
	fn rejects_write_verbs_when_read_only()
	{
		let cfg = config(true, None);
		assert!(enforce_read_only(&cfg, "DELETE FROM x").is_err());
		assert!(enforce_read_only(&cfg, "select * from x").is_ok());
	}

	#[test]
	fn extracts_target_table()
	{
		assert_eq!(extract_target_table("x").as_deref(), Some("x"));
		assert_eq!(extract_target_table("SELECT * FROM \"X\"").as_deref(), Some("X"));
		assert_eq!(extract_target_table("SELECT * FROM [X]").as_deref(), Some("X"));
	}

	#[test]
	fn whitelist_blocks_unlisted_tables()
	{
		let cfg = config(false, Some(&["A", "B"]));
		assert!(enforce_table_whitelist(&cfg, "SELECT * FROM C").is_err());
		assert!(enforce_table_whitelist(&cfg, "SELECT * FROM a").is_ok());
	}

	#[test]
	fn expands_bare_table_name_with_limit()
	{
		assert_eq!(expand_bare_table_name("x", Some(5), LimitStyle::TrailingLimit), "SELECT * FROM x LIMIT 5");
	}

	proptest::proptest! {
		/// Spec §8 invariant 2: no write verb survives read-only enforcement,
		/// regardless of what surrounds it in the statement.
		#[test]
		fn no_write_verb_survives_read_only(
			verb in proptest::sample::select(WRITE_VERBS.to_vec()),
			prefix in "[a-zA-Z0-9_ ]{0,32}",
			suffix in "[a-zA-Z0-9_ ]{0,32}",
		)
		{
			let cfg = config(true, None);
			let statement = format!("{prefix} {verb} {suffix}");
			proptest::prop_assert!(enforce_read_only(&cfg, &statement).is_err());
		}
	}
}
