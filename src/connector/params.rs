//! Named→positional parameter rewriting, shared by every connector.
//!
//! The original system's AS/400 connector rewrites `:name` placeholders to
//! positional `?` markers in order of occurrence before handing the
//! statement to the driver (spec §4.4, §9 open question (b): rewrite then
//! forward). The same rewrite is reused here for the generic and ODBC
//! connectors too, since `sqlx`'s `Any` driver and ODBC's driver manager
//! both bind with positional `?` markers.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use time::{Date, OffsetDateTime};

use crate::error::{DatabaseError, Result};

/// A single typed bind value, covering every type the AS/400 prepared
/// statement setters distinguish (spec §4.4) plus the usual SQL scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue
{
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
	DateTime(OffsetDateTime),
	Date(Date),
	Bytes(Vec<u8>),
}

pub type Params = HashMap<String, ParamValue>;

static NAMED_PLACEHOLDER: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap_or_else(|err| {
		panic!("hard-coded named-placeholder pattern should be valid\n{err}");
	}));

/// Rewrites every `:name` in `sql` to `?`, in order of occurrence, and
/// returns the rewritten SQL alongside the name each `?` came from.
pub fn rewrite_named_placeholders(sql: &str) -> (String, Vec<String>)
{
	let mut names = Vec::new();
	let rewritten = NAMED_PLACEHOLDER
		.replace_all(sql, |captures: &regex::Captures<'_>| {
			names.push(captures[1].to_owned());
			"?"
		})
		.into_owned();

	(rewritten, names)
}

/// Looks up each name produced by [`rewrite_named_placeholders`] in
/// `params`, in order, failing if one is missing.
pub fn ordered_values(names: &[String], params: &Params) -> Result<Vec<ParamValue>>
{
	names
		.iter()
		.map(|name| {
			params
				.get(name)
				.cloned()
				.ok_or_else(|| DatabaseError::new(format!("missing value for parameter {name:?}")).into())
		})
		.collect()
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn rewrites_named_placeholders_in_order()
	{
		let (sql, names) = rewrite_named_placeholders("SELECT * FROM x WHERE a = :a AND b = :b");
		assert_eq!(sql, "SELECT * FROM x WHERE a = ? AND b = ?");
		assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
	}

	#[test]
	fn repeated_names_each_become_their_own_placeholder()
	{
		let (sql, names) = rewrite_named_placeholders(":a = :a");
		assert_eq!(sql, "? = ?");
		assert_eq!(names, vec!["a".to_owned(), "a".to_owned()]);
	}
}
