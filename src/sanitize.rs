//! Redaction helpers shared by every connector and the registry.
//!
//! Contract invariant (spec §4.1): passwords and usernames must be elided
//! from every error message, log line, and status payload this crate
//! produces.

const PASSWORD_PLACEHOLDER: &str = "[REDACTED]";
const USERNAME_PLACEHOLDER: &str = "[USERNAME]";

const CREDENTIAL_KEYWORDS: &[&str] =
	&["permission", "access denied", "authorization", "login", "password"];

/// Replaces every occurrence of `password` and `user` in `message` with
/// their placeholders. Safe to call with `None`/empty credentials.
pub fn sanitize_error_message(message: &str, user: Option<&str>, password: Option<&str>) -> String
{
	let mut sanitized = message.to_owned();

	if let Some(password) = password.filter(|password| !password.is_empty()) {
		sanitized = sanitized.replace(password, PASSWORD_PLACEHOLDER);
	}

	if let Some(user) = user.filter(|user| !user.is_empty()) {
		sanitized = sanitized.replace(user, USERNAME_PLACEHOLDER);
	}

	sanitized
}

/// Flattens a SQL statement onto one line for logging, and truncates it to
/// at most 1,000 characters.
pub fn sanitize_sql_for_logging(sql: &str) -> String
{
	let flattened = sql.replace('\n', " ").replace('\r', " ");

	match flattened.char_indices().nth(1_000) {
		Some((byte_index, _)) => flattened[..byte_index].to_owned(),
		None => flattened,
	}
}

/// Whether `message` contains a keyword that indicates a credential/access
/// failure (spec §7), used to classify a connection failure as
/// [`SecurityError`](crate::error::SecurityError) rather than
/// [`DatabaseError`](crate::error::DatabaseError).
pub fn looks_like_credential_failure(message: &str) -> bool
{
	let lower = message.to_lowercase();
	CREDENTIAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn redacts_password_and_username()
	{
		let message = "login failed for user 'alice' with password 'hunter2'";
		let sanitized = sanitize_error_message(message, Some("alice"), Some("hunter2"));

		assert!(!sanitized.contains("hunter2"));
		assert!(!sanitized.contains("'alice'"));
		assert!(sanitized.contains(PASSWORD_PLACEHOLDER));
		assert!(sanitized.contains(USERNAME_PLACEHOLDER));
	}

	#[test]
	fn classifies_credential_failures()
	{
		assert!(looks_like_credential_failure("Access Denied for user"));
		assert!(looks_like_credential_failure("invalid password"));
		assert!(!looks_like_credential_failure("syntax error near SELECT"));
	}

	#[test]
	fn flattens_and_truncates_sql()
	{
		let sql = "SELECT *\nFROM x\r\nWHERE a = 1";
		assert_eq!(sanitize_sql_for_logging(sql), "SELECT * FROM x  WHERE a = 1");

		let long_sql = "SELECT ".to_owned() + &"a, ".repeat(2_000);
		assert_eq!(sanitize_sql_for_logging(&long_sql).chars().count(), 1_000);
	}
}
