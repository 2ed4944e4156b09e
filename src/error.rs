//! The core's caller-visible error taxonomy.
//!
//! Every fallible public operation returns [`Error`], which wraps one of the
//! four kinds described by the specification's error taxonomy: a database
//! failure, a security violation, a validation problem, or a bad
//! configuration. Connector- and service-level errors are always converted
//! into one of these variants before crossing a public boundary.

use std::error::Error as StdError;

use derive_more::{Display, From};

pub type Result<T> = std::result::Result<T, Error>;

/// The union of every error this crate can return to a caller.
#[derive(Debug, Display, From)]
pub enum Error
{
	#[display("{_0}")]
	Database(DatabaseError),

	#[display("{_0}")]
	Security(SecurityError),

	#[display("{_0}")]
	Validation(ValidationError),

	#[display("{_0}")]
	Configuration(ConfigurationError),
}

impl StdError for Error
{
	fn source(&self) -> Option<&(dyn StdError + 'static)>
	{
		match self {
			Self::Database(error) => error.source(),
			Self::Security(_) | Self::Validation(_) | Self::Configuration(_) => None,
		}
	}
}

impl Error
{
	/// A short, stable tag for the error's kind, useful for metrics/logging
	/// without re-matching on the full error payload.
	pub fn kind(&self) -> &'static str
	{
		match self {
			Self::Database(_) => "database",
			Self::Security(_) => "security",
			Self::Validation(_) => "validation",
			Self::Configuration(_) => "configuration",
		}
	}
}

/// A failure talking to, or executing a statement against, a database.
///
/// The message carried here has already been sanitized: no password or
/// username substring survives into it.
#[derive(Debug, Display)]
#[display("database error: {message}")]
pub struct DatabaseError
{
	pub message: String,
	pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl StdError for DatabaseError
{
	fn source(&self) -> Option<&(dyn StdError + 'static)>
	{
		self.source.as_deref().map(|error| error as &(dyn StdError + 'static))
	}
}

impl DatabaseError
{
	pub fn new(message: impl Into<String>) -> Self
	{
		Self { message: message.into(), source: None }
	}

	pub fn with_source(
		message: impl Into<String>,
		source: impl StdError + Send + Sync + 'static,
	) -> Self
	{
		Self { message: message.into(), source: Some(Box::new(source)) }
	}
}

/// A read-only violation, a table-whitelist violation, or a
/// credential-related driver failure detected by keyword match.
#[derive(Debug, Display)]
#[display("security error: {message}")]
pub struct SecurityError
{
	pub message: String,
}

impl StdError for SecurityError {}

impl SecurityError
{
	pub fn new(message: impl Into<String>) -> Self
	{
		Self { message: message.into() }
	}
}

/// A problem evaluating a [`ValidationRule`](crate::model::ValidationRule),
/// distinct from a failed *result* (a rule that runs cleanly and reports
/// failing rows is not an error — this is for malformed rules/parameters).
#[derive(Debug, Display)]
#[display("validation error: {message}")]
pub struct ValidationError
{
	pub message: String,
}

impl StdError for ValidationError {}

impl ValidationError
{
	pub fn new(message: impl Into<String>) -> Self
	{
		Self { message: message.into() }
	}
}

/// A malformed [`ConnectionConfig`](crate::model::ConnectionConfig) or rule,
/// or an unavailable connector `kind`.
#[derive(Debug, Display)]
#[display("configuration error: {message}")]
pub struct ConfigurationError
{
	pub message: String,
}

impl StdError for ConfigurationError {}

impl ConfigurationError
{
	pub fn new(message: impl Into<String>) -> Self
	{
		Self { message: message.into() }
	}
}


/// Extension trait mirroring the teacher's `ResultExt`: inspect an error as
/// a type-erased [`StdError`] without consuming the [`Result`].
pub trait ResultExt
{
	type Ok;
	type Err;

	fn inspect_err_dyn(self, inspect: impl FnOnce(&(dyn StdError + 'static))) -> Self
	where
		Self::Err: StdError + 'static;
}

impl<T, E> ResultExt for std::result::Result<T, E>
{
	type Ok = T;
	type Err = E;

	fn inspect_err_dyn(self, inspect: impl FnOnce(&(dyn StdError + 'static))) -> Self
	where
		<Self as ResultExt>::Err: StdError + 'static,
	{
		self.inspect_err(move |err| inspect(err as &(dyn StdError + 'static)))
	}
}

impl From<sqlx::Error> for Error
{
	fn from(error: sqlx::Error) -> Self
	{
		Self::Database(DatabaseError::with_source("query execution failed", error))
	}
}
