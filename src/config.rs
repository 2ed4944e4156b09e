//! Configuration schema (spec §6) and TOML loading, mirroring the teacher's
//! `config::database` module.

use std::fs;
use std::path::Path;

use color_eyre::Section;
use color_eyre::eyre::{self, WrapErr};
use serde::Deserialize;

use crate::model::{ConnectionConfig, ConnectorKind};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config
{
	pub database: DatabaseSection,
}

impl Config
{
	/// Loads a [`Config`] from a TOML file, mirroring the teacher's
	/// `Config::load_from_file`.
	pub fn load_from_file(path: impl AsRef<Path>) -> eyre::Result<Self>
	{
		let file = fs::read_to_string(path.as_ref())
			.wrap_err_with(|| format!("failed to read configuration file at {:?}", path.as_ref()))
			.suggestion("create the file or pass an alternative path")?;

		toml::from_str(&file).wrap_err("failed to parse configuration file")
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct DatabaseSection
{
	#[serde(rename = "type")]
	pub kind: ConnectorKind,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub name: Option<String>,
	pub user: Option<String>,
	pub password: Option<String>,
	pub pool_size: u32,
	pub max_overflow: u32,
	pub pool_recycle: u64,
	pub echo: bool,
	pub field_mapping: FeatureToggle,
	pub history: FeatureToggle,
	pub validation: FeatureToggle,
}

impl Default for DatabaseSection
{
	fn default() -> Self
	{
		Self {
			kind: ConnectorKind::Sqlite,
			host: None,
			port: None,
			name: None,
			user: None,
			password: None,
			pool_size: 5,
			max_overflow: 10,
			pool_recycle: 3_600,
			echo: false,
			field_mapping: FeatureToggle::default(),
			history: FeatureToggle::default(),
			validation: FeatureToggle::default(),
		}
	}
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FeatureToggle
{
	pub enabled: bool,
	pub connection_id: Option<String>,
}

impl DatabaseSection
{
	/// Builds the `"default"` [`ConnectionConfig`] described by this
	/// section, used to seed the registry at startup.
	pub fn default_connection_config(&self) -> ConnectionConfig
	{
		ConnectionConfig::builder()
			.name("default")
			.kind(self.kind)
			.maybe_host(self.host.clone())
			.maybe_port(self.port)
			.maybe_database(self.name.clone())
			.maybe_user(self.user.clone())
			.maybe_password(self.password.clone())
			.pool_size(self.pool_size)
			.max_overflow(self.max_overflow)
			.pool_recycle_seconds(self.pool_recycle)
			.echo(self.echo)
			.mapping_enabled(self.field_mapping.enabled)
			.history_enabled(self.history.enabled)
			.validation_enabled(self.validation.enabled)
			.maybe_history_connection_id(self.history.connection_id.clone())
			.maybe_validation_connection_id(self.validation.connection_id.clone())
			.build()
	}
}

/// Compares `new` against `previous` and logs a warning for every field
/// that differs, without applying any of the changes (spec §6: runtime
/// config changes require a restart).
pub fn on_config_changed(previous: &Config, new: &Config)
{
	let prev = &previous.database;
	let next = &new.database;

	macro_rules! warn_if_changed {
		($field:ident) => {
			if prev.$field != next.$field {
				tracing::warn!(
					field = stringify!($field),
					previous = ?prev.$field,
					new = ?next.$field,
					"database configuration changed; restart required for this to take effect",
				);
			}
		};
	}

	warn_if_changed!(kind);
	warn_if_changed!(host);
	warn_if_changed!(port);
	warn_if_changed!(name);
	warn_if_changed!(pool_size);
	warn_if_changed!(max_overflow);
	warn_if_changed!(pool_recycle);
	warn_if_changed!(echo);
	warn_if_changed!(field_mapping);
	warn_if_changed!(history);
	warn_if_changed!(validation);
}

impl PartialEq for FeatureToggle
{
	fn eq(&self, other: &Self) -> bool
	{
		self.enabled == other.enabled && self.connection_id == other.connection_id
	}
}
