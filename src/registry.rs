//! The connection registry (C5): a named connection table, the
//! config→connector factory, and pool supervision (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connector::{self, ConnectionInfo, ConnectorHandle, TableInfo};
use crate::connector::params::Params;
use crate::error::{ConfigurationError, DatabaseError, Result};
use crate::metrics::MetricsSnapshot;
use crate::model::{ColumnMetadata, ConnectionConfig, ConnectorKind, QueryResult};
use crate::session::{LiveSessions, Session};

/// The name reserved for the connection seeded from [`crate::config::Config`]
/// at startup; it can never be unregistered (spec §4.5).
pub const DEFAULT_CONNECTION: &str = "default";

/// Runtime companion of a [`ConnectionConfig`] (spec §3): the connector
/// instance plus bookkeeping the registry needs for teardown.
pub struct Connection
{
	pub config: ConnectionConfig,
	pub connector: ConnectorHandle,
	pub live_sessions: LiveSessions,
	pub initialized: bool,
	pub healthy: bool,
}

impl std::fmt::Debug for Connection
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Connection")
			.field("name", &self.config.name)
			.field("kind", &self.config.kind)
			.field("initialized", &self.initialized)
			.field("healthy", &self.healthy)
			.finish_non_exhaustive()
	}
}

/// Per-connection status payload for `DatabaseManager::status()` (spec §6).
#[derive(Debug, Clone)]
pub struct ConnectionStatus
{
	pub name: String,
	pub kind: ConnectorKind,
	pub initialized: bool,
	pub healthy: bool,
	pub metrics: MetricsSnapshot,
}

/// A named map of live connections behind one async lock (spec §5: "single
/// `tokio::sync::RwLock`").
#[derive(Debug, Default)]
pub struct ConnectionRegistry
{
	connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry
{
	pub fn new() -> Self
	{
		Self::default()
	}

	/// Instantiates a connector for `config.kind`, connects it, verifies
	/// it with `SELECT 1`, and adds it to the registry (spec §4.5).
	pub async fn register(&self, config: ConnectionConfig) -> Result<()>
	{
		let mut connector = connector::create_connector(&config)?;
		connector.connect().await?;

		let (ok, error) = connector.test_connection().await;
		if !ok {
			let _ = connector.disconnect().await;
			return Err(DatabaseError::new(format!(
				"connection {:?} failed verification: {}",
				config.name,
				error.unwrap_or_else(|| "unknown error".to_owned())
			))
			.into());
		}

		let name = config.name.clone();
		let connection = Connection {
			config,
			connector,
			live_sessions: Arc::new(std::sync::Mutex::new(std::collections::HashSet::new())),
			initialized: true,
			healthy: true,
		};

		self.connections.write().await.insert(name, connection);

		Ok(())
	}

	/// Removes a connection, force-closing its live sessions and
	/// disconnecting its connector first. `"default"` cannot be removed
	/// (spec §4.5).
	pub async fn unregister(&self, name: &str) -> Result<bool>
	{
		if name == DEFAULT_CONNECTION {
			return Err(ConfigurationError::new("the \"default\" connection cannot be unregistered").into());
		}

		let mut connections = self.connections.write().await;
		let Some(mut connection) = connections.remove(name) else {
			return Ok(false);
		};

		connection.live_sessions.lock().unwrap_or_else(|p| p.into_inner()).clear();
		let _ = connection.connector.disconnect().await;

		Ok(true)
	}

	pub async fn has_connection(&self, name: &str) -> bool
	{
		self.connections.read().await.contains_key(name)
	}

	pub async fn connection_names(&self) -> Vec<String>
	{
		self.connections.read().await.keys().cloned().collect()
	}

	/// Opens a scoped transactional session on the named connection's
	/// pool (spec §4.6). Specialized connectors (ODBC/AS400) and `mssql`
	/// reject this with a [`ConfigurationError`] — this build has no
	/// transactional adapter for them.
	pub async fn acquire_session(&self, name: &str) -> Result<Session>
	{
		let connections = self.connections.read().await;
		let connection = connections
			.get(name)
			.ok_or_else(|| ConfigurationError::new(format!("no connection named {name:?}")))?;

		let pool = connection.connector.any_pool().ok_or_else(|| {
			ConfigurationError::new(format!(
				"connection {name:?} does not support scoped sessions (specialized or mssql connector)"
			))
		})?;

		Session::begin(name, pool, Arc::clone(&connection.live_sessions)).await
	}

	fn no_such_connection(name: &str) -> ConfigurationError
	{
		ConfigurationError::new(format!("no connection named {name:?}"))
	}

	/// Routes `execute_query` to the named connection's connector (spec
	/// §4.7 step 2/3 — the connector itself applies read-only/whitelist
	/// policy and bare-table expansion; mapping pre/post-processing is the
	/// query dispatcher's job, layered on top of this call).
	pub async fn execute_query(
		&self,
		name: &str,
		sql: &str,
		params: Option<&Params>,
		limit: Option<u64>,
	) -> Result<QueryResult>
	{
		let mut connections = self.connections.write().await;
		let connection = connections.get_mut(name).ok_or_else(|| Self::no_such_connection(name))?;
		connection.connector.execute_query(sql, params, limit).await
	}

	pub async fn get_tables(&self, name: &str, schema: Option<&str>) -> Result<Vec<TableInfo>>
	{
		let mut connections = self.connections.write().await;
		let connection = connections.get_mut(name).ok_or_else(|| Self::no_such_connection(name))?;
		connection.connector.get_tables(schema).await
	}

	pub async fn get_table_columns(
		&self,
		name: &str,
		table: &str,
		schema: Option<&str>,
	) -> Result<Vec<ColumnMetadata>>
	{
		let mut connections = self.connections.write().await;
		let connection = connections.get_mut(name).ok_or_else(|| Self::no_such_connection(name))?;
		connection.connector.get_table_columns(table, schema).await
	}

	pub async fn test_connection(&self, name: &str) -> Result<(bool, Option<String>)>
	{
		let mut connections = self.connections.write().await;
		let connection = connections.get_mut(name).ok_or_else(|| Self::no_such_connection(name))?;
		Ok(connection.connector.test_connection().await)
	}

	pub async fn cancel_current_query(&self, name: &str) -> Result<bool>
	{
		let connections = self.connections.read().await;
		let connection = connections.get(name).ok_or_else(|| Self::no_such_connection(name))?;
		Ok(connection.connector.cancel_current_query())
	}

	/// A clone of the registered [`ConnectionConfig`], used by the query
	/// dispatcher to check per-connection feature flags (spec §4.7).
	pub async fn connection_config(&self, name: &str) -> Result<ConnectionConfig>
	{
		let connections = self.connections.read().await;
		let connection = connections.get(name).ok_or_else(|| Self::no_such_connection(name))?;
		Ok(connection.config.clone())
	}

	pub async fn connection_info(&self, name: &str) -> Result<ConnectionInfo>
	{
		let connections = self.connections.read().await;
		let connection = connections.get(name).ok_or_else(|| Self::no_such_connection(name))?;
		Ok(connection.connector.connection_info())
	}

	pub async fn status(&self) -> Vec<ConnectionStatus>
	{
		let connections = self.connections.read().await;
		let mut statuses = Vec::with_capacity(connections.len());

		for connection in connections.values() {
			statuses.push(ConnectionStatus {
				name: connection.config.name.clone(),
				kind: connection.config.kind,
				initialized: connection.initialized,
				healthy: connection.healthy,
				metrics: connection.connector.metrics_snapshot().await,
			});
		}

		statuses
	}

	/// Disconnects every connection, force-closing their sessions first
	/// (spec §5: forced unregister semantics apply equally at shutdown).
	pub async fn shutdown(&self)
	{
		let mut connections = self.connections.write().await;

		for connection in connections.values_mut() {
			connection.live_sessions.lock().unwrap_or_else(|p| p.into_inner()).clear();
			let _ = connection.connector.disconnect().await;
		}

		connections.clear();
	}
}
