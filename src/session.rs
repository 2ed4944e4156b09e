//! Scoped session acquisition (C6): commit-on-success,
//! rollback-on-failure, released on every exit path (spec §4.6).
//!
//! Expressed as an RAII guard the way the teacher's
//! `DatabaseConnection::in_transaction` expresses a scoped transaction,
//! generalized from a closure-taking helper to a guard callers hold
//! directly, since the manager's public API hands sessions back to
//! callers rather than running their body itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use sqlx::{AnyPool, Transaction};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};

/// The set of live session ids for one [`crate::registry::Connection`],
/// consulted for forced teardown on unregister/shutdown (spec §3).
pub type LiveSessions = Arc<Mutex<HashSet<Uuid>>>;

fn lock(sessions: &LiveSessions) -> std::sync::MutexGuard<'_, HashSet<Uuid>>
{
	sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A scoped, transactional session over a generic connector's pool.
///
/// On normal exit callers must call [`Session::commit`] or
/// [`Session::rollback`] explicitly; if the guard is dropped without
/// either (an early return, a panic unwind), the underlying
/// `sqlx::Transaction` rolls back on drop and the id is removed from the
/// live-session set — matching "on any failure, rollback" without
/// requiring callers to remember to call `rollback()` themselves.
pub struct Session
{
	id: Uuid,
	connection_name: String,
	live_sessions: LiveSessions,
	transaction: Option<Transaction<'static, sqlx::Any>>,
}

impl std::fmt::Debug for Session
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Session")
			.field("id", &self.id)
			.field("connection_name", &self.connection_name)
			.finish_non_exhaustive()
	}
}

impl Session
{
	pub(crate) async fn begin(
		connection_name: impl Into<String>,
		pool: &AnyPool,
		live_sessions: LiveSessions,
	) -> Result<Self>
	{
		let transaction = pool
			.begin()
			.await
			.map_err(|err| DatabaseError::with_source("failed to begin session", err))?;

		let id = Uuid::new_v4();
		lock(&live_sessions).insert(id);

		Ok(Self { id, connection_name: connection_name.into(), live_sessions, transaction: Some(transaction) })
	}

	pub fn id(&self) -> Uuid
	{
		self.id
	}

	/// The statement text this session runs, scoped to its own
	/// transaction — callers reach the underlying `sqlx::Transaction` to
	/// run queries through `sqlx::query(...).execute(session.executor())`.
	pub fn executor(&mut self) -> &mut Transaction<'static, sqlx::Any>
	{
		self.transaction
			.as_mut()
			.unwrap_or_else(|| unreachable!("transaction is only taken by commit/rollback, which consume self"))
	}

	/// Commits the session's transaction and releases it from the
	/// live-session set.
	pub async fn commit(mut self) -> Result<()>
	{
		let transaction = self.take_transaction();
		lock(&self.live_sessions).remove(&self.id);

		transaction.commit().await.map_err(|err| {
			DatabaseError::with_source(format!("failed to commit session on {:?}", self.connection_name), err)
				.into()
		})
	}

	/// Rolls back the session's transaction and releases it from the
	/// live-session set.
	pub async fn rollback(mut self) -> Result<()>
	{
		let transaction = self.take_transaction();
		lock(&self.live_sessions).remove(&self.id);

		transaction.rollback().await.map_err(|err| {
			DatabaseError::with_source(format!("failed to roll back session on {:?}", self.connection_name), err)
				.into()
		})
	}

	fn take_transaction(&mut self) -> Transaction<'static, sqlx::Any>
	{
		self.transaction
			.take()
			.unwrap_or_else(|| unreachable!("commit/rollback each consume self, so this runs once"))
	}
}

impl Drop for Session
{
	fn drop(&mut self)
	{
		lock(&self.live_sessions).remove(&self.id);

		if self.transaction.is_some() {
			tracing::trace!(
				connection_name = self.connection_name,
				session_id = %self.id,
				"session dropped without commit; rolling back",
			);
		}
	}
}
