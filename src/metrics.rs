//! Per-connection metrics hook (spec §4.8): a bounded ring of recent query
//! times plus total/failed counters, with a slow-query warning.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::sanitize::sanitize_sql_for_logging;

const RECENT_QUERY_TIMES_CAPACITY: usize = 100;
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Inner
{
	queries_total: u64,
	queries_failed: u64,
	recent_query_times: VecDeque<Duration>,
}

/// Thread-safe per-[`Connection`](crate::registry::Connection) metrics.
#[derive(Debug, Default)]
pub struct ConnectionMetrics
{
	inner: Mutex<Inner>,
}

/// A point-in-time snapshot of [`ConnectionMetrics`], as returned by
/// `status()` (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot
{
	pub queries_total: u64,
	pub queries_failed: u64,
	pub mean_query_time_ms: Option<f64>,
}

impl ConnectionMetrics
{
	pub fn new() -> Self
	{
		Self::default()
	}

	/// Records a completed query's duration, stamping it before and after
	/// like the generic connector's `before_cursor_execute`/
	/// `after_cursor_execute` hooks.
	pub async fn record_query(&self, connection_name: &str, statement: &str, duration: Duration)
	{
		let mut inner = self.inner.lock().await;

		inner.queries_total += 1;

		if inner.recent_query_times.len() == RECENT_QUERY_TIMES_CAPACITY {
			inner.recent_query_times.pop_front();
		}
		inner.recent_query_times.push_back(duration);

		if duration > SLOW_QUERY_THRESHOLD {
			tracing::warn!(
				connection_name,
				duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
				statement = sanitize_sql_for_logging(statement),
				"slow query",
			);
		}
	}

	pub async fn record_failure(&self)
	{
		self.inner.lock().await.queries_failed += 1;
	}

	pub async fn snapshot(&self) -> MetricsSnapshot
	{
		let inner = self.inner.lock().await;

		let mean_query_time_ms = if inner.recent_query_times.is_empty() {
			None
		} else {
			let total_ms: f64 =
				inner.recent_query_times.iter().map(Duration::as_secs_f64).sum::<f64>() * 1_000.0;
			Some(total_ms / inner.recent_query_times.len() as f64)
		};

		MetricsSnapshot {
			queries_total: inner.queries_total,
			queries_failed: inner.queries_failed,
			mean_query_time_ms,
		}
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[tokio::test]
	async fn ring_buffer_is_bounded()
	{
		let metrics = ConnectionMetrics::new();

		for _ in 0..(RECENT_QUERY_TIMES_CAPACITY + 10) {
			metrics.record_query("t", "SELECT 1", Duration::from_millis(1)).await;
		}

		let inner = metrics.inner.lock().await;
		assert_eq!(inner.recent_query_times.len(), RECENT_QUERY_TIMES_CAPACITY);
		assert_eq!(inner.queries_total, (RECENT_QUERY_TIMES_CAPACITY + 10) as u64);
	}
}
