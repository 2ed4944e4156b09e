//! Minimal `tracing-subscriber` init helper for embedding binaries and
//! tests, mirroring the teacher's layered `Registry` composition in
//! `logging::init` (stripped of the HTTP-server-specific audit-log/Axiom
//! layers, which are out of this core's scope).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Installs a global `tracing` subscriber writing to stderr, honoring
/// `RUST_LOG` (defaulting to `info`). Safe to call more than once in tests;
/// subsequent calls are no-ops.
pub fn init()
{
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	let _ = Registry::default().with(filter).with(fmt::layer().with_target(true)).try_init();
}
