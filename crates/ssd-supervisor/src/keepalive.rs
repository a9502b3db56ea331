use std::sync::Mutex;
use std::time::Duration;

use crate::record::ServiceState;
use crate::supervisor::Supervisor;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);
/// Pause after each automatic start so services come up one at a time.
pub const AUTO_START_GAP: Duration = Duration::from_millis(500);

pub fn clamp_interval(secs: u64) -> Duration {
	Duration::from_secs(secs).clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Start every enabled service that is neither running nor manually stopped,
/// in priority order. Returns the names that were started.
pub async fn sweep(supervisor: &Supervisor) -> Vec<String> {
	let started = Mutex::new(Vec::new());
	let started_ref = &started;

	supervisor
		.registry()
		.for_each(move |name, record| async move {
			let alive = supervisor.probe(&record).is_some();
			if !ServiceState::of(&record, alive).wants_keepalive(&record) {
				return true;
			}

			tracing::info!("keepalive: {} is down, starting", name);
			let outcome = supervisor.start(&name, &record).await;
			if outcome.started {
				if let Ok(mut names) = started_ref.lock() {
					names.push(name);
				}
			} else {
				tracing::warn!("keepalive: {} did not start: {}", name, outcome.message);
			}
			tokio::time::sleep(AUTO_START_GAP).await;
			true
		})
		.await;

	started.into_inner().unwrap_or_default()
}
