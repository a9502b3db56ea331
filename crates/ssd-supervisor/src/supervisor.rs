use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};

use crate::liveness::{self, Liveness, ProcessTable};
use crate::logs;
use crate::placeholders::Placeholders;
use crate::record::{ServiceRecord, MIN_SETTLE_SECS};
use crate::registry::Registry;

/// How often a stopping process is checked for exit.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Checks before a stopping process is killed outright.
pub const STOP_POLL_ATTEMPTS: u32 = 7;
/// Pause between the stop and start halves of a restart.
pub const RESTART_GAP: Duration = Duration::from_secs(2);

pub struct SupervisorConfig {
	pub log_dir: PathBuf,
	pub max_log_size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
	#[error("cannot open log: {0}")]
	Log(std::io::Error),
	#[error("cannot spawn {exec}: {source}")]
	Spawn { exec: String, source: std::io::Error },
	#[error("process exited within {0}s")]
	Exited(u32),
}

/// Result of a start attempt, already phrased for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
	pub message: String,
	pub started: bool,
	pub pid: Option<i32>,
}

impl StartOutcome {
	fn already_running(live: &Liveness) -> Self {
		Self {
			message: format!("still running\n{}", live.descriptor),
			started: false,
			pid: Some(live.pid),
		}
	}

	fn failed(err: &LaunchError) -> Self {
		Self {
			message: format!("failed, {}", err),
			started: false,
			pid: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
	NotRunning,
	Stopped { pid: i32, forced: bool },
	/// The process could not be signalled; nothing was changed.
	Failed { pid: i32, error: Errno },
}

impl fmt::Display for StopOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StopOutcome::NotRunning => write!(f, "not running"),
			StopOutcome::Stopped { pid, forced: false } => write!(f, "done, pid={}", pid),
			StopOutcome::Stopped { pid, forced: true } => write!(f, "done, pid={} (killed)", pid),
			StopOutcome::Failed { pid, error } => write!(f, "failed to stop pid={}: {}", pid, error),
		}
	}
}

/// Starts and stops registry services as detached process groups.
pub struct Supervisor {
	registry: Arc<Registry>,
	table: Arc<dyn ProcessTable>,
	config: SupervisorConfig,
}

impl Supervisor {
	pub fn new(registry: Arc<Registry>, table: Arc<dyn ProcessTable>, config: SupervisorConfig) -> Arc<Self> {
		Arc::new(Self {
			registry,
			table,
			config,
		})
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn table(&self) -> &dyn ProcessTable {
		self.table.as_ref()
	}

	pub fn probe(&self, record: &ServiceRecord) -> Option<Liveness> {
		liveness::is_running(self.table.as_ref(), record)
	}

	/// Launch `name` unless an instance is already alive, wait out its settle
	/// time and confirm it is still running.
	///
	/// Whatever the outcome, the service is no longer manually stopped, so
	/// keepalive takes care of it again.
	pub async fn start(&self, name: &str, record: &ServiceRecord) -> StartOutcome {
		let mut outcome = self.launch(name, record).await;
		let pid = outcome.pid.unwrap_or(0);
		if let Err(e) = self.registry.set_runtime_state(name, pid, false).await {
			tracing::warn!("{}: cannot record pid {}: {}", name, pid, e);
			if outcome.started {
				outcome.message.push_str(&format!("\nwarning: {}", e));
			}
		}
		outcome
	}

	async fn launch(&self, name: &str, record: &ServiceRecord) -> StartOutcome {
		if let Some(live) = self.probe(record) {
			return StartOutcome::already_running(&live);
		}

		let placeholders = Placeholders::resolve(&record.replace).await;
		let args = placeholders.expand_all(&record.params);

		let child_pid = match self.spawn(name, record, &args) {
			Ok(pid) => pid,
			Err(e) => {
				tracing::error!("{}: {}", name, e);
				return StartOutcome::failed(&e);
			}
		};

		let settle = record.start_settle_secs.max(MIN_SETTLE_SECS);
		tokio::time::sleep(Duration::from_secs(settle as u64)).await;

		let probe = ServiceRecord {
			pid: child_pid,
			..record.clone()
		};
		let Some(live) = self.probe(&probe) else {
			let err = LaunchError::Exited(settle);
			tracing::warn!("{}: {}", name, err);
			return StartOutcome::failed(&err);
		};

		tracing::info!("started {} (pid {})", name, live.pid);

		let mut message = format!("done, PID: {}\n|>> {}", live.pid, record.exec);
		for arg in &args {
			message.push(' ');
			message.push_str(arg);
		}
		StartOutcome {
			message,
			started: true,
			pid: Some(live.pid),
		}
	}

	/// SIGTERM the running instance, wait for it to exit and SIGKILL it if
	/// it does not. The service is marked as manually stopped unless a
	/// signal could not be delivered.
	pub async fn stop(&self, name: &str, record: &ServiceRecord) -> StopOutcome {
		let Some(live) = self.probe(record) else {
			self.mark_stopped(name).await;
			return StopOutcome::NotRunning;
		};
		let pid = live.pid;

		let mut exited = false;
		match self.table.signal(pid, Signal::SIGTERM) {
			Ok(()) => {}
			Err(Errno::ESRCH) => exited = true,
			Err(error) => {
				tracing::error!("{}: cannot signal pid {}: {}", name, pid, error);
				return StopOutcome::Failed { pid, error };
			}
		}

		for _ in 0..STOP_POLL_ATTEMPTS {
			if exited {
				break;
			}
			tokio::time::sleep(STOP_POLL_INTERVAL).await;
			exited = self.table.command_line(pid).is_none();
		}

		let forced = !exited;
		if forced {
			tracing::warn!("{}: pid {} ignored SIGTERM, killing", name, pid);
			match self.table.signal(pid, Signal::SIGKILL) {
				Ok(()) | Err(Errno::ESRCH) => {}
				Err(error) => {
					tracing::error!("{}: cannot kill pid {}: {}", name, pid, error);
					return StopOutcome::Failed { pid, error };
				}
			}
		}

		self.mark_stopped(name).await;
		tracing::info!("stopped {} (pid {})", name, pid);
		StopOutcome::Stopped { pid, forced }
	}

	/// Stop, pause, then start again. `on_stopped` sees the stop result
	/// before the start begins.
	pub async fn restart<F>(&self, name: &str, record: &ServiceRecord, on_stopped: F) -> StartOutcome
	where
		F: FnOnce(&StopOutcome),
	{
		let stopped = self.stop(name, record).await;
		on_stopped(&stopped);
		if let StopOutcome::Failed { .. } = stopped {
			return StartOutcome {
				message: "not restarted".into(),
				started: false,
				pid: None,
			};
		}

		tokio::time::sleep(RESTART_GAP).await;
		let current = self.registry.get(name).await.unwrap_or_else(|| record.clone());
		self.start(name, &current).await
	}

	async fn mark_stopped(&self, name: &str) {
		if let Err(e) = self.registry.set_runtime_state(name, 0, true).await {
			tracing::warn!("{}: cannot clear runtime state: {}", name, e);
		}
	}

	fn spawn(&self, name: &str, record: &ServiceRecord, args: &[String]) -> Result<i32, LaunchError> {
		let mut cmd = Command::new(&record.exec);
		cmd.args(args)
			.current_dir(record.working_dir())
			.stdin(Stdio::null())
			.process_group(0);

		for (key, value) in record.env_pairs() {
			cmd.env(key, value);
		}

		if record.log_to_file {
			let log = logs::open_service_log(&self.config.log_dir, name, self.config.max_log_size)
				.map_err(LaunchError::Log)?;
			let err = log.try_clone().map_err(LaunchError::Log)?;
			cmd.stdout(Stdio::from(log)).stderr(Stdio::from(err));
		} else {
			cmd.stdout(Stdio::null()).stderr(Stdio::null());
		}

		let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
			exec: record.exec.clone(),
			source,
		})?;
		let pid = child.id().map(|id| id as i32).unwrap_or(0);
		tracing::info!("spawned {} (pid {}): {} {}", name, pid, record.exec, args.join(" "));

		let service = name.to_string();
		tokio::spawn(async move {
			reap(service, child).await;
		});
		Ok(pid)
	}
}

/// Wait on the child so it does not linger as a zombie after exiting.
async fn reap(service: String, mut child: Child) {
	match child.wait().await {
		Ok(status) => tracing::info!("{} exited: {}", service, status),
		Err(e) => tracing::warn!("{}: wait failed: {}", service, e),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stop_outcome_messages() {
		assert_eq!(StopOutcome::NotRunning.to_string(), "not running");
		assert_eq!(
			StopOutcome::Stopped { pid: 12, forced: false }.to_string(),
			"done, pid=12"
		);
		assert_eq!(
			StopOutcome::Failed { pid: 1, error: Errno::EPERM }.to_string(),
			format!("failed to stop pid=1: {}", Errno::EPERM)
		);
	}

	#[test]
	fn failed_start_message() {
		let outcome = StartOutcome::failed(&LaunchError::Exited(2));
		assert_eq!(outcome.message, "failed, process exited within 2s");
		assert!(!outcome.started);
	}

	use crate::record::ServiceState;
	use crate::testing::FakeProcessTable;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	async fn fixture(name: &str, table: Arc<FakeProcessTable>) -> (Arc<Supervisor>, ServiceRecord, PathBuf) {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("ssd-sup-unit-{}-{}-{}", std::process::id(), n, name));
		let _ = std::fs::remove_dir_all(&dir);
		let registry = Arc::new(Registry::new(dir.join("services"), dir.join("pids")));
		let record = registry
			.add("web", ServiceRecord::new("/opt/bin/web", vec!["-http=80".into()]))
			.await
			.unwrap();
		let sup = Supervisor::new(
			registry,
			table,
			SupervisorConfig {
				log_dir: dir.join("logs"),
				max_log_size: 1024,
			},
		);
		(sup, record, dir)
	}

	#[tokio::test(start_paused = true)]
	async fn stop_terminates_gracefully() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(100, "/opt/bin/web", &["-http=80"]);
		let (sup, record, dir) = fixture("graceful", Arc::clone(&table)).await;

		let outcome = sup.stop("web", &record).await;
		assert_eq!(outcome, StopOutcome::Stopped { pid: 100, forced: false });
		assert_eq!(table.signals(), vec![(100, Signal::SIGTERM)]);

		let after = sup.registry().get("web").await.unwrap();
		assert!(after.manually_stopped);
		assert_eq!(after.pid, 0);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_escalates_to_sigkill_once() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(200, "/opt/bin/web", &["-http=80"]);
		table.ignore_term(200);
		let (sup, record, dir) = fixture("stubborn", Arc::clone(&table)).await;

		let begin = tokio::time::Instant::now();
		let outcome = sup.stop("web", &record).await;
		assert_eq!(outcome, StopOutcome::Stopped { pid: 200, forced: true });
		assert_eq!(
			table.signals(),
			vec![(200, Signal::SIGTERM), (200, Signal::SIGKILL)]
		);
		assert!(begin.elapsed() >= STOP_POLL_INTERVAL * STOP_POLL_ATTEMPTS);
		assert!(!table.is_alive(200));
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_signal_failure_leaves_state_alone() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(300, "/opt/bin/web", &["-http=80"]);
		table.deny_signals(300);
		let (sup, record, dir) = fixture("denied", Arc::clone(&table)).await;
		sup.registry().set_runtime_state("web", 300, false).await.unwrap();

		let outcome = sup.stop("web", &record).await;
		assert_eq!(outcome, StopOutcome::Failed { pid: 300, error: Errno::EPERM });
		let after = sup.registry().get("web").await.unwrap();
		assert!(!after.manually_stopped);
		assert_eq!(after.pid, 300);
		assert!(sup.registry().pid_path("web").exists());
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_failed_kill_leaves_state_alone() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(350, "/opt/bin/web", &["-http=80"]);
		table.ignore_term(350);
		table.deny_kill(350);
		let (sup, record, dir) = fixture("killdenied", Arc::clone(&table)).await;
		sup.registry().set_runtime_state("web", 350, false).await.unwrap();

		let outcome = sup.stop("web", &record).await;
		assert_eq!(outcome, StopOutcome::Failed { pid: 350, error: Errno::EPERM });
		assert_eq!(
			table.signals(),
			vec![(350, Signal::SIGTERM), (350, Signal::SIGKILL)]
		);
		assert!(table.is_alive(350));
		let after = sup.registry().get("web").await.unwrap();
		assert!(!after.manually_stopped);
		assert_eq!(after.pid, 350);
		assert!(sup.registry().pid_path("web").exists());
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_when_not_running_sends_nothing() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(400, "/opt/bin/other", &[]);
		let (sup, record, dir) = fixture("idle", Arc::clone(&table)).await;

		assert_eq!(sup.stop("web", &record).await, StopOutcome::NotRunning);
		assert!(table.signals().is_empty());
		assert!(sup.registry().get("web").await.unwrap().manually_stopped);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn start_reports_existing_instance() {
		let table = Arc::new(FakeProcessTable::new());
		table.insert(500, "/opt/bin/web", &["-http=80", "-v"]);
		let (sup, record, dir) = fixture("existing", Arc::clone(&table)).await;

		let outcome = sup.start("web", &record).await;
		assert!(!outcome.started);
		assert_eq!(outcome.pid, Some(500));
		assert_eq!(outcome.message, "still running\n500\t/opt/bin/web -http=80 -v");
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test(start_paused = true)]
	async fn start_on_live_instance_resumes_keepalive() {
		let table = Arc::new(FakeProcessTable::new());
		let (sup, record, dir) = fixture("resume", Arc::clone(&table)).await;
		sup.stop("web", &record).await;
		assert!(sup.registry().get("web").await.unwrap().manually_stopped);

		// started outside the supervisor after the manual stop
		table.insert(77, "/opt/bin/web", &["-http=80"]);
		let outcome = sup.start("web", &record).await;
		assert!(!outcome.started);

		let after = sup.registry().get("web").await.unwrap();
		assert!(!after.manually_stopped);
		assert_eq!(after.pid, 77);

		table.exit(77);
		let alive = sup.probe(&after).is_some();
		let state = ServiceState::of(&after, alive);
		assert_eq!(state, ServiceState::Stopped);
		assert!(state.wants_keepalive(&after));
		let _ = std::fs::remove_dir_all(&dir);
	}
}
