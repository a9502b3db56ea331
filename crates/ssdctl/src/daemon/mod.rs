pub mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use ssd_ipc::{Daemon, Flow, Responder, ServeError, ServerOptions};
use ssd_supervisor::{keepalive, LoadMode, ProcFs, Registry, Supervisor, SupervisorConfig};

use crate::config::GlobalConfig;
use crate::protocol::{block, JobKind, JobRequest};
use dispatch::Dispatcher;

/// Time for the last reply to reach the client after a Shutdown job.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// A decoded job waiting for the dispatcher. `done` fires once every reply
/// for it has been sent.
pub struct Queued {
	pub job: JobRequest,
	pub out: Responder,
	pub done: oneshot::Sender<()>,
}

pub async fn run(config: GlobalConfig) -> Result<(), ServeError> {
	let paths = config.daemon_paths();
	if ssd_ipc::client::is_running(&paths) {
		return Err(ServeError::AlreadyRunning(paths.socket_path()));
	}
	let layout = config.layout(&paths);

	let registry = Arc::new(Registry::new(&layout.services_dir, &layout.pid_dir));
	if let Err(e) = registry.migrate_legacy(&layout.legacy_file) {
		tracing::error!("cannot migrate {}: {}", layout.legacy_file.display(), e);
	}
	if let Err(e) = registry.load(LoadMode::Initial).await {
		tracing::error!("cannot load services: {}", e);
	}

	let supervisor = Supervisor::new(
		Arc::clone(&registry),
		Arc::new(ProcFs::from_env()),
		SupervisorConfig {
			log_dir: layout.log_dir.clone(),
			max_log_size: config.logs.max_size_bytes,
		},
	);

	let shutdown = Arc::new(Notify::new());
	let dispatcher = Arc::new(Dispatcher::new(supervisor, config.clone(), Arc::clone(&shutdown)));
	let (queue, jobs) = mpsc::channel::<Queued>(config.queue_depth());
	let keepalive_interval = config.keepalive_interval();
	tracing::info!(
		"keepalive every {:?}, services in {}",
		keepalive_interval,
		layout.services_dir.display()
	);
	let dispatch_handle = tokio::spawn(dispatch_loop(dispatcher, jobs, keepalive_interval));

	let options = ServerOptions {
		idle_timeout: config.idle_timeout(),
	};
	let daemon = Daemon::new(paths);
	let result = daemon
		.run(
			options,
			move |job: JobRequest, out: Responder| {
				let queue = queue.clone();
				async move { enqueue(&queue, job, out).await }
			},
			async move {
				shutdown.notified().await;
				tokio::time::sleep(SHUTDOWN_GRACE).await;
			},
		)
		.await;

	dispatch_handle.abort();
	tracing::info!("daemon stopped");
	result
}

/// Connection side: hand the job to the dispatcher and wait for it to finish
/// so replies for one connection never interleave.
pub async fn enqueue(queue: &mpsc::Sender<Queued>, job: JobRequest, out: Responder) -> Flow {
	if job.kind == JobKind::Close {
		return Flow::Close;
	}
	let closes = job.kind == JobKind::Shutdown;
	let (done, finished) = oneshot::channel();
	if queue.send(Queued { job, out, done }).await.is_err() {
		tracing::warn!("dispatcher gone, dropping connection");
		return Flow::Close;
	}
	let _ = finished.await;
	if closes {
		Flow::Close
	} else {
		Flow::Continue
	}
}

/// The only place jobs and keepalive sweeps run, one at a time. The keepalive
/// timer restarts after every job so a sweep never follows client activity
/// immediately.
pub async fn dispatch_loop(dispatcher: Arc<Dispatcher>, mut jobs: mpsc::Receiver<Queued>, keepalive_interval: Duration) {
	let mut ticker = tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				let supervisor = Arc::clone(dispatcher.supervisor());
				match tokio::spawn(async move { keepalive::sweep(&supervisor).await }).await {
					Ok(started) if !started.is_empty() => {
						tracing::info!("keepalive started {}", started.join(", "));
					}
					Ok(_) => {}
					Err(e) => tracing::error!("keepalive sweep failed: {}", e),
				}
			}
			queued = jobs.recv() => {
				let Some(queued) = queued else {
					break;
				};
				run_job(&dispatcher, queued).await;
				ticker.reset();
			}
		}
	}
}

async fn run_job(dispatcher: &Arc<Dispatcher>, queued: Queued) {
	let Queued { job, out, done } = queued;
	let kind = job.kind;
	let name = job.name.clone();

	let worker = Arc::clone(dispatcher);
	let reply_to = out.clone();
	let task = tokio::spawn(async move {
		worker.dispatch(job, &reply_to).await;
	});
	if let Err(e) = task.await {
		tracing::error!("{} {} panicked: {}", kind.label(), name, e);
		out.send(block(&name, kind, "internal error"));
	}
	let _ = done.send(());
}
