use std::sync::Arc;

use tokio::sync::Notify;

use ssd_ipc::Responder;
use ssd_supervisor::{LoadMode, Registry, ServiceRecord, ServiceState, Supervisor};

use crate::config::GlobalConfig;
use crate::protocol::{block, JobKind, JobRequest, ALL, APP_NAME};

/// Applies control jobs to the registry and the supervisor. Only one job
/// runs at a time; see [`super::dispatch_loop`].
pub struct Dispatcher {
	supervisor: Arc<Supervisor>,
	config: GlobalConfig,
	shutdown: Arc<Notify>,
}

impl Dispatcher {
	pub fn new(supervisor: Arc<Supervisor>, config: GlobalConfig, shutdown: Arc<Notify>) -> Self {
		Self {
			supervisor,
			config,
			shutdown,
		}
	}

	pub fn supervisor(&self) -> &Arc<Supervisor> {
		&self.supervisor
	}

	fn registry(&self) -> &Registry {
		self.supervisor.registry()
	}

	pub async fn dispatch(&self, job: JobRequest, out: &Responder) {
		tracing::debug!("dispatch {} {:?}", job.kind.label(), job.name);
		match job.kind {
			JobKind::Close => {}
			JobKind::Start => self.start(&job.name, out).await,
			JobKind::Stop => self.stop(&job.name, out).await,
			JobKind::Restart => self.restart(&job.name, out).await,
			JobKind::Status => self.status(&job.name, out).await,
			JobKind::Enable => self.set_enabled(&job.name, true, out).await,
			JobKind::Disable => self.set_enabled(&job.name, false, out).await,
			JobKind::Create => self.create(&job, out).await,
			JobKind::Remove => self.remove(&job.name, out).await,
			JobKind::List => self.list(&job.name, out).await,
			JobKind::Update => self.update(out).await,
			JobKind::Shutdown => self.shutdown(out),
			JobKind::SetPriority => self.set_priority(&job, out).await,
		}
	}

	async fn start(&self, name: &str, out: &Responder) {
		if name == ALL {
			self.registry()
				.for_each(move |name, record| async move {
					if record.enabled {
						let outcome = self.supervisor.start(&name, &record).await;
						out.send(block(&name, JobKind::Start, &outcome.message));
					}
					true
				})
				.await;
			return;
		}

		let Some(record) = self.lookup(name, JobKind::Start, out).await else {
			return;
		};
		let outcome = self.supervisor.start(name, &record).await;
		out.send(block(name, JobKind::Start, &outcome.message));
	}

	async fn stop(&self, name: &str, out: &Responder) {
		if name == ALL {
			self.registry()
				.for_each(move |name, record| async move {
					if self.in_bulk_stop(&name, &record) {
						let outcome = self.supervisor.stop(&name, &record).await;
						out.send(block(&name, JobKind::Stop, &outcome.to_string()));
					}
					true
				})
				.await;
			return;
		}

		let Some(record) = self.lookup(name, JobKind::Stop, out).await else {
			return;
		};
		let outcome = self.supervisor.stop(name, &record).await;
		out.send(block(name, JobKind::Stop, &outcome.to_string()));
	}

	async fn restart(&self, name: &str, out: &Responder) {
		if name == ALL {
			self.registry()
				.for_each(move |name, record| async move {
					if self.in_bulk_stop(&name, &record) {
						self.restart_one(&name, &record, out).await;
					}
					true
				})
				.await;
			return;
		}

		let Some(record) = self.lookup(name, JobKind::Restart, out).await else {
			return;
		};
		self.restart_one(name, &record, out).await;
	}

	async fn restart_one(&self, name: &str, record: &ServiceRecord, out: &Responder) {
		let outcome = self
			.supervisor
			.restart(name, record, |stopped| {
				out.send(block(name, JobKind::Stop, &stopped.to_string()));
			})
			.await;
		out.send(block(name, JobKind::Start, &outcome.message));
	}

	async fn status(&self, name: &str, out: &Responder) {
		if name == ALL || name.is_empty() {
			self.registry()
				.for_each(move |name, record| async move {
					out.send(block(&name, JobKind::Status, &self.describe(&record)));
					true
				})
				.await;
			return;
		}

		let Some(record) = self.lookup(name, JobKind::Status, out).await else {
			return;
		};
		out.send(block(name, JobKind::Status, &self.describe(&record)));
	}

	async fn set_enabled(&self, name: &str, enabled: bool, out: &Responder) {
		let (kind, word) = if enabled {
			(JobKind::Enable, "enabled")
		} else {
			(JobKind::Disable, "disabled")
		};
		if self.reject_all(name, kind, out) {
			return;
		}
		let message = match self.registry().set_enabled(name, enabled).await {
			Ok(true) => word.to_string(),
			Ok(false) => format!("already {}", word),
			Err(ssd_supervisor::RegistryError::NotFound(_)) => unknown(name),
			Err(e) => format!("failed, {}", e),
		};
		out.send(block(name, kind, &message));
	}

	async fn create(&self, job: &JobRequest, out: &Responder) {
		let name = job.name.as_str();
		if self.reject_all(name, JobKind::Create, out) {
			return;
		}
		if job.exec.trim().is_empty() {
			out.send(block(name, JobKind::Create, "failed, missing executable"));
			return;
		}

		let record = ServiceRecord::new(job.exec.trim(), job.params.clone());
		let message = match self.registry().add(name, record).await {
			Ok(record) => format!("created\n{}", definition(&record)),
			Err(e) => format!("failed, {}", e),
		};
		out.send(block(name, JobKind::Create, &message));
	}

	async fn remove(&self, name: &str, out: &Responder) {
		if self.reject_all(name, JobKind::Remove, out) {
			return;
		}
		let Some(record) = self.lookup(name, JobKind::Remove, out).await else {
			return;
		};
		let live = self.supervisor.probe(&record);
		let message = match self.registry().remove(name).await {
			Ok(()) => match live {
				Some(live) => format!("removed, still running\n{}", live.descriptor),
				None => "removed".to_string(),
			},
			Err(e) => format!("failed, {}", e),
		};
		out.send(block(name, JobKind::Remove, &message));
	}

	async fn list(&self, name: &str, out: &Responder) {
		if name == ALL || name.is_empty() {
			if self.registry().is_empty().await {
				out.send(block(ALL, JobKind::List, "no services"));
				return;
			}
			self.registry()
				.for_each(move |name, record| async move {
					out.send(block(&name, JobKind::List, &definition(&record)));
					true
				})
				.await;
			return;
		}

		let Some(record) = self.lookup(name, JobKind::List, out).await else {
			return;
		};
		out.send(block(name, JobKind::List, &definition(&record)));
	}

	async fn update(&self, out: &Responder) {
		let loaded = match self.registry().load(LoadMode::Update).await {
			Ok(n) => n,
			Err(e) => {
				out.send(block(ALL, JobKind::Update, &format!("failed, {}", e)));
				return;
			}
		};
		let message = match self.registry().print().await {
			Ok(listing) => format!("loaded {} services\n{}", loaded, listing.trim_end()),
			Err(e) => format!("loaded {} services\n{}", loaded, e),
		};
		out.send(block(ALL, JobKind::Update, &message));
	}

	fn shutdown(&self, out: &Responder) {
		tracing::info!("shutdown requested by client");
		out.send(block(APP_NAME, JobKind::Shutdown, "shutting down"));
		self.shutdown.notify_one();
	}

	async fn set_priority(&self, job: &JobRequest, out: &Responder) {
		let name = job.name.as_str();
		if self.reject_all(name, JobKind::SetPriority, out) {
			return;
		}
		let raw = job.params.first().map(|p| p.trim()).unwrap_or_default();
		let Ok(value) = raw.parse::<u32>() else {
			out.send(block(name, JobKind::SetPriority, &format!("invalid priority {:?}", raw)));
			return;
		};
		let message = match self.registry().set_priority(name, value).await {
			Ok(effective) => format!("priority {}", effective),
			Err(ssd_supervisor::RegistryError::NotFound(_)) => unknown(name),
			Err(e) => format!("failed, {}", e),
		};
		out.send(block(name, JobKind::SetPriority, &message));
	}

	async fn lookup(&self, name: &str, kind: JobKind, out: &Responder) -> Option<ServiceRecord> {
		let record = self.registry().get(name).await;
		if record.is_none() {
			out.send(block(name, kind, &unknown(name)));
		}
		record
	}

	fn reject_all(&self, name: &str, kind: JobKind, out: &Responder) -> bool {
		if name != ALL {
			return false;
		}
		out.send(block(name, kind, &format!("{} is not allowed on all", kind.label().to_lowercase())));
		true
	}

	fn in_bulk_stop(&self, name: &str, record: &ServiceRecord) -> bool {
		if !record.enabled {
			return false;
		}
		if self.config.is_protected(&record.exec) {
			tracing::info!("skipping protected service {} ({})", name, record.exec);
			return false;
		}
		true
	}

	fn describe(&self, record: &ServiceRecord) -> String {
		let live = self.supervisor.probe(record);
		let state = ServiceState::of(record, live.is_some());
		let mut text = format!("{}\nstate: {}", definition(record), state);
		if let Some(live) = live {
			text.push('\n');
			text.push_str(&live.descriptor);
		}
		text
	}
}

fn unknown(name: &str) -> String {
	format!("unknown program: {}", name)
}

fn definition(record: &ServiceRecord) -> String {
	match serde_yaml::to_string(record) {
		Ok(yaml) => yaml.trim_end().to_string(),
		Err(e) => format!("cannot encode: {}", e),
	}
}
