use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::paths::DaemonPaths;
use crate::server::{self, Flow, Responder, ServeError, ServerOptions};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
	#[error("daemon already running")]
	AlreadyRunning,
	#[error("daemon not running")]
	NotRunning,
	#[error("failed to start daemon: {0}")]
	Spawn(std::io::Error),
	#[error("daemon did not open its socket in time")]
	StartTimeout,
	#[error("failed to signal daemon (pid {pid}): {source}")]
	Signal { pid: i32, source: nix::Error },
}

pub struct Daemon {
	pub paths: DaemonPaths,
}

impl Daemon {
	pub fn new(paths: DaemonPaths) -> Self {
		Self { paths }
	}

	/// Serve `handler` on the daemon socket until `shutdown` resolves or the
	/// process receives SIGINT/SIGTERM, then remove the socket and pid file.
	///
	/// A stale socket left by a crashed instance is removed before binding;
	/// one that still accepts connections belongs to a live daemon and is
	/// left alone. Either failure is returned to the caller, which should
	/// exit non-zero.
	pub async fn run<Req, F, Fut, S>(
		&self,
		options: ServerOptions,
		handler: F,
		shutdown: S,
	) -> Result<(), ServeError>
	where
		Req: DeserializeOwned + Send + 'static,
		F: Fn(Req, Responder) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Flow> + Send + 'static,
		S: Future<Output = ()>,
	{
		let state_dir = self.paths.state_dir();
		if let Err(e) = std::fs::create_dir_all(&state_dir) {
			tracing::warn!("cannot create {}: {}", state_dir.display(), e);
		}

		let socket_path = self.paths.socket_path();
		if let Some(parent) = socket_path.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		if crate::client::is_running(&self.paths) {
			return Err(ServeError::AlreadyRunning(socket_path));
		}
		if socket_path.exists() {
			tracing::info!("removing stale socket {}", socket_path.display());
			let _ = std::fs::remove_file(&socket_path);
		}

		let listener = server::bind(&self.paths)?;
		let _ = std::fs::write(self.paths.pid_path(), std::process::id().to_string());

		tracing::info!(
			"daemon started (pid {}), listening on {}",
			std::process::id(),
			socket_path.display()
		);

		let server_handle = tokio::spawn(server::serve(listener, options, handler));

		tokio::select! {
			_ = shutdown => {
				tracing::info!("shutdown requested");
			}
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("interrupted, shutting down");
			}
			_ = terminate_signal() => {
				tracing::info!("terminated, shutting down");
			}
		}

		server_handle.abort();
		self.cleanup();
		Ok(())
	}

	pub fn cleanup(&self) {
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}

	/// Re-execute the current binary with `args` detached from this terminal
	/// and wait until its socket accepts connections.
	pub fn start_background(&self, args: &[&str], log_file: Option<&Path>) -> Result<(), DaemonError> {
		if crate::client::is_running(&self.paths) {
			return Err(DaemonError::AlreadyRunning);
		}

		let binary = find_current_binary();
		let mut cmd = std::process::Command::new(&binary);
		cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null());

		let stderr = log_file
			.and_then(|path| {
				if let Some(parent) = path.parent() {
					let _ = std::fs::create_dir_all(parent);
				}
				OpenOptions::new().create(true).append(true).open(path).ok()
			})
			.map(Stdio::from)
			.unwrap_or_else(Stdio::null);
		cmd.stderr(stderr);

		{
			use std::os::unix::process::CommandExt;
			cmd.process_group(0);
		}

		cmd.spawn().map_err(DaemonError::Spawn)?;

		for _ in 0..50 {
			std::thread::sleep(Duration::from_millis(100));
			if crate::client::is_running(&self.paths) {
				return Ok(());
			}
		}
		Err(DaemonError::StartTimeout)
	}

	pub fn stop(&self) -> Result<i32, DaemonError> {
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;

		let pid = crate::client::read_pid(&self.paths).ok_or(DaemonError::NotRunning)? as i32;
		match kill(Pid::from_raw(pid), Signal::SIGTERM) {
			Ok(()) => Ok(pid),
			Err(nix::errno::Errno::ESRCH) => {
				self.cleanup();
				Err(DaemonError::NotRunning)
			}
			Err(source) => Err(DaemonError::Signal { pid, source }),
		}
	}
}

async fn terminate_signal() {
	use tokio::signal::unix::{signal, SignalKind};
	match signal(SignalKind::terminate()) {
		Ok(mut term) => {
			term.recv().await;
		}
		Err(e) => {
			tracing::warn!("cannot install SIGTERM handler: {}", e);
			std::future::pending::<()>().await;
		}
	}
}

fn find_current_binary() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ssdctl"))
}
