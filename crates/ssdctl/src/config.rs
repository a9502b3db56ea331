use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use ssd_ipc::DaemonPaths;

use crate::protocol::APP_NAME;

const LEGACY_FILE_NAME: &str = "ssdctld.yaml";

// ── <config_dir>/config.toml ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub paths: PathsConfig,
	#[serde(default)]
	pub logs: LogsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_keepalive_secs")]
	pub keepalive_secs: u64,
	#[serde(default = "default_idle_timeout_secs")]
	pub idle_timeout_secs: u64,
	#[serde(default = "default_queue_depth")]
	pub queue_depth: usize,
	#[serde(default = "default_protected")]
	pub protected: Vec<String>,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			keepalive_secs: default_keepalive_secs(),
			idle_timeout_secs: default_idle_timeout_secs(),
			queue_depth: default_queue_depth(),
			protected: default_protected(),
		}
	}
}

fn default_keepalive_secs() -> u64 { 60 }
fn default_idle_timeout_secs() -> u64 { 60 }
fn default_queue_depth() -> usize { 64 }
fn default_protected() -> Vec<String> {
	["caddy", "nginx", "ttyd", "tmux"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PathsConfig {
	pub services_dir: Option<PathBuf>,
	pub pid_dir: Option<PathBuf>,
	pub log_dir: Option<PathBuf>,
	pub socket: Option<PathBuf>,
	/// Single-file service map from older installs, split up on startup.
	pub legacy_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
	#[serde(default = "default_max_size")]
	pub max_size_bytes: u64,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self { max_size_bytes: default_max_size() }
	}
}

fn default_max_size() -> u64 { 10 * 1024 * 1024 }

/// Where the daemon keeps its files once config and XDG defaults are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
	pub services_dir: PathBuf,
	pub pid_dir: PathBuf,
	pub log_dir: PathBuf,
	pub legacy_file: PathBuf,
}

impl GlobalConfig {
	pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(content)
	}

	pub fn keepalive_interval(&self) -> Duration {
		ssd_supervisor::keepalive::clamp_interval(self.daemon.keepalive_secs)
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.daemon.idle_timeout_secs.max(1))
	}

	pub fn queue_depth(&self) -> usize {
		self.daemon.queue_depth.max(1)
	}

	pub fn daemon_paths(&self) -> DaemonPaths {
		let paths = DaemonPaths::new(APP_NAME);
		match &self.paths.socket {
			Some(socket) => paths.with_socket(socket.clone()),
			None => paths,
		}
	}

	pub fn layout(&self, paths: &DaemonPaths) -> Layout {
		let state_dir = paths.state_dir();
		Layout {
			services_dir: self
				.paths
				.services_dir
				.clone()
				.unwrap_or_else(|| paths.config_dir().join("services")),
			pid_dir: self.paths.pid_dir.clone().unwrap_or_else(|| state_dir.join("pids")),
			log_dir: self.paths.log_dir.clone().unwrap_or_else(|| state_dir.join("logs")),
			legacy_file: self
				.paths
				.legacy_file
				.clone()
				.unwrap_or_else(|| paths.config_dir().join(LEGACY_FILE_NAME)),
		}
	}

	/// Whether bulk stop/restart must leave a service with this executable alone.
	pub fn is_protected(&self, exec: &str) -> bool {
		let name = ssd_supervisor::record::basename(exec);
		self.daemon.protected.iter().any(|p| p == name)
	}
}

pub fn default_config_path() -> PathBuf {
	DaemonPaths::new(APP_NAME).config_dir().join("config.toml")
}

/// Read the config file; a missing or invalid file yields defaults.
pub fn load_global_config(path: Option<&Path>) -> GlobalConfig {
	let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
	if path.exists() {
		match std::fs::read_to_string(&path) {
			Ok(content) => match GlobalConfig::parse(&content) {
				Ok(config) => return config,
				Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
			},
			Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
		}
	}
	GlobalConfig::default()
}
