use std::path::PathBuf;

/// Filesystem locations a daemon and its clients agree on.
///
/// Defaults follow the XDG layout keyed by `app_name`; any location can be
/// pinned explicitly, which is how the daemon honours its config file and how
/// tests keep socket paths short.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
	pub app_name: String,
	state_dir: Option<PathBuf>,
	config_dir: Option<PathBuf>,
	socket: Option<PathBuf>,
}

impl DaemonPaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
			state_dir: None,
			config_dir: None,
			socket: None,
		}
	}

	pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.state_dir = Some(dir.into());
		self
	}

	pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config_dir = Some(dir.into());
		self
	}

	pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
		self.socket = Some(socket.into());
		self
	}

	pub fn state_dir(&self) -> PathBuf {
		if let Some(dir) = &self.state_dir {
			return dir.clone();
		}
		if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
			PathBuf::from(dir).join(&self.app_name)
		} else if let Some(home) = home_dir() {
			home.join(".local").join("state").join(&self.app_name)
		} else {
			PathBuf::from("/tmp").join(&self.app_name)
		}
	}

	pub fn config_dir(&self) -> PathBuf {
		if let Some(dir) = &self.config_dir {
			return dir.clone();
		}
		if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
			PathBuf::from(dir).join(&self.app_name)
		} else if let Some(home) = home_dir() {
			home.join(".config").join(&self.app_name)
		} else {
			PathBuf::from("/tmp").join(&self.app_name).join("config")
		}
	}

	pub fn socket_path(&self) -> PathBuf {
		match &self.socket {
			Some(path) => path.clone(),
			None => self.state_dir().join("daemon.sock"),
		}
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir().join("daemon.pid")
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}
