use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PRIORITY: u32 = 200;
pub const MIN_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 255;
pub const MIN_SETTLE_SECS: u32 = 2;

/// One supervised program. The name is the key of its definition file and
/// is not stored in the body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceRecord {
	pub exec: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub dir: String,
	#[serde(default)]
	pub params: Vec<String>,
	/// `$key=command args` pairs resolved into `params` placeholders at start.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub replace: Vec<String>,
	/// Extra `KEY=VALUE` entries appended to the inherited environment.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub env: Vec<String>,
	#[serde(default)]
	pub priority: u32,
	#[serde(default, rename = "startsec")]
	pub start_settle_secs: u32,
	#[serde(default, rename = "log2file", skip_serializing_if = "is_false")]
	pub log_to_file: bool,
	#[serde(default, rename = "enable")]
	pub enabled: bool,

	#[serde(skip)]
	pub manually_stopped: bool,
	/// Last known process id; advisory only.
	#[serde(skip)]
	pub pid: i32,
}

fn is_false(v: &bool) -> bool {
	!*v
}

impl ServiceRecord {
	pub fn new(exec: impl Into<String>, params: Vec<String>) -> Self {
		Self {
			exec: exec.into(),
			params,
			enabled: true,
			..Self::default()
		}
	}

	/// Resolve `exec` to an absolute path and clamp priority and settle time.
	pub fn normalized(mut self) -> Self {
		let exec = Path::new(&self.exec);
		if !self.exec.is_empty() && !exec.is_absolute() {
			if let Ok(cwd) = std::env::current_dir() {
				self.exec = cwd.join(exec).to_string_lossy().into_owned();
			}
		}
		self.priority = if self.priority == 0 {
			DEFAULT_PRIORITY
		} else {
			clamp_priority(self.priority)
		};
		self.start_settle_secs = self.start_settle_secs.max(MIN_SETTLE_SECS);
		self
	}

	/// Configured directory, or the directory holding the executable.
	pub fn working_dir(&self) -> PathBuf {
		if !self.dir.is_empty() {
			return PathBuf::from(&self.dir);
		}
		Path::new(&self.exec)
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("/"))
	}

	pub fn exec_basename(&self) -> &str {
		basename(&self.exec)
	}

	/// `KEY=VALUE` entries split into pairs; entries without `=` are ignored.
	pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
		self.env
			.iter()
			.filter_map(|entry| entry.split_once('='))
			.filter(|(key, _)| !key.trim().is_empty())
	}
}

pub fn clamp_priority(value: u32) -> u32 {
	value.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

pub fn basename(path: &str) -> &str {
	path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

/// Keepalive view of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
	Stopped,
	Running,
	ManuallyStopped,
}

impl ServiceState {
	pub fn of(record: &ServiceRecord, alive: bool) -> Self {
		if alive {
			ServiceState::Running
		} else if record.manually_stopped {
			ServiceState::ManuallyStopped
		} else {
			ServiceState::Stopped
		}
	}

	/// Whether a keepalive sweep should start this service.
	pub fn wants_keepalive(self, record: &ServiceRecord) -> bool {
		record.enabled && self == ServiceState::Stopped
	}
}

impl fmt::Display for ServiceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ServiceState::Stopped => write!(f, "stopped"),
			ServiceState::Running => write!(f, "running"),
			ServiceState::ManuallyStopped => write!(f, "manually stopped"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_clamps_and_defaults() {
		let r = ServiceRecord {
			exec: "/opt/bin/web".into(),
			..Default::default()
		}
		.normalized();
		assert_eq!(r.priority, DEFAULT_PRIORITY);
		assert_eq!(r.start_settle_secs, MIN_SETTLE_SECS);

		let r = ServiceRecord {
			exec: "/opt/bin/web".into(),
			priority: 4000,
			start_settle_secs: 9,
			..Default::default()
		}
		.normalized();
		assert_eq!(r.priority, MAX_PRIORITY);
		assert_eq!(r.start_settle_secs, 9);
	}

	#[test]
	fn relative_exec_becomes_absolute() {
		let r = ServiceRecord::new("bin/web", vec![]).normalized();
		assert!(Path::new(&r.exec).is_absolute());
		assert!(r.exec.ends_with("/bin/web"));
	}

	#[test]
	fn working_dir_defaults_to_exec_parent() {
		let mut r = ServiceRecord::new("/opt/bin/web", vec![]);
		assert_eq!(r.working_dir(), PathBuf::from("/opt/bin"));
		r.dir = "/srv/web".into();
		assert_eq!(r.working_dir(), PathBuf::from("/srv/web"));
	}

	#[test]
	fn env_pairs_skip_malformed_entries() {
		let mut r = ServiceRecord::new("/bin/true", vec![]);
		r.env = vec!["A=1".into(), "broken".into(), "B=x=y".into(), "=nokey".into()];
		let pairs: Vec<_> = r.env_pairs().collect();
		assert_eq!(pairs, vec![("A", "1"), ("B", "x=y")]);
	}

	#[test]
	fn yaml_uses_short_keys_and_skips_runtime_fields() {
		let mut r = ServiceRecord::new("/opt/bin/web", vec!["-http=80".into()]).normalized();
		r.pid = 42;
		r.manually_stopped = true;
		let text = serde_yaml::to_string(&r).unwrap();
		assert!(text.contains("startsec: 2"));
		assert!(text.contains("enable: true"));
		assert!(!text.contains("log2file"));
		assert!(!text.contains("pid"));
		assert!(!text.contains("manually"));

		let back: ServiceRecord = serde_yaml::from_str(&text).unwrap();
		assert_eq!(back.pid, 0);
		assert_eq!(back.exec, r.exec);
	}

	#[test]
	fn keepalive_state_machine() {
		let mut r = ServiceRecord::new("/bin/sleep", vec![]);
		assert_eq!(ServiceState::of(&r, true), ServiceState::Running);
		assert!(ServiceState::of(&r, false).wants_keepalive(&r));

		r.manually_stopped = true;
		assert_eq!(ServiceState::of(&r, false), ServiceState::ManuallyStopped);
		assert!(!ServiceState::of(&r, false).wants_keepalive(&r));

		r.manually_stopped = false;
		r.enabled = false;
		assert!(!ServiceState::of(&r, false).wants_keepalive(&r));
	}
}
