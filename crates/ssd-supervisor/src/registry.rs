use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::record::{clamp_priority, ServiceRecord};

const DEFINITION_EXT: &str = "yaml";
const PID_EXT: &str = "pid";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("service {0} not found")]
	NotFound(String),
	#[error("service {0} already exists")]
	AlreadyExists(String),
	#[error("invalid service name {0:?}")]
	InvalidName(String),
	#[error("cannot encode {name}: {source}")]
	Encode { name: String, source: serde_yaml::Error },
	#[error("cannot parse {}: {source}", path.display())]
	Decode { path: PathBuf, source: serde_yaml::Error },
	#[error("{}: {source}", path.display())]
	Io { path: PathBuf, source: io::Error },
}

/// How a reload treats services that are already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
	/// Fresh start: runtime state comes only from pid files.
	Initial,
	/// Re-scan: keep the manual-stop flag of services that still exist.
	Update,
}

/// The set of known services, persisted as one YAML file per service plus
/// a pid file per running service.
pub struct Registry {
	services: RwLock<HashMap<String, ServiceRecord>>,
	services_dir: PathBuf,
	pid_dir: PathBuf,
}

impl Registry {
	pub fn new(services_dir: impl Into<PathBuf>, pid_dir: impl Into<PathBuf>) -> Self {
		Self {
			services: RwLock::new(HashMap::new()),
			services_dir: services_dir.into(),
			pid_dir: pid_dir.into(),
		}
	}

	pub fn services_dir(&self) -> &Path {
		&self.services_dir
	}

	pub fn pid_dir(&self) -> &Path {
		&self.pid_dir
	}

	pub fn definition_path(&self, name: &str) -> PathBuf {
		self.services_dir.join(format!("{}.{}", name, DEFINITION_EXT))
	}

	pub fn pid_path(&self, name: &str) -> PathBuf {
		self.pid_dir.join(format!("{}.{}", name, PID_EXT))
	}

	/// Scan the definitions directory and replace the in-memory map.
	///
	/// Files that fail to parse are skipped with a warning. Returns the number
	/// of services loaded.
	pub async fn load(&self, mode: LoadMode) -> Result<usize, RegistryError> {
		let mut loaded = HashMap::new();
		for path in self.definition_files()? {
			let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
				continue;
			};
			if validate_name(&name).is_err() {
				tracing::warn!("skipping {}: invalid service name", path.display());
				continue;
			}
			let text = match std::fs::read_to_string(&path) {
				Ok(t) => t,
				Err(e) => {
					tracing::warn!("cannot read {}: {}", path.display(), e);
					continue;
				}
			};
			let record: ServiceRecord = match serde_yaml::from_str(&text) {
				Ok(r) => r,
				Err(e) => {
					tracing::warn!("cannot parse {}: {}", path.display(), e);
					continue;
				}
			};
			let mut record = record.normalized();
			record.pid = self.read_pid(&name);
			loaded.insert(name, record);
		}

		let mut services = self.services.write().await;
		if mode == LoadMode::Update {
			for (name, record) in loaded.iter_mut() {
				if let Some(previous) = services.get(name) {
					record.manually_stopped = previous.manually_stopped;
				}
			}
		}
		let count = loaded.len();
		*services = loaded;
		tracing::info!("loaded {} services from {}", count, self.services_dir.display());
		Ok(count)
	}

	/// Split an old single-file `name: definition` map into per-service
	/// files, then delete it. Services that already have a file keep it.
	///
	/// Returns how many definitions were written. A missing legacy file is
	/// not an error; one that cannot be parsed is left in place.
	pub fn migrate_legacy(&self, legacy: &Path) -> Result<usize, RegistryError> {
		let text = match std::fs::read_to_string(legacy) {
			Ok(t) => t,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
			Err(source) => {
				return Err(RegistryError::Io {
					path: legacy.to_path_buf(),
					source,
				})
			}
		};
		let services: BTreeMap<String, ServiceRecord> =
			serde_yaml::from_str(&text).map_err(|source| RegistryError::Decode {
				path: legacy.to_path_buf(),
				source,
			})?;

		let mut written = 0;
		for (name, record) in services {
			if validate_name(&name).is_err() {
				tracing::warn!("{}: skipping invalid service name {:?}", legacy.display(), name);
				continue;
			}
			if self.definition_path(&name).exists() {
				continue;
			}
			self.persist(&name, &record.normalized())?;
			written += 1;
		}

		remove_if_exists(legacy)?;
		tracing::info!("migrated {} services from {}", written, legacy.display());
		Ok(written)
	}

	/// Register a new service and write its definition file.
	pub async fn add(&self, name: &str, record: ServiceRecord) -> Result<ServiceRecord, RegistryError> {
		validate_name(name)?;
		let record = record.normalized();

		let mut services = self.services.write().await;
		if services.contains_key(name) {
			return Err(RegistryError::AlreadyExists(name.to_string()));
		}
		self.persist(name, &record)?;
		services.insert(name.to_string(), record.clone());
		tracing::info!("added service {} ({})", name, record.exec);
		Ok(record)
	}

	/// Forget a service and delete its definition and pid files.
	pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
		let mut services = self.services.write().await;
		if services.remove(name).is_none() {
			return Err(RegistryError::NotFound(name.to_string()));
		}
		remove_if_exists(&self.definition_path(name))?;
		remove_if_exists(&self.pid_path(name))?;
		tracing::info!("removed service {}", name);
		Ok(())
	}

	pub async fn get(&self, name: &str) -> Option<ServiceRecord> {
		self.services.read().await.get(name).cloned()
	}

	pub async fn contains(&self, name: &str) -> bool {
		self.services.read().await.contains_key(name)
	}

	pub async fn len(&self) -> usize {
		self.services.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.services.read().await.is_empty()
	}

	/// Returns false if the flag already had that value.
	pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, RegistryError> {
		let mut services = self.services.write().await;
		let record = services
			.get_mut(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
		if record.enabled == enabled {
			return Ok(false);
		}
		let mut updated = record.clone();
		updated.enabled = enabled;
		self.persist(name, &updated)?;
		*record = updated;
		Ok(true)
	}

	/// Set the start priority, clamped to the valid range. Returns the
	/// effective value; nothing is written if it did not change.
	pub async fn set_priority(&self, name: &str, priority: u32) -> Result<u32, RegistryError> {
		let priority = clamp_priority(priority);
		let mut services = self.services.write().await;
		let record = services
			.get_mut(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
		if record.priority == priority {
			return Ok(priority);
		}
		let mut updated = record.clone();
		updated.priority = priority;
		self.persist(name, &updated)?;
		*record = updated;
		Ok(priority)
	}

	/// Record the process id and manual-stop flag after a start or stop.
	///
	/// A positive pid is written to the pid file; zero removes it. The
	/// in-memory state is updated even when the pid file cannot be written.
	pub async fn set_runtime_state(&self, name: &str, pid: i32, manually_stopped: bool) -> Result<(), RegistryError> {
		let mut services = self.services.write().await;
		let record = services
			.get_mut(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

		record.pid = pid.max(0);
		record.manually_stopped = manually_stopped;

		let pid_path = self.pid_path(name);
		if pid > 0 {
			std::fs::create_dir_all(&self.pid_dir).map_err(|source| RegistryError::Io {
				path: self.pid_dir.clone(),
				source,
			})?;
			std::fs::write(&pid_path, pid.to_string()).map_err(|source| RegistryError::Io {
				path: pid_path.clone(),
				source,
			})?;
		} else {
			remove_if_exists(&pid_path)?;
		}
		Ok(())
	}

	/// Every service ordered by ascending priority, ties broken by name.
	pub async fn snapshot(&self) -> Vec<(String, ServiceRecord)> {
		let mut entries: Vec<_> = self
			.services
			.read()
			.await
			.iter()
			.map(|(name, record)| (name.clone(), record.clone()))
			.collect();
		entries.sort_by(|(an, ar), (bn, br)| ar.priority.cmp(&br.priority).then_with(|| an.cmp(bn)));
		entries
	}

	/// Visit a snapshot in priority order until `visit` returns false.
	///
	/// The registry is not locked while visiting, so the visitor may call back
	/// into it.
	pub async fn for_each<F, Fut>(&self, mut visit: F)
	where
		F: FnMut(String, ServiceRecord) -> Fut,
		Fut: Future<Output = bool>,
	{
		for (name, record) in self.snapshot().await {
			if !visit(name, record).await {
				break;
			}
		}
	}

	/// YAML dump of every definition keyed by name.
	pub async fn print(&self) -> Result<String, RegistryError> {
		let services = self.services.read().await;
		let ordered: BTreeMap<&str, &ServiceRecord> =
			services.iter().map(|(name, record)| (name.as_str(), record)).collect();
		serde_yaml::to_string(&ordered).map_err(|source| RegistryError::Encode {
			name: "registry".into(),
			source,
		})
	}

	fn definition_files(&self) -> Result<Vec<PathBuf>, RegistryError> {
		let entries = match std::fs::read_dir(&self.services_dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(source) => {
				return Err(RegistryError::Io {
					path: self.services_dir.clone(),
					source,
				})
			}
		};
		let mut files: Vec<PathBuf> = entries
			.flatten()
			.map(|entry| entry.path())
			.filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == DEFINITION_EXT))
			.collect();
		files.sort();
		Ok(files)
	}

	fn read_pid(&self, name: &str) -> i32 {
		std::fs::read_to_string(self.pid_path(name))
			.ok()
			.and_then(|s| s.trim().parse::<i32>().ok())
			.filter(|pid| *pid > 0)
			.unwrap_or(0)
	}

	fn persist(&self, name: &str, record: &ServiceRecord) -> Result<(), RegistryError> {
		let text = serde_yaml::to_string(record).map_err(|source| RegistryError::Encode {
			name: name.to_string(),
			source,
		})?;
		std::fs::create_dir_all(&self.services_dir).map_err(|source| RegistryError::Io {
			path: self.services_dir.clone(),
			source,
		})?;
		let path = self.definition_path(name);
		std::fs::write(&path, text).map_err(|source| RegistryError::Io { path, source })
	}
}

/// Names become file names, so path separators are rejected. `all` is
/// reserved for bulk operations.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
	if name.is_empty() || name == "all" || name.contains('/') || name.starts_with('.') {
		return Err(RegistryError::InvalidName(name.to_string()));
	}
	Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), RegistryError> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(source) => Err(RegistryError::Io {
			path: path.to_path_buf(),
			source,
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names_are_validated() {
		assert!(validate_name("web").is_ok());
		assert!(validate_name("web-1.prod").is_ok());
		for bad in ["", "all", "a/b", ".hidden"] {
			assert!(
				matches!(validate_name(bad), Err(RegistryError::InvalidName(_))),
				"{:?} should be rejected",
				bad
			);
		}
	}

	#[test]
	fn paths_are_derived_from_name() {
		let reg = Registry::new("/etc/ssd/services", "/run/ssd/pids");
		assert_eq!(reg.definition_path("web"), PathBuf::from("/etc/ssd/services/web.yaml"));
		assert_eq!(reg.pid_path("web"), PathBuf::from("/run/ssd/pids/web.pid"));
	}

	#[tokio::test]
	async fn missing_directory_loads_nothing() {
		let reg = Registry::new("/nonexistent/ssd-registry-test", "/nonexistent/ssd-pids");
		assert_eq!(reg.load(LoadMode::Initial).await.unwrap(), 0);
		assert!(reg.is_empty().await);
	}
}
