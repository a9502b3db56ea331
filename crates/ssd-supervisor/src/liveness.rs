use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::record::{basename, ServiceRecord};

/// Environment variable that relocates the proc filesystem root, for
/// supervising a host from inside a container.
pub const HOST_PROC_ENV: &str = "HOST_PROC";
const DEFAULT_PROC_ROOT: &str = "/proc";
const DELETED_SUFFIX: &str = " (deleted)";

/// One entry of the host process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
	pub pid: i32,
	/// Basename of the executable the kernel reports, if readable.
	pub exe: Option<String>,
	pub args: Vec<String>,
}

impl ProcessInfo {
	pub fn command_line(&self) -> String {
		self.args.join(" ")
	}
}

/// Read and signal access to the host's processes.
pub trait ProcessTable: Send + Sync {
	/// Space-joined argv of `pid`, or `None` if it does not exist or has
	/// already exited (zombies report an empty command line).
	fn command_line(&self, pid: i32) -> Option<String>;

	/// Every process with a non-empty command line.
	fn processes(&self) -> Vec<ProcessInfo>;

	fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()>;
}

/// [`ProcessTable`] backed by the Linux proc filesystem.
#[derive(Debug, Clone)]
pub struct ProcFs {
	root: PathBuf,
}

impl ProcFs {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	/// Uses `$HOST_PROC` when set, `/proc` otherwise.
	pub fn from_env() -> Self {
		let root = std::env::var_os(HOST_PROC_ENV)
			.filter(|v| !v.is_empty())
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from(DEFAULT_PROC_ROOT));
		Self::new(root)
	}

	fn args(&self, pid: i32) -> Vec<String> {
		let raw = std::fs::read(self.root.join(pid.to_string()).join("cmdline")).unwrap_or_default();
		raw.split(|b| *b == 0)
			.filter(|arg| !arg.is_empty())
			.map(|arg| String::from_utf8_lossy(arg).into_owned())
			.collect()
	}

	fn exe(&self, pid: i32) -> Option<String> {
		let target = std::fs::read_link(self.root.join(pid.to_string()).join("exe")).ok()?;
		let target = target.to_string_lossy();
		let target = target.strip_suffix(DELETED_SUFFIX).unwrap_or(&target);
		Some(basename(target).to_string())
	}
}

impl Default for ProcFs {
	fn default() -> Self {
		Self::from_env()
	}
}

impl ProcessTable for ProcFs {
	fn command_line(&self, pid: i32) -> Option<String> {
		if pid <= 0 {
			return None;
		}
		let args = self.args(pid);
		if args.is_empty() {
			return None;
		}
		Some(args.join(" "))
	}

	fn processes(&self) -> Vec<ProcessInfo> {
		let entries = match std::fs::read_dir(&self.root) {
			Ok(entries) => entries,
			Err(e) => {
				tracing::warn!("cannot read {}: {}", self.root.display(), e);
				return Vec::new();
			}
		};
		let mut processes: Vec<ProcessInfo> = entries
			.flatten()
			.filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
			.filter_map(|pid| {
				let args = self.args(pid);
				if args.is_empty() {
					return None;
				}
				Some(ProcessInfo {
					pid,
					exe: self.exe(pid),
					args,
				})
			})
			.collect();
		processes.sort_by_key(|p| p.pid);
		processes
	}

	fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
		kill(Pid::from_raw(pid), signal)
	}
}

/// A live process attributed to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
	pub pid: i32,
	/// `pid<TAB>command line`
	pub descriptor: String,
}

impl Liveness {
	fn new(pid: i32, command_line: &str) -> Self {
		Self {
			pid,
			descriptor: format!("{}\t{}", pid, command_line),
		}
	}
}

/// Find the process running `record`.
///
/// The recorded pid is trusted while it still has a command line; otherwise
/// the table is scanned for a process whose executable basename matches and
/// whose command line contains every literal parameter.
pub fn is_running(table: &dyn ProcessTable, record: &ServiceRecord) -> Option<Liveness> {
	if record.pid > 0 {
		if let Some(cmdline) = table.command_line(record.pid) {
			return Some(Liveness::new(record.pid, &cmdline));
		}
	}

	table
		.processes()
		.into_iter()
		.find(|info| matches(record, info))
		.map(|info| Liveness::new(info.pid, &info.command_line()))
}

/// Whether `info` looks like an instance of `record`. Parameters holding a
/// `$` placeholder are ignored because their expanded value is unknown.
pub fn matches(record: &ServiceRecord, info: &ProcessInfo) -> bool {
	let wanted = record.exec_basename();
	if wanted.is_empty() {
		return false;
	}
	let argv0 = info.args.first().map(|a| basename(a));
	let by_name = argv0 == Some(wanted) || info.exe.as_deref() == Some(wanted);
	if !by_name {
		return false;
	}

	let cmdline = info.command_line();
	record
		.params
		.iter()
		.filter(|param| !param.contains('$'))
		.all(|param| cmdline.contains(param.as_str()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn info(pid: i32, exe: Option<&str>, args: &[&str]) -> ProcessInfo {
		ProcessInfo {
			pid,
			exe: exe.map(str::to_string),
			args: args.iter().map(|s| s.to_string()).collect(),
		}
	}

	#[test]
	fn matches_by_argv0_and_literal_params() {
		let record = ServiceRecord::new(
			"/opt/bin/web",
			vec!["-http=80".into(), "-c=$ip".into()],
		);
		assert!(matches(&record, &info(10, None, &["/opt/bin/web", "-http=80", "-c=1.2.3.4"])));
		assert!(matches(&record, &info(10, None, &["web", "-http=80"])));
		assert!(!matches(&record, &info(10, None, &["/opt/bin/web", "-http=81"])));
		assert!(!matches(&record, &info(10, None, &["/opt/bin/webx", "-http=80"])));
	}

	#[test]
	fn matches_by_exe_link_when_argv0_is_rewritten() {
		let record = ServiceRecord::new("/usr/sbin/nginx", vec![]);
		assert!(matches(&record, &info(7, Some("nginx"), &["nginx: master process"])));
		assert!(!matches(&record, &info(7, Some("caddy"), &["caddy", "run"])));
	}

	#[test]
	fn multi_word_param_matches_joined_command_line() {
		let record = ServiceRecord::new("/usr/bin/ttyd", vec!["-p 7681".into()]);
		assert!(matches(&record, &info(3, None, &["/usr/bin/ttyd", "-p", "7681", "bash"])));
	}

	#[test]
	fn proc_fs_reads_command_lines_and_exe_links() {
		let root = std::env::temp_dir().join(format!("ssd-procfs-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&root);
		let p = root.join("4242");
		std::fs::create_dir_all(&p).unwrap();
		std::fs::write(p.join("cmdline"), b"/opt/bin/web\0-http=80\0").unwrap();
		std::os::unix::fs::symlink("/opt/bin/web (deleted)", p.join("exe")).unwrap();
		let zombie = root.join("4243");
		std::fs::create_dir_all(&zombie).unwrap();
		std::fs::write(zombie.join("cmdline"), b"").unwrap();
		std::fs::create_dir_all(root.join("self")).unwrap();

		let table = ProcFs::new(&root);
		assert_eq!(table.command_line(4242).as_deref(), Some("/opt/bin/web -http=80"));
		assert_eq!(table.command_line(4243), None);
		assert_eq!(table.command_line(0), None);
		assert_eq!(
			table.processes(),
			vec![info(4242, Some("web"), &["/opt/bin/web", "-http=80"])]
		);

		let _ = std::fs::remove_dir_all(&root);
	}
}
