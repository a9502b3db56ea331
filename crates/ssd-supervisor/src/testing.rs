//! In-memory [`ProcessTable`] for exercising stop escalation and dispatch
//! without real processes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::liveness::{ProcessInfo, ProcessTable};
use crate::record::basename;

#[derive(Default)]
struct FakeState {
	processes: BTreeMap<i32, ProcessInfo>,
	ignores_term: HashSet<i32>,
	denied: HashSet<i32>,
	kill_denied: HashSet<i32>,
	signals: Vec<(i32, Signal)>,
}

#[derive(Default)]
pub struct FakeProcessTable {
	state: Mutex<FakeState>,
}

impl FakeProcessTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a process whose argv is `exec` followed by `args`.
	pub fn insert(&self, pid: i32, exec: &str, args: &[&str]) {
		let mut argv = vec![exec.to_string()];
		argv.extend(args.iter().map(|a| a.to_string()));
		let info = ProcessInfo {
			pid,
			exe: Some(basename(exec).to_string()),
			args: argv,
		};
		self.lock().processes.insert(pid, info);
	}

	/// The process survives SIGTERM and only dies on SIGKILL.
	pub fn ignore_term(&self, pid: i32) {
		self.lock().ignores_term.insert(pid);
	}

	/// Signals to this process fail with EPERM.
	pub fn deny_signals(&self, pid: i32) {
		self.lock().denied.insert(pid);
	}

	/// Only SIGKILL fails with EPERM.
	pub fn deny_kill(&self, pid: i32) {
		self.lock().kill_denied.insert(pid);
	}

	pub fn exit(&self, pid: i32) {
		self.lock().processes.remove(&pid);
	}

	pub fn is_alive(&self, pid: i32) -> bool {
		self.lock().processes.contains_key(&pid)
	}

	pub fn signals(&self) -> Vec<(i32, Signal)> {
		self.lock().signals.clone()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

impl ProcessTable for FakeProcessTable {
	fn command_line(&self, pid: i32) -> Option<String> {
		self.lock().processes.get(&pid).map(ProcessInfo::command_line)
	}

	fn processes(&self) -> Vec<ProcessInfo> {
		self.lock().processes.values().cloned().collect()
	}

	fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
		let mut state = self.lock();
		state.signals.push((pid, signal));
		if state.denied.contains(&pid) || (signal == Signal::SIGKILL && state.kill_denied.contains(&pid)) {
			return Err(Errno::EPERM);
		}
		if !state.processes.contains_key(&pid) {
			return Err(Errno::ESRCH);
		}
		let dies = signal == Signal::SIGKILL || !state.ignores_term.contains(&pid);
		if dies {
			state.processes.remove(&pid);
		}
		Ok(())
	}
}
