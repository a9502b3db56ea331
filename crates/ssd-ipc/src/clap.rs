use std::path::Path;

use clap::Subcommand;

use crate::daemon::{Daemon, DaemonError};

#[derive(Debug, Clone, Subcommand)]
pub enum DaemonCommand {
	/// Run the daemon in the foreground (used internally)
	Run,
	/// Start the daemon in the background
	Start,
	/// Stop the running daemon
	Stop,
	/// Show daemon status
	Status,
}

impl DaemonCommand {
	/// Handle `start`, `stop` and `status`; returns the process exit code.
	///
	/// `run` must be handled by the application since only it knows the
	/// request handler. `run_args` is the argument list that re-enters `run`.
	pub fn execute(&self, daemon: &Daemon, run_args: &[&str], log_file: Option<&Path>) -> i32 {
		match self {
			DaemonCommand::Run => {
				eprintln!("the 'run' subcommand must be handled by the application");
				2
			}
			DaemonCommand::Start => match daemon.start_background(run_args, log_file) {
				Ok(()) => {
					eprintln!("daemon started");
					0
				}
				Err(DaemonError::AlreadyRunning) => {
					eprintln!("daemon already running");
					0
				}
				Err(e) => {
					eprintln!("error: {}", e);
					1
				}
			},
			DaemonCommand::Stop => match daemon.stop() {
				Ok(pid) => {
					eprintln!("daemon stopped (pid {})", pid);
					0
				}
				Err(e) => {
					eprintln!("{}", e);
					1
				}
			},
			DaemonCommand::Status => {
				if crate::client::is_running(&daemon.paths) {
					match crate::client::read_pid(&daemon.paths) {
						Some(pid) => eprintln!("daemon running (pid {})", pid),
						None => eprintln!("daemon running"),
					}
					0
				} else {
					eprintln!("daemon not running");
					1
				}
			}
		}
	}
}
