mod config;
mod daemon;
mod protocol;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use ssd_ipc::clap::DaemonCommand;
use ssd_ipc::{Daemon, DaemonClient};

use config::GlobalConfig;
use protocol::{JobKind, JobRequest, ALL};

#[derive(Debug, Parser)]
#[command(name = "ssdctl", version, about = "Lightweight process supervisor")]
struct Cli {
	/// Path to config.toml
	#[arg(long, global = true, value_name = "FILE")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start services ("all" for every enabled service)
	Start {
		#[arg(required = true)]
		names: Vec<String>,
		/// Do not ask before starting all
		#[arg(short, long)]
		yes: bool,
	},
	/// Stop services ("all" skips disabled and protected services)
	Stop {
		#[arg(required = true)]
		names: Vec<String>,
		#[arg(short, long)]
		yes: bool,
	},
	/// Stop then start services
	Restart {
		#[arg(required = true)]
		names: Vec<String>,
		#[arg(short, long)]
		yes: bool,
	},
	/// Include services in keepalive and bulk operations
	Enable {
		#[arg(required = true)]
		names: Vec<String>,
	},
	/// Exclude services from keepalive and bulk operations
	Disable {
		#[arg(required = true)]
		names: Vec<String>,
	},
	/// Show definition and liveness (all services by default)
	Status { names: Vec<String> },
	/// Forget services and delete their definitions
	Remove {
		#[arg(required = true)]
		names: Vec<String>,
	},
	/// Register a new service
	Create {
		name: String,
		exec: PathBuf,
		#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
		params: Vec<String>,
	},
	/// Print service definitions
	List { name: Option<String> },
	/// Reload definitions from disk
	Update,
	/// Set start priority (1-255, lower starts first)
	Priority { name: String, value: String },
	/// Stop the daemon
	Shutdown {
		#[arg(short, long)]
		yes: bool,
	},
	/// Manage the daemon process
	#[command(subcommand)]
	Daemon(DaemonCommand),
}

fn main() {
	let cli = Cli::parse();
	let config = config::load_global_config(cli.config.as_deref());

	let code = match cli.command {
		Command::Daemon(cmd) => cmd_daemon(&cmd, &config, cli.config.as_deref()),
		command => match build_jobs(command) {
			Some(jobs) => send_jobs(&config, &jobs),
			None => {
				eprintln!("aborted");
				1
			}
		},
	};
	std::process::exit(code);
}

fn cmd_daemon(cmd: &DaemonCommand, config: &GlobalConfig, config_path: Option<&Path>) -> i32 {
	if let DaemonCommand::Run = cmd {
		tracing_subscriber::fmt().with_writer(std::io::stderr).init();
		let runtime = match tokio::runtime::Runtime::new() {
			Ok(rt) => rt,
			Err(e) => {
				eprintln!("error: cannot start runtime: {}", e);
				return 1;
			}
		};
		return match runtime.block_on(daemon::run(config.clone())) {
			Ok(()) => 0,
			Err(e) => {
				tracing::error!("{}", e);
				1
			}
		};
	}

	let daemon = Daemon::new(config.daemon_paths());
	let config_arg = config_path.map(|p| p.to_string_lossy().into_owned());
	let mut run_args: Vec<&str> = Vec::new();
	if let Some(path) = config_arg.as_deref() {
		run_args.extend(["--config", path]);
	}
	run_args.extend(["daemon", "run"]);

	let log_file = config.layout(&daemon.paths).log_dir.join("ssdctl.log");
	cmd.execute(&daemon, &run_args, Some(&log_file))
}

/// Translate a client subcommand into jobs. Returns `None` if the operator
/// declined a confirmation prompt.
fn build_jobs(command: Command) -> Option<Vec<JobRequest>> {
	let jobs = match command {
		Command::Start { names, yes } => {
			confirm_bulk(&names, yes, "start all enabled services?")?;
			per_name(JobKind::Start, names)
		}
		Command::Stop { names, yes } => {
			confirm_bulk(&names, yes, "stop all enabled services?")?;
			per_name(JobKind::Stop, names)
		}
		Command::Restart { names, yes } => {
			confirm_bulk(&names, yes, "restart all enabled services?")?;
			per_name(JobKind::Restart, names)
		}
		Command::Enable { names } => per_name(JobKind::Enable, names),
		Command::Disable { names } => per_name(JobKind::Disable, names),
		Command::Status { names } if names.is_empty() => vec![JobRequest::new(JobKind::Status, ALL)],
		Command::Status { names } => per_name(JobKind::Status, names),
		Command::Remove { names } => per_name(JobKind::Remove, names),
		Command::Create { name, exec, params } => {
			let exec = absolute(exec);
			vec![JobRequest::new(JobKind::Create, name)
				.with_exec(exec.to_string_lossy())
				.with_params(params)]
		}
		Command::List { name } => vec![JobRequest::new(JobKind::List, name.unwrap_or_else(|| ALL.to_string()))],
		Command::Update => vec![JobRequest::new(JobKind::Update, ALL)],
		Command::Priority { name, value } => {
			vec![JobRequest::new(JobKind::SetPriority, name).with_params(vec![value])]
		}
		Command::Shutdown { yes } => {
			if !yes && !confirm("shut down the supervisor daemon?") {
				return None;
			}
			vec![JobRequest::new(JobKind::Shutdown, "")]
		}
		Command::Daemon(_) => Vec::new(),
	};
	Some(jobs)
}

fn per_name(kind: JobKind, names: Vec<String>) -> Vec<JobRequest> {
	names.into_iter().map(|name| JobRequest::new(kind, name)).collect()
}

fn confirm_bulk(names: &[String], yes: bool, prompt: &str) -> Option<()> {
	if yes || !names.iter().any(|n| n == ALL) || confirm(prompt) {
		Some(())
	} else {
		None
	}
}

fn confirm(prompt: &str) -> bool {
	eprint!("{} (y/n) ", prompt);
	let _ = io::stderr().flush();
	let mut answer = String::new();
	if io::stdin().read_line(&mut answer).is_err() {
		return false;
	}
	matches!(answer.trim(), "y" | "Y" | "yes")
}

/// The daemon resolves relative paths against its own directory, so make
/// them absolute here.
fn absolute(path: PathBuf) -> PathBuf {
	if path.is_absolute() {
		return path;
	}
	match std::env::current_dir() {
		Ok(cwd) => cwd.join(path),
		Err(_) => path,
	}
}

/// Send every job followed by Close and print replies until the daemon
/// hangs up.
fn send_jobs(config: &GlobalConfig, jobs: &[JobRequest]) -> i32 {
	let paths = config.daemon_paths();
	let mut client = match DaemonClient::<JobRequest>::connect(&paths) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("{}", e.to_string().red());
			return 1;
		}
	};

	for job in jobs.iter().chain(std::iter::once(&JobRequest::close())) {
		if let Err(e) = client.send(job) {
			eprintln!("{}", format!("error: {}", e).red());
			return 1;
		}
	}

	match client.drain(print_block) {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("{}", format!("error: {}", e).red());
			1
		}
	}
}

fn print_block(block: String) {
	let (header, body) = protocol::split_block(&block);
	if !header.is_empty() {
		println!("{}", header.bold());
	}
	if is_error(body) {
		println!("{}", body.red());
	} else if !body.is_empty() {
		println!("{}", body);
	}
}

fn is_error(body: &str) -> bool {
	["failed", "unknown program", "invalid", "internal error"]
		.iter()
		.any(|prefix| body.starts_with(prefix))
		|| body.contains("is not allowed on all")
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	fn parse(args: &[&str]) -> Cli {
		Cli::try_parse_from(std::iter::once("ssdctl").chain(args.iter().copied())).unwrap()
	}

	#[test]
	fn cli_definition_is_valid() {
		Cli::command().debug_assert();
	}

	#[test]
	fn one_job_per_name() {
		let jobs = build_jobs(parse(&["stop", "web", "db"]).command).unwrap();
		assert_eq!(
			jobs,
			vec![JobRequest::new(JobKind::Stop, "web"), JobRequest::new(JobKind::Stop, "db")]
		);
	}

	#[test]
	fn bare_status_targets_all() {
		let jobs = build_jobs(parse(&["status"]).command).unwrap();
		assert_eq!(jobs, vec![JobRequest::new(JobKind::Status, ALL)]);
	}

	#[test]
	fn create_keeps_hyphenated_params() {
		let jobs = build_jobs(parse(&["create", "web", "/opt/bin/web", "-http=80", "--verbose"]).command).unwrap();
		assert_eq!(
			jobs,
			vec![JobRequest::new(JobKind::Create, "web")
				.with_exec("/opt/bin/web")
				.with_params(vec!["-http=80".into(), "--verbose".into()])]
		);
	}

	#[test]
	fn create_makes_exec_absolute() {
		let jobs = build_jobs(parse(&["create", "web", "bin/web"]).command).unwrap();
		assert!(Path::new(&jobs[0].exec).is_absolute());
		assert!(jobs[0].exec.ends_with("bin/web"));
	}

	#[test]
	fn bulk_with_yes_skips_prompt() {
		let jobs = build_jobs(parse(&["restart", "all", "--yes"]).command).unwrap();
		assert_eq!(jobs, vec![JobRequest::new(JobKind::Restart, ALL)]);
		let jobs = build_jobs(parse(&["shutdown", "-y"]).command).unwrap();
		assert_eq!(jobs, vec![JobRequest::new(JobKind::Shutdown, "")]);
	}

	#[test]
	fn priority_sends_value_as_param() {
		let jobs = build_jobs(parse(&["priority", "web", "10"]).command).unwrap();
		assert_eq!(
			jobs,
			vec![JobRequest::new(JobKind::SetPriority, "web").with_params(vec!["10".into()])]
		);
	}

	#[test]
	fn daemon_subcommands_parse() {
		let cli = parse(&["--config", "/etc/ssd.toml", "daemon", "run"]);
		assert!(matches!(cli.command, Command::Daemon(DaemonCommand::Run)));
		assert_eq!(cli.config, Some(PathBuf::from("/etc/ssd.toml")));
	}

	#[test]
	fn error_bodies_are_recognised() {
		assert!(is_error("unknown program: web"));
		assert!(is_error("failed, process exited within 2s"));
		assert!(is_error("enable is not allowed on all"));
		assert!(!is_error("done, pid=12"));
	}
}
