//! # ssd-supervisor
//!
//! Supervisor engine for long-running programs.
//!
//! Keeps a registry of service definitions on disk, decides whether a
//! service is alive by inspecting the host process table, starts services
//! as detached process groups and stops them with SIGTERM escalating to
//! SIGKILL. A keepalive sweep restarts enabled services that have died.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ssd_supervisor::{LoadMode, ProcFs, Registry, ServiceRecord, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Arc::new(Registry::new("/tmp/ssd/services", "/tmp/ssd/pids"));
//! registry.load(LoadMode::Initial).await.unwrap();
//! registry
//!     .add("web", ServiceRecord::new("/usr/bin/python3", vec!["-m".into(), "http.server".into()]))
//!     .await
//!     .unwrap();
//!
//! let sup = Supervisor::new(
//!     Arc::clone(&registry),
//!     Arc::new(ProcFs::from_env()),
//!     SupervisorConfig {
//!         log_dir: "/tmp/ssd/logs".into(),
//!         max_log_size: 10 * 1024 * 1024,
//!     },
//! );
//!
//! let record = registry.get("web").await.unwrap();
//! println!("{}", sup.start("web", &record).await.message);
//! # }
//! ```

pub mod keepalive;
pub mod liveness;
pub mod logs;
pub mod placeholders;
pub mod record;
pub mod registry;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use liveness::{Liveness, ProcFs, ProcessInfo, ProcessTable};
pub use placeholders::Placeholders;
pub use record::{ServiceRecord, ServiceState};
pub use registry::{LoadMode, Registry, RegistryError};
pub use supervisor::{LaunchError, StartOutcome, StopOutcome, Supervisor, SupervisorConfig};
