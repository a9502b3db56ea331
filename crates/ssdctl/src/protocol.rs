use std::fmt;

use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "ssdctl";
/// Target that fans a job out over every eligible service.
pub const ALL: &str = "all";

/// Verbs of the control protocol. The numeric values are the wire encoding
/// and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JobKind {
	Close = 0,
	Start = 1,
	Stop = 2,
	Restart = 3,
	Status = 4,
	Enable = 5,
	Disable = 6,
	Create = 7,
	Remove = 8,
	List = 9,
	Update = 10,
	Shutdown = 11,
	SetPriority = 12,
}

impl JobKind {
	pub const ALL: [JobKind; 13] = [
		JobKind::Close,
		JobKind::Start,
		JobKind::Stop,
		JobKind::Restart,
		JobKind::Status,
		JobKind::Enable,
		JobKind::Disable,
		JobKind::Create,
		JobKind::Remove,
		JobKind::List,
		JobKind::Update,
		JobKind::Shutdown,
		JobKind::SetPriority,
	];

	/// Action tag printed in response headers.
	pub fn label(self) -> &'static str {
		match self {
			JobKind::Close => "CLOSE",
			JobKind::Start => "START",
			JobKind::Stop => "STOP",
			JobKind::Restart => "RESTART",
			JobKind::Status => "STATUS",
			JobKind::Enable => "ENABLE",
			JobKind::Disable => "DISABLE",
			JobKind::Create => "CREATE",
			JobKind::Remove => "REMOVE",
			JobKind::List => "LIST",
			JobKind::Update => "UPDATE",
			JobKind::Shutdown => "SHUTDOWN",
			JobKind::SetPriority => "PRIORITY",
		}
	}
}

impl From<JobKind> for u8 {
	fn from(kind: JobKind) -> u8 {
		kind as u8
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownJobKind(pub u8);

impl fmt::Display for UnknownJobKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "unknown job kind {}", self.0)
	}
}

impl TryFrom<u8> for JobKind {
	type Error = UnknownJobKind;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		JobKind::ALL
			.get(value as usize)
			.copied()
			.ok_or(UnknownJobKind(value))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
	#[serde(rename = "do")]
	pub kind: JobKind,
	#[serde(default)]
	pub name: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub exec: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub params: Vec<String>,
}

impl JobRequest {
	pub fn new(kind: JobKind, name: impl Into<String>) -> Self {
		Self {
			kind,
			name: name.into(),
			exec: String::new(),
			params: Vec::new(),
		}
	}

	pub fn close() -> Self {
		Self::new(JobKind::Close, "")
	}

	pub fn with_exec(mut self, exec: impl Into<String>) -> Self {
		self.exec = exec.into();
		self
	}

	pub fn with_params(mut self, params: Vec<String>) -> Self {
		self.params = params;
		self
	}
}

/// One response block: `[ name  ACTION ]` followed by the message.
pub fn block(name: &str, kind: JobKind, message: &str) -> String {
	format!("[ {}  {} ]\n{}", name, kind.label(), message)
}

/// Split a block into its header and body, for rendering on the client.
pub fn split_block(block: &str) -> (&str, &str) {
	match block.split_once('\n') {
		Some((header, body)) if header.starts_with("[ ") => (header, body),
		_ => ("", block),
	}
}
