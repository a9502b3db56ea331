use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::Serialize;

use crate::frame::{self, REPLY_DELIMITER};
use crate::paths::DaemonPaths;

/// Errors from daemon client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Daemon is not running (socket not found or refusing connections).
	#[error("daemon not running")]
	NotRunning,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("serialize error: {0}")]
	Serialize(String),
}

/// Synchronous client for a daemon speaking delimited JSON requests and
/// NUL-terminated text replies.
pub struct DaemonClient<Req> {
	writer: UnixStream,
	reader: BufReader<UnixStream>,
	_phantom: PhantomData<Req>,
}

impl<Req> DaemonClient<Req>
where
	Req: Serialize,
{
	/// Connect to an already-running daemon.
	/// Returns `Err(ClientError::NotRunning)` if the socket doesn't accept connections.
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		let reader = BufReader::new(stream.try_clone()?);
		Ok(Self {
			writer: stream,
			reader,
			_phantom: PhantomData,
		})
	}

	pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
		self.reader.get_ref().set_read_timeout(timeout)?;
		Ok(())
	}

	/// Queue one request; replies are read separately with [`Self::next_reply`].
	pub fn send(&mut self, request: &Req) -> Result<(), ClientError> {
		let data = frame::encode_request(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		self.writer.write_all(&data)?;
		Ok(())
	}

	/// Next reply block, or `None` once the daemon has closed the connection.
	pub fn next_reply(&mut self) -> Result<Option<String>, ClientError> {
		let mut block = Vec::new();
		let n = self.reader.read_until(REPLY_DELIMITER, &mut block)?;
		if n == 0 {
			return Ok(None);
		}
		if block.last() == Some(&REPLY_DELIMITER) {
			block.pop();
		}
		Ok(Some(String::from_utf8_lossy(&block).into_owned()))
	}

	/// Read every reply until the daemon closes the connection.
	pub fn drain(&mut self, mut each: impl FnMut(String)) -> Result<(), ClientError> {
		while let Some(block) = self.next_reply()? {
			each(block);
		}
		Ok(())
	}
}

/// Check if a daemon is running (socket is connectable).
pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

/// Read the PID of a running daemon from its PID file.
pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
