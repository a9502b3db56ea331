use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::frame::{self, Frame, FrameBuffer};
use crate::paths::DaemonPaths;

/// What the connection should do after a request has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Close,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
	/// Rolling read timeout; a connection silent for this long is closed.
	pub idle_timeout: Duration,
}

impl Default for ServerOptions {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
	#[error("failed to bind socket {path}: {source}")]
	Bind { path: PathBuf, source: io::Error },
	#[error("another daemon is already listening on {0}")]
	AlreadyRunning(PathBuf),
}

/// Streams reply blocks back to the client that sent the current request.
///
/// Blocks are written in the order they are sent and all of them reach the
/// socket before the next request on the same connection is read.
#[derive(Debug, Clone)]
pub struct Responder {
	tx: mpsc::UnboundedSender<String>,
}

impl Responder {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	/// Returns false once the connection has gone away.
	pub fn send(&self, block: impl Into<String>) -> bool {
		self.tx.send(block.into()).is_ok()
	}
}

pub fn bind(paths: &DaemonPaths) -> Result<UnixListener, ServeError> {
	let socket_path = paths.socket_path();
	UnixListener::bind(&socket_path).map_err(|source| ServeError::Bind {
		path: socket_path,
		source,
	})
}

/// Bind the daemon socket and serve until the task is dropped.
pub async fn run_socket_server<Req, F, Fut>(
	paths: &DaemonPaths,
	options: ServerOptions,
	handler: F,
) -> Result<(), ServeError>
where
	Req: DeserializeOwned + Send + 'static,
	F: Fn(Req, Responder) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Flow> + Send + 'static,
{
	let listener = bind(paths)?;
	tracing::info!("listening on {}", paths.socket_path().display());
	serve(listener, options, handler).await;
	Ok(())
}

pub async fn serve<Req, F, Fut>(listener: UnixListener, options: ServerOptions, handler: F)
where
	Req: DeserializeOwned + Send + 'static,
	F: Fn(Req, Responder) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Flow> + Send + 'static,
{
	let handler = Arc::new(handler);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let idle_timeout = options.idle_timeout;
		tokio::spawn(async move {
			handle_connection::<Req, _, _>(stream, handler, idle_timeout).await;
		});
	}
}

async fn handle_connection<Req, F, Fut>(stream: UnixStream, handler: Arc<F>, idle_timeout: Duration)
where
	Req: DeserializeOwned + Send + 'static,
	F: Fn(Req, Responder) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Flow> + Send + 'static,
{
	let (mut reader, mut writer) = stream.into_split();
	let mut frames = FrameBuffer::new();
	let mut chunk = vec![0u8; 4096];

	loop {
		while let Some(frame) = frames.next_frame() {
			let data = match frame {
				Frame::Data(data) => data,
				Frame::Oversized(len) => {
					tracing::warn!("dropping oversized request ({} bytes)", len);
					continue;
				}
			};

			let request: Req = match serde_json::from_slice(&data) {
				Ok(r) => r,
				Err(e) => {
					tracing::warn!(
						"invalid request: {} ({})",
						e,
						String::from_utf8_lossy(&data)
					);
					continue;
				}
			};

			match dispatch(handler.as_ref(), request, &mut writer).await {
				Ok(Flow::Continue) => {}
				Ok(Flow::Close) => return,
				Err(e) => {
					tracing::debug!("client went away: {}", e);
					return;
				}
			}
		}

		let n = match tokio::time::timeout(idle_timeout, reader.read(&mut chunk)).await {
			Err(_) => {
				tracing::debug!("connection idle for {:?}, closing", idle_timeout);
				return;
			}
			Ok(Err(e)) => {
				tracing::warn!("read error: {}", e);
				return;
			}
			Ok(Ok(0)) => return,
			Ok(Ok(n)) => n,
		};
		frames.extend(&chunk[..n]);
	}
}

async fn dispatch<Req, F, Fut>(handler: &F, request: Req, writer: &mut OwnedWriteHalf) -> io::Result<Flow>
where
	F: Fn(Req, Responder) -> Fut,
	Fut: Future<Output = Flow>,
{
	let (responder, mut replies) = Responder::channel();
	let handled = handler(request, responder);
	tokio::pin!(handled);

	let flow = loop {
		tokio::select! {
			flow = &mut handled => break flow,
			Some(block) = replies.recv() => {
				writer.write_all(&frame::encode_reply(&block)).await?;
			}
		}
	};

	while let Ok(block) = replies.try_recv() {
		writer.write_all(&frame::encode_reply(&block)).await?;
	}
	Ok(flow)
}
