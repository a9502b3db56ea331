//! Delimited framing for the control socket.
//!
//! Requests are accepted terminated by either `\n` or NUL so line-oriented
//! tools (`socat`, `nc`) and NUL-terminating clients both work. Replies are
//! always NUL-terminated because a reply block is multi-line text.

/// Terminator written after every reply block.
pub const REPLY_DELIMITER: u8 = 0;

/// Frames longer than this without a delimiter are discarded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

fn is_delimiter(byte: u8) -> bool {
	byte == b'\n' || byte == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Data(Vec<u8>),
	/// A frame that exceeded [`MAX_FRAME_LEN`] and was dropped.
	Oversized(usize),
}

/// Accumulates raw socket reads and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
	buf: Vec<u8>,
	discarding: bool,
	discarded: usize,
}

impl FrameBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn extend(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Next complete frame, skipping empty ones. `None` means more input is needed.
	pub fn next_frame(&mut self) -> Option<Frame> {
		loop {
			let Some(pos) = self.buf.iter().position(|b| is_delimiter(*b)) else {
				if self.buf.len() > MAX_FRAME_LEN {
					self.discarded += self.buf.len();
					self.buf.clear();
					self.discarding = true;
				}
				return None;
			};

			let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
			frame.pop();

			if self.discarding {
				let total = self.discarded + frame.len();
				self.discarding = false;
				self.discarded = 0;
				return Some(Frame::Oversized(total));
			}
			if frame.len() > MAX_FRAME_LEN {
				return Some(Frame::Oversized(frame.len()));
			}
			if frame.iter().all(|b| b.is_ascii_whitespace()) {
				continue;
			}
			return Some(Frame::Data(frame));
		}
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}
}

/// Append the reply terminator to a text block.
pub fn encode_reply(block: &str) -> Vec<u8> {
	let mut data = Vec::with_capacity(block.len() + 1);
	data.extend_from_slice(block.as_bytes());
	data.push(REPLY_DELIMITER);
	data
}

/// Append the request terminator to a serialized request.
pub fn encode_request<T: serde::Serialize>(request: &T) -> Result<Vec<u8>, serde_json::Error> {
	let mut data = serde_json::to_vec(request)?;
	data.push(0);
	Ok(data)
}
