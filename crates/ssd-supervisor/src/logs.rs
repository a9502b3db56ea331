use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub fn service_log_path(log_dir: &Path, service: &str) -> PathBuf {
	log_dir.join(format!("{}.log", service))
}

pub fn rotated_log_path(log_dir: &Path, service: &str) -> PathBuf {
	log_dir.join(format!("{}.log.1", service))
}

/// Move the current log aside once it exceeds `max_size` bytes. A previous
/// rotation is overwritten. `max_size` of zero disables rotation.
pub fn rotate_if_oversized(log_dir: &Path, service: &str, max_size: u64) -> io::Result<bool> {
	if max_size == 0 {
		return Ok(false);
	}
	let current = service_log_path(log_dir, service);
	let size = match std::fs::metadata(&current) {
		Ok(meta) => meta.len(),
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
		Err(e) => return Err(e),
	};
	if size <= max_size {
		return Ok(false);
	}
	std::fs::rename(&current, rotated_log_path(log_dir, service))?;
	Ok(true)
}

/// Open the service log for appending, rotating it first if needed.
pub fn open_service_log(log_dir: &Path, service: &str, max_size: u64) -> io::Result<File> {
	std::fs::create_dir_all(log_dir)?;
	if rotate_if_oversized(log_dir, service, max_size)? {
		tracing::info!("rotated log for {}", service);
	}
	OpenOptions::new()
		.create(true)
		.append(true)
		.open(service_log_path(log_dir, service))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("ssd-logs-{}-{}", std::process::id(), name));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	#[test]
	fn appends_to_existing_log() {
		let dir = temp_dir("append");
		{
			use std::io::Write;
			let mut f = open_service_log(&dir, "web", 1024).unwrap();
			f.write_all(b"one\n").unwrap();
			let mut f = open_service_log(&dir, "web", 1024).unwrap();
			f.write_all(b"two\n").unwrap();
		}
		let text = std::fs::read_to_string(service_log_path(&dir, "web")).unwrap();
		assert_eq!(text, "one\ntwo\n");
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn oversized_log_is_rotated() {
		let dir = temp_dir("rotate");
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(service_log_path(&dir, "web"), vec![b'x'; 64]).unwrap();

		assert!(!rotate_if_oversized(&dir, "web", 0).unwrap());
		assert!(!rotate_if_oversized(&dir, "web", 64).unwrap());
		let f = open_service_log(&dir, "web", 32).unwrap();
		assert_eq!(f.metadata().unwrap().len(), 0);
		assert_eq!(
			std::fs::metadata(rotated_log_path(&dir, "web")).unwrap().len(),
			64
		);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn missing_log_is_not_rotated() {
		let dir = temp_dir("missing");
		assert!(!rotate_if_oversized(&dir, "web", 1).unwrap());
	}
}
