use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SHELL: &str = "/bin/sh";

/// One `$key=shell command` entry, split but not yet run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderCommand {
	pub key: String,
	pub command: String,
}

/// Split a replace entry on its first `=`. The key must start with `$` and
/// the command must not be blank.
pub fn parse_entry(entry: &str) -> Option<PlaceholderCommand> {
	let (key, command) = entry.split_once('=')?;
	let key = key.trim();
	let command = command.trim();
	if key.len() < 2 || !key.starts_with('$') || command.is_empty() {
		return None;
	}
	Some(PlaceholderCommand {
		key: key.to_string(),
		command: command.to_string(),
	})
}

/// Resolved `$key` values for one start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
	// longest key first so `$ip6` is replaced before `$ip`
	bindings: Vec<(String, String)>,
}

impl Placeholders {
	pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: Into<String>,
		V: Into<String>,
	{
		let mut bindings: Vec<(String, String)> = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
		bindings.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
		bindings.dedup_by(|later, earlier| later.0 == earlier.0);
		Self { bindings }
	}

	/// Run every entry's command with `/bin/sh -c` and bind the trimmed stdout.
	/// Malformed entries and commands that fail are skipped.
	pub async fn resolve(entries: &[String]) -> Self {
		let mut pairs = Vec::new();
		for entry in entries {
			let Some(cmd) = parse_entry(entry) else {
				tracing::warn!("ignoring malformed replace entry {:?}", entry);
				continue;
			};
			match run(&cmd).await {
				Some(value) => pairs.push((cmd.key, value)),
				None => tracing::warn!("placeholder {} unresolved", cmd.key),
			}
		}
		Self::from_pairs(pairs)
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.bindings
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}

	pub fn is_empty(&self) -> bool {
		self.bindings.is_empty()
	}

	/// Substitute every known key in `param`. Parameters without `$` are
	/// returned untouched.
	pub fn expand(&self, param: &str) -> String {
		if !param.contains('$') {
			return param.to_string();
		}
		self.bindings
			.iter()
			.fold(param.to_string(), |acc, (key, value)| acc.replace(key.as_str(), value))
	}

	pub fn expand_all(&self, params: &[String]) -> Vec<String> {
		params.iter().map(|p| self.expand(p)).collect()
	}
}

async fn run(cmd: &PlaceholderCommand) -> Option<String> {
	let output = Command::new(SHELL)
		.arg("-c")
		.arg(&cmd.command)
		.stdin(Stdio::null())
		.kill_on_drop(true)
		.output();
	let output = match tokio::time::timeout(RESOLVE_TIMEOUT, output).await {
		Ok(Ok(output)) => output,
		Ok(Err(e)) => {
			tracing::warn!("cannot run {:?}: {}", cmd.command, e);
			return None;
		}
		Err(_) => {
			tracing::warn!("{:?} timed out after {:?}", cmd.command, RESOLVE_TIMEOUT);
			return None;
		}
	};
	if !output.status.success() {
		tracing::warn!("{:?} exited with {}", cmd.command, output.status);
		return None;
	}
	Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_entry_splits_on_first_equals() {
		assert_eq!(
			parse_entry("$ip= echo a=b "),
			Some(PlaceholderCommand {
				key: "$ip".into(),
				command: "echo a=b".into(),
			})
		);
		assert_eq!(parse_entry("ip=echo 1"), None);
		assert_eq!(parse_entry("$=echo 1"), None);
		assert_eq!(parse_entry("$ip=   "), None);
		assert_eq!(parse_entry("no equals"), None);
	}

	#[test]
	fn longer_keys_are_replaced_first() {
		let p = Placeholders::from_pairs([("$ip", "1.2.3.4"), ("$ip6", "::1")]);
		assert_eq!(p.expand("-c=$ip6"), "-c=::1");
		assert_eq!(p.expand("-a=$ip,$ip6"), "-a=1.2.3.4,::1");
	}

	#[test]
	fn params_without_dollar_are_untouched() {
		let p = Placeholders::from_pairs([("ip", "x")]);
		assert_eq!(p.expand("-zip"), "-zip");
		assert_eq!(
			Placeholders::default().expand_all(&["-c=$ip".to_string()]),
			vec!["-c=$ip".to_string()]
		);
	}

	#[tokio::test]
	async fn resolve_runs_commands_and_skips_failures() {
		let entries = vec![
			"$ip=echo 1.2.3.4".to_string(),
			"$bad=/nonexistent/ssd-command".to_string(),
			"$fail=false".to_string(),
			"garbage".to_string(),
		];
		let p = Placeholders::resolve(&entries).await;
		assert_eq!(p.get("$ip"), Some("1.2.3.4"));
		assert_eq!(p.get("$bad"), None);
		assert_eq!(p.get("$fail"), None);
		assert_eq!(p.expand("-c=$ip"), "-c=1.2.3.4");
	}

	#[tokio::test]
	async fn resolve_supports_pipelines() {
		let entries = vec!["$host=printf 'web.example.org\\n' | cut -d. -f1".to_string()];
		let p = Placeholders::resolve(&entries).await;
		assert_eq!(p.get("$host"), Some("web"));
	}
}
