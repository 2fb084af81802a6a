use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One supervised process, as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
	#[serde(alias = "Name")]
	pub name: String,
	#[serde(alias = "Command")]
	pub command: String,
	#[serde(default, alias = "Dir", alias = "workingDirectory")]
	pub dir: PathBuf,
}

impl ProcessSpec {
	pub fn new(name: impl Into<String>, command: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			command: command.into(),
			dir: dir.into(),
		}
	}

	/// Executable followed by its arguments. Commands are not run through a shell.
	pub fn argv(&self) -> Vec<&str> {
		self.command.split_whitespace().collect()
	}
}

/// Control requests delivered to a worker's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
	Reboot,
	Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
	Stdout,
	Stderr,
}

impl Stream {
	pub fn as_str(&self) -> &'static str {
		match self {
			Stream::Stdout => "stdout",
			Stream::Stderr => "stderr",
		}
	}
}

impl std::fmt::Display for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

pub const DEFAULT_CRASH_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Tuning shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
	/// Consecutive unexpected exits that put a worker into cooldown.
	pub crash_threshold: u32,
	pub cooldown: Duration,
	/// How long a stopped child gets to honour SIGINT before it is killed.
	pub stop_timeout: Duration,
	/// Upper bound on a buffered, not yet terminated stdout line.
	pub max_line_bytes: usize,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			crash_threshold: DEFAULT_CRASH_THRESHOLD,
			cooldown: DEFAULT_COOLDOWN,
			stop_timeout: DEFAULT_STOP_TIMEOUT,
			max_line_bytes: DEFAULT_MAX_LINE_BYTES,
		}
	}
}

/// Human-readable duration in the style `1h0m0s`, `2.5s`, `340ms`.
pub fn format_duration(d: Duration) -> String {
	let total = d.as_secs();
	let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
	let millis = d.subsec_millis();
	if h > 0 {
		format!("{}h{}m{}s", h, m, s)
	} else if m > 0 {
		format!("{}m{}s", m, s)
	} else if s > 0 {
		if millis > 0 {
			let frac = format!("{:03}", millis);
			format!("{}.{}s", s, frac.trim_end_matches('0'))
		} else {
			format!("{}s", s)
		}
	} else {
		format!("{}ms", millis)
	}
}
