use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use visor::{ProcessSpec, WorkerSettings};

pub const CONFIG_FILE: &str = "visor.toml";
pub const LEGACY_CONFIG_FILE: &str = "visor.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: String,
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {message}")]
	Parse { path: String, message: String },
	#[error("missing admin email config parameter")]
	MissingEmail,
	#[error("process #{0} has an empty name")]
	EmptyName(usize),
	#[error("process {0} has an empty command")]
	EmptyCommand(String),
	#[error("duplicate process name {0}")]
	Duplicate(String),
	#[error("crash_threshold must be at least 1")]
	ZeroThreshold,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisorConfig {
	#[serde(default, alias = "AdminEmail")]
	pub admin_email: String,
	#[serde(default = "default_listen", alias = "Listen")]
	pub listen: String,
	#[serde(default, alias = "Processes")]
	pub processes: Vec<ProcessSpec>,
	#[serde(default)]
	pub worker: WorkerConfig,
}

fn default_listen() -> String {
	visor::control::DEFAULT_ADDR.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
	#[serde(default = "default_crash_threshold")]
	pub crash_threshold: u32,
	#[serde(default = "default_cooldown_secs")]
	pub cooldown_secs: u64,
	#[serde(default = "default_stop_timeout_secs")]
	pub stop_timeout_secs: u64,
	#[serde(default = "default_max_line_bytes")]
	pub max_line_bytes: usize,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			crash_threshold: default_crash_threshold(),
			cooldown_secs: default_cooldown_secs(),
			stop_timeout_secs: default_stop_timeout_secs(),
			max_line_bytes: default_max_line_bytes(),
		}
	}
}

fn default_crash_threshold() -> u32 {
	visor::DEFAULT_CRASH_THRESHOLD
}
fn default_cooldown_secs() -> u64 {
	visor::DEFAULT_COOLDOWN.as_secs()
}
fn default_stop_timeout_secs() -> u64 {
	visor::DEFAULT_STOP_TIMEOUT.as_secs()
}
fn default_max_line_bytes() -> usize {
	visor::DEFAULT_MAX_LINE_BYTES
}

impl WorkerConfig {
	pub fn settings(&self) -> WorkerSettings {
		WorkerSettings {
			crash_threshold: self.crash_threshold,
			cooldown: Duration::from_secs(self.cooldown_secs),
			stop_timeout: Duration::from_secs(self.stop_timeout_secs),
			max_line_bytes: self.max_line_bytes,
		}
	}
}

impl VisorConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.admin_email.trim().is_empty() {
			return Err(ConfigError::MissingEmail);
		}
		if self.worker.crash_threshold == 0 {
			return Err(ConfigError::ZeroThreshold);
		}
		let mut seen = HashSet::new();
		for (i, spec) in self.processes.iter().enumerate() {
			if spec.name.trim().is_empty() {
				return Err(ConfigError::EmptyName(i + 1));
			}
			if spec.argv().is_empty() {
				return Err(ConfigError::EmptyCommand(spec.name.clone()));
			}
			if !seen.insert(spec.name.as_str()) {
				return Err(ConfigError::Duplicate(spec.name.clone()));
			}
		}
		Ok(())
	}
}

/// `visor.toml` if present, otherwise a legacy `visor.json` next to it.
pub fn default_path() -> PathBuf {
	let toml = PathBuf::from(CONFIG_FILE);
	let json = PathBuf::from(LEGACY_CONFIG_FILE);
	if !toml.exists() && json.exists() {
		json
	} else {
		toml
	}
}

/// Read, parse and validate a config file. `.json` files are parsed as JSON,
/// everything else as TOML.
pub fn load(path: &Path) -> Result<VisorConfig, ConfigError> {
	let display = path.display().to_string();
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
		path: display.clone(),
		source,
	})?;

	let is_json = path.extension().is_some_and(|ext| ext == "json");
	let config = if is_json {
		serde_json::from_str::<VisorConfig>(&content).map_err(|e| e.to_string())
	} else {
		toml::from_str::<VisorConfig>(&content).map_err(|e| e.to_string())
	}
	.map_err(|message| ConfigError::Parse {
		path: display,
		message,
	})?;

	config.validate()?;
	Ok(config)
}
