//! Diagnostic logging via `tracing`.
//!
//! Diagnostics go to stderr. Stdout carries the structured record stream of
//! supervised processes and must stay machine-readable.
//!
//! `--log-level` wins over `VISOR_LOG`. `VISOR_LOG` takes either a bare level,
//! applied to visor's own crates, or a full `EnvFilter` directive list such as
//! `visor=debug,hyper=info`.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "VISOR_LOG";

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
	Error,
	Warn,
	Info,
	Debug,
	Trace,
}

impl LogLevel {
	fn as_str(self) -> &'static str {
		match self {
			LogLevel::Error => "error",
			LogLevel::Warn => "warn",
			LogLevel::Info => "info",
			LogLevel::Debug => "debug",
			LogLevel::Trace => "trace",
		}
	}
}

/// Our crates at `level`; the HTTP stack only speaks up for warnings.
fn directives(level: LogLevel) -> String {
	let level = level.as_str();
	format!("visor={level},visor_cli={level},reqwest=warn,hyper=warn")
}

fn filter_spec(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
	if let Some(level) = cli_level {
		return directives(level);
	}
	match env.map(str::trim).filter(|s| !s.is_empty()) {
		None => directives(LogLevel::Info),
		Some(env) => match LogLevel::from_str(env, true) {
			Ok(level) => directives(level),
			Err(_) => env.to_string(),
		},
	}
}

pub fn init_logging(cli_level: Option<LogLevel>) {
	let spec = filter_spec(cli_level, std::env::var(LOG_ENV).ok().as_deref());
	let (filter, rejected) = match EnvFilter::try_new(&spec) {
		Ok(filter) => (filter, None),
		Err(e) => (EnvFilter::new(directives(LogLevel::Info)), Some(e)),
	};

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();

	if let Some(e) = rejected {
		tracing::warn!("ignoring {}={:?}: {}", LOG_ENV, spec, e);
	}
}
