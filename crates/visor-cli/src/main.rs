mod config;
mod logging;
mod notifier;

use clap::{Parser, Subcommand};
use serde_json::Map;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use visor::control::DEFAULT_ADDR;
use visor::{ControlClient, Directory, Level, LogSink, ReportQueue};

use crate::logging::LogLevel;
use crate::notifier::{Credentials, Mailer};

#[derive(Debug, Parser)]
#[command(name = "visor", version, about = "Keep a fixed set of processes running.", long_about = None)]
struct Cli {
	/// Diagnostic log level on stderr. Falls back to `VISOR_LOG`, then `info`.
	#[arg(long, global = true, value_enum, value_name = "LEVEL")]
	log_level: Option<LogLevel>,

	#[command(subcommand)]
	command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
	/// Supervise the configured processes (default)
	Run {
		/// Config file. Default: visor.toml, or visor.json if only that exists.
		#[arg(short, long, value_name = "PATH")]
		config: Option<PathBuf>,
		/// Control address, overriding the config file
		#[arg(long, value_name = "ADDR")]
		listen: Option<String>,
	},
	/// Restart one supervised process
	Reboot {
		name: String,
		#[arg(long, default_value = DEFAULT_ADDR)]
		addr: String,
	},
	/// Stop every process and shut the supervisor down
	Term {
		#[arg(long, default_value = DEFAULT_ADDR)]
		addr: String,
	},
}

fn main() -> ExitCode {
	let cli = Cli::parse();
	logging::init_logging(cli.log_level);

	match cli.command.unwrap_or(Cmd::Run {
		config: None,
		listen: None,
	}) {
		Cmd::Run { config, listen } => {
			let runtime = match tokio::runtime::Runtime::new() {
				Ok(rt) => rt,
				Err(e) => {
					tracing::error!("failed to start runtime: {}", e);
					return ExitCode::FAILURE;
				}
			};
			runtime.block_on(run(config.unwrap_or_else(config::default_path), listen))
		}
		Cmd::Reboot { name, addr } => send_command(&addr, &format!("reboot {}", name)),
		Cmd::Term { addr } => send_command(&addr, "term"),
	}
}

async fn run(config_path: PathBuf, listen: Option<String>) -> ExitCode {
	let _ = dotenv::dotenv();

	let config = match config::load(&config_path) {
		Ok(c) => c,
		Err(e) => {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	};
	let credentials = match Credentials::from_env() {
		Ok(c) => c,
		Err(e) => {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	};

	let addr = listen.unwrap_or_else(|| config.listen.clone());
	let listener = match TcpListener::bind(&addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind {}: {}", addr, e);
			return ExitCode::FAILURE;
		}
	};

	if config.processes.is_empty() {
		tracing::warn!("{} lists no processes", config_path.display());
	}

	let sink = LogSink::stdout();
	let reports = ReportQueue::new(sink.clone());
	let mailer = match Mailer::new(credentials, &config.admin_email) {
		Ok(m) => m,
		Err(e) => {
			tracing::error!("{}", e);
			return ExitCode::FAILURE;
		}
	};
	let notifier = tokio::spawn(notifier::run_notifier(
		reports.clone(),
		mailer.clone(),
		notifier::DIGEST_INTERVAL,
	));

	let directory = Directory::start(&config.processes, &config.worker.settings(), &sink, &reports);
	let mut fields = Map::new();
	fields.insert("pid".into(), std::process::id().into());
	fields.insert("processes".into(), directory.len().into());
	fields.insert("listen".into(), addr.into());
	sink.event(Level::Info, "visor started", fields);

	visor::run_control_server(listener, &directory).await;

	notifier.abort();
	if tokio::time::timeout(notifier::REQUEST_TIMEOUT, notifier::flush(&reports, &mailer))
		.await
		.is_err()
	{
		tracing::warn!("gave up on the last digest");
	}
	sink.event(Level::Info, "all processes stopped, exiting", Map::new());
	ExitCode::SUCCESS
}

fn send_command(addr: &str, command: &str) -> ExitCode {
	let reply = ControlClient::connect(addr).and_then(|mut client| client.send(command));
	match reply {
		Ok(reply) => {
			println!("{}", reply);
			if reply == "ok" {
				ExitCode::SUCCESS
			} else {
				ExitCode::FAILURE
			}
		}
		Err(e) => {
			eprintln!("error: {}", e);
			ExitCode::FAILURE
		}
	}
}
