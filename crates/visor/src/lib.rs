//! # visor
//!
//! A small process supervisor engine.
//!
//! Every configured process gets a [`Worker`] that keeps it running, restarts
//! it when it exits, and backs off for a cooldown after repeated crashes.
//! Child output is turned into JSON log records, and a line-based TCP control
//! protocol can reboot a single process or terminate them all.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use visor::{Directory, LogSink, ProcessSpec, ReportQueue, WorkerSettings};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = LogSink::stdout();
//! let reports = ReportQueue::new(sink.clone());
//! let specs = vec![ProcessSpec::new("web", "python3 -m http.server", "/srv/www")];
//!
//! let directory = Directory::start(&specs, &WorkerSettings::default(), &sink, &reports);
//! let listener = tokio::net::TcpListener::bind(visor::control::DEFAULT_ADDR).await.unwrap();
//! visor::run_control_server(listener, &directory).await;
//! # }
//! ```

pub mod types;
pub mod sink;
pub mod output;
pub mod report;
pub mod child;
pub mod worker;
pub mod directory;
pub mod control;
pub mod client;

pub use types::*;
pub use sink::{Level, LogSink, MemoryLog};
pub use output::{LineSplitter, LogRecord, Payload};
pub use report::{format_digest, ReportQueue};
pub use child::{ChildHandle, ExitOutcome};
pub use worker::{Mailbox, SendError, Worker, WorkerState, WorkerStatus};
pub use directory::{DispatchError, Directory};
pub use control::{parse_command, run_control_server, Command, ParseError};
pub use client::{ClientError, ControlClient};
