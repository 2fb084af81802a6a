use serde_json::Map;
use tokio::sync::{mpsc, oneshot, watch};

use crate::child::{ChildHandle, ExitOutcome};
use crate::report::ReportQueue;
use crate::sink::{Level, LogSink};
use crate::types::{format_duration, ProcessSpec, Request, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	Spawning,
	Running,
	Cooldown,
	Terminated,
}

/// Published by a worker on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
	pub state: WorkerState,
	/// Consecutive unexpected exits since the last reboot or cooldown.
	pub crashes: u32,
	/// Children started so far.
	pub spawns: u32,
	pub pid: Option<u32>,
}

impl WorkerStatus {
	pub fn is_terminated(&self) -> bool {
		self.state == WorkerState::Terminated
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
	#[error("worker is no longer running")]
	Closed,
}

struct Envelope {
	request: Request,
	taken: oneshot::Sender<()>,
}

/// Sending half of a worker's command mailbox.
#[derive(Clone)]
pub struct Mailbox {
	tx: mpsc::Sender<Envelope>,
}

impl Mailbox {
	/// Deliver `request`, returning once the worker has taken it.
	pub async fn send(&self, request: Request) -> Result<(), SendError> {
		let (taken, rx) = oneshot::channel();
		self.tx
			.send(Envelope { request, taken })
			.await
			.map_err(|_| SendError::Closed)?;
		rx.await.map_err(|_| SendError::Closed)
	}
}

enum Wake {
	Exited(ExitOutcome),
	Request(Request),
	Orphaned,
}

/// Supervises one process: spawn, watch, restart, back off.
pub struct Worker {
	spec: ProcessSpec,
	settings: WorkerSettings,
	sink: LogSink,
	reports: ReportQueue,
	mailbox: mpsc::Receiver<Envelope>,
	status: watch::Sender<WorkerStatus>,
	crashes: u32,
	spawns: u32,
}

impl Worker {
	pub fn new(
		spec: ProcessSpec,
		settings: WorkerSettings,
		sink: LogSink,
		reports: ReportQueue,
	) -> (Self, Mailbox, watch::Receiver<WorkerStatus>) {
		let (tx, mailbox) = mpsc::channel(1);
		let (status, status_rx) = watch::channel(WorkerStatus {
			state: WorkerState::Spawning,
			crashes: 0,
			spawns: 0,
			pid: None,
		});
		let worker = Self {
			spec,
			settings,
			sink,
			reports,
			mailbox,
			status,
			crashes: 0,
			spawns: 0,
		};
		(worker, Mailbox { tx }, status_rx)
	}

	pub async fn run(mut self) {
		let name = self.spec.name.clone();

		loop {
			self.publish(WorkerState::Spawning, None);
			let mut child = match ChildHandle::spawn(
				&self.spec,
				self.settings.max_line_bytes,
				&self.sink,
				&self.reports,
			) {
				Ok(child) => child,
				Err(e) => {
					self.log(Level::Error, &format!("failed to start: {}", e));
					break;
				}
			};
			self.spawns += 1;

			let mut fields = Map::new();
			fields.insert("pid".into(), child.pid().into());
			self.sink.process_event_with(Level::Info, &name, "started", fields);
			self.publish(WorkerState::Running, Some(child.pid()));

			let wake = tokio::select! {
				outcome = child.exited() => Wake::Exited(outcome),
				envelope = self.mailbox.recv() => take(envelope),
			};

			match wake {
				Wake::Exited(outcome) => {
					self.reports.report(format!(
						"{} quit after {}: {}",
						name,
						format_duration(child.uptime()),
						outcome
					));
					self.crashes += 1;
				}
				Wake::Request(Request::Reboot) => {
					self.log(Level::Info, "got a reboot request, waiting for the process to exit");
					self.stop(child).await;
					self.crashes = 0;
					continue;
				}
				Wake::Request(Request::Terminate) | Wake::Orphaned => {
					self.log(Level::Info, "got a termination request, closing the process");
					self.stop(child).await;
					break;
				}
			}

			if self.crashes >= self.settings.crash_threshold {
				self.crashes = 0;
				self.reports.report(format!(
					"{}: taking a timeout, {}",
					name,
					format_duration(self.settings.cooldown)
				));
				if !self.cool_down().await {
					break;
				}
			}
		}

		self.publish(WorkerState::Terminated, None);
	}

	/// Sit out the cooldown. Returns `false` if the worker should terminate.
	async fn cool_down(&mut self) -> bool {
		self.publish(WorkerState::Cooldown, None);
		let timer = tokio::time::sleep(self.settings.cooldown);
		tokio::pin!(timer);

		loop {
			let wake = tokio::select! {
				_ = &mut timer => return true,
				envelope = self.mailbox.recv() => take(envelope),
			};
			match wake {
				Wake::Request(Request::Reboot) => {
					self.log(Level::Warn, "ignoring reboot request during cooldown");
				}
				Wake::Request(Request::Terminate) | Wake::Orphaned => {
					self.log(Level::Info, "got a termination request, quitting");
					return false;
				}
				Wake::Exited(_) => {}
			}
		}
	}

	async fn stop(&self, child: ChildHandle) {
		let pid = child.pid();
		let outcome = child.stop(self.settings.stop_timeout).await;
		let mut fields = Map::new();
		fields.insert("pid".into(), pid.into());
		fields.insert("outcome".into(), outcome.to_string().into());
		self.sink.process_event_with(Level::Info, &self.spec.name, "stopped", fields);
	}

	fn log(&self, level: Level, msg: &str) {
		self.sink.process_event(level, &self.spec.name, msg);
	}

	fn publish(&self, state: WorkerState, pid: Option<u32>) {
		self.status.send_replace(WorkerStatus {
			state,
			crashes: self.crashes,
			spawns: self.spawns,
			pid,
		});
	}
}

fn take(envelope: Option<Envelope>) -> Wake {
	match envelope {
		Some(Envelope { request, taken }) => {
			let _ = taken.send(());
			Wake::Request(request)
		}
		None => Wake::Orphaned,
	}
}
