use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::report::ReportQueue;
use crate::sink::LogSink;
use crate::types::{ProcessSpec, Request, WorkerSettings};
use crate::worker::{Mailbox, Worker, WorkerStatus};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
	#[error("no task named {0}")]
	UnknownTask(String),
	#[error("task {0} is not running")]
	NotRunning(String),
}

struct WorkerHandle {
	mailbox: Mailbox,
	status: watch::Receiver<WorkerStatus>,
}

/// Routes control requests to workers by process name.
///
/// Built once with every worker already started, then only read.
pub struct Directory {
	workers: BTreeMap<String, WorkerHandle>,
}

impl Directory {
	/// Start one worker task per spec.
	pub fn start(
		specs: &[ProcessSpec],
		settings: &WorkerSettings,
		sink: &LogSink,
		reports: &ReportQueue,
	) -> Self {
		let mut workers = BTreeMap::new();
		for spec in specs {
			if workers.contains_key(&spec.name) {
				tracing::warn!("duplicate process name {}, skipping", spec.name);
				continue;
			}
			let (worker, mailbox, status) =
				Worker::new(spec.clone(), settings.clone(), sink.clone(), reports.clone());
			tokio::spawn(worker.run());
			workers.insert(spec.name.clone(), WorkerHandle { mailbox, status });
		}
		Self { workers }
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.workers.keys().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.workers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.workers.is_empty()
	}

	pub fn status(&self, name: &str) -> Option<WorkerStatus> {
		self.workers.get(name).map(|w| *w.status.borrow())
	}

	/// Follow a worker's transitions.
	pub fn watch(&self, name: &str) -> Option<watch::Receiver<WorkerStatus>> {
		self.workers.get(name).map(|w| w.status.clone())
	}

	/// Ask a worker to restart its child. Returns once the worker took the request.
	pub async fn reboot(&self, name: &str) -> Result<(), DispatchError> {
		let worker = self
			.workers
			.get(name)
			.ok_or_else(|| DispatchError::UnknownTask(name.to_string()))?;
		worker
			.mailbox
			.send(Request::Reboot)
			.await
			.map_err(|_| DispatchError::NotRunning(name.to_string()))
	}

	/// Terminate every worker, one after another, waiting for each to finish.
	pub async fn terminate_all(&self) {
		for (name, worker) in &self.workers {
			if worker.mailbox.send(Request::Terminate).await.is_err() {
				tracing::debug!("{} already finished", name);
			}
			let mut status = worker.status.clone();
			let _ = status.wait_for(WorkerStatus::is_terminated).await;
			tracing::info!("{} terminated", name);
		}
	}
}
