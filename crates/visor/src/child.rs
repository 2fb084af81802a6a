use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::output::{pipe_output, LineSplitter};
use crate::report::ReportQueue;
use crate::sink::LogSink;
use crate::types::{ProcessSpec, Stream};

/// How a child ended.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
	Exited(ExitStatus),
	WaitFailed(String),
}

impl ExitOutcome {
	pub fn success(&self) -> bool {
		matches!(self, ExitOutcome::Exited(status) if status.success())
	}
}

impl std::fmt::Display for ExitOutcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExitOutcome::Exited(status) => write!(f, "{}", status),
			ExitOutcome::WaitFailed(e) => write!(f, "wait failed: {}", e),
		}
	}
}

/// A running child process.
///
/// The OS handle itself lives in a waiter task that reaps the child, delivers
/// signals to it and fires the exit notification exactly once. Signals go
/// through the waiter so a child that was already reaped is never signalled.
pub struct ChildHandle {
	name: String,
	pid: u32,
	started_at: Instant,
	signals: mpsc::UnboundedSender<Signal>,
	exit: oneshot::Receiver<ExitOutcome>,
}

impl ChildHandle {
	/// Start `spec` with both output streams wired to the log sink.
	pub fn spawn(
		spec: &ProcessSpec,
		max_line_bytes: usize,
		sink: &LogSink,
		reports: &ReportQueue,
	) -> io::Result<Self> {
		let argv = spec.argv();
		let (program, args) = argv
			.split_first()
			.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

		let mut cmd = Command::new(program);
		cmd.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);
		if !spec.dir.as_os_str().is_empty() {
			cmd.current_dir(&spec.dir);
		}

		let started_at = Instant::now();
		let mut child = cmd.spawn()?;
		let pid = child.id().unwrap_or(0);

		if let Some(stdout) = child.stdout.take() {
			let splitter = LineSplitter::new(&spec.name, Stream::Stdout, max_line_bytes);
			tokio::spawn(pipe_output(stdout, splitter, sink.clone(), reports.clone()));
		}
		if let Some(stderr) = child.stderr.take() {
			let splitter = LineSplitter::new(&spec.name, Stream::Stderr, max_line_bytes);
			tokio::spawn(pipe_output(stderr, splitter, sink.clone(), reports.clone()));
		}

		let (tx, exit) = oneshot::channel();
		let (signals, signal_rx) = mpsc::unbounded_channel();
		tokio::spawn(wait_and_signal(child, spec.name.clone(), pid, signal_rx, tx));

		Ok(Self {
			name: spec.name.clone(),
			pid,
			started_at,
			signals,
			exit,
		})
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	pub fn uptime(&self) -> Duration {
		self.started_at.elapsed()
	}

	/// Resolves once the child has exited. Cancel-safe.
	pub async fn exited(&mut self) -> ExitOutcome {
		match (&mut self.exit).await {
			Ok(outcome) => outcome,
			Err(_) => ExitOutcome::WaitFailed("exit watcher went away".into()),
		}
	}

	/// Interrupt the child and wait for it to exit.
	///
	/// A child still alive after `timeout` is sent SIGKILL. Signal failures are
	/// logged and otherwise ignored.
	pub async fn stop(mut self, timeout: Duration) -> ExitOutcome {
		if let Ok(outcome) = self.exit.try_recv() {
			return outcome;
		}

		self.signal(Signal::SIGINT);
		match tokio::time::timeout(timeout, self.exited()).await {
			Ok(outcome) => outcome,
			Err(_) => {
				tracing::warn!("{} (pid {}) ignored SIGINT for {:?}, killing", self.name, self.pid, timeout);
				self.signal(Signal::SIGKILL);
				self.exited().await
			}
		}
	}

	fn signal(&self, signal: Signal) {
		// fails only once the waiter is done, and then the exit is already queued
		let _ = self.signals.send(signal);
	}
}

async fn wait_and_signal(
	mut child: Child,
	name: String,
	pid: u32,
	mut signals: mpsc::UnboundedReceiver<Signal>,
	exit: oneshot::Sender<ExitOutcome>,
) {
	let status = loop {
		tokio::select! {
			status = child.wait() => break status,
			Some(signal) = signals.recv() => {
				// reap first: an unreaped child still owns its pid
				match child.try_wait() {
					Ok(Some(status)) => break Ok(status),
					Ok(None) => signal_group(&name, pid, signal),
					Err(e) => break Err(e),
				}
			}
		}
	};
	let outcome = match status {
		Ok(status) => ExitOutcome::Exited(status),
		Err(e) => ExitOutcome::WaitFailed(e.to_string()),
	};
	let _ = exit.send(outcome);
}

fn signal_group(name: &str, pid: u32, signal: Signal) {
	if pid == 0 {
		return;
	}
	// Children lead their own process group, so this reaches grandchildren too.
	if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
		tracing::warn!("failed to send {} to {} (pid {}): {}", signal, name, pid, e);
	}
}
