use serde_json::Map;
use std::sync::{Arc, Mutex};

use crate::sink::{Level, LogSink};

/// Operator-facing report lines waiting for the next digest.
///
/// Cloning shares the queue. Workers append; the notifier drains.
#[derive(Clone)]
pub struct ReportQueue {
	lines: Arc<Mutex<Vec<String>>>,
	sink: LogSink,
}

impl ReportQueue {
	pub fn new(sink: LogSink) -> Self {
		Self {
			lines: Arc::new(Mutex::new(Vec::new())),
			sink,
		}
	}

	/// Append a line. The line is also logged as a `report` event.
	pub fn report(&self, line: impl Into<String>) {
		let line = line.into();
		let mut fields = Map::new();
		fields.insert("report".into(), line.clone().into());
		self.sink.event(Level::Info, "report", fields);

		let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
		lines.push(line);
	}

	/// Take every queued line, leaving the queue empty.
	pub fn drain(&self) -> Vec<String> {
		let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
		std::mem::take(&mut *lines)
	}

	pub fn snapshot(&self) -> Vec<String> {
		let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
		lines.clone()
	}

	pub fn len(&self) -> usize {
		self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Numbered digest body, or `None` when there is nothing to send.
pub fn format_digest(lines: &[String]) -> Option<String> {
	if lines.is_empty() {
		return None;
	}
	let mut body = String::new();
	for (i, line) in lines.iter().enumerate() {
		body.push_str(&format!("#{}: {}\n\n", i + 1, line));
	}
	Some(body)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn drain_empties_the_queue() {
		let queue = ReportQueue::new(LogSink::quiet());
		queue.report("api quit after 2s: exit status: 1");
		queue.report("api: taking a timeout, 1h0m0s");
		assert_eq!(queue.len(), 2);

		let lines = queue.drain();
		assert_eq!(lines.len(), 2);
		assert!(queue.is_empty());
		assert!(queue.drain().is_empty());
	}

	#[test]
	fn clones_share_lines() {
		let queue = ReportQueue::new(LogSink::quiet());
		let other = queue.clone();
		other.report("from a worker");
		assert_eq!(queue.snapshot(), vec!["from a worker".to_string()]);
	}

	#[test]
	fn reports_are_logged() {
		let (sink, log) = LogSink::memory();
		let queue = ReportQueue::new(sink);
		queue.report("db quit after 1s: signal: 9");
		let entries = log.entries();
		assert_eq!(entries[0]["msg"], "report");
		assert_eq!(entries[0]["report"], "db quit after 1s: signal: 9");
	}

	#[test]
	fn digest_numbers_lines() {
		assert_eq!(format_digest(&[]), None);
		let body = format_digest(&["a".to_string(), "b".to_string()]).unwrap();
		assert_eq!(body, "#1: a\n\n#2: b\n\n");
	}
}
