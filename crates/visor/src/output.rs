//! Child output multiplexing.
//!
//! Each child gets one [`LineSplitter`] per output stream. Stdout is split into
//! lines and every line is parsed as a JSON object when possible; stderr is
//! taken chunk by chunk as unstructured error output.

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::report::ReportQueue;
use crate::sink::{self, LogSink};
use crate::types::Stream;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	/// Fields of a JSON object line.
	Structured(Map<String, Value>),
	/// A line that was not a JSON object.
	Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
	pub process: String,
	pub stream: Stream,
	pub timestamp: String,
	/// Level assigned by the supervisor rather than the child.
	pub level: Option<&'static str>,
	pub payload: Payload,
	/// Set when an over-long partial line was flushed without its newline.
	pub truncated: bool,
}

impl LogRecord {
	fn new(process: &str, stream: Stream, payload: Payload) -> Self {
		Self {
			process: process.to_string(),
			stream,
			timestamp: sink::timestamp(),
			level: None,
			payload,
			truncated: false,
		}
	}

	pub fn level(&self) -> Option<&str> {
		match &self.payload {
			Payload::Structured(fields) => fields.get("level").and_then(Value::as_str).or(self.level),
			Payload::Raw(_) => self.level,
		}
	}

	pub fn message(&self) -> Option<&str> {
		match &self.payload {
			Payload::Structured(fields) => fields.get("msg").and_then(Value::as_str),
			Payload::Raw(message) => Some(message),
		}
	}

	/// The child's `alert` field, if it asked for operator attention.
	pub fn alert(&self) -> Option<&Value> {
		match &self.payload {
			Payload::Structured(fields) => fields.get("alert"),
			Payload::Raw(_) => None,
		}
	}

	/// Flatten into the JSON object written to the log sink.
	pub fn to_entry(&self) -> Map<String, Value> {
		let mut entry = match &self.payload {
			Payload::Structured(fields) => fields.clone(),
			Payload::Raw(message) => {
				let mut entry = Map::new();
				entry.insert("message".into(), message.clone().into());
				entry
			}
		};
		if let Some(level) = self.level {
			entry.entry("level").or_insert_with(|| level.into());
		}
		if self.truncated {
			entry.insert("truncated".into(), true.into());
		}
		entry.insert("processName".into(), self.process.clone().into());
		entry.insert("visorProc".into(), self.process.clone().into());
		entry.insert("stream".into(), self.stream.as_str().into());
		entry.insert("t".into(), self.timestamp.clone().into());
		entry
	}
}

/// Reassembles one output stream of one child into records.
pub struct LineSplitter {
	process: String,
	stream: Stream,
	buf: Vec<u8>,
	max_line: usize,
}

impl LineSplitter {
	pub fn new(process: impl Into<String>, stream: Stream, max_line: usize) -> Self {
		Self {
			process: process.into(),
			stream,
			buf: Vec::new(),
			max_line,
		}
	}

	/// Feed the next chunk read from the pipe and collect finished records.
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<LogRecord> {
		match self.stream {
			Stream::Stderr => self.feed_stderr(chunk).into_iter().collect(),
			Stream::Stdout => self.feed_stdout(chunk),
		}
	}

	/// Bytes of an unfinished line.
	pub fn pending(&self) -> &[u8] {
		&self.buf
	}

	fn feed_stderr(&self, chunk: &[u8]) -> Option<LogRecord> {
		let text = String::from_utf8_lossy(chunk);
		let text = text.trim_end_matches(['\n', '\r']);
		if text.is_empty() {
			return None;
		}
		let mut record = LogRecord::new(&self.process, self.stream, Payload::Raw(text.to_string()));
		record.level = Some("error");
		Some(record)
	}

	fn feed_stdout(&mut self, chunk: &[u8]) -> Vec<LogRecord> {
		self.buf.extend_from_slice(chunk);
		let mut records = Vec::new();
		let mut start = 0;

		while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
			let line = &self.buf[start..start + pos];
			records.push(LogRecord::new(&self.process, self.stream, parse_line(line)));
			start += pos + 1;
		}
		self.buf.drain(..start);

		if self.buf.len() > self.max_line {
			let text = String::from_utf8_lossy(&self.buf).into_owned();
			let mut record = LogRecord::new(&self.process, self.stream, Payload::Raw(text));
			record.truncated = true;
			records.push(record);
			self.buf.clear();
		}

		records
	}
}

fn parse_line(line: &[u8]) -> Payload {
	let line = line.strip_suffix(b"\r").unwrap_or(line);
	match serde_json::from_slice::<Value>(line) {
		Ok(Value::Object(fields)) => Payload::Structured(fields),
		_ => Payload::Raw(String::from_utf8_lossy(line).into_owned()),
	}
}

/// Write a record to the sink, raising a report for alerts.
pub fn emit(record: &LogRecord, sink: &LogSink, reports: &ReportQueue) {
	sink.write(record.to_entry());

	if record.alert().is_some() {
		if let Payload::Structured(fields) = &record.payload {
			let msg = record.message().unwrap_or_default();
			match serde_json::to_string_pretty(fields) {
				Ok(pretty) => reports.report(format!("{}: {}", msg, pretty)),
				Err(_) => reports.report(format!("{}: {:?}", msg, fields)),
			}
		}
	}
}

/// Drain a child pipe until EOF. A trailing unterminated line is dropped.
pub async fn pipe_output<R: AsyncRead + Unpin>(
	mut reader: R,
	mut splitter: LineSplitter,
	sink: LogSink,
	reports: ReportQueue,
) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				for record in splitter.feed(&buf[..n]) {
					emit(&record, &sink, &reports);
				}
			}
			Err(e) => {
				tracing::debug!("{} {} read error: {}", splitter.process, splitter.stream, e);
				break;
			}
		}
	}
	if !splitter.pending().is_empty() {
		tracing::debug!(
			"{} {}: dropping {} bytes of unterminated output",
			splitter.process,
			splitter.stream,
			splitter.pending().len()
		);
	}
}
