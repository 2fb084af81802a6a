use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
	Debug,
	Info,
	Warn,
	Error,
}

impl Level {
	pub fn as_str(&self) -> &'static str {
		match self {
			Level::Debug => "debug",
			Level::Info => "info",
			Level::Warn => "warn",
			Level::Error => "error",
		}
	}
}

/// Process-wide structured log stream.
///
/// Every entry becomes one JSON object on one line of the underlying writer.
/// Clones share the writer, and whole lines are written under its lock.
#[derive(Clone)]
pub struct LogSink {
	out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
	pub fn stdout() -> Self {
		Self::to_writer(io::stdout())
	}

	/// A sink that discards everything.
	pub fn quiet() -> Self {
		Self::to_writer(io::sink())
	}

	/// A sink backed by a [`MemoryLog`] the caller can read back.
	pub fn memory() -> (Self, MemoryLog) {
		let log = MemoryLog::default();
		(Self::to_writer(log.clone()), log)
	}

	pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
		Self {
			out: Arc::new(Mutex::new(Box::new(writer))),
		}
	}

	/// Write a fully formed entry.
	pub fn write(&self, entry: Map<String, Value>) {
		let line = match serde_json::to_string(&Value::Object(entry)) {
			Ok(line) => line,
			Err(e) => {
				tracing::error!("failed to format a log entry: {}", e);
				return;
			}
		};

		let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
		let written = writeln!(out, "{}", line);
		if let Err(e) = written.and_then(|()| out.flush()) {
			tracing::warn!("failed to write a log entry: {}", e);
		}
	}

	/// Internal event: `t`, `level` and `msg` on top of `fields`.
	pub fn event(&self, level: Level, msg: &str, fields: Map<String, Value>) {
		let mut entry = fields;
		entry.insert("level".into(), level.as_str().into());
		entry.insert("msg".into(), msg.into());
		entry.insert("t".into(), timestamp().into());
		self.write(entry);
	}

	/// Internal event tied to one supervised process.
	pub fn process_event(&self, level: Level, process: &str, msg: &str) {
		self.process_event_with(level, process, msg, Map::new());
	}

	pub fn process_event_with(
		&self,
		level: Level,
		process: &str,
		msg: &str,
		mut fields: Map<String, Value>,
	) {
		fields.insert("visorProc".into(), process.into());
		self.event(level, msg, fields);
	}
}

/// Growable in-memory log target. Clones share the buffer.
#[derive(Clone, Default)]
pub struct MemoryLog {
	buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLog {
	pub fn contents(&self) -> String {
		let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
		String::from_utf8_lossy(&buf).into_owned()
	}

	/// Entries written so far, parsed back from their lines.
	pub fn entries(&self) -> Vec<Value> {
		self.contents()
			.lines()
			.filter_map(|line| serde_json::from_str(line).ok())
			.collect()
	}
}

impl Write for MemoryLog {
	fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
		buf.extend_from_slice(data);
		Ok(data.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// RFC3339 timestamp for the `t` field.
pub fn timestamp() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
