//! Line-oriented control protocol.
//!
//! ```text
//! reboot <name>   -> ok | no task named <name> | task <name> is not running | unknown syntax
//! term            -> ok, then every worker is terminated
//! anything else   -> unknown command
//! ```

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::directory::Directory;

pub const DEFAULT_ADDR: &str = "127.0.0.1:1829";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Reboot(String),
	Term,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
	#[error("unknown syntax")]
	Syntax,
	#[error("unknown command")]
	Unknown,
}

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
	let line = line.trim_matches([' ', '\r', '\n']);
	let parts: Vec<&str> = line.split(' ').collect();
	match parts[0] {
		"reboot" if parts.len() == 2 => Ok(Command::Reboot(parts[1].to_string())),
		"term" if parts.len() == 1 => Ok(Command::Term),
		"reboot" | "term" => Err(ParseError::Syntax),
		_ => Err(ParseError::Unknown),
	}
}

enum Flow {
	Continue,
	Shutdown,
}

/// Serve control connections one at a time until a `term` has been carried out.
pub async fn run_control_server(listener: TcpListener, directory: &Directory) {
	if let Ok(addr) = listener.local_addr() {
		tracing::info!("control listening on {}", addr);
	}

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};
		tracing::debug!("control connection from {}", peer);

		if let Flow::Shutdown = handle_connection(stream, directory).await {
			return;
		}
	}
}

async fn handle_connection(stream: TcpStream, directory: &Directory) -> Flow {
	let (reader, mut writer) = stream.into_split();
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();

	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			// unterminated trailing line at EOF
			Ok(_) if buf.last() != Some(&b'\n') => break,
			Ok(_) => {}
			Err(e) => {
				tracing::warn!("read error: {}", e);
				break;
			}
		}
		let line = String::from_utf8_lossy(&buf);

		let reply = match parse_command(&line) {
			Ok(Command::Reboot(name)) => {
				tracing::info!("reboot {} requested", name);
				match directory.reboot(&name).await {
					Ok(()) => "ok".to_string(),
					Err(e) => e.to_string(),
				}
			}
			Ok(Command::Term) => {
				tracing::info!("termination requested");
				let _ = write_reply(&mut writer, "ok").await;
				directory.terminate_all().await;
				return Flow::Shutdown;
			}
			Err(e) => e.to_string(),
		};

		if write_reply(&mut writer, &reply).await.is_err() {
			break;
		}
	}

	Flow::Continue
}

async fn write_reply(
	writer: &mut tokio::net::tcp::OwnedWriteHalf,
	reply: &str,
) -> Result<(), std::io::Error> {
	let mut data = reply.as_bytes().to_vec();
	data.push(b'\n');
	writer.write_all(&data).await?;
	writer.flush().await
}
