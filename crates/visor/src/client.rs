use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;

/// Errors from control client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("supervisor not running at {0}")]
	NotRunning(String),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("connection closed before a reply")]
	NoReply,
}

/// Synchronous client for the control port.
pub struct ControlClient {
	stream: TcpStream,
}

impl ControlClient {
	pub fn connect(addr: &str) -> Result<Self, ClientError> {
		let stream = TcpStream::connect(addr).map_err(|_| ClientError::NotRunning(addr.to_string()))?;
		Ok(Self { stream })
	}

	/// Send one command line and return the reply without its newline.
	pub fn send(&mut self, command: &str) -> Result<String, ClientError> {
		let mut data = command.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		if reader.read_line(&mut line)? == 0 {
			return Err(ClientError::NoReply);
		}
		Ok(line.trim_end_matches(['\r', '\n']).to_string())
	}
}
