use serde::Serialize;
use std::time::Duration;
use visor::{format_digest, ReportQueue};

pub const MAILJET_SEND_URL: &str = "https://api.mailjet.com/v3.1/send";
pub const DIGEST_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on one delivery, connect included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SENDER_NAME: &str = "visor";
const SUBJECT: &str = "Visor report";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
	#[error("Missing MAILJET_KEY or MAILJET_SECRET env variables")]
	MissingCredentials,
	#[error("mail request failed: {0}")]
	Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct Credentials {
	pub key: String,
	pub secret: String,
}

impl Credentials {
	pub fn from_env() -> Result<Self, NotifyError> {
		let key = std::env::var("MAILJET_KEY").unwrap_or_default();
		let secret = std::env::var("MAILJET_SECRET").unwrap_or_default();
		if key.is_empty() || secret.is_empty() {
			return Err(NotifyError::MissingCredentials);
		}
		Ok(Self { key, secret })
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendRequest {
	messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Message {
	from: Recipient,
	to: Vec<Recipient>,
	subject: String,
	text_part: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Recipient {
	email: String,
	name: String,
}

/// Sends report digests to the admin address through Mailjet.
#[derive(Clone)]
pub struct Mailer {
	client: reqwest::Client,
	credentials: Credentials,
	email: String,
	endpoint: String,
}

impl Mailer {
	pub fn new(credentials: Credentials, email: impl Into<String>) -> Result<Self, NotifyError> {
		Self::with_timeout(credentials, email, REQUEST_TIMEOUT)
	}

	pub fn with_timeout(
		credentials: Credentials,
		email: impl Into<String>,
		timeout: Duration,
	) -> Result<Self, NotifyError> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self {
			client,
			credentials,
			email: email.into(),
			endpoint: MAILJET_SEND_URL.to_string(),
		})
	}

	fn request(&self, body: &str) -> SendRequest {
		SendRequest {
			messages: vec![Message {
				from: Recipient {
					email: self.email.clone(),
					name: SENDER_NAME.to_string(),
				},
				to: vec![Recipient {
					email: self.email.clone(),
					name: String::new(),
				}],
				subject: SUBJECT.to_string(),
				text_part: body.to_string(),
			}],
		}
	}

	pub async fn send(&self, body: &str) -> Result<(), NotifyError> {
		self.client
			.post(&self.endpoint)
			.basic_auth(&self.credentials.key, Some(&self.credentials.secret))
			.json(&self.request(body))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

/// Drain the queue and mail whatever was in it. Failed digests are dropped.
pub async fn flush(reports: &ReportQueue, mailer: &Mailer) {
	let lines = reports.drain();
	let Some(body) = format_digest(&lines) else {
		return;
	};
	match mailer.send(&body).await {
		Ok(()) => tracing::debug!("sent digest with {} reports", lines.len()),
		Err(e) => tracing::warn!("failed to send email: {}", e),
	}
}

/// Flush a digest every `interval`, forever.
pub async fn run_notifier(reports: ReportQueue, mailer: Mailer, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	// the first tick completes immediately
	ticker.tick().await;
	loop {
		ticker.tick().await;
		flush(&reports, &mailer).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use visor::LogSink;

	fn credentials() -> Credentials {
		Credentials {
			key: "k".into(),
			secret: "s".into(),
		}
	}

	fn mailer() -> Mailer {
		Mailer::new(credentials(), "ops@example.com").unwrap()
	}

	#[test]
	fn request_matches_mailjet_layout() {
		let value = serde_json::to_value(mailer().request("#1: api quit\n\n")).unwrap();
		let message = &value["Messages"][0];
		assert_eq!(message["From"]["Email"], "ops@example.com");
		assert_eq!(message["From"]["Name"], "visor");
		assert_eq!(message["To"][0]["Email"], "ops@example.com");
		assert_eq!(message["Subject"], "Visor report");
		assert_eq!(message["TextPart"], "#1: api quit\n\n");
	}

	/// One-shot HTTP endpoint that records the raw request and answers 200.
	async fn capture_one_request() -> (String, tokio::task::JoinHandle<String>) {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("http://{}/v3.1/send", listener.local_addr().unwrap());
		let handle = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut raw = Vec::new();
			let mut buf = [0u8; 4096];
			loop {
				let n = stream.read(&mut buf).await.unwrap();
				raw.extend_from_slice(&buf[..n]);
				let text = String::from_utf8_lossy(&raw).to_string();
				if let Some(split) = text.find("\r\n\r\n") {
					let length = text[..split]
						.lines()
						.find_map(|l| {
							let l = l.to_ascii_lowercase();
							l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
						})
						.unwrap_or(0);
					if raw.len() >= split + 4 + length {
						break;
					}
				}
				if n == 0 {
					break;
				}
			}
			stream
				.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
				.await
				.unwrap();
			String::from_utf8_lossy(&raw).to_string()
		});
		(url, handle)
	}

	#[tokio::test]
	async fn flush_posts_numbered_digest_with_basic_auth() {
		let (url, server) = capture_one_request().await;
		let reports = ReportQueue::new(LogSink::quiet());
		reports.report("api quit after 1s: exit status: 1");
		reports.report("api: taking a timeout, 1h0m0s");
		let mut mailer = mailer();
		mailer.endpoint = url;

		flush(&reports, &mailer).await;
		assert!(reports.is_empty());

		let request = server.await.unwrap();
		assert!(request.starts_with("POST /v3.1/send "));
		// base64("k:s")
		assert!(request.to_ascii_lowercase().contains("authorization: basic azpz"));
		assert!(request.contains(
			r##""TextPart":"#1: api quit after 1s: exit status: 1\n\n#2: api: taking a timeout, 1h0m0s\n\n""##
		));
	}

	#[tokio::test]
	async fn failed_delivery_still_clears_the_queue() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let reports = ReportQueue::new(LogSink::quiet());
		reports.report("api quit after 1s: exit status: 1");
		let mut mailer = mailer();
		mailer.endpoint = format!("http://{}/send", addr);
		flush(&reports, &mailer).await;
		assert!(reports.is_empty());
	}

	#[tokio::test]
	async fn silent_endpoint_cannot_stall_a_flush() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			tokio::time::sleep(Duration::from_secs(60)).await;
			drop(stream);
		});

		let reports = ReportQueue::new(LogSink::quiet());
		reports.report("api quit after 1s: exit status: 1");
		let mut mailer =
			Mailer::with_timeout(credentials(), "ops@example.com", Duration::from_millis(300)).unwrap();
		mailer.endpoint = format!("http://{}/send", addr);

		let flushed = tokio::time::timeout(Duration::from_secs(5), flush(&reports, &mailer)).await;
		assert!(flushed.is_ok(), "flush did not give up on a silent endpoint");
		assert!(reports.is_empty());
		server.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn notifier_sends_once_per_interval() {
		let (url, server) = capture_one_request().await;
		let reports = ReportQueue::new(LogSink::quiet());
		reports.report("db quit after 5s: signal: 9");
		let mut mailer = mailer();
		mailer.endpoint = url;
		let notifier = tokio::spawn(run_notifier(reports.clone(), mailer, DIGEST_INTERVAL));

		// nothing goes out before the first full interval
		tokio::time::sleep(DIGEST_INTERVAL - Duration::from_secs(1)).await;
		assert_eq!(reports.len(), 1);

		// real time from here on so the HTTP exchange is not raced by the clock
		tokio::time::resume();
		let request = tokio::time::timeout(Duration::from_secs(10), server)
			.await
			.unwrap()
			.unwrap();
		assert!(request.contains("#1: db quit after 5s: signal: 9"));
		assert!(reports.is_empty());
		notifier.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn empty_queue_sends_nothing() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let reports = ReportQueue::new(LogSink::quiet());
		let mut mailer = mailer();
		mailer.endpoint = format!("http://{}/send", listener.local_addr().unwrap());
		let notifier = tokio::spawn(run_notifier(reports, mailer, DIGEST_INTERVAL));

		tokio::time::sleep(DIGEST_INTERVAL * 3 + Duration::from_secs(1)).await;
		let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
		assert!(accepted.is_err(), "an empty digest was posted");
		notifier.abort();
	}
}
