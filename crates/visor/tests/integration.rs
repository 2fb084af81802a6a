use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use visor::{
	run_control_server, ControlClient, Directory, LogSink, ProcessSpec, ReportQueue, WorkerSettings,
	WorkerState, WorkerStatus,
};

struct Visor {
	directory: Arc<Directory>,
	reports: ReportQueue,
	addr: String,
	server: JoinHandle<()>,
}

async fn start_visor(specs: &[ProcessSpec]) -> Visor {
	let sink = LogSink::quiet();
	let reports = ReportQueue::new(sink.clone());
	let directory = Arc::new(Directory::start(specs, &WorkerSettings::default(), &sink, &reports));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap().to_string();
	let dir = Arc::clone(&directory);
	let server = tokio::spawn(async move {
		run_control_server(listener, &dir).await;
	});

	for name in directory.names() {
		let mut rx = directory.watch(name).unwrap();
		rx.wait_for(|s| s.state == WorkerState::Running || s.is_terminated())
			.await
			.unwrap();
	}

	Visor {
		directory,
		reports,
		addr,
		server,
	}
}

struct Conn {
	lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
	writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Conn {
	async fn open(addr: &str) -> Self {
		let stream = TcpStream::connect(addr).await.unwrap();
		let (reader, writer) = stream.into_split();
		Self {
			lines: BufReader::new(reader).lines(),
			writer,
		}
	}

	async fn ask(&mut self, line: &str) -> String {
		self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
		self.lines.next_line().await.unwrap().unwrap()
	}
}

fn pid_alive(pid: u32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

// --- Control protocol ---

#[tokio::test]
async fn unknown_task_leaves_workers_alone() {
	let v = start_visor(&[ProcessSpec::new("api", "sleep 60", "")]).await;
	let before = v.directory.status("api").unwrap();

	let mut conn = Conn::open(&v.addr).await;
	assert_eq!(conn.ask("reboot nope").await, "no task named nope");

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(v.directory.status("api").unwrap(), before);

	assert_eq!(conn.ask("term").await, "ok");
	v.server.await.unwrap();
}

#[tokio::test]
async fn bad_lines_get_errors_and_connection_stays_open() {
	let v = start_visor(&[ProcessSpec::new("api", "sleep 60", "")]).await;

	let mut conn = Conn::open(&v.addr).await;
	assert_eq!(conn.ask("status").await, "unknown command");
	assert_eq!(conn.ask("reboot").await, "unknown syntax");
	assert_eq!(conn.ask("reboot a b").await, "unknown syntax");
	assert_eq!(conn.ask("term please").await, "unknown syntax");
	assert_eq!(conn.ask("").await, "unknown command");
	assert_eq!(conn.ask("  term\r").await, "ok");
	v.server.await.unwrap();
}

#[tokio::test]
async fn reboot_restarts_the_named_process() {
	let v = start_visor(&[
		ProcessSpec::new("api", "sleep 60", ""),
		ProcessSpec::new("db", "sleep 60", ""),
	])
	.await;
	let old = v.directory.status("api").unwrap();
	let db = v.directory.status("db").unwrap();

	let mut conn = Conn::open(&v.addr).await;
	assert_eq!(conn.ask("reboot api").await, "ok");

	let mut rx = v.directory.watch("api").unwrap();
	let new = *rx
		.wait_for(|s| s.state == WorkerState::Running && s.spawns == 2)
		.await
		.unwrap();
	assert_ne!(new.pid, old.pid);
	assert!(!pid_alive(old.pid.unwrap()));
	assert_eq!(new.crashes, 0);
	assert_eq!(v.directory.status("db").unwrap(), db);
	assert!(v.reports.is_empty());

	assert_eq!(conn.ask("term").await, "ok");
	v.server.await.unwrap();
}

#[tokio::test]
async fn term_stops_every_child_before_returning() {
	let v = start_visor(&[
		ProcessSpec::new("a", "sleep 60", ""),
		ProcessSpec::new("b", "sleep 60", ""),
		ProcessSpec::new("c", "sleep 60", ""),
	])
	.await;
	let pids: Vec<u32> = ["a", "b", "c"]
		.iter()
		.map(|n| v.directory.status(n).unwrap().pid.unwrap())
		.collect();

	let mut conn = Conn::open(&v.addr).await;
	assert_eq!(conn.ask("term").await, "ok");
	v.server.await.unwrap();

	for name in ["a", "b", "c"] {
		assert!(v.directory.status(name).unwrap().is_terminated());
	}
	for pid in pids {
		assert!(!pid_alive(pid));
	}
	// the server closes the connection once shutdown is done
	assert!(conn.lines.next_line().await.unwrap().is_none());
}

#[tokio::test]
async fn connections_are_served_one_after_another() {
	let v = start_visor(&[ProcessSpec::new("api", "sleep 60", "")]).await;

	let mut first = Conn::open(&v.addr).await;
	assert_eq!(first.ask("reboot nope").await, "no task named nope");
	drop(first);

	let mut second = Conn::open(&v.addr).await;
	assert_eq!(second.ask("reboot api").await, "ok");
	assert_eq!(second.ask("term").await, "ok");
	v.server.await.unwrap();
}

#[tokio::test]
async fn blocking_client_talks_to_the_server() {
	let v = start_visor(&[ProcessSpec::new("api", "sleep 60", "")]).await;

	let addr = v.addr.clone();
	let replies = tokio::task::spawn_blocking(move || {
		let mut client = ControlClient::connect(&addr).unwrap();
		let first = client.send("reboot ghost").unwrap();
		let second = client.send("term").unwrap();
		(first, second)
	})
	.await
	.unwrap();

	assert_eq!(replies, ("no task named ghost".to_string(), "ok".to_string()));
	v.server.await.unwrap();
}

// --- Crash-loop backoff ---

#[tokio::test(start_paused = true)]
async fn crash_loop_backs_off_for_an_hour() {
	let (sink, log) = LogSink::memory();
	let reports = ReportQueue::new(sink.clone());
	let specs = [ProcessSpec::new("flaky", "false", "")];
	let directory = Directory::start(&specs, &WorkerSettings::default(), &sink, &reports);
	let mut status = directory.watch("flaky").unwrap();

	let cooling = *status.wait_for(|s| s.state == WorkerState::Cooldown).await.unwrap();
	let cooldown_started = tokio::time::Instant::now();
	assert_eq!(cooling.spawns, 3);

	status.wait_for(|s| s.spawns == 4).await.unwrap();
	let paused_for = cooldown_started.elapsed();
	assert!(paused_for >= Duration::from_secs(3600), "{:?}", paused_for);

	let report_lines = reports.snapshot();
	assert!(report_lines.len() >= 4, "{:?}", report_lines);
	for line in &report_lines[..3] {
		assert!(line.starts_with("flaky quit after "), "{}", line);
		assert!(line.ends_with(": exit status: 1"), "{}", line);
	}
	assert_eq!(report_lines[3], "flaky: taking a timeout, 1h0m0s");

	let started = log
		.entries()
		.iter()
		.filter(|e: &&Value| e["msg"] == "started" && e["visorProc"] == "flaky")
		.count();
	assert!(started >= 4, "{}", started);

	directory.terminate_all().await;
	assert!(directory.status("flaky").unwrap().is_terminated());
}

#[tokio::test]
async fn spawn_failure_does_not_block_shutdown() {
	let v = start_visor(&[
		ProcessSpec::new("broken", "/no/such/program", ""),
		ProcessSpec::new("ok", "sleep 60", ""),
	])
	.await;
	let broken: WorkerStatus = v.directory.status("broken").unwrap();
	assert!(broken.is_terminated());
	assert_eq!(broken.spawns, 0);

	let mut conn = Conn::open(&v.addr).await;
	assert_eq!(conn.ask("reboot broken").await, "task broken is not running");
	assert_eq!(conn.ask("term").await, "ok");
	v.server.await.unwrap();
	assert!(v.directory.status("ok").unwrap().is_terminated());
}
