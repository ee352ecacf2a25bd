use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, trace, warn};
use ucm_runtime::{Broker, Session};

use super::protocol::{DaemonRequest, DaemonResponse};

pub struct Daemon {
	broker: Broker,
	listener: UnixListener,
	socket_path: PathBuf,
}

impl Daemon {
	/// Binds `socket_path`, replacing a stale socket left by an earlier run.
	pub async fn start(socket_path: PathBuf, broker: Broker) -> Result<Self> {
		if socket_path.exists() {
			std::fs::remove_file(&socket_path).with_context(|| {
				format!(
					"Failed to remove existing socket: {}",
					socket_path.display()
				)
			})?;
		}
		if let Some(parent) = socket_path.parent() {
			if !parent.exists() {
				std::fs::create_dir_all(parent).with_context(|| {
					format!("Failed to create socket directory: {}", parent.display())
				})?;
			}
		}
		let listener = UnixListener::bind(&socket_path).with_context(|| {
			format!("Failed to bind daemon socket: {}", socket_path.display())
		})?;
		info!(
			target = "ucm.daemon",
			socket = %socket_path.display(),
			max_backlog = broker.max_backlog(),
			"daemon listening"
		);
		Ok(Self {
			broker,
			listener,
			socket_path,
		})
	}

	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	/// Serves until SIGINT or SIGTERM.
	pub async fn run(self) -> Result<()> {
		use tokio::signal::unix::{SignalKind, signal};

		let mut sigterm =
			signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
		let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

		self.run_until(async move {
			tokio::select! {
				_ = sigterm.recv() => info!(target = "ucm.daemon", "received SIGTERM, shutting down"),
				_ = sigint.recv() => info!(target = "ucm.daemon", "received SIGINT, shutting down"),
			}
		})
		.await
	}

	/// Serves until `shutdown` resolves, then closes every session and
	/// removes the socket.
	pub async fn run_until<F>(self, shutdown: F) -> Result<()>
	where
		F: Future<Output = ()>,
	{
		let Self {
			broker,
			listener,
			socket_path,
		} = self;
		tokio::pin!(shutdown);

		let result = loop {
			tokio::select! {
				_ = &mut shutdown => break Ok(()),
				accept = listener.accept() => {
					let stream = match accept.context("Daemon accept failed") {
						Ok((stream, _)) => stream,
						Err(err) => break Err(err),
					};
					let session = broker.open_session();
					debug!(target = "ucm.daemon", session = %session.id(), "client connected");
					tokio::spawn(async move {
						if let Err(err) = handle_client(stream, session).await {
							warn!(target = "ucm.daemon", error = %err, "daemon connection error");
						}
					});
				}
			}
		};

		broker.shutdown().await;
		if let Err(err) = std::fs::remove_file(&socket_path) {
			debug!(target = "ucm.daemon", error = %err, "socket already removed");
		}
		info!(target = "ucm.daemon", "daemon stopped");
		result
	}
}

async fn handle_client(stream: UnixStream, session: Session) -> Result<()> {
	let outcome = serve_session(stream, &session).await;
	session.close().await;
	debug!(target = "ucm.daemon", session = %session.id(), "client disconnected");
	outcome
}

async fn serve_session(stream: UnixStream, session: &Session) -> Result<()> {
	let (read_half, mut write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half);
	let mut line = String::new();

	loop {
		line.clear();
		let bytes = reader
			.read_line(&mut line)
			.await
			.context("Failed reading daemon request")?;
		if bytes == 0 {
			return Ok(());
		}

		let response = match serde_json::from_str::<DaemonRequest>(line.trim_end()) {
			Ok(request) => handle_request(session, request).await,
			Err(err) => DaemonResponse::Error {
				code: "EINVAL".to_string(),
				message: err.to_string(),
			},
		};
		write_response(&mut write_half, &response).await?;
	}
}

async fn write_response<W>(writer: &mut W, response: &DaemonResponse) -> Result<()>
where
	W: tokio::io::AsyncWrite + Unpin,
{
	let payload = serde_json::to_string(response).context("Failed to serialize response")?;
	writer
		.write_all(format!("{}\n", payload).as_bytes())
		.await
		.context("Failed writing daemon response")?;
	writer
		.flush()
		.await
		.context("Failed flushing daemon response")?;
	Ok(())
}

async fn handle_request(session: &Session, request: DaemonRequest) -> DaemonResponse {
	match request {
		DaemonRequest::SessionId => DaemonResponse::Session { id: session.id() },
		DaemonRequest::Command(command) => {
			trace!(target = "ucm.daemon", session = %session.id(), opcode = command.opcode, "command");
			match session.execute(command).await {
				Ok(response) => DaemonResponse::Ok { response },
				Err(err) => DaemonResponse::error(&err),
			}
		}
	}
}
