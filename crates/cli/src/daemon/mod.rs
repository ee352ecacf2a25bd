mod protocol;
mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
pub use protocol::{DaemonRequest, DaemonResponse};
pub use server::Daemon;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use ucm_protocol::{Response, SessionId};
use ucm_runtime::Command;

/// Returns the daemon socket path for the current user.
///
/// Uses `$XDG_RUNTIME_DIR/ucmd.sock` if available (already user-permissioned),
/// otherwise falls back to `/tmp/ucmd-{uid}.sock`.
pub fn daemon_socket_path() -> PathBuf {
	if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
		return PathBuf::from(xdg_runtime).join("ucmd.sock");
	}

	let uid = unsafe { libc::getuid() };
	PathBuf::from(format!("/tmp/ucmd-{uid}.sock"))
}

/// A connection to a running daemon. The connection is one broker session;
/// dropping it closes the session.
pub struct DaemonClient {
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
	line: String,
}

impl DaemonClient {
	pub async fn connect(path: &Path) -> Result<Self> {
		let stream = UnixStream::connect(path)
			.await
			.with_context(|| format!("Failed to connect to daemon: {}", path.display()))?;
		let (read_half, writer) = stream.into_split();
		Ok(Self {
			reader: BufReader::new(read_half),
			writer,
			line: String::new(),
		})
	}

	pub async fn request(&mut self, request: &DaemonRequest) -> Result<DaemonResponse> {
		let payload = serde_json::to_string(request).context("Failed to serialize daemon request")?;
		self.writer
			.write_all(format!("{}\n", payload).as_bytes())
			.await
			.context("Failed writing daemon request")?;
		self.writer
			.flush()
			.await
			.context("Failed flushing daemon request")?;

		self.line.clear();
		let bytes = self
			.reader
			.read_line(&mut self.line)
			.await
			.context("Failed reading daemon response")?;
		if bytes == 0 {
			return Err(anyhow!("daemon closed the connection"));
		}
		serde_json::from_str(&self.line).context("Failed parsing daemon response")
	}

	/// Runs one broker command, turning daemon error responses into errors.
	pub async fn execute(&mut self, command: Command) -> Result<Response> {
		match self.request(&DaemonRequest::Command(command)).await? {
			DaemonResponse::Ok { response } => Ok(response),
			DaemonResponse::Error { code, message } => Err(anyhow!("daemon error {code}: {message}")),
			other => Err(anyhow!("unexpected daemon response: {other:?}")),
		}
	}

	pub async fn session_id(&mut self) -> Result<SessionId> {
		match self.request(&DaemonRequest::SessionId).await? {
			DaemonResponse::Session { id } => Ok(id),
			other => Err(anyhow!("unexpected daemon response: {other:?}")),
		}
	}
}
