//! Ordered per-session close worker.
//!
//! Deferred close jobs run one at a time in submission order. `flush`
//! returns once every job submitted before it has finished.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use ucm_protocol::SessionId;

use crate::context::Context;
use crate::manager::Endpoint;

pub(crate) enum CloseJob {
	/// Drain a context marked Closing by device removal, then destroy its
	/// endpoint. The context itself stays until explicitly destroyed.
	Context(Arc<Context>),
	/// Destroy an inbound endpoint nobody claimed.
	Endpoint(Box<dyn Endpoint>),
	Flush(oneshot::Sender<()>),
}

pub(crate) struct CloseWorker {
	tx: mpsc::UnboundedSender<CloseJob>,
}

impl CloseWorker {
	/// Spawns the worker task. Requires a tokio runtime.
	pub(crate) fn spawn(session: SessionId) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<CloseJob>();
		tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				match job {
					CloseJob::Context(ctx) => {
						debug!(target = "ucm.teardown", %session, id = %ctx.id, "closing removed context");
						ctx.drain_and_destroy().await;
					}
					CloseJob::Endpoint(endpoint) => {
						debug!(target = "ucm.teardown", %session, "destroying unclaimed endpoint");
						endpoint.destroy();
					}
					CloseJob::Flush(done) => {
						let _ = done.send(());
					}
				}
			}
			trace!(target = "ucm.teardown", %session, "close worker stopped");
		});
		Self { tx }
	}

	pub(crate) fn submit(&self, job: CloseJob) {
		if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
			// Worker gone: the runtime is shutting down. Release what can be
			// released synchronously.
			if let CloseJob::Endpoint(endpoint) = job {
				endpoint.destroy();
			}
		}
	}

	/// Waits for every previously submitted job to finish.
	pub(crate) async fn flush(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		if self.tx.send(CloseJob::Flush(done_tx)).is_ok() {
			let _ = done_rx.await;
		}
	}
}
