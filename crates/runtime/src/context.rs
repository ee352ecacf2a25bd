//! Connection contexts.
//!
//! A [`Context`] is the reference-counted lifecycle unit wrapping one
//! endpoint. While it is reachable through the handle table the table holds
//! one implicit reference; every successful acquire adds one more, released
//! by dropping the returned [`ContextRef`]. Teardown gives up the table's
//! unit and waits for the count to drain to zero before the endpoint is
//! destroyed.
//!
//! Lock order: session state, then the endpoint lock, then the handle
//! table. `owner`, `uid` and `memberships` are leaf locks.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};
use ucm_protocol::{ContextId, SessionId};

use crate::error::{Error, Result};
use crate::manager::{Endpoint, EndpointKey, Route};
use crate::multicast::Membership;
use crate::session::SessionShared;

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
	Active,
	/// Unreachable for new acquisitions; holders may still be releasing.
	Closing,
	/// Teardown is destroying the endpoint.
	Destroying,
}

impl ContextState {
	fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Active,
			1 => Self::Closing,
			_ => Self::Destroying,
		}
	}
}

/// Point-in-time view of a context, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextStatus {
	pub id: ContextId,
	pub session: SessionId,
	pub state: ContextState,
	pub uid: Option<u64>,
	pub backlog: i32,
	pub events_reported: u32,
	/// Outstanding references, the table's implicit one included.
	pub refs: usize,
	pub memberships: usize,
}

struct Owner {
	id: SessionId,
	session: Weak<SessionShared>,
}

pub(crate) struct Context {
	pub(crate) id: ContextId,
	owner: Mutex<Owner>,
	endpoint: Mutex<Option<Box<dyn Endpoint>>>,
	route: Arc<Route>,
	refs: AtomicUsize,
	drained: Notify,
	state: AtomicU8,
	/// A removal-driven close job is queued or done. Set at most once.
	pub(crate) close_scheduled: AtomicBool,
	/// Explicit destroy or session close has started. Written under the
	/// owning session's lock.
	pub(crate) destroy_requested: AtomicBool,
	/// Removed from its session; late deliveries are dropped.
	freed: AtomicBool,
	released: Notify,
	uid: Mutex<Option<u64>>,
	backlog: AtomicI32,
	events_reported: AtomicU32,
	pub(crate) memberships: Mutex<Vec<Arc<Membership>>>,
}

impl Context {
	pub(crate) fn new(
		id: ContextId,
		owner: &Arc<SessionShared>,
		endpoint: Box<dyn Endpoint>,
		route: Arc<Route>,
		uid: Option<u64>,
	) -> Self {
		Self {
			id,
			owner: Mutex::new(Owner {
				id: owner.id,
				session: Arc::downgrade(owner),
			}),
			endpoint: Mutex::new(Some(endpoint)),
			route,
			refs: AtomicUsize::new(1),
			drained: Notify::new(),
			state: AtomicU8::new(ContextState::Active as u8),
			close_scheduled: AtomicBool::new(false),
			destroy_requested: AtomicBool::new(false),
			freed: AtomicBool::new(false),
			released: Notify::new(),
			uid: Mutex::new(uid),
			backlog: AtomicI32::new(0),
			events_reported: AtomicU32::new(0),
			memberships: Mutex::new(Vec::new()),
		}
	}

	pub(crate) fn owner_id(&self) -> SessionId {
		self.owner.lock().id
	}

	pub(crate) fn owner_session(&self) -> Option<Arc<SessionShared>> {
		self.owner.lock().session.upgrade()
	}

	/// Caller holds both session locks and the context table.
	pub(crate) fn set_owner(&self, session: &Arc<SessionShared>) {
		*self.owner.lock() = Owner {
			id: session.id,
			session: Arc::downgrade(session),
		};
	}

	pub(crate) fn endpoint_key(&self) -> EndpointKey {
		self.route.key
	}

	pub(crate) fn route(&self) -> &Arc<Route> {
		&self.route
	}

	pub fn state(&self) -> ContextState {
		ContextState::from_raw(self.state.load(Ordering::Acquire))
	}

	/// Moves Active to Closing. Returns false if already past Active.
	pub(crate) fn mark_closing(&self) -> bool {
		self.advance(ContextState::Closing)
	}

	fn advance(&self, to: ContextState) -> bool {
		let prev = self.state.fetch_max(to as u8, Ordering::AcqRel);
		prev < to as u8
	}

	/// Adds a reference. Only called under the table lock after checking
	/// the context is Active, so the count cannot be rising from zero.
	pub(crate) fn add_ref(&self) {
		self.refs.fetch_add(1, Ordering::AcqRel);
	}

	/// Adds a reference unless the count already reached zero.
	pub(crate) fn add_ref_if_live(&self) -> bool {
		self.refs
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then(|| n + 1))
			.is_ok()
	}

	pub(crate) fn release(&self) {
		match self
			.refs
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
		{
			Ok(1) => self.drained.notify_waiters(),
			Ok(_) => {}
			Err(_) => warn!(target = "ucm.teardown", id = %self.id, "release without a reference"),
		}
	}

	pub(crate) fn refs(&self) -> usize {
		self.refs.load(Ordering::Acquire)
	}

	/// Waits until every reference has been released.
	pub(crate) async fn drained(&self) {
		loop {
			let notified = self.drained.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.refs() == 0 {
				return;
			}
			notified.await;
		}
	}

	/// Gives up the table's reference, waits for holders to drain, then
	/// destroys the endpoint.
	pub(crate) async fn drain_and_destroy(&self) {
		self.release();
		self.drained().await;
		self.advance(ContextState::Destroying);
		let endpoint = self.endpoint.lock().take();
		self.route.detach();
		if let Some(endpoint) = endpoint {
			endpoint.destroy();
			debug!(target = "ucm.teardown", id = %self.id, "endpoint destroyed");
		}
	}

	/// Takes the endpoint out of a context that never became reachable.
	pub(crate) fn take_endpoint(&self) -> Option<Box<dyn Endpoint>> {
		self.endpoint.lock().take()
	}

	/// Runs `f` against the endpoint under the per-context lock.
	pub(crate) fn with_endpoint<R>(&self, f: impl FnOnce(&mut dyn Endpoint) -> Result<R>) -> Result<R> {
		let mut guard = self.endpoint.lock();
		match guard.as_mut() {
			Some(endpoint) => f(endpoint.as_mut()),
			None => Err(Error::Unavailable(self.id)),
		}
	}

	/// Like [`Context::with_endpoint`], failing if no device is bound yet.
	pub(crate) fn with_device<R>(&self, f: impl FnOnce(&mut dyn Endpoint) -> Result<R>) -> Result<R> {
		self.with_endpoint(|endpoint| {
			if !endpoint.has_device() {
				return Err(Error::InvalidArgument(format!("{} has no bound device", self.id)));
			}
			f(endpoint)
		})
	}

	pub(crate) fn uid(&self) -> Option<u64> {
		*self.uid.lock()
	}

	pub(crate) fn set_uid(&self, uid: u64) {
		*self.uid.lock() = Some(uid);
	}

	pub(crate) fn set_backlog(&self, backlog: i32) {
		self.backlog.store(backlog, Ordering::Release);
	}

	pub(crate) fn backlog(&self) -> i32 {
		self.backlog.load(Ordering::Acquire)
	}

	/// Consumes one backlog slot if any remain.
	pub(crate) fn take_backlog_slot(&self) -> bool {
		self.backlog
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| (b > 0).then(|| b - 1))
			.is_ok()
	}

	pub(crate) fn return_backlog_slot(&self) {
		self.backlog.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn events_reported(&self) -> u32 {
		self.events_reported.load(Ordering::Acquire)
	}

	pub(crate) fn note_reported(&self) {
		self.events_reported.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn is_freed(&self) -> bool {
		self.freed.load(Ordering::Acquire)
	}

	pub(crate) fn mark_freed(&self) {
		self.freed.store(true, Ordering::Release);
		self.released.notify_waiters();
	}

	/// Waits until whichever path owns the teardown has freed the context.
	pub(crate) async fn freed(&self) {
		loop {
			let notified = self.released.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.is_freed() {
				return;
			}
			notified.await;
		}
	}

	pub(crate) fn status(&self) -> ContextStatus {
		ContextStatus {
			id: self.id,
			session: self.owner_id(),
			state: self.state(),
			uid: self.uid(),
			backlog: self.backlog(),
			events_reported: self.events_reported(),
			refs: self.refs(),
			memberships: self.memberships.lock().len(),
		}
	}
}

/// An acquired context. Dropping it releases the reference.
pub(crate) struct ContextRef {
	ctx: Arc<Context>,
}

impl ContextRef {
	/// Wraps a context whose reference count the caller already raised.
	pub(crate) fn adopt(ctx: Arc<Context>) -> Self {
		Self { ctx }
	}
}

impl std::fmt::Debug for ContextRef {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ContextRef").field("id", &self.ctx.id).finish_non_exhaustive()
	}
}

impl Deref for ContextRef {
	type Target = Arc<Context>;

	fn deref(&self) -> &Self::Target {
		&self.ctx
	}
}

impl Drop for ContextRef {
	fn drop(&mut self) {
		self.ctx.release();
	}
}
