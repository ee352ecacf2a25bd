//! The broker: shared handle tables, session registry and the connection
//! manager every session drives.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info};
use ucm_protocol::{ContextId, SessionId};

use crate::config::BrokerConfig;
use crate::context::{Context, ContextRef, ContextState, ContextStatus};
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::multicast::Membership;
use crate::session::{Session, SessionShared};
use crate::table::HandleTable;

pub(crate) struct BrokerShared {
	pub(crate) manager: Arc<dyn ConnectionManager>,
	pub(crate) contexts: HandleTable<Context>,
	pub(crate) memberships: HandleTable<Membership>,
	pub(crate) sessions: DashMap<SessionId, Weak<SessionShared>>,
	next_session: AtomicU64,
	max_backlog: AtomicU32,
}

impl BrokerShared {
	/// Looks up an Active context owned by `session` and takes a reference.
	pub(crate) fn acquire(&self, id: ContextId, session: SessionId) -> Result<ContextRef> {
		self.contexts.with_entry(id.0, |entry| {
			let ctx = entry.as_ref().ok_or_else(|| Error::context_not_found(id))?;
			if ctx.owner_id() != session {
				return Err(Error::context_denied(id));
			}
			if ctx.state() != ContextState::Active {
				return Err(Error::Unavailable(id));
			}
			ctx.add_ref();
			Ok(ContextRef::adopt(Arc::clone(ctx)))
		})
	}

	/// Looks up a live session by id.
	pub(crate) fn session(&self, id: SessionId) -> Option<Arc<SessionShared>> {
		self.sessions.get(&id).and_then(|s| s.upgrade())
	}

	pub(crate) fn max_backlog(&self) -> u32 {
		self.max_backlog.load(Ordering::Acquire)
	}
}

/// Handle to a running broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
	pub(crate) shared: Arc<BrokerShared>,
}

impl Broker {
	/// Creates a broker driving `manager`.
	pub fn new(manager: Arc<dyn ConnectionManager>, config: &BrokerConfig) -> Self {
		info!(
			target = "ucm.session",
			max_backlog = config.max_backlog,
			id_limit = config.id_limit,
			"broker started"
		);
		Self {
			shared: Arc::new(BrokerShared {
				manager,
				contexts: HandleTable::new("context", config.id_limit),
				memberships: HandleTable::new("membership", config.id_limit),
				sessions: DashMap::new(),
				next_session: AtomicU64::new(1),
				max_backlog: AtomicU32::new(config.max_backlog),
			}),
		}
	}

	/// Opens a new client session. Must be called within a tokio runtime.
	pub fn open_session(&self) -> Session {
		let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
		let shared = Arc::new(SessionShared::new(id, Arc::clone(&self.shared)));
		self.shared.sessions.insert(id, Arc::downgrade(&shared));
		debug!(target = "ucm.session", session = %id, "opened");
		Session::from_shared(shared)
	}

	pub fn max_backlog(&self) -> u32 {
		self.shared.max_backlog()
	}

	/// Changes the backlog ceiling for subsequent `listen` calls.
	pub fn set_max_backlog(&self, max: u32) -> Result<()> {
		if max == 0 {
			return Err(Error::InvalidArgument("max_backlog must be positive".into()));
		}
		self.shared.max_backlog.store(max, Ordering::Release);
		Ok(())
	}

	/// Ids of open sessions.
	pub fn sessions(&self) -> Vec<SessionId> {
		let mut ids: Vec<_> = self
			.shared
			.sessions
			.iter()
			.filter(|e| e.value().strong_count() > 0)
			.map(|e| *e.key())
			.collect();
		ids.sort();
		ids
	}

	/// Number of allocated context ids.
	pub fn context_count(&self) -> usize {
		self.shared.contexts.len()
	}

	/// Number of allocated membership ids.
	pub fn membership_count(&self) -> usize {
		self.shared.memberships.len()
	}

	/// Status of a context reachable through the handle table.
	pub fn context_status(&self, id: ContextId) -> Option<ContextStatus> {
		self.shared.contexts.get(id.0).map(|ctx| ctx.status())
	}

	/// Closes every open session.
	pub async fn shutdown(&self) {
		let sessions: Vec<_> = self
			.shared
			.sessions
			.iter()
			.filter_map(|e| e.value().upgrade())
			.collect();
		info!(target = "ucm.session", sessions = sessions.len(), "broker shutting down");
		for session in sessions {
			session.close().await;
		}
	}
}

impl std::fmt::Debug for Broker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Broker")
			.field("sessions", &self.shared.sessions.len())
			.field("contexts", &self.shared.contexts.len())
			.finish()
	}
}
