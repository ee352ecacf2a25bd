//! Connection-manager collaborator contract.
//!
//! The broker never negotiates connections itself. A [`ConnectionManager`]
//! hands out [`Endpoint`]s, which the broker drives under each context's
//! lock, and reports asynchronous completions through the [`EventSink`]
//! it was given when the endpoint was created.
//!
//! Endpoint methods only initiate work. Completion always arrives later
//! through a sink, from the manager's own execution context; a manager must
//! never call a sink from inside an endpoint method.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use ucm_protocol::{
	AddrInfo, ConnParam, Ece, EndpointParams, EventKind, EventParam, MembershipId, PathRecord,
	QpAttributes, RouteInfo,
};

use crate::broker::BrokerShared;
use crate::context::Context;
use crate::error::Result;

/// Creates endpoints on behalf of the broker.
pub trait ConnectionManager: Send + Sync {
	/// Creates an endpoint whose events are reported through `sink`.
	fn create_endpoint(&self, params: EndpointParams, sink: EventSink) -> Result<Box<dyn Endpoint>>;
}

/// Options settable at the id level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdOption {
	Tos(u8),
	ReuseAddr(bool),
	AfOnly(bool),
	AckTimeout(u8),
}

/// One externally managed connection endpoint.
///
/// Released exactly once through [`Endpoint::destroy`], which consumes it.
pub trait Endpoint: Send + Sync {
	fn bind(&mut self, addr: SocketAddr) -> Result<()>;

	fn resolve_addr(&mut self, src: Option<SocketAddr>, dst: SocketAddr, timeout_ms: u32) -> Result<()>;

	fn resolve_route(&mut self, timeout_ms: u32) -> Result<()>;

	fn connect(&mut self, param: &ConnParam, ece: Ece) -> Result<()>;

	fn listen(&mut self, backlog: u32) -> Result<()>;

	/// `param` is `None` when the client supplied no valid parameters.
	fn accept(&mut self, param: Option<&ConnParam>, ece: Ece) -> Result<()>;

	fn reject(&mut self, private_data: &[u8], reason: u32) -> Result<()>;

	fn disconnect(&mut self) -> Result<()>;

	fn init_qp_attr(&self, qp_state: u8) -> Result<QpAttributes>;

	fn set_option(&mut self, option: IdOption) -> Result<()>;

	fn set_ib_path(&mut self, path: &PathRecord) -> Result<()>;

	fn notify(&mut self, event: u32) -> Result<()>;

	fn query_route(&self) -> RouteInfo;

	fn query_addr(&self) -> AddrInfo;

	fn query_path(&self) -> Vec<PathRecord>;

	fn query_gid(&self) -> AddrInfo;

	/// Joins a group. Group notifications carry `token` back.
	fn join_multicast(&mut self, addr: SocketAddr, join_state: u8, token: MembershipId) -> Result<()>;

	fn leave_multicast(&mut self, addr: SocketAddr);

	/// Whether the endpoint is bound to a device yet.
	fn has_device(&self) -> bool;

	/// Releases the endpoint. No events are reported for it afterwards.
	fn destroy(self: Box<Self>);
}

/// A notification reported by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
	pub kind: EventKind,
	pub status: i32,
	pub param: EventParam,
	pub ece: Ece,
	/// Membership token for group notifications.
	pub membership: Option<MembershipId>,
}

impl CmEvent {
	pub fn new(kind: EventKind) -> Self {
		Self {
			kind,
			status: 0,
			param: EventParam::default(),
			ece: Ece::default(),
			membership: None,
		}
	}

	pub fn with_status(mut self, status: i32) -> Self {
		self.status = status;
		self
	}

	pub fn with_param(mut self, param: EventParam) -> Self {
		self.param = param;
		self
	}

	pub fn with_ece(mut self, ece: Ece) -> Self {
		self.ece = ece;
		self
	}

	pub fn for_membership(mut self, id: MembershipId) -> Self {
		self.membership = Some(id);
		self
	}
}

/// Identity of one endpoint as seen through its sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EndpointKey(pub(crate) u64);

static NEXT_ENDPOINT_KEY: AtomicU64 = AtomicU64::new(1);

impl EndpointKey {
	pub(crate) fn next() -> Self {
		Self(NEXT_ENDPOINT_KEY.fetch_add(1, Ordering::Relaxed))
	}
}

/// Where events for one endpoint are routed.
///
/// An inbound endpoint routes to its listener until a client claims it,
/// then to the context created for it.
pub(crate) struct Route {
	pub(crate) key: EndpointKey,
	target: Mutex<Weak<Context>>,
}

impl Route {
	pub(crate) fn new(target: Weak<Context>) -> Arc<Self> {
		Arc::new(Self {
			key: EndpointKey::next(),
			target: Mutex::new(target),
		})
	}

	pub(crate) fn target(&self) -> Option<Arc<Context>> {
		self.target.lock().upgrade()
	}

	pub(crate) fn retarget(&self, ctx: &Arc<Context>) {
		*self.target.lock() = Arc::downgrade(ctx);
	}

	/// Stops routing; later deliveries are dropped.
	pub(crate) fn detach(&self) {
		*self.target.lock() = Weak::new();
	}
}

/// Callback handle given to the connection manager for one endpoint.
///
/// Cheap to clone. Delivery never blocks: it only takes short locks and
/// pushes onto a session queue.
#[derive(Clone)]
pub struct EventSink {
	pub(crate) broker: Weak<BrokerShared>,
	pub(crate) route: Arc<Route>,
}

impl EventSink {
	pub(crate) fn new(broker: Weak<BrokerShared>, route: Arc<Route>) -> Self {
		Self { broker, route }
	}

	/// Mints the sink for a new inbound endpoint accepted on this one.
	///
	/// Its events route to this sink's context until a client claims the
	/// connect request reported through it.
	pub fn inbound(&self) -> EventSink {
		let target = self.route.target.lock().clone();
		Self {
			broker: self.broker.clone(),
			route: Route::new(target),
		}
	}

	/// Whether anything still consumes events from this sink.
	pub fn is_attached(&self) -> bool {
		self.route.target().is_some()
	}
}

impl std::fmt::Debug for EventSink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSink")
			.field("key", &self.route.key.0)
			.field("attached", &self.is_attached())
			.finish()
	}
}

/// A refused connect request; the endpoint goes back to the manager.
pub struct Rejected {
	pub endpoint: Box<dyn Endpoint>,
}

impl std::fmt::Debug for Rejected {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Rejected")
	}
}
