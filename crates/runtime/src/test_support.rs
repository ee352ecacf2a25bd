//! Recording connection manager for unit tests.
//!
//! Endpoints record every call they receive and never report anything on
//! their own; tests inject callbacks through the captured sinks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use ucm_protocol::{
	AddrInfo, ConnParam, Ece, EndpointParams, MembershipId, PathRecord, QpAttributes, RouteInfo,
};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::manager::{ConnectionManager, Endpoint, EventSink, IdOption};
use crate::{Broker, Session};

#[derive(Default)]
pub(crate) struct Recorder {
	calls: Mutex<Vec<(u64, &'static str)>>,
	sinks: Mutex<Vec<(u64, EventSink)>>,
	next: AtomicU64,
	pub(crate) fail_create: AtomicBool,
	pub(crate) fail_join: AtomicBool,
	pub(crate) without_device: AtomicBool,
}

impl Recorder {
	fn record(&self, serial: u64, op: &'static str) {
		self.calls.lock().push((serial, op));
	}
}

#[derive(Default)]
pub(crate) struct RecordingManager {
	pub(crate) recorder: Arc<Recorder>,
}

impl RecordingManager {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Every call so far as `(endpoint serial, operation)`.
	pub(crate) fn calls(&self) -> Vec<(u64, &'static str)> {
		self.recorder.calls.lock().clone()
	}

	pub(crate) fn count(&self, op: &str) -> usize {
		self.recorder.calls.lock().iter().filter(|(_, o)| *o == op).count()
	}

	/// Sink handed out with the `n`th created endpoint, starting at 1.
	pub(crate) fn sink(&self, n: u64) -> EventSink {
		self.recorder
			.sinks
			.lock()
			.iter()
			.find(|(serial, _)| *serial == n)
			.map(|(_, sink)| sink.clone())
			.expect("no endpoint with that serial")
	}

	/// An endpoint not created through the broker, as for inbound requests.
	pub(crate) fn inbound_endpoint(&self) -> (u64, Box<dyn Endpoint>) {
		let serial = self.recorder.next.fetch_add(1, Ordering::Relaxed) + 1;
		self.recorder.record(serial, "create");
		let endpoint = RecordingEndpoint {
			serial,
			recorder: Arc::clone(&self.recorder),
			device: true,
		};
		(serial, Box::new(endpoint))
	}

	pub(crate) fn destroyed(&self, serial: u64) -> bool {
		self.recorder.calls.lock().contains(&(serial, "destroy"))
	}
}

impl ConnectionManager for RecordingManager {
	fn create_endpoint(&self, _params: EndpointParams, sink: EventSink) -> Result<Box<dyn Endpoint>> {
		if self.recorder.fail_create.load(Ordering::Acquire) {
			return Err(Error::Manager("create refused".into()));
		}
		let serial = self.recorder.next.fetch_add(1, Ordering::Relaxed) + 1;
		self.recorder.record(serial, "create");
		self.recorder.sinks.lock().push((serial, sink));
		Ok(Box::new(RecordingEndpoint {
			serial,
			recorder: Arc::clone(&self.recorder),
			device: !self.recorder.without_device.load(Ordering::Acquire),
		}))
	}
}

struct RecordingEndpoint {
	serial: u64,
	recorder: Arc<Recorder>,
	device: bool,
}

impl RecordingEndpoint {
	fn ok(&self, op: &'static str) -> Result<()> {
		self.recorder.record(self.serial, op);
		Ok(())
	}
}

impl Endpoint for RecordingEndpoint {
	fn bind(&mut self, _addr: SocketAddr) -> Result<()> {
		self.device = true;
		self.ok("bind")
	}

	fn resolve_addr(&mut self, _src: Option<SocketAddr>, _dst: SocketAddr, _timeout_ms: u32) -> Result<()> {
		self.device = true;
		self.ok("resolve_addr")
	}

	fn resolve_route(&mut self, _timeout_ms: u32) -> Result<()> {
		self.ok("resolve_route")
	}

	fn connect(&mut self, _param: &ConnParam, _ece: Ece) -> Result<()> {
		self.ok("connect")
	}

	fn listen(&mut self, _backlog: u32) -> Result<()> {
		self.ok("listen")
	}

	fn accept(&mut self, _param: Option<&ConnParam>, _ece: Ece) -> Result<()> {
		self.ok("accept")
	}

	fn reject(&mut self, _private_data: &[u8], _reason: u32) -> Result<()> {
		self.ok("reject")
	}

	fn disconnect(&mut self) -> Result<()> {
		self.ok("disconnect")
	}

	fn init_qp_attr(&self, qp_state: u8) -> Result<QpAttributes> {
		self.recorder.record(self.serial, "init_qp_attr");
		Ok(QpAttributes {
			qp_state,
			..Default::default()
		})
	}

	fn set_option(&mut self, _option: IdOption) -> Result<()> {
		self.ok("set_option")
	}

	fn set_ib_path(&mut self, _path: &PathRecord) -> Result<()> {
		self.ok("set_ib_path")
	}

	fn notify(&mut self, _event: u32) -> Result<()> {
		self.ok("notify")
	}

	fn query_route(&self) -> RouteInfo {
		RouteInfo::default()
	}

	fn query_addr(&self) -> AddrInfo {
		AddrInfo::default()
	}

	fn query_path(&self) -> Vec<PathRecord> {
		vec![PathRecord::default(); 3]
	}

	fn query_gid(&self) -> AddrInfo {
		AddrInfo::default()
	}

	fn join_multicast(&mut self, _addr: SocketAddr, _join_state: u8, _token: MembershipId) -> Result<()> {
		self.recorder.record(self.serial, "join");
		if self.recorder.fail_join.load(Ordering::Acquire) {
			return Err(Error::Manager("join refused".into()));
		}
		Ok(())
	}

	fn leave_multicast(&mut self, _addr: SocketAddr) {
		self.recorder.record(self.serial, "leave");
	}

	fn has_device(&self) -> bool {
		self.device
	}

	fn destroy(self: Box<Self>) {
		self.recorder.record(self.serial, "destroy");
	}
}

/// A broker over a fresh recording manager.
pub(crate) fn broker() -> (Broker, Arc<RecordingManager>) {
	broker_with(BrokerConfig::default())
}

pub(crate) fn broker_with(config: BrokerConfig) -> (Broker, Arc<RecordingManager>) {
	let manager = RecordingManager::new();
	let broker = Broker::new(manager.clone(), &config);
	(broker, manager)
}

/// Creates a TCP context in `session`.
pub(crate) fn tcp_context(session: &Session, uid: u64) -> ucm_protocol::ContextId {
	session
		.create_id(uid, ucm_protocol::PortSpace::Tcp, ucm_protocol::QpType::Rc)
		.unwrap()
}
