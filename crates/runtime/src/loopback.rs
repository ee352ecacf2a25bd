//! In-process connection manager.
//!
//! Connects endpoints of the same process to each other through a shared
//! fabric. Endpoint methods never call a sink directly: every notification
//! is posted to the fabric's delivery task and reported from there, in
//! posting order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use ucm_protocol::{
	AddrInfo, ConnParam, Ece, EndpointParams, EventKind, EventParam, MembershipId, PathRecord,
	QpAttributes, REJECT_CONSUMER_DEFINED, RouteInfo, UdParam,
};

use crate::error::{Error, Result};
use crate::manager::{CmEvent, ConnectionManager, Endpoint, EventSink, IdOption, Rejected};

/// Status reported to a connector when nothing listens on the address.
const ECONNREFUSED: i32 = -111;

/// Queue key reported with group notifications.
const MULTICAST_QKEY: u32 = 0x0123_4567;

enum Delivery {
	Event { to: u64, event: CmEvent },
	Connect { from: u64, to: SocketAddr, param: ConnParam, ece: Ece },
	RemoveDevice,
	Flush(oneshot::Sender<()>),
}

struct Port {
	sink: EventSink,
	peer: Option<u64>,
}

#[derive(Default)]
struct FabricState {
	ports: HashMap<u64, Port>,
	listeners: HashMap<SocketAddr, u64>,
}

struct Fabric {
	tx: mpsc::UnboundedSender<Delivery>,
	state: Mutex<FabricState>,
	next_serial: AtomicU64,
}

impl Fabric {
	fn post(&self, delivery: Delivery) {
		let _ = self.tx.send(delivery);
	}

	fn attach(self: &Arc<Self>, sink: EventSink, peer: Option<u64>, local: Option<SocketAddr>) -> LoopbackEndpoint {
		let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
		self.state.lock().ports.insert(serial, Port { sink, peer });
		LoopbackEndpoint {
			serial,
			fabric: Arc::clone(self),
			local,
			remote: None,
			device: local.is_some(),
			paths: Vec::new(),
		}
	}

	fn sink(&self, serial: u64) -> Option<EventSink> {
		self.state.lock().ports.get(&serial).map(|p| p.sink.clone())
	}

	fn peer(&self, serial: u64) -> Option<u64> {
		self.state.lock().ports.get(&serial).and_then(|p| p.peer)
	}

	/// Reports one event. The fabric lock is never held while a sink runs.
	fn report(&self, to: u64, event: CmEvent) {
		match self.sink(to) {
			Some(sink) => sink.deliver(event),
			None => trace!(target = "ucm.loopback", to, kind = ?event.kind, "endpoint gone, event dropped"),
		}
	}

	fn dispatch(self: &Arc<Self>, delivery: Delivery) {
		match delivery {
			Delivery::Event { to, event } => self.report(to, event),
			Delivery::Connect { from, to, param, ece } => self.connect(from, to, param, ece),
			Delivery::RemoveDevice => {
				let ports: Vec<_> = {
					let state = self.state.lock();
					state.ports.iter().map(|(serial, p)| (*serial, p.sink.clone())).collect()
				};
				debug!(target = "ucm.loopback", endpoints = ports.len(), "device removed");
				for (_, sink) in ports {
					sink.deliver(CmEvent::new(EventKind::DeviceRemoval));
				}
			}
			Delivery::Flush(done) => {
				let _ = done.send(());
			}
		}
	}

	fn connect(self: &Arc<Self>, from: u64, to: SocketAddr, param: ConnParam, ece: Ece) {
		let listener = {
			let state = self.state.lock();
			state
				.listeners
				.get(&to)
				.and_then(|serial| state.ports.get(serial))
				.map(|p| p.sink.clone())
		};
		let Some(listener) = listener else {
			debug!(target = "ucm.loopback", from, %to, "no listener");
			self.report(from, CmEvent::new(EventKind::Unreachable).with_status(ECONNREFUSED));
			return;
		};

		let sink = listener.inbound();
		let inbound = self.attach(sink.clone(), Some(from), Some(to));
		let inbound_serial = inbound.serial;
		if let Some(port) = self.state.lock().ports.get_mut(&from) {
			port.peer = Some(inbound_serial);
		}

		let event = CmEvent::new(EventKind::ConnectRequest)
			.with_param(EventParam::Conn(param))
			.with_ece(ece);
		match sink.deliver_connect_request(Box::new(inbound), event) {
			Ok(()) => trace!(target = "ucm.loopback", from, inbound = inbound_serial, "connect request delivered"),
			Err(Rejected { endpoint }) => {
				endpoint.destroy();
				debug!(target = "ucm.loopback", from, %to, "connect request refused");
				self.report(
					from,
					CmEvent::new(EventKind::Rejected).with_status(REJECT_CONSUMER_DEFINED as i32),
				);
			}
		}
	}
}

async fn run(fabric: Weak<Fabric>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
	while let Some(delivery) = rx.recv().await {
		let Some(fabric) = fabric.upgrade() else {
			break;
		};
		fabric.dispatch(delivery);
	}
	trace!(target = "ucm.loopback", "delivery task stopped");
}

/// A [`ConnectionManager`] whose endpoints talk to each other in-process.
pub struct LoopbackManager {
	fabric: Arc<Fabric>,
}

impl LoopbackManager {
	/// Creates the manager and its delivery task. Requires a tokio runtime.
	pub fn new() -> Arc<Self> {
		let (tx, rx) = mpsc::unbounded_channel();
		let fabric = Arc::new(Fabric {
			tx,
			state: Mutex::new(FabricState::default()),
			next_serial: AtomicU64::new(1),
		});
		tokio::spawn(run(Arc::downgrade(&fabric), rx));
		Arc::new(Self { fabric })
	}

	/// Reports a device removal for every live endpoint.
	pub fn remove_device(&self) {
		self.fabric.post(Delivery::RemoveDevice);
	}

	/// Waits until every notification posted so far has been reported.
	pub async fn settle(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		self.fabric.post(Delivery::Flush(done_tx));
		let _ = done_rx.await;
	}

	/// Endpoints created and not yet destroyed.
	pub fn live_endpoints(&self) -> usize {
		self.fabric.state.lock().ports.len()
	}
}

impl ConnectionManager for LoopbackManager {
	fn create_endpoint(&self, params: EndpointParams, sink: EventSink) -> Result<Box<dyn Endpoint>> {
		let endpoint = self.fabric.attach(sink, None, None);
		trace!(target = "ucm.loopback", serial = endpoint.serial, ?params, "endpoint created");
		Ok(Box::new(endpoint))
	}
}

struct LoopbackEndpoint {
	serial: u64,
	fabric: Arc<Fabric>,
	local: Option<SocketAddr>,
	remote: Option<SocketAddr>,
	device: bool,
	paths: Vec<PathRecord>,
}

impl LoopbackEndpoint {
	fn post(&self, to: u64, event: CmEvent) {
		self.fabric.post(Delivery::Event { to, event });
	}

	fn post_self(&self, kind: EventKind) {
		self.post(self.serial, CmEvent::new(kind));
	}

	fn addr_info(&self) -> AddrInfo {
		AddrInfo {
			src: self.local,
			dst: self.remote,
			node_guid: 0x0002_c903_0000_0001,
			device_index: 0,
			port_num: 1,
			pkey: 0xffff,
		}
	}

	fn connected_peer(&self) -> Result<u64> {
		self.fabric
			.peer(self.serial)
			.ok_or_else(|| Error::Manager(format!("endpoint {} has no peer", self.serial)))
	}
}

impl Endpoint for LoopbackEndpoint {
	fn bind(&mut self, addr: SocketAddr) -> Result<()> {
		self.local = Some(addr);
		self.device = true;
		Ok(())
	}

	fn resolve_addr(&mut self, src: Option<SocketAddr>, dst: SocketAddr, _timeout_ms: u32) -> Result<()> {
		if let Some(src) = src {
			self.local = Some(src);
		}
		self.remote = Some(dst);
		self.device = true;
		self.post_self(EventKind::AddrResolved);
		Ok(())
	}

	fn resolve_route(&mut self, _timeout_ms: u32) -> Result<()> {
		self.post_self(EventKind::RouteResolved);
		Ok(())
	}

	fn connect(&mut self, param: &ConnParam, ece: Ece) -> Result<()> {
		let to = self
			.remote
			.ok_or_else(|| Error::InvalidArgument("destination not resolved".into()))?;
		self.fabric.post(Delivery::Connect {
			from: self.serial,
			to,
			param: param.clone(),
			ece,
		});
		Ok(())
	}

	fn listen(&mut self, backlog: u32) -> Result<()> {
		let addr = self
			.local
			.ok_or_else(|| Error::InvalidArgument("listen on an unbound endpoint".into()))?;
		let mut state = self.fabric.state.lock();
		if state.listeners.get(&addr).is_some_and(|serial| *serial != self.serial) {
			return Err(Error::Manager(format!("{addr} already in use")));
		}
		state.listeners.insert(addr, self.serial);
		debug!(target = "ucm.loopback", serial = self.serial, %addr, backlog, "listening");
		Ok(())
	}

	fn accept(&mut self, param: Option<&ConnParam>, ece: Ece) -> Result<()> {
		let peer = self.connected_peer()?;
		let param = param.cloned().unwrap_or_default();
		self.post(
			peer,
			CmEvent::new(EventKind::Established)
				.with_param(EventParam::Conn(param))
				.with_ece(ece),
		);
		self.post_self(EventKind::Established);
		Ok(())
	}

	fn reject(&mut self, private_data: &[u8], reason: u32) -> Result<()> {
		let peer = self.connected_peer()?;
		let param = ConnParam {
			private_data: private_data.to_vec(),
			..Default::default()
		};
		self.post(
			peer,
			CmEvent::new(EventKind::Rejected)
				.with_status(reason as i32)
				.with_param(EventParam::Conn(param)),
		);
		Ok(())
	}

	fn disconnect(&mut self) -> Result<()> {
		let peer = self.connected_peer()?;
		self.post(peer, CmEvent::new(EventKind::Disconnected));
		self.post_self(EventKind::Disconnected);
		Ok(())
	}

	fn init_qp_attr(&self, qp_state: u8) -> Result<QpAttributes> {
		Ok(QpAttributes {
			qp_state,
			port_num: 1,
			pkey_index: 0,
			path_mtu: 5,
			timeout: 14,
			retry_cnt: 7,
			rnr_retry: 7,
			..Default::default()
		})
	}

	fn set_option(&mut self, option: IdOption) -> Result<()> {
		trace!(target = "ucm.loopback", serial = self.serial, ?option, "option set");
		Ok(())
	}

	fn set_ib_path(&mut self, path: &PathRecord) -> Result<()> {
		self.paths = vec![*path];
		Ok(())
	}

	fn notify(&mut self, event: u32) -> Result<()> {
		trace!(target = "ucm.loopback", serial = self.serial, event, "notify");
		Ok(())
	}

	fn query_route(&self) -> RouteInfo {
		RouteInfo {
			addr: self.addr_info(),
			paths: self.paths.clone(),
		}
	}

	fn query_addr(&self) -> AddrInfo {
		self.addr_info()
	}

	fn query_path(&self) -> Vec<PathRecord> {
		self.paths.clone()
	}

	fn query_gid(&self) -> AddrInfo {
		self.addr_info()
	}

	fn join_multicast(&mut self, addr: SocketAddr, join_state: u8, token: MembershipId) -> Result<()> {
		if !addr.ip().is_multicast() {
			return Err(Error::InvalidArgument(format!("{addr} is not a multicast address")));
		}
		trace!(target = "ucm.loopback", serial = self.serial, %addr, join_state, "join");
		let param = UdParam {
			qkey: MULTICAST_QKEY,
			..Default::default()
		};
		self.post(
			self.serial,
			CmEvent::new(EventKind::MulticastJoin)
				.with_param(EventParam::Ud(param))
				.for_membership(token),
		);
		Ok(())
	}

	fn leave_multicast(&mut self, addr: SocketAddr) {
		trace!(target = "ucm.loopback", serial = self.serial, %addr, "leave");
	}

	fn has_device(&self) -> bool {
		self.device
	}

	fn destroy(self: Box<Self>) {
		let mut state = self.fabric.state.lock();
		state.ports.remove(&self.serial);
		state.listeners.retain(|_, serial| *serial != self.serial);
		trace!(target = "ucm.loopback", serial = self.serial, "endpoint destroyed");
	}
}
