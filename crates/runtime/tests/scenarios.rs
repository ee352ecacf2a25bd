//! Integration tests for listen backlog, claiming, teardown and migration
//! over the loopback manager.

use std::net::SocketAddr;
use std::sync::Arc;

use ucm_protocol::{ConnParam, ContextId, EventKind, PortSpace, QpType, REJECT_CONSUMER_DEFINED};
use ucm_runtime::{Broker, BrokerConfig, LoopbackManager, Session};

fn listen_addr() -> SocketAddr {
	"10.0.0.1:4791".parse().unwrap()
}

fn setup() -> (Broker, Arc<LoopbackManager>) {
	let manager = LoopbackManager::new();
	let broker = Broker::new(manager.clone(), &BrokerConfig::default());
	(broker, manager)
}

fn create(session: &Session, uid: u64) -> ContextId {
	session.create_id(uid, PortSpace::Tcp, QpType::Rc).unwrap()
}

fn valid_param() -> ConnParam {
	ConnParam {
		valid: true,
		..Default::default()
	}
}

/// Creates a listener with `backlog` in `session`.
fn listener(session: &Session, backlog: i32) -> ContextId {
	let id = create(session, 1000);
	session.bind(id, listen_addr()).unwrap();
	session.listen(id, backlog).unwrap();
	id
}

/// Creates a connector in `session` and starts connecting to the listener.
fn connector(session: &Session, uid: u64) -> ContextId {
	let id = create(session, uid);
	session.resolve_addr(id, None, listen_addr(), 100).unwrap();
	session.connect(id, &valid_param(), None).unwrap();
	id
}

fn drain(session: &Session) -> Vec<(u32, EventKind)> {
	std::iter::from_fn(|| session.try_next_event().unwrap())
		.map(|ev| (ev.id, ev.event))
		.collect()
}

#[tokio::test]
async fn test_backlog_drops_requests_beyond_budget() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	let l = listener(&server, 2);

	let c: Vec<_> = (1..=3).map(|uid| connector(&client, uid)).collect();
	manager.settle().await;

	assert_eq!(server.pending_events(), 2);
	assert_eq!(broker.context_status(l).unwrap().backlog, 0);

	let client_events = drain(&client);
	assert!(client_events.contains(&(c[2].0, EventKind::Rejected)));
	assert!(!client_events.contains(&(c[0].0, EventKind::Rejected)));
	assert!(!client_events.contains(&(c[1].0, EventKind::Rejected)));
}

#[tokio::test]
async fn test_rejected_connector_sees_consumer_defined_reason() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	listener(&server, 1);

	connector(&client, 1);
	let refused = connector(&client, 2);
	manager.settle().await;

	let rejected = std::iter::from_fn(|| client.try_next_event().unwrap())
		.find(|ev| ev.event == EventKind::Rejected)
		.unwrap();
	assert_eq!(rejected.id, refused.0);
	assert_eq!(rejected.status, REJECT_CONSUMER_DEFINED as i32);
}

#[tokio::test]
async fn test_claiming_request_creates_context_and_returns_slot() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	let l = listener(&server, 2);
	connector(&client, 1);
	connector(&client, 2);
	manager.settle().await;

	let request = server.next_event(true).await.unwrap();
	assert_eq!(request.event, EventKind::ConnectRequest);
	assert_eq!(request.uid, 1000);
	let child = ContextId(request.id);

	assert_eq!(broker.context_status(l).unwrap().backlog, 1);
	let status = broker.context_status(child).unwrap();
	assert_eq!(status.session, server.id());
	assert_eq!(server.contexts(), vec![l, child]);
}

#[tokio::test]
async fn test_destroying_listener_releases_unclaimed_endpoints() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	let l = listener(&server, 2);
	connector(&client, 1);
	connector(&client, 2);
	manager.settle().await;

	// Listener, two connectors and two unclaimed inbound endpoints.
	assert_eq!(manager.live_endpoints(), 5);
	let child = ContextId(server.next_event(true).await.unwrap().id);

	server.destroy_id(l).await.unwrap();
	assert_eq!(manager.live_endpoints(), 3);
	assert_eq!(server.contexts(), vec![child]);
	assert_eq!(server.pending_events(), 0);
}

#[tokio::test]
async fn test_full_connection_lifecycle() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	listener(&server, 4);
	let c = connector(&client, 7);
	manager.settle().await;

	let child = ContextId(server.next_event(true).await.unwrap().id);
	server.accept(child, 55, &valid_param(), None).unwrap();
	manager.settle().await;

	let established = server.next_event(true).await.unwrap();
	assert_eq!((established.id, established.uid, established.event), (child.0, 55, EventKind::Established));
	assert_eq!(
		drain(&client),
		vec![(c.0, EventKind::AddrResolved), (c.0, EventKind::Established)]
	);

	client.disconnect(c).unwrap();
	manager.settle().await;
	assert_eq!(drain(&client), vec![(c.0, EventKind::Disconnected)]);
	assert_eq!(drain(&server), vec![(child.0, EventKind::Disconnected)]);

	assert_eq!(server.destroy_id(child).await.unwrap(), 2);
	assert_eq!(client.destroy_id(c).await.unwrap(), 3);
}

#[tokio::test]
async fn test_events_keep_arrival_order_across_contexts() {
	let (broker, manager) = setup();
	let session = broker.open_session();
	let ids: Vec<_> = (0..5).map(|uid| create(&session, uid)).collect();

	for id in &ids {
		session.resolve_addr(*id, None, listen_addr(), 10).unwrap();
		session.resolve_route(*id, 10).unwrap();
	}
	manager.settle().await;

	let expected: Vec<_> = ids
		.iter()
		.flat_map(|id| [(id.0, EventKind::AddrResolved), (id.0, EventKind::RouteResolved)])
		.collect();
	assert_eq!(drain(&session), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_migrations_do_not_deadlock() {
	let (broker, manager) = setup();
	let s1 = Arc::new(broker.open_session());
	let s2 = Arc::new(broker.open_session());
	let a = create(&s1, 1);
	let b = create(&s2, 2);
	s1.resolve_addr(a, None, listen_addr(), 10).unwrap();
	s2.resolve_addr(b, None, listen_addr(), 10).unwrap();
	manager.settle().await;

	for round in 0..200 {
		let (a_from, a_to) = if round % 2 == 0 { (&s1, &s2) } else { (&s2, &s1) };
		let (b_from, b_to) = (Arc::clone(a_to), Arc::clone(a_from));
		let (a_from, a_to) = (Arc::clone(a_from), Arc::clone(a_to));

		let first = tokio::spawn(async move { a_to.migrate_from(a_from.id(), a) });
		let second = tokio::spawn(async move { b_to.migrate_from(b_from.id(), b) });
		assert_eq!(first.await.unwrap().unwrap(), 0);
		assert_eq!(second.await.unwrap().unwrap(), 0);
	}

	// An even number of swaps puts everything back.
	assert_eq!(s1.contexts(), vec![a]);
	assert_eq!(s2.contexts(), vec![b]);
	assert_eq!(drain(&s1), vec![(a.0, EventKind::AddrResolved)]);
	assert_eq!(drain(&s2), vec![(b.0, EventKind::AddrResolved)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migration_racing_source_destroy_has_one_winner() {
	let (broker, manager) = setup();
	let source = Arc::new(broker.open_session());
	let dest = Arc::new(broker.open_session());

	for _ in 0..500 {
		let id = create(&source, 3);
		let migrator = {
			let (source, dest) = (source.id(), Arc::clone(&dest));
			tokio::spawn(async move { dest.migrate_from(source, id) })
		};
		let destroyed = source.destroy_id(id).await;
		let migrated = migrator.await.unwrap();

		assert!(migrated.is_ok() != destroyed.is_ok(), "migrate {migrated:?}, destroy {destroyed:?}");
		assert!(!source.contexts().contains(&id));
		if migrated.is_ok() {
			assert_eq!(dest.contexts(), vec![id]);
			assert_eq!(broker.context_status(id).unwrap().session, dest.id());
			dest.destroy_id(id).await.unwrap();
		} else {
			assert!(dest.contexts().is_empty());
			assert!(broker.context_status(id).is_none());
		}
		assert_eq!(broker.context_count(), 0);
	}
	assert_eq!(manager.live_endpoints(), 0);
}

#[tokio::test]
async fn test_device_removal_then_destroy_releases_everything() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	let l = listener(&server, 4);
	let c = connector(&client, 1);
	manager.settle().await;

	manager.remove_device();
	manager.settle().await;

	assert!(server.bind(l, listen_addr()).unwrap_err().is_unavailable());
	let kinds: Vec<_> = drain(&client).into_iter().map(|(_, kind)| kind).collect();
	assert_eq!(kinds.last(), Some(&EventKind::DeviceRemoval));

	server.destroy_id(l).await.unwrap();
	client.destroy_id(c).await.unwrap();
	assert_eq!(manager.live_endpoints(), 0);
	assert_eq!(broker.context_count(), 0);
}

#[tokio::test]
async fn test_multicast_join_and_leave() {
	let (broker, manager) = setup();
	let session = broker.open_session();
	let id = create(&session, 1);
	session.bind(id, "10.0.0.2:0".parse().unwrap()).unwrap();

	let mc = session
		.join_multicast(id, 900, "239.0.0.9:0".parse().unwrap(), Default::default())
		.unwrap();
	manager.settle().await;
	let joined = session.next_event(true).await.unwrap();
	assert_eq!((joined.id, joined.uid, joined.event), (mc.0, 900, EventKind::MulticastJoin));
	assert_eq!(session.leave_multicast(mc).unwrap(), 1);

	let err = session
		.join_multicast(id, 901, "10.0.0.9:0".parse().unwrap(), Default::default())
		.unwrap_err();
	assert_eq!(err.code(), "EINVAL");
	assert_eq!(broker.membership_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
	let (broker, manager) = setup();
	let server = broker.open_session();
	let client = broker.open_session();
	listener(&server, 4);
	connector(&client, 1);
	manager.settle().await;

	broker.shutdown().await;
	assert!(server.is_closed());
	assert!(client.is_closed());
	assert!(broker.sessions().is_empty());
	assert_eq!(broker.context_count(), 0);
	assert_eq!(manager.live_endpoints(), 0);
}
