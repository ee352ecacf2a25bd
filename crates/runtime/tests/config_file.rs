//! Integration tests for loading broker configuration from disk.

use ucm_protocol::{PortSpace, QpType};
use ucm_runtime::{Broker, BrokerConfig, LoopbackManager};

#[tokio::test]
async fn test_file_backlog_ceiling_clamps_listen() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("ucmd.json");
	std::fs::write(&path, r#"{"maxBacklog": 8}"#).unwrap();

	let config = BrokerConfig::load(&path).unwrap();
	let broker = Broker::new(LoopbackManager::new(), &config);
	let session = broker.open_session();
	let id = session.create_id(1, PortSpace::Tcp, QpType::Rc).unwrap();
	session.bind(id, "10.0.0.1:1".parse().unwrap()).unwrap();

	session.listen(id, 500).unwrap();
	assert_eq!(broker.context_status(id).unwrap().backlog, 8);
	session.listen(id, 3).unwrap();
	assert_eq!(broker.context_status(id).unwrap().backlog, 3);

	broker.set_max_backlog(2).unwrap();
	session.listen(id, -1).unwrap();
	assert_eq!(broker.context_status(id).unwrap().backlog, 2);
	assert!(broker.set_max_backlog(0).is_err());
}
