//! Opening databases from configuration files.

mod common;

use std::fs;
use std::sync::Arc;

use common::create_one;
use tessera_config::TesseraConfig;
use tessera_replication::{
    Collaborators, DatabaseStatus, DistributedDatabase, LocalNetwork, MemoryStorage,
    ReplicationError, StaticMembership,
};
use tessera_types::NodeId;

fn collaborators(network: &Arc<LocalNetwork>, config: &TesseraConfig) -> Collaborators {
    Collaborators {
        transport: network.transport(config.node.name.as_str(), NodeId::new(config.node.id)),
        membership: Arc::new(StaticMembership::new(config.layout.clone(), &config.replication)),
        storage: Arc::new(MemoryStorage::new()),
    }
}

#[test]
fn opens_from_written_config() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tessera.toml");
    let mut config = TesseraConfig::testing();
    config.database.name = "orders".to_string();
    fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let loaded = TesseraConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);

    let network = LocalNetwork::new();
    let database = Arc::new(
        DistributedDatabase::open(loaded.clone(), collaborators(&network, &loaded)).unwrap(),
    );
    network.attach(&database);
    assert_eq!(database.name(), "orders");
    assert_eq!(database.status(), DatabaseStatus::Online);

    database.commit(create_one(1, "first order")).unwrap();
    database.close();
    database.close();
    assert_eq!(database.status(), DatabaseStatus::Closed);
    assert!(matches!(
        database.commit(create_one(1, "late")),
        Err(ReplicationError::Shutdown)
    ));
}

#[test]
fn unknown_resolver_is_rejected() {
    let mut config = TesseraConfig::testing();
    config.repair.resolver_chain = vec!["majority".to_string(), "coin-flip".to_string()];

    let network = LocalNetwork::new();
    let err = DistributedDatabase::open(config.clone(), collaborators(&network, &config)).unwrap_err();
    assert!(matches!(err, ReplicationError::Configuration(_)), "unexpected error: {err}");
}

#[test]
fn zero_workers_is_rejected() {
    let mut config = TesseraConfig::testing();
    config.replication.worker_count = 0;

    let network = LocalNetwork::new();
    let err = DistributedDatabase::open(config.clone(), collaborators(&network, &config)).unwrap_err();
    assert!(matches!(err, ReplicationError::Configuration(_)), "unexpected error: {err}");
}
