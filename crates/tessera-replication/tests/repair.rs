//! Record and cluster repair across in-process nodes.

mod common;

use std::time::Duration;

use common::{TestCluster, rid, value, wait_until};
use tessera_config::ClusterLayout;
use tessera_replication::Transaction;
use tessera_types::{ClusterId, Version};

#[test]
fn majority_value_wins() {
    let cluster = TestCluster::start(3);
    cluster.storage(0).insert(rid(1, 0), value("x", 3));
    cluster.storage(1).insert(rid(1, 0), value("x", 3));
    cluster.storage(2).insert(rid(1, 0), value("y", 1));

    assert!(cluster.db(0).enqueue_repair_record(rid(1, 0)));
    let report = cluster.db(0).repair_now().unwrap();

    assert_eq!(report.records_checked, 1);
    assert_eq!(report.records_repaired, 1);
    assert_eq!(report.records_pending, 0);
    assert_eq!(cluster.read(2, rid(1, 0)), Some(value("x", 3)));
    assert!(cluster.converged());
    assert_eq!(cluster.db(0).pending_repairs(), 0);
    assert_eq!(cluster.db(0).held_locks(), 0);
}

#[test]
fn missing_record_is_recreated() {
    let cluster = TestCluster::start(3);
    cluster.storage(0).insert(rid(1, 4), value("kept", 2));
    cluster.storage(2).insert(rid(1, 4), value("kept", 2));

    cluster.db(1).enqueue_repair_record(rid(1, 4));
    let report = cluster.db(1).repair_now().unwrap();

    assert_eq!(report.records_repaired, 1);
    assert_eq!(cluster.read(1, rid(1, 4)), Some(value("kept", 2)));
    assert!(cluster.converged());
}

#[test]
fn majority_deletion_removes_stray_copy() {
    let cluster = TestCluster::start(3);
    cluster.storage(2).insert(rid(1, 7), value("ghost", 5));

    cluster.db(0).enqueue_repair_record(rid(1, 7));
    let report = cluster.db(0).repair_now().unwrap();

    assert_eq!(report.records_repaired, 1);
    assert_eq!(cluster.read(2, rid(1, 7)), None);
    assert!(cluster.converged());
}

#[test]
fn version_breaks_a_tie() {
    let cluster = TestCluster::start(2);
    cluster.storage(0).insert(rid(3, 0), value("older", 2));
    cluster.storage(1).insert(rid(3, 0), value("newer", 5));

    cluster.db(0).enqueue_repair_record(rid(3, 0));
    cluster.db(0).repair_now().unwrap();

    assert_eq!(cluster.read(0, rid(3, 0)), Some(value("newer", 5)));
    assert_eq!(cluster.read(1, rid(3, 0)), Some(value("newer", 5)));
}

#[test]
fn unresolvable_conflict_stays_queued() {
    let cluster = TestCluster::with_config(2, |config| {
        config.repair.resolver_chain = vec!["majority".to_string()];
    });
    cluster.storage(0).insert(rid(1, 0), value("left", 1));
    cluster.storage(1).insert(rid(1, 0), value("right", 1));

    cluster.db(0).enqueue_repair_record(rid(1, 0));
    let report = cluster.db(0).repair_now().unwrap();

    assert_eq!(report.records_repaired, 0);
    assert_eq!(report.records_pending, 1);
    assert_eq!(cluster.db(0).pending_repairs(), 1);
    assert_eq!(cluster.read(1, rid(1, 0)), Some(value("right", 1)));
}

#[test]
fn unreachable_replica_postpones_repair() {
    let cluster = TestCluster::start(3);
    cluster.storage(0).insert(rid(1, 0), value("x", 2));
    cluster.storage(1).insert(rid(1, 0), value("y", 1));
    cluster.take_offline(2);

    cluster.db(0).enqueue_repair_record(rid(1, 0));
    let report = cluster.db(0).repair_now().unwrap();

    assert_eq!(report.records_pending, 1);
    assert_eq!(cluster.db(0).pending_repairs(), 1);
    assert_eq!(cluster.read(1, rid(1, 0)), Some(value("y", 1)));
}

#[test]
fn canceled_record_is_not_repaired() {
    let cluster = TestCluster::start(2);
    cluster.storage(0).insert(rid(1, 0), value("x", 2));

    cluster.db(0).enqueue_repair_record(rid(1, 0));
    assert!(cluster.db(0).cancel_repair_record(rid(1, 0)));
    assert!(!cluster.db(0).cancel_repair_record(rid(1, 0)));

    let report = cluster.db(0).repair_now().unwrap();
    assert_eq!(report.records_checked, 0);
    assert_eq!(cluster.read(1, rid(1, 0)), None);
    assert_eq!(cluster.db(0).metrics().records_canceled, 1);
}

#[test]
fn lagging_replicas_converge_after_repair() {
    let cluster = TestCluster::start(5);
    cluster.seed(rid(1, 0), &value("original", 1));
    cluster.storage(4).insert(rid(1, 0), value("diverged", 2));
    let unreliable = cluster.nodes[3].name.clone();
    cluster.network.drop_requests_to(&unreliable, true);

    let mut tx = Transaction::new();
    tx.update(rid(1, 0), "updated", Version::new(1));
    let receipt = cluster.db(0).commit(tx).unwrap();
    assert_eq!(receipt.lagging.len(), 2);

    cluster.network.drop_requests_to(&unreliable, false);
    assert!(wait_until(Duration::from_secs(5), || {
        (1..3).all(|i| cluster.read(i, rid(1, 0)) == Some(value("updated", 2)))
    }));
    assert!(cluster.quiesce());

    let report = cluster.db(0).repair_now().unwrap();
    assert_eq!(report.records_repaired, 1);
    for i in 0..5 {
        assert_eq!(cluster.read(i, rid(1, 0)), Some(value("updated", 2)), "node {i}");
    }
    assert_eq!(cluster.db(0).pending_repairs(), 0);
}

#[test]
fn background_thread_drains_the_queue() {
    let cluster = TestCluster::with_config(3, |config| {
        config.repair.check_interval_ms = 20;
    });
    cluster.storage(0).insert(rid(2, 1), value("x", 4));
    cluster.storage(1).insert(rid(2, 1), value("x", 4));

    cluster.db(0).enqueue_repair_record(rid(2, 1));
    assert!(wait_until(Duration::from_secs(5), || cluster.converged()));
    assert!(wait_until(Duration::from_secs(5), || cluster.db(0).pending_repairs() == 0));
}

#[test]
fn cluster_owner_streams_missing_tail() {
    let cluster = TestCluster::with_config(3, |config| {
        config.layout.clusters.insert(
            "1".to_string(),
            ClusterLayout {
                servers: config.layout.nodes.clone(),
            },
        );
    });
    for position in 0..3 {
        cluster.storage(0).insert(rid(1, position), value("tail", 1));
    }
    cluster.storage(1).insert(rid(1, 0), value("tail", 1));

    cluster.db(0).enqueue_repair_cluster(ClusterId::new(1));
    let report = cluster.db(0).repair_now().unwrap();

    assert_eq!(report.clusters_checked, 1);
    assert_eq!(report.clusters_repaired, 1);
    assert!(cluster.converged());
    assert_eq!(cluster.storage(2).records().len(), 3);
    assert_eq!(cluster.db(0).metrics().clusters_repaired, 1);
}

#[test]
fn non_owner_skips_cluster_repair() {
    let cluster = TestCluster::start(2);
    cluster.storage(1).insert(rid(1, 0), value("tail", 1));

    cluster.db(1).enqueue_repair_cluster(ClusterId::new(1));
    let report = cluster.db(1).repair_now().unwrap();

    assert_eq!(report.clusters_checked, 1);
    assert_eq!(report.clusters_repaired, 0);
    assert_eq!(cluster.read(0, rid(1, 0)), None);
}

#[test]
fn lost_owner_hands_its_clusters_to_the_next_server() {
    let cluster = TestCluster::with_config(3, |config| {
        config.layout.clusters.insert(
            "3".to_string(),
            ClusterLayout {
                servers: vec!["node-2".to_string(), "*".to_string()],
            },
        );
        config.layout.clusters.insert(
            "4".to_string(),
            ClusterLayout {
                servers: vec!["node-1".to_string(), "*".to_string()],
            },
        );
    });
    for position in 0..2 {
        cluster.storage(0).insert(rid(3, position), value("tail", 1));
    }

    cluster.take_offline(2);
    assert_eq!(cluster.db(0).pending_cluster_repairs(), 1);
    assert_eq!(cluster.db(1).pending_cluster_repairs(), 1);

    // node-0 is the first server still reachable
    let report = cluster.db(0).repair_now().unwrap();
    assert_eq!(report.clusters_checked, 1);
    assert_eq!(report.clusters_repaired, 1);
    assert_eq!(cluster.storage(1).records().len(), 2);
    assert_eq!(cluster.db(0).pending_cluster_repairs(), 1);

    let report = cluster.db(1).repair_now().unwrap();
    assert_eq!(report.clusters_checked, 1);
    assert_eq!(report.clusters_repaired, 0);
    assert_eq!(cluster.db(1).pending_cluster_repairs(), 0);
}

#[test]
fn losing_a_non_owner_queues_nothing() {
    let cluster = TestCluster::with_config(3, |config| {
        config.layout.clusters.insert(
            "3".to_string(),
            ClusterLayout {
                servers: vec!["node-0".to_string(), "*".to_string()],
            },
        );
    });

    cluster.take_offline(2);
    assert_eq!(cluster.db(0).pending_cluster_repairs(), 0);
    assert_eq!(cluster.db(1).pending_cluster_repairs(), 0);
}

#[test]
fn metrics_are_exported() {
    let cluster = TestCluster::start(2);
    cluster.storage(0).insert(rid(1, 0), value("x", 1));
    cluster.db(0).enqueue_repair_record(rid(1, 0));
    cluster.db(0).repair_now().unwrap();

    let text = cluster.db(0).export_prometheus();
    assert!(text.contains("tessera_records_repaired_total"), "{text}");
    assert!(text.contains("database=\"demo\""), "{text}");
}
