//! Replication convergence over real TCP links.

use std::collections::BTreeSet;
use std::time::Duration;

use srpl_protocol::PeerId;
use srpl_replication::State;

use crate::harness::{host_name, host_record, TestMesh};

const SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Two nodes: the joiner gets an id above the first node's and updates
/// flow both ways.
#[tokio::test]
async fn test_two_node_convergence() {
    let mesh = TestMesh::new(2).await.unwrap();
    let (a, b) = (&mesh.nodes[0], &mesh.nodes[1]);

    assert_eq!(a.status().await.peer_id, PeerId::new(5));
    let joined = b.status().await.peer_id.get().unwrap();
    assert!((6..=10).contains(&joined), "assigned id {joined}");

    a.wait_routine_partners(1, SYNC_TIMEOUT).await.unwrap();
    b.wait_routine_partners(1, SYNC_TIMEOUT).await.unwrap();

    a.update(host_record("alpha", 1)).await.unwrap();
    b.wait_host(&host_name("alpha"), SYNC_TIMEOUT).await.unwrap();

    b.update(host_record("bravo", 2)).await.unwrap();
    let status = a.wait_host(&host_name("bravo"), SYNC_TIMEOUT).await.unwrap();
    assert_eq!(
        status.host(&host_name("bravo")).unwrap().services,
        vec!["bravo._ipp._tcp".to_string()]
    );

    mesh.shutdown_all().await;
}

/// Three nodes with distinct ids; a host registered anywhere reaches
/// everyone.
#[tokio::test]
async fn test_three_node_convergence() {
    let mesh = TestMesh::new(3).await.unwrap();

    let mut ids = BTreeSet::new();
    let mut datasets = BTreeSet::new();
    for node in &mesh.nodes {
        let status = node.status().await;
        assert_eq!(status.state, State::Running);
        ids.insert(status.peer_id.get().unwrap());
        datasets.insert(status.dataset_id.unwrap());
    }
    assert_eq!(ids.len(), 3, "peer ids not unique: {ids:?}");
    assert_eq!(datasets.len(), 1, "nodes split across datasets: {datasets:?}");

    for (i, node) in mesh.nodes.iter().enumerate() {
        node.update(host_record(&format!("host{i}"), i as u8 + 1))
            .await
            .unwrap();
    }
    for i in 0..mesh.nodes.len() {
        mesh.wait_host_everywhere(&host_name(&format!("host{i}")), SYNC_TIMEOUT)
            .await
            .unwrap();
    }

    mesh.shutdown_all().await;
}

/// A node joining later pulls hosts that were registered before it came up.
#[tokio::test]
async fn test_late_joiner_syncs_existing_hosts() {
    let mut mesh = TestMesh::new(0).await.unwrap();

    let first = mesh
        .builder("node-0")
        .fixed_peer_id(5)
        .host("printer", 9)
        .build()
        .await
        .unwrap();
    first.wait_host(&host_name("printer"), SYNC_TIMEOUT).await.unwrap();
    mesh.nodes.push(first);

    let late = mesh.builder("node-1").build().await.unwrap();
    late.wait_running(SYNC_TIMEOUT).await.unwrap();
    late.wait_host(&host_name("printer"), SYNC_TIMEOUT).await.unwrap();
    mesh.nodes.push(late);

    mesh.shutdown_all().await;
}

/// A partner that shuts down withdraws its advert and its sessions are
/// removed after the grace period.
#[tokio::test]
async fn test_departed_partner_removed() {
    let mut mesh = TestMesh::new(2).await.unwrap();
    mesh.nodes[0]
        .wait_routine_partners(1, SYNC_TIMEOUT)
        .await
        .unwrap();

    let departed = mesh.nodes.pop().unwrap();
    departed.shutdown().await;

    let status = mesh.nodes[0]
        .wait_for("partners removed", SYNC_TIMEOUT, |s| s.partners.is_empty())
        .await
        .unwrap();
    assert_eq!(status.state, State::Running);

    mesh.shutdown_all().await;
}
