//! End-to-end scenarios through the public API.
//!
//! The in-memory scenarios run a whole group inside the test process. The
//! cluster scenario starts two real nodes on localhost (UDP gossip + HTTP).

use replicated_map::membership::reconciler::{ReconcilerConfig, ReconcilerState};
use replicated_map::node::ReplicatedMap;
use replicated_map::transport::GroupTransport;
use replicated_map::transport::cluster::{ClusterConfig, ClusterTransport};
use replicated_map::transport::memory::MemoryNetwork;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Span;

async fn join(transport: Arc<dyn GroupTransport>) -> ReplicatedMap {
    let map = ReplicatedMap::join(transport, "scenarios", ReconcilerConfig::default(), Span::none())
        .await
        .expect("join failed");
    map.settled().await;
    map
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn three_nodes_agree_on_put_and_remove() {
    let network = MemoryNetwork::new(Span::none());
    let a = join(network.transport("A")).await;
    let b = join(network.transport("B")).await;
    let c = join(network.transport("C")).await;

    a.put("eur", 100);
    assert_eq!(b.get("eur"), Some(100));
    assert_eq!(c.get("eur"), Some(100));

    b.remove("eur");
    for map in [&a, &b, &c] {
        assert!(!map.contains_key("eur"));
    }
}

#[tokio::test]
async fn healed_partition_converges_on_primary_state() {
    let network = MemoryNetwork::new(Span::none());
    let a = join(network.transport("A")).await;
    let b = join(network.transport("B")).await;
    let c = join(network.transport("C")).await;

    network.partition(&[&["A", "B"], &["C"]]);
    a.put("eur", 1);
    c.put("eur", 2);
    c.put("gbp", 3);

    network.heal();
    for map in [&a, &b, &c] {
        map.settled().await;
        assert_eq!(map.state(), ReconcilerState::Stable);
    }

    assert_eq!(c.get("eur"), Some(1));
    assert_eq!(c.get("gbp"), None);
    assert_eq!(a.entries(), c.entries());
    assert_eq!(b.entries(), c.entries());

    // Replication keeps working across the healed group.
    c.put("chf", 4);
    assert_eq!(a.get("chf"), Some(4));
}

#[tokio::test]
async fn separately_formed_groups_converge_when_they_meet() {
    let network = MemoryNetwork::new(Span::none());
    let a = join(network.transport("A")).await;
    a.put("eur", 100);

    // B cannot reach A while joining and founds its own group.
    network.partition(&[&["B"], &["A"]]);
    let b = join(network.transport("B")).await;
    assert_eq!(b.reconciler().stats().attempts, 0);
    b.put("gbp", 1);
    assert_eq!(a.get("gbp"), None);

    network.heal();
    a.settled().await;
    b.settled().await;

    assert_eq!(b.entries(), a.entries());
    assert_eq!(b.get("eur"), Some(100));
    assert_eq!(b.get("gbp"), None, "The older group's state wins");
    assert_eq!(b.reconciler().stats().successes, 1);
    assert_eq!(a.reconciler().stats().attempts, 0);

    b.put("chf", 4);
    assert_eq!(a.get("chf"), Some(4));
}

#[tokio::test]
async fn late_joiner_catches_up() {
    let network = MemoryNetwork::new(Span::none());
    let a = join(network.transport("A")).await;
    for i in 0..100 {
        a.put(format!("key_{}", i), i);
    }

    let b = join(network.transport("B")).await;

    assert_eq!(b.len(), 100);
    assert_eq!(b.entries(), a.entries());
}

#[tokio::test]
async fn two_cluster_nodes_replicate_over_the_network() {
    let mut founder_config = ClusterConfig::new("127.0.0.1:0".parse().unwrap(), vec![]);
    founder_config.join_timeout = Duration::from_millis(200);
    let founder_transport = ClusterTransport::new(founder_config, Span::none());
    let a = join(founder_transport.clone()).await;
    a.put("eur", 100);

    let seed = founder_transport.gossip_addr().expect("founder is connected");
    let mut joiner_config = ClusterConfig::new("127.0.0.1:0".parse().unwrap(), vec![seed]);
    joiner_config.join_timeout = Duration::from_secs(5);
    let joiner_transport = ClusterTransport::new(joiner_config, Span::none());
    let b = join(joiner_transport.clone()).await;

    // Recovered from the founder during join.
    assert_eq!(b.get("eur"), Some(100));
    assert_eq!(joiner_transport.alive_members().len(), 2);

    b.put("usd", 90);
    assert!(eventually(|| a.get("usd") == Some(90)).await, "A never saw B's write");

    a.remove("eur");
    assert!(eventually(|| !b.contains_key("eur")).await, "B never saw A's remove");

    b.leave().await;
    a.leave().await;
}
