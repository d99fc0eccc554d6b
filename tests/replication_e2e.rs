use minnow::config::Role;
use minnow::metrics::Metrics;
use minnow::replication::{Broadcaster, Follower};
use minnow::server::{Dispatcher, StoreApplier};
use minnow::store::ShardedStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

struct Leader {
    dispatcher: Dispatcher,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<Metrics>,
}

fn start_leader() -> Leader {
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(ShardedStore::new(8, u64::MAX, Arc::clone(&metrics)));
    let broadcaster = Arc::new(Broadcaster::new(0, Arc::clone(&metrics), 0));
    broadcaster.start().unwrap();
    let dispatcher = Dispatcher::new(
        Role::Leader,
        store,
        Arc::clone(&metrics),
        None,
        Some(Arc::clone(&broadcaster)),
    );
    Leader {
        dispatcher,
        broadcaster,
        metrics,
    }
}

fn start_replica(leader_port: u16) -> (Arc<ShardedStore>, Follower) {
    let store = Arc::new(ShardedStore::new(8, u64::MAX, Arc::new(Metrics::new())));
    let applier = Arc::new(StoreApplier::new(Arc::clone(&store)));
    let follower = Follower::start("127.0.0.1".to_string(), leader_port, applier);
    (store, follower)
}

#[test]
fn leader_writes_reach_the_replica() {
    let leader = start_leader();
    let port = leader.broadcaster.local_port().unwrap();
    let (replica_store, follower) = start_replica(port);

    assert!(wait_until(Duration::from_secs(5), || {
        leader.broadcaster.follower_count() == 1
    }));

    assert_eq!(leader.dispatcher.process_command("PUT x 7"), "OK");
    assert!(wait_until(Duration::from_secs(5), || {
        replica_store.get("x", None) == Some("7".to_string())
    }));
    assert_eq!(leader.metrics.replication_lag(), 0);

    follower.stop();
    leader.broadcaster.stop();
}

#[test]
fn deletes_and_ttls_replicate() {
    let leader = start_leader();
    let port = leader.broadcaster.local_port().unwrap();
    let (replica_store, follower) = start_replica(port);
    assert!(wait_until(Duration::from_secs(5), || {
        leader.broadcaster.follower_count() == 1
    }));

    leader.dispatcher.process_command("PUT a 1");
    leader.dispatcher.process_command("PUT b 2 120");
    leader.dispatcher.process_command("DEL a");

    assert!(wait_until(Duration::from_secs(5), || {
        replica_store.get("a", None).is_none() && replica_store.get("b", None).is_some()
    }));
    // The TTL carried over: the replica's entry has a deadline.
    let items = replica_store.snapshot(u64::MAX);
    let b = items.iter().find(|i| i.key == "b").unwrap();
    assert!(b.expire_at.is_some());

    follower.stop();
    leader.broadcaster.stop();
}

#[test]
fn all_followers_see_the_same_prefix_in_order() {
    let leader = start_leader();
    let port = leader.broadcaster.local_port().unwrap();
    let (store_a, follower_a) = start_replica(port);
    let (store_b, follower_b) = start_replica(port);
    assert!(wait_until(Duration::from_secs(5), || {
        leader.broadcaster.follower_count() == 2
    }));

    for i in 0..50 {
        leader.dispatcher.process_command(&format!("PUT seq{i} {i}"));
    }
    // Each record rewrites the same key, so the final value proves ordered
    // delivery on top of the per-key checks.
    for i in 0..50 {
        leader.dispatcher.process_command(&format!("PUT cursor {i}"));
    }

    for store in [&store_a, &store_b] {
        assert!(wait_until(Duration::from_secs(5), || {
            store.get("cursor", None) == Some("49".to_string())
        }));
        for i in 0..50 {
            assert_eq!(store.get(&format!("seq{i}"), None), Some(i.to_string()));
        }
    }

    follower_a.stop();
    follower_b.stop();
    leader.broadcaster.stop();
}

#[test]
fn follower_keeps_retrying_until_a_leader_appears() {
    // Reserve a free port, then release it; nothing listens there yet.
    let port = std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let (replica_store, follower) = start_replica(port);
    // Let the follower burn through a few failed connect attempts.
    std::thread::sleep(Duration::from_millis(300));

    let broadcaster = Broadcaster::new(port, Arc::new(Metrics::new()), 0);
    broadcaster.start().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        broadcaster.follower_count() == 1
    }));

    // Records published before the connection are missed by design; only
    // what arrives on the live stream is applied.
    broadcaster.publish("PUT late 1");
    assert!(wait_until(Duration::from_secs(5), || {
        replica_store.get("late", None).is_some()
    }));

    follower.stop();
    broadcaster.stop();
}
