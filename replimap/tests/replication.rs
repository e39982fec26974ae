use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replimap::{
    ChannelId, Cluster, ClusterConfig, ConnectionState, LogConfig, MapConfig, NodeId,
    ReconnectPolicy, ReplicatedMap,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

const HEARTBEAT: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn cluster_config(node: u8) -> ClusterConfig {
    ClusterConfig::new(NodeId(node))
        .with_heartbeat_interval(HEARTBEAT)
        .with_reconnect(ReconnectPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
        })
}

fn map_config() -> MapConfig {
    MapConfig::new()
        .with_segments(8)
        .with_entries(1000)
        .with_max_key_size(32)
        .with_max_value_size(64)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn value(map: &ReplicatedMap, key: &str) -> Option<Vec<u8>> {
    map.get(key).unwrap()
}

/// Two clusters, `a` listening and `b` dialing it.
async fn pair() -> (Cluster, Cluster) {
    init_tracing();
    let a = Cluster::new(cluster_config(1)).unwrap();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    let b = Cluster::new(cluster_config(2)).unwrap();
    b.connect(addr).unwrap();
    (a, b)
}

fn connection_ids(cluster: &Cluster) -> Vec<u64> {
    cluster.connections().iter().map(|c| c.id).collect()
}

async fn wait_steady(cluster: &Cluster) {
    wait_until("steady state", || {
        let connections = cluster.connections();
        !connections.is_empty()
            && connections
                .iter()
                .all(|c| matches!(c.state, ConnectionState::SteadyState { .. }))
    })
    .await;
}

#[tokio::test]
async fn test_later_write_wins_on_both_replicas() {
    for (first, expected) in [("a", "Y"), ("b", "X")] {
        let (a, b) = pair().await;
        let left = a.create_channel(1u16, map_config()).unwrap();
        let right = b.create_channel(1u16, map_config()).unwrap();

        // "X" is written on a, "Y" on b; the later write must win.
        if first == "a" {
            left.put("1", "X").unwrap();
            sleep(Duration::from_millis(5)).await;
            right.put("1", "Y").unwrap();
        } else {
            right.put("1", "Y").unwrap();
            sleep(Duration::from_millis(5)).await;
            left.put("1", "X").unwrap();
        }

        wait_until("both replicas agree", || {
            value(&left, "1").as_deref() == Some(expected.as_bytes())
                && value(&right, "1").as_deref() == Some(expected.as_bytes())
        })
        .await;
        assert_eq!(left.metadata("1").unwrap(), right.metadata("1").unwrap());

        a.close().await;
        b.close().await;
    }
}

#[tokio::test]
async fn test_writes_before_and_after_connect_replicate() {
    init_tracing();
    let a = Cluster::new(cluster_config(1)).unwrap();
    let b = Cluster::new(cluster_config(2)).unwrap();
    let left = a.create_channel(7u16, map_config()).unwrap();
    let right = b.create_channel(7u16, map_config()).unwrap();

    left.put("early-a", "1").unwrap();
    right.put("early-b", "2").unwrap();

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(addr).unwrap();

    wait_until("bootstrap", || {
        right.contains_key("early-a").unwrap() && left.contains_key("early-b").unwrap()
    })
    .await;

    left.put("late", "3").unwrap();
    assert!(right.remove("early-b").unwrap());

    wait_until("steady-state propagation", || {
        value(&right, "late").as_deref() == Some(b"3".as_slice())
            && !left.contains_key("early-b").unwrap()
    })
    .await;
    assert_eq!(left.metadata("early-b").unwrap().map(|m| m.tombstone), Some(true));
    assert_eq!(left.len().unwrap(), 2);
    assert_eq!(right.len().unwrap(), 2);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_channels_are_isolated_on_a_shared_connection() {
    let (a, b) = pair().await;
    let channels = [1u16, 2, 3];
    let left: Vec<_> = channels
        .iter()
        .map(|c| a.create_channel(*c, map_config()).unwrap())
        .collect();
    let right: Vec<_> = channels
        .iter()
        .map(|c| b.create_channel(*c, map_config()).unwrap())
        .collect();
    // Only a knows this channel; its traffic must be dropped by b.
    let orphan = a.create_channel(4u16, map_config()).unwrap();

    for i in 0..30 {
        orphan.put(format!("orphan{}", i), "x").unwrap();
        let channel = i % 3;
        left[channel]
            .put(format!("c{}-k{}", channel + 1, i), format!("{}", i))
            .unwrap();
    }

    wait_until("every channel replicated", || {
        right.iter().all(|map| map.len().unwrap() == 10)
    })
    .await;

    for (index, map) in right.iter().enumerate() {
        let prefix = format!("c{}-", index + 1);
        for (key, _) in map.entries().unwrap() {
            assert!(key.starts_with(prefix.as_bytes()), "{:?} leaked into channel {}", key, index + 1);
        }
    }

    assert_eq!(b.channels(), vec![ChannelId(1), ChannelId(2), ChannelId(3)]);
    wait_steady(&a).await;
    assert_eq!(a.connections().len(), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_channel_created_after_connection_bootstraps() {
    let (a, b) = pair().await;
    let first_left = a.create_channel(1u16, map_config()).unwrap();
    let first_right = b.create_channel(1u16, map_config()).unwrap();

    first_left.put("k", "v").unwrap();
    wait_until("first channel", || first_right.contains_key("k").unwrap()).await;
    wait_steady(&b).await;

    let second_left = a.create_channel(2u16, map_config()).unwrap();
    for i in 0..50 {
        second_left.put(format!("k{}", i), "v").unwrap();
    }
    let second_right = b.create_channel(2u16, map_config()).unwrap();

    wait_until("second channel bootstrap", || second_right.len().unwrap() == 50).await;

    first_left.put("k2", "v2").unwrap();
    wait_until("first channel still streaming", || first_right.contains_key("k2").unwrap()).await;
    assert_eq!(first_right.len().unwrap(), 2);
    wait_steady(&a).await;

    // Closing a map unbinds its channel everywhere on this node.
    second_right.close().unwrap();
    assert_eq!(b.channels(), vec![ChannelId(1)]);
    second_left.put("after-close", "v").unwrap();
    first_left.put("k3", "v3").unwrap();
    wait_until("first channel unaffected", || first_right.contains_key("k3").unwrap()).await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_random_operations_converge() {
    let (a, b) = pair().await;
    let left = a.create_channel(1u16, map_config()).unwrap();
    let right = b.create_channel(1u16, map_config()).unwrap();
    wait_steady(&a).await;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let keys: Vec<String> = (0..16).map(|i| format!("key{}", i)).collect();

    for step in 0..400 {
        let map = if rng.gen_bool(0.5) { &left } else { &right };
        let key = &keys[rng.gen_range(0..keys.len())];
        if rng.gen_bool(0.7) {
            map.put(key, format!("{}", rng.gen::<u32>())).unwrap();
        } else {
            map.remove(key).unwrap();
        }
        if step % 25 == 0 {
            sleep(Duration::from_millis(1)).await;
        }
    }

    wait_until("convergence", || {
        keys.iter().all(|key| {
            left.metadata(key).unwrap() == right.metadata(key).unwrap()
                && value(&left, key) == value(&right, key)
        })
    })
    .await;
    assert_eq!(left.len().unwrap(), right.len().unwrap());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_reconnecting_peer_receives_missed_updates() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persisted = map_config().with_file(dir.path().join("b.rmap"));

    let a = Cluster::new(cluster_config(1)).unwrap();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    let left = a.create_channel(1u16, map_config()).unwrap();

    {
        let b = Cluster::new(cluster_config(2)).unwrap();
        let right = b.create_channel(1u16, persisted.clone()).unwrap();
        b.connect(addr).unwrap();

        for i in 0..10 {
            left.put(format!("k{}", i), "first").unwrap();
        }
        wait_until("initial sync", || right.len().unwrap() == 10).await;

        right.close().unwrap();
        b.close().await;
    }
    wait_until("a notices the disconnect", || a.connections().is_empty()).await;

    for i in 10..20 {
        left.put(format!("k{}", i), "second").unwrap();
    }
    left.put("k0", "rewritten").unwrap();
    assert!(left.remove("k1").unwrap());

    let b = Cluster::new(cluster_config(2)).unwrap();
    let right = b.create_channel(1u16, persisted).unwrap();
    assert_eq!(right.len().unwrap(), 10);
    assert_eq!(value(&right, "k0").as_deref(), Some(b"first".as_slice()));

    b.connect(addr).unwrap();
    wait_until("catch-up", || {
        right.len().unwrap() == 19 && value(&right, "k0").as_deref() == Some(b"rewritten".as_slice())
    })
    .await;
    assert!(!right.contains_key("k1").unwrap());
    for i in 10..20 {
        assert_eq!(
            value(&right, &format!("k{}", i)).as_deref(),
            Some(b"second".as_slice())
        );
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_silent_peer_is_dropped() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accepts, then never writes a byte.
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let config = cluster_config(1).with_reconnect(ReconnectPolicy::disabled());
    let cluster = Cluster::new(config).unwrap();
    let _map = cluster.create_channel(1u16, map_config()).unwrap();
    cluster.connect(addr).unwrap();

    wait_until("handshake", || {
        cluster
            .connections()
            .iter()
            .any(|c| c.state == ConnectionState::Handshake)
    })
    .await;
    let stalled_at = Instant::now();

    wait_until("teardown", || cluster.connections().is_empty()).await;
    let elapsed = stalled_at.elapsed();
    assert!(
        elapsed <= HEARTBEAT * 4 + Duration::from_millis(200),
        "teardown took {:?}",
        elapsed
    );

    cluster.close().await;
    silent.abort();
}

#[tokio::test]
async fn test_duplicate_node_id_is_rejected() {
    init_tracing();
    let a = Cluster::new(cluster_config(1)).unwrap();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    let b = Cluster::new(cluster_config(1).with_reconnect(ReconnectPolicy::disabled())).unwrap();
    let left = a.create_channel(1u16, map_config()).unwrap();
    let right = b.create_channel(1u16, map_config()).unwrap();

    left.put("k", "v").unwrap();
    b.connect(addr).unwrap();

    sleep(HEARTBEAT * 2).await;
    wait_until("connections torn down", || {
        a.connections().is_empty() && b.connections().is_empty()
    })
    .await;
    assert!(!right.contains_key("k").unwrap());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_idle_connection_is_kept_alive_by_heartbeats() {
    let (a, b) = pair().await;
    let left = a.create_channel(1u16, map_config()).unwrap();
    let right = b.create_channel(1u16, map_config()).unwrap();
    wait_steady(&a).await;
    wait_steady(&b).await;
    let (before_a, before_b) = (connection_ids(&a), connection_ids(&b));

    // No data for well past the dead-peer timeout of three intervals.
    sleep(HEARTBEAT * 5).await;

    assert_eq!(connection_ids(&a), before_a);
    assert_eq!(connection_ids(&b), before_b);
    for info in a.connections().into_iter().chain(b.connections()) {
        assert!(matches!(info.state, ConnectionState::SteadyState { .. }), "{}", info.state);
    }

    left.put("k", "v").unwrap();
    wait_until("put after idle period", || right.contains_key("k").unwrap()).await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_lagging_peer_is_cut_off_and_resynced() {
    let (a, b) = pair().await;
    let bounded = map_config()
        .with_segments(1)
        .with_entries_per_segment(100)
        .with_log(LogConfig::default().with_backlog_limit(4));
    let left = a.create_channel(1u16, bounded).unwrap();
    let right = b.create_channel(1u16, map_config()).unwrap();
    wait_steady(&a).await;
    wait_steady(&b).await;
    let first = connection_ids(&b);

    // The connection task cannot run while this loop holds the thread, so
    // the log outgrows its limit before anything is sent.
    for i in 0..50 {
        left.put(format!("k{}", i), format!("{}", i)).unwrap();
    }

    wait_until("resync after redial", || right.len().unwrap() == 50).await;
    wait_steady(&b).await;
    assert!(connection_ids(&b).iter().all(|id| !first.contains(id)));
    for i in 0..50 {
        assert_eq!(
            value(&right, &format!("k{}", i)),
            Some(format!("{}", i).into_bytes())
        );
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_record_that_failed_to_apply_is_resent_after_reconnect() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // A single slot: a second live key cannot be applied.
    let tiny = MapConfig::new()
        .with_segments(1)
        .with_entries_per_segment(1)
        .with_max_key_size(32)
        .with_max_value_size(64)
        .with_file(dir.path().join("tiny.rmap"));

    let a = Cluster::new(cluster_config(1)).unwrap();
    let addr = a.listen("127.0.0.1:0").await.unwrap();
    let left = a
        .create_channel(1u16, map_config().with_segments(1).with_entries_per_segment(16))
        .unwrap();

    {
        let b = Cluster::new(cluster_config(2)).unwrap();
        let right = b.create_channel(1u16, tiny.clone()).unwrap();
        b.connect(addr).unwrap();

        left.put("k1", "v1").unwrap();
        wait_until("k1 replicated", || right.contains_key("k1").unwrap()).await;

        left.put("k2", "v2").unwrap();
        sleep(HEARTBEAT).await;
        assert!(!right.contains_key("k2").unwrap());

        assert!(left.remove("k1").unwrap());
        wait_until("k1 removed", || {
            right
                .metadata("k1")
                .unwrap()
                .is_some_and(|metadata| metadata.tombstone)
        })
        .await;
        // Let the checkpoints that follow the removal arrive.
        sleep(HEARTBEAT * 2).await;
        assert_eq!(right.purge_tombstones(u64::MAX).unwrap(), 1);

        right.close().unwrap();
        b.close().await;
    }
    wait_until("a notices the disconnect", || a.connections().is_empty()).await;

    let b = Cluster::new(cluster_config(2)).unwrap();
    let right = b.create_channel(1u16, tiny).unwrap();
    assert!(right.is_empty().unwrap());
    b.connect(addr).unwrap();

    wait_until("k2 resent", || {
        value(&right, "k2").as_deref() == Some(b"v2".as_slice())
    })
    .await;
    assert!(!right.contains_key("k1").unwrap());
    assert_eq!(right.len().unwrap(), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_peer_failing_handshake_is_redialed_with_backoff() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    // Hangs up on every connection before the handshake completes.
    let rejecting = {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        })
    };

    let cluster = Cluster::new(cluster_config(1)).unwrap();
    let _map = cluster.create_channel(1u16, map_config()).unwrap();
    cluster.connect(addr).unwrap();

    // Delays of 20, 40, 80, 160 and 200 ms fit about six attempts in here;
    // without growth it would be closer to thirty.
    sleep(Duration::from_millis(600)).await;
    let attempts = accepted.load(Ordering::SeqCst);
    assert!((2..=10).contains(&attempts), "{} attempts", attempts);

    cluster.close().await;
    rejecting.abort();
}
