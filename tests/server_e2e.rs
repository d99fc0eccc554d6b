use clap::Parser;
use minnow::config::{NodeConfig, Role};
use minnow::fault::FaultInjector;
use minnow::metrics::Metrics;
use minnow::pool::WorkerPool;
use minnow::server::{Dispatcher, KvServer, MetricsServer};
use minnow::store::ShardedStore;
use minnow::wal::WalWriter;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestNode {
    server: KvServer,
    store: Arc<ShardedStore>,
    metrics: Arc<Metrics>,
    _pool: Arc<WorkerPool>,
}

fn start_node(role: Role, wal: Option<Arc<WalWriter>>) -> TestNode {
    let config = NodeConfig::parse_from(["minnow", "--port", "0"]);
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(ShardedStore::new(8, u64::MAX, Arc::clone(&metrics)));
    let pool = Arc::new(WorkerPool::new(4, 64));
    let dispatcher = Arc::new(Dispatcher::new(
        role,
        Arc::clone(&store),
        Arc::clone(&metrics),
        wal,
        None,
    ));
    let server = KvServer::new(&config, dispatcher, Arc::clone(&pool), Arc::clone(&metrics));
    server.start().unwrap();
    TestNode {
        server,
        store,
        metrics,
        _pool: pool,
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    fn send(&mut self, command: &str) -> String {
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .unwrap();
        self.read_line()
    }

    fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }
}

#[test]
fn put_then_get_roundtrips_over_tcp() {
    let node = start_node(Role::Leader, None);
    let mut client = Client::connect(node.server.local_port().unwrap());

    assert_eq!(client.send("PING"), "PONG");
    assert_eq!(client.send("PUT a 1"), "OK");
    assert_eq!(client.send("GET a"), "VALUE 1");
    assert_eq!(client.send("DEL a"), "OK");
    assert_eq!(client.send("GET a"), "NOT_FOUND");
    assert_eq!(client.send("WHAT"), "ERROR unknown command");
    assert_eq!(client.send("GET"), "ERROR usage GET key [version]");

    let snap = node.metrics.snapshot();
    assert_eq!(snap.put_count, 1);
    assert_eq!(snap.del_count, 1);
    assert!(snap.get_count >= 2);
    node.server.stop();
}

#[test]
fn ttl_expires_end_to_end() {
    let node = start_node(Role::Leader, None);
    let mut client = Client::connect(node.server.local_port().unwrap());

    assert_eq!(client.send("PUT a 1 1"), "OK");
    assert_eq!(client.send("GET a"), "VALUE 1");
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(client.send("GET a"), "NOT_FOUND");
    node.server.stop();
}

#[test]
fn batch_acks_only_after_all_commands_applied() {
    let node = start_node(Role::Leader, None);
    let mut client = Client::connect(node.server.local_port().unwrap());

    client.send_raw("BATCH 3\nPUT a 1\nPUT b 2\nDEL a\n");
    assert_eq!(client.read_line(), "OK");
    // The ack is the commit point: both effects are visible immediately.
    assert_eq!(node.store.get("b", None), Some("2".to_string()));
    assert_eq!(node.store.get("a", None), None);
    assert_eq!(node.metrics.snapshot().batch_count, 1);

    assert_eq!(client.send("BATCH nope"), "ERROR usage BATCH count");
    node.server.stop();
}

#[test]
fn replica_rejects_writes_over_tcp() {
    let node = start_node(Role::Replica, None);
    let mut client = Client::connect(node.server.local_port().unwrap());

    assert_eq!(client.send("PUT a 1"), "ERROR read_only");
    assert_eq!(client.send("DEL a"), "ERROR read_only");
    assert_eq!(client.send("GET a"), "NOT_FOUND");
    assert_eq!(client.send("PING"), "PONG");
    node.server.stop();
}

#[test]
fn rebalance_command_keeps_data_reachable() {
    let node = start_node(Role::Leader, None);
    let mut client = Client::connect(node.server.local_port().unwrap());

    for i in 0..40 {
        assert_eq!(client.send(&format!("PUT k{i} v{i}")), "OK");
    }
    assert_eq!(client.send("REBALANCE 3"), "OK");
    for i in 0..40 {
        assert_eq!(client.send(&format!("GET k{i}")), format!("VALUE v{i}"));
    }
    assert_eq!(client.send("REBALANCE zero"), "ERROR usage REBALANCE shard_count");
    node.server.stop();
}

#[test]
fn wal_failure_rejects_the_write_and_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let wal = Arc::new(
        WalWriter::new(
            dir.path().join("wal.log"),
            FaultInjector::new(),
            Arc::new(Metrics::new()),
            0,
            1.0,
        )
        .unwrap(),
    );
    let node = start_node(Role::Leader, Some(wal));
    let mut client = Client::connect(node.server.local_port().unwrap());

    assert_eq!(client.send("PUT a 1"), "ERROR wal append failed");
    assert_eq!(node.store.get("a", None), None);
    assert_eq!(node.store.memory_usage(), 0);
    node.server.stop();
}

#[test]
fn concurrent_clients_are_all_served() {
    let node = start_node(Role::Leader, None);
    let port = node.server.local_port().unwrap();

    let mut handles = Vec::new();
    for t in 0..8 {
        handles.push(std::thread::spawn(move || {
            let mut client = Client::connect(port);
            for i in 0..50 {
                assert_eq!(client.send(&format!("PUT c{t}-{i} x")), "OK");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(node.store.entry_count(), 400);
    node.server.stop();
}

#[test]
fn metrics_endpoint_serves_json_counters() {
    let metrics = Arc::new(Metrics::new());
    metrics.record_put();
    metrics.set_memory_bytes(1234);
    let server = MetricsServer::new(0, Arc::clone(&metrics));
    server.start().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", server.local_port().unwrap())).unwrap();
    stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("application/json"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["put_count"], 1);
    assert_eq!(parsed["memory_bytes"], 1234);
    server.stop();
}
