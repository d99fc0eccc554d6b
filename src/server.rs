//! Line-oriented TCP front-end and metrics exposition.
//!
//! One accept thread, one handler thread per connection; each parsed
//! command executes on the shared worker pool so a flood of connections is
//! backpressured at submit. Writes go through the WAL before the store
//! mutates: a failed append surfaces to the client and leaves memory
//! untouched.

use crate::config::{NodeConfig, Role};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::replication::{Applier, Broadcaster};
use crate::store::ShardedStore;
use crate::wal::WalWriter;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Re-executes one logged or replicated record against the store.
///
/// Used by WAL replay at boot and by the replication follower; malformed
/// records are skipped, matching replay's tolerance for partial history.
pub fn apply_record(store: &ShardedStore, record: &str) {
    let parts: Vec<&str> = record.split_whitespace().collect();
    match parts.as_slice() {
        ["PUT", key, value] => store.put(key, (*value).to_string(), None),
        ["PUT", key, value, ttl] => match ttl.parse::<u64>() {
            Ok(ttl) => store.put(key, (*value).to_string(), Some(ttl)),
            Err(_) => debug!(record, "skipping record with bad ttl"),
        },
        ["DEL", key] => {
            store.del(key);
        }
        _ => debug!(record, "skipping unrecognized record"),
    }
}

/// [`Applier`] over the store, handed to the replication follower.
pub struct StoreApplier {
    store: Arc<ShardedStore>,
}

impl StoreApplier {
    pub fn new(store: Arc<ShardedStore>) -> Self {
        StoreApplier { store }
    }
}

impl Applier for StoreApplier {
    fn apply(&self, record: &str) {
        apply_record(&self.store, record);
    }
}

/// Everything command execution needs, shared across connections.
pub struct Dispatcher {
    role: Role,
    store: Arc<ShardedStore>,
    metrics: Arc<Metrics>,
    wal: Option<Arc<WalWriter>>,
    broadcaster: Option<Arc<Broadcaster>>,
}

impl Dispatcher {
    pub fn new(
        role: Role,
        store: Arc<ShardedStore>,
        metrics: Arc<Metrics>,
        wal: Option<Arc<WalWriter>>,
        broadcaster: Option<Arc<Broadcaster>>,
    ) -> Self {
        Dispatcher {
            role,
            store,
            metrics,
            wal,
            broadcaster,
        }
    }

    /// Durably logs a write record, then applies it to the store, then
    /// publishes it to followers.
    fn commit_write(&self, record: &str) -> Result<(), Error> {
        if let Some(wal) = &self.wal {
            wal.append(record)?;
        }
        apply_record(&self.store, record);
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(record);
        }
        Ok(())
    }

    fn require_leader(&self) -> Result<(), Error> {
        match self.role {
            Role::Leader => Ok(()),
            Role::Replica => Err(Error::ReadOnly),
        }
    }

    fn execute(&self, line: &str) -> Result<String, Error> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = parts.first() else {
            return Err(Error::Usage("<command> ..."));
        };
        match cmd {
            "PING" => Ok("PONG".to_string()),
            "GET" => {
                let key = parts.get(1).ok_or(Error::Usage("GET key [version]"))?;
                let version = match parts.get(2) {
                    Some(raw) => {
                        Some(raw.parse::<u64>().map_err(|_| Error::Usage("GET key [version]"))?)
                    }
                    None => None,
                };
                let result = self.store.get(key, version);
                self.metrics.record_get();
                Ok(match result {
                    Some(value) => format!("VALUE {value}"),
                    None => "NOT_FOUND".to_string(),
                })
            }
            "PUT" => {
                self.require_leader()?;
                if parts.len() < 3 {
                    return Err(Error::Usage("PUT key value [ttl_seconds]"));
                }
                if let Some(raw) = parts.get(3) {
                    raw.parse::<u64>()
                        .map_err(|_| Error::Usage("PUT key value [ttl_seconds]"))?;
                }
                self.commit_write(line)?;
                self.metrics.record_put();
                Ok("OK".to_string())
            }
            "DEL" => {
                self.require_leader()?;
                let key = parts.get(1).ok_or(Error::Usage("DEL key"))?;
                // Probe before committing so the reply distinguishes a
                // removal from a miss; the record is logged either way to
                // mirror the leader's observable behavior on replicas.
                let existed = self.store.get(key, None).is_some();
                self.commit_write(line)?;
                self.metrics.record_del();
                Ok(if existed { "OK" } else { "NOT_FOUND" }.to_string())
            }
            "REBALANCE" => {
                self.require_leader()?;
                if parts.len() != 2 {
                    return Err(Error::Usage("REBALANCE shard_count"));
                }
                let count = parts[1]
                    .parse::<u32>()
                    .map_err(|_| Error::Usage("REBALANCE shard_count"))?;
                self.store.rebalance(count);
                Ok("OK".to_string())
            }
            _ => Ok("ERROR unknown command".to_string()),
        }
    }

    /// Runs one command line and renders the protocol response.
    pub fn process_command(&self, line: &str) -> String {
        match self.execute(line) {
            Ok(response) => response,
            Err(Error::Usage(usage)) => format!("ERROR usage {usage}"),
            Err(Error::ReadOnly) => "ERROR read_only".to_string(),
            Err(Error::Wal(e)) => {
                warn!(error = %e, "write rejected, WAL append failed");
                "ERROR wal append failed".to_string()
            }
            Err(e) => {
                warn!(error = %e, "command failed");
                "ERROR internal".to_string()
            }
        }
    }
}

pub struct KvServer {
    port: u16,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    bound_addr: Mutex<Option<SocketAddr>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl KvServer {
    pub fn new(
        config: &NodeConfig,
        dispatcher: Arc<Dispatcher>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        KvServer {
            port: config.port,
            dispatcher,
            pool,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            bound_addr: Mutex::new(None),
            accept_handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> crate::error::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let dispatcher = Arc::clone(&self.dispatcher);
        let pool = Arc::clone(&self.pool);
        let metrics = Arc::clone(&self.metrics);
        let handle = std::thread::spawn(move || {
            for incoming in listener.incoming() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = incoming else { continue };
                let dispatcher = Arc::clone(&dispatcher);
                let pool = Arc::clone(&pool);
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &dispatcher, &pool, &metrics) {
                        debug!(error = %e, "connection closed");
                    }
                });
            }
        });
        *self.accept_handle.lock() = Some(handle);
        info!(port = addr.port(), "kv server listening");
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        (*self.bound_addr.lock()).map(|a| a.port())
    }

    /// Stops accepting new connections. Existing connections drain as their
    /// clients disconnect. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(addr) = *self.bound_addr.lock() {
            let _ = TcpStream::connect(("127.0.0.1", addr.port()));
        }
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KvServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(
    stream: TcpStream,
    dispatcher: &Arc<Dispatcher>,
    pool: &WorkerPool,
    metrics: &Metrics,
) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let start = Instant::now();
        let mut tokens = trimmed.split_whitespace();
        let response = if tokens.next() == Some("BATCH") {
            run_batch(tokens, &mut reader, dispatcher, pool, metrics)
        } else {
            let dispatcher = Arc::clone(dispatcher);
            let command = trimmed.to_string();
            match pool.submit(move || dispatcher.process_command(&command)) {
                Ok(handle) => handle.wait().unwrap_or_else(|_| "ERROR internal".to_string()),
                Err(_) => "ERROR internal".to_string(),
            }
        };
        metrics.record_latency(start.elapsed());
        writer.write_all(response.as_bytes())?;
        writer.write_all(b"\n")?;
    }
}

/// Pulls the next `n` lines off the connection and executes them as one
/// pool task. The `OK` only goes out after every command has applied.
fn run_batch(
    mut args: std::str::SplitWhitespace<'_>,
    reader: &mut BufReader<TcpStream>,
    dispatcher: &Arc<Dispatcher>,
    pool: &WorkerPool,
    metrics: &Metrics,
) -> String {
    let count = match (args.next().map(str::parse::<usize>), args.next()) {
        (Some(Ok(count)), None) => count,
        _ => return "ERROR usage BATCH count".to_string(),
    };
    let mut commands = Vec::with_capacity(count);
    let mut line = String::new();
    while commands.len() < count {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if !trimmed.is_empty() {
                    commands.push(trimmed.to_string());
                }
            }
        }
    }
    let dispatcher = Arc::clone(dispatcher);
    let submitted = pool.submit(move || {
        for command in &commands {
            dispatcher.process_command(command);
        }
    });
    match submitted.map(|handle| handle.wait()) {
        Ok(Ok(())) => {
            metrics.record_batch();
            "OK".to_string()
        }
        _ => "ERROR internal".to_string(),
    }
}

/// One-shot HTTP responder exposing the metrics snapshot as JSON.
pub struct MetricsServer {
    port: u16,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    bound_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<Metrics>) -> Self {
        MetricsServer {
            port,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            bound_addr: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> crate::error::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let metrics = Arc::clone(&self.metrics);
        let handle = std::thread::spawn(move || {
            for incoming in listener.incoming() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = incoming else { continue };
                let body = serde_json::to_string_pretty(&metrics.snapshot())
                    .unwrap_or_else(|_| "{}".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        *self.handle.lock() = Some(handle);
        info!(port = addr.port(), "metrics exposition listening");
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        (*self.bound_addr.lock()).map(|a| a.port())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(addr) = *self.bound_addr.lock() {
            let _ = TcpStream::connect(("127.0.0.1", addr.port()));
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}
