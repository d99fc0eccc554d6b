//! Leader → replica streaming replication.
//!
//! The broadcaster fans each committed record out to every connected
//! follower as `record + "\n"`, inline on the publishing thread; a slow
//! follower backpressures the leader. Followers reconnect forever and
//! re-apply each line through an [`Applier`]. There is no resume cursor: a
//! reconnecting follower joins the stream at its current position and
//! silently misses the gap, so replicas are seeded from snapshot + WAL and
//! a lagging replica must not be promoted.

use crate::error::Result;
use crate::fault::FaultInjector;
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Applies one replicated record to local state.
///
/// Implemented over the store by the command layer; the replication plumbing
/// itself never parses records.
pub trait Applier: Send + Sync {
    fn apply(&self, record: &str);
}

/// How long a follower read blocks before re-checking the stop flag.
const READ_TICK: Duration = Duration::from_millis(250);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct Broadcaster {
    port: u16,
    bound_addr: Mutex<Option<SocketAddr>>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    running: Arc<AtomicBool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    sequence: AtomicU64,
    sent: AtomicU64,
    metrics: Arc<Metrics>,
    fault: FaultInjector,
    delay: Duration,
}

impl Broadcaster {
    /// `port` 0 binds an ephemeral port; `local_port` reports the actual
    /// one after `start`.
    pub fn new(port: u16, metrics: Arc<Metrics>, delay_ms: u64) -> Self {
        Broadcaster {
            port,
            bound_addr: Mutex::new(None),
            clients: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            accept_handle: Mutex::new(None),
            sequence: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            metrics,
            fault: FaultInjector::new(),
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Binds the replication port and spawns the accept thread.
    pub fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        let clients = Arc::clone(&self.clients);
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            for incoming in listener.incoming() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match incoming {
                    Ok(stream) => {
                        debug!(peer = ?stream.peer_addr().ok(), "follower connected");
                        clients.lock().push(stream);
                    }
                    Err(_) => continue,
                }
            }
        });
        *self.accept_handle.lock() = Some(handle);
        info!(port = addr.port(), "replication listener started");
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        (*self.bound_addr.lock()).map(|a| a.port())
    }

    /// Sends `record` to every connected follower, dropping any whose
    /// connection has died. Delivery order matches call order; all
    /// followers see the same prefix.
    pub fn publish(&self, record: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut payload = String::with_capacity(record.len() + 1);
        payload.push_str(record);
        payload.push('\n');
        {
            let mut clients = self.clients.lock();
            clients.retain_mut(|client| {
                self.fault.maybe_delay(self.delay);
                match client.write_all(payload.as_bytes()) {
                    Ok(()) => true,
                    Err(_) => {
                        debug!(peer = ?client.peer_addr().ok(), "follower dropped");
                        false
                    }
                }
            });
        }
        self.sent.store(seq, Ordering::SeqCst);
        let lag = self.sequence.load(Ordering::SeqCst) - self.sent.load(Ordering::SeqCst);
        self.metrics.set_replication_lag(lag);
    }

    pub fn follower_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Stops accepting, wakes the accept thread, and closes every follower
    /// connection. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // The accept loop is blocked in accept(); poke it awake.
        if let Some(addr) = *self.bound_addr.lock() {
            let _ = TcpStream::connect(("127.0.0.1", addr.port()));
        }
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
        self.clients.lock().clear();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replica-side consumer: connects to the leader, splits the stream on
/// newlines, and re-applies every record locally.
pub struct Follower {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Follower {
    /// Spawns the long-running connect/read/apply loop against
    /// `host:port`.
    pub fn start(host: String, port: u16, applier: Arc<dyn Applier>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let loop_running = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            follower_loop(&host, port, applier, &loop_running);
        });
        Follower {
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Interrupts the loop at its next read tick or reconnect delay.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        self.stop();
    }
}

fn follower_loop(host: &str, port: u16, applier: Arc<dyn Applier>, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        let stream = match TcpStream::connect((host, port)) {
            Ok(s) => s,
            Err(_) => {
                interruptible_sleep(RECONNECT_DELAY, running);
                continue;
            }
        };
        info!(host, port, "connected to leader");
        consume_stream(stream, applier.as_ref(), running);
        // Fall through to reconnect; the leader restarted or the link died.
        if running.load(Ordering::SeqCst) {
            warn!(host, port, "replication stream lost, reconnecting");
        }
    }
}

/// Reads until error or EOF, applying each complete line.
fn consume_stream(mut stream: TcpStream, applier: &dyn Applier, running: &AtomicBool) {
    // A bounded read timeout keeps stop() prompt without a second socket.
    let _ = stream.set_read_timeout(Some(READ_TICK));
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    while running.load(Ordering::SeqCst) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(_) => break,
        };
        buffer.extend_from_slice(&chunk[..n]);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if !line.is_empty() {
                applier.apply(&line);
            }
        }
    }
}

fn interruptible_sleep(total: Duration, running: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && running.load(Ordering::SeqCst) {
        std::thread::sleep(slice);
        slept += slice;
    }
}
