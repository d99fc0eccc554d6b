use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Accepts writes, logs them, and streams them to replicas.
    Leader,
    /// Read-only; applies records streamed from `--replica-of`.
    Replica,
}

/// Command-line configuration for a single node.
#[derive(Parser, Debug, Clone)]
#[command(name = "minnow", about = "In-memory KV store with WAL, TTL, LRU eviction, and replication")]
pub struct NodeConfig {
    /// Port for the client command protocol.
    #[arg(long, default_value_t = 9090)]
    pub port: u16,

    /// Port for the metrics HTTP exposition.
    #[arg(long = "metrics-port", default_value_t = 9100)]
    pub metrics_port: u16,

    /// Port replicas connect to for the record stream (leader only).
    #[arg(long = "replication-port", default_value_t = 9091)]
    pub replication_port: u16,

    #[arg(long, value_enum, default_value = "leader")]
    pub role: Role,

    /// Leader to follow, as host:port (replica only).
    #[arg(long = "replica-of")]
    pub replica_of: Option<String>,

    /// Root directory for the WAL and snapshots.
    #[arg(long = "data-dir", default_value = "data")]
    pub data_dir: PathBuf,

    /// Run without a write-ahead log (snapshots remain the only durability).
    #[arg(long = "disable-wal")]
    pub disable_wal: bool,

    /// Seconds between background snapshots.
    #[arg(long = "snapshot-interval", default_value_t = 30)]
    pub snapshot_interval_seconds: u64,

    /// Seconds between TTL sweeps.
    #[arg(long = "ttl-scan", default_value_t = 5)]
    pub ttl_scan_interval_seconds: u64,

    /// Number of store shards.
    #[arg(long = "shards", default_value_t = 16)]
    pub shard_count: u32,

    /// Soft cap on aggregate entry bytes before LRU eviction.
    #[arg(long = "memory-budget", default_value_t = 512 * 1024 * 1024)]
    pub memory_budget_bytes: u64,

    /// Worker threads executing commands.
    #[arg(long = "workers", default_value_t = 8)]
    pub worker_threads: usize,

    /// Task queue depth; submissions block beyond this.
    #[arg(long = "queue-depth", default_value_t = 4096)]
    pub task_queue_depth: usize,

    /// Fault injection: milliseconds added to every WAL append.
    #[arg(long = "wal-delay", default_value_t = 0)]
    pub wal_delay_ms: u64,

    /// Fault injection: probability in [0,1] that a WAL append fails.
    #[arg(long = "wal-fail-prob", default_value_t = 0.0)]
    pub wal_fail_probability: f64,

    /// Fault injection: milliseconds added to every snapshot write.
    #[arg(long = "snapshot-delay", default_value_t = 0)]
    pub snapshot_delay_ms: u64,

    /// Fault injection: milliseconds added to every replication send.
    #[arg(long = "replication-delay", default_value_t = 0)]
    pub replication_delay_ms: u64,
}

impl NodeConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }
}
