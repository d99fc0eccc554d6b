//! # Minnow
//!
//! An in-memory key-value store with WAL durability, TTL expiration,
//! memory-budgeted LRU eviction, and leader/replica streaming replication.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use minnow::metrics::Metrics;
//! use minnow::store::ShardedStore;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(Metrics::new());
//! let store = ShardedStore::new(16, 512 * 1024 * 1024, metrics);
//!
//! store.put("greeting", "hello".to_string(), None);
//! store.put("ephemeral", "gone soon".to_string(), Some(30));
//!
//! assert_eq!(store.get("greeting", None), Some("hello".to_string()));
//! ```
//!
//! Durability is WAL + periodic snapshots: every committed write is framed
//! and checksummed into `wal.log` before the store mutates, and a background
//! snapshot collapses the log into `snapshot.dat` with a crash-atomic
//! rename. Boot restores the snapshot and replays the log on top.

pub mod config;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod pool;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use config::{NodeConfig, Role};
pub use error::{Error, Result};
pub use fault::FaultInjector;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::WorkerPool;
pub use replication::{Applier, Broadcaster, Follower};
pub use server::{apply_record, Dispatcher, KvServer, MetricsServer, StoreApplier};
pub use snapshot::SnapshotManager;
pub use store::{ShardedStore, SnapshotItem};
pub use wal::{WalReader, WalWriter};
