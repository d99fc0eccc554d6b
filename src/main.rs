use anyhow::Context;
use clap::Parser;
use minnow::config::{NodeConfig, Role};
use minnow::fault::FaultInjector;
use minnow::metrics::Metrics;
use minnow::pool::WorkerPool;
use minnow::replication::{Broadcaster, Follower};
use minnow::server::{apply_record, Dispatcher, KvServer, MetricsServer, StoreApplier};
use minnow::snapshot::SnapshotManager;
use minnow::store::ShardedStore;
use minnow::wal::{WalReader, WalWriter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    let config = NodeConfig::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let metrics = Arc::new(Metrics::new());
    let fault = FaultInjector::new();
    let store = Arc::new(ShardedStore::new(
        config.shard_count,
        config.memory_budget_bytes,
        Arc::clone(&metrics),
    ));
    let pool = Arc::new(WorkerPool::new(config.worker_threads, config.task_queue_depth));
    let snapshots = SnapshotManager::new(
        &config.data_dir,
        fault.clone(),
        Arc::clone(&metrics),
        config.snapshot_delay_ms,
    )?;

    let wal = if config.disable_wal {
        None
    } else {
        Some(Arc::new(WalWriter::new(
            config.wal_path(),
            fault.clone(),
            Arc::clone(&metrics),
            config.wal_delay_ms,
            config.wal_fail_probability,
        )?))
    };

    // Boot: restore the latest snapshot, then replay the log on top. The
    // rotated segment comes first; it exists only if a snapshot cycle
    // crashed between rotation and prune, and double-apply is idempotent.
    let items = snapshots.load_latest();
    if !items.is_empty() {
        info!(items = items.len(), "restoring snapshot");
        store.restore(items);
    }
    if let Some(wal) = &wal {
        let mut replayed = 0usize;
        for path in [wal.rotated_path().to_path_buf(), config.wal_path()] {
            for record in WalReader::new(path).read_all() {
                apply_record(&store, &record);
                replayed += 1;
            }
        }
        info!(records = replayed, "wal replay complete");
    }

    let broadcaster = match config.role {
        Role::Leader => {
            let b = Arc::new(Broadcaster::new(
                config.replication_port,
                Arc::clone(&metrics),
                config.replication_delay_ms,
            ));
            b.start().context("starting replication listener")?;
            Some(b)
        }
        Role::Replica => None,
    };

    let follower = match (&config.role, &config.replica_of) {
        (Role::Replica, Some(target)) => {
            let (host, port) = target
                .rsplit_once(':')
                .context("--replica-of must be host:port")?;
            let port: u16 = port.parse().context("--replica-of port")?;
            let applier = Arc::new(StoreApplier::new(Arc::clone(&store)));
            Some(Follower::start(host.to_string(), port, applier))
        }
        (Role::Replica, None) => {
            warn!("replica started without --replica-of; serving reads only");
            None
        }
        _ => None,
    };

    let metrics_server = MetricsServer::new(config.metrics_port, Arc::clone(&metrics));
    metrics_server.start().context("starting metrics exposition")?;

    let dispatcher = Arc::new(Dispatcher::new(
        config.role,
        Arc::clone(&store),
        Arc::clone(&metrics),
        wal.clone(),
        broadcaster.clone(),
    ));
    let server = KvServer::new(&config, dispatcher, Arc::clone(&pool), Arc::clone(&metrics));
    server.start().context("starting kv server")?;

    // Background sweeps. Each thread blocks on its shutdown channel with
    // the scan interval as timeout, so teardown is prompt and the interval
    // doubles as the schedule.
    let (expirer_tx, expirer_rx) = mpsc::channel::<()>();
    let expirer_store = Arc::clone(&store);
    let ttl_interval = Duration::from_secs(config.ttl_scan_interval_seconds.max(1));
    let expirer = std::thread::spawn(move || loop {
        match expirer_rx.recv_timeout(ttl_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                expirer_store.expire_keys();
            }
            _ => break,
        }
    });

    let (snapshotter_tx, snapshotter_rx) = mpsc::channel::<()>();
    let snapshot_store = Arc::clone(&store);
    let snapshot_wal = wal.clone();
    let snapshot_interval = Duration::from_secs(config.snapshot_interval_seconds.max(1));
    let snapshotter = std::thread::spawn(move || loop {
        match snapshotter_rx.recv_timeout(snapshot_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Rotate first so the snapshot covers everything already
                // logged; the rotated segment is pruned only once the
                // snapshot has committed.
                if let Some(wal) = &snapshot_wal {
                    if let Err(e) = wal.rotate() {
                        warn!(error = %e, "wal rotation failed, snapshotting anyway");
                    }
                }
                let version = snapshot_store.current_version();
                let items = snapshot_store.snapshot(version);
                match snapshots.write_snapshot(&items) {
                    Ok(()) => {
                        if let Some(wal) = &snapshot_wal {
                            if let Err(e) = wal.prune_rotated() {
                                warn!(error = %e, "pruning rotated wal failed");
                            }
                        }
                    }
                    // Old snapshot stays valid; the next cycle retries.
                    Err(e) => warn!(error = %e, "snapshot failed"),
                }
            }
            _ => break,
        }
    });

    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        role = ?config.role,
        "minnow running"
    );

    install_signal_handlers();
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutting down");

    let _ = expirer_tx.send(());
    let _ = snapshotter_tx.send(());
    let _ = expirer.join();
    let _ = snapshotter.join();
    server.stop();
    metrics_server.stop();
    if let Some(f) = &follower {
        f.stop();
    }
    if let Some(b) = &broadcaster {
        b.stop();
    }
    pool.shutdown();
    Ok(())
}
