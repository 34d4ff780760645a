//! Engine facade
//!
//! The `Engine` is the only entry point external collaborators use: it owns
//! one shard (thread + single-writer loop) per database namespace, the
//! shared journal writer, and a background persistence worker for snapshot
//! triggers, journal fsync pacing and journal rewrites.
//!
//! Startup recovery: if the journal exists and holds records, it is
//! replayed against empty databases (a torn tail is truncated first). With
//! no journal to replay, the snapshot (or its `.bak` fallback) seeds the
//! databases, and an enabled journal is re-based on that state so the next
//! restart can replay the journal alone.

mod events;
mod shard;
mod waiters;

pub use events::KeyEventListener;

use crate::clock;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::exec::txn::WatchHandle;
use crate::exec::{Command, Reply};
use crate::persist::{replay_into, rewrite_records, snapshot, JournalReader, JournalWriter};
use crate::store::{KeyspaceStats, KeyspaceStore, SharedCounters};
use bytes::Bytes;
use shard::{spawn_shard, ShardHandle, ShardRequest, ShardSettings};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use waiters::Waiter;

/// Aggregated engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Per-database statistics, indexed by database
    pub databases: Vec<KeyspaceStats>,
    /// Estimated bytes across all databases
    pub used_bytes: usize,
    /// True after a persistence write failure weakened durability
    pub degraded: bool,
}

enum WorkerMsg {
    Snapshot(oneshot::Sender<Result<(), CoreError>>),
}

/// The typed key-value engine.
pub struct Engine {
    shards: Vec<ShardHandle>,
    cfg: EngineConfig,
    shared: SharedCounters,
    degraded: Arc<AtomicBool>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
    cancel: CancellationToken,
    wait_ids: AtomicU64,
}

impl Engine {
    /// Open an engine: recover persisted state, then start the shards and
    /// the persistence worker.
    pub fn open(cfg: EngineConfig) -> anyhow::Result<Self> {
        Self::open_with_listener(cfg, None)
    }

    /// Open with a mutation event hook (consumed by the external pub/sub
    /// layer).
    pub fn open_with_listener(
        cfg: EngineConfig,
        listener: Option<Arc<dyn KeyEventListener>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(cfg.databases > 0, "at least one database is required");

        let shared = SharedCounters::default();
        let lfu_decay_ms = cfg.lfu_decay_minutes.saturating_mul(60_000);
        let mut seeds: Vec<KeyspaceStore> = (0..cfg.databases)
            .map(|_| KeyspaceStore::new(shared.clone(), lfu_decay_ms))
            .collect();

        let mut recovered_from_journal = false;
        if cfg.journal.enabled && cfg.journal.path.exists() {
            let reader = JournalReader::load(&cfg.journal.path)?;
            let scan = reader.scan();
            if scan.truncated {
                warn!(
                    valid = scan.valid_bytes,
                    total = reader.size(),
                    "discarding torn journal tail"
                );
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&cfg.journal.path)?;
                file.set_len(scan.valid_bytes as u64)?;
                file.sync_all()?;
            }
            if !scan.records.is_empty() {
                replay_into(&mut seeds, &scan.records);
                recovered_from_journal = true;
            }
        }

        if !recovered_from_journal && cfg.snapshot.enabled {
            if let Some(sections) = snapshot::load_with_fallback(&cfg.snapshot.path)? {
                let now_ms = clock::now_ms();
                let mut loaded = 0usize;
                for section in sections {
                    let Some(store) = seeds.get_mut(section.db_index as usize) else {
                        warn!(db = section.db_index, "snapshot section for unknown database, skipping");
                        continue;
                    };
                    for entry in section.entries {
                        store.set(entry.key, entry.value, entry.expire_at, now_ms);
                        loaded += 1;
                    }
                    store.take_reaped();
                }
                info!(keys = loaded, "snapshot loaded");

                // Re-base the journal so the next restart can replay it
                // alone without losing the snapshot-seeded keys.
                if cfg.journal.enabled {
                    rebase_journal(&cfg, &seeds, now_ms)?;
                }
            }
        }

        // Recovery writes are not client mutations.
        shared.dirty.store(0, Ordering::Relaxed);

        let journal = if cfg.journal.enabled {
            Some(Arc::new(JournalWriter::new(
                &cfg.journal.path,
                cfg.journal.sync,
            )?))
        } else {
            None
        };
        let degraded = Arc::new(AtomicBool::new(false));

        let shards: Vec<ShardHandle> = seeds
            .into_iter()
            .enumerate()
            .map(|(db_index, store)| {
                spawn_shard(
                    ShardSettings {
                        db_index,
                        max_memory: cfg.max_memory,
                        eviction_policy: cfg.eviction_policy,
                        eviction_sample_size: cfg.eviction_sample_size,
                        expiry_interval_ms: cfg.expiry_interval_ms,
                        expiry_batch_size: cfg.expiry_batch_size,
                        expiry_repeat_fraction: cfg.expiry_repeat_fraction,
                    },
                    store,
                    journal.clone(),
                    listener.clone(),
                    degraded.clone(),
                )
            })
            .collect();

        let cancel = CancellationToken::new();
        let worker_tx = spawn_persistence_worker(
            cfg.clone(),
            shards.clone(),
            shared.clone(),
            journal,
            degraded.clone(),
            cancel.clone(),
        );

        info!(
            databases = cfg.databases,
            policy = cfg.eviction_policy.name(),
            "engine started"
        );

        Ok(Engine {
            shards,
            cfg,
            shared,
            degraded,
            worker_tx,
            cancel,
            wait_ids: AtomicU64::new(1),
        })
    }

    fn shard(&self, db_index: usize) -> Result<&ShardHandle, CoreError> {
        self.shards
            .get(db_index)
            .ok_or(CoreError::NoSuchDatabase(db_index))
    }

    /// Execute one command against a database. Blocking commands park here
    /// until data arrives or their timeout elapses (a timeout resolves to
    /// [`Reply::Nil`]).
    pub async fn execute(&self, db_index: usize, cmd: Command) -> Result<Reply, CoreError> {
        let shard = self.shard(db_index)?;

        if let Command::BLPop { timeout_ms, .. } = &cmd {
            let timeout_ms = *timeout_ms;
            let wait_id = self.wait_ids.fetch_add(1, Ordering::Relaxed);
            let (tx, mut rx) = oneshot::channel();
            shard.send(ShardRequest::Execute {
                cmd,
                reply: None,
                wait: Some(Waiter { id: wait_id, tx }),
            })?;

            if timeout_ms == 0 {
                return rx.await.map_err(|_| CoreError::EngineClosed)?;
            }
            match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
                Ok(result) => result.map_err(|_| CoreError::EngineClosed)?,
                Err(_) => {
                    // Cancellation resolves the waiter (with the popped
                    // value if the wake won the race, Nil otherwise).
                    shard.send(ShardRequest::CancelWait { wait_id })?;
                    rx.await.map_err(|_| CoreError::EngineClosed)?
                }
            }
        } else {
            let (tx, rx) = oneshot::channel();
            shard.send(ShardRequest::Execute {
                cmd,
                reply: Some(tx),
                wait: None,
            })?;
            rx.await.map_err(|_| CoreError::EngineClosed)?
        }
    }

    /// Register a watch set: captures the current version of each key for
    /// optimistic conflict detection at commit.
    pub async fn watch(&self, db_index: usize, keys: Vec<Bytes>) -> Result<WatchHandle, CoreError> {
        let shard = self.shard(db_index)?;
        let (tx, rx) = oneshot::channel();
        shard.send(ShardRequest::Watch { keys, reply: tx })?;
        let watched = rx.await.map_err(|_| CoreError::EngineClosed)?;
        Ok(WatchHandle::new(db_index, watched))
    }

    /// Queue an operation on a transaction. A type mismatch against the
    /// live keyspace poisons the transaction: the commit will abort before
    /// running anything.
    pub async fn queue(&self, handle: &mut WatchHandle, cmd: Command) -> Result<(), CoreError> {
        let shard = self.shard(handle.db_index())?;
        let (tx, rx) = oneshot::channel();
        shard.send(ShardRequest::TypeCheck {
            cmd: Box::new(cmd.clone()),
            reply: tx,
        })?;
        match rx.await.map_err(|_| CoreError::EngineClosed)? {
            Ok(()) => {
                handle.queued.push(cmd);
                Ok(())
            }
            Err(err) => {
                if handle.poisoned.is_none() {
                    handle.poisoned = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Commit a transaction: all queued operations run back-to-back with
    /// nothing interleaved, or none run at all ([`CoreError::WatchConflict`]
    /// when a watched key changed, the queue-time error when poisoned).
    pub async fn commit(&self, handle: WatchHandle) -> Result<Vec<Reply>, CoreError> {
        if let Some(err) = handle.poisoned {
            return Err(err);
        }
        let shard = self.shard(handle.db_index)?;
        let (tx, rx) = oneshot::channel();
        shard.send(ShardRequest::Commit {
            watched: handle.watched,
            ops: handle.queued,
            reply: tx,
        })?;
        rx.await.map_err(|_| CoreError::EngineClosed)?
    }

    /// Request an immediate snapshot and wait for it to be durable.
    pub async fn trigger_snapshot(&self) -> Result<(), CoreError> {
        if !self.cfg.snapshot.enabled {
            return Err(CoreError::InvalidArgument("snapshots are disabled".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.worker_tx
            .send(WorkerMsg::Snapshot(tx))
            .map_err(|_| CoreError::EngineClosed)?;
        rx.await.map_err(|_| CoreError::EngineClosed)?
    }

    /// Per-database and aggregate statistics.
    pub async fn stats(&self) -> Result<EngineStats, CoreError> {
        let mut databases = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard.send(ShardRequest::Stats { reply: tx })?;
            databases.push(rx.await.map_err(|_| CoreError::EngineClosed)?);
        }
        Ok(EngineStats {
            databases,
            used_bytes: self.shared.mem_used.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        })
    }

    /// True after a persistence write failure; in-memory operation
    /// continues with weakened durability guarantees.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Number of configured databases.
    pub fn databases(&self) -> usize {
        self.shards.len()
    }

    /// Stop the background persistence worker. Shard loops exit once the
    /// engine (and with it their request channels) is dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Replace the journal with records reconstructing `seeds` (snapshot-seeded
/// startup).
fn rebase_journal(
    cfg: &EngineConfig,
    seeds: &[KeyspaceStore],
    now_ms: u64,
) -> std::io::Result<()> {
    let mut tmp_name = cfg
        .journal
        .path
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    tmp_name.push(".rebase");
    let tmp = cfg.journal.path.with_file_name(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp)?;
        for (db_index, store) in seeds.iter().enumerate() {
            for record in rewrite_records(db_index as u32, store, now_ms) {
                file.write_all(&record.to_bytes())?;
            }
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &cfg.journal.path)?;
    info!("journal re-based on snapshot state");
    Ok(())
}

fn spawn_persistence_worker(
    cfg: EngineConfig,
    shards: Vec<ShardHandle>,
    shared: SharedCounters,
    journal: Option<Arc<JournalWriter>>,
    degraded: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<WorkerMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("forgedb-persist".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create persistence runtime");

            runtime.block_on(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut window_start = Instant::now();
                let mut window_base = 0u64;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = rx.recv() => match message {
                            Some(WorkerMsg::Snapshot(reply)) => {
                                let result = write_snapshot_now(&cfg, &shards, &shared).await;
                                if result.is_err() {
                                    degraded.store(true, Ordering::Relaxed);
                                }
                                let _ = reply.send(result);
                                window_start = Instant::now();
                                window_base = shared.dirty.load(Ordering::Relaxed);
                            }
                            None => break,
                        },
                        _ = tick.tick() => {
                            if let Some(journal) = &journal {
                                if let Err(err) = journal.sync_if_due() {
                                    if !degraded.swap(true, Ordering::Relaxed) {
                                        error!(%err, "journal fsync failed; durability degraded");
                                    }
                                }
                            }

                            if cfg.snapshot.enabled {
                                let dirty = shared.dirty.load(Ordering::Relaxed);
                                if dirty.saturating_sub(window_base) >= cfg.snapshot.dirty_threshold {
                                    info!(dirty, "dirty threshold crossed; taking snapshot");
                                    if let Err(err) = write_snapshot_now(&cfg, &shards, &shared).await {
                                        error!(%err, "automatic snapshot failed");
                                        degraded.store(true, Ordering::Relaxed);
                                    }
                                    window_start = Instant::now();
                                    window_base = shared.dirty.load(Ordering::Relaxed);
                                } else if window_start.elapsed()
                                    >= Duration::from_secs(cfg.snapshot.window_secs.max(1))
                                {
                                    window_start = Instant::now();
                                    window_base = dirty;
                                }
                            }

                            if let Some(journal) = &journal {
                                let size = journal.size();
                                let grown_enough = size as f64
                                    >= cfg.journal.rewrite_growth * journal.rewrite_base() as f64;
                                if size >= cfg.journal.rewrite_min_bytes && grown_enough {
                                    match rewrite_journal(&cfg, &shards, journal).await {
                                        Ok(()) => info!(size_before = size, size_after = journal.size(), "journal rewritten"),
                                        Err(err) => {
                                            error!(%err, "journal rewrite failed");
                                            degraded.store(true, Ordering::Relaxed);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });
        })
        .expect("failed to spawn persistence worker");

    tx
}

/// Collect one section per shard and write a durable snapshot file.
async fn write_snapshot_now(
    cfg: &EngineConfig,
    shards: &[ShardHandle],
    shared: &SharedCounters,
) -> Result<(), CoreError> {
    let mut sections = Vec::with_capacity(shards.len());
    for shard in shards {
        let (tx, rx) = oneshot::channel();
        shard.send(ShardRequest::DumpSnapshot { reply: tx })?;
        sections.push(rx.await.map_err(|_| CoreError::EngineClosed)?);
    }

    let blob = snapshot::assemble(&sections);
    snapshot::write_snapshot(&cfg.snapshot.path, &blob)?;
    shared.dirty.store(0, Ordering::Relaxed);
    Ok(())
}

/// Rewrite the journal from live-state record dumps and swap it in.
async fn rewrite_journal(
    cfg: &EngineConfig,
    shards: &[ShardHandle],
    journal: &JournalWriter,
) -> Result<(), CoreError> {
    let mut records = Vec::new();
    for shard in shards {
        let (tx, rx) = oneshot::channel();
        shard.send(ShardRequest::DumpRecords { reply: tx })?;
        records.extend(rx.await.map_err(|_| CoreError::EngineClosed)?);
    }

    let mut tmp_name = cfg
        .journal
        .path
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    tmp_name.push(".rewrite");
    let tmp = cfg.journal.path.with_file_name(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp)?;
        for record in &records {
            file.write_all(&record.to_bytes())?;
        }
        file.sync_all()?;
    }
    journal.replace_with(&tmp)?;
    Ok(())
}
