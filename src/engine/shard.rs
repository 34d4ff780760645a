//! Database shard
//!
//! Each database namespace runs in its own thread with a dedicated
//! `KeyspaceStore`, processed by a single-writer event loop: one command
//! (or one transaction commit) runs to completion before the next begins,
//! so no interleaving races exist inside a database. The loop also drives
//! the active expiry sweep and serves blocked pops when data arrives.

use super::events::KeyEventListener;
use super::waiters::{WaitRegistry, Waiter};
use crate::clock;
use crate::error::CoreError;
use crate::eviction::{self, EvictionPolicy};
use crate::exec::{self, Command, Effects, OpKind, Reply};
use crate::expiry;
use crate::persist::{rewrite_records, snapshot, JournalOp, JournalRecord, JournalWriter};
use crate::store::{KeyspaceStats, KeyspaceStore};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Configuration slice a shard needs from the engine config.
#[derive(Debug, Clone)]
pub(crate) struct ShardSettings {
    pub db_index: usize,
    pub max_memory: Option<usize>,
    pub eviction_policy: EvictionPolicy,
    pub eviction_sample_size: usize,
    pub expiry_interval_ms: u64,
    pub expiry_batch_size: usize,
    pub expiry_repeat_fraction: f64,
}

/// A request sent into a shard loop.
pub(crate) enum ShardRequest {
    Execute {
        cmd: Command,
        /// Reply channel for non-blocking commands
        reply: Option<oneshot::Sender<Result<Reply, CoreError>>>,
        /// Waiter slot for blocking commands; the shard answers through it
        /// immediately or parks it in the wait registry
        wait: Option<Waiter>,
    },
    Watch {
        keys: Vec<Bytes>,
        reply: oneshot::Sender<Vec<(Bytes, Option<u64>)>>,
    },
    TypeCheck {
        cmd: Box<Command>,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Commit {
        watched: Vec<(Bytes, Option<u64>)>,
        ops: Vec<Command>,
        reply: oneshot::Sender<Result<Vec<Reply>, CoreError>>,
    },
    CancelWait {
        wait_id: u64,
    },
    DumpSnapshot {
        reply: oneshot::Sender<Vec<u8>>,
    },
    DumpRecords {
        reply: oneshot::Sender<Vec<JournalRecord>>,
    },
    Stats {
        reply: oneshot::Sender<KeyspaceStats>,
    },
}

/// Cloneable handle to a shard's request channel.
#[derive(Clone)]
pub(crate) struct ShardHandle {
    tx: mpsc::UnboundedSender<ShardRequest>,
}

impl ShardHandle {
    pub fn send(&self, request: ShardRequest) -> Result<(), CoreError> {
        self.tx.send(request).map_err(|_| CoreError::EngineClosed)
    }
}

/// Spawn a shard thread around a (possibly recovery-seeded) keyspace.
pub(crate) fn spawn_shard(
    settings: ShardSettings,
    store: KeyspaceStore,
    journal: Option<Arc<JournalWriter>>,
    listener: Option<Arc<dyn KeyEventListener>>,
    degraded: Arc<AtomicBool>,
) -> ShardHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let index = settings.db_index;

    std::thread::Builder::new()
        .name(format!("forgedb-db-{index}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create shard runtime");
            runtime.block_on(run_shard_loop(
                settings, store, journal, listener, degraded, rx,
            ));
        })
        .expect("failed to spawn shard thread");

    ShardHandle { tx }
}

async fn run_shard_loop(
    settings: ShardSettings,
    store: KeyspaceStore,
    journal: Option<Arc<JournalWriter>>,
    listener: Option<Arc<dyn KeyEventListener>>,
    degraded: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<ShardRequest>,
) {
    let db_index = settings.db_index;
    info!(db = db_index, "database shard started");

    let mut shard = ShardState {
        db: db_index as u32,
        store,
        journal,
        listener,
        degraded,
        waiters: WaitRegistry::new(),
        rng: rand::rng(),
        settings,
    };

    let mut sweep = tokio::time::interval(Duration::from_millis(
        shard.settings.expiry_interval_ms.max(1),
    ));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => shard.handle(request),
                None => break,
            },
            _ = sweep.tick() => shard.expiry_tick(),
        }
    }

    info!(db = db_index, "database shard shutting down");
}

struct ShardState {
    db: u32,
    store: KeyspaceStore,
    journal: Option<Arc<JournalWriter>>,
    listener: Option<Arc<dyn KeyEventListener>>,
    degraded: Arc<AtomicBool>,
    waiters: WaitRegistry,
    rng: rand::rngs::ThreadRng,
    settings: ShardSettings,
}

impl ShardState {
    fn handle(&mut self, request: ShardRequest) {
        match request {
            ShardRequest::Execute { cmd, reply, wait } => {
                debug!(db = self.db, cmd = cmd.name(), "executing command");
                match wait {
                    Some(waiter) => self.handle_blocking(cmd, waiter),
                    None => {
                        let result = self.run_command(&cmd);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            ShardRequest::Watch { keys, reply } => {
                let now_ms = clock::now_ms();
                let watched = exec::txn::capture_versions(&mut self.store, &keys, now_ms);
                self.propagate_reaped();
                let _ = reply.send(watched);
            }
            ShardRequest::TypeCheck { cmd, reply } => {
                let now_ms = clock::now_ms();
                let result = exec::type_check(&mut self.store, &cmd, now_ms);
                self.propagate_reaped();
                let _ = reply.send(result);
            }
            ShardRequest::Commit { watched, ops, reply } => {
                let _ = reply.send(self.run_commit(watched, ops));
            }
            ShardRequest::CancelWait { wait_id } => {
                if let Some(waiter) = self.waiters.cancel(wait_id) {
                    let _ = waiter.tx.send(Ok(Reply::Nil));
                }
            }
            ShardRequest::DumpSnapshot { reply } => {
                let section = snapshot::encode_section(self.db, &self.store, clock::now_ms());
                let _ = reply.send(section);
            }
            ShardRequest::DumpRecords { reply } => {
                let records = rewrite_records(self.db, &self.store, clock::now_ms());
                let _ = reply.send(records);
            }
            ShardRequest::Stats { reply } => {
                let _ = reply.send(self.store.stats(clock::now_ms()));
            }
        }
    }

    /// Execute one command and flush its effects.
    fn run_command(&mut self, cmd: &Command) -> Result<Reply, CoreError> {
        let now_ms = clock::now_ms();
        let mut fx = Effects::default();
        let result = self.execute_inner(cmd, now_ms, &mut fx);
        // Effects are flushed even on error: evictions and lazy
        // expirations that happened along the way are real.
        self.flush_effects(fx);
        result
    }

    fn execute_inner(
        &mut self,
        cmd: &Command,
        now_ms: u64,
        fx: &mut Effects,
    ) -> Result<Reply, CoreError> {
        if cmd.is_write() {
            let estimate = cmd.estimated_growth();
            if estimate > 0 {
                let mut evicted = Vec::new();
                let headroom = eviction::ensure_headroom(
                    &mut self.store,
                    estimate,
                    self.settings.max_memory,
                    self.settings.eviction_policy,
                    self.settings.eviction_sample_size,
                    now_ms,
                    &mut self.rng,
                    &mut evicted,
                );
                for key in evicted {
                    fx.record(JournalOp::Del, self.db, key.clone(), Vec::new());
                    fx.event(key, OpKind::Evicted);
                }
                headroom?;
            }
        }
        exec::apply(&mut self.store, self.db, cmd, now_ms, &mut self.rng, fx)
    }

    fn handle_blocking(&mut self, cmd: Command, waiter: Waiter) {
        let Command::BLPop { key, .. } = &cmd else {
            let _ = waiter.tx.send(Err(CoreError::InvalidArgument(
                "not a blocking command".into(),
            )));
            return;
        };

        let now_ms = clock::now_ms();
        let mut fx = Effects::default();
        match exec::blpop_try(&mut self.store, self.db, key, now_ms, &mut fx) {
            Ok(Some(reply)) => {
                self.flush_effects(fx);
                let _ = waiter.tx.send(Ok(reply));
            }
            Ok(None) => {
                self.flush_effects(fx);
                self.waiters.register(key.clone(), waiter);
            }
            Err(err) => {
                self.flush_effects(fx);
                let _ = waiter.tx.send(Err(err));
            }
        }
    }

    fn run_commit(
        &mut self,
        watched: Vec<(Bytes, Option<u64>)>,
        ops: Vec<Command>,
    ) -> Result<Vec<Reply>, CoreError> {
        let now_ms = clock::now_ms();
        if !exec::txn::watches_intact(&mut self.store, &watched, now_ms) {
            self.propagate_reaped();
            return Err(CoreError::WatchConflict);
        }

        let mut fx = Effects::default();
        let replies = exec::txn::execute_queued(
            &mut self.store,
            self.db,
            &ops,
            now_ms,
            &mut self.rng,
            &mut fx,
        );
        self.flush_effects(fx);
        Ok(replies)
    }

    fn expiry_tick(&mut self) {
        let now_ms = clock::now_ms();
        let outcome = expiry::run_expire_cycle(
            &mut self.store,
            now_ms,
            self.settings.expiry_batch_size,
            self.settings.expiry_repeat_fraction,
            &mut self.rng,
        );
        if outcome.removed.is_empty() {
            return;
        }

        let mut fx = Effects::default();
        for key in outcome.removed {
            fx.record(JournalOp::Del, self.db, key.clone(), Vec::new());
            fx.event(key, OpKind::Expired);
        }
        self.flush_effects(fx);
    }

    /// Turn lazy expirations from read-only paths (watch, type-check) into
    /// journal deletes and events.
    fn propagate_reaped(&mut self) {
        let reaped = self.store.take_reaped();
        if reaped.is_empty() {
            return;
        }
        let mut fx = Effects::default();
        for key in reaped {
            fx.record(JournalOp::Del, self.db, key.clone(), Vec::new());
            fx.event(key, OpKind::Expired);
        }
        self.flush_effects(fx);
    }

    /// Append journal records, fire the mutation hook, and wake blocked
    /// pops on keys that received pushes.
    fn flush_effects(&mut self, fx: Effects) {
        if fx.is_empty() {
            return;
        }

        if let Some(journal) = &self.journal {
            for record in &fx.journal {
                if let Err(err) = journal.append(record) {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        error!(db = self.db, %err, "journal write failed; durability degraded");
                    }
                }
            }
        }

        let mut woken: Vec<Bytes> = Vec::new();
        for (key, kind) in &fx.events {
            if let Some(listener) = &self.listener {
                listener.on_key_mutated(self.db as usize, key, *kind);
            }
            if *kind == OpKind::ListPush && !woken.contains(key) {
                woken.push(key.clone());
            }
        }

        for key in woken {
            self.serve_waiters(&key);
        }
    }

    /// Hand list elements to blocked pops, FIFO, until either side runs dry.
    fn serve_waiters(&mut self, key: &Bytes) {
        while let Some(waiter) = self.waiters.pop_waiter(key) {
            let now_ms = clock::now_ms();
            let mut fx = Effects::default();
            match exec::blpop_try(&mut self.store, self.db, key, now_ms, &mut fx) {
                Ok(Some(reply)) => {
                    // A pop emits no push events, so this cannot recurse
                    // back into serve_waiters for the same key.
                    self.flush_effects(fx);
                    let _ = waiter.tx.send(Ok(reply));
                }
                Ok(None) => {
                    self.flush_effects(fx);
                    self.waiters.register_front(key.clone(), waiter);
                    break;
                }
                Err(err) => {
                    self.flush_effects(fx);
                    let _ = waiter.tx.send(Err(err));
                    break;
                }
            }
        }
    }
}
