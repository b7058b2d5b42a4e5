mod consolidate;
mod error;
mod mutations;
mod queries;
mod store;

pub use consolidate::{classify, plan_upsert, remainders, Cut, Plan};
pub use error::EngineError;
pub use mutations::SweepReport;
pub use store::IntervalStore;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::wal::Wal;

pub type SharedTimeline = Arc<RwLock<Timeline>>;

/// A consumer outside the presence tables that keeps intervals alive
/// (task assignments, task history). The sweep never evicts an id reported
/// here unless it is below the significance threshold.
pub trait IntervalRefs: Send + Sync {
    fn referenced(&self) -> Vec<IntervalId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Intervals shorter than this are swept even while referenced. 0 disables.
    pub min_significant_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_significant_ms: MINUTE_MS,
        }
    }
}

impl EngineConfig {
    pub fn with_min_significant_minutes(minutes: i64) -> Self {
        Self {
            min_significant_ms: minutes.max(0).saturating_mul(MINUTE_MS),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Transaction,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        txns: Vec<Transaction>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Appends that queue up while one batch
/// is being written share a single fsync; every sender hears the batch result.
/// Callers hold the pool lock across their append, so frame order on disk is
/// the order in which transactions are applied in memory.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => {
                            batch.push((txn, response));
                        }
                        Ok(other) => {
                            // Compaction must see every earlier append on disk
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Transaction, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(txn, _)| wal.append_buffered(txn))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every sender in the batch gets the error, so none of it may stay on disk.
        if let Err(e) = wal.rollback() {
            warn!("WAL rollback failed, torn tail left for recovery: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { txns, response } => {
            let result = Wal::write_compact_file(wal.path(), &txns)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Apply a presence event to the timeline it names. The pool must already
/// hold the interval (creation events come first in every transaction).
fn apply_to_timeline(tl: &mut Timeline, event: &Event, pool: &IntervalStore) {
    match event {
        Event::PresenceAdded {
            interval_id,
            active,
            ..
        } => match pool.get(*interval_id) {
            Some(interval) => tl.insert_entry(PresenceEntry {
                interval,
                active: *active,
            }),
            None => warn!("presence for {} references missing {interval_id}", tl.subject),
        },
        Event::PresenceRemoved { interval_id, .. } => {
            tl.remove_entry(*interval_id);
        }
        Event::IntervalCreated { .. } | Event::IntervalDeleted { .. } => {}
    }
}

/// Presence timelines plus the interval pool they share, persisted through a
/// write-ahead log of atomic transactions.
///
/// Lock order: `gate` → timeline → `pool`. Per-subject work (upsert, record
/// removal) holds the gate shared; work that reaches across subjects (sweep,
/// interval deletion, compaction) holds it exclusively and then takes the
/// pool before any timeline.
pub struct Engine {
    pub(super) timelines: DashMap<SubjectKey, SharedTimeline>,
    pub(super) pool: Mutex<IntervalStore>,
    pub(super) gate: RwLock<()>,
    pub(super) refs: RwLock<Vec<Arc<dyn IntervalRefs>>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let (txns, dropped_bytes) = Wal::recover(&wal_path)?;
        if dropped_bytes > 0 {
            warn!(
                "truncated {dropped_bytes} bytes of torn WAL tail at {}",
                wal_path.display()
            );
        }
        let mut wal = Wal::open(&wal_path)?;
        wal.resume_count(txns.len() as u64);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut pool = IntervalStore::new();
        let mut replayed: HashMap<SubjectKey, Timeline> = HashMap::new();
        for txn in &txns {
            for event in &txn.events {
                pool.apply_event(event);
                if let Some(subject) = event.subject() {
                    let tl = replayed
                        .entry(subject)
                        .or_insert_with(|| Timeline::new(subject));
                    apply_to_timeline(tl, event, &pool);
                }
            }
        }
        info!(
            "replayed {} transactions: {} subjects, {} intervals",
            txns.len(),
            replayed.len(),
            pool.len()
        );
        metrics::gauge!(crate::observability::INTERVALS_LIVE).set(pool.len() as f64);

        let timelines = DashMap::new();
        for (subject, tl) in replayed {
            timelines.insert(subject, Arc::new(RwLock::new(tl)));
        }

        Ok(Self {
            timelines,
            pool: Mutex::new(pool),
            gate: RwLock::new(()),
            refs: RwLock::new(Vec::new()),
            wal_tx,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write a transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, txn: &Transaction) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
            .map_err(EngineError::from)
    }

    pub fn get_timeline(&self, subject: &SubjectKey) -> Option<SharedTimeline> {
        self.timelines.get(subject).map(|e| e.value().clone())
    }

    pub(super) fn timeline_or_create(&self, subject: SubjectKey) -> SharedTimeline {
        self.timelines
            .entry(subject)
            .or_insert_with(|| Arc::new(RwLock::new(Timeline::new(subject))))
            .value()
            .clone()
    }

    /// Every timeline, sorted by subject. Collected up front so no map guard
    /// is held while awaiting a timeline lock.
    pub(super) fn snapshot_timelines(&self) -> Vec<(SubjectKey, SharedTimeline)> {
        let mut all: Vec<(SubjectKey, SharedTimeline)> = self
            .timelines
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(subject, _)| *subject);
        all
    }

    /// WAL-append, then apply to the pool and to the one timeline the
    /// transaction touches. Nothing changes in memory if the append fails.
    pub(super) async fn commit_to_timeline(
        &self,
        pool: &mut IntervalStore,
        tl: &mut Timeline,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let txn = Transaction::new(events);
        self.wal_append(&txn).await?;
        for event in &txn.events {
            pool.apply_event(event);
            if event.subject() == Some(tl.subject) {
                apply_to_timeline(tl, event, pool);
            }
        }
        metrics::gauge!(crate::observability::INTERVALS_LIVE).set(pool.len() as f64);
        Ok(())
    }

    /// Same as `commit_to_timeline` for transactions that may touch any
    /// number of subjects. Caller holds the gate exclusively or the events
    /// touch no timeline.
    pub(super) async fn commit_across(
        &self,
        pool: &mut IntervalStore,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let txn = Transaction::new(events);
        self.wal_append(&txn).await?;
        for event in &txn.events {
            pool.apply_event(event);
            if let Some(subject) = event.subject()
                && let Some(tl) = self.get_timeline(&subject)
            {
                let mut guard = tl.write().await;
                apply_to_timeline(&mut guard, event, pool);
            }
        }
        metrics::gauge!(crate::observability::INTERVALS_LIVE).set(pool.len() as f64);
        Ok(())
    }
}
