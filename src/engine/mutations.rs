use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::consolidate::{plan_upsert, validate_range};
use super::store::SpanResolver;
use super::{Engine, EngineError, IntervalRefs, WalCommand};

/// What one sweep deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<IntervalId>,
    /// Presence records removed along with their intervals.
    pub cascaded: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

impl Engine {
    /// Record that `subject` is `active` (or not) over `[start, end]`.
    ///
    /// The subject's timeline is reconciled so that it stays free of
    /// overlaps: same-state records touching the range are merged into it,
    /// opposite-state records are trimmed, split or dropped. The whole change
    /// commits as one transaction, then the interval pool is swept.
    ///
    /// Returns the record holding the (possibly widened) range. If that range
    /// is below the significance threshold the sweep evicts it straight away.
    pub async fn upsert(
        &self,
        subject: SubjectKey,
        start: Ms,
        end: Ms,
        active: bool,
    ) -> Result<StateInterval, EngineError> {
        let started = Instant::now();
        let result = self.consolidate(subject, start, end, active).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::InvalidRange { .. }) => "invalid_range",
            Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
            Err(_) => "error",
        };
        metrics::counter!(observability::UPSERTS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::UPSERT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let record = result?;
        self.sweep().await?;
        Ok(record)
    }

    async fn consolidate(
        &self,
        subject: SubjectKey,
        start: Ms,
        end: Ms,
        active: bool,
    ) -> Result<StateInterval, EngineError> {
        let span = validate_range(start, end)?;

        let _gate = self.gate.read().await;
        let tl = self.timeline_or_create(subject);
        let mut guard = tl.write().await;

        let plan = plan_upsert(&guard.entries, span, active);
        if plan.is_noop()
            && let Some(id) = plan.kept
        {
            debug!("upsert {subject} [{start}, {end}] active={active}: already recorded");
            return Ok(StateInterval {
                subject,
                interval_id: id,
                span: plan.span,
                active,
            });
        }

        let inserted = usize::from(plan.kept.is_none()) + plan.remainders.len();
        if (guard.entries.len() + inserted).saturating_sub(plan.removed.len()) > MAX_RECORDS_PER_SUBJECT {
            return Err(EngineError::LimitExceeded("too many records on subject"));
        }

        let mut pool = self.pool.lock().await;
        let mut resolver = SpanResolver::new(&mut pool);

        let primary_id = match plan.kept {
            Some(id) => id,
            None => resolver.resolve(plan.span),
        };
        let mut additions: Vec<(IntervalId, bool)> = Vec::with_capacity(inserted);
        if plan.kept.is_none() {
            additions.push((primary_id, active));
        }
        for &(piece, state) in &plan.remainders {
            additions.push((resolver.resolve(piece), state));
        }
        let mut events = resolver.into_created_events();

        // Every key we add must be free once this transaction's removals apply.
        let mut claimed = HashSet::with_capacity(additions.len());
        for &(interval_id, _) in &additions {
            let taken = guard.contains(interval_id) && !plan.removed.contains(&interval_id);
            if taken || !claimed.insert(interval_id) {
                return Err(EngineError::DuplicateKey {
                    subject,
                    interval_id,
                });
            }
        }

        events.extend(plan.removed.iter().map(|&interval_id| Event::PresenceRemoved {
            subject,
            interval_id,
        }));
        events.extend(
            additions
                .iter()
                .map(|&(interval_id, state)| Event::PresenceAdded {
                    subject,
                    interval_id,
                    active: state,
                }),
        );

        self.commit_to_timeline(&mut pool, &mut guard, events).await?;
        debug!(
            "upsert {subject} [{start}, {end}] active={active}: span [{}, {}] removed={} remainders={}",
            plan.span.start,
            plan.span.end,
            plan.removed.len(),
            plan.remainders.len()
        );

        Ok(StateInterval {
            subject,
            interval_id: primary_id,
            span: plan.span,
            active,
        })
    }

    /// Id of the interval `[start, end]`, creating it if no record has these
    /// exact endpoints yet.
    pub async fn get_or_create_interval(&self, start: Ms, end: Ms) -> Result<Interval, EngineError> {
        let span = validate_range(start, end)?;
        let _gate = self.gate.read().await;
        let mut pool = self.pool.lock().await;
        if let Some(id) = pool.find(&span) {
            return Ok(Interval { id, span });
        }
        let id = pool.reserve_id();
        self.commit_across(&mut pool, vec![Event::IntervalCreated { id, span }])
            .await?;
        Ok(Interval { id, span })
    }

    /// Delete an interval and every presence record on it. Absent ids are a no-op.
    pub async fn delete_interval(&self, id: IntervalId) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let mut pool = self.pool.lock().await;
        if pool.get(id).is_none() {
            return Ok(());
        }
        let mut events: Vec<Event> = pool
            .holders(id)
            .into_iter()
            .map(|subject| Event::PresenceRemoved {
                subject,
                interval_id: id,
            })
            .collect();
        events.push(Event::IntervalDeleted { id });
        self.commit_across(&mut pool, events).await
    }

    /// Delete every interval that nothing references or that is shorter than
    /// the significance threshold, together with the records on it.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let _gate = self.gate.write().await;
        let external = self.external_references().await;
        let mut pool = self.pool.lock().await;

        let garbage = pool.collect_garbage(&external, self.config.min_significant_ms);
        if garbage.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport::default();
        let mut events = Vec::new();
        for interval in &garbage {
            for subject in pool.holders(interval.id) {
                events.push(Event::PresenceRemoved {
                    subject,
                    interval_id: interval.id,
                });
                report.cascaded += 1;
            }
            events.push(Event::IntervalDeleted { id: interval.id });
            report.evicted.push(interval.id);
        }
        self.commit_across(&mut pool, events).await?;

        metrics::counter!(observability::INTERVALS_EVICTED_TOTAL)
            .increment(report.evicted.len() as u64);
        info!(
            "sweep evicted {} intervals, {} presence records",
            report.evicted.len(),
            report.cascaded
        );
        Ok(report)
    }

    /// Delete one presence record, then sweep.
    pub async fn remove_presence(
        &self,
        subject: SubjectKey,
        interval_id: IntervalId,
    ) -> Result<StateInterval, EngineError> {
        let removed = {
            let _gate = self.gate.read().await;
            let tl = self
                .get_timeline(&subject)
                .ok_or(EngineError::PresenceNotFound {
                    subject,
                    interval_id,
                })?;
            let mut guard = tl.write().await;
            let entry = *guard.entry(interval_id).ok_or(EngineError::PresenceNotFound {
                subject,
                interval_id,
            })?;
            let mut pool = self.pool.lock().await;
            self.commit_to_timeline(
                &mut pool,
                &mut guard,
                vec![Event::PresenceRemoved {
                    subject,
                    interval_id,
                }],
            )
            .await?;
            StateInterval::from_entry(subject, &entry)
        };
        self.sweep().await?;
        Ok(removed)
    }

    /// Drop a subject's whole timeline, e.g. when the subject itself is
    /// deleted. Returns how many records went.
    pub async fn clear_subject(&self, subject: SubjectKey) -> Result<usize, EngineError> {
        let count = {
            let _gate = self.gate.read().await;
            let Some(tl) = self.get_timeline(&subject) else {
                return Ok(0);
            };
            let mut guard = tl.write().await;
            if guard.entries.is_empty() {
                return Ok(0);
            }
            let events: Vec<Event> = guard
                .entries
                .iter()
                .map(|e| Event::PresenceRemoved {
                    subject,
                    interval_id: e.interval.id,
                })
                .collect();
            let count = events.len();
            let mut pool = self.pool.lock().await;
            self.commit_to_timeline(&mut pool, &mut guard, events).await?;
            count
        };
        self.sweep().await?;
        Ok(count)
    }

    /// Register a consumer whose interval ids must survive sweeps.
    pub async fn register_refs(&self, source: Arc<dyn IntervalRefs>) -> Result<(), EngineError> {
        let mut refs = self.refs.write().await;
        if refs.len() >= MAX_REFERENCE_SOURCES {
            return Err(EngineError::LimitExceeded("too many reference sources"));
        }
        refs.push(source);
        Ok(())
    }

    async fn external_references(&self) -> HashSet<IntervalId> {
        self.refs
            .read()
            .await
            .iter()
            .flat_map(|source| source.referenced())
            .collect()
    }

    /// Rewrite the WAL as a single transaction recreating the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let pool = self.pool.lock().await;

        let mut events: Vec<Event> = pool
            .intervals()
            .map(|i| Event::IntervalCreated {
                id: i.id,
                span: i.span,
            })
            .collect();
        for (subject, tl) in self.snapshot_timelines() {
            let guard = tl.read().await;
            events.extend(guard.entries.iter().map(|e| Event::PresenceAdded {
                subject,
                interval_id: e.interval.id,
                active: e.active,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                txns: vec![Transaction::new(events)],
                response: tx,
            })
            .await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
            .map_err(EngineError::from)?;
        drop(pool);
        info!("compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
