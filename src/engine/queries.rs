use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    // ── Interval pool ────────────────────────────────────────

    pub async fn get_interval(&self, id: IntervalId) -> Result<Interval, EngineError> {
        self.pool
            .lock()
            .await
            .get(id)
            .ok_or(EngineError::IntervalNotFound(id))
    }

    /// Every live interval, ordered by id.
    pub async fn intervals(&self) -> Vec<Interval> {
        self.pool.lock().await.intervals().collect()
    }

    pub async fn interval_count(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Subjects with a presence record on `id`.
    pub async fn interval_holders(&self, id: IntervalId) -> Vec<SubjectKey> {
        self.pool.lock().await.holders(id)
    }

    // ── Presence records ─────────────────────────────────────

    /// A subject's records ordered by start. Empty for unknown subjects.
    pub async fn timeline(&self, subject: SubjectKey) -> Vec<StateInterval> {
        let Some(tl) = self.get_timeline(&subject) else {
            return Vec::new();
        };
        let guard = tl.read().await;
        guard.records().collect()
    }

    pub async fn get_presence(
        &self,
        subject: SubjectKey,
        interval_id: IntervalId,
    ) -> Result<StateInterval, EngineError> {
        let not_found = || EngineError::PresenceNotFound {
            subject,
            interval_id,
        };
        let tl = self.get_timeline(&subject).ok_or_else(not_found)?;
        let guard = tl.read().await;
        guard
            .entry(interval_id)
            .map(|e| StateInterval::from_entry(subject, e))
            .ok_or_else(not_found)
    }

    /// Records of one subject matching `pred`, ordered by start.
    pub async fn presence_where<F>(&self, subject: SubjectKey, pred: F) -> Vec<StateInterval>
    where
        F: Fn(&StateInterval) -> bool,
    {
        let Some(tl) = self.get_timeline(&subject) else {
            return Vec::new();
        };
        let guard = tl.read().await;
        guard.records().filter(|r| pred(r)).collect()
    }

    /// Records of every subject matching `pred`, ordered by subject, then start.
    pub async fn presence_all_where<F>(&self, pred: F) -> Vec<StateInterval>
    where
        F: Fn(&StateInterval) -> bool,
    {
        let mut out = Vec::new();
        for (_, tl) in self.snapshot_timelines() {
            let guard = tl.read().await;
            out.extend(guard.records().filter(|r| pred(r)));
        }
        out
    }

    /// `Some(active)` if a record of `subject` covers instant `t`.
    pub async fn state_at(&self, subject: SubjectKey, t: Ms) -> Option<bool> {
        let tl = self.get_timeline(&subject)?;
        let guard = tl.read().await;
        guard.state_at(t)
    }

    /// Ids of every subject of `kind` whose record at `t` has the given state,
    /// ascending. Subjects with no record at `t` are in neither list.
    pub async fn subjects_in_state(&self, kind: SubjectKind, t: Ms, active: bool) -> Vec<SubjectId> {
        let mut ids = Vec::new();
        for (subject, tl) in self.snapshot_timelines() {
            if subject.kind != kind {
                continue;
            }
            if tl.read().await.state_at(t) == Some(active) {
                ids.push(subject.id);
            }
        }
        ids
    }

    /// Subjects that currently have at least one record, sorted.
    pub async fn subjects(&self) -> Vec<SubjectKey> {
        let mut out = Vec::new();
        for (subject, tl) in self.snapshot_timelines() {
            if !tl.read().await.entries.is_empty() {
                out.push(subject);
            }
        }
        out
    }
}
