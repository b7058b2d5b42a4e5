use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the crate uses it.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Time range `[start, end]` with `start < end`.
///
/// Timelines treat spans as half-open when checking that records don't
/// overlap; consolidation treats endpoints as closed so touching spans merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: spans that only share an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap with closed endpoints: touching counts.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Surrogate key of a pooled interval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntervalId(pub u64);

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval#{}", self.0)
    }
}

/// A deduplicated `(start, end)` pair shared by any number of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: IntervalId,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubjectKind {
    Soldier,
    Team,
    RecurringTask,
    TemporaryTask,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 4] = [
        SubjectKind::Soldier,
        SubjectKind::Team,
        SubjectKind::RecurringTask,
        SubjectKind::TemporaryTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Soldier => "Soldier",
            SubjectKind::Team => "Team",
            SubjectKind::RecurringTask => "RecurringTask",
            SubjectKind::TemporaryTask => "TemporaryTask",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SubjectId = u64;

/// Who a timeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl SubjectKey {
    pub fn new(kind: SubjectKind, id: SubjectId) -> Self {
        Self { kind, id }
    }

    pub fn soldier(id: SubjectId) -> Self {
        Self::new(SubjectKind::Soldier, id)
    }

    pub fn team(id: SubjectId) -> Self {
        Self::new(SubjectKind::Team, id)
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// One record of a subject's timeline, with its interval resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    pub interval: Interval,
    pub active: bool,
}

/// Public view of a presence record. Keyed by `(subject, interval_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInterval {
    pub subject: SubjectKey,
    pub interval_id: IntervalId,
    pub span: Span,
    pub active: bool,
}

impl StateInterval {
    pub fn from_entry(subject: SubjectKey, entry: &PresenceEntry) -> Self {
        Self {
            subject,
            interval_id: entry.interval.id,
            span: entry.interval.span,
            active: entry.active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    pub subject: SubjectKey,
    /// Sorted by `interval.span.start`; pairwise non-overlapping between upserts.
    pub entries: Vec<PresenceEntry>,
}

impl Timeline {
    pub fn new(subject: SubjectKey) -> Self {
        Self {
            subject,
            entries: Vec::new(),
        }
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert_entry(&mut self, entry: PresenceEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.interval.span.start, |e| e.interval.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    /// Remove entry by interval id.
    pub fn remove_entry(&mut self, id: IntervalId) -> Option<PresenceEntry> {
        let pos = self.entries.iter().position(|e| e.interval.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn entry(&self, id: IntervalId) -> Option<&PresenceEntry> {
        self.entries.iter().find(|e| e.interval.id == id)
    }

    pub fn contains(&self, id: IntervalId) -> bool {
        self.entry(id).is_some()
    }

    /// State of the record covering `t`, if any.
    pub fn state_at(&self, t: Ms) -> Option<bool> {
        let right_bound = self.entries.partition_point(|e| e.interval.span.start <= t);
        self.entries[..right_bound]
            .iter()
            .rev()
            .find(|e| e.interval.span.contains_instant(t))
            .map(|e| e.active)
    }

    pub fn records(&self) -> impl Iterator<Item = StateInterval> + '_ {
        self.entries
            .iter()
            .map(|e| StateInterval::from_entry(self.subject, e))
    }
}

/// Flat change records. A committed `Transaction` is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    IntervalCreated {
        id: IntervalId,
        span: Span,
    },
    IntervalDeleted {
        id: IntervalId,
    },
    PresenceAdded {
        subject: SubjectKey,
        interval_id: IntervalId,
        active: bool,
    },
    PresenceRemoved {
        subject: SubjectKey,
        interval_id: IntervalId,
    },
}

impl Event {
    pub fn subject(&self) -> Option<SubjectKey> {
        match self {
            Event::PresenceAdded { subject, .. } | Event::PresenceRemoved { subject, .. } => {
                Some(*subject)
            }
            Event::IntervalCreated { .. } | Event::IntervalDeleted { .. } => None,
        }
    }
}

/// Events that commit or vanish together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Ulid,
    pub events: Vec<Event>,
}

impl Transaction {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            id: Ulid::new(),
            events,
        }
    }
}
