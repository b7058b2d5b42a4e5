use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::*;

/// Deduplicated pool of interval records shared by every timeline.
///
/// Callers hold `IntervalId`s, never references into the pool. Each distinct
/// `(start, end)` pair maps to exactly one id. `holders` is the reverse index
/// of which subjects have a presence record on an interval.
pub struct IntervalStore {
    intervals: BTreeMap<IntervalId, Span>,
    by_span: HashMap<Span, IntervalId>,
    holders: HashMap<IntervalId, HashSet<SubjectKey>>,
    next_id: u64,
}

impl Default for IntervalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalStore {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
            by_span: HashMap::new(),
            holders: HashMap::new(),
            next_id: 1,
        }
    }

    // ── Interval records ─────────────────────────────────────

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn get(&self, id: IntervalId) -> Option<Interval> {
        self.intervals.get(&id).map(|&span| Interval { id, span })
    }

    /// Id of the interval with exactly these endpoints.
    pub fn find(&self, span: &Span) -> Option<IntervalId> {
        self.by_span.get(span).copied()
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals
            .iter()
            .map(|(&id, &span)| Interval { id, span })
    }

    /// Hand out an id for a record that will be created by a pending commit.
    pub fn reserve_id(&mut self) -> IntervalId {
        let id = IntervalId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: IntervalId, span: Span) {
        self.intervals.insert(id, span);
        self.by_span.insert(span, id);
        self.next_id = self.next_id.max(id.0 + 1);
    }

    pub fn remove(&mut self, id: IntervalId) -> Option<Span> {
        let span = self.intervals.remove(&id)?;
        if self.by_span.get(&span) == Some(&id) {
            self.by_span.remove(&span);
        }
        self.holders.remove(&id);
        Some(span)
    }

    // ── Holder index ─────────────────────────────────────────

    pub fn add_holder(&mut self, id: IntervalId, subject: SubjectKey) {
        self.holders.entry(id).or_default().insert(subject);
    }

    pub fn remove_holder(&mut self, id: IntervalId, subject: &SubjectKey) {
        if let Some(subjects) = self.holders.get_mut(&id) {
            subjects.remove(subject);
            if subjects.is_empty() {
                self.holders.remove(&id);
            }
        }
    }

    /// Subjects with a presence record on `id`, sorted.
    pub fn holders(&self, id: IntervalId) -> Vec<SubjectKey> {
        let mut subjects: Vec<SubjectKey> = self
            .holders
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        subjects.sort();
        subjects
    }

    pub fn is_held(&self, id: IntervalId) -> bool {
        self.holders.get(&id).is_some_and(|s| !s.is_empty())
    }

    // ── Garbage selection ────────────────────────────────────

    /// Intervals the sweep should delete: nobody references them (neither a
    /// presence record nor an id in `external`), or they are shorter than
    /// `min_significant_ms` regardless of references.
    pub fn collect_garbage(&self, external: &HashSet<IntervalId>, min_significant_ms: Ms) -> Vec<Interval> {
        self.intervals()
            .filter(|i| {
                let referenced = self.is_held(i.id) || external.contains(&i.id);
                !referenced || i.span.duration_ms() < min_significant_ms
            })
            .collect()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::IntervalCreated { id, span } => self.insert(*id, *span),
            Event::IntervalDeleted { id } => {
                self.remove(*id);
            }
            Event::PresenceAdded {
                subject,
                interval_id,
                ..
            } => self.add_holder(*interval_id, *subject),
            Event::PresenceRemoved {
                subject,
                interval_id,
            } => self.remove_holder(*interval_id, subject),
        }
    }
}

/// Maps spans to ids for one pending transaction, reserving ids for spans the
/// pool doesn't have yet. Nothing is inserted until the commit is applied.
pub(super) struct SpanResolver<'a> {
    store: &'a mut IntervalStore,
    fresh: Vec<Interval>,
}

impl<'a> SpanResolver<'a> {
    pub(super) fn new(store: &'a mut IntervalStore) -> Self {
        Self {
            store,
            fresh: Vec::new(),
        }
    }

    pub(super) fn resolve(&mut self, span: Span) -> IntervalId {
        if let Some(id) = self.store.find(&span) {
            return id;
        }
        if let Some(pending) = self.fresh.iter().find(|i| i.span == span) {
            return pending.id;
        }
        let id = self.store.reserve_id();
        self.fresh.push(Interval { id, span });
        id
    }

    /// `IntervalCreated` events for every reserved id, in reservation order.
    pub(super) fn into_created_events(self) -> Vec<Event> {
        self.fresh
            .into_iter()
            .map(|i| Event::IntervalCreated {
                id: i.id,
                span: i.span,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(spans: &[(Ms, Ms)]) -> (IntervalStore, Vec<IntervalId>) {
        let mut store = IntervalStore::new();
        let ids = spans
            .iter()
            .map(|&(s, e)| {
                let id = store.reserve_id();
                store.insert(id, Span::new(s, e));
                id
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn find_by_exact_endpoints() {
        let (store, ids) = store_with(&[(0, 100), (100, 200)]);
        assert_eq!(store.find(&Span::new(0, 100)), Some(ids[0]));
        assert_eq!(store.find(&Span::new(0, 101)), None);
        assert_eq!(store.get(ids[1]).unwrap().span, Span::new(100, 200));
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let (mut store, ids) = store_with(&[(0, 100)]);
        assert!(store.remove(IntervalId(999)).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.remove(ids[0]), Some(Span::new(0, 100)));
        assert!(store.is_empty());
        assert_eq!(store.find(&Span::new(0, 100)), None);
    }

    #[test]
    fn insert_advances_next_id_past_replayed_ids() {
        let mut store = IntervalStore::new();
        store.insert(IntervalId(41), Span::new(0, 10));
        assert_eq!(store.reserve_id(), IntervalId(42));
    }

    #[test]
    fn holder_index_tracks_subjects() {
        let (mut store, ids) = store_with(&[(0, 100)]);
        let a = SubjectKey::soldier(1);
        let b = SubjectKey::team(2);
        store.add_holder(ids[0], b);
        store.add_holder(ids[0], a);
        assert_eq!(store.holders(ids[0]), vec![a, b]);
        store.remove_holder(ids[0], &a);
        store.remove_holder(ids[0], &b);
        assert!(!store.is_held(ids[0]));
        assert!(store.holders(ids[0]).is_empty());
    }

    #[test]
    fn garbage_includes_unreferenced() {
        let (mut store, ids) = store_with(&[(0, 600_000), (600_000, 1_200_000)]);
        store.add_holder(ids[0], SubjectKey::soldier(1));
        let garbage = store.collect_garbage(&HashSet::new(), MINUTE_MS);
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].id, ids[1]);
    }

    #[test]
    fn garbage_respects_external_references() {
        let (store, ids) = store_with(&[(0, 600_000)]);
        let external: HashSet<IntervalId> = [ids[0]].into_iter().collect();
        assert!(store.collect_garbage(&external, MINUTE_MS).is_empty());
    }

    #[test]
    fn garbage_includes_insignificant_even_if_held() {
        let (mut store, ids) = store_with(&[(0, 30_000), (30_000, 600_000)]);
        store.add_holder(ids[0], SubjectKey::soldier(1));
        store.add_holder(ids[1], SubjectKey::soldier(1));
        let garbage = store.collect_garbage(&HashSet::new(), MINUTE_MS);
        assert_eq!(garbage, vec![Interval { id: ids[0], span: Span::new(0, 30_000) }]);
        // A zero threshold disables the duration rule
        assert!(store.collect_garbage(&HashSet::new(), 0).is_empty());
    }

    #[test]
    fn resolver_reuses_existing_and_pending() {
        let (mut store, ids) = store_with(&[(0, 100)]);
        let mut resolver = SpanResolver::new(&mut store);
        assert_eq!(resolver.resolve(Span::new(0, 100)), ids[0]);
        let fresh = resolver.resolve(Span::new(100, 200));
        assert_eq!(resolver.resolve(Span::new(100, 200)), fresh);
        let events = resolver.into_created_events();
        assert_eq!(
            events,
            vec![Event::IntervalCreated {
                id: fresh,
                span: Span::new(100, 200)
            }]
        );
        // Reserved but not yet inserted
        assert_eq!(store.find(&Span::new(100, 200)), None);
    }

    #[test]
    fn apply_event_maintains_pool_and_holders() {
        let mut store = IntervalStore::new();
        let subject = SubjectKey::soldier(5);
        store.apply_event(&Event::IntervalCreated {
            id: IntervalId(1),
            span: Span::new(0, 100),
        });
        store.apply_event(&Event::PresenceAdded {
            subject,
            interval_id: IntervalId(1),
            active: true,
        });
        assert!(store.is_held(IntervalId(1)));
        store.apply_event(&Event::PresenceRemoved {
            subject,
            interval_id: IntervalId(1),
        });
        store.apply_event(&Event::IntervalDeleted { id: IntervalId(1) });
        assert!(store.is_empty());
        assert!(!store.is_held(IntervalId(1)));
    }
}
