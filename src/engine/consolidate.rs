use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Turn caller-supplied bounds into a span, rejecting degenerate and
/// out-of-range input before anything is read or written.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidRange { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// How an incoming span cuts into an existing record of the opposite state.
/// Boundary ties go to the incoming span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cut {
    /// `new.start <= old.start && old.end <= new.end`: nothing of the old record survives.
    Erase,
    /// `old.start <= new.start && new.end <= old.end`: old keeps a head and a tail.
    Split,
    /// `new.start <= old.start <= new.end <= old.end`: old keeps `[new.end, old.end]`.
    TrimStart,
    /// `old.start <= new.start <= old.end <= new.end`: old keeps `[old.start, new.start]`.
    TrimEnd,
}

/// `None` when the spans don't even touch.
pub fn classify(new: &Span, old: &Span) -> Option<Cut> {
    if !new.touches(old) {
        return None;
    }
    let cut = if new.start <= old.start && old.end <= new.end {
        Cut::Erase
    } else if old.start <= new.start && new.end <= old.end {
        Cut::Split
    } else if new.start <= old.start {
        Cut::TrimStart
    } else {
        Cut::TrimEnd
    };
    Some(cut)
}

/// What is left of `old` after `new` claims its range. Empty pieces are dropped.
pub fn remainders(new: &Span, old: &Span, cut: Cut) -> Vec<Span> {
    match cut {
        Cut::Erase => Vec::new(),
        Cut::Split => [
            Span::try_new(old.start, new.start),
            Span::try_new(new.end, old.end),
        ]
        .into_iter()
        .flatten()
        .collect(),
        Cut::TrimStart => Span::try_new(new.end, old.end).into_iter().collect(),
        Cut::TrimEnd => Span::try_new(old.start, new.start).into_iter().collect(),
    }
}

/// The full diff an upsert applies to one timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// The inserted span after absorbing every same-state record it touches.
    pub span: Span,
    pub active: bool,
    /// Existing record that already is `(span, active)`; nothing to insert for it.
    pub kept: Option<IntervalId>,
    /// Existing records to delete.
    pub removed: Vec<IntervalId>,
    /// Surviving pieces of opposite-state records, with the state they had.
    pub remainders: Vec<(Span, bool)>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.kept.is_some() && self.removed.is_empty() && self.remainders.is_empty()
    }
}

/// Reconcile `(span, active)` against a snapshot of a subject's records.
///
/// Same-state records that touch the span are unioned into it until nothing
/// else touches (one pass per growth step, so at most `existing.len()` passes).
/// Opposite-state records are then cut by the final span.
pub fn plan_upsert(existing: &[PresenceEntry], span: Span, active: bool) -> Plan {
    let mut merged = span;
    let mut absorbed = vec![false; existing.len()];
    loop {
        let mut grew = false;
        for (i, e) in existing.iter().enumerate() {
            if !absorbed[i] && e.active == active && merged.touches(&e.interval.span) {
                merged = merged.union(&e.interval.span);
                absorbed[i] = true;
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    debug_assert!(merged.contains_span(&span));

    let mut plan = Plan {
        span: merged,
        active,
        kept: None,
        removed: Vec::new(),
        remainders: Vec::new(),
    };

    for (i, e) in existing.iter().enumerate() {
        let old = e.interval.span;
        if absorbed[i] {
            if old == merged && plan.kept.is_none() {
                plan.kept = Some(e.interval.id);
            } else {
                plan.removed.push(e.interval.id);
            }
            continue;
        }
        if e.active == active {
            continue;
        }
        let Some(cut) = classify(&merged, &old) else {
            continue;
        };
        let rest = remainders(&merged, &old, cut);
        if rest == [old] {
            // Only touches at a boundary
            continue;
        }
        plan.removed.push(e.interval.id);
        plan.remainders
            .extend(rest.into_iter().map(|piece| (piece, e.active)));
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn entry(id: u64, start: Ms, end: Ms, active: bool) -> PresenceEntry {
        PresenceEntry {
            interval: Interval {
                id: IntervalId(id),
                span: Span::new(start, end),
            },
            active,
        }
    }

    /// Replay a plan against the snapshot, returning the resulting timeline
    /// as sorted `(span, active)` pairs.
    fn apply(existing: &[PresenceEntry], plan: &Plan) -> Vec<(Span, bool)> {
        let mut out: Vec<(Span, bool)> = existing
            .iter()
            .filter(|e| !plan.removed.contains(&e.interval.id))
            .map(|e| (e.interval.span, e.active))
            .collect();
        if plan.kept.is_none() {
            out.push((plan.span, plan.active));
        }
        out.extend(plan.remainders.iter().copied());
        out.sort_by_key(|(s, _)| s.start);
        out
    }

    fn assert_disjoint(timeline: &[(Span, bool)]) {
        for pair in timeline.windows(2) {
            assert!(
                !pair[0].0.overlaps(&pair[1].0),
                "overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    // ── validate_range ────────────────────────────────────

    #[test]
    fn validate_rejects_degenerate() {
        assert!(matches!(
            validate_range(10 * H, 10 * H),
            Err(EngineError::InvalidRange { .. })
        ));
        assert!(matches!(
            validate_range(11 * H, 10 * H),
            Err(EngineError::InvalidRange { .. })
        ));
        assert_eq!(validate_range(10 * H, 11 * H).unwrap(), Span::new(10 * H, 11 * H));
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(matches!(
            validate_range(-5, 10),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_range(0, MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    // ── classify / remainders ─────────────────────────────

    #[test]
    fn classify_disjoint() {
        assert_eq!(classify(&Span::new(0, 10), &Span::new(11, 20)), None);
        assert_eq!(classify(&Span::new(21, 30), &Span::new(11, 20)), None);
    }

    #[test]
    fn classify_four_cases() {
        let old = Span::new(100, 200);
        assert_eq!(classify(&Span::new(50, 250), &old), Some(Cut::Erase));
        assert_eq!(classify(&Span::new(100, 200), &old), Some(Cut::Erase));
        assert_eq!(classify(&Span::new(120, 180), &old), Some(Cut::Split));
        assert_eq!(classify(&Span::new(50, 150), &old), Some(Cut::TrimStart));
        assert_eq!(classify(&Span::new(150, 250), &old), Some(Cut::TrimEnd));
    }

    #[test]
    fn classify_touching_keeps_old_whole() {
        let old = Span::new(100, 200);
        let before = Span::new(50, 100);
        let after = Span::new(200, 300);
        let cut = classify(&before, &old).unwrap();
        assert_eq!(remainders(&before, &old, cut), vec![old]);
        let cut = classify(&after, &old).unwrap();
        assert_eq!(remainders(&after, &old, cut), vec![old]);
    }

    #[test]
    fn split_sharing_an_endpoint_leaves_one_piece() {
        let old = Span::new(100, 200);
        let new = Span::new(100, 150);
        // Same start: Erase doesn't apply, Split does with an empty head
        assert_eq!(classify(&new, &old), Some(Cut::Split));
        assert_eq!(remainders(&new, &old, Cut::Split), vec![Span::new(150, 200)]);
    }

    // ── plan_upsert ───────────────────────────────────────

    #[test]
    fn empty_timeline_inserts_as_is() {
        let plan = plan_upsert(&[], Span::new(10 * H, 11 * H), true);
        assert_eq!(plan.span, Span::new(10 * H, 11 * H));
        assert_eq!(plan.kept, None);
        assert!(plan.removed.is_empty());
        assert!(plan.remainders.is_empty());
    }

    #[test]
    fn same_state_reinsert_is_noop() {
        let existing = [entry(1, 10 * H, 11 * H, true)];
        let plan = plan_upsert(&existing, Span::new(10 * H, 11 * H), true);
        assert!(plan.is_noop());
        assert_eq!(plan.kept, Some(IntervalId(1)));
    }

    #[test]
    fn same_state_inside_existing_keeps_it() {
        let existing = [entry(1, 10 * H, 12 * H, true)];
        let plan = plan_upsert(&existing, Span::new(10 * H + 30 * M, 11 * H), true);
        assert!(plan.is_noop());
        assert_eq!(plan.span, Span::new(10 * H, 12 * H));
    }

    #[test]
    fn union_merge() {
        let existing = [entry(1, 10 * H, 11 * H, true)];
        let plan = plan_upsert(&existing, Span::new(10 * H + 30 * M, 11 * H + 30 * M), true);
        assert_eq!(plan.span, Span::new(10 * H, 11 * H + 30 * M));
        assert_eq!(plan.removed, vec![IntervalId(1)]);
        assert_eq!(
            apply(&existing, &plan),
            vec![(Span::new(10 * H, 11 * H + 30 * M), true)]
        );
    }

    #[test]
    fn touching_same_state_merges() {
        let existing = [entry(1, 10 * H, 11 * H, true)];
        let plan = plan_upsert(&existing, Span::new(11 * H, 12 * H), true);
        assert_eq!(plan.span, Span::new(10 * H, 12 * H));
        assert_eq!(plan.removed, vec![IntervalId(1)]);
    }

    #[test]
    fn union_grows_transitively() {
        // The bridge only reaches the last record once it has absorbed the middle one
        let existing = [
            entry(3, 14 * H, 15 * H, true),
            entry(1, 10 * H, 11 * H, true),
            entry(2, 12 * H, 13 * H, true),
        ];
        let plan = plan_upsert(&existing, Span::new(11 * H, 12 * H), true);
        assert_eq!(plan.span, Span::new(10 * H, 13 * H));
        assert_eq!(plan.removed.len(), 2);
        assert!(!plan.removed.contains(&IntervalId(3)));

        let chain = [
            entry(3, 13 * H, 14 * H, true),
            entry(2, 12 * H, 13 * H, true),
            entry(1, 10 * H, 11 * H, true),
        ];
        let plan = plan_upsert(&chain, Span::new(11 * H, 12 * H), true);
        assert_eq!(plan.span, Span::new(10 * H, 14 * H));
        assert_eq!(plan.removed.len(), 3);
    }

    #[test]
    fn full_override_erases_old() {
        let existing = [entry(1, 10 * H, 11 * H, true)];
        let plan = plan_upsert(&existing, Span::new(9 * H, 12 * H), false);
        assert_eq!(plan.removed, vec![IntervalId(1)]);
        assert!(plan.remainders.is_empty());
        assert_eq!(apply(&existing, &plan), vec![(Span::new(9 * H, 12 * H), false)]);
    }

    #[test]
    fn split_in_the_middle() {
        let existing = [entry(1, 10 * H, 12 * H, true)];
        let plan = plan_upsert(&existing, Span::new(10 * H + 30 * M, 11 * H), false);
        assert_eq!(
            apply(&existing, &plan),
            vec![
                (Span::new(10 * H, 10 * H + 30 * M), true),
                (Span::new(10 * H + 30 * M, 11 * H), false),
                (Span::new(11 * H, 12 * H), true),
            ]
        );
    }

    #[test]
    fn partial_cut_of_old_end() {
        let existing = [entry(1, 10 * H, 12 * H, true)];
        let plan = plan_upsert(&existing, Span::new(11 * H, 13 * H), false);
        assert_eq!(
            apply(&existing, &plan),
            vec![
                (Span::new(10 * H, 11 * H), true),
                (Span::new(11 * H, 13 * H), false),
            ]
        );
    }

    #[test]
    fn partial_cut_of_old_start() {
        let existing = [entry(1, 10 * H, 12 * H, true)];
        let plan = plan_upsert(&existing, Span::new(9 * H, 11 * H), false);
        assert_eq!(
            apply(&existing, &plan),
            vec![
                (Span::new(9 * H, 11 * H), false),
                (Span::new(11 * H, 12 * H), true),
            ]
        );
    }

    #[test]
    fn touching_opposite_state_is_left_alone() {
        let existing = [entry(1, 10 * H, 11 * H, true)];
        let plan = plan_upsert(&existing, Span::new(11 * H, 12 * H), false);
        assert!(plan.removed.is_empty());
        assert!(plan.remainders.is_empty());
        assert_eq!(plan.span, Span::new(11 * H, 12 * H));
    }

    #[test]
    fn merge_and_cut_together() {
        // inactive [8,9], active [9,10], inactive [10,12]; insert inactive [9:30,11]
        let existing = [
            entry(1, 8 * H, 9 * H, false),
            entry(2, 9 * H, 10 * H, true),
            entry(3, 10 * H, 12 * H, false),
        ];
        let plan = plan_upsert(&existing, Span::new(9 * H + 30 * M, 11 * H), false);
        let result = apply(&existing, &plan);
        assert_eq!(
            result,
            vec![
                (Span::new(8 * H, 9 * H), false),
                (Span::new(9 * H, 9 * H + 30 * M), true),
                (Span::new(9 * H + 30 * M, 12 * H), false),
            ]
        );
        assert_disjoint(&result);
    }

    #[test]
    fn widened_span_trims_far_neighbour() {
        // Absorbing active [10,12] pulls the start back to 10; the inactive
        // neighbour on the left is only touched, the one on the right is trimmed.
        let existing = [
            entry(1, 9 * H, 10 * H, false),
            entry(2, 10 * H, 12 * H, true),
            entry(3, 12 * H, 14 * H, false),
        ];
        let plan = plan_upsert(&existing, Span::new(11 * H, 13 * H), true);
        let result = apply(&existing, &plan);
        assert_eq!(
            result,
            vec![
                (Span::new(9 * H, 10 * H), false),
                (Span::new(10 * H, 13 * H), true),
                (Span::new(13 * H, 14 * H), false),
            ]
        );
    }

    #[test]
    fn many_opposite_records_inside_are_erased() {
        let existing = [
            entry(1, 10 * H, 11 * H, false),
            entry(2, 11 * H, 12 * H, true),
            entry(3, 12 * H, 13 * H, false),
        ];
        let plan = plan_upsert(&existing, Span::new(9 * H, 14 * H), true);
        assert_eq!(apply(&existing, &plan), vec![(Span::new(9 * H, 14 * H), true)]);
    }

    #[test]
    fn result_does_not_depend_on_snapshot_order() {
        let mut existing = vec![
            entry(1, 8 * H, 9 * H, true),
            entry(2, 9 * H, 10 * H, false),
            entry(3, 10 * H, 11 * H, true),
            entry(4, 11 * H, 13 * H, false),
            entry(5, 13 * H, 14 * H, true),
        ];
        let span = Span::new(9 * H + 30 * M, 12 * H);
        let forward = apply(&existing, &plan_upsert(&existing, span, true));
        existing.reverse();
        let backward = apply(&existing, &plan_upsert(&existing, span, true));
        assert_eq!(forward, backward);
        assert_disjoint(&forward);
    }
}
