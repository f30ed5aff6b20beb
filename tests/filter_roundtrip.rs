// tests/filter_roundtrip.rs

//! Property: for every well-formed AST `a`, `parse(print(a)) == a`.
//! (Aliases and bare-string sugar expand at parse time, so the canonical
//! printer's output always reparses to the identical AST.)

use proptest::prelude::*;

use gridflow::filter::{parse_filter, Filter, Pred, Span, StatusFilter};

fn status_strategy() -> impl Strategy<Value = StatusFilter> {
    prop::sample::select(vec![
        StatusFilter::Activable,
        StatusFilter::InProgress,
        StatusFilter::Successful,
        StatusFilter::Failed,
        StatusFilter::ReallyRunning,
        StatusFilter::Killable,
        StatusFilter::DependencyDead,
        StatusFilter::ActivatedByUser,
        StatusFilter::KilledFromPassive,
        StatusFilter::FailedFromRunning,
        StatusFilter::FailedFromStarting,
        StatusFilter::FailedFromCondition,
    ])
}

fn span_strategy() -> impl Strategy<Value = Span> {
    // Dyadic fractions print and reparse exactly.
    (0u32..80_000, 0..3u8).prop_map(|(n, unit)| {
        let value = f64::from(n) / 8.0;
        match unit {
            0 => Span::Hours(value),
            1 => Span::Days(value),
            _ => Span::Weeks(value),
        }
    })
}

fn pred_strategy() -> impl Strategy<Value = Pred> {
    prop_oneof![
        // Arbitrary printable ASCII exercises the string escaping.
        "[ -~]{0,12}".prop_map(Pred::Equals),
        // Regex predicates must be valid patterns to parse back.
        "[a-z]{1,6}".prop_map(Pred::Re),
    ]
}

fn filter_strategy() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        Just(Filter::All),
        status_strategy().prop_map(Filter::Status),
        span_strategy().prop_map(Filter::CreatedInThePast),
        pred_strategy().prop_map(Filter::Name),
        pred_strategy().prop_map(Filter::Id),
        prop::collection::vec(pred_strategy(), 1..3).prop_map(Filter::Tags),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::And),
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::Or),
            inner.prop_map(|f| Filter::Not(Box::new(f))),
        ]
    })
}

proptest! {
    #[test]
    fn parse_print_roundtrip(filter in filter_strategy()) {
        let printed = filter.to_string();
        let reparsed = parse_filter(&printed)
            .unwrap_or_else(|e| panic!("printed form failed to parse: {printed:?}: {e}"));
        prop_assert_eq!(reparsed, filter);
    }

    #[test]
    fn printing_is_stable(filter in filter_strategy()) {
        // print ∘ parse ∘ print is a fixpoint.
        let printed = filter.to_string();
        let reparsed = parse_filter(&printed).unwrap();
        prop_assert_eq!(reparsed.to_string(), printed);
    }
}
