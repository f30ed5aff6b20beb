// src/filter/compile.rs

//! Server-side query compilation.
//!
//! A client filter splits into a *time constraint* (used to narrow the
//! candidate scan) and a *residual predicate* (evaluated per target).
//! Folding rules: `created-in-the-past` becomes `CreatedAfter(now − span)`;
//! conjunction takes the max of child constraints, disjunction the min;
//! `not` is pushed through conjunctions via De Morgan. A time form under a
//! `not` that survives normalization yields no constraint — the residual
//! still evaluates it exactly, so the only cost is a wider scan.

use chrono::{DateTime, Utc};

use crate::filter::ast::Filter;

/// Bound on candidate targets, derived from the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeConstraint {
    CreatedAfter(DateTime<Utc>),
}

/// The server-side form of a client filter.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub time: Option<TimeConstraint>,
    pub predicate: Filter,
}

/// Split `filter` into a scan bound and a residual predicate.
pub fn compile(filter: &Filter, now: DateTime<Utc>) -> CompiledQuery {
    let normalized = normalize_not(filter);
    let (time, predicate) = split(&normalized, now);
    CompiledQuery { time, predicate }
}

/// Push `not` through conjunctions and disjunctions (De Morgan) and drop
/// double negations.
fn normalize_not(filter: &Filter) -> Filter {
    match filter {
        Filter::Not(inner) => match inner.as_ref() {
            Filter::Not(x) => normalize_not(x),
            Filter::And(children) => Filter::Or(
                children
                    .iter()
                    .map(|c| normalize_not(&Filter::Not(Box::new(c.clone()))))
                    .collect(),
            ),
            Filter::Or(children) => Filter::And(
                children
                    .iter()
                    .map(|c| normalize_not(&Filter::Not(Box::new(c.clone()))))
                    .collect(),
            ),
            other => Filter::Not(Box::new(normalize_not(other))),
        },
        Filter::And(children) => Filter::And(children.iter().map(normalize_not).collect()),
        Filter::Or(children) => Filter::Or(children.iter().map(normalize_not).collect()),
        other => other.clone(),
    }
}

fn split(filter: &Filter, now: DateTime<Utc>) -> (Option<TimeConstraint>, Filter) {
    match filter {
        Filter::CreatedInThePast(span) => {
            let bound = now - span.to_duration();
            // Fully captured by the constraint.
            (Some(TimeConstraint::CreatedAfter(bound)), Filter::All)
        }
        Filter::And(children) => {
            let mut bound: Option<DateTime<Utc>> = None;
            let mut residuals = Vec::new();
            for child in children {
                let (time, residual) = split(child, now);
                if let Some(TimeConstraint::CreatedAfter(t)) = time {
                    bound = Some(match bound {
                        // Conjunction: the latest bound wins.
                        Some(current) => current.max(t),
                        None => t,
                    });
                }
                if residual != Filter::All {
                    residuals.push(residual);
                }
            }
            let predicate = match residuals.len() {
                0 => Filter::All,
                1 => residuals.swap_remove(0),
                _ => Filter::And(residuals),
            };
            (bound.map(TimeConstraint::CreatedAfter), predicate)
        }
        Filter::Or(children) => {
            // A disjunct without a constraint makes the whole `or`
            // unbounded; otherwise the earliest bound is safe.
            let mut bound: Option<DateTime<Utc>> = None;
            let mut all_bounded = true;
            for child in children {
                match split(child, now).0 {
                    Some(TimeConstraint::CreatedAfter(t)) => {
                        bound = Some(match bound {
                            Some(current) => current.min(t),
                            None => t,
                        });
                    }
                    None => all_bounded = false,
                }
            }
            let time = if all_bounded {
                bound.map(TimeConstraint::CreatedAfter)
            } else {
                None
            };
            // Residuals cannot be folded out of a disjunction: an old
            // target may still match a sibling branch. Keep the original.
            (time, filter.clone())
        }
        // Negation never yields a usable bound (open question preserved:
        // conservatively no constraint).
        Filter::Not(_) => (None, filter.clone()),
        other => (None, other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ast::{Pred, Span, StatusFilter};
    use crate::filter::parser::parse_filter;

    fn at(now: DateTime<Utc>, filter: &str) -> CompiledQuery {
        compile(&parse_filter(filter).unwrap(), now)
    }

    #[test]
    fn plain_time_folds_completely() {
        let now = Utc::now();
        let q = at(now, "(created-in-the-past (hours 2))");
        assert_eq!(
            q.time,
            Some(TimeConstraint::CreatedAfter(now - chrono::Duration::hours(2)))
        );
        assert_eq!(q.predicate, Filter::All);
    }

    #[test]
    fn conjunction_takes_max_and_keeps_residual() {
        let now = Utc::now();
        let q = at(
            now,
            "(and (created-in-the-past (weeks 4)) (not (is-dependency-dead)))",
        );
        assert_eq!(
            q.time,
            Some(TimeConstraint::CreatedAfter(
                now - chrono::Duration::days(28)
            ))
        );
        assert_eq!(
            q.predicate,
            Filter::Not(Box::new(Filter::Status(StatusFilter::DependencyDead)))
        );
    }

    #[test]
    fn tighter_bound_wins_in_conjunction() {
        let now = Utc::now();
        let q = at(
            now,
            "(and (created-in-the-past (weeks 4)) (created-in-the-past (days 2)))",
        );
        assert_eq!(
            q.time,
            Some(TimeConstraint::CreatedAfter(now - chrono::Duration::days(2)))
        );
        assert_eq!(q.predicate, Filter::All);
    }

    #[test]
    fn disjunction_takes_min_only_when_all_bounded() {
        let now = Utc::now();
        let q = at(
            now,
            "(or (created-in-the-past (days 2)) (created-in-the-past (weeks 1)))",
        );
        assert_eq!(
            q.time,
            Some(TimeConstraint::CreatedAfter(now - chrono::Duration::days(7)))
        );

        let q = at(now, "(or (created-in-the-past (days 2)) (is-failed))");
        assert_eq!(q.time, None);
    }

    #[test]
    fn not_pushes_through_conjunctions() {
        let now = Utc::now();
        let q = at(now, "(not (and (is-failed) (name \"x\")))");
        assert_eq!(q.time, None);
        assert_eq!(
            q.predicate,
            Filter::Or(vec![
                Filter::Not(Box::new(Filter::Status(StatusFilter::Failed))),
                Filter::Not(Box::new(Filter::Name(Pred::Equals("x".to_string())))),
            ])
        );
    }

    #[test]
    fn negated_time_gives_no_constraint() {
        let now = Utc::now();
        let q = at(now, "(not (created-in-the-past (days 2)))");
        assert_eq!(q.time, None);
        assert_eq!(
            q.predicate,
            Filter::Not(Box::new(Filter::CreatedInThePast(Span::Days(2.0))))
        );
    }
}
