// src/filter/eval.rs

//! Filter evaluation against stored targets.

use chrono::{DateTime, Utc};

use crate::filter::ast::{Filter, StatusFilter};
use crate::target::{SimpleState, State, Target};

/// Does `target` match `filter` at time `now`?
pub fn eval(filter: &Filter, target: &Target, now: DateTime<Utc>) -> bool {
    match filter {
        Filter::All => true,
        Filter::Status(status) => eval_status(*status, target),
        Filter::CreatedInThePast(span) => target.created_at() >= now - span.to_duration(),
        Filter::And(children) => children.iter().all(|c| eval(c, target, now)),
        Filter::Or(children) => children.iter().any(|c| eval(c, target, now)),
        Filter::Not(inner) => !eval(inner, target, now),
        Filter::Name(pred) => pred.matches(&target.name),
        Filter::Id(pred) => pred.matches(&target.id),
        Filter::Tags(preds) => preds
            .iter()
            .all(|pred| target.tags.iter().any(|tag| pred.matches(tag))),
    }
}

fn eval_status(status: StatusFilter, target: &Target) -> bool {
    match status {
        StatusFilter::Activable => target.simple_state() == SimpleState::Activable,
        StatusFilter::InProgress => target.simple_state() == SimpleState::InProgress,
        StatusFilter::Successful => target.simple_state() == SimpleState::Successful,
        StatusFilter::Failed => target.simple_state() == SimpleState::Failed,
        StatusFilter::ReallyRunning => target.state().is_running_family(),
        StatusFilter::Killable => target.killable(),
        StatusFilter::DependencyDead => {
            matches!(target.state(), State::DeadBecauseOfDependencies { .. })
        }
        StatusFilter::ActivatedByUser => target.activated_by_user(),
        StatusFilter::KilledFromPassive => matches!(target.state(), State::KilledFromPassive),
        StatusFilter::FailedFromRunning => matches!(target.state(), State::FailedToRun { .. }),
        StatusFilter::FailedFromStarting => {
            matches!(target.state(), State::FailedToStart { .. })
        }
        StatusFilter::FailedFromCondition => matches!(target.state(), State::FailedFromCondition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parser::parse_filter;
    use crate::host::Host;
    use crate::target::BuildProcess;

    fn check(filter: &str, target: &Target) -> bool {
        eval(&parse_filter(filter).unwrap(), target, Utc::now())
    }

    fn sample() -> Target {
        let mut t = Target::new("index-genome", Host::Localhost, BuildProcess::NoOperation);
        t.tags.insert("urgent".to_string());
        t.tags.insert("team-blue".to_string());
        t
    }

    #[test]
    fn status_filters() {
        let mut t = sample();
        assert!(check("(is-activable)", &t));
        assert!(check("(is-killable)", &t));
        assert!(!check("(is-failed)", &t));

        t.push_state(State::Active { by_user: true });
        t.push_state(State::TriedToStart { attempt: 1 });
        t.push_state(State::StartedRunning);
        assert!(check("(is-in-progress)", &t));
        assert!(check("(is-really-running)", &t));
        assert!(check("(is-activated-by-user)", &t));

        t.push_state(State::FailedToRun {
            reason: "exit 2".to_string(),
        });
        assert!(check("(is-failed)", &t));
        assert!(check("(failed-from-running)", &t));
        assert!(!check("(failed-from-condition)", &t));
        assert!(!check("(is-killable)", &t));
    }

    #[test]
    fn name_id_and_tags() {
        let t = sample();
        assert!(check("(name (equals \"index-genome\"))", &t));
        assert!(check("(name (re \"^index-\"))", &t));
        assert!(!check("(name other)", &t));
        assert!(check("(id (re \"^gf-\"))", &t));
        assert!(check("(tags urgent)", &t));
        assert!(check("(tags urgent (re \"^team-\"))", &t));
        assert!(!check("(tags urgent missing-tag)", &t));
    }

    #[test]
    fn boolean_composition() {
        let t = sample();
        assert!(check("(and (all) (is-activable))", &t));
        assert!(check("(or (is-failed) (is-activable))", &t));
        assert!(check("(not (is-failed))", &t));
    }

    #[test]
    fn created_in_the_past_uses_creation_time() {
        let t = sample();
        assert!(check("(created-in-the-past (hours 1))", &t));
        let old = eval(
            &parse_filter("(created-in-the-past (hours 1))").unwrap(),
            &t,
            Utc::now() + chrono::Duration::hours(2),
        );
        assert!(!old);
    }
}
