// src/filter/ast.rs

//! Filter language AST and its canonical printer.
//!
//! The printer emits the fully-parenthesized canonical form; `parse ∘ print`
//! is the identity on the AST (aliases and bare-string predicates are
//! expanded at parse time, so they never appear here).

use std::fmt;

/// A filter over stored targets.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything.
    All,
    Status(StatusFilter),
    CreatedInThePast(Span),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Name(Pred),
    Id(Pred),
    /// Every predicate must match at least one tag.
    Tags(Vec<Pred>),
}

/// Status leaves of the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Activable,
    InProgress,
    Successful,
    Failed,
    ReallyRunning,
    Killable,
    DependencyDead,
    ActivatedByUser,
    KilledFromPassive,
    FailedFromRunning,
    FailedFromStarting,
    FailedFromCondition,
}

impl StatusFilter {
    pub fn keyword(self) -> &'static str {
        match self {
            StatusFilter::Activable => "is-activable",
            StatusFilter::InProgress => "is-in-progress",
            StatusFilter::Successful => "is-successful",
            StatusFilter::Failed => "is-failed",
            StatusFilter::ReallyRunning => "is-really-running",
            StatusFilter::Killable => "is-killable",
            StatusFilter::DependencyDead => "is-dependency-dead",
            StatusFilter::ActivatedByUser => "is-activated-by-user",
            StatusFilter::KilledFromPassive => "killed-from-passive",
            StatusFilter::FailedFromRunning => "failed-from-running",
            StatusFilter::FailedFromStarting => "failed-from-starting",
            StatusFilter::FailedFromCondition => "failed-from-condition",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "is-activable" => StatusFilter::Activable,
            "is-in-progress" => StatusFilter::InProgress,
            "is-successful" => StatusFilter::Successful,
            "is-failed" => StatusFilter::Failed,
            "is-really-running" => StatusFilter::ReallyRunning,
            "is-killable" => StatusFilter::Killable,
            "is-dependency-dead" => StatusFilter::DependencyDead,
            "is-activated-by-user" => StatusFilter::ActivatedByUser,
            "killed-from-passive" => StatusFilter::KilledFromPassive,
            "failed-from-running" => StatusFilter::FailedFromRunning,
            "failed-from-starting" => StatusFilter::FailedFromStarting,
            "failed-from-condition" => StatusFilter::FailedFromCondition,
            _ => return None,
        })
    }
}

/// Time span for `created-in-the-past`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Span {
    Hours(f64),
    Days(f64),
    Weeks(f64),
}

impl Span {
    pub fn to_duration(self) -> chrono::Duration {
        let seconds = match self {
            Span::Hours(h) => h * 3_600.0,
            Span::Days(d) => d * 86_400.0,
            Span::Weeks(w) => w * 7.0 * 86_400.0,
        };
        chrono::Duration::milliseconds((seconds * 1_000.0) as i64)
    }
}

/// String predicate for names, ids and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pred {
    Equals(String),
    /// POSIX-flavored regular expression (both `re` and `matches` parse
    /// into this).
    Re(String),
}

impl Pred {
    pub fn matches(&self, s: &str) -> bool {
        match self {
            Pred::Equals(expected) => s == expected,
            Pred::Re(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
        }
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl fmt::Display for Pred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pred::Equals(s) => {
                write!(f, "(equals ")?;
                write_string(f, s)?;
                write!(f, ")")
            }
            Pred::Re(s) => {
                write!(f, "(re ")?;
                write_string(f, s)?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Span::Hours(v) => write!(f, "(hours {v})"),
            Span::Days(v) => write!(f, "(days {v})"),
            Span::Weeks(v) => write!(f, "(weeks {v})"),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => write!(f, "(all)"),
            Filter::Status(status) => write!(f, "({})", status.keyword()),
            Filter::CreatedInThePast(span) => write!(f, "(created-in-the-past {span})"),
            Filter::And(children) => {
                write!(f, "(and")?;
                for child in children {
                    write!(f, " {child}")?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(or")?;
                for child in children {
                    write!(f, " {child}")?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(not {inner})"),
            Filter::Name(pred) => write!(f, "(name {pred})"),
            Filter::Id(pred) => write!(f, "(id {pred})"),
            Filter::Tags(preds) => {
                write!(f, "(tags")?;
                for pred in preds {
                    write!(f, " {pred}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printer_is_canonical() {
        let filter = Filter::And(vec![
            Filter::Status(StatusFilter::Failed),
            Filter::Not(Box::new(Filter::Name(Pred::Equals("x y".to_string())))),
            Filter::CreatedInThePast(Span::Weeks(4.0)),
        ]);
        assert_eq!(
            filter.to_string(),
            "(and (is-failed) (not (name (equals \"x y\"))) (created-in-the-past (weeks 4)))"
        );
    }

    #[test]
    fn strings_are_escaped() {
        let filter = Filter::Name(Pred::Equals("a\"b\\c".to_string()));
        assert_eq!(filter.to_string(), "(name (equals \"a\\\"b\\\\c\"))");
    }

    #[test]
    fn span_durations() {
        assert_eq!(Span::Hours(2.0).to_duration(), chrono::Duration::hours(2));
        assert_eq!(Span::Weeks(1.0).to_duration(), chrono::Duration::days(7));
        assert_eq!(
            Span::Days(0.5).to_duration(),
            chrono::Duration::hours(12)
        );
    }
}
