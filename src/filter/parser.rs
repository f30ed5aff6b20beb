// src/filter/parser.rs

//! S-expression parser for the filter language.
//!
//! The outermost parentheses may be omitted (`and (is-failed) (all)` parses
//! like `(and (is-failed) (all))`). Aliases and bare-string predicates are
//! expanded here, so the AST that comes out is always canonical.

use std::fmt;

use winnow::ascii::{float, multispace0};
use winnow::combinator::{delimited, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

use crate::filter::ast::{Filter, Pred, Span, StatusFilter};

/// Syntax error with a byte offset into the original input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParseError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for FilterParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for FilterParseError {}

/// Parse a filter expression.
pub fn parse_filter(input: &str) -> Result<Filter, FilterParseError> {
    let result = if input.trim_start().starts_with('(') {
        delimited(multispace0, sexpr_filter, multispace0).parse(input)
    } else {
        delimited(multispace0, filter_body, multispace0).parse(input)
    };

    result.map_err(|e| FilterParseError {
        offset: e.offset(),
        message: e.inner().to_string(),
    })
}

fn cut_expected(desc: &'static str) -> ErrMode<ContextError> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn ws(input: &mut &str) -> ModalResult<()> {
    multispace0.void().parse_next(input)
}

/// Bare atom: keyword heads and unquoted strings.
fn atom<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
    })
    .parse_next(input)
}

/// Double-quoted string with `\"` and `\\` escapes.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// A string argument: quoted or bare.
fn string_arg(input: &mut &str) -> ModalResult<String> {
    if input.starts_with('"') {
        quoted_string.parse_next(input)
    } else {
        atom.parse_next(input).map(str::to_string)
    }
}

/// `(<filter ...>)`
fn sexpr_filter(input: &mut &str) -> ModalResult<Filter> {
    delimited(('(', ws), filter_body, (ws, ')')).parse_next(input)
}

/// The head + arguments of a filter form, without surrounding parens.
fn filter_body(input: &mut &str) -> ModalResult<Filter> {
    let head = atom.parse_next(input)?;

    if let Some(status) = StatusFilter::from_keyword(head) {
        return Ok(Filter::Status(status));
    }
    if let Some(expansion) = expand_alias(head) {
        return Ok(expansion);
    }

    match head {
        "all" => Ok(Filter::All),
        "created-in-the-past" => {
            let span = preceded(ws, span).parse_next(input)?;
            Ok(Filter::CreatedInThePast(span))
        }
        "and" => {
            let children: Vec<Filter> =
                repeat(1.., preceded(ws, sexpr_filter)).parse_next(input)?;
            Ok(Filter::And(children))
        }
        "or" => {
            let children: Vec<Filter> =
                repeat(1.., preceded(ws, sexpr_filter)).parse_next(input)?;
            Ok(Filter::Or(children))
        }
        "not" => {
            let inner = preceded(ws, sexpr_filter).parse_next(input)?;
            Ok(Filter::Not(Box::new(inner)))
        }
        "name" => {
            let pred = preceded(ws, pred).parse_next(input)?;
            Ok(Filter::Name(pred))
        }
        "id" => {
            let pred = preceded(ws, pred).parse_next(input)?;
            Ok(Filter::Id(pred))
        }
        "tags" => {
            let preds: Vec<Pred> = repeat(1.., preceded(ws, pred)).parse_next(input)?;
            Ok(Filter::Tags(preds))
        }
        _ => Err(cut_expected("known filter form")),
    }
}

/// Compile-time macros over the base grammar.
fn expand_alias(head: &str) -> Option<Filter> {
    match head {
        "finished" => Some(Filter::Or(vec![
            Filter::Status(StatusFilter::Successful),
            Filter::Status(StatusFilter::Failed),
        ])),
        "running" => Some(Filter::Status(StatusFilter::ReallyRunning)),
        "recent" => Some(Filter::CreatedInThePast(Span::Days(1.0))),
        _ => None,
    }
}

/// `(hours|days|weeks <float>)`
fn span(input: &mut &str) -> ModalResult<Span> {
    delimited(
        ('(', ws),
        |input: &mut &str| {
            let unit = atom.parse_next(input)?;
            let value: f64 = preceded(ws, float).parse_next(input)?;
            match unit {
                "hours" => Ok(Span::Hours(value)),
                "days" => Ok(Span::Days(value)),
                "weeks" => Ok(Span::Weeks(value)),
                _ => Err(cut_expected("span unit: hours, days or weeks")),
            }
        },
        (ws, ')'),
    )
    .parse_next(input)
}

/// `<string>` | `(equals <string>)` | `(re <regex>)` | `(matches <regex>)`
fn pred(input: &mut &str) -> ModalResult<Pred> {
    if !input.starts_with('(') {
        return string_arg.parse_next(input).map(Pred::Equals);
    }

    delimited(
        ('(', ws),
        |input: &mut &str| {
            let head = atom.parse_next(input)?;
            let value = preceded(ws, string_arg).parse_next(input)?;
            match head {
                "equals" => Ok(Pred::Equals(value)),
                "re" | "matches" => {
                    if regex::Regex::new(&value).is_err() {
                        return Err(cut_expected("valid regular expression"));
                    }
                    Ok(Pred::Re(value))
                }
                _ => Err(cut_expected("predicate form: equals, re or matches")),
            }
        },
        (ws, ')'),
    )
    .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves() {
        assert_eq!(parse_filter("(all)").unwrap(), Filter::All);
        assert_eq!(
            parse_filter("(is-failed)").unwrap(),
            Filter::Status(StatusFilter::Failed)
        );
        assert_eq!(
            parse_filter("(created-in-the-past (weeks 4))").unwrap(),
            Filter::CreatedInThePast(Span::Weeks(4.0))
        );
    }

    #[test]
    fn outermost_parens_may_be_omitted() {
        assert_eq!(
            parse_filter("and (is-failed) (all)").unwrap(),
            Filter::And(vec![Filter::Status(StatusFilter::Failed), Filter::All])
        );
        assert_eq!(parse_filter("  all  ").unwrap(), Filter::All);
    }

    #[test]
    fn predicates_and_sugar() {
        assert_eq!(
            parse_filter("(name \"build index\")").unwrap(),
            Filter::Name(Pred::Equals("build index".to_string()))
        );
        assert_eq!(
            parse_filter("(name plain-atom)").unwrap(),
            Filter::Name(Pred::Equals("plain-atom".to_string()))
        );
        assert_eq!(
            parse_filter("(id (re \"^gf-\"))").unwrap(),
            Filter::Id(Pred::Re("^gf-".to_string()))
        );
        // `matches` is an alias of `re`.
        assert_eq!(
            parse_filter("(name (matches \"x+\"))").unwrap(),
            Filter::Name(Pred::Re("x+".to_string()))
        );
        assert_eq!(
            parse_filter("(tags urgent (re \"^team-\"))").unwrap(),
            Filter::Tags(vec![
                Pred::Equals("urgent".to_string()),
                Pred::Re("^team-".to_string()),
            ])
        );
    }

    #[test]
    fn nesting() {
        let parsed =
            parse_filter("(and (created-in-the-past (weeks 4)) (not (is-dependency-dead)))")
                .unwrap();
        assert_eq!(
            parsed,
            Filter::And(vec![
                Filter::CreatedInThePast(Span::Weeks(4.0)),
                Filter::Not(Box::new(Filter::Status(StatusFilter::DependencyDead))),
            ])
        );
    }

    #[test]
    fn aliases_expand() {
        assert_eq!(
            parse_filter("(finished)").unwrap(),
            Filter::Or(vec![
                Filter::Status(StatusFilter::Successful),
                Filter::Status(StatusFilter::Failed),
            ])
        );
        assert_eq!(
            parse_filter("(running)").unwrap(),
            Filter::Status(StatusFilter::ReallyRunning)
        );
    }

    #[test]
    fn unknown_atoms_are_syntax_errors() {
        let err = parse_filter("(definitely-not-a-filter)").unwrap_err();
        assert!(err.message.contains("known filter form"), "{err}");

        assert!(parse_filter("(created-in-the-past (fortnights 2))").is_err());
        assert!(parse_filter("(name (sounds-like \"x\"))").is_err());
    }

    #[test]
    fn invalid_regex_is_rejected_at_parse_time() {
        assert!(parse_filter("(name (re \"[unclosed\"))").is_err());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        assert!(parse_filter("(all) extra").is_err());
        assert!(parse_filter("(and)").is_err());
    }
}
