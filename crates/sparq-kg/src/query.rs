//! Structured query model and its textual form.
//!
//! A [`GraphQuery`] is the fully resolved artifact the executor accepts: no
//! placeholder slots, only variables, concrete identifiers, and quoted
//! literals. The textual surface is a small SPARQL-like form used for
//! diagnostics, the CLI, and the remote backend:
//!
//! ```text
//! SELECT ?x WHERE { kg:Q25188 kg:P57 ?x . } LIMIT 50
//! ASK WHERE { kg:Q25188 kg:P57 kg:Q25191 . }
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, opt},
    multi::{many1, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::KgId;

/// Default result cap, mirroring the executor's guard against runaway joins.
pub const DEFAULT_LIMIT: usize = 50;

/// Query head: projection or boolean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryForm {
    Select { vars: Vec<String> },
    Ask,
}

/// A term in subject or object position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    Var(String),
    /// Concrete node identifier (entity or literal node).
    Id(KgId),
    /// Quoted literal value, matched against literal-node lexical forms.
    Literal(String),
}

/// One triple pattern. The predicate is always a concrete relation id;
/// the resolver guarantees this by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub relation: KgId,
    pub object: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQuery {
    pub form: QueryForm,
    pub patterns: Vec<TriplePattern>,
    pub limit: usize,
}

impl GraphQuery {
    pub fn select(vars: Vec<String>, patterns: Vec<TriplePattern>) -> Self {
        Self {
            form: QueryForm::Select { vars },
            patterns,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn ask(patterns: Vec<TriplePattern>) -> Self {
        Self {
            form: QueryForm::Ask,
            patterns,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Variables mentioned anywhere in the pattern list.
    pub fn pattern_vars(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for p in &self.patterns {
            for term in [&p.subject, &p.object] {
                if let Term::Var(v) = term {
                    if !seen.contains(&v.as_str()) {
                        seen.push(v.as_str());
                    }
                }
            }
        }
        seen
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => write!(f, "?{v}"),
            Term::Id(id) => write!(f, "kg:{id}"),
            Term::Literal(s) => write!(f, "\"{s}\""),
        }
    }
}

impl fmt::Display for GraphQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.form {
            QueryForm::Select { vars } => {
                write!(f, "SELECT")?;
                for v in vars {
                    write!(f, " ?{v}")?;
                }
                write!(f, " WHERE {{ ")?;
            }
            QueryForm::Ask => write!(f, "ASK WHERE {{ ")?,
        }
        for p in &self.patterns {
            write!(f, "{} kg:{} {} . ", p.subject, p.relation, p.object)?;
        }
        write!(f, "}}")?;
        if matches!(self.form, QueryForm::Select { .. }) && self.limit != DEFAULT_LIMIT {
            write!(f, " LIMIT {}", self.limit)?;
        }
        Ok(())
    }
}

// ============================================================================
// Textual form parser (nom)
// ============================================================================

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn var(input: &str) -> IResult<&str, Term> {
    map(preceded(char('?'), ident), |v: &str| Term::Var(v.to_string()))(input)
}

fn id_term(input: &str) -> IResult<&str, KgId> {
    map(preceded(tag("kg:"), ident), KgId::from)(input)
}

fn literal(input: &str) -> IResult<&str, Term> {
    map(
        delimited(char('"'), take_while1(|c| c != '"'), char('"')),
        |s: &str| Term::Literal(s.to_string()),
    )(input)
}

fn term(input: &str) -> IResult<&str, Term> {
    alt((var, map(id_term, Term::Id), literal))(input)
}

fn triple(input: &str) -> IResult<&str, TriplePattern> {
    map(
        tuple((
            preceded(multispace0, term),
            preceded(multispace1, id_term),
            preceded(multispace1, term),
            preceded(multispace0, opt(char('.'))),
        )),
        |(subject, relation, object, _)| TriplePattern {
            subject,
            relation,
            object,
        },
    )(input)
}

fn select_head(input: &str) -> IResult<&str, QueryForm> {
    map(
        preceded(
            tag_no_case("select"),
            many1(preceded(multispace1, preceded(char('?'), ident))),
        ),
        |vars| QueryForm::Select {
            vars: vars.into_iter().map(String::from).collect(),
        },
    )(input)
}

fn ask_head(input: &str) -> IResult<&str, QueryForm> {
    map(tag_no_case("ask"), |_| QueryForm::Ask)(input)
}

/// Parse the textual query form.
pub fn parse_query(input: &str) -> Result<GraphQuery, crate::KgError> {
    let mut parser = tuple((
        preceded(multispace0, alt((select_head, ask_head))),
        preceded(multispace1, tag_no_case("where")),
        preceded(multispace0, char('{')),
        separated_list1(multispace0, triple),
        preceded(multispace0, char('}')),
        opt(preceded(
            tuple((multispace1, tag_no_case("limit"), multispace1)),
            digit1,
        )),
    ));

    let (rest, (form, _, _, patterns, _, limit)) =
        parser(input).map_err(|e: nom::Err<nom::error::Error<&str>>| {
            crate::KgError::MalformedQuery {
                query: input.to_string(),
                detail: format!("{e:?}"),
            }
        })?;

    if !rest.trim().is_empty() {
        return Err(crate::KgError::MalformedQuery {
            query: input.to_string(),
            detail: format!("trailing input: {rest:?}"),
        });
    }

    let limit = limit
        .and_then(|d: &str| d.parse().ok())
        .unwrap_or(DEFAULT_LIMIT);

    Ok(GraphQuery {
        form,
        patterns,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_select() {
        let q = GraphQuery::select(
            vec!["x".into()],
            vec![TriplePattern {
                subject: Term::Id(KgId::new("Q25188")),
                relation: KgId::new("P57"),
                object: Term::Var("x".into()),
            }],
        );
        assert_eq!(q.to_string(), "SELECT ?x WHERE { kg:Q25188 kg:P57 ?x . }");
    }

    #[test]
    fn parses_select_round_trip() {
        let text = "SELECT ?x WHERE { kg:Q25188 kg:P57 ?x . }";
        let q = parse_query(text).unwrap();
        assert_eq!(q.form, QueryForm::Select { vars: vec!["x".into()] });
        assert_eq!(q.patterns.len(), 1);
        assert_eq!(q.to_string(), text);
    }

    #[test]
    fn parses_ask_with_literal() {
        let q = parse_query(r#"ASK WHERE { kg:Q1 kg:P1 "1977" . }"#).unwrap();
        assert_eq!(q.form, QueryForm::Ask);
        assert_eq!(q.patterns[0].object, Term::Literal("1977".into()));
    }

    #[test]
    fn parses_multi_pattern_and_limit() {
        let q = parse_query("select ?x ?y where { ?x kg:P57 ?y . ?y kg:P19 kg:Q60 . } LIMIT 5")
            .unwrap();
        assert_eq!(q.patterns.len(), 2);
        assert_eq!(q.limit, 5);
        assert_eq!(q.pattern_vars(), vec!["x", "y"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_query("SELECT WHERE {}").is_err());
        assert!(parse_query("SELECT ?x WHERE { kg:Q1 }").is_err());
        assert!(parse_query("SELECT ?x WHERE { kg:Q1 kg:P1 ?x . } trailing").is_err());
    }
}
