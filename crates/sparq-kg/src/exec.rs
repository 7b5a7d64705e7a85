//! Triple-pattern execution over the in-memory store.
//!
//! Evaluation is a left-to-right join: start from a single empty binding row
//! and extend it pattern by pattern, using the edge store's forward/backward
//! bitmap indexes to enumerate matches. Skeleton queries are short (one to
//! three patterns), so no join reordering is attempted.
//!
//! An empty result set is a valid "no answer exists" outcome, not an error.
//! Errors are reserved for malformed queries (unknown identifiers, unbound
//! projection variables, empty pattern lists) and resource exhaustion.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::KgError;
use crate::query::{GraphQuery, QueryForm, Term};
use crate::{KgId, KnowledgeGraph, TermKind};

/// Guard against runaway intermediate joins.
const MAX_ROWS: usize = 100_000;

/// One answer: an entity or literal drawn from the KG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub kg_id: KgId,
    pub label: String,
    pub kind: TermKind,
}

/// Execution output. For `ASK` queries the single entry is the literal
/// `true` or `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub entries: Vec<AnswerEntry>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn boolean(value: bool) -> Self {
        let text = if value { "true" } else { "false" };
        Self {
            entries: vec![AnswerEntry {
                kg_id: KgId::new(text),
                label: text.to_string(),
                kind: TermKind::Literal,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A partial variable binding: var name -> internal node id.
type Row = AHashMap<String, u32>;

fn resolve_node(kg: &KnowledgeGraph, term: &Term) -> Result<Option<u32>, KgError> {
    match term {
        Term::Var(_) => Ok(None),
        Term::Id(id) => kg
            .nodes
            .resolve(id)
            .map(Some)
            .ok_or_else(|| KgError::UnknownIdentifier(id.clone())),
        Term::Literal(text) => {
            // Literal nodes use their lexical form as external id.
            let id = KgId::new(text.as_str());
            kg.nodes
                .resolve(&id)
                .map(Some)
                .ok_or(KgError::UnknownIdentifier(id))
        }
    }
}

fn var_name(term: &Term) -> Option<&str> {
    match term {
        Term::Var(v) => Some(v),
        _ => None,
    }
}

/// Execute a fully resolved query. Read-only; never mutates KG state.
pub fn execute(kg: &KnowledgeGraph, query: &GraphQuery) -> Result<ResultSet, KgError> {
    if query.patterns.is_empty() {
        return Err(KgError::MalformedQuery {
            query: query.to_string(),
            detail: "empty pattern list".into(),
        });
    }
    if let QueryForm::Select { vars } = &query.form {
        let pattern_vars = query.pattern_vars();
        for v in vars {
            if !pattern_vars.contains(&v.as_str()) {
                return Err(KgError::MalformedQuery {
                    query: query.to_string(),
                    detail: format!("projected variable ?{v} is never bound"),
                });
            }
        }
    }

    let mut rows: Vec<Row> = vec![Row::new()];
    for pattern in &query.patterns {
        // An unknown identifier means "this query can never match"; for ASK
        // that is a definite false, for SELECT an empty result.
        let subject = match resolve_node(kg, &pattern.subject) {
            Ok(s) => s,
            Err(KgError::UnknownIdentifier(_)) => {
                rows.clear();
                break;
            }
            Err(e) => return Err(e),
        };
        let object = match resolve_node(kg, &pattern.object) {
            Ok(o) => o,
            Err(KgError::UnknownIdentifier(_)) => {
                rows.clear();
                break;
            }
            Err(e) => return Err(e),
        };
        let Some(rel) = kg.rels.resolve(&pattern.relation) else {
            rows.clear();
            break;
        };

        let mut next: Vec<Row> = Vec::new();
        for row in &rows {
            let s_bound = subject.or_else(|| {
                var_name(&pattern.subject).and_then(|v| row.get(v).copied())
            });
            let o_bound = object.or_else(|| {
                var_name(&pattern.object).and_then(|v| row.get(v).copied())
            });

            match (s_bound, o_bound) {
                (Some(s), Some(o)) => {
                    if kg.edges.has_edge(s, rel, o) {
                        next.push(row.clone());
                    }
                }
                (Some(s), None) => {
                    let targets = kg.edges.targets(s, rel);
                    extend_rows(&mut next, row, var_name(&pattern.object), &targets);
                }
                (None, Some(o)) => {
                    let sources = kg.edges.sources(o, rel);
                    extend_rows(&mut next, row, var_name(&pattern.subject), &sources);
                }
                (None, None) => {
                    // Both ends free: enumerate all edges of this relation.
                    let Some(edge_ids) = kg.edges.by_rel(rel) else {
                        continue;
                    };
                    for edge_id in edge_ids {
                        let Some(edge) = kg.edges.get(edge_id) else {
                            continue;
                        };
                        let mut r = row.clone();
                        if let Some(v) = var_name(&pattern.subject) {
                            r.insert(v.to_string(), edge.source);
                        }
                        if let Some(v) = var_name(&pattern.object) {
                            r.insert(v.to_string(), edge.target);
                        }
                        next.push(r);
                    }
                }
            }
            if next.len() > MAX_ROWS {
                return Err(KgError::ResourceExhausted {
                    detail: format!("join exceeded {MAX_ROWS} intermediate rows"),
                });
            }
        }
        rows = next;
        if rows.is_empty() {
            break;
        }
    }

    debug!(rows = rows.len(), query = %query, "executed triple patterns");

    match &query.form {
        QueryForm::Ask => Ok(ResultSet::boolean(!rows.is_empty())),
        QueryForm::Select { vars } => {
            // Project the primary variable; order ascending by internal id,
            // which is deterministic for a given KG snapshot.
            let primary = vars.first().ok_or_else(|| KgError::MalformedQuery {
                query: query.to_string(),
                detail: "select with no projection variables".into(),
            })?;
            let mut ids = RoaringBitmap::new();
            for row in &rows {
                if let Some(&node) = row.get(primary.as_str()) {
                    ids.insert(node);
                }
            }
            let entries = ids
                .iter()
                .take(query.limit)
                .filter_map(|node| {
                    let external = kg.nodes.external(node)?.clone();
                    let label = kg
                        .nodes
                        .label_sym(node)
                        .map(|s| kg.string(s))
                        .unwrap_or_default();
                    let kind = kg.nodes.kind(node).map(TermKind::from)?;
                    Some(AnswerEntry {
                        kg_id: external,
                        label,
                        kind,
                    })
                })
                .collect();
            Ok(ResultSet { entries })
        }
    }
}

fn extend_rows(next: &mut Vec<Row>, row: &Row, var: Option<&str>, matches: &RoaringBitmap) {
    match var {
        Some(v) => {
            for node in matches {
                let mut r = row.clone();
                r.insert(v.to_string(), node);
                next.push(r);
            }
        }
        None => {
            if !matches.is_empty() {
                next.push(row.clone());
            }
        }
    }
}
