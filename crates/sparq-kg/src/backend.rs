//! The KG access capability trait.
//!
//! The pipeline only ever talks to the graph through [`KgBackend`]: label
//! search for candidate generation, query execution, and two small probes
//! (label lookup, adjacency) used by linking and resolution. Any concrete
//! store can sit behind it; [`InMemoryBackend`] wraps the bundled
//! [`KnowledgeGraph`], and the `remote` feature adds a SPARQL-endpoint
//! implementation.
//!
//! Every operation is read-only. An empty search result or an empty result
//! set is a recoverable condition for the caller, never an error here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::exec::{execute, ResultSet};
use crate::query::GraphQuery;
use crate::{KgId, KnowledgeGraph, TermKind};

/// Kind-aware cap on brute-force label scans when the token index yields
/// nothing. Beyond this the backend reports no candidates rather than
/// scanning an arbitrary share of the store.
const FALLBACK_SCAN_MAX: usize = 10_000;

#[derive(Debug, Error)]
pub enum KgError {
    #[error("malformed query `{query}`: {detail}")]
    MalformedQuery { query: String, detail: String },

    #[error("unknown identifier {0}")]
    UnknownIdentifier(KgId),

    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("execution exceeded its deadline")]
    Timeout,

    #[error("resource limit hit: {detail}")]
    ResourceExhausted { detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot decode failed: {detail}")]
    Decode { detail: String },
}

/// A label-search hit: one identifier the surface string might mean.
/// `prior` is the store's popularity prior in `[0,1]`; ranking proper is the
/// linker's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelHit {
    pub id: KgId,
    pub label: String,
    /// Alternate surface forms the store knows for this identifier. A
    /// mention can match an alias exactly while being far from the primary
    /// label, so rankers need all of them.
    pub aliases: Vec<String>,
    pub kind: TermKind,
    pub prior: f64,
}

/// Read-only access to a knowledge graph.
#[async_trait]
pub trait KgBackend: Send + Sync {
    /// Search the label index for identifiers of the given kind. Results are
    /// unranked beyond store-deterministic order; `limit` caps the hits.
    async fn search(&self, text: &str, kind: TermKind, limit: usize)
        -> Result<Vec<LabelHit>, KgError>;

    /// Execute a fully resolved query. Must never receive unresolved slots;
    /// the resolver guarantees this at the type level.
    async fn execute(&self, query: &GraphQuery) -> Result<ResultSet, KgError>;

    /// Label for an identifier, if the store knows it.
    async fn label(&self, id: &KgId) -> Result<Option<String>, KgError>;

    /// Whether `node` participates in any edge of type `relation`.
    async fn connected(&self, node: &KgId, relation: &KgId) -> Result<bool, KgError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// [`KgBackend`] over the bundled immutable store. Cloning shares the graph.
#[derive(Clone)]
pub struct InMemoryBackend {
    kg: Arc<KnowledgeGraph>,
}

impl InMemoryBackend {
    pub fn new(kg: Arc<KnowledgeGraph>) -> Self {
        Self { kg }
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.kg
    }

    fn node_hit(&self, id: u32) -> Option<LabelHit> {
        let external = self.kg.nodes.external(id)?.clone();
        let label = self.kg.nodes.label_sym(id).map(|s| self.kg.string(s))?;
        let aliases = self
            .kg
            .nodes
            .alias_syms(id)
            .iter()
            .map(|&s| self.kg.string(s))
            .collect();
        let kind = self.kg.nodes.kind(id).map(TermKind::from)?;
        let prior = self.kg.popularity(&external);
        Some(LabelHit {
            id: external,
            label,
            aliases,
            kind,
            prior,
        })
    }

    fn rel_hit(&self, id: u32) -> Option<LabelHit> {
        let external = self.kg.rels.external(id)?.clone();
        let label = self.kg.rels.label_sym(id).map(|s| self.kg.string(s))?;
        let aliases = self
            .kg
            .rels
            .alias_syms(id)
            .iter()
            .map(|&s| self.kg.string(s))
            .collect();
        let prior = self.kg.popularity(&external);
        Some(LabelHit {
            id: external,
            label,
            aliases,
            kind: TermKind::Relation,
            prior,
        })
    }

    fn search_nodes(&self, text: &str, literals: bool, limit: usize) -> Vec<LabelHit> {
        let index = &self.kg.node_labels;
        let want = |id: u32| -> bool {
            match self.kg.nodes.kind(id) {
                Some(crate::NodeKind::Literal) => literals,
                Some(crate::NodeKind::Entity) => !literals,
                None => false,
            }
        };

        // Exact label/alias matches first, then token-overlap candidates
        // ordered by overlap count (descending), then id.
        let exact = index.exact_matches(text);
        let mut scored: Vec<(usize, u32)> = Vec::new();
        for id in index.candidates(text) {
            if !want(id) || exact.contains(id) {
                continue;
            }
            scored.push((index.token_overlap(text, id), id));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut hits: Vec<LabelHit> = exact
            .iter()
            .filter(|&id| want(id))
            .filter_map(|id| self.node_hit(id))
            .collect();
        hits.extend(scored.iter().filter_map(|&(_, id)| self.node_hit(id)));

        if hits.is_empty() && self.kg.nodes.len() <= FALLBACK_SCAN_MAX {
            // Token index found nothing; containment scan as a last resort.
            let needle = text.to_lowercase();
            if !needle.is_empty() {
                for id in 0..self.kg.nodes.len() as u32 {
                    if !want(id) {
                        continue;
                    }
                    let Some(label) = self.kg.nodes.label_sym(id).map(|s| self.kg.string(s))
                    else {
                        continue;
                    };
                    if label.to_lowercase().contains(&needle) {
                        if let Some(hit) = self.node_hit(id) {
                            hits.push(hit);
                        }
                    }
                }
            }
        }

        hits.truncate(limit);
        hits
    }

    fn search_rels(&self, text: &str, limit: usize) -> Vec<LabelHit> {
        let index = &self.kg.rel_labels;
        let exact = index.exact_matches(text);
        let mut scored: Vec<(usize, u32)> = Vec::new();
        for id in index.candidates(text) {
            if exact.contains(id) {
                continue;
            }
            scored.push((index.token_overlap(text, id), id));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut hits: Vec<LabelHit> =
            exact.iter().filter_map(|id| self.rel_hit(id)).collect();
        hits.extend(scored.iter().filter_map(|&(_, id)| self.rel_hit(id)));
        hits.truncate(limit);
        hits
    }
}

#[async_trait]
impl KgBackend for InMemoryBackend {
    async fn search(
        &self,
        text: &str,
        kind: TermKind,
        limit: usize,
    ) -> Result<Vec<LabelHit>, KgError> {
        let hits = match kind {
            TermKind::Entity => self.search_nodes(text, false, limit),
            TermKind::Literal => self.search_nodes(text, true, limit),
            TermKind::Relation => self.search_rels(text, limit),
        };
        trace!(text, ?kind, hits = hits.len(), "label search");
        Ok(hits)
    }

    async fn execute(&self, query: &GraphQuery) -> Result<ResultSet, KgError> {
        execute(&self.kg, query)
    }

    async fn label(&self, id: &KgId) -> Result<Option<String>, KgError> {
        Ok(self.kg.label_of(id))
    }

    async fn connected(&self, node: &KgId, relation: &KgId) -> Result<bool, KgError> {
        Ok(self.kg.connected(node, relation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KgBuilder;

    fn backend() -> InMemoryBackend {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &["Inception (film)"]);
        b.entity("Q25191", "Christopher Nolan", &[]);
        b.entity("Q2263", "Tom Hanks", &[]);
        b.relation("P57", "director", &["directed by"]);
        b.triple("Q25188", "P57", "Q25191");
        InMemoryBackend::new(Arc::new(b.build()))
    }

    #[tokio::test]
    async fn exact_match_ranks_first() {
        let be = backend();
        let hits = be.search("inception", TermKind::Entity, 10).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, KgId::new("Q25188"));
    }

    #[tokio::test]
    async fn relation_search_covers_aliases() {
        let be = backend();
        let hits = be.search("directed", TermKind::Relation, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, KgId::new("P57"));
        assert_eq!(hits[0].kind, TermKind::Relation);
    }

    #[tokio::test]
    async fn hits_carry_alias_surface_forms() {
        let be = backend();
        let hits = be.search("inception", TermKind::Entity, 10).await.unwrap();
        assert_eq!(hits[0].aliases, vec!["Inception (film)".to_string()]);
    }

    #[tokio::test]
    async fn empty_search_is_ok_not_error() {
        let be = backend();
        let hits = be.search("zzz unknown", TermKind::Entity, 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn fallback_containment_scan() {
        let be = backend();
        // "Hank" matches no full token but is contained in "Tom Hanks".
        let hits = be.search("hank", TermKind::Entity, 10).await.unwrap();
        assert_eq!(hits[0].id, KgId::new("Q2263"));
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let be = backend();
        let hits = be.search("n", TermKind::Entity, 1).await.unwrap();
        assert!(hits.len() <= 1);
    }
}
