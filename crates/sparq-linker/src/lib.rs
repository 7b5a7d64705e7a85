//! Entity and relation linking.
//!
//! The linker turns a slot's surface mention into a ranked candidate list of
//! KG identifiers. Ranking mixes three signals: string similarity between
//! the mention and the candidate's surface forms (label and aliases), the
//! candidate's popularity prior,
//! and adjacency to already-bound identifiers when a link context is
//! available. Candidate order is fully deterministic, so repeated runs over
//! the same graph produce identical rankings.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use sparq_kg::{KgBackend, KgError, KgId, TermKind};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("knowledge graph error: {0}")]
    Backend(#[from] KgError),
}

// ============================================================================
// Candidates
// ============================================================================

/// One ranked linking candidate.
///
/// `sim` is the bare string-similarity component in `[0, 1]`; the pipeline
/// reports it as the slot's grounding confidence. `score` is the full mixed
/// ranking score and is only meaningful relative to other candidates for
/// the same mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: KgId,
    pub label: String,
    pub kind: TermKind,
    pub score: f64,
    pub sim: f64,
    pub prior: f64,
}

/// Identifiers already bound elsewhere in the query, used to favor
/// candidates that actually connect to them.
#[derive(Debug, Clone, Default)]
pub struct LinkContext {
    pub entities: Vec<KgId>,
    pub relations: Vec<KgId>,
}

impl LinkContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

// ============================================================================
// Linker
// ============================================================================

const SIM_WEIGHT: f64 = 0.6;
const PRIOR_WEIGHT: f64 = 0.25;
const CONTEXT_WEIGHT: f64 = 0.15;

/// How many raw index hits to pull before ranking. Ranking reorders hits,
/// so the fetch has to overshoot the returned candidate cap.
const SEARCH_FANOUT: usize = 4;

/// How exact score ties are broken. Both are deterministic; the default also
/// consults the popularity prior before falling back to identifier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    #[default]
    PopularityThenId,
    IdOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkerConfig {
    /// Hard cap on candidates returned per mention.
    pub max_candidates: usize,
    pub tie_break: TieBreakPolicy,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            max_candidates: 20,
            tie_break: TieBreakPolicy::default(),
        }
    }
}

pub struct Linker {
    backend: Arc<dyn KgBackend>,
    config: LinkerConfig,
}

impl Linker {
    pub fn new(backend: Arc<dyn KgBackend>) -> Self {
        Self::with_config(backend, LinkerConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KgBackend>, config: LinkerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn KgBackend> {
        &self.backend
    }

    /// Rank KG identifiers of `kind` for a surface mention.
    ///
    /// An empty result is not an error; the caller decides whether an
    /// unlinked mention is fatal. Literal mentions always yield at least
    /// the mention text itself, since literal nodes are keyed by their
    /// lexical form.
    pub async fn link(
        &self,
        mention: &str,
        kind: TermKind,
        context: &LinkContext,
    ) -> Result<Vec<Candidate>, LinkError> {
        let fetch = self.config.max_candidates.max(1) * SEARCH_FANOUT;
        let hits = self.backend.search(mention, kind, fetch).await?;

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            // Best similarity over every surface form the store knows, so an
            // exact alias match scores a full 1.0.
            let sim = hit
                .aliases
                .iter()
                .map(|alias| similarity(mention, alias))
                .fold(similarity(mention, &hit.label), f64::max);
            let adjacency = self.adjacency(&hit.id, kind, context).await?;
            candidates.push(Candidate {
                score: SIM_WEIGHT * sim + PRIOR_WEIGHT * hit.prior + CONTEXT_WEIGHT * adjacency,
                sim,
                prior: hit.prior,
                id: hit.id,
                label: hit.label,
                kind: hit.kind,
            });
        }

        if kind == TermKind::Literal && candidates.iter().all(|c| c.label != mention) {
            // A literal's external id is its lexical form, so the mention
            // itself is always a valid (possibly unmatched) candidate.
            candidates.push(Candidate {
                id: KgId::new(mention),
                label: mention.to_string(),
                kind: TermKind::Literal,
                score: SIM_WEIGHT,
                sim: 1.0,
                prior: 0.0,
            });
        }

        let tie_break = self.config.tie_break;
        candidates.sort_by(|a, b| rank_order(a, b, tie_break));
        candidates.truncate(self.config.max_candidates.max(1));
        debug!(
            mention,
            %kind,
            count = candidates.len(),
            "linked mention"
        );
        Ok(candidates)
    }

    /// 1.0 when the candidate touches any context identifier, else 0.0.
    async fn adjacency(
        &self,
        id: &KgId,
        kind: TermKind,
        context: &LinkContext,
    ) -> Result<f64, LinkError> {
        if context.is_empty() {
            return Ok(0.0);
        }
        match kind {
            TermKind::Relation => {
                for entity in &context.entities {
                    if self.backend.connected(entity, id).await? {
                        return Ok(1.0);
                    }
                }
            }
            TermKind::Entity | TermKind::Literal => {
                for relation in &context.relations {
                    if self.backend.connected(id, relation).await? {
                        return Ok(1.0);
                    }
                }
            }
        }
        Ok(0.0)
    }
}

/// Score descending, then (per policy) prior descending, then external id
/// ascending.
fn rank_order(a: &Candidate, b: &Candidate, tie_break: TieBreakPolicy) -> Ordering {
    let by_score = b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    let by_prior = match tie_break {
        TieBreakPolicy::PopularityThenId => {
            b.prior.partial_cmp(&a.prior).unwrap_or(Ordering::Equal)
        }
        TieBreakPolicy::IdOnly => Ordering::Equal,
    };
    by_score.then(by_prior).then_with(|| a.id.cmp(&b.id))
}

/// Case-insensitive similarity over whole label strings. Jaro-Winkler favors
/// shared prefixes ("direct" vs "director"); normalized Levenshtein handles
/// transposed or reordered interiors better. The max of the two is used.
fn similarity(mention: &str, label: &str) -> f64 {
    let m = mention.to_lowercase();
    let l = label.to_lowercase();
    strsim::jaro_winkler(&m, &l).max(strsim::normalized_levenshtein(&m, &l))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use sparq_kg::{InMemoryBackend, KgBuilder, KnowledgeGraph};

    fn movie_graph() -> KnowledgeGraph {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &[])
            .entity("Q25191", "Christopher Nolan", &["Nolan"])
            .entity("Q3772", "Interstellar", &[])
            .entity("Q886", "Hans Zimmer", &[])
            .relation("P57", "director", &["directed by", "directed"])
            .relation("P86", "composer", &["music by"])
            .triple("Q25188", "P57", "Q25191")
            .triple("Q3772", "P57", "Q25191")
            .triple("Q25188", "P86", "Q886")
            .triple("Q25188", "P577", "2010");
        b.build()
    }

    fn linker() -> Linker {
        Linker::new(Arc::new(InMemoryBackend::new(Arc::new(movie_graph()))))
    }

    #[tokio::test]
    async fn exact_label_ranks_first_with_full_sim() {
        let l = linker();
        let cands = l
            .link("Inception", TermKind::Entity, &LinkContext::default())
            .await
            .unwrap();
        assert_eq!(cands[0].id, KgId::new("Q25188"));
        assert_relative_eq!(cands[0].sim, 1.0);
    }

    #[tokio::test]
    async fn exact_alias_match_scores_full_sim() {
        let l = linker();
        let cands = l
            .link("Nolan", TermKind::Entity, &LinkContext::default())
            .await
            .unwrap();
        assert_eq!(cands[0].id, KgId::new("Q25191"));
        assert_relative_eq!(cands[0].sim, 1.0);
    }

    #[tokio::test]
    async fn alias_matches_link_relations() {
        let l = linker();
        let cands = l
            .link("directed", TermKind::Relation, &LinkContext::default())
            .await
            .unwrap();
        assert_eq!(cands[0].id, KgId::new("P57"));
    }

    #[tokio::test]
    async fn context_adjacency_breaks_label_ties() {
        let l = linker();
        // With Inception bound, relations attached to it get the context
        // bonus over unattached ones.
        let ctx = LinkContext {
            entities: vec![KgId::new("Q25188")],
            relations: vec![],
        };
        let cands = l.link("composer", TermKind::Relation, &ctx).await.unwrap();
        assert_eq!(cands[0].id, KgId::new("P86"));
        assert!(cands[0].score > SIM_WEIGHT * cands[0].sim + PRIOR_WEIGHT * cands[0].prior);
    }

    #[tokio::test]
    async fn literal_mention_always_yields_itself() {
        let l = linker();
        let cands = l
            .link("1999", TermKind::Literal, &LinkContext::default())
            .await
            .unwrap();
        assert!(cands.iter().any(|c| c.id == KgId::new("1999") && c.sim == 1.0));
    }

    #[tokio::test]
    async fn ranking_is_deterministic() {
        let l = linker();
        let a = l
            .link("inter", TermKind::Entity, &LinkContext::default())
            .await
            .unwrap();
        let b = l
            .link("inter", TermKind::Entity, &LinkContext::default())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn equal_scores_fall_back_to_id_order() {
        // Two disconnected entities with the same label tie on every
        // ranking signal; the smaller external id must come first under
        // either policy.
        let mut b = KgBuilder::new();
        b.entity("Q200", "Echo", &[]).entity("Q100", "Echo", &[]);
        let backend = Arc::new(InMemoryBackend::new(Arc::new(b.build())));
        for tie_break in [TieBreakPolicy::PopularityThenId, TieBreakPolicy::IdOnly] {
            let l = Linker::with_config(
                Arc::clone(&backend) as Arc<dyn KgBackend>,
                LinkerConfig {
                    max_candidates: 20,
                    tie_break,
                },
            );
            let cands = l
                .link("Echo", TermKind::Entity, &LinkContext::default())
                .await
                .unwrap();
            assert_eq!(cands[0].id, KgId::new("Q100"));
            assert_eq!(cands[1].id, KgId::new("Q200"));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Candidate lists come back sorted by non-increasing score, for
        /// any graph and any mention.
        #[test]
        fn candidate_lists_are_sorted_by_score(
            labels in proptest::collection::vec("[a-z]{3,8}", 1..12),
            mention_idx in 0usize..12,
        ) {
            let mut b = KgBuilder::new();
            for (i, label) in labels.iter().enumerate() {
                b.entity(KgId::new(format!("Q{i}")), label, &[]);
            }
            // Chain triples so degrees (and thus priors) vary across hits.
            for i in 0..labels.len().saturating_sub(1) {
                b.triple(
                    KgId::new(format!("Q{i}")),
                    "P0",
                    KgId::new(format!("Q{}", i + 1)),
                );
            }
            let mention = labels[mention_idx % labels.len()].clone();
            let l = Linker::new(Arc::new(InMemoryBackend::new(Arc::new(b.build()))));
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let cands = rt
                .block_on(l.link(&mention, TermKind::Entity, &LinkContext::default()))
                .unwrap();
            for pair in cands.windows(2) {
                prop_assert!(
                    pair[0].score >= pair[1].score,
                    "out of order: {:?} before {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[tokio::test]
    async fn respects_candidate_cap() {
        let backend = Arc::new(InMemoryBackend::new(Arc::new(movie_graph())));
        let l = Linker::with_config(
            backend,
            LinkerConfig {
                max_candidates: 1,
                ..LinkerConfig::default()
            },
        );
        let cands = l
            .link("director", TermKind::Relation, &LinkContext::default())
            .await
            .unwrap();
        assert!(cands.len() <= 1);
    }
}
