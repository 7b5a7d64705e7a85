//! Query resolution: binding skeleton slots to concrete KG identifiers.
//!
//! The resolver walks a skeleton's slots left to right, fetching ranked
//! candidates for every slot up front (one concurrent fan-out), then runs a
//! chronological backtracking search for a jointly compatible assignment.
//! Compatibility is checked at bind time: whenever a triple has both its
//! relation and an entity endpoint bound, the pair must actually touch in
//! the graph. When the strict pass exhausts, one relaxation pass widens the
//! search (type relaxation for empty lists, context-narrowed re-linking for
//! the rest) and the search runs again. Resolution either produces a fully
//! bound [`ResolvedQuery`] or reports the slot it could not get past; it
//! never silently defaults a binding.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use sparq_kg::{GraphQuery, KgError, KgId, Term, TermKind, TriplePattern};
use sparq_linker::{Candidate, LinkContext, LinkError, Linker};
use sparq_parser::{Question, QuerySkeleton, SkeletonToken, Slot, SlotId, SlotType, VarName};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Backtracking exhausted every candidate combination. `slot` is the
    /// deepest slot the search failed to get past.
    #[error("no compatible binding for slot {slot} (\"{mention}\")")]
    Unresolvable { slot: SlotId, mention: String },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("knowledge graph error: {0}")]
    Kg(#[from] KgError),
}

// ============================================================================
// Resolved output
// ============================================================================

/// One bound slot. `confidence` is the string-similarity grounding score of
/// the chosen candidate, so exact label matches bind with 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub slot: SlotId,
    pub mention: String,
    pub candidate: Candidate,
}

impl Binding {
    pub fn confidence(&self) -> f64 {
        self.candidate.sim
    }
}

/// A fully bound query plus the per-slot choices that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedQuery {
    pub query: GraphQuery,
    pub bindings: Vec<Binding>,
}

impl ResolvedQuery {
    /// Mean binding confidence, 1.0 for a slotless query.
    pub fn confidence(&self) -> f64 {
        if self.bindings.is_empty() {
            return 1.0;
        }
        self.bindings.iter().map(Binding::confidence).sum::<f64>() / self.bindings.len() as f64
    }
}

// ============================================================================
// Skeleton triple view
// ============================================================================

/// A term position before binding: either a query variable or a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermRef {
    Var(VarName),
    Slot(SlotId),
}

#[derive(Debug, Clone, Copy)]
struct SkeletonTriple {
    subject: TermRef,
    relation: TermRef,
    object: TermRef,
}

/// Read the triple structure back out of the token sequence. Skeletons are
/// grammar-accepted, so terms arrive in groups of three between the
/// brackets.
fn skeleton_triples(skeleton: &QuerySkeleton) -> Vec<SkeletonTriple> {
    let mut triples = Vec::new();
    let mut terms: Vec<TermRef> = Vec::new();
    let mut in_block = false;
    for token in skeleton.tokens() {
        match token {
            SkeletonToken::BrackOpen => in_block = true,
            SkeletonToken::BrackClose => break,
            SkeletonToken::SepDot => {}
            SkeletonToken::Var(v) if in_block => terms.push(TermRef::Var(*v)),
            SkeletonToken::Slot(id) if in_block => terms.push(TermRef::Slot(*id)),
            _ => {}
        }
        if terms.len() == 3 {
            triples.push(SkeletonTriple {
                subject: terms[0],
                relation: terms[1],
                object: terms[2],
            });
            terms.clear();
        }
    }
    triples
}

// ============================================================================
// Resolver
// ============================================================================

/// Candidate combinations tried before the search gives up. Keeps worst-case
/// joint search bounded even at the widest configured K.
const MAX_BIND_STEPS: usize = 10_000;

pub struct Resolver {
    linker: Linker,
}

impl Resolver {
    pub fn new(linker: Linker) -> Self {
        Self { linker }
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    /// Bind every slot of `skeleton` or report the slot that cannot be
    /// bound.
    pub async fn resolve(
        &self,
        question: &Question,
        skeleton: &QuerySkeleton,
    ) -> Result<ResolvedQuery, ResolveError> {
        let slots = skeleton.slots();
        let mentions: Vec<String> = slots
            .iter()
            .map(|s| question.span_text(s.source_span))
            .collect();
        let triples = skeleton_triples(skeleton);

        // Parallel fan-out: slots link independently, joined before binding.
        let empty = LinkContext::default();
        let mut lists = futures::future::try_join_all(
            slots
                .iter()
                .zip(&mentions)
                .map(|(slot, mention)| self.linker.link(mention, term_kind(slot), &empty)),
        )
        .await?;

        match self.bind(slots, &lists, &triples).await? {
            Search::Bound(choice) => {
                return Ok(self.lower(skeleton, slots, &mentions, &lists, &choice))
            }
            Search::Exhausted(deepest) => {
                debug!(slot = %slots[deepest].id, "strict pass exhausted, relaxing");
            }
        }

        self.relax(slots, &mentions, &mut lists).await?;
        match self.bind(slots, &lists, &triples).await? {
            Search::Bound(choice) => Ok(self.lower(skeleton, slots, &mentions, &lists, &choice)),
            Search::Exhausted(deepest) => Err(ResolveError::Unresolvable {
                slot: slots[deepest].id,
                mention: mentions[deepest].clone(),
            }),
        }
    }

    /// Chronological backtracking over per-slot candidate lists.
    async fn bind(
        &self,
        slots: &[Slot],
        lists: &[Vec<Candidate>],
        triples: &[SkeletonTriple],
    ) -> Result<Search, ResolveError> {
        let n = slots.len();
        if n == 0 {
            return Ok(Search::Bound(Vec::new()));
        }

        let mut choice = vec![0usize; n];
        let mut depth = 0usize;
        let mut deepest = 0usize;
        let mut steps = 0usize;

        loop {
            if depth == n {
                return Ok(Search::Bound(choice));
            }
            let mut advanced = false;
            while choice[depth] < lists[depth].len() {
                steps += 1;
                if steps > MAX_BIND_STEPS {
                    return Ok(Search::Exhausted(deepest));
                }
                if self
                    .compatible(slots, lists, &choice, depth, triples)
                    .await?
                {
                    depth += 1;
                    deepest = deepest.max(depth.min(n - 1));
                    if depth < n {
                        choice[depth] = 0;
                    }
                    advanced = true;
                    break;
                }
                choice[depth] += 1;
            }
            if advanced {
                continue;
            }
            if depth == 0 {
                return Ok(Search::Exhausted(deepest));
            }
            depth -= 1;
            choice[depth] += 1;
        }
    }

    /// Whether the candidate currently selected at `depth` coexists with
    /// every binding made before it.
    async fn compatible(
        &self,
        slots: &[Slot],
        lists: &[Vec<Candidate>],
        choice: &[usize],
        depth: usize,
        triples: &[SkeletonTriple],
    ) -> Result<bool, ResolveError> {
        let bound = |id: SlotId| -> Option<&Candidate> {
            let idx = id.0 as usize;
            (idx <= depth).then(|| &lists[idx][choice[idx]])
        };
        let this = slots[depth].id;

        for triple in triples {
            let rel = match triple.relation {
                TermRef::Slot(id) => id,
                TermRef::Var(_) => continue,
            };
            let touches_this = triple.relation == TermRef::Slot(this)
                || triple.subject == TermRef::Slot(this)
                || triple.object == TermRef::Slot(this);
            if !touches_this {
                continue;
            }
            let rel_cand = match bound(rel) {
                Some(c) => c,
                None => continue,
            };
            for endpoint in [triple.subject, triple.object] {
                let slot_id = match endpoint {
                    TermRef::Slot(id) => id,
                    TermRef::Var(_) => continue,
                };
                let node_cand = match bound(slot_id) {
                    Some(c) => c,
                    None => continue,
                };
                // Only pairs involving the candidate under test need
                // re-checking; earlier pairs were validated when bound.
                if slot_id != this && rel != this {
                    continue;
                }
                if !self
                    .linker
                    .backend()
                    .connected(&node_cand.id, &rel_cand.id)
                    .await?
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// One relaxation pass: slots with no candidates retry under a relaxed
    /// type (entity mentions may really be literals and vice versa), then
    /// every slot re-links with the context of its neighbors' top choices.
    async fn relax(
        &self,
        slots: &[Slot],
        mentions: &[String],
        lists: &mut [Vec<Candidate>],
    ) -> Result<(), ResolveError> {
        let mut context = LinkContext::default();
        for (slot, list) in slots.iter().zip(lists.iter()) {
            if let Some(top) = list.first() {
                match slot.expected_type {
                    SlotType::Entity => context.entities.push(top.id.clone()),
                    SlotType::Relation => context.relations.push(top.id.clone()),
                    SlotType::Literal => {}
                }
            }
        }

        for ((slot, mention), list) in slots.iter().zip(mentions).zip(lists.iter_mut()) {
            if list.is_empty() {
                if let Some(relaxed) = relaxed_kind(slot.expected_type) {
                    *list = self.linker.link(mention, relaxed, &context).await?;
                    if !list.is_empty() {
                        continue;
                    }
                }
            }
            *list = self.linker.link(mention, term_kind(slot), &context).await?;
        }
        Ok(())
    }

    /// Lower a complete assignment to an executable query.
    fn lower(
        &self,
        skeleton: &QuerySkeleton,
        slots: &[Slot],
        mentions: &[String],
        lists: &[Vec<Candidate>],
        choice: &[usize],
    ) -> ResolvedQuery {
        let bindings: Vec<Binding> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| Binding {
                slot: slot.id,
                mention: mentions[i].clone(),
                candidate: lists[i][choice[i]].clone(),
            })
            .collect();

        let term = |r: TermRef| -> Term {
            match r {
                TermRef::Var(v) => Term::Var(v.to_string()),
                TermRef::Slot(id) => {
                    let c = &bindings[id.0 as usize].candidate;
                    if c.kind == TermKind::Literal {
                        Term::Literal(c.label.clone())
                    } else {
                        Term::Id(c.id.clone())
                    }
                }
            }
        };
        let patterns: Vec<TriplePattern> = skeleton_triples(skeleton)
            .into_iter()
            .map(|t| TriplePattern {
                subject: term(t.subject),
                relation: match t.relation {
                    TermRef::Slot(id) => bindings[id.0 as usize].candidate.id.clone(),
                    // The grammar only places slots in relation position.
                    TermRef::Var(v) => KgId::new(v.to_string()),
                },
                object: term(t.object),
            })
            .collect();

        let query = if skeleton.is_ask() {
            GraphQuery::ask(patterns)
        } else {
            GraphQuery::select(
                skeleton.select_vars().iter().map(|v| v.to_string()).collect(),
                patterns,
            )
        };
        ResolvedQuery { query, bindings }
    }
}

enum Search {
    Bound(Vec<usize>),
    Exhausted(usize),
}

fn term_kind(slot: &Slot) -> TermKind {
    match slot.expected_type {
        SlotType::Entity => TermKind::Entity,
        SlotType::Relation => TermKind::Relation,
        SlotType::Literal => TermKind::Literal,
    }
}

/// Entity and literal mentions are mutually confusable; relations are not.
fn relaxed_kind(ty: SlotType) -> Option<TermKind> {
    match ty {
        SlotType::Entity => Some(TermKind::Literal),
        SlotType::Literal => Some(TermKind::Entity),
        SlotType::Relation => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sparq_kg::{InMemoryBackend, KgBuilder, KnowledgeGraph, QueryForm};
    use sparq_parser::{SemanticParser, TranslationModel};

    fn movie_graph() -> KnowledgeGraph {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &[])
            .entity("Q25191", "Christopher Nolan", &["Nolan"])
            .entity("Q3772", "Interstellar", &[])
            .relation("P57", "director", &["directed by", "directed"])
            .relation("P577", "publication date", &["premiered", "released"])
            .triple("Q25188", "P57", "Q25191")
            .triple("Q3772", "P57", "Q25191")
            .triple("Q25188", "P577", "2010");
        b.build()
    }

    fn resolver() -> Resolver {
        Resolver::new(Linker::new(Arc::new(InMemoryBackend::new(Arc::new(
            movie_graph(),
        )))))
    }

    fn parser() -> SemanticParser {
        let model = TranslationModel::from_aligned_pairs(&[
            (
                "who directed inception",
                "select var_x where brack_open <entity> <relation> var_x brack_close",
            ),
            (
                "did nolan direct inception",
                "ask where brack_open <entity> <relation> <entity> brack_close",
            ),
        ]);
        SemanticParser::new(Arc::new(model))
    }

    #[tokio::test]
    async fn resolves_single_hop_select() {
        let r = resolver();
        let q = Question::new("Who directed Inception?").unwrap();
        let parsed = parser().parse(&q, None).unwrap();
        let resolved = r.resolve(&q, &parsed[0].skeleton).await.unwrap();

        assert_eq!(resolved.bindings.len(), 2);
        let ids: Vec<&str> = resolved
            .bindings
            .iter()
            .map(|b| b.candidate.id.as_str())
            .collect();
        assert!(ids.contains(&"Q25188"));
        assert!(ids.contains(&"P57"));
        assert!(matches!(resolved.query.form, QueryForm::Select { .. }));
        assert_eq!(resolved.query.patterns.len(), 1);
    }

    #[tokio::test]
    async fn exact_labels_resolve_with_full_confidence() {
        let r = resolver();
        let q = Question::new("Who directed Inception?").unwrap();
        let parsed = parser().parse(&q, None).unwrap();
        let resolved = r.resolve(&q, &parsed[0].skeleton).await.unwrap();
        let entity = resolved
            .bindings
            .iter()
            .find(|b| b.candidate.id.as_str() == "Q25188")
            .unwrap();
        assert!((entity.confidence() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_entity_is_unresolvable() {
        let r = resolver();
        let q = Question::new("Who directed Zzyzx?").unwrap();
        let parsed = parser().parse(&q, None).unwrap();
        let mut unresolved = None;
        for p in &parsed {
            match r.resolve(&q, &p.skeleton).await {
                Err(ResolveError::Unresolvable { mention, .. }) => {
                    unresolved = Some(mention);
                    break;
                }
                Ok(resolved) => {
                    // A binding may still surface on a fuzzy match; it must
                    // then at least connect in the graph.
                    assert!(!resolved.bindings.is_empty());
                    return;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(unresolved.is_some());
    }

    #[tokio::test]
    async fn adjacency_keeps_the_connected_relation() {
        // Both relation candidates match "directed" loosely, but only P57
        // actually touches Interstellar, so the compatibility check must
        // keep P57 regardless of raw string scores.
        let r = resolver();
        let q = Question::new("Who directed Interstellar?").unwrap();
        let parsed = parser().parse(&q, None).unwrap();
        let resolved = r.resolve(&q, &parsed[0].skeleton).await.unwrap();
        let rel = resolved
            .bindings
            .iter()
            .find(|b| b.candidate.kind == TermKind::Relation)
            .unwrap();
        assert_eq!(rel.candidate.id.as_str(), "P57");
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let r = resolver();
        let q = Question::new("Who directed Inception?").unwrap();
        let parsed = parser().parse(&q, None).unwrap();
        let a = r.resolve(&q, &parsed[0].skeleton).await.unwrap();
        let b = r.resolve(&q, &parsed[0].skeleton).await.unwrap();
        assert_eq!(a.query, b.query);
    }
}
