//! Read-only knowledge graph access layer.
//!
//! The store is deliberately split the same way the query pipeline consumes it:
//!
//! 1. **Interned strings**: every label/alias is stored once, referenced by a
//!    compact 4-byte [`Sym`].
//! 2. **Node store**: entities and literal nodes share one dense `u32` id
//!    space, with external identifiers (`Q42`-style) kept as a side table.
//! 3. **Edge store**: relations are edge-indexed bitmaps, so triple-pattern
//!    joins are set operations on entity ids.
//! 4. **Label index**: an inverted token index over labels and aliases,
//!    used for candidate generation during entity/relation linking.
//!
//! A graph is assembled through [`KgBuilder`] and frozen into an immutable
//! [`KnowledgeGraph`]; the pipeline never mutates KG state. Concrete backends
//! (in-memory, remote SPARQL endpoint) live behind the [`KgBackend`]
//! capability trait in [`backend`].

pub mod backend;
pub mod exec;
pub mod label_index;
pub mod query;
pub mod snapshot;

#[cfg(feature = "remote")]
pub mod remote;

use ahash::AHashMap;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub use backend::{InMemoryBackend, KgBackend, KgError, LabelHit};
pub use exec::{execute, AnswerEntry, ResultSet};
pub use label_index::LabelIndex;
pub use query::{parse_query, GraphQuery, QueryForm, Term, TriplePattern};

// ============================================================================
// String Interning
// ============================================================================

/// Interned string ID (4 bytes instead of 24+ for String).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Sym(u32);

impl Sym {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// String interner: maps strings to compact IDs.
///
/// Concurrent reads are lock-free; the linker and executor look up labels from
/// parallel requests without coordination.
pub struct StringInterner {
    str_to_id: DashMap<String, Sym>,
    id_to_str: DashMap<Sym, String>,
    next_id: AtomicU32,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            str_to_id: DashMap::new(),
            id_to_str: DashMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Intern a string, returning its ID.
    pub fn intern(&self, s: &str) -> Sym {
        if let Some(id) = self.str_to_id.get(s) {
            return *id;
        }

        let id = Sym(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.str_to_id.insert(s.to_string(), id);
        self.id_to_str.insert(id, s.to_string());
        id
    }

    /// Look up an existing ID for a string without inserting.
    pub fn id_of(&self, s: &str) -> Option<Sym> {
        self.str_to_id.get(s).map(|id| *id)
    }

    /// Look up string by ID.
    pub fn lookup(&self, id: Sym) -> Option<String> {
        self.id_to_str.get(&id).map(|s| s.clone())
    }

    /// All interned strings in ID order (for snapshots).
    pub fn to_vec(&self) -> Vec<String> {
        (0..self.next_id.load(Ordering::SeqCst))
            .filter_map(|i| self.id_to_str.get(&Sym(i)).map(|s| s.clone()))
            .collect()
    }

    /// Rebuild an interner from a snapshot vector.
    pub fn from_vec(strings: Vec<String>) -> Self {
        let interner = Self::new();
        for s in strings {
            interner.intern(&s);
        }
        interner
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Identifiers and kinds
// ============================================================================

/// External KG identifier (`Q25188`, `P57`, or a literal's lexical form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KgId(pub String);

impl KgId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KgId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What an identifier stands for. Entities and relations are indexed
/// separately; literals share the node id space with entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermKind {
    Entity,
    Relation,
    Literal,
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermKind::Entity => f.write_str("entity"),
            TermKind::Relation => f.write_str("relation"),
            TermKind::Literal => f.write_str("literal"),
        }
    }
}

// ============================================================================
// Node storage (entities + literals)
// ============================================================================

/// Node kind within the store. Literal nodes carry their lexical form as both
/// external id and label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Entity,
    Literal,
}

impl From<NodeKind> for TermKind {
    fn from(k: NodeKind) -> Self {
        match k {
            NodeKind::Entity => TermKind::Entity,
            NodeKind::Literal => TermKind::Literal,
        }
    }
}

/// Columnar node storage.
#[derive(Default)]
pub struct NodeStore {
    externals: Vec<KgId>,
    by_external: AHashMap<KgId, u32>,
    kinds: Vec<NodeKind>,
    labels: Vec<Sym>,
    aliases: AHashMap<u32, Vec<Sym>>,
    /// Bitmap of entity nodes (literals excluded), for kind-scoped search.
    entities: RoaringBitmap,
}

impl NodeStore {
    pub fn len(&self) -> usize {
        self.externals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.externals.is_empty()
    }

    fn add(&mut self, external: KgId, kind: NodeKind, label: Sym, aliases: Vec<Sym>) -> u32 {
        if let Some(&id) = self.by_external.get(&external) {
            return id;
        }
        let id = self.externals.len() as u32;
        self.by_external.insert(external.clone(), id);
        self.externals.push(external);
        self.kinds.push(kind);
        self.labels.push(label);
        if !aliases.is_empty() {
            self.aliases.insert(id, aliases);
        }
        if kind == NodeKind::Entity {
            self.entities.insert(id);
        }
        id
    }

    pub fn resolve(&self, external: &KgId) -> Option<u32> {
        self.by_external.get(external).copied()
    }

    pub fn external(&self, id: u32) -> Option<&KgId> {
        self.externals.get(id as usize)
    }

    pub fn kind(&self, id: u32) -> Option<NodeKind> {
        self.kinds.get(id as usize).copied()
    }

    pub fn label_sym(&self, id: u32) -> Option<Sym> {
        self.labels.get(id as usize).copied()
    }

    pub fn alias_syms(&self, id: u32) -> &[Sym] {
        self.aliases.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn entity_ids(&self) -> &RoaringBitmap {
        &self.entities
    }
}

// ============================================================================
// Relation type storage
// ============================================================================

/// Relation types (`P57`-style), separate from the node id space.
#[derive(Default)]
pub struct RelTypeStore {
    externals: Vec<KgId>,
    by_external: AHashMap<KgId, u32>,
    labels: Vec<Sym>,
    aliases: AHashMap<u32, Vec<Sym>>,
}

impl RelTypeStore {
    pub fn len(&self) -> usize {
        self.externals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.externals.is_empty()
    }

    fn add(&mut self, external: KgId, label: Sym, aliases: Vec<Sym>) -> u32 {
        if let Some(&id) = self.by_external.get(&external) {
            return id;
        }
        let id = self.externals.len() as u32;
        self.by_external.insert(external.clone(), id);
        self.externals.push(external);
        self.labels.push(label);
        if !aliases.is_empty() {
            self.aliases.insert(id, aliases);
        }
        id
    }

    pub fn resolve(&self, external: &KgId) -> Option<u32> {
        self.by_external.get(external).copied()
    }

    pub fn external(&self, id: u32) -> Option<&KgId> {
        self.externals.get(id as usize)
    }

    pub fn label_sym(&self, id: u32) -> Option<Sym> {
        self.labels.get(id as usize).copied()
    }

    pub fn alias_syms(&self, id: u32) -> &[Sym] {
        self.aliases.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

// ============================================================================
// Edge storage
// ============================================================================

/// A directed edge: `source -[rel]-> target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: u32,
    pub rel: u32,
    pub target: u32,
}

/// Indexed edge storage with forward/backward adjacency.
#[derive(Default)]
pub struct EdgeStore {
    edges: Vec<Edge>,
    forward: AHashMap<(u32, u32), Vec<u32>>,
    backward: AHashMap<(u32, u32), Vec<u32>>,
    rel_index: AHashMap<u32, RoaringBitmap>,
    degree: AHashMap<u32, u32>,
}

impl EdgeStore {
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn add(&mut self, edge: Edge) -> u32 {
        let id = self.edges.len() as u32;
        self.forward
            .entry((edge.source, edge.rel))
            .or_default()
            .push(id);
        self.backward
            .entry((edge.target, edge.rel))
            .or_default()
            .push(id);
        self.rel_index.entry(edge.rel).or_default().insert(id);
        *self.degree.entry(edge.source).or_default() += 1;
        *self.degree.entry(edge.target).or_default() += 1;
        self.edges.push(edge);
        id
    }

    pub fn get(&self, edge_id: u32) -> Option<&Edge> {
        self.edges.get(edge_id as usize)
    }

    /// All targets reachable from `source` via `rel`.
    pub fn targets(&self, source: u32, rel: u32) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        if let Some(ids) = self.forward.get(&(source, rel)) {
            for &id in ids {
                if let Some(e) = self.edges.get(id as usize) {
                    out.insert(e.target);
                }
            }
        }
        out
    }

    /// All sources that reach `target` via `rel`.
    pub fn sources(&self, target: u32, rel: u32) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        if let Some(ids) = self.backward.get(&(target, rel)) {
            for &id in ids {
                if let Some(e) = self.edges.get(id as usize) {
                    out.insert(e.source);
                }
            }
        }
        out
    }

    /// Check whether `source -[rel]-> target` exists.
    pub fn has_edge(&self, source: u32, rel: u32, target: u32) -> bool {
        self.forward
            .get(&(source, rel))
            .map(|ids| {
                ids.iter()
                    .filter_map(|&id| self.edges.get(id as usize))
                    .any(|e| e.target == target)
            })
            .unwrap_or(false)
    }

    /// All edge ids with the given relation type.
    pub fn by_rel(&self, rel: u32) -> Option<&RoaringBitmap> {
        self.rel_index.get(&rel)
    }

    /// Whether `node` participates in any edge of type `rel`, in either
    /// direction. Used by the linker for contextual compatibility.
    pub fn touches(&self, node: u32, rel: u32) -> bool {
        self.forward.contains_key(&(node, rel)) || self.backward.contains_key(&(node, rel))
    }

    pub fn degree(&self, node: u32) -> u32 {
        self.degree.get(&node).copied().unwrap_or(0)
    }

    pub fn rel_count(&self, rel: u32) -> u64 {
        self.rel_index.get(&rel).map(|b| b.len()).unwrap_or(0)
    }

    fn max_degree(&self) -> u32 {
        self.degree.values().copied().max().unwrap_or(0)
    }

    fn max_rel_count(&self) -> u64 {
        self.rel_index.values().map(|b| b.len()).max().unwrap_or(0)
    }
}

// ============================================================================
// KnowledgeGraph
// ============================================================================

/// Immutable, fully indexed knowledge graph.
///
/// Built once via [`KgBuilder`]; all pipeline stages hold `&KnowledgeGraph`
/// (or an `Arc`) and never mutate it, so concurrent requests need no locking.
pub struct KnowledgeGraph {
    pub(crate) interner: StringInterner,
    pub(crate) nodes: NodeStore,
    pub(crate) rels: RelTypeStore,
    pub(crate) edges: EdgeStore,
    pub(crate) node_labels: LabelIndex,
    pub(crate) rel_labels: LabelIndex,
    max_degree: u32,
    max_rel_count: u64,
}

impl KnowledgeGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relation_type_count(&self) -> usize {
        self.rels.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    pub fn relation_types(&self) -> &RelTypeStore {
        &self.rels
    }

    pub fn edges(&self) -> &EdgeStore {
        &self.edges
    }

    /// Human-readable label for an external id, if known. Checks nodes first,
    /// then relation types.
    pub fn label_of(&self, id: &KgId) -> Option<String> {
        if let Some(n) = self.nodes.resolve(id) {
            return self.nodes.label_sym(n).and_then(|s| self.interner.lookup(s));
        }
        if let Some(r) = self.rels.resolve(id) {
            return self.rels.label_sym(r).and_then(|s| self.interner.lookup(s));
        }
        None
    }

    pub fn kind_of(&self, id: &KgId) -> Option<TermKind> {
        if let Some(n) = self.nodes.resolve(id) {
            return self.nodes.kind(n).map(TermKind::from);
        }
        if self.rels.resolve(id).is_some() {
            return Some(TermKind::Relation);
        }
        None
    }

    /// Popularity prior in `[0,1]`: log-scaled degree for nodes, log-scaled
    /// edge count for relation types. Unknown ids get 0.
    pub fn popularity(&self, id: &KgId) -> f64 {
        if let Some(n) = self.nodes.resolve(id) {
            let deg = self.edges.degree(n) as f64;
            let max = self.max_degree as f64;
            if max < 1.0 {
                return 0.0;
            }
            return (1.0 + deg).ln() / (1.0 + max).ln();
        }
        if let Some(r) = self.rels.resolve(id) {
            let count = self.edges.rel_count(r) as f64;
            let max = self.max_rel_count as f64;
            if max < 1.0 {
                return 0.0;
            }
            return (1.0 + count).ln() / (1.0 + max).ln();
        }
        0.0
    }

    /// Whether the node participates in any edge of the given relation type,
    /// in either direction.
    pub fn connected(&self, node: &KgId, relation: &KgId) -> bool {
        let (Some(n), Some(r)) = (self.nodes.resolve(node), self.rels.resolve(relation)) else {
            return false;
        };
        self.edges.touches(n, r)
    }

    pub(crate) fn string(&self, sym: Sym) -> String {
        self.interner.lookup(sym).unwrap_or_default()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`KnowledgeGraph`]. Freezing the graph at build time is what
/// lets the access layer promise read-only, lock-free execution.
#[derive(Default)]
pub struct KgBuilder {
    interner: StringInterner,
    nodes: NodeStore,
    rels: RelTypeStore,
    edges: Vec<(KgId, KgId, KgId)>,
}

impl KgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&mut self, id: impl Into<KgId>, label: &str, aliases: &[&str]) -> &mut Self {
        let label_sym = self.interner.intern(label);
        let alias_syms = aliases.iter().map(|a| self.interner.intern(a)).collect();
        self.nodes
            .add(id.into(), NodeKind::Entity, label_sym, alias_syms);
        self
    }

    /// Literal nodes use their lexical form as both external id and label.
    pub fn literal(&mut self, value: &str) -> &mut Self {
        let sym = self.interner.intern(value);
        self.nodes.add(KgId::new(value), NodeKind::Literal, sym, vec![]);
        self
    }

    pub fn relation(&mut self, id: impl Into<KgId>, label: &str, aliases: &[&str]) -> &mut Self {
        let label_sym = self.interner.intern(label);
        let alias_syms = aliases.iter().map(|a| self.interner.intern(a)).collect();
        self.rels.add(id.into(), label_sym, alias_syms);
        self
    }

    /// Record a triple. Unknown subjects/objects become implicit nodes
    /// (object text that is not a declared id becomes a literal node);
    /// unknown relations become implicit relation types.
    pub fn triple(
        &mut self,
        subject: impl Into<KgId>,
        relation: impl Into<KgId>,
        object: impl Into<KgId>,
    ) -> &mut Self {
        self.edges.push((subject.into(), relation.into(), object.into()));
        self
    }

    pub fn build(self) -> KnowledgeGraph {
        let KgBuilder {
            interner,
            mut nodes,
            mut rels,
            edges,
        } = self;

        let mut edge_store = EdgeStore::default();
        for (s, r, o) in edges {
            let s_id = nodes.resolve(&s).unwrap_or_else(|| {
                let sym = interner.intern(s.as_str());
                nodes.add(s.clone(), NodeKind::Entity, sym, vec![])
            });
            let r_id = rels.resolve(&r).unwrap_or_else(|| {
                let sym = interner.intern(r.as_str());
                rels.add(r.clone(), sym, vec![])
            });
            let o_id = nodes.resolve(&o).unwrap_or_else(|| {
                let sym = interner.intern(o.as_str());
                nodes.add(o.clone(), NodeKind::Literal, sym, vec![])
            });
            edge_store.add(Edge {
                source: s_id,
                rel: r_id,
                target: o_id,
            });
        }

        let node_labels = LabelIndex::build_nodes(&interner, &nodes);
        let rel_labels = LabelIndex::build_rels(&interner, &rels);
        let max_degree = edge_store.max_degree();
        let max_rel_count = edge_store.max_rel_count();

        KnowledgeGraph {
            interner,
            nodes,
            rels,
            edges: edge_store,
            node_labels,
            rel_labels,
            max_degree,
            max_rel_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movie_kg() -> KnowledgeGraph {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &["Inception (film)"]);
        b.entity("Q25191", "Christopher Nolan", &[]);
        b.entity("Q3772", "Interstellar", &[]);
        b.relation("P57", "director", &["directed by"]);
        b.triple("Q25188", "P57", "Q25191");
        b.triple("Q3772", "P57", "Q25191");
        b.build()
    }

    #[test]
    fn interner_round_trips() {
        let interner = StringInterner::new();
        let a = interner.intern("Inception");
        let b = interner.intern("Inception");
        assert_eq!(a, b);
        assert_eq!(interner.lookup(a).as_deref(), Some("Inception"));
        assert_eq!(interner.id_of("Nolan"), None);
    }

    #[test]
    fn builder_indexes_edges_both_ways() {
        let kg = movie_kg();
        let film = kg.nodes.resolve(&KgId::new("Q25188")).unwrap();
        let nolan = kg.nodes.resolve(&KgId::new("Q25191")).unwrap();
        let directed = kg.rels.resolve(&KgId::new("P57")).unwrap();

        assert!(kg.edges.has_edge(film, directed, nolan));
        assert_eq!(kg.edges.targets(film, directed).len(), 1);
        assert_eq!(kg.edges.sources(nolan, directed).len(), 2);
    }

    #[test]
    fn popularity_scales_with_degree() {
        let kg = movie_kg();
        let nolan = kg.popularity(&KgId::new("Q25191"));
        let film = kg.popularity(&KgId::new("Q25188"));
        assert!(nolan > film, "nolan={nolan} film={film}");
        assert!(nolan <= 1.0);
        assert_eq!(kg.popularity(&KgId::new("Q404")), 0.0);
    }

    #[test]
    fn labels_and_kinds_resolve() {
        let kg = movie_kg();
        assert_eq!(
            kg.label_of(&KgId::new("Q25191")).as_deref(),
            Some("Christopher Nolan")
        );
        assert_eq!(kg.label_of(&KgId::new("P57")).as_deref(), Some("director"));
        assert_eq!(kg.kind_of(&KgId::new("P57")), Some(TermKind::Relation));
        assert_eq!(kg.kind_of(&KgId::new("Q25188")), Some(TermKind::Entity));
        assert_eq!(kg.kind_of(&KgId::new("Q404")), None);
    }

    #[test]
    fn connectivity_check() {
        let kg = movie_kg();
        assert!(kg.connected(&KgId::new("Q25188"), &KgId::new("P57")));
        assert!(kg.connected(&KgId::new("Q25191"), &KgId::new("P57")));
        assert!(!kg.connected(&KgId::new("Q404"), &KgId::new("P57")));
    }
}
