//! Inverted token index over node and relation labels.
//!
//! Candidate generation for linking needs "which identifiers could this
//! surface string mean" to be cheap. The index maps lowercased label/alias
//! tokens to bitmaps of ids; the linker unions per-token bitmaps and ranks
//! the survivors. Tokenization is intentionally simple and deterministic:
//! split on non-alphanumeric characters, lowercase, drop one-char tokens.
//!
//! Built once at graph build time; the store is immutable afterwards, so
//! there is no invalidation protocol.

use ahash::AHashMap;
use roaring::RoaringBitmap;

use crate::{NodeStore, RelTypeStore, StringInterner, Sym};

/// Tokenize a label or query string for index lookup.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 || t.chars().any(|c| c.is_numeric()))
        .map(String::from)
        .collect()
}

/// Token -> bitmap of ids (node ids or relation type ids, per index).
#[derive(Debug, Default)]
pub struct LabelIndex {
    token_to_ids: AHashMap<String, RoaringBitmap>,
    /// Exact lowercased full label/alias -> ids, for exact-match priority.
    exact: AHashMap<String, RoaringBitmap>,
}

impl LabelIndex {
    fn insert_label(&mut self, interner: &StringInterner, id: u32, sym: Sym) {
        let Some(label) = interner.lookup(sym) else {
            return;
        };
        for token in tokenize(&label) {
            self.token_to_ids.entry(token).or_default().insert(id);
        }
        self.exact.entry(label.to_lowercase()).or_default().insert(id);
    }

    pub(crate) fn build_nodes(interner: &StringInterner, nodes: &NodeStore) -> Self {
        let mut index = Self::default();
        for id in 0..nodes.len() as u32 {
            if let Some(sym) = nodes.label_sym(id) {
                index.insert_label(interner, id, sym);
            }
            for &alias in nodes.alias_syms(id) {
                index.insert_label(interner, id, alias);
            }
        }
        index
    }

    pub(crate) fn build_rels(interner: &StringInterner, rels: &RelTypeStore) -> Self {
        let mut index = Self::default();
        for id in 0..rels.len() as u32 {
            if let Some(sym) = rels.label_sym(id) {
                index.insert_label(interner, id, sym);
            }
            for &alias in rels.alias_syms(id) {
                index.insert_label(interner, id, alias);
            }
        }
        index
    }

    /// Ids whose label shares at least one token with `text`.
    pub fn candidates(&self, text: &str) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for token in tokenize(text) {
            if let Some(ids) = self.token_to_ids.get(&token) {
                out |= ids;
            }
        }
        out
    }

    /// Ids whose full label or alias equals `text` case-insensitively.
    pub fn exact_matches(&self, text: &str) -> RoaringBitmap {
        self.exact
            .get(&text.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tokens of `text` that match an id's indexed tokens.
    pub fn token_overlap(&self, text: &str, id: u32) -> usize {
        tokenize(text)
            .iter()
            .filter(|t| {
                self.token_to_ids
                    .get(*t)
                    .map(|ids| ids.contains(id))
                    .unwrap_or(false)
            })
            .count()
    }
}
