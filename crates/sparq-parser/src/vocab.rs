//! Token vocabularies for the sequence model.
//!
//! Out-of-vocabulary source tokens map to an explicit `<unk>` id; they are
//! never dropped, so token positions stay aligned with the question and
//! mention spans remain valid.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::grammar::TokenKind;

pub const UNK: &str = "<unk>";

pub type TokenId = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    tokens: Vec<String>,
    #[serde(skip)]
    by_str: AHashMap<String, TokenId>,
    unk: TokenId,
}

impl Vocabulary {
    /// Build from a token list. `<unk>` is appended if absent.
    pub fn new(mut tokens: Vec<String>) -> Self {
        if !tokens.iter().any(|t| t == UNK) {
            tokens.push(UNK.to_string());
        }
        let by_str = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as TokenId))
            .collect::<AHashMap<_, _>>();
        let unk = by_str[UNK];
        Self {
            tokens,
            by_str,
            unk,
        }
    }

    /// The fixed target-side vocabulary: the skeleton token language.
    pub fn query_tokens() -> Self {
        Self::new(
            TokenKind::all()
                .iter()
                .map(|k| k.token_str().to_string())
                .collect(),
        )
    }

    /// Restore the lookup table after deserialization.
    pub(crate) fn rebuild_lookup(&mut self) {
        self.by_str = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as TokenId))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn unk_id(&self) -> TokenId {
        self.unk
    }

    pub fn id(&self, token: &str) -> TokenId {
        self.by_str.get(token).copied().unwrap_or(self.unk)
    }

    pub fn id_strict(&self, token: &str) -> Option<TokenId> {
        self.by_str.get(token).copied()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Encode a token sequence; OOV tokens become `<unk>`.
    pub fn encode(&self, tokens: &[String]) -> Vec<TokenId> {
        tokens.iter().map(|t| self.id(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oov_maps_to_unk_not_dropped() {
        let v = Vocabulary::new(vec!["who".into(), "directed".into()]);
        let encoded = v.encode(&["who".into(), "zzz".into(), "directed".into()]);
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[1], v.unk_id());
    }

    #[test]
    fn query_vocab_covers_grammar() {
        let v = Vocabulary::query_tokens();
        for kind in TokenKind::all() {
            assert!(v.id_strict(kind.token_str()).is_some(), "{kind:?}");
        }
    }

    #[test]
    fn lookup_rebuild_round_trips() {
        let v = Vocabulary::new(vec!["who".into()]);
        let bytes = bincode::serialize(&v).unwrap();
        let mut v2: Vocabulary = bincode::deserialize(&bytes).unwrap();
        v2.rebuild_lookup();
        assert_eq!(v2.id("who"), v.id("who"));
        assert_eq!(v2.id("missing"), v2.unk_id());
    }
}
