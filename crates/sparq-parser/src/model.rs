//! The frozen sequence-model boundary.
//!
//! The parser does not train anything: it consumes a model produced by an
//! external learning process, loaded from a binary artifact. [`SequenceModel`]
//! is the seam; [`TranslationModel`] is the bundled implementation, a
//! lexical-association + target-bigram scorer in the shape of a phrase-table
//! distillation of a seq2seq translator. Scoring is a pure function of the
//! (read-only) model state, so concurrent requests share one instance.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::vocab::{TokenId, Vocabulary};

const MAGIC: &[u8; 8] = b"SPQNM\x01\x00\x00";

/// Sentinel "previous token" id for the first decode step.
pub const BOS: TokenId = TokenId::MAX;

/// Smoothing floor so unseen events score low, not minus infinity.
const EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model artifact decode failed: {detail}")]
    Decode { detail: String },
}

/// A frozen translation model: scores target-token continuations given the
/// source question.
pub trait SequenceModel: Send + Sync {
    fn source_vocab(&self) -> &Vocabulary;

    fn target_vocab(&self) -> &Vocabulary;

    /// Log-score of emitting `next` after `prefix`, conditioned on `source`.
    /// Must be finite for every target token (smoothed), so grammar-valid
    /// continuations always remain comparable.
    fn score(&self, source: &[TokenId], prefix: &[TokenId], next: TokenId) -> f64;
}

/// Lexical-association translation model.
///
/// `assoc[(s, t)]` approximates P(t | s) for source token s and target token
/// t; `bigram[(p, t)]` approximates P(t | previous target p). The decode
/// score mixes the two, which is enough to let training pairs steer the
/// constrained decoder toward the right skeleton shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationModel {
    source_vocab: Vocabulary,
    target_vocab: Vocabulary,
    assoc: AHashMap<(TokenId, TokenId), f64>,
    bigram: AHashMap<(TokenId, TokenId), f64>,
}

impl TranslationModel {
    /// Estimate a model from aligned (question, encoded skeleton) pairs.
    ///
    /// This is how artifacts are produced by the external training pipeline
    /// and how tests build small fixture models; inference never calls it.
    pub fn from_aligned_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut source_tokens: Vec<String> = Vec::new();
        for (question, _) in pairs {
            for token in question.split_whitespace() {
                let token = token.to_lowercase();
                if !source_tokens.contains(&token) {
                    source_tokens.push(token);
                }
            }
        }
        let source_vocab = Vocabulary::new(source_tokens);
        let target_vocab = Vocabulary::query_tokens();

        let mut assoc_counts: AHashMap<(TokenId, TokenId), f64> = AHashMap::new();
        let mut source_totals: AHashMap<TokenId, f64> = AHashMap::new();
        let mut bigram_counts: AHashMap<(TokenId, TokenId), f64> = AHashMap::new();
        let mut prev_totals: AHashMap<TokenId, f64> = AHashMap::new();

        for (question, target) in pairs {
            let src: Vec<TokenId> = question
                .split_whitespace()
                .map(|t| source_vocab.id(&t.to_lowercase()))
                .collect();
            let tgt: Vec<TokenId> = target
                .split_whitespace()
                .map(|t| target_vocab.id(t))
                .collect();

            for &t in &tgt {
                for &s in &src {
                    *assoc_counts.entry((s, t)).or_default() += 1.0 / src.len() as f64;
                    *source_totals.entry(s).or_default() += 1.0 / src.len() as f64;
                }
            }
            let mut prev = BOS;
            for &t in &tgt {
                *bigram_counts.entry((prev, t)).or_default() += 1.0;
                *prev_totals.entry(prev).or_default() += 1.0;
                prev = t;
            }
            // Terminal transition.
            let end = target_vocab.id("_end_");
            *bigram_counts.entry((prev, end)).or_default() += 1.0;
            *prev_totals.entry(prev).or_default() += 1.0;
        }

        let assoc = assoc_counts
            .into_iter()
            .map(|((s, t), c)| ((s, t), c / source_totals[&s]))
            .collect();
        let bigram = bigram_counts
            .into_iter()
            .map(|((p, t), c)| ((p, t), c / prev_totals[&p]))
            .collect();

        Self {
            source_vocab,
            target_vocab,
            assoc,
            bigram,
        }
    }

    fn lexical(&self, source: &[TokenId], next: TokenId) -> f64 {
        if source.is_empty() {
            return 0.0;
        }
        let sum: f64 = source
            .iter()
            .map(|&s| self.assoc.get(&(s, next)).copied().unwrap_or(0.0))
            .sum();
        sum / source.len() as f64
    }

    fn transition(&self, prev: TokenId, next: TokenId) -> f64 {
        self.bigram.get(&(prev, next)).copied().unwrap_or(0.0)
    }

    // ------------------------------------------------------------------
    // Artifact IO
    // ------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let body = bincode::serialize(self).map_err(|e| ModelError::Decode {
            detail: e.to_string(),
        })?;
        let mut file = fs::File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&body)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = fs::read(path)?;
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(ModelError::Decode {
                detail: "bad magic: not a model artifact".into(),
            });
        }
        let mut model: TranslationModel =
            bincode::deserialize(&bytes[MAGIC.len()..]).map_err(|e| ModelError::Decode {
                detail: e.to_string(),
            })?;
        model.source_vocab.rebuild_lookup();
        model.target_vocab.rebuild_lookup();
        Ok(model)
    }
}

impl SequenceModel for TranslationModel {
    fn source_vocab(&self) -> &Vocabulary {
        &self.source_vocab
    }

    fn target_vocab(&self) -> &Vocabulary {
        &self.target_vocab
    }

    fn score(&self, source: &[TokenId], prefix: &[TokenId], next: TokenId) -> f64 {
        let prev = prefix.last().copied().unwrap_or(BOS);
        let mixed = 0.5 * self.lexical(source, next) + 0.5 * self.transition(prev, next);
        (mixed + EPSILON).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fixture() -> TranslationModel {
        TranslationModel::from_aligned_pairs(&[
            (
                "who directed inception",
                "select var_x where brack_open <entity> <relation> var_x brack_close",
            ),
            (
                "who directed interstellar",
                "select var_x where brack_open <entity> <relation> var_x brack_close",
            ),
            (
                "did nolan direct inception",
                "ask where brack_open <entity> <relation> <entity> brack_close",
            ),
        ])
    }

    #[test]
    fn seen_transitions_outscore_unseen() {
        let m = fixture();
        let src = m.source_vocab().encode(&[
            "who".into(),
            "directed".into(),
            "inception".into(),
        ]);
        let select = m.target_vocab().id("select");
        let ask = m.target_vocab().id("ask");
        // "who directed ..." was always select-form in training.
        assert!(m.score(&src, &[], select) > m.score(&src, &[], ask));
    }

    #[test]
    fn scores_are_finite_everywhere() {
        let m = fixture();
        let src = m.source_vocab().encode(&["zzz".into()]);
        for id in 0..m.target_vocab().len() as TokenId {
            assert!(m.score(&src, &[], id).is_finite());
        }
    }

    #[test]
    fn bigram_normalized() {
        let m = fixture();
        let total: f64 = (0..m.target_vocab().len() as TokenId)
            .map(|t| m.transition(BOS, t))
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn artifact_round_trip() {
        let m = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        m.save(&path).unwrap();
        let loaded = TranslationModel::load(&path).unwrap();

        let src = m.source_vocab().encode(&["who".into(), "directed".into()]);
        let select = m.target_vocab().id("select");
        assert_relative_eq!(
            m.score(&src, &[], select),
            loaded.score(&src, &[], select)
        );
    }

    #[test]
    fn rejects_bad_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        fs::write(&path, b"definitely not a model").unwrap();
        assert!(matches!(
            TranslationModel::load(&path),
            Err(ModelError::Decode { .. })
        ));
    }
}
