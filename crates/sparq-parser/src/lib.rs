//! Semantic parser: question -> query skeleton.
//!
//! The parser is a sequence-to-sequence translator decoded under an explicit
//! query grammar. At every decode step the beam is restricted to tokens that
//! are valid in the current grammatical state, so every emitted skeleton is
//! well-formed by construction; there is no string post-processing pass.
//!
//! Pieces:
//!
//! - [`Question`]: raw text plus its normalized token form (immutable).
//! - [`grammar`]: the skeleton token language as a state machine.
//! - [`model`]: the frozen [`SequenceModel`] boundary and the bincode
//!   translation-model artifact. Training happens elsewhere; inference here
//!   is pure and read-only.
//! - [`decoder`]: grammar-constrained beam search with n-best output.
//! - [`mention`]: surface-mention tagging, giving each slot its source span.
//! - [`SemanticParser`]: the `parse(question) -> (skeleton, confidence)`
//!   contract tying the above together.

pub mod decoder;
pub mod grammar;
pub mod mention;
pub mod model;
pub mod skeleton;
pub mod vocab;

mod parse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decoder::{DecoderConfig, Hypothesis};
pub use grammar::{GrammarMachine, TokenKind, VarName};
pub use mention::{Mention, MentionTagger};
pub use model::{SequenceModel, TranslationModel};
pub use parse::{ParsedSkeleton, ParserConfig, SemanticParser};
pub use skeleton::{QuerySkeleton, SkeletonToken, Slot, SlotId, SlotType};
pub use vocab::Vocabulary;

// ============================================================================
// Question
// ============================================================================

/// A span of question tokens, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A question: raw text plus tokenized form. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    raw: String,
    tokens: Vec<String>,
}

impl Question {
    /// Tokenize raw text. Punctuation is stripped, original casing kept
    /// (mention tagging uses it); the model sees lowercased tokens.
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseFailure> {
        let raw = raw.into();
        let tokens = tokenize_question(&raw);
        if tokens.is_empty() {
            return Err(ParseFailure::EmptyQuestion);
        }
        Ok(Self { raw, tokens })
    }

    /// Use a caller-supplied tokenization instead of the default one.
    pub fn pre_tokenized(raw: impl Into<String>, tokens: Vec<String>) -> Result<Self, ParseFailure> {
        if tokens.is_empty() {
            return Err(ParseFailure::EmptyQuestion);
        }
        Ok(Self {
            raw: raw.into(),
            tokens,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Lowercased tokens, as fed to the sequence model.
    pub fn model_tokens(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.to_lowercase()).collect()
    }

    /// Surface text of a token span.
    pub fn span_text(&self, span: Span) -> String {
        self.tokens[span.start.min(self.tokens.len())..span.end.min(self.tokens.len())].join(" ")
    }
}

/// Split on whitespace, strip surrounding punctuation, keep inner
/// apostrophes and digits. Quoted phrases stay one token.
pub fn tokenize_question(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = raw.trim();
    while let Some(open) = rest.find('"') {
        // Tokens before the quote, then the quoted phrase as one token.
        for t in rest[..open].split_whitespace() {
            push_token(&mut tokens, t);
        }
        match rest[open + 1..].find('"') {
            Some(close) => {
                let phrase = &rest[open + 1..open + 1 + close];
                if !phrase.trim().is_empty() {
                    tokens.push(phrase.trim().to_string());
                }
                rest = &rest[open + close + 2..];
            }
            None => {
                rest = &rest[open + 1..];
            }
        }
    }
    for t in rest.split_whitespace() {
        push_token(&mut tokens, t);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, raw: &str) {
    let cleaned: String = raw
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_string();
    if !cleaned.is_empty() {
        tokens.push(cleaned);
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Non-fatal parse failures; the orchestrator surfaces them as "no answer".
#[derive(Debug, Clone, Error)]
pub enum ParseFailure {
    #[error("question is empty after tokenization")]
    EmptyQuestion,

    #[error("decoding did not complete within {steps} steps")]
    BudgetExhausted {
        steps: usize,
        /// Best partial skeleton at the time the budget ran out.
        partial: Vec<String>,
    },

    #[error("decoder produced no hypothesis")]
    NoSkeleton,

    #[error("skeleton has {slots} slots but only {mentions} mentions were found")]
    MentionMismatch { slots: usize, mentions: usize },

    #[error("decoding deadline exceeded")]
    DeadlineExceeded,
}
