//! End-to-end question answering: parse, resolve, execute.
//!
//! The pipeline owns the `answer()` contract. Every invocation is
//! independent; the model and the KG backend are the only shared resources
//! and both are read-only, so callers may run any number of questions
//! concurrently over one [`Pipeline`]. A caller-facing timeout bounds the
//! whole request: the parser receives it as a cooperative deadline, the
//! async resolve and execute stages are raced against it.
//!
//! Skeleton hypotheses are tried best-first: when the top skeleton fails to
//! resolve, the next one gets its chance before the request is declared
//! unresolvable. The reported confidence is the product of the winning
//! skeleton's parse confidence and the mean grounding confidence of its
//! bindings, so a perfect parse over exact labels reports 1.0.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use sparq_kg::{AnswerEntry, KgBackend, KgError};
use sparq_linker::{Linker, LinkerConfig, TieBreakPolicy};
use sparq_parser::{
    ParseFailure, ParserConfig, Question, SemanticParser, SequenceModel,
};
use sparq_resolver::{ResolveError, ResolvedQuery, Resolver};

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline knobs. All fields have serde defaults, so a config file may
/// specify only what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Candidate cap per slot (the linker's K).
    pub max_candidates_per_slot: usize,
    /// Beam width for skeleton decoding; also the n-best fallback depth.
    pub beam_width: usize,
    /// Decoder step budget per question.
    pub decode_step_budget: usize,
    /// Whole-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Linker tie-break policy for equal-score candidates.
    pub tie_break: TieBreakPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_candidates_per_slot: 20,
            beam_width: 5,
            decode_step_budget: 96,
            timeout_ms: 10_000,
            tie_break: TieBreakPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Outcome types
// ============================================================================

/// The caller-visible answer: ordered entries plus a combined confidence.
///
/// An empty entry list is the valid "no answer exists" outcome, not a
/// failure; it serializes with the `NO_ANSWER` reason code so downstream
/// consumers need only one discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSet {
    pub entries: Vec<AnswerEntry>,
    pub confidence: f64,
}

impl AnswerSet {
    pub fn is_no_answer(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        self.is_no_answer().then_some("NO_ANSWER")
    }
}

#[derive(Debug, Error)]
pub enum PipelineFailure {
    #[error("parse failure: {0}")]
    Parse(#[from] ParseFailure),

    #[error("resolution failure: {0}")]
    Resolution(#[from] ResolveError),

    #[error("execution failure on `{query}`: {source}")]
    Execution {
        /// Rendered form of the query that failed, for diagnostics.
        query: String,
        source: KgError,
    },

    #[error("request deadline of {0:?} exceeded")]
    Timeout(Duration),
}

impl PipelineFailure {
    /// Machine-readable reason code for external consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineFailure::Parse(_) => "PARSE_FAILURE",
            PipelineFailure::Resolution(_) => "RESOLUTION_FAILURE",
            PipelineFailure::Execution { .. } | PipelineFailure::Timeout(_) => {
                "EXECUTION_FAILURE"
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    parser: SemanticParser,
    resolver: Resolver,
    backend: Arc<dyn KgBackend>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        model: Arc<dyn SequenceModel>,
        backend: Arc<dyn KgBackend>,
        config: PipelineConfig,
    ) -> Self {
        let parser = SemanticParser::with_config(
            model,
            ParserConfig {
                beam_width: config.beam_width,
                step_budget: config.decode_step_budget,
            },
        );
        let linker = Linker::with_config(
            Arc::clone(&backend),
            LinkerConfig {
                max_candidates: config.max_candidates_per_slot,
                tie_break: config.tie_break,
            },
        );
        Self {
            parser,
            resolver: Resolver::new(linker),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer a plain-text question.
    pub async fn answer(&self, question: &str) -> Result<AnswerSet, PipelineFailure> {
        let question = Question::new(question)?;
        self.answer_question(&question).await
    }

    /// Answer a question, honoring pre-tokenization if the caller did it.
    pub async fn answer_question(
        &self,
        question: &Question,
    ) -> Result<AnswerSet, PipelineFailure> {
        let request_id = Uuid::new_v4();
        let span = info_span!("answer", %request_id);
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;

        let work = self.run(question, deadline);
        match tokio::time::timeout(timeout, work.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineFailure::Timeout(timeout)),
        }
    }

    async fn run(
        &self,
        question: &Question,
        deadline: Instant,
    ) -> Result<AnswerSet, PipelineFailure> {
        let parsed = self.parser.parse(question, Some(deadline))?;
        debug!(hypotheses = parsed.len(), "parsed question");

        // Best-first over skeleton hypotheses: the first one that resolves
        // wins. Only when all of them fail is the question unresolvable,
        // and the best hypothesis' failure is the one reported.
        let mut first_failure: Option<ResolveError> = None;
        for hypothesis in &parsed {
            match self.resolver.resolve(question, &hypothesis.skeleton).await {
                Ok(resolved) => {
                    let answer = self
                        .execute(&resolved, hypothesis.confidence)
                        .await?;
                    info!(
                        confidence = answer.confidence,
                        entries = answer.entries.len(),
                        "answered"
                    );
                    return Ok(answer);
                }
                Err(err @ ResolveError::Unresolvable { .. }) => {
                    debug!(%err, "hypothesis failed to resolve, trying next");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        match first_failure {
            Some(err) => Err(err.into()),
            None => Err(ParseFailure::NoSkeleton.into()),
        }
    }

    async fn execute(
        &self,
        resolved: &ResolvedQuery,
        parse_confidence: f64,
    ) -> Result<AnswerSet, PipelineFailure> {
        let result = self
            .backend
            .execute(&resolved.query)
            .await
            .map_err(|source| PipelineFailure::Execution {
                query: resolved.query.to_string(),
                source,
            })?;
        Ok(AnswerSet {
            entries: result.entries,
            confidence: parse_confidence * resolved.confidence(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparq_kg::{InMemoryBackend, KgBuilder, KgId, TermKind};
    use sparq_parser::TranslationModel;

    fn pipeline() -> Pipeline {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &[])
            .entity("Q25191", "Christopher Nolan", &["Nolan"])
            .entity("Q3772", "Interstellar", &[])
            .relation("P57", "director", &["directed by", "directed"])
            .triple("Q25188", "P57", "Q25191")
            .triple("Q3772", "P57", "Q25191");
        let backend = Arc::new(InMemoryBackend::new(Arc::new(b.build())));

        let model = TranslationModel::from_aligned_pairs(&[
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
        ]);
        Pipeline::new(Arc::new(model), backend, PipelineConfig::default())
    }

    #[tokio::test]
    async fn answers_single_hop_question() {
        let p = pipeline();
        let answer = p.answer("Who directed Inception?").await.unwrap();
        assert_eq!(answer.entries.len(), 1);
        assert_eq!(answer.entries[0].kg_id, KgId::new("Q25191"));
        assert_eq!(answer.entries[0].kind, TermKind::Entity);
        assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
        assert!(answer.reason_code().is_none());
    }

    #[tokio::test]
    async fn unknown_entity_surfaces_resolution_failure() {
        let p = pipeline();
        let err = p.answer("Who directed Zzyzx?").await.unwrap_err();
        assert_eq!(err.reason_code(), "RESOLUTION_FAILURE");
    }

    #[tokio::test]
    async fn empty_question_is_a_parse_failure() {
        let p = pipeline();
        let err = p.answer("   ").await.unwrap_err();
        assert_eq!(err.reason_code(), "PARSE_FAILURE");
    }

    #[tokio::test]
    async fn answers_are_idempotent() {
        let p = pipeline();
        let a = p.answer("Who directed Inception?").await.unwrap();
        let b = p.answer("Who directed Inception?").await.unwrap();
        assert_eq!(a.entries, b.entries);
        approx::assert_relative_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn zero_timeout_reports_failure_not_hang() {
        let mut b = KgBuilder::new();
        b.entity("Q1", "One", &[]).relation("P1", "rel", &[]);
        let backend = Arc::new(InMemoryBackend::new(Arc::new(b.build())));
        let model = TranslationModel::from_aligned_pairs(&[(
            "who made one",
            "select var_x where brack_open <entity> <relation> var_x brack_close",
        )]);
        let p = Pipeline::new(
            Arc::new(model),
            backend,
            PipelineConfig {
                timeout_ms: 0,
                ..PipelineConfig::default()
            },
        );
        let err = p.answer("Who made One?").await.unwrap_err();
        // Either the cooperative deadline fires inside the parser or the
        // outer timeout wins the race; both are bounded failures.
        assert!(matches!(
            err,
            PipelineFailure::Timeout(_) | PipelineFailure::Parse(ParseFailure::DeadlineExceeded)
        ));
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_candidates_per_slot, 20);
        assert_eq!(cfg.beam_width, 5);
        assert_eq!(cfg.decode_step_budget, 96);
        assert_eq!(cfg.timeout(), Duration::from_secs(10));
    }
}
