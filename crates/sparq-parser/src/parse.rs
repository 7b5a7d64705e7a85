//! The semantic parser facade: question in, n-best skeletons out.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::decoder::{decode, DecoderConfig};
use crate::mention::MentionTagger;
use crate::model::SequenceModel;
use crate::skeleton::QuerySkeleton;
use crate::{ParseFailure, Question};

/// Decode-time knobs; defaults match the decoder's.
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub beam_width: usize,
    pub step_budget: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let d = DecoderConfig::default();
        Self {
            beam_width: d.beam_width,
            step_budget: d.step_budget,
        }
    }
}

/// A skeleton plus the decoder's confidence in it (per-token geometric mean
/// of the model probability, in `(0, 1]`).
#[derive(Debug, Clone)]
pub struct ParsedSkeleton {
    pub skeleton: QuerySkeleton,
    pub confidence: f64,
}

/// Grammar-constrained semantic parser.
///
/// Parsing is a pure function of the question and the model: the same input
/// always yields the same skeleton list, in the same order.
pub struct SemanticParser {
    model: Arc<dyn SequenceModel>,
    tagger: MentionTagger,
    config: ParserConfig,
}

impl SemanticParser {
    pub fn new(model: Arc<dyn SequenceModel>) -> Self {
        Self::with_config(model, ParserConfig::default())
    }

    pub fn with_config(model: Arc<dyn SequenceModel>, config: ParserConfig) -> Self {
        Self {
            model,
            tagger: MentionTagger::new(),
            config,
        }
    }

    /// Parse a question into n-best skeletons, best-first.
    ///
    /// Hypotheses whose slots cannot be aligned with question mentions are
    /// dropped; if every hypothesis is dropped the first alignment failure
    /// is returned so the caller sees why.
    pub fn parse(
        &self,
        question: &Question,
        deadline: Option<Instant>,
    ) -> Result<Vec<ParsedSkeleton>, ParseFailure> {
        let source = self
            .model
            .source_vocab()
            .encode(&question.model_tokens());
        let decoder_config = DecoderConfig {
            beam_width: self.config.beam_width,
            step_budget: self.config.step_budget,
        };
        let hypotheses = decode(self.model.as_ref(), &source, decoder_config, deadline)?;

        let mut parsed = Vec::new();
        let mut first_failure: Option<ParseFailure> = None;
        for hyp in &hypotheses {
            let mut skeleton = QuerySkeleton::from_kinds(&hyp.kinds);
            match self.tagger.assign(question, skeleton.slots()) {
                Ok(spans) => {
                    skeleton.attach_spans(&spans);
                    parsed.push(ParsedSkeleton {
                        skeleton,
                        confidence: hyp.confidence(),
                    });
                }
                Err(err) => {
                    debug!(question = question.raw(), %err, "dropping unalignable hypothesis");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        if parsed.is_empty() {
            return Err(first_failure.unwrap_or(ParseFailure::NoSkeleton));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TranslationModel;
    use crate::skeleton::SlotType;
    use std::time::Duration;

    fn trained_parser() -> SemanticParser {
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
        SemanticParser::new(Arc::new(model))
    }

    #[test]
    fn parses_single_hop_question() {
        let parser = trained_parser();
        let q = Question::new("Who directed Inception?").unwrap();
        let parsed = parser.parse(&q, None).unwrap();
        assert!(!parsed.is_empty());

        let best = &parsed[0].skeleton;
        assert!(!best.is_ask());
        assert_eq!(best.slots().len(), 2);
        assert_eq!(best.slots()[0].expected_type, SlotType::Entity);
        assert_eq!(q.span_text(best.slots()[0].source_span), "Inception");
        assert_eq!(best.slots()[1].expected_type, SlotType::Relation);
        assert_eq!(q.span_text(best.slots()[1].source_span), "directed");
        assert!(parsed[0].confidence > 0.0 && parsed[0].confidence <= 1.0);
    }

    #[test]
    fn confidences_are_probabilities() {
        let parser = trained_parser();
        let q = Question::new("Who directed Inception?").unwrap();
        let parsed = parser.parse(&q, None).unwrap();
        for p in &parsed {
            assert!(p.confidence > 0.0 && p.confidence <= 1.0);
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let parser = trained_parser();
        let q = Question::new("Who directed Inception?").unwrap();
        let a = parser.parse(&q, None).unwrap();
        let b = parser.parse(&q, None).unwrap();
        let enc = |v: &[ParsedSkeleton]| {
            v.iter().map(|p| p.skeleton.encoded()).collect::<Vec<_>>()
        };
        assert_eq!(enc(&a), enc(&b));
    }

    #[test]
    fn deadline_propagates() {
        let parser = trained_parser();
        let q = Question::new("Who directed Inception?").unwrap();
        let expired = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            parser.parse(&q, Some(expired)),
            Err(ParseFailure::DeadlineExceeded)
        ));
    }

    #[test]
    fn unalignable_question_reports_mismatch() {
        let parser = trained_parser();
        // All tokens are stopwords, so no mentions can back the slots.
        let q = Question::pre_tokenized(
            "who did that",
            vec!["who".into(), "did".into(), "that".into()],
        )
        .unwrap();
        assert!(matches!(
            parser.parse(&q, None),
            Err(ParseFailure::MentionMismatch { .. })
        ));
    }
}
