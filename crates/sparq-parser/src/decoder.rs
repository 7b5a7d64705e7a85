//! Grammar-constrained beam search.
//!
//! Each beam item carries its own [`GrammarMachine`]; expansion only ever
//! proposes tokens the machine accepts, so completed hypotheses are
//! well-formed by construction. Decoding is bounded two ways: a step budget
//! (grammar steps, not tokens) and an optional wall-clock deadline checked
//! every step, which is the cooperative half of request cancellation.

use std::time::Instant;
use tracing::trace;

use crate::grammar::{GrammarMachine, TokenKind};
use crate::model::SequenceModel;
use crate::vocab::TokenId;
use crate::ParseFailure;

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub beam_width: usize,
    pub step_budget: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam_width: 5,
            step_budget: 96,
        }
    }
}

/// A completed decode hypothesis.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub kinds: Vec<TokenKind>,
    pub log_prob: f64,
}

impl Hypothesis {
    /// Length-normalized confidence in `(0, 1]`.
    pub fn confidence(&self) -> f64 {
        if self.kinds.is_empty() {
            return 0.0;
        }
        (self.log_prob / self.kinds.len() as f64).exp().min(1.0)
    }
}

#[derive(Debug, Clone)]
struct Partial {
    machine: GrammarMachine,
    kinds: Vec<TokenKind>,
    token_ids: Vec<TokenId>,
    log_prob: f64,
}

/// Decode the n-best grammar-complete token sequences for a source question.
///
/// Returns hypotheses sorted best-first. Fails with `BudgetExhausted` when
/// the step budget runs out before any hypothesis completes, and with
/// `DeadlineExceeded` when the caller's deadline passes mid-decode.
pub fn decode(
    model: &dyn SequenceModel,
    source: &[TokenId],
    config: DecoderConfig,
    deadline: Option<Instant>,
) -> Result<Vec<Hypothesis>, ParseFailure> {
    let vocab = model.target_vocab();
    let beam_width = config.beam_width.max(1);

    let mut beam = vec![Partial {
        machine: GrammarMachine::new(),
        kinds: Vec::new(),
        token_ids: Vec::new(),
        log_prob: 0.0,
    }];
    let mut complete: Vec<Hypothesis> = Vec::new();

    for step in 0..config.step_budget {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ParseFailure::DeadlineExceeded);
            }
        }
        if beam.is_empty() {
            break;
        }

        let mut expanded: Vec<Partial> = Vec::new();
        for partial in &beam {
            for kind in partial.machine.valid_next() {
                let token_id = vocab.id(kind.token_str());
                let score = model.score(source, &partial.token_ids, token_id);
                let mut next = partial.clone();
                // The token came from valid_next, so advance accepts it.
                if next.machine.advance(kind).is_err() {
                    continue;
                }
                next.kinds.push(kind);
                next.token_ids.push(token_id);
                next.log_prob += score;
                expanded.push(next);
            }
        }

        // Deterministic beam pruning: score, then token sequence.
        expanded.sort_by(|a, b| {
            b.log_prob
                .partial_cmp(&a.log_prob)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.token_ids.cmp(&b.token_ids))
        });
        expanded.truncate(beam_width);

        let mut next_beam = Vec::new();
        for partial in expanded {
            if partial.machine.is_complete() {
                complete.push(Hypothesis {
                    kinds: partial.kinds,
                    log_prob: partial.log_prob,
                });
            } else {
                next_beam.push(partial);
            }
        }
        beam = next_beam;

        trace!(step, live = beam.len(), complete = complete.len(), "decode step");
        if complete.len() >= beam_width {
            break;
        }
    }

    if complete.is_empty() {
        let partial = beam
            .first()
            .map(|p| p.kinds.iter().map(|k| k.token_str().to_string()).collect())
            .unwrap_or_default();
        return Err(ParseFailure::BudgetExhausted {
            steps: config.step_budget,
            partial,
        });
    }

    complete.sort_by(|a, b| {
        b.log_prob
            .partial_cmp(&a.log_prob)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.kinds.len().cmp(&b.kinds.len()))
    });
    complete.truncate(beam_width);
    Ok(complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TranslationModel;

    fn fixture() -> TranslationModel {
        TranslationModel::from_aligned_pairs(&[
            (
                "who directed inception",
                "select var_x where brack_open <entity> <relation> var_x brack_close",
            ),
            (
                "who wrote hamlet",
                "select var_x where brack_open <entity> <relation> var_x brack_close",
            ),
            (
                "did nolan direct inception",
                "ask where brack_open <entity> <relation> <entity> brack_close",
            ),
        ])
    }

    fn encode(model: &TranslationModel, text: &str) -> Vec<TokenId> {
        model
            .source_vocab()
            .encode(&text.split_whitespace().map(String::from).collect::<Vec<_>>())
    }

    #[test]
    fn decodes_trained_shape() {
        let model = fixture();
        let source = encode(&model, "who directed inception");
        let hyps = decode(&model, &source, DecoderConfig::default(), None).unwrap();
        assert!(!hyps.is_empty());
        let best: Vec<&str> = hyps[0].kinds.iter().map(|k| k.token_str()).collect();
        assert_eq!(
            best,
            vec![
                "select",
                "var_x",
                "where",
                "brack_open",
                "<entity>",
                "<relation>",
                "var_x",
                "brack_close",
                "_end_"
            ]
        );
        assert!(hyps[0].confidence() > 0.0);
    }

    #[test]
    fn ask_questions_decode_to_ask_form(){
        let model = fixture();
        let source = encode(&model, "did nolan direct inception");
        let hyps = decode(&model, &source, DecoderConfig::default(), None).unwrap();
        assert_eq!(hyps[0].kinds[0], TokenKind::Ask);
    }

    #[test]
    fn every_hypothesis_is_grammar_complete() {
        let model = fixture();
        let source = encode(&model, "who directed inception");
        for hyp in decode(&model, &source, DecoderConfig::default(), None).unwrap() {
            let mut m = GrammarMachine::new();
            for &k in &hyp.kinds {
                m.advance(k).unwrap();
            }
            assert!(m.is_complete());
        }
    }

    #[test]
    fn tiny_budget_fails_with_partial() {
        let model = fixture();
        let source = encode(&model, "who directed inception");
        let config = DecoderConfig {
            beam_width: 3,
            step_budget: 2,
        };
        match decode(&model, &source, config, None) {
            Err(ParseFailure::BudgetExhausted { steps, partial }) => {
                assert_eq!(steps, 2);
                assert_eq!(partial.len(), 2);
            }
            other => panic!("expected budget exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn expired_deadline_cancels() {
        let model = fixture();
        let source = encode(&model, "who directed inception");
        let deadline = Some(Instant::now() - std::time::Duration::from_millis(1));
        assert!(matches!(
            decode(&model, &source, DecoderConfig::default(), deadline),
            Err(ParseFailure::DeadlineExceeded)
        ));
    }

    #[test]
    fn decoding_is_deterministic() {
        let model = fixture();
        let source = encode(&model, "who directed inception");
        let a = decode(&model, &source, DecoderConfig::default(), None).unwrap();
        let b = decode(&model, &source, DecoderConfig::default(), None).unwrap();
        let seq = |hs: &[Hypothesis]| {
            hs.iter().map(|h| h.kinds.clone()).collect::<Vec<_>>()
        };
        assert_eq!(seq(&a), seq(&b));
    }
}
