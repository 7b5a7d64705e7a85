//! Surface-mention tagging.
//!
//! Slots need source spans so the linker knows what text to search for. The
//! tagger finds content-token spans (stopwords and question words removed),
//! splits them at capitalization boundaries, and gives each span a type
//! hint: capitalized or quoted runs look like entities, numeric runs like
//! literals, everything else like a relation phrase.
//!
//! This is a deterministic stand-in for a learned BIO tagger; it sits behind
//! its own type so one can be swapped in without touching the parser.

use crate::skeleton::{Slot, SlotType};
use crate::{ParseFailure, Question, Span};

/// Stopwords dropped during mention detection (question words included).
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "what", "when", "where", "which", "who", "whom", "whose", "why", "how", "this",
    "that", "these", "those", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her",
    "us", "them", "my", "your", "his", "its", "our", "their", "and", "or", "but", "if", "then",
    "than", "so", "as", "for", "with", "about", "to", "from", "in", "on", "at", "by", "of",
    "up", "out", "into", "onto", "many", "much", "other", "there",
];

/// A tagged mention: a question span plus a type hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub span: Span,
    pub hint: SlotType,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MentionTagger;

impl MentionTagger {
    pub fn new() -> Self {
        Self
    }

    /// Tag content spans in question order.
    pub fn tag(&self, question: &Question) -> Vec<Mention> {
        let tokens = question.tokens();
        let mut mentions = Vec::new();
        let mut run_start: Option<usize> = None;

        for i in 0..=tokens.len() {
            let is_content = i < tokens.len() && is_content_token(&tokens[i]);
            match (run_start, is_content) {
                (None, true) => run_start = Some(i),
                (Some(start), false) => {
                    split_run(tokens, start, i, &mut mentions);
                    run_start = None;
                }
                _ => {}
            }
        }
        mentions
    }

    /// Assign one mention span per slot.
    ///
    /// Two passes: hint-matching mentions first (skeleton order), then the
    /// remaining mentions in question order. If there are fewer mentions
    /// than slots, multi-token mentions are split into single tokens before
    /// giving up.
    pub fn assign(
        &self,
        question: &Question,
        slots: &[Slot],
    ) -> Result<Vec<Span>, ParseFailure> {
        let mut mentions = self.tag(question);
        if mentions.len() < slots.len() {
            mentions = explode(&mentions, question);
        }
        if mentions.len() < slots.len() {
            return Err(ParseFailure::MentionMismatch {
                slots: slots.len(),
                mentions: mentions.len(),
            });
        }

        let mut taken = vec![false; mentions.len()];
        let mut spans: Vec<Option<Span>> = vec![None; slots.len()];

        for (slot_idx, slot) in slots.iter().enumerate() {
            if let Some(m_idx) = (0..mentions.len())
                .find(|&i| !taken[i] && mentions[i].hint == slot.expected_type)
            {
                taken[m_idx] = true;
                spans[slot_idx] = Some(mentions[m_idx].span);
            }
        }
        let mut assigned = Vec::with_capacity(slots.len());
        for span in spans {
            match span {
                Some(s) => assigned.push(s),
                None => match (0..mentions.len()).find(|&i| !taken[i]) {
                    Some(m_idx) => {
                        taken[m_idx] = true;
                        assigned.push(mentions[m_idx].span);
                    }
                    None => {
                        return Err(ParseFailure::MentionMismatch {
                            slots: slots.len(),
                            mentions: mentions.len(),
                        })
                    }
                },
            }
        }

        Ok(assigned)
    }
}

fn is_content_token(token: &str) -> bool {
    let lower = token.to_lowercase();
    !STOPWORDS.contains(&lower.as_str())
}

fn is_capitalized(token: &str) -> bool {
    token.chars().next().map(char::is_uppercase).unwrap_or(false)
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_numeric())
}

fn hint_for(tokens: &[String], span: Span) -> SlotType {
    let slice = &tokens[span.start..span.end];
    if slice.iter().all(|t| is_numeric(t)) {
        SlotType::Literal
    } else if slice.iter().any(|t| is_capitalized(t)) {
        SlotType::Entity
    } else {
        SlotType::Relation
    }
}

/// Split a content run at capitalization boundaries: `directed Inception`
/// becomes a relation-ish span and an entity-ish span.
fn split_run(tokens: &[String], start: usize, end: usize, out: &mut Vec<Mention>) {
    let mut seg_start = start;
    for i in start + 1..end {
        let boundary = is_capitalized(&tokens[i]) != is_capitalized(&tokens[i - 1])
            || is_numeric(&tokens[i]) != is_numeric(&tokens[i - 1]);
        if boundary {
            let span = Span::new(seg_start, i);
            out.push(Mention {
                hint: hint_for(tokens, span),
                span,
            });
            seg_start = i;
        }
    }
    let span = Span::new(seg_start, end);
    out.push(Mention {
        hint: hint_for(tokens, span),
        span,
    });
}

/// Break every multi-token mention into single-token mentions.
fn explode(mentions: &[Mention], question: &Question) -> Vec<Mention> {
    let tokens = question.tokens();
    let mut out = Vec::new();
    for m in mentions {
        if m.span.len() <= 1 {
            out.push(m.clone());
            continue;
        }
        for i in m.span.start..m.span.end {
            let span = Span::new(i, i + 1);
            out.push(Mention {
                hint: hint_for(tokens, span),
                span,
            });
        }
    }
    out
}
