//! Query skeleton: the parser's output artifact.
//!
//! A skeleton is an ordered sequence of query-language tokens in which every
//! mentioned entity/relation/literal is an unresolved, typed [`Slot`].
//! Skeletons are produced once by the decoder and are immutable; the
//! resolver consumes them without modification.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::grammar::{TokenKind, VarName};
use crate::Span;

/// Slot identifier, unique within one skeleton (emission order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What kind of identifier a slot must resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotType {
    Entity,
    Relation,
    Literal,
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Entity => f.write_str("entity"),
            SlotType::Relation => f.write_str("relation"),
            SlotType::Literal => f.write_str("literal"),
        }
    }
}

/// An unresolved placeholder. `source_span` points at the question tokens
/// the slot stands for; the linker searches the KG for that surface text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub expected_type: SlotType,
    pub source_span: Span,
}

/// One token of the skeleton language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkeletonToken {
    Select,
    Ask,
    Where,
    BrackOpen,
    BrackClose,
    SepDot,
    Var(VarName),
    Slot(SlotId),
}

/// A syntactically well-formed query skeleton.
///
/// Well-formedness is guaranteed by construction: skeletons are only built
/// from grammar-accepted token sequences, so structural tokens are balanced
/// and every slot sits in a position that determines its expected type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySkeleton {
    tokens: Vec<SkeletonToken>,
    slots: Vec<Slot>,
}

impl QuerySkeleton {
    /// Build from a grammar-accepted [`TokenKind`] sequence, assigning slot
    /// ids in emission order. Spans start empty and are attached by the
    /// mention tagger.
    pub(crate) fn from_kinds(kinds: &[TokenKind]) -> Self {
        let mut tokens = Vec::with_capacity(kinds.len());
        let mut slots = Vec::new();
        for kind in kinds {
            let token = match kind {
                TokenKind::Select => SkeletonToken::Select,
                TokenKind::Ask => SkeletonToken::Ask,
                TokenKind::Where => SkeletonToken::Where,
                TokenKind::BrackOpen => SkeletonToken::BrackOpen,
                TokenKind::BrackClose => SkeletonToken::BrackClose,
                TokenKind::SepDot => SkeletonToken::SepDot,
                TokenKind::End => continue,
                TokenKind::Var(v) => SkeletonToken::Var(*v),
                TokenKind::EntitySlot | TokenKind::RelationSlot | TokenKind::LiteralSlot => {
                    let id = SlotId(slots.len() as u16);
                    let expected_type = match kind {
                        TokenKind::EntitySlot => SlotType::Entity,
                        TokenKind::RelationSlot => SlotType::Relation,
                        _ => SlotType::Literal,
                    };
                    slots.push(Slot {
                        id,
                        expected_type,
                        source_span: Span::new(0, 0),
                    });
                    SkeletonToken::Slot(id)
                }
            };
            tokens.push(token);
        }
        Self { tokens, slots }
    }

    pub fn tokens(&self) -> &[SkeletonToken] {
        &self.tokens
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.0 as usize)
    }

    pub fn is_ask(&self) -> bool {
        matches!(self.tokens.first(), Some(SkeletonToken::Ask))
    }

    /// Select variables in projection order (empty for ASK).
    pub fn select_vars(&self) -> Vec<VarName> {
        let mut vars = Vec::new();
        for token in &self.tokens {
            match token {
                SkeletonToken::Select => continue,
                SkeletonToken::Var(v) => vars.push(*v),
                _ => break,
            }
        }
        vars
    }

    pub(crate) fn attach_spans(&mut self, spans: &[Span]) {
        for (slot, span) in self.slots.iter_mut().zip(spans) {
            slot.source_span = *span;
        }
    }

    /// Encoded textual form, one token per word (the sequence model's target
    /// side speaks exactly this language).
    pub fn encoded(&self) -> String {
        self.tokens
            .iter()
            .map(|t| match t {
                SkeletonToken::Select => "select".to_string(),
                SkeletonToken::Ask => "ask".to_string(),
                SkeletonToken::Where => "where".to_string(),
                SkeletonToken::BrackOpen => "brack_open".to_string(),
                SkeletonToken::BrackClose => "brack_close".to_string(),
                SkeletonToken::SepDot => "sep_dot".to_string(),
                SkeletonToken::Var(v) => format!("var_{v}"),
                SkeletonToken::Slot(id) => {
                    match self.slot(*id).map(|s| s.expected_type) {
                        Some(SlotType::Entity) => "<entity>".to_string(),
                        Some(SlotType::Relation) => "<relation>".to_string(),
                        _ => "<literal>".to_string(),
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for QuerySkeleton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::TokenKind as T;

    fn simple_kinds() -> Vec<T> {
        vec![
            T::Select,
            T::Var(VarName::X),
            T::Where,
            T::BrackOpen,
            T::EntitySlot,
            T::RelationSlot,
            T::Var(VarName::X),
            T::BrackClose,
            T::End,
        ]
    }

    #[test]
    fn builds_slots_in_order() {
        let sk = QuerySkeleton::from_kinds(&simple_kinds());
        assert_eq!(sk.slots().len(), 2);
        assert_eq!(sk.slots()[0].id, SlotId(0));
        assert_eq!(sk.slots()[0].expected_type, SlotType::Entity);
        assert_eq!(sk.slots()[1].expected_type, SlotType::Relation);
        assert!(!sk.is_ask());
        assert_eq!(sk.select_vars(), vec![VarName::X]);
    }

    #[test]
    fn slot_ids_are_unique() {
        let sk = QuerySkeleton::from_kinds(&simple_kinds());
        let mut ids: Vec<_> = sk.slots().iter().map(|s| s.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), sk.slots().len());
    }

    #[test]
    fn encoded_form() {
        let sk = QuerySkeleton::from_kinds(&simple_kinds());
        assert_eq!(
            sk.encoded(),
            "select var_x where brack_open <entity> <relation> var_x brack_close"
        );
    }
}
