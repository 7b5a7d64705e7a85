//! The skeleton token language as an explicit state machine.
//!
//! The decoder intersects the model's proposals with `valid_next()` at every
//! step, so malformed skeletons cannot be emitted at all. The machine also
//! tracks which select variables have appeared inside the pattern block and
//! refuses to close the block until all of them are bound; an unbound
//! projection would be unresolvable downstream.
//!
//! Grammar (informally):
//!
//! ```text
//! query    := select var+ where block end | ask where block end
//! block    := brack_open triple (sep_dot triple)* brack_close
//! triple   := subject predicate object
//! subject  := var | <entity>
//! predicate:= <relation>
//! object   := var | <entity> | <literal>
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Skeletons longer than this are outside the supported question space.
pub const MAX_TRIPLES: u8 = 4;

/// Query variables. Three are enough for the supported skeleton shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarName {
    X,
    Y,
    Z,
}

impl VarName {
    pub const ALL: [VarName; 3] = [VarName::X, VarName::Y, VarName::Z];

    fn bit(self) -> u8 {
        match self {
            VarName::X => 1,
            VarName::Y => 2,
            VarName::Z => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VarName::X => "x",
            VarName::Y => "y",
            VarName::Z => "z",
        }
    }
}

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token classes the decoder chooses between. Concrete slot ids are assigned
/// later, when an accepted sequence becomes a skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Select,
    Ask,
    Where,
    BrackOpen,
    BrackClose,
    SepDot,
    End,
    Var(VarName),
    EntitySlot,
    RelationSlot,
    LiteralSlot,
}

impl TokenKind {
    /// The target-vocabulary surface form of this token.
    pub fn token_str(self) -> &'static str {
        match self {
            TokenKind::Select => "select",
            TokenKind::Ask => "ask",
            TokenKind::Where => "where",
            TokenKind::BrackOpen => "brack_open",
            TokenKind::BrackClose => "brack_close",
            TokenKind::SepDot => "sep_dot",
            TokenKind::End => "_end_",
            TokenKind::Var(VarName::X) => "var_x",
            TokenKind::Var(VarName::Y) => "var_y",
            TokenKind::Var(VarName::Z) => "var_z",
            TokenKind::EntitySlot => "<entity>",
            TokenKind::RelationSlot => "<relation>",
            TokenKind::LiteralSlot => "<literal>",
        }
    }

    /// All tokens of the target language, in vocabulary order.
    pub fn all() -> Vec<TokenKind> {
        let mut out = vec![
            TokenKind::Select,
            TokenKind::Ask,
            TokenKind::Where,
            TokenKind::BrackOpen,
            TokenKind::BrackClose,
            TokenKind::SepDot,
            TokenKind::End,
        ];
        out.extend(VarName::ALL.map(TokenKind::Var));
        out.extend([
            TokenKind::EntitySlot,
            TokenKind::RelationSlot,
            TokenKind::LiteralSlot,
        ]);
        out
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("token {got:?} is not valid in state {state}")]
pub struct GrammarViolation {
    pub state: String,
    pub got: TokenKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    SelectVars,
    NeedWhere,
    NeedOpen,
    Subject,
    Predicate,
    Object,
    AfterTriple,
    NeedEnd,
    Done,
}

/// Tracks the grammatical state of a partially decoded skeleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarMachine {
    state: State,
    is_select: bool,
    /// Bitmask of projected variables.
    select_mask: u8,
    /// Bitmask of variables used inside the pattern block.
    used_mask: u8,
    triples: u8,
}

impl GrammarMachine {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            is_select: false,
            select_mask: 0,
            used_mask: 0,
            triples: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Tokens valid in the current state, in deterministic order.
    pub fn valid_next(&self) -> Vec<TokenKind> {
        match self.state {
            State::Start => vec![TokenKind::Select, TokenKind::Ask],
            State::SelectVars => {
                let mut out: Vec<TokenKind> = VarName::ALL
                    .iter()
                    .filter(|v| self.select_mask & v.bit() == 0)
                    .map(|&v| TokenKind::Var(v))
                    .collect();
                if self.select_mask != 0 {
                    out.push(TokenKind::Where);
                }
                out
            }
            State::NeedWhere => vec![TokenKind::Where],
            State::NeedOpen => vec![TokenKind::BrackOpen],
            State::Subject => {
                let mut out: Vec<TokenKind> =
                    VarName::ALL.iter().map(|&v| TokenKind::Var(v)).collect();
                out.push(TokenKind::EntitySlot);
                out
            }
            State::Predicate => vec![TokenKind::RelationSlot],
            State::Object => {
                let mut out: Vec<TokenKind> =
                    VarName::ALL.iter().map(|&v| TokenKind::Var(v)).collect();
                out.push(TokenKind::EntitySlot);
                out.push(TokenKind::LiteralSlot);
                out
            }
            State::AfterTriple => {
                let unbound = self.select_mask & !self.used_mask;
                let mut out = Vec::new();
                // More triples are allowed up to the cap, or past it while a
                // projection variable still needs binding (no dead ends).
                if self.triples < MAX_TRIPLES || unbound != 0 {
                    out.push(TokenKind::SepDot);
                }
                if unbound == 0 {
                    out.push(TokenKind::BrackClose);
                }
                out
            }
            State::NeedEnd => vec![TokenKind::End],
            State::Done => vec![],
        }
    }

    /// Advance by one token. Rejects anything not in `valid_next()`.
    pub fn advance(&mut self, token: TokenKind) -> Result<(), GrammarViolation> {
        if !self.valid_next().contains(&token) {
            return Err(GrammarViolation {
                state: format!("{:?}", self.state),
                got: token,
            });
        }
        match (self.state, token) {
            (State::Start, TokenKind::Select) => {
                self.is_select = true;
                self.state = State::SelectVars;
            }
            (State::Start, TokenKind::Ask) => self.state = State::NeedWhere,
            (State::SelectVars, TokenKind::Var(v)) => self.select_mask |= v.bit(),
            (State::SelectVars, TokenKind::Where) => self.state = State::NeedOpen,
            (State::NeedWhere, TokenKind::Where) => self.state = State::NeedOpen,
            (State::NeedOpen, TokenKind::BrackOpen) => self.state = State::Subject,
            (State::Subject, TokenKind::Var(v)) => {
                self.used_mask |= v.bit();
                self.state = State::Predicate;
            }
            (State::Subject, TokenKind::EntitySlot) => self.state = State::Predicate,
            (State::Predicate, TokenKind::RelationSlot) => self.state = State::Object,
            (State::Object, TokenKind::Var(v)) => {
                self.used_mask |= v.bit();
                self.triples += 1;
                self.state = State::AfterTriple;
            }
            (State::Object, TokenKind::EntitySlot | TokenKind::LiteralSlot) => {
                self.triples += 1;
                self.state = State::AfterTriple;
            }
            (State::AfterTriple, TokenKind::SepDot) => self.state = State::Subject,
            (State::AfterTriple, TokenKind::BrackClose) => self.state = State::NeedEnd,
            (State::NeedEnd, TokenKind::End) => self.state = State::Done,
            // valid_next() already filtered everything else out.
            _ => unreachable!("advance after valid_next check"),
        }
        Ok(())
    }
}

impl Default for GrammarMachine {
    fn default() -> Self {
        Self::new()
    }
}
