//! Structural tokens exchanged with the parser and presenter collaborators.

use std::fmt;

use crate::tag::TagId;

/// Label for a value's first occurrence in a token stream.
///
/// Unique within one decode or encode pass and never reused. An alias names
/// an anchor assigned earlier in the same pass; forward references are a
/// decode error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnchorId(pub u64);

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}", self.0)
    }
}

/// One unit of the flat structural stream representing a YAML document.
///
/// Streams are well nested: every `MapStart`/`SeqStart` is matched by its
/// `End`, scalars and aliases are leaves, and exactly one top-level value
/// sits between `DocumentStart` and `DocumentEnd`.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    DocumentStart,
    DocumentEnd,
    Scalar {
        text: String,
        tag: TagId,
        anchor: Option<AnchorId>,
    },
    MapStart {
        tag: TagId,
        anchor: Option<AnchorId>,
        /// Layout hint for the presenter: keys may be non-scalar.
        composite_keys: bool,
    },
    MapEnd,
    SeqStart {
        tag: TagId,
        anchor: Option<AnchorId>,
    },
    SeqEnd,
    Alias {
        target: AnchorId,
    },
    Warning {
        line: u32,
        column: u32,
        message: String,
    },
    Error {
        line: u32,
        column: u32,
        message: String,
    },
}

impl Token {
    /// Human-readable token kind for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Token::DocumentStart => "document start",
            Token::DocumentEnd => "document end",
            Token::Scalar { .. } => "scalar",
            Token::MapStart { .. } => "mapping start",
            Token::MapEnd => "mapping end",
            Token::SeqStart { .. } => "sequence start",
            Token::SeqEnd => "sequence end",
            Token::Alias { .. } => "alias",
            Token::Warning { .. } => "warning",
            Token::Error { .. } => "error",
        }
    }

    /// The anchor field, for tokens that can carry one.
    pub fn anchor(&self) -> Option<AnchorId> {
        match self {
            Token::Scalar { anchor, .. }
            | Token::MapStart { anchor, .. }
            | Token::SeqStart { anchor, .. } => *anchor,
            _ => None,
        }
    }

    /// Overwrite the anchor field. Returns false for tokens without one.
    pub fn set_anchor(&mut self, id: AnchorId) -> bool {
        match self {
            Token::Scalar { anchor, .. }
            | Token::MapStart { anchor, .. }
            | Token::SeqStart { anchor, .. } => {
                *anchor = Some(id);
                true
            }
            _ => false,
        }
    }
}

/// Growable, index-addressable token sequence.
///
/// Lazy anchor assignment discovers that a value was shared only after its
/// first occurrence has already been emitted, so the whole pass is buffered
/// here and the first occurrence's anchor field is patched in place before
/// the sequence is released downstream.
#[derive(Debug, Default)]
pub struct TokenBuffer {
    tokens: Vec<Token>,
}

impl TokenBuffer {
    pub fn new() -> Self {
        TokenBuffer { tokens: Vec::new() }
    }

    /// Append a token, returning its index for later patching.
    pub fn push(&mut self, token: Token) -> usize {
        self.tokens.push(token);
        self.tokens.len() - 1
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Patch the anchor field of the token at `index`.
    ///
    /// Only ever called for indices recorded as a reference's first
    /// occurrence, which is always an anchor-capable token.
    pub fn set_anchor(&mut self, index: usize, id: AnchorId) {
        let patched = self.tokens[index].set_anchor(id);
        debug_assert!(patched, "first occurrence is not anchor-capable");
    }

    /// Release the finished sequence.
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}
