//! Error taxonomy shared by the construction and representation engines.

use thiserror::Error;

use crate::token::AnchorId;

/// Content or shape mismatch found while decoding a token sequence.
///
/// Always recoverable by the caller: the decode pass is abandoned and the
/// registry is left untouched. Position context, if any, is attached by the
/// entry point from the token producer's reports.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unexpected end of token stream")]
    UnexpectedEnd,

    #[error("tag mismatch: expected `{expected}`, found `{found}`")]
    TagMismatch { expected: String, found: String },

    #[error("duplicate key `{key}` in mapping")]
    DuplicateKey { key: String },

    #[error("expected {expected} elements, found {found}")]
    BadArity { expected: usize, found: usize },

    #[error("cannot parse `{text}` as {kind}")]
    BadScalar { text: String, kind: &'static str },

    #[error("alias targets unknown anchor {0}")]
    UnknownAnchor(AnchorId),

    #[error("alias for anchor {0} resolves to a different type")]
    AliasType(AnchorId),

    #[error("anchor is not allowed on {0} values")]
    IllegalAnchor(&'static str),

    #[error("no variant of `{union}` accepts tag `{tag}`")]
    UnresolvedVariant { union: &'static str, tag: String },

    #[error("field `{field}` is not valid for the active variant of `{union}`")]
    InvalidVariantField {
        union: &'static str,
        field: String,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Failure originating in the external token producer or sink, or in a
/// narrowing numeric conversion while representing a value.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("token producer error at line {line}, column {column}: {message}")]
    Producer {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("integer {0} does not fit the signed wire representation")]
    IntegerOverflow(u64),

    #[error("token sink error: {0}")]
    Sink(String),

    #[error("lazy anchor assignment requires a buffered token sink")]
    UnbufferedLazyAnchors,
}
