//! Generic bidirectional codec between native values and the structural
//! token stream of a YAML document.
//!
//! The lexical parser (text → tokens) and the presenter (tokens → text) are
//! external collaborators; this crate owns the construction engine (tokens →
//! values), the representation engine (values → tokens), the tag registry,
//! and the scalar intrinsic classifier they share.

pub mod construct;
pub mod error;
pub mod represent;
pub mod resolve;
pub mod tag;
pub mod token;
pub mod types;

pub type Result<T> = anyhow::Result<T>;

pub use construct::{
    Construct, ConstructionContext, TokenStream, construct_document, construct_enum,
    construct_null, construct_record, construct_union, expect_map_start, expect_scalar,
    expect_seq_start, skip_value,
};
pub use error::{ConstructionError, StreamError};
pub use represent::{
    AnchorPolicy, RefVisit, Represent, SerializationContext, TagPolicy, TokenSink,
    represent_document, represent_enum, represent_into, represent_record, represent_union,
};
pub use resolve::{IntrinsicKind, classify, format_float, intrinsic_tag, parse_float, parse_integer};
pub use tag::{TagId, TagRegistry, Tagged};
pub use token::{AnchorId, Token, TokenBuffer};
pub use types::{Binary, OrderedMap, Record, RecordField, Union, UnionStyle, UnionVariant, custom_tag};
