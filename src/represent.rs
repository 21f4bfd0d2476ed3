//! Representation engine: encodes values into a pushed token sequence.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use smallvec::SmallVec;

use crate::error::StreamError;
use crate::resolve::{IntrinsicKind, classify, format_float};
use crate::tag::{TagId, TagRegistry, Tagged};
use crate::token::{AnchorId, Token, TokenBuffer};
use crate::types::{Binary, OrderedMap, Record, Union, UnionStyle};

/// How much tag information the pass emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagPolicy {
    /// Tag nothing.
    Off,
    /// Tag only the outermost emitted value; containers demote this to
    /// `Off` for their children.
    Outermost,
    /// Tag every value.
    All,
}

/// How reference-typed values are anchored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorPolicy {
    /// Inline every referent directly. Cycles recurse without a guard;
    /// the caller owns that risk.
    Never,
    /// Assign every reference a fresh anchor up front and alias repeats.
    Always,
    /// Anchor only values that turn out to be shared, patching the first
    /// occurrence retroactively. Requires the buffered sink.
    Lazy,
}

/// Where emitted tokens go.
pub enum TokenSink<'s> {
    Buffer(TokenBuffer),
    Stream(&'s mut dyn FnMut(Token) -> Result<(), StreamError>),
}

#[derive(Clone, Copy, Debug)]
enum RefState {
    /// Seen once, no anchor yet; `first_index` addresses its first token.
    Pending { first_index: usize },
    Anchored { anchor: AnchorId },
}

/// Outcome of visiting a reference-typed value.
pub enum RefVisit {
    /// First visit under the active policy: emit the referent inline.
    Emit,
    /// An alias to the value's anchor has already been emitted.
    Aliased,
}

/// Per-encode-pass state: identity table, anchor counter, the active tag
/// and anchor policies, and the token sink.
///
/// Reference identity is the referent's allocation address, never its
/// value: two distinct instances with equal content are distinct
/// identities. Scoped to exactly one top-level encode.
pub struct SerializationContext<'r, 's> {
    registry: &'r mut TagRegistry,
    tags: TagPolicy,
    anchors: AnchorPolicy,
    identities: HashMap<usize, RefState>,
    promotions: SmallVec<[(usize, AnchorId); 4]>,
    next_anchor: u64,
    pending_anchor: Option<AnchorId>,
    emitted: usize,
    sink: TokenSink<'s>,
}

impl<'r, 's> SerializationContext<'r, 's> {
    /// Context writing into an internal buffer; supports every anchor
    /// policy. [`finish`] releases the patched sequence.
    ///
    /// [`finish`]: SerializationContext::finish
    pub fn buffered(registry: &'r mut TagRegistry, tags: TagPolicy, anchors: AnchorPolicy) -> Self {
        SerializationContext {
            registry,
            tags,
            anchors,
            identities: HashMap::new(),
            promotions: SmallVec::new(),
            next_anchor: 0,
            pending_anchor: None,
            emitted: 0,
            sink: TokenSink::Buffer(TokenBuffer::new()),
        }
    }

    /// Context pushing straight into a caller-supplied sink. Lazy anchors
    /// need retroactive patching and are rejected here.
    pub fn streaming(
        registry: &'r mut TagRegistry,
        tags: TagPolicy,
        anchors: AnchorPolicy,
        sink: &'s mut dyn FnMut(Token) -> Result<(), StreamError>,
    ) -> Result<Self, StreamError> {
        if anchors == AnchorPolicy::Lazy {
            return Err(StreamError::UnbufferedLazyAnchors);
        }
        Ok(SerializationContext {
            registry,
            tags,
            anchors,
            identities: HashMap::new(),
            promotions: SmallVec::new(),
            next_anchor: 0,
            pending_anchor: None,
            emitted: 0,
            sink: TokenSink::Stream(sink),
        })
    }

    pub fn registry(&mut self) -> &mut TagRegistry {
        self.registry
    }

    fn next_index(&self) -> usize {
        match &self.sink {
            TokenSink::Buffer(buffer) => buffer.len(),
            TokenSink::Stream(_) => self.emitted,
        }
    }

    fn emit(&mut self, mut token: Token) -> Result<usize, StreamError> {
        if let Some(anchor) = self.pending_anchor {
            if token.set_anchor(anchor) {
                self.pending_anchor = None;
            }
        }
        match &mut self.sink {
            TokenSink::Buffer(buffer) => Ok(buffer.push(token)),
            TokenSink::Stream(sink) => {
                sink(token)?;
                let index = self.emitted;
                self.emitted += 1;
                Ok(index)
            }
        }
    }

    fn fresh_anchor(&mut self) -> AnchorId {
        self.next_anchor += 1;
        AnchorId(self.next_anchor)
    }

    /// The tag a container start carries under the current policy.
    fn display_tag(&self, canonical: TagId) -> TagId {
        match self.tags {
            TagPolicy::All | TagPolicy::Outermost => canonical,
            TagPolicy::Off => TagId::ANY,
        }
    }

    /// The tag a scalar carries under the current policy. An untagged
    /// string whose text looks like some other intrinsic kind is marked
    /// explicit-untyped so the presenter knows to quote it.
    fn scalar_tag(&self, canonical: TagId, text: &str) -> TagId {
        match self.tags {
            TagPolicy::All | TagPolicy::Outermost => canonical,
            TagPolicy::Off => {
                if canonical == TagId::STR && classify(text) != IntrinsicKind::Unrecognized {
                    TagId::UNTYPED
                } else {
                    TagId::ANY
                }
            }
        }
    }

    /// Demote the tag policy for a container's children, returning the
    /// previous policy for the matching `end_*` call.
    fn demote(&mut self) -> TagPolicy {
        let saved = self.tags;
        if self.tags == TagPolicy::Outermost {
            self.tags = TagPolicy::Off;
        }
        saved
    }

    pub fn emit_scalar(&mut self, canonical: TagId, text: String) -> Result<(), StreamError> {
        let tag = self.scalar_tag(canonical, &text);
        self.emit(Token::Scalar {
            text,
            tag,
            anchor: None,
        })?;
        Ok(())
    }

    /// The dedicated null scalar an absent reference emits.
    pub fn emit_null(&mut self) -> Result<(), StreamError> {
        self.emit_scalar(TagId::NULL, "null".to_string())
    }

    pub fn begin_seq(&mut self, canonical: TagId) -> Result<TagPolicy, StreamError> {
        let tag = self.display_tag(canonical);
        self.emit(Token::SeqStart { tag, anchor: None })?;
        Ok(self.demote())
    }

    pub fn end_seq(&mut self, saved: TagPolicy) -> Result<(), StreamError> {
        self.emit(Token::SeqEnd)?;
        self.tags = saved;
        Ok(())
    }

    pub fn begin_map(
        &mut self,
        canonical: TagId,
        composite_keys: bool,
    ) -> Result<TagPolicy, StreamError> {
        let tag = self.display_tag(canonical);
        self.emit(Token::MapStart {
            tag,
            anchor: None,
            composite_keys,
        })?;
        Ok(self.demote())
    }

    pub fn end_map(&mut self, saved: TagPolicy) -> Result<(), StreamError> {
        self.emit(Token::MapEnd)?;
        self.tags = saved;
        Ok(())
    }

    /// Track one visit to the reference identity `key` under the active
    /// anchor policy, emitting an alias when the identity already has an
    /// anchor and promoting lazily-pending identities on their second
    /// visit.
    pub fn enter_ref(&mut self, key: usize) -> Result<RefVisit, StreamError> {
        match self.anchors {
            AnchorPolicy::Never => Ok(RefVisit::Emit),
            AnchorPolicy::Always => {
                if let Some(RefState::Anchored { anchor }) = self.identities.get(&key).copied() {
                    self.emit(Token::Alias { target: anchor })?;
                    return Ok(RefVisit::Aliased);
                }
                let anchor = self.fresh_anchor();
                self.identities.insert(key, RefState::Anchored { anchor });
                self.pending_anchor = Some(anchor);
                Ok(RefVisit::Emit)
            }
            AnchorPolicy::Lazy => match self.identities.get(&key).copied() {
                None => {
                    let first_index = self.next_index();
                    self.identities.insert(key, RefState::Pending { first_index });
                    Ok(RefVisit::Emit)
                }
                Some(RefState::Pending { first_index }) => {
                    let anchor = self.fresh_anchor();
                    match &mut self.sink {
                        TokenSink::Buffer(buffer) => buffer.set_anchor(first_index, anchor),
                        TokenSink::Stream(_) => return Err(StreamError::UnbufferedLazyAnchors),
                    }
                    tracing::trace!(%anchor, first_index, "promoted shared value to anchored");
                    self.promotions.push((first_index, anchor));
                    self.identities.insert(key, RefState::Anchored { anchor });
                    self.emit(Token::Alias { target: anchor })?;
                    Ok(RefVisit::Aliased)
                }
                Some(RefState::Anchored { anchor }) => {
                    self.emit(Token::Alias { target: anchor })?;
                    Ok(RefVisit::Aliased)
                }
            },
        }
    }

    /// First occurrences patched with a lazily assigned anchor this pass.
    pub fn promoted(&self) -> &[(usize, AnchorId)] {
        &self.promotions
    }

    /// Release the buffered sequence (empty for a streaming context).
    pub fn finish(self) -> Vec<Token> {
        match self.sink {
            TokenSink::Buffer(buffer) => buffer.into_tokens(),
            TokenSink::Stream(_) => Vec::new(),
        }
    }
}

/// Capability to encode one value of `Self` into the token sink.
pub trait Represent: Tagged {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError>;
}

impl Represent for String {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        ctx.emit_scalar(TagId::STR, self.clone())
    }
}

impl Represent for char {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        ctx.emit_scalar(TagId::STR, self.to_string())
    }
}

impl Represent for bool {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let text = if *self { "true" } else { "false" };
        ctx.emit_scalar(TagId::BOOL, text.to_string())
    }
}

macro_rules! integer_represent {
    ($($ty:ty),+ $(,)?) => {
        $(impl Represent for $ty {
            fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
                ctx.emit_scalar(TagId::INT, self.to_string())
            }
        })+
    };
}

integer_represent!(i8, i16, i32, i64, isize, u8, u16, u32);

/// The wire form for integers is signed 64-bit; wider unsigned values do
/// not narrow and fail the pass.
impl Represent for u64 {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        if *self > i64::MAX as u64 {
            return Err(StreamError::IntegerOverflow(*self));
        }
        ctx.emit_scalar(TagId::INT, self.to_string())
    }
}

impl Represent for usize {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        (*self as u64).represent(ctx)
    }
}

impl Represent for f64 {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        ctx.emit_scalar(TagId::FLOAT, format_float(*self))
    }
}

impl Represent for f32 {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let text = if self.is_nan() {
            ".nan".to_string()
        } else if *self == f32::INFINITY {
            ".inf".to_string()
        } else if *self == f32::NEG_INFINITY {
            "-.inf".to_string()
        } else {
            format!("{self:?}")
        };
        ctx.emit_scalar(TagId::FLOAT, text)
    }
}

impl Represent for Binary {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        ctx.emit_scalar(TagId::BINARY, BASE64.encode(&self.0))
    }
}

impl<T: Represent> Represent for Option<T> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        match self {
            Some(value) => value.represent(ctx),
            None => ctx.emit_null(),
        }
    }
}

impl<T: Represent> Represent for Box<T> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        self.as_ref().represent(ctx)
    }
}

/// Shared owning reference: identity is the allocation address, tracked by
/// the context under the active anchor policy.
impl<T: Represent> Represent for Rc<RefCell<T>> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let key = Rc::as_ptr(self) as usize;
        match ctx.enter_ref(key)? {
            RefVisit::Aliased => Ok(()),
            RefVisit::Emit => self.borrow().represent(ctx),
        }
    }
}

impl<T: Represent> Represent for Vec<T> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_seq(canonical)?;
        for item in self {
            item.represent(ctx)?;
        }
        ctx.end_seq(saved)
    }
}

impl<T: Represent, const N: usize> Represent for [T; N] {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_seq(canonical)?;
        for item in self {
            item.represent(ctx)?;
        }
        ctx.end_seq(saved)
    }
}

impl<T: Represent + Ord> Represent for BTreeSet<T> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_seq(canonical)?;
        for item in self {
            item.represent(ctx)?;
        }
        ctx.end_seq(saved)
    }
}

impl<K: Represent, V: Represent> Represent for BTreeMap<K, V> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_map(canonical, !K::IS_SCALAR)?;
        for (key, value) in self {
            key.represent(ctx)?;
            value.represent(ctx)?;
        }
        ctx.end_map(saved)
    }
}

impl<K: Represent, V: Represent> Represent for HashMap<K, V> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_map(canonical, !K::IS_SCALAR)?;
        for (key, value) in self {
            key.represent(ctx)?;
            value.represent(ctx)?;
        }
        ctx.end_map(saved)
    }
}

impl<K: Represent, V: Represent> Represent for OrderedMap<K, V> {
    fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
        let canonical = Self::canonical_tag(ctx.registry());
        let saved = ctx.begin_seq(canonical)?;
        for (key, value) in self.iter() {
            let entry = ctx.begin_map(TagId::MAP, !K::IS_SCALAR)?;
            key.represent(ctx)?;
            value.represent(ctx)?;
            ctx.end_map(entry)?;
        }
        ctx.end_seq(saved)
    }
}

/// Emit a record as a mapping of field-name keys in declaration order;
/// the order is identical on every pass over the type.
pub fn represent_record<T: Record>(
    value: &T,
    ctx: &mut SerializationContext<'_, '_>,
) -> Result<(), StreamError> {
    let canonical = T::canonical_tag(ctx.registry());
    let saved = ctx.begin_map(canonical, false)?;
    for field in T::FIELDS {
        ctx.emit_scalar(TagId::STR, field.name.to_string())?;
        (field.represent)(value, ctx)?;
    }
    ctx.end_map(saved)
}

/// Emit a tagged union in its declared wire shape: explicit unions as a
/// sequence holding one single-entry map, implicit unions as the active
/// payload alone.
pub fn represent_union<T: Union>(
    value: &T,
    ctx: &mut SerializationContext<'_, '_>,
) -> Result<(), StreamError> {
    let variant = &T::VARIANTS[value.active()];
    match T::STYLE {
        UnionStyle::Implicit => (variant.represent)(value, ctx),
        UnionStyle::Explicit => {
            let canonical = T::canonical_tag(ctx.registry());
            let saved = ctx.begin_seq(canonical)?;
            let entry = ctx.begin_map(TagId::MAP, false)?;
            ctx.emit_scalar(TagId::STR, variant.name.to_string())?;
            (variant.represent)(value, ctx)?;
            ctx.end_map(entry)?;
            ctx.end_seq(saved)
        }
    }
}

/// Emit a C-like enumeration through its canonical name table.
///
/// Panics if the value is missing from its own table, which is a defect in
/// the table, not in the input.
pub fn represent_enum<T: PartialEq>(
    value: &T,
    ctx: &mut SerializationContext<'_, '_>,
    canonical: TagId,
    names: &[(&str, T)],
) -> Result<(), StreamError> {
    let name = names
        .iter()
        .find(|(_, candidate)| candidate == value)
        .map(|(name, _)| *name)
        .unwrap_or_else(|| panic!("enumeration value missing from its name table"));
    ctx.emit_scalar(canonical, name.to_string())
}

/// Encode one complete document into a buffered, patch-reconciled token
/// sequence. Supports every anchor policy.
pub fn represent_document<T: Represent>(
    value: &T,
    registry: &mut TagRegistry,
    tags: TagPolicy,
    anchors: AnchorPolicy,
) -> Result<Vec<Token>> {
    let mut ctx = SerializationContext::buffered(registry, tags, anchors);
    ctx.emit(Token::DocumentStart)?;
    value
        .represent(&mut ctx)
        .context("failed to encode document value")?;
    ctx.emit(Token::DocumentEnd)?;
    Ok(ctx.finish())
}

/// Encode one complete document straight into a caller sink. Lazy anchors
/// need the buffered entry point and are rejected.
pub fn represent_into<T: Represent>(
    value: &T,
    registry: &mut TagRegistry,
    tags: TagPolicy,
    anchors: AnchorPolicy,
    sink: &mut dyn FnMut(Token) -> Result<(), StreamError>,
) -> Result<()> {
    let mut ctx = SerializationContext::streaming(registry, tags, anchors, sink)?;
    ctx.emit(Token::DocumentStart)?;
    value
        .represent(&mut ctx)
        .context("failed to encode document value")?;
    ctx.emit(Token::DocumentEnd)?;
    Ok(())
}
