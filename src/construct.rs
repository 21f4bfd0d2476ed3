//! Construction engine: decodes a pulled token sequence into typed values.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{ConstructionError, StreamError};
use crate::resolve::{IntrinsicKind, classify, intrinsic_tag, parse_float, parse_integer};
use crate::tag::{TagId, TagRegistry, Tagged};
use crate::token::{AnchorId, Token};
use crate::types::{Binary, OrderedMap, Record, Union, UnionStyle};

/// Pull-side view of an externally driven token sequence with one-token
/// lookahead.
///
/// Pulling is the engine's only suspension point; the producer may do
/// arbitrary work (e.g. syntax parsing) per token. Producer warnings are
/// logged and skipped, producer errors surface as [`StreamError`]s.
pub struct TokenStream<'a> {
    source: &'a mut dyn Iterator<Item = Token>,
    peeked: Option<Token>,
}

impl<'a> TokenStream<'a> {
    pub fn new(source: &'a mut dyn Iterator<Item = Token>) -> Self {
        TokenStream {
            source,
            peeked: None,
        }
    }

    fn fetch(&mut self) -> Result<Token, ConstructionError> {
        loop {
            match self.source.next() {
                None => return Err(ConstructionError::UnexpectedEnd),
                Some(Token::Warning {
                    line,
                    column,
                    message,
                }) => {
                    tracing::warn!(line, column, %message, "token producer warning");
                }
                Some(Token::Error {
                    line,
                    column,
                    message,
                }) => {
                    return Err(StreamError::Producer {
                        line,
                        column,
                        message,
                    }
                    .into());
                }
                Some(token) => return Ok(token),
            }
        }
    }

    pub fn next(&mut self) -> Result<Token, ConstructionError> {
        match self.peeked.take() {
            Some(token) => Ok(token),
            None => self.fetch(),
        }
    }

    pub fn peek(&mut self) -> Result<&Token, ConstructionError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.fetch()?);
        }
        Ok(self.peeked.as_ref().expect("token was just peeked"))
    }

    /// Consume a pending alias token, if one is next.
    pub fn take_alias(&mut self) -> Result<Option<AnchorId>, ConstructionError> {
        if let Token::Alias { target } = self.peek()? {
            let target = *target;
            self.next()?;
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }

    /// Strip and return the anchor of the pending token, leaving the token
    /// itself in place. Used by reference types that claim the anchor before
    /// delegating to their referent's decoder.
    pub fn take_anchor(&mut self) -> Result<Option<AnchorId>, ConstructionError> {
        self.peek()?;
        let token = self.peeked.as_mut().expect("token was just peeked");
        Ok(match token {
            Token::Scalar { anchor, .. }
            | Token::MapStart { anchor, .. }
            | Token::SeqStart { anchor, .. } => anchor.take(),
            _ => None,
        })
    }
}

/// Per-decode-pass state: anchors seen so far and registry access.
///
/// Scoped to exactly one top-level decode; dropping it discards any
/// partially registered anchors.
pub struct ConstructionContext<'r> {
    registry: &'r mut TagRegistry,
    anchors: HashMap<AnchorId, Box<dyn Any>>,
}

impl<'r> ConstructionContext<'r> {
    pub fn new(registry: &'r mut TagRegistry) -> Self {
        ConstructionContext {
            registry,
            anchors: HashMap::new(),
        }
    }

    pub fn registry(&mut self) -> &mut TagRegistry {
        self.registry
    }

    /// Register an instance under an anchor. Reference types call this
    /// *before* decoding the instance's contents so self-referential
    /// structures can alias back to themselves mid-construction.
    pub fn register_anchor<T: 'static>(&mut self, anchor: AnchorId, instance: T) {
        self.anchors.insert(anchor, Box::new(instance));
    }

    /// Resolve an alias to the instance registered earlier in this pass.
    pub fn resolve_anchor<T: Clone + 'static>(&self, anchor: AnchorId) -> Result<T, ConstructionError> {
        let instance = self
            .anchors
            .get(&anchor)
            .ok_or(ConstructionError::UnknownAnchor(anchor))?;
        instance
            .downcast_ref::<T>()
            .cloned()
            .ok_or(ConstructionError::AliasType(anchor))
    }
}

/// Capability to decode one value of `Self` from the token stream.
pub trait Construct: Tagged + Sized {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError>;
}

fn check_tag(
    ctx: &mut ConstructionContext<'_>,
    found: TagId,
    accepted: &[TagId],
) -> Result<(), ConstructionError> {
    if found.is_wildcard() || accepted.contains(&found) {
        Ok(())
    } else {
        Err(ConstructionError::TagMismatch {
            expected: ctx.registry().uri(accepted[0]).to_string(),
            found: ctx.registry().uri(found).to_string(),
        })
    }
}

/// Consume one scalar token, checking its tag against the accepted set and
/// rejecting anchors (legal only where shared ownership is meaningful).
pub fn expect_scalar(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
    accepted: &[TagId],
    kind: &'static str,
) -> Result<String, ConstructionError> {
    match tokens.next()? {
        Token::Scalar { text, tag, anchor } => {
            if anchor.is_some() {
                return Err(ConstructionError::IllegalAnchor(kind));
            }
            check_tag(ctx, tag, accepted)?;
            Ok(text)
        }
        other => Err(ConstructionError::UnexpectedToken {
            expected: "scalar",
            found: other.kind(),
        }),
    }
}

pub fn expect_seq_start(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
    accepted: &[TagId],
) -> Result<(), ConstructionError> {
    match tokens.next()? {
        Token::SeqStart { tag, .. } => check_tag(ctx, tag, accepted),
        other => Err(ConstructionError::UnexpectedToken {
            expected: "sequence start",
            found: other.kind(),
        }),
    }
}

pub fn expect_map_start(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
    accepted: &[TagId],
) -> Result<(), ConstructionError> {
    match tokens.next()? {
        Token::MapStart { tag, .. } => check_tag(ctx, tag, accepted),
        other => Err(ConstructionError::UnexpectedToken {
            expected: "mapping start",
            found: other.kind(),
        }),
    }
}

/// Consume one null scalar: either tagged null, or a wildcard whose text
/// classifies as the null intrinsic kind.
pub fn construct_null(
    tokens: &mut TokenStream<'_>,
    _ctx: &mut ConstructionContext<'_>,
) -> Result<(), ConstructionError> {
    match tokens.next()? {
        Token::Scalar { text, tag, anchor } => {
            if anchor.is_some() {
                return Err(ConstructionError::IllegalAnchor("null"));
            }
            if tag == TagId::NULL
                || (tag.is_wildcard() && classify(&text) == IntrinsicKind::Null)
            {
                Ok(())
            } else {
                Err(ConstructionError::BadScalar { text, kind: "null" })
            }
        }
        other => Err(ConstructionError::UnexpectedToken {
            expected: "scalar",
            found: other.kind(),
        }),
    }
}

/// Consume and discard one complete value, however deeply nested.
pub fn skip_value(tokens: &mut TokenStream<'_>) -> Result<(), ConstructionError> {
    let mut depth = 0usize;
    loop {
        let token = tokens.next()?;
        match &token {
            Token::Scalar { .. } | Token::Alias { .. } => {
                if depth == 0 {
                    return Ok(());
                }
            }
            Token::MapStart { .. } | Token::SeqStart { .. } => depth += 1,
            Token::MapEnd | Token::SeqEnd => {
                if depth == 0 {
                    return Err(ConstructionError::UnexpectedToken {
                        expected: "value",
                        found: token.kind(),
                    });
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            _ => {
                return Err(ConstructionError::UnexpectedToken {
                    expected: "value",
                    found: token.kind(),
                });
            }
        }
    }
}

impl Construct for String {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_scalar(tokens, ctx, &[TagId::STR], "string")
    }
}

impl Construct for char {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let text = expect_scalar(tokens, ctx, &[TagId::STR], "char")?;
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ConstructionError::BadScalar { text, kind: "char" }),
        }
    }
}

impl Construct for bool {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let text = expect_scalar(tokens, ctx, &[TagId::BOOL], "bool")?;
        match classify(&text) {
            IntrinsicKind::True => Ok(true),
            IntrinsicKind::False => Ok(false),
            _ => Err(ConstructionError::BadScalar { text, kind: "bool" }),
        }
    }
}

macro_rules! integer_construct {
    ($($ty:ty => $kind:literal),+ $(,)?) => {
        $(impl Construct for $ty {
            fn construct(
                tokens: &mut TokenStream<'_>,
                ctx: &mut ConstructionContext<'_>,
            ) -> Result<Self, ConstructionError> {
                let text = expect_scalar(tokens, ctx, &[TagId::INT], $kind)?;
                let wide = parse_integer(&text).ok_or_else(|| ConstructionError::BadScalar {
                    text: text.clone(),
                    kind: $kind,
                })?;
                <$ty>::try_from(wide)
                    .map_err(|_| ConstructionError::BadScalar { text, kind: $kind })
            }
        })+
    };
}

integer_construct!(
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    isize => "isize",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    usize => "usize",
);

impl Construct for f64 {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let text = expect_scalar(tokens, ctx, &[TagId::FLOAT], "f64")?;
        parse_float(&text).ok_or(ConstructionError::BadScalar { text, kind: "f64" })
    }
}

impl Construct for f32 {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let text = expect_scalar(tokens, ctx, &[TagId::FLOAT], "f32")?;
        let wide = parse_float(&text).ok_or_else(|| ConstructionError::BadScalar {
            text: text.clone(),
            kind: "f32",
        })?;
        let narrow = wide as f32;
        if wide.is_finite() && narrow.is_infinite() {
            return Err(ConstructionError::BadScalar { text, kind: "f32" });
        }
        Ok(narrow)
    }
}

impl Construct for Binary {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let text = expect_scalar(tokens, ctx, &[TagId::BINARY], "binary")?;
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        match BASE64.decode(compact.as_bytes()) {
            Ok(bytes) => Ok(Binary(bytes)),
            Err(_) => Err(ConstructionError::BadScalar {
                text,
                kind: "base64 binary",
            }),
        }
    }
}

impl<T: Construct> Construct for Option<T> {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let is_null = match tokens.peek()? {
            Token::Scalar { text, tag, .. } => {
                *tag == TagId::NULL
                    || (*tag == TagId::ANY && classify(text) == IntrinsicKind::Null)
            }
            _ => false,
        };
        if is_null {
            construct_null(tokens, ctx)?;
            return Ok(None);
        }
        Ok(Some(T::construct(tokens, ctx)?))
    }
}

impl<T: Construct> Construct for Box<T> {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        Ok(Box::new(T::construct(tokens, ctx)?))
    }
}

/// Shared owning reference. An alias resolves to the instance registered
/// under its anchor; otherwise a fresh instance is allocated and registered
/// *before* its contents are decoded, which is what lets a cyclic structure
/// alias back into itself while still under construction.
impl<T: Construct + Default + 'static> Construct for Rc<RefCell<T>> {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        if let Some(target) = tokens.take_alias()? {
            return ctx.resolve_anchor::<Rc<RefCell<T>>>(target);
        }
        let anchor = tokens.take_anchor()?;
        let cell = Rc::new(RefCell::new(T::default()));
        if let Some(anchor) = anchor {
            ctx.register_anchor(anchor, cell.clone());
        }
        let value = T::construct(tokens, ctx)?;
        *cell.borrow_mut() = value;
        Ok(cell)
    }
}

impl<T: Construct> Construct for Vec<T> {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_seq_start(tokens, ctx, &[TagId::SEQ])?;
        let mut items = Vec::new();
        while !matches!(tokens.peek()?, Token::SeqEnd) {
            items.push(T::construct(tokens, ctx)?);
        }
        tokens.next()?;
        Ok(items)
    }
}

impl<T: Construct, const N: usize> Construct for [T; N] {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        let canonical = Self::canonical_tag(ctx.registry());
        expect_seq_start(tokens, ctx, &[canonical, TagId::SEQ])?;
        let mut items = Vec::with_capacity(N);
        while !matches!(tokens.peek()?, Token::SeqEnd) {
            items.push(T::construct(tokens, ctx)?);
        }
        tokens.next()?;
        items
            .try_into()
            .map_err(|extra: Vec<T>| ConstructionError::BadArity {
                expected: N,
                found: extra.len(),
            })
    }
}

impl<T: Construct + Ord> Construct for BTreeSet<T> {
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_seq_start(tokens, ctx, &[TagId::SET, TagId::SEQ])?;
        let mut set = BTreeSet::new();
        while !matches!(tokens.peek()?, Token::SeqEnd) {
            // Duplicates coalesce silently per set semantics.
            set.insert(T::construct(tokens, ctx)?);
        }
        tokens.next()?;
        Ok(set)
    }
}

impl<K, V> Construct for BTreeMap<K, V>
where
    K: Construct + Ord + fmt::Debug,
    V: Construct,
{
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_map_start(tokens, ctx, &[TagId::MAP])?;
        let mut map = BTreeMap::new();
        while !matches!(tokens.peek()?, Token::MapEnd) {
            let key = K::construct(tokens, ctx)?;
            if map.contains_key(&key) {
                return Err(ConstructionError::DuplicateKey {
                    key: format!("{key:?}"),
                });
            }
            let value = V::construct(tokens, ctx)?;
            map.insert(key, value);
        }
        tokens.next()?;
        Ok(map)
    }
}

impl<K, V> Construct for HashMap<K, V>
where
    K: Construct + Eq + Hash + fmt::Debug,
    V: Construct,
{
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_map_start(tokens, ctx, &[TagId::MAP])?;
        let mut map = HashMap::new();
        while !matches!(tokens.peek()?, Token::MapEnd) {
            let key = K::construct(tokens, ctx)?;
            if map.contains_key(&key) {
                return Err(ConstructionError::DuplicateKey {
                    key: format!("{key:?}"),
                });
            }
            let value = V::construct(tokens, ctx)?;
            map.insert(key, value);
        }
        tokens.next()?;
        Ok(map)
    }
}

impl<K, V> Construct for OrderedMap<K, V>
where
    K: Construct + PartialEq + fmt::Debug,
    V: Construct,
{
    fn construct(
        tokens: &mut TokenStream<'_>,
        ctx: &mut ConstructionContext<'_>,
    ) -> Result<Self, ConstructionError> {
        expect_seq_start(tokens, ctx, &[TagId::OMAP, TagId::SEQ])?;
        let mut map = OrderedMap::new();
        while !matches!(tokens.peek()?, Token::SeqEnd) {
            expect_map_start(tokens, ctx, &[TagId::MAP])?;
            let key = K::construct(tokens, ctx)?;
            if map.contains_key(&key) {
                return Err(ConstructionError::DuplicateKey {
                    key: format!("{key:?}"),
                });
            }
            let value = V::construct(tokens, ctx)?;
            map.insert(key, value);
            match tokens.next()? {
                Token::MapEnd => {}
                other => {
                    return Err(ConstructionError::UnexpectedToken {
                        expected: "mapping end after single entry",
                        found: other.kind(),
                    });
                }
            }
        }
        tokens.next()?;
        Ok(map)
    }
}

/// Decode a record from a mapping of field-name keys.
///
/// Unknown keys are skipped without failing the pass; fields absent from the
/// input keep their defaults.
pub fn construct_record<T: Record>(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
) -> Result<T, ConstructionError> {
    let canonical = T::canonical_tag(ctx.registry());
    expect_map_start(tokens, ctx, &[canonical, TagId::MAP])?;
    let mut value = T::default();
    loop {
        if matches!(tokens.peek()?, Token::MapEnd) {
            tokens.next()?;
            break;
        }
        let key = expect_scalar(tokens, ctx, &[TagId::STR], "field name")?;
        match T::FIELDS.iter().find(|field| field.name == key) {
            Some(field) => (field.construct)(&mut value, tokens, ctx)?,
            None => {
                tracing::debug!(record = T::NAME, field = %key, "ignoring unknown field");
                skip_value(tokens)?;
            }
        }
    }
    Ok(value)
}

/// Decode a tagged union in whichever wire shape its type declares.
pub fn construct_union<T: Union>(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
) -> Result<T, ConstructionError> {
    match T::STYLE {
        UnionStyle::Explicit => construct_union_explicit(tokens, ctx),
        UnionStyle::Implicit => construct_union_implicit(tokens, ctx),
    }
}

fn construct_union_explicit<T: Union>(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
) -> Result<T, ConstructionError> {
    let canonical = T::canonical_tag(ctx.registry());
    expect_seq_start(tokens, ctx, &[canonical, TagId::SEQ])?;
    let mut selected: Option<(usize, T)> = None;
    loop {
        if matches!(tokens.peek()?, Token::SeqEnd) {
            tokens.next()?;
            break;
        }
        expect_map_start(tokens, ctx, &[TagId::MAP])?;
        let field = expect_scalar(tokens, ctx, &[TagId::STR], "variant field name")?;
        let index = T::VARIANTS
            .iter()
            .position(|variant| variant.name == field)
            .ok_or_else(|| ConstructionError::InvalidVariantField {
                union: T::NAME,
                field: field.clone(),
            })?;
        match &selected {
            Some((active, _)) if *active != index => {
                return Err(ConstructionError::InvalidVariantField {
                    union: T::NAME,
                    field,
                });
            }
            Some(_) => return Err(ConstructionError::DuplicateKey { key: field }),
            None => {}
        }
        let value = (T::VARIANTS[index].construct)(tokens, ctx)?;
        selected = Some((index, value));
        match tokens.next()? {
            Token::MapEnd => {}
            other => {
                return Err(ConstructionError::UnexpectedToken {
                    expected: "mapping end after single entry",
                    found: other.kind(),
                });
            }
        }
    }
    match selected {
        Some((_, value)) => Ok(value),
        None => Err(ConstructionError::UnexpectedToken {
            expected: "variant entry",
            found: "sequence end",
        }),
    }
}

/// The tag a pending token resolves to for implicit variant dispatch:
/// its own tag, or the intrinsic kind of a wildcard scalar, or the generic
/// collection tag of a wildcard container.
fn effective_tag(
    tokens: &mut TokenStream<'_>,
) -> Result<TagId, ConstructionError> {
    Ok(match tokens.peek()? {
        Token::Scalar { text, tag, .. } => {
            if *tag == TagId::ANY {
                intrinsic_tag(classify(text))
            } else if *tag == TagId::UNTYPED {
                TagId::STR
            } else {
                *tag
            }
        }
        Token::SeqStart { tag, .. } => {
            if tag.is_wildcard() {
                TagId::SEQ
            } else {
                *tag
            }
        }
        Token::MapStart { tag, .. } => {
            if tag.is_wildcard() {
                TagId::MAP
            } else {
                *tag
            }
        }
        other => {
            return Err(ConstructionError::UnexpectedToken {
                expected: "value",
                found: other.kind(),
            });
        }
    })
}

fn construct_union_implicit<T: Union>(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
) -> Result<T, ConstructionError> {
    let effective = effective_tag(tokens)?;
    for variant in T::VARIANTS {
        let matched = match variant.payload_tag {
            None => effective == TagId::NULL,
            Some(payload_tag) => payload_tag(ctx.registry()) == effective,
        };
        if matched {
            return (variant.construct)(tokens, ctx);
        }
    }
    Err(ConstructionError::UnresolvedVariant {
        union: T::NAME,
        tag: ctx.registry().uri(effective).to_string(),
    })
}

/// Decode a C-like enumeration from its canonical name table.
pub fn construct_enum<T: Copy>(
    tokens: &mut TokenStream<'_>,
    ctx: &mut ConstructionContext<'_>,
    canonical: TagId,
    names: &[(&str, T)],
    kind: &'static str,
) -> Result<T, ConstructionError> {
    let text = expect_scalar(tokens, ctx, &[canonical, TagId::STR], kind)?;
    match names.iter().find(|(name, _)| *name == text) {
        Some((_, value)) => Ok(*value),
        None => Err(ConstructionError::BadScalar { text, kind }),
    }
}

/// Decode one complete document: start marker, a single value, end marker.
///
/// Owns the per-pass context; position context from producer-reported
/// errors travels inside the wrapped [`StreamError`].
pub fn construct_document<T: Construct>(
    tokens: impl IntoIterator<Item = Token>,
    registry: &mut TagRegistry,
) -> Result<T> {
    let mut source = tokens.into_iter();
    let mut stream = TokenStream::new(&mut source);
    let mut ctx = ConstructionContext::new(registry);
    match stream.next()? {
        Token::DocumentStart => {}
        other => bail!("expected document start, found {}", other.kind()),
    }
    let value = T::construct(&mut stream, &mut ctx).context("failed to decode document value")?;
    match stream.next()? {
        Token::DocumentEnd => {}
        other => bail!("expected document end, found {}", other.kind()),
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::represent::{Represent, SerializationContext, represent_record, represent_union};
    use crate::types::{RecordField, UnionVariant, custom_tag};

    fn doc(body: Vec<Token>) -> Vec<Token> {
        let mut tokens = vec![Token::DocumentStart];
        tokens.extend(body);
        tokens.push(Token::DocumentEnd);
        tokens
    }

    fn scalar(text: &str, tag: TagId) -> Token {
        Token::Scalar {
            text: text.to_string(),
            tag,
            anchor: None,
        }
    }

    fn construction_error(err: anyhow::Error) -> ConstructionError {
        err.downcast::<ConstructionError>().expect("typed error")
    }

    #[derive(Debug, Default, PartialEq)]
    struct Server {
        host: String,
        port: u16,
        secure: bool,
    }

    impl Tagged for Server {
        fn canonical_tag(registry: &mut TagRegistry) -> TagId {
            custom_tag(registry, "server")
        }
    }

    impl Record for Server {
        const NAME: &'static str = "server";
        const FIELDS: &'static [RecordField<Server>] = &[
            RecordField {
                name: "host",
                construct: |value, tokens, ctx| {
                    value.host = String::construct(tokens, ctx)?;
                    Ok(())
                },
                represent: |value, ctx| value.host.represent(ctx),
            },
            RecordField {
                name: "port",
                construct: |value, tokens, ctx| {
                    value.port = u16::construct(tokens, ctx)?;
                    Ok(())
                },
                represent: |value, ctx| value.port.represent(ctx),
            },
            RecordField {
                name: "secure",
                construct: |value, tokens, ctx| {
                    value.secure = bool::construct(tokens, ctx)?;
                    Ok(())
                },
                represent: |value, ctx| value.secure.represent(ctx),
            },
        ];
    }

    impl Construct for Server {
        fn construct(
            tokens: &mut TokenStream<'_>,
            ctx: &mut ConstructionContext<'_>,
        ) -> Result<Self, ConstructionError> {
            construct_record(tokens, ctx)
        }
    }

    impl Represent for Server {
        fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
            represent_record(self, ctx)
        }
    }

    #[derive(Debug, PartialEq)]
    enum Contact {
        Code(i64),
        Email(String),
        Missing,
    }

    impl Default for Contact {
        fn default() -> Self {
            Contact::Missing
        }
    }

    impl Tagged for Contact {
        fn canonical_tag(registry: &mut TagRegistry) -> TagId {
            custom_tag(registry, "contact")
        }
    }

    impl Union for Contact {
        const NAME: &'static str = "contact";
        const STYLE: UnionStyle = UnionStyle::Implicit;
        const VARIANTS: &'static [UnionVariant<Contact>] = &[
            UnionVariant {
                name: "code",
                payload_tag: Some(<i64 as Tagged>::canonical_tag),
                construct: |tokens, ctx| Ok(Contact::Code(i64::construct(tokens, ctx)?)),
                represent: |value, ctx| match value {
                    Contact::Code(code) => code.represent(ctx),
                    _ => unreachable!("inactive variant"),
                },
            },
            UnionVariant {
                name: "email",
                payload_tag: Some(<String as Tagged>::canonical_tag),
                construct: |tokens, ctx| Ok(Contact::Email(String::construct(tokens, ctx)?)),
                represent: |value, ctx| match value {
                    Contact::Email(email) => email.represent(ctx),
                    _ => unreachable!("inactive variant"),
                },
            },
            UnionVariant {
                name: "missing",
                payload_tag: None,
                construct: |tokens, ctx| {
                    construct_null(tokens, ctx)?;
                    Ok(Contact::Missing)
                },
                represent: |_, ctx| ctx.emit_null(),
            },
        ];

        fn active(&self) -> usize {
            match self {
                Contact::Code(_) => 0,
                Contact::Email(_) => 1,
                Contact::Missing => 2,
            }
        }
    }

    impl Construct for Contact {
        fn construct(
            tokens: &mut TokenStream<'_>,
            ctx: &mut ConstructionContext<'_>,
        ) -> Result<Self, ConstructionError> {
            construct_union(tokens, ctx)
        }
    }

    impl Represent for Contact {
        fn represent(&self, ctx: &mut SerializationContext<'_, '_>) -> Result<(), StreamError> {
            represent_union(self, ctx)
        }
    }

    #[derive(Debug, PartialEq)]
    enum Payment {
        Card(String),
        Cash(f64),
    }

    impl Tagged for Payment {
        fn canonical_tag(registry: &mut TagRegistry) -> TagId {
            custom_tag(registry, "payment")
        }
    }

    impl Union for Payment {
        const NAME: &'static str = "payment";
        const STYLE: UnionStyle = UnionStyle::Explicit;
        const VARIANTS: &'static [UnionVariant<Payment>] = &[
            UnionVariant {
                name: "card",
                payload_tag: Some(<String as Tagged>::canonical_tag),
                construct: |tokens, ctx| Ok(Payment::Card(String::construct(tokens, ctx)?)),
                represent: |value, ctx| match value {
                    Payment::Card(number) => number.represent(ctx),
                    _ => unreachable!("inactive variant"),
                },
            },
            UnionVariant {
                name: "cash",
                payload_tag: Some(<f64 as Tagged>::canonical_tag),
                construct: |tokens, ctx| Ok(Payment::Cash(f64::construct(tokens, ctx)?)),
                represent: |value, ctx| match value {
                    Payment::Cash(amount) => amount.represent(ctx),
                    _ => unreachable!("inactive variant"),
                },
            },
        ];

        fn active(&self) -> usize {
            match self {
                Payment::Card(_) => 0,
                Payment::Cash(_) => 1,
            }
        }
    }

    impl Construct for Payment {
        fn construct(
            tokens: &mut TokenStream<'_>,
            ctx: &mut ConstructionContext<'_>,
        ) -> Result<Self, ConstructionError> {
            construct_union(tokens, ctx)
        }
    }

    #[test]
    fn integers_decode_radix_and_separators() -> Result<()> {
        let mut registry = TagRegistry::new();
        for (text, expected) in [("0x1F", 31i64), ("0o17", 15), ("10_000", 10_000), ("-42", -42)] {
            let value: i64 =
                construct_document(doc(vec![scalar(text, TagId::ANY)]), &mut registry)?;
            assert_eq!(value, expected);
        }
        Ok(())
    }

    #[test]
    fn integer_range_is_checked() {
        let mut registry = TagRegistry::new();
        let err = construct_document::<u8>(doc(vec![scalar("300", TagId::INT)]), &mut registry)
            .unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::BadScalar { .. }
        ));
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let mut registry = TagRegistry::new();
        let err = construct_document::<i64>(doc(vec![scalar("1", TagId::BOOL)]), &mut registry)
            .unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::TagMismatch { .. }
        ));
    }

    #[test]
    fn anchored_scalar_is_rejected() {
        let mut registry = TagRegistry::new();
        let err = construct_document::<i64>(
            doc(vec![Token::Scalar {
                text: "1".to_string(),
                tag: TagId::INT,
                anchor: Some(AnchorId(1)),
            }]),
            &mut registry,
        )
        .unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::IllegalAnchor(_)
        ));
    }

    #[test]
    fn strings_accept_the_untyped_wildcard() -> Result<()> {
        let mut registry = TagRegistry::new();
        let value: String =
            construct_document(doc(vec![scalar("42", TagId::UNTYPED)]), &mut registry)?;
        assert_eq!(value, "42");
        Ok(())
    }

    #[test]
    fn bool_and_char_scalars() -> Result<()> {
        let mut registry = TagRegistry::new();
        let flag: bool = construct_document(doc(vec![scalar("True", TagId::ANY)]), &mut registry)?;
        assert!(flag);
        let letter: char = construct_document(doc(vec![scalar("x", TagId::STR)]), &mut registry)?;
        assert_eq!(letter, 'x');
        let err = construct_document::<char>(doc(vec![scalar("xy", TagId::STR)]), &mut registry)
            .unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::BadScalar { .. }
        ));
        Ok(())
    }

    #[test]
    fn float_literal_spellings() -> Result<()> {
        let mut registry = TagRegistry::new();
        let inf: f64 = construct_document(doc(vec![scalar(".inf", TagId::ANY)]), &mut registry)?;
        assert_eq!(inf, f64::INFINITY);
        let neg: f64 = construct_document(doc(vec![scalar("-.inf", TagId::FLOAT)]), &mut registry)?;
        assert_eq!(neg, f64::NEG_INFINITY);
        let nan: f64 = construct_document(doc(vec![scalar(".nan", TagId::ANY)]), &mut registry)?;
        assert!(nan.is_nan());
        Ok(())
    }

    #[test]
    fn sequences_and_array_arity() {
        let mut registry = TagRegistry::new();
        let body = |count: usize| {
            let mut tokens = vec![Token::SeqStart {
                tag: TagId::SEQ,
                anchor: None,
            }];
            for i in 0..count {
                tokens.push(scalar(&i.to_string(), TagId::INT));
            }
            tokens.push(Token::SeqEnd);
            tokens
        };

        let values: Vec<i64> = construct_document(doc(body(3)), &mut registry).unwrap();
        assert_eq!(values, vec![0, 1, 2]);

        let exact: [i64; 4] = construct_document(doc(body(4)), &mut registry).unwrap();
        assert_eq!(exact, [0, 1, 2, 3]);

        for count in [3usize, 5] {
            let err =
                construct_document::<[i64; 4]>(doc(body(count)), &mut registry).unwrap_err();
            match construction_error(err) {
                ConstructionError::BadArity { expected, found } => {
                    assert_eq!(expected, 4);
                    assert_eq!(found, count);
                }
                other => panic!("expected arity error, got {other}"),
            }
        }
    }

    #[test]
    fn set_elements_coalesce() -> Result<()> {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::SeqStart {
                tag: TagId::SET,
                anchor: None,
            },
            scalar("1", TagId::INT),
            scalar("2", TagId::INT),
            scalar("2", TagId::INT),
            scalar("3", TagId::INT),
            Token::SeqEnd,
        ]);
        let set: BTreeSet<i64> = construct_document(tokens, &mut registry)?;
        assert_eq!(set.len(), 3);
        Ok(())
    }

    #[test]
    fn duplicate_map_keys_are_rejected() {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::MapStart {
                tag: TagId::MAP,
                anchor: None,
                composite_keys: false,
            },
            scalar("a", TagId::STR),
            scalar("1", TagId::INT),
            scalar("a", TagId::STR),
            scalar("2", TagId::INT),
            Token::MapEnd,
        ]);
        let err = construct_document::<BTreeMap<String, i64>>(tokens, &mut registry).unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::DuplicateKey { .. }
        ));
    }

    #[test]
    fn ordered_maps_preserve_order_and_reject_duplicates() {
        let mut registry = TagRegistry::new();
        let entry = |key: &str, value: &str| {
            vec![
                Token::MapStart {
                    tag: TagId::MAP,
                    anchor: None,
                    composite_keys: false,
                },
                scalar(key, TagId::STR),
                scalar(value, TagId::INT),
                Token::MapEnd,
            ]
        };
        let mut body = vec![Token::SeqStart {
            tag: TagId::OMAP,
            anchor: None,
        }];
        body.extend(entry("b", "2"));
        body.extend(entry("a", "1"));
        body.push(Token::SeqEnd);
        let map: OrderedMap<String, i64> =
            construct_document(doc(body), &mut registry).unwrap();
        let keys: Vec<_> = map.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, ["b", "a"]);

        let mut body = vec![Token::SeqStart {
            tag: TagId::OMAP,
            anchor: None,
        }];
        body.extend(entry("a", "1"));
        body.extend(entry("a", "2"));
        body.push(Token::SeqEnd);
        let err = construct_document::<OrderedMap<String, i64>>(doc(body), &mut registry)
            .unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::DuplicateKey { .. }
        ));
    }

    #[test]
    fn records_ignore_unknown_fields_and_default_missing_ones() -> Result<()> {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::MapStart {
                tag: TagId::ANY,
                anchor: None,
                composite_keys: false,
            },
            scalar("host", TagId::ANY),
            scalar("example.net", TagId::ANY),
            scalar("extras", TagId::ANY),
            Token::SeqStart {
                tag: TagId::ANY,
                anchor: None,
            },
            scalar("ignored", TagId::ANY),
            Token::SeqEnd,
            scalar("port", TagId::ANY),
            scalar("8080", TagId::ANY),
            Token::MapEnd,
        ]);
        let server: Server = construct_document(tokens, &mut registry)?;
        assert_eq!(
            server,
            Server {
                host: "example.net".to_string(),
                port: 8080,
                secure: false,
            }
        );
        Ok(())
    }

    #[test]
    fn implicit_union_dispatches_on_content() -> Result<()> {
        let mut registry = TagRegistry::new();
        let number: Contact =
            construct_document(doc(vec![scalar("42", TagId::ANY)]), &mut registry)?;
        assert_eq!(number, Contact::Code(42));
        let text: Contact =
            construct_document(doc(vec![scalar("hello", TagId::ANY)]), &mut registry)?;
        assert_eq!(text, Contact::Email("hello".to_string()));
        let unit: Contact =
            construct_document(doc(vec![scalar("~", TagId::ANY)]), &mut registry)?;
        assert_eq!(unit, Contact::Missing);
        Ok(())
    }

    #[test]
    fn implicit_union_rejects_unresolved_tags() {
        let mut registry = TagRegistry::new();
        let err =
            construct_document::<Contact>(doc(vec![scalar("true", TagId::ANY)]), &mut registry)
                .unwrap_err();
        match construction_error(err) {
            ConstructionError::UnresolvedVariant { union, tag } => {
                assert_eq!(union, "contact");
                assert_eq!(tag, "tag:yaml.org,2002:bool");
            }
            other => panic!("expected unresolved variant, got {other}"),
        }
    }

    #[test]
    fn explicit_union_selects_by_field_name() -> Result<()> {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::SeqStart {
                tag: TagId::SEQ,
                anchor: None,
            },
            Token::MapStart {
                tag: TagId::MAP,
                anchor: None,
                composite_keys: false,
            },
            scalar("cash", TagId::STR),
            scalar("12.5", TagId::FLOAT),
            Token::MapEnd,
            Token::SeqEnd,
        ]);
        let payment: Payment = construct_document(tokens, &mut registry)?;
        assert_eq!(payment, Payment::Cash(12.5));
        Ok(())
    }

    #[test]
    fn explicit_union_rejects_unknown_fields_and_empty_entries() {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::SeqStart {
                tag: TagId::SEQ,
                anchor: None,
            },
            Token::MapStart {
                tag: TagId::MAP,
                anchor: None,
                composite_keys: false,
            },
            scalar("wire", TagId::STR),
            scalar("x", TagId::STR),
            Token::MapEnd,
            Token::SeqEnd,
        ]);
        let err = construct_document::<Payment>(tokens, &mut registry).unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::InvalidVariantField { .. }
        ));

        let empty = doc(vec![
            Token::SeqStart {
                tag: TagId::SEQ,
                anchor: None,
            },
            Token::SeqEnd,
        ]);
        let err = construct_document::<Payment>(empty, &mut registry).unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn options_decode_null_and_values() -> Result<()> {
        let mut registry = TagRegistry::new();
        let none: Option<i64> =
            construct_document(doc(vec![scalar("null", TagId::ANY)]), &mut registry)?;
        assert_eq!(none, None);
        let some: Option<i64> =
            construct_document(doc(vec![scalar("7", TagId::INT)]), &mut registry)?;
        assert_eq!(some, Some(7));
        // An explicitly untyped "null" is the string, not an absent value.
        let text: Option<String> =
            construct_document(doc(vec![scalar("null", TagId::UNTYPED)]), &mut registry)?;
        assert_eq!(text, Some("null".to_string()));
        Ok(())
    }

    #[test]
    fn aliases_share_identity() -> Result<()> {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::SeqStart {
                tag: TagId::SEQ,
                anchor: None,
            },
            Token::Scalar {
                text: "5".to_string(),
                tag: TagId::INT,
                anchor: Some(AnchorId(1)),
            },
            Token::Alias {
                target: AnchorId(1),
            },
            Token::SeqEnd,
        ]);
        let values: Vec<Rc<RefCell<i64>>> = construct_document(tokens, &mut registry)?;
        assert_eq!(values.len(), 2);
        assert!(Rc::ptr_eq(&values[0], &values[1]));
        assert_eq!(*values[0].borrow(), 5);
        Ok(())
    }

    #[test]
    fn dangling_aliases_are_rejected() {
        let mut registry = TagRegistry::new();
        let tokens = doc(vec![Token::Alias {
            target: AnchorId(9),
        }]);
        let err =
            construct_document::<Rc<RefCell<i64>>>(tokens, &mut registry).unwrap_err();
        assert!(matches!(
            construction_error(err),
            ConstructionError::UnknownAnchor(AnchorId(9))
        ));
    }

    #[test]
    fn alias_type_mismatch_is_rejected() {
        let mut registry = TagRegistry::new();
        let mut ctx = ConstructionContext::new(&mut registry);
        ctx.register_anchor(AnchorId(1), Rc::new(RefCell::new(5i64)));
        let err = ctx
            .resolve_anchor::<Rc<RefCell<String>>>(AnchorId(1))
            .unwrap_err();
        assert!(matches!(err, ConstructionError::AliasType(AnchorId(1))));
    }

    #[test]
    fn cycles_reconstruct() -> Result<()> {
        #[derive(Debug, Default)]
        struct Chain {
            label: String,
            next: Option<Rc<RefCell<Chain>>>,
        }

        impl Tagged for Chain {
            fn canonical_tag(registry: &mut TagRegistry) -> TagId {
                custom_tag(registry, "chain")
            }
        }

        impl Record for Chain {
            const NAME: &'static str = "chain";
            const FIELDS: &'static [RecordField<Chain>] = &[
                RecordField {
                    name: "label",
                    construct: |value, tokens, ctx| {
                        value.label = String::construct(tokens, ctx)?;
                        Ok(())
                    },
                    represent: |value, ctx| value.label.represent(ctx),
                },
                RecordField {
                    name: "next",
                    construct: |value, tokens, ctx| {
                        value.next = Option::construct(tokens, ctx)?;
                        Ok(())
                    },
                    represent: |value, ctx| value.next.represent(ctx),
                },
            ];
        }

        impl Construct for Chain {
            fn construct(
                tokens: &mut TokenStream<'_>,
                ctx: &mut ConstructionContext<'_>,
            ) -> Result<Self, ConstructionError> {
                construct_record(tokens, ctx)
            }
        }

        impl Represent for Chain {
            fn represent(
                &self,
                ctx: &mut SerializationContext<'_, '_>,
            ) -> Result<(), StreamError> {
                represent_record(self, ctx)
            }
        }

        let mut registry = TagRegistry::new();
        let tokens = doc(vec![
            Token::MapStart {
                tag: TagId::MAP,
                anchor: Some(AnchorId(1)),
                composite_keys: false,
            },
            scalar("label", TagId::STR),
            scalar("loop", TagId::STR),
            scalar("next", TagId::STR),
            Token::Alias {
                target: AnchorId(1),
            },
            Token::MapEnd,
        ]);
        let root: Rc<RefCell<Chain>> = construct_document(tokens, &mut registry)?;
        let next = root.borrow().next.clone().expect("cycle edge present");
        assert!(Rc::ptr_eq(&root, &next));
        assert_eq!(root.borrow().label, "loop");
        Ok(())
    }

    #[test]
    fn binary_scalars_decode_base64() -> Result<()> {
        let mut registry = TagRegistry::new();
        let bytes: Binary = construct_document(
            doc(vec![scalar("aGVs\nbG8=", TagId::BINARY)]),
            &mut registry,
        )?;
        assert_eq!(bytes, Binary(b"hello".to_vec()));
        Ok(())
    }

    #[test]
    fn enum_name_tables() -> Result<()> {
        #[derive(Clone, Copy, Debug, PartialEq)]
        enum Axis {
            X,
            Y,
        }
        const AXES: &[(&str, Axis)] = &[("x", Axis::X), ("y", Axis::Y)];

        let mut registry = TagRegistry::new();
        let canonical = custom_tag(&mut registry, "axis");
        let mut source = doc(vec![scalar("y", TagId::ANY)]).into_iter();
        let mut stream = TokenStream::new(&mut source);
        let mut ctx = ConstructionContext::new(&mut registry);
        stream.next()?;
        let axis = construct_enum(&mut stream, &mut ctx, canonical, AXES, "axis")?;
        assert_eq!(axis, Axis::Y);
        Ok(())
    }

    #[test]
    fn producer_diagnostics_flow_through() {
        let mut registry = TagRegistry::new();
        // Warnings are skipped.
        let tokens = vec![
            Token::DocumentStart,
            Token::Warning {
                line: 1,
                column: 2,
                message: "tab indentation".to_string(),
            },
            scalar("1", TagId::INT),
            Token::DocumentEnd,
        ];
        let value: i64 = construct_document(tokens, &mut registry).unwrap();
        assert_eq!(value, 1);

        // Errors abort with the producer's position attached.
        let tokens = vec![
            Token::DocumentStart,
            Token::Error {
                line: 3,
                column: 7,
                message: "unexpected character".to_string(),
            },
            Token::DocumentEnd,
        ];
        let err = construct_document::<i64>(tokens, &mut registry).unwrap_err();
        match construction_error(err) {
            ConstructionError::Stream(StreamError::Producer { line, column, .. }) => {
                assert_eq!((line, column), (3, 7));
            }
            other => panic!("expected producer error, got {other}"),
        }
    }

    #[test]
    fn documents_must_be_framed() {
        let mut registry = TagRegistry::new();
        let err =
            construct_document::<i64>(vec![scalar("1", TagId::INT)], &mut registry).unwrap_err();
        assert!(err.to_string().contains("expected document start"));
    }
}
