//! Shared shape machinery: descriptor tables for records and tagged unions,
//! and the container/scalar newtypes that need their own wire forms.

use crate::construct::{ConstructionContext, TokenStream};
use crate::error::{ConstructionError, StreamError};
use crate::represent::SerializationContext;
use crate::tag::{TagId, TagRegistry, Tagged};

/// Build the memoized `custom:<name>` tag for a user-defined type.
pub fn custom_tag(registry: &mut TagRegistry, name: &str) -> TagId {
    registry.lookup_or_register(&format!("custom:{name}"))
}

/// One declared field of a record type.
///
/// Field tables are declaration-ordered and drive both engines: construction
/// looks fields up by key name, representation emits them in table order on
/// every pass.
pub struct RecordField<T> {
    pub name: &'static str,
    pub construct: fn(
        &mut T,
        &mut TokenStream<'_>,
        &mut ConstructionContext<'_>,
    ) -> Result<(), ConstructionError>,
    pub represent: fn(&T, &mut SerializationContext<'_, '_>) -> Result<(), StreamError>,
}

/// A record (or named tuple) with an explicit field descriptor table.
///
/// Missing fields keep their `Default` values; unknown keys in the input are
/// skipped without failing the pass.
pub trait Record: Tagged + Default + 'static {
    const NAME: &'static str;
    const FIELDS: &'static [RecordField<Self>];
}

/// Wire shape of a tagged union.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnionStyle {
    /// A sequence of single-entry maps, one naming the active field.
    Explicit,
    /// The active payload stands alone; the variant is inferred from the
    /// pending token's tag (classified when wildcard).
    Implicit,
}

/// One variant of a tagged union.
pub struct UnionVariant<T> {
    pub name: &'static str,
    /// Canonical tag of the payload, tested during implicit dispatch.
    /// `None` marks a unit-like variant that matches the null intrinsic
    /// kind and consumes its token without further decoding.
    pub payload_tag: Option<fn(&mut TagRegistry) -> TagId>,
    pub construct:
        fn(&mut TokenStream<'_>, &mut ConstructionContext<'_>) -> Result<T, ConstructionError>,
    /// Emits the active variant's payload only.
    pub represent: fn(&T, &mut SerializationContext<'_, '_>) -> Result<(), StreamError>,
}

/// A tagged union with an explicit variant descriptor table.
///
/// At most one payload is active at a time; `active` names its index into
/// `VARIANTS`.
pub trait Union: Tagged + Sized + 'static {
    const NAME: &'static str;
    const STYLE: UnionStyle;
    const VARIANTS: &'static [UnionVariant<Self>];

    fn active(&self) -> usize;
}

/// Insertion-ordered associative map.
///
/// Encoded as a sequence of single-entry maps under the ordered-map tag, so
/// order survives the wire. Duplicate keys are rejected at decode time; a
/// plain `Vec` of entries keeps key requirements minimal.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedMap<K, V> {
    entries: Vec<(K, V)>,
}

impl<K, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        OrderedMap {
            entries: Vec::new(),
        }
    }

    /// Append an entry; ordering is insertion order.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &K) -> Option<&V>
    where
        K: PartialEq,
    {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool
    where
        K: PartialEq,
    {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (K, V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        OrderedMap::new()
    }
}

impl<K, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        OrderedMap {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<K: Tagged, V: Tagged> Tagged for OrderedMap<K, V> {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::OMAP
    }
}

/// Byte string carried as a base64 scalar under the binary built-in tag.
///
/// A newtype rather than `Vec<u8>` so byte strings and integer sequences
/// stay distinct wire shapes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Binary(pub Vec<u8>);

impl Tagged for Binary {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::BINARY
    }

    const IS_SCALAR: bool = true;
}
