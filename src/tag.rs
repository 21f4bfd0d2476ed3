//! Tag identities and the URI registry shared by both engines.

use std::collections::HashMap;

/// Compact identity for a type/schema tag within one registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TagId(u32);

impl TagId {
    /// Resolve-by-content wildcard: the scalar's concrete kind must be
    /// inferred from its text.
    pub const ANY: TagId = TagId(0);
    /// Explicit-untyped wildcard: treat the scalar as a plain string, no
    /// inference.
    pub const UNTYPED: TagId = TagId(1);

    pub const STR: TagId = TagId(2);
    pub const SEQ: TagId = TagId(3);
    pub const MAP: TagId = TagId(4);
    pub const NULL: TagId = TagId(5);
    pub const BOOL: TagId = TagId(6);
    pub const INT: TagId = TagId(7);
    pub const FLOAT: TagId = TagId(8);
    pub const OMAP: TagId = TagId(9);
    pub const PAIRS: TagId = TagId(10);
    pub const SET: TagId = TagId(11);
    pub const BINARY: TagId = TagId(12);
    pub const MERGE: TagId = TagId(13);
    pub const TIMESTAMP: TagId = TagId(14);
    pub const VALUE: TagId = TagId(15);

    /// True for the two universal wildcards.
    pub fn is_wildcard(self) -> bool {
        self == TagId::ANY || self == TagId::UNTYPED
    }
}

const BUILTIN_URIS: &[&str] = &[
    "?",
    "!",
    "tag:yaml.org,2002:str",
    "tag:yaml.org,2002:seq",
    "tag:yaml.org,2002:map",
    "tag:yaml.org,2002:null",
    "tag:yaml.org,2002:bool",
    "tag:yaml.org,2002:int",
    "tag:yaml.org,2002:float",
    "tag:yaml.org,2002:omap",
    "tag:yaml.org,2002:pairs",
    "tag:yaml.org,2002:set",
    "tag:yaml.org,2002:binary",
    "tag:yaml.org,2002:merge",
    "tag:yaml.org,2002:timestamp",
    "tag:yaml.org,2002:value",
];

/// Bidirectional URI ↔ `TagId` table.
///
/// Pre-seeded with the well-known built-ins; remaining ids are assigned on
/// demand for composite/custom type names. Once a URI has an id, that
/// mapping never changes for the registry's lifetime. Shared across passes;
/// callers running concurrent passes must synchronize externally.
#[derive(Debug)]
pub struct TagRegistry {
    by_uri: HashMap<String, TagId>,
    by_id: Vec<String>,
}

impl TagRegistry {
    pub fn new() -> Self {
        let mut registry = TagRegistry {
            by_uri: HashMap::new(),
            by_id: Vec::new(),
        };
        for uri in BUILTIN_URIS {
            registry.register_uri(uri);
        }
        registry
    }

    /// Allocate a fresh id for `uri`. Does not deduplicate; callers that
    /// need idempotence go through [`lookup_or_register`].
    ///
    /// [`lookup_or_register`]: TagRegistry::lookup_or_register
    pub fn register_uri(&mut self, uri: &str) -> TagId {
        let id = TagId(self.by_id.len() as u32);
        self.by_id.push(uri.to_string());
        // First mapping for a URI wins and stays immutable.
        self.by_uri.entry(uri.to_string()).or_insert(id);
        id
    }

    pub fn lookup(&self, uri: &str) -> Option<TagId> {
        self.by_uri.get(uri).copied()
    }

    /// The idempotent entry point: existing id for `uri`, or a fresh one.
    pub fn lookup_or_register(&mut self, uri: &str) -> TagId {
        match self.lookup(uri) {
            Some(id) => id,
            None => self.register_uri(uri),
        }
    }

    /// The URI registered for `id`.
    ///
    /// Panics if `id` was never issued by this registry: ids are only ever
    /// produced here, so an unknown one is a programming error, not a
    /// recoverable condition.
    pub fn uri(&self, id: TagId) -> &str {
        self.by_id
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("tag id {} was never issued by this registry", id.0))
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        TagRegistry::new()
    }
}

/// Capability shared by every codec-capable type: its canonical tag.
///
/// Composite types build parametric URIs from their children's URIs and
/// memoize the result through `lookup_or_register`, so repeated queries for
/// the same shape return the same id.
pub trait Tagged {
    fn canonical_tag(registry: &mut TagRegistry) -> TagId;

    /// True for types represented as a single scalar token. Consumed by the
    /// mapping-start layout hint for composite keys.
    const IS_SCALAR: bool = false;
}

macro_rules! scalar_tagged {
    ($tag:expr => $($ty:ty),+ $(,)?) => {
        $(impl Tagged for $ty {
            fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
                $tag
            }

            const IS_SCALAR: bool = true;
        })+
    };
}

scalar_tagged!(TagId::STR => String, char);
scalar_tagged!(TagId::BOOL => bool);
scalar_tagged!(TagId::INT => i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
scalar_tagged!(TagId::FLOAT => f32, f64);

impl<T: Tagged> Tagged for Vec<T> {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::SEQ
    }
}

/// Fixed-size arrays get a parametric name built from the element's URI,
/// memoized so repeated queries for the same shape share one id.
impl<T: Tagged, const N: usize> Tagged for [T; N] {
    fn canonical_tag(registry: &mut TagRegistry) -> TagId {
        let element = T::canonical_tag(registry);
        let uri = format!("custom:array({})", registry.uri(element));
        registry.lookup_or_register(&uri)
    }
}

impl<T: Tagged> Tagged for std::collections::BTreeSet<T> {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::SET
    }
}

impl<K: Tagged, V: Tagged> Tagged for std::collections::BTreeMap<K, V> {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::MAP
    }
}

impl<K: Tagged, V: Tagged> Tagged for std::collections::HashMap<K, V> {
    fn canonical_tag(_registry: &mut TagRegistry) -> TagId {
        TagId::MAP
    }
}

impl<T: Tagged> Tagged for Option<T> {
    fn canonical_tag(registry: &mut TagRegistry) -> TagId {
        T::canonical_tag(registry)
    }

    const IS_SCALAR: bool = T::IS_SCALAR;
}

impl<T: Tagged> Tagged for Box<T> {
    fn canonical_tag(registry: &mut TagRegistry) -> TagId {
        T::canonical_tag(registry)
    }

    const IS_SCALAR: bool = T::IS_SCALAR;
}

impl<T: Tagged> Tagged for std::rc::Rc<std::cell::RefCell<T>> {
    fn canonical_tag(registry: &mut TagRegistry) -> TagId {
        T::canonical_tag(registry)
    }

    const IS_SCALAR: bool = T::IS_SCALAR;
}
