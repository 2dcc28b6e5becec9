//! Interned names for properties, globals and parameters.
//!
//! Identical names share one `Rc<str>` allocation, so map keys and step
//! operands compare cheaply and never duplicate storage.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

/// A shared, immutable name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Name(Rc<str>);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0.as_ref() == other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == *other
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name(s.into())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name(s.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dictionary for deduplicating names.
///
/// Names inserted into the dictionary are stored once and subsequent
/// requests for the same text return a cheap clone of the existing handle.
pub struct NameDict {
    /// Map from name text to shared handle.
    /// Box<str> keys avoid double-indirection through Rc.
    names: FxHashMap<Box<str>, Name>,
}

impl NameDict {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self {
            names: FxHashMap::default(),
        }
    }

    /// Create a dictionary pre-populated with common runtime names.
    pub fn with_common_names() -> Self {
        let mut dict = Self::new();
        for s in COMMON_NAMES {
            dict.get_or_insert(s);
        }
        dict
    }

    /// Get an existing name or insert a new one.
    pub fn get_or_insert(&mut self, s: &str) -> Name {
        if let Some(existing) = self.names.get(s) {
            return existing.clone();
        }
        let name = Name::from(s);
        self.names.insert(s.into(), name.clone());
        name
    }

    /// Get an existing name without inserting.
    pub fn get(&self, s: &str) -> Option<Name> {
        self.names.get(s).cloned()
    }

    /// Number of unique names in the dictionary.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for NameDict {
    fn default() -> Self {
        Self::new()
    }
}

/// Names that appear frequently in hosted programs and the runtime itself.
const COMMON_NAMES: &[&str] = &[
    // pseudo-properties on builtin instances
    "len",
    "push",
    "pop",
    "keys",
    "clone",
    // generator protocol
    "next",
    "done",
    "value",
    // common identifiers
    "self",
    "args",
    "result",
    "main",
    "i",
    "j",
    "k",
    "n",
    "x",
    "y",
    "acc",
    "item",
    "key",
    "val",
    "fn",
    "cb",
    "err",
];
