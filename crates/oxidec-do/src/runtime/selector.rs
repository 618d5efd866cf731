//! `Selector` interning for the `OxideC` runtime.
//!
//! Every distinct method name maps to exactly one interned entry, so two
//! selectors compare equal iff their name pointers are equal. Selectors travel
//! over the wire by name and are re-interned on the receiving side.
//!
//! # Sharding
//!
//! The registry is split into `NUM_SHARDS` independent shards chosen by the
//! low bits of the name's `FxHash`. Lookups that hit take one shard read
//! lock; misses take one shard write lock and double-check before inserting.

// SHARD_MASK is 15, the truncation is intentional.
#![allow(clippy::cast_possible_truncation)]

use crate::error::{Error, Result};
use fxhash::{FxHashMap, FxHasher};
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

/// Number of shards in the selector registry (power of two).
const NUM_SHARDS: usize = 16;

/// Bit mask for shard selection.
const SHARD_MASK: usize = NUM_SHARDS - 1;

/// Longest selector name that will be interned.
pub const MAX_SELECTOR_LEN: usize = 1024;

/// Interned selector data. Leaked on creation, lives for the program.
struct InternedSelector {
    name: &'static str,
    hash: u64,
}

struct SelectorShard {
    entries: RwLock<FxHashMap<&'static str, &'static InternedSelector>>,
}

struct SelectorRegistry {
    shards: [SelectorShard; NUM_SHARDS],
}

static REGISTRY: OnceLock<SelectorRegistry> = OnceLock::new();

fn registry() -> &'static SelectorRegistry {
    REGISTRY.get_or_init(|| SelectorRegistry {
        shards: std::array::from_fn(|_| SelectorShard {
            entries: RwLock::new(FxHashMap::default()),
        }),
    })
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// A unique method name.
///
/// ```rust
/// use oxidec_do::Selector;
/// use std::str::FromStr;
///
/// let a = Selector::from_str("setValue:forKey:").unwrap();
/// let b = Selector::from_str("setValue:forKey:").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.argument_count(), 2);
/// ```
#[derive(Clone, Copy)]
pub struct Selector {
    interned: &'static InternedSelector,
}

impl FromStr for Selector {
    type Err = Error;

    /// Returns the interned selector for `name`, interning it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorNotFound`] for an empty name, which can never
    /// name a method, or one longer than [`MAX_SELECTOR_LEN`].
    fn from_str(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_SELECTOR_LEN {
            return Err(Error::SelectorNotFound {
                selector: name.chars().take(64).collect(),
            });
        }
        if let Some(selector) = Selector::lookup(name) {
            return Ok(selector);
        }

        let hash = hash_name(name);
        let shard = &registry().shards[(hash as usize) & SHARD_MASK];

        let mut entries = shard.entries.write();
        // Another thread may have interned it while we waited.
        if let Some(interned) = entries.get(name) {
            return Ok(Selector { interned });
        }

        let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let interned: &'static InternedSelector =
            Box::leak(Box::new(InternedSelector { name, hash }));
        entries.insert(name, interned);
        Ok(Selector { interned })
    }
}

impl Selector {
    /// The selector named `name` if it has been interned, without interning
    /// it otherwise.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Selector> {
        let shard = &registry().shards[(hash_name(name) as usize) & SHARD_MASK];
        shard
            .entries
            .read()
            .get(name)
            .map(|&interned| Selector { interned })
    }

    /// Returns the selector's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.interned.name
    }

    /// Number of keyword parts, i.e. explicit arguments the name implies.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.interned.name.bytes().filter(|&b| b == b':').count()
    }

    /// Precomputed hash of the name.
    #[inline]
    #[must_use]
    pub fn hash_value(&self) -> u64 {
        self.interned.hash
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.interned, other.interned)
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.interned.hash);
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.interned.name)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.interned.name)
    }
}
