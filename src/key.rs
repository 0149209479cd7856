//! Composable identity values used to partition keyed work.
//!
//! A [`Key`] is a non-empty set of atoms. Two keys are equal iff their atom
//! sets are equal, regardless of the order they were combined in, and
//! [`Key::combine`] is plain set union: combining a key with itself (or with
//! a subset of itself) yields an equal key.

use std::any::TypeId;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use crate::id::Id;

/// A single identity atom inside a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyAtom {
    /// A signed integer value.
    Int(i64),
    /// A boolean value.
    Bool(bool),
    /// A string value.
    Str(Arc<str>),
    /// The identity of a Rust type.
    Type(TypeId),
    /// A process-wide unique identifier, see [`Key::fresh`].
    Unique(u64),
    /// A source location, see [`Key::caller`].
    Source {
        /// Source file path as reported by the compiler.
        file: &'static str,
        /// 1-based line number.
        line: u32,
        /// 1-based column number.
        column: u32,
    },
    /// Digest of an arbitrary hashable value, see [`Key::of_hashable`].
    Hashed(u64),
}

/// An identity value with set-semantic composition.
///
/// Keys partition the work routed through a
/// [`KeyedTaskManager`](crate::manager::KeyedTaskManager): submissions under
/// equal keys share one logical queue, submissions under distinct keys are
/// independent.
///
/// # Example
///
/// ```
/// use lariat::Key;
///
/// let a = Key::from("sync").combine(&Key::from(7));
/// let b = Key::from(7).combine(&Key::from("sync"));
/// assert_eq!(a, b);
/// assert_eq!(a.clone().combine(&a), b);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    // Sorted storage makes iteration order canonical, so the derived Eq and
    // Hash are set-semantic.
    atoms: BTreeSet<KeyAtom>,
}

impl Key {
    /// Creates a key holding a single atom.
    pub fn from_atom(atom: KeyAtom) -> Self {
        Self {
            atoms: BTreeSet::from([atom]),
        }
    }

    /// Creates a key that is distinct from every other key ever created in
    /// this process.
    pub fn fresh() -> Self {
        Self::from_atom(KeyAtom::Unique(Id::next().as_u64()))
    }

    /// Creates a key from the caller's source location (file:line:column).
    ///
    /// Two call sites on different lines produce distinct keys; re-executing
    /// the same call site produces equal keys.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Self::source(loc.file(), loc.line(), loc.column())
    }

    /// Creates a key from an explicit source location.
    pub fn source(file: &'static str, line: u32, column: u32) -> Self {
        Self::from_atom(KeyAtom::Source { file, line, column })
    }

    /// Creates a key from the identity of type `T`.
    pub fn of_type<T: 'static>() -> Self {
        Self::from_atom(KeyAtom::Type(TypeId::of::<T>()))
    }

    /// Creates a key from the digest of an arbitrary hashable value.
    pub fn of_hashable<H: Hash>(value: &H) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        value.hash(&mut hasher);
        Self::from_atom(KeyAtom::Hashed(hasher.finish()))
    }

    /// Returns the union of `self` and `other`.
    ///
    /// Atoms already included are ignored, so `a.combine(&a) == a` and
    /// `a.combine(&b) == b.combine(&a)`.
    #[must_use]
    pub fn combine(mut self, other: &Key) -> Key {
        self.atoms.extend(other.atoms.iter().cloned());
        self
    }

    /// Returns `true` if every atom of `other` is contained in `self`.
    pub fn contains(&self, other: &Key) -> bool {
        other.atoms.is_subset(&self.atoms)
    }

    /// Number of atoms in this key. Always at least 1.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// A key is never empty; this only exists to satisfy the `len` lint pair.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<KeyAtom> for Key {
    fn from(atom: KeyAtom) -> Self {
        Self::from_atom(atom)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::from_atom(KeyAtom::Int(value))
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::from_atom(KeyAtom::Int(value.into()))
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Self::from_atom(KeyAtom::Bool(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::from_atom(KeyAtom::Str(value.into()))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::from_atom(KeyAtom::Str(value.into()))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key")?;
        f.debug_set().entries(self.atoms.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_combine_is_order_independent() {
        let a = Key::from("left").combine(&Key::from(1)).combine(&Key::from(true));
        let b = Key::from(true).combine(&Key::from("left")).combine(&Key::from(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_combine_with_self_is_identity() {
        let a = Key::from("a").combine(&Key::from("b"));
        assert_eq!(a.clone().combine(&a.clone()), a);
        assert_eq!(a.clone().combine(&Key::from("b")), a);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_set_semantics_in_hash_maps() {
        let mut map = HashMap::new();
        map.insert(Key::from(1).combine(&Key::from(2)), "first");
        map.insert(Key::from(2).combine(&Key::from(1)), "second");
        assert_eq!(map.len(), 1);
        assert_eq!(map[&Key::from(1).combine(&Key::from(2))], "second");
    }

    #[test]
    fn test_fresh_keys_are_distinct() {
        let a = Key::fresh();
        let b = Key::fresh();
        assert_ne!(a, b);
        assert!(!a.contains(&b));
    }

    #[test]
    fn test_caller_keys_track_call_site() {
        fn here() -> Key {
            Key::caller()
        }

        let a = Key::caller();
        let b = Key::caller();
        assert_ne!(a, b);
        assert_eq!(here(), here());
    }

    #[test]
    fn test_type_keys() {
        assert_eq!(Key::of_type::<u8>(), Key::of_type::<u8>());
        assert_ne!(Key::of_type::<u8>(), Key::of_type::<u16>());
    }

    #[test]
    fn test_hashable_keys() {
        assert_eq!(Key::of_hashable(&(1, "x")), Key::of_hashable(&(1, "x")));
        assert_ne!(Key::of_hashable(&(1, "x")), Key::of_hashable(&(2, "x")));
    }

    #[test]
    fn test_contains_subset() {
        let ab = Key::from("a").combine(&Key::from("b"));
        assert!(ab.contains(&Key::from("a")));
        assert!(!Key::from("a").contains(&ab));
    }
}
