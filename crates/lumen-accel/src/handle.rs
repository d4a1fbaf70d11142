//! Typed handles into the scene graph.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Handle to a graph object of type `T`.
///
/// Handles are never reused within a context, so a handle to a destroyed
/// object stays dangling instead of aliasing a newer one.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    const fn new(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Raw index, unique per object kind within a context.
    pub fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{short}#{}", self.index)
    }
}

/// Storage for one object kind. Iteration is in creation order.
pub(crate) struct Arena<T> {
    next: u32,
    items: BTreeMap<u32, T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            next: 0,
            items: BTreeMap::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Id<T> {
        let index = self.next;
        self.next += 1;
        self.items.insert(index, value);
        Id::new(index)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(&id.index)
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(&id.index)
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        self.items.contains_key(&id.index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items.iter().map(|(&index, item)| (Id::new(index), item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id<T>, &mut T)> {
        self.items
            .iter_mut()
            .map(|(&index, item)| (Id::new(index), item))
    }

    /// Keep only the objects for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(Id<T>, &mut T) -> bool) {
        self.items.retain(|&index, item| keep(Id::new(index), item));
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;

    #[test]
    fn handles_are_not_reused() {
        let mut arena = Arena::default();
        let first = arena.insert(Widget);
        arena.clear();
        let second = arena.insert(Widget);

        assert_ne!(first, second);
        assert!(!arena.contains(first));
        assert!(arena.contains(second));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn debug_names_the_kind() {
        let mut arena = Arena::default();
        arena.insert(Widget);
        let id = arena.insert(Widget);
        assert_eq!(format!("{id:?}"), "Widget#1");
    }
}
