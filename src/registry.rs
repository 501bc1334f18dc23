//! Id-indexed storage for client resources.
//!
//! Images, layers and fences reference each other only through their opaque
//! 64-bit ids, never by direct ownership, which keeps what would otherwise
//! be a cyclic layer/image/fence graph as a flat arena. A `Registry` owns
//! one kind of resource and enforces id uniqueness and validity; the destroy
//! preconditions ("is this resource still part of a configuration?") belong
//! to the callers, which know about configuration membership.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::{ProtocolError, ResourceKind, INVALID_ID};

/// One kind of id -> resource mapping. All failures are protocol violations
/// and fatal to the session that issued them.
#[derive(Debug)]
pub struct Registry<T> {
    kind: ResourceKind,
    entries: BTreeMap<u64, T>,
}

impl<T> Registry<T> {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Binds `value` to `id`. Id 0 is reserved and never bindable.
    pub fn insert(&mut self, id: u64, value: T) -> Result<(), ProtocolError> {
        if id == INVALID_ID {
            return Err(ProtocolError::DuplicateId(self.kind, id));
        }
        match self.entries.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
            Entry::Occupied(_) => Err(ProtocolError::DuplicateId(self.kind, id)),
        }
    }

    pub fn get(&self, id: u64) -> Result<&T, ProtocolError> {
        self.entries
            .get(&id)
            .ok_or(ProtocolError::UnknownId(self.kind, id))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut T, ProtocolError> {
        self.entries
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownId(self.kind, id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: u64) -> Result<T, ProtocolError> {
        self.entries
            .remove(&id)
            .ok_or(ProtocolError::UnknownId(self.kind, id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &T)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut T)> {
        self.entries.iter_mut()
    }

    /// Removes every entry for which `predicate` returns true and hands it
    /// to `on_removed`. Used by the deferred-teardown sweep that runs on
    /// configuration transitions.
    pub fn sweep<P, F>(&mut self, mut predicate: P, mut on_removed: F)
    where
        P: FnMut(&u64, &T) -> bool,
        F: FnMut(u64, T),
    {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(id, value)| predicate(id, value))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(value) = self.entries.remove(&id) {
                on_removed(id, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_invalid_and_duplicate_ids() {
        let mut registry = Registry::new(ResourceKind::Image);
        assert_eq!(
            registry.insert(INVALID_ID, "a"),
            Err(ProtocolError::DuplicateId(ResourceKind::Image, 0))
        );
        assert_eq!(registry.insert(1, "a"), Ok(()));
        assert_eq!(
            registry.insert(1, "b"),
            Err(ProtocolError::DuplicateId(ResourceKind::Image, 1))
        );
        // The failed insert must not have clobbered the original binding.
        assert_eq!(registry.get(1), Ok(&"a"));
    }

    #[test]
    fn lookup_and_remove_unknown_ids() {
        let mut registry: Registry<u32> = Registry::new(ResourceKind::Layer);
        assert_eq!(
            registry.get(7),
            Err(ProtocolError::UnknownId(ResourceKind::Layer, 7))
        );
        assert_eq!(
            registry.remove(7),
            Err(ProtocolError::UnknownId(ResourceKind::Layer, 7))
        );
        registry.insert(7, 42).unwrap();
        assert_eq!(registry.remove(7), Ok(42));
        assert!(!registry.contains(7));
    }

    #[test]
    fn released_id_can_be_rebound_after_removal() {
        let mut registry = Registry::new(ResourceKind::Fence);
        registry.insert(3, "first").unwrap();
        assert_eq!(
            registry.insert(3, "second"),
            Err(ProtocolError::DuplicateId(ResourceKind::Fence, 3))
        );
        registry.remove(3).unwrap();
        assert_eq!(registry.insert(3, "second"), Ok(()));
    }

    #[test]
    fn sweep_removes_matching_entries() {
        let mut registry = Registry::new(ResourceKind::Image);
        for id in 1..=4 {
            registry.insert(id, id * 10).unwrap();
        }
        let mut removed = Vec::new();
        registry.sweep(|_, v| *v >= 30, |id, v| removed.push((id, v)));
        assert_eq!(removed, vec![(3, 30), (4, 40)]);
        assert!(registry.contains(1));
        assert!(registry.contains(2));
        assert!(!registry.contains(3));
    }
}
