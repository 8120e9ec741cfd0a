// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Generation-checked handles and the arena that resolves them.
//!
//! Every object the context owns lives in an [`Arena`] slot. Objects refer to
//! each other only through [`Handle`]s, so a handle kept past its object's
//! release resolves to `None` instead of dangling: freeing a slot bumps its
//! generation and every outstanding handle to the old occupant goes stale.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index + generation pair identifying one arena slot occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next_free: Option<u32> },
}

/// Slot map with a free list.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free_head: None, len: 0 }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Stores the value built by `f`, which receives the handle it will live at.
    pub fn insert_with(&mut self, f: impl FnOnce(Handle) -> T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free_head {
            if let Some(Slot::Free { generation, next_free }) = self.slots.get(index as usize) {
                let (generation, next_free) = (*generation, *next_free);
                let handle = Handle { index, generation };
                self.slots[index as usize] = Slot::Occupied { generation, value: f(handle) };
                self.free_head = next_free;
                return handle;
            }
            self.free_head = None;
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = self.slots.len() as u32;
        let handle = Handle { index, generation: 0 };
        self.slots.push(Slot::Occupied { generation: 0, value: f(handle) });
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            },
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            },
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes the occupant and invalidates every handle to it.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {},
            _ => return None,
        }

        let next_generation = handle.generation.wrapping_add(1);
        let old = std::mem::replace(
            slot,
            Slot::Free { generation: next_generation, next_free: self.free_head },
        );
        self.free_head = Some(handle.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            #[allow(clippy::cast_possible_truncation)]
            Slot::Occupied { generation, value } => {
                Some((Handle { index: index as u32, generation: *generation }, value))
            },
            Slot::Free { .. } => None,
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_handle_after_remove() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());

        // The slot is reused with a new generation; the old handle stays stale.
        let b = arena.insert(2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut arena = Arena::new();
        let h = arena.insert_with(|h| h);
        assert_eq!(arena.get(h), Some(&h));
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(handles[1]);
        arena.remove(handles[3]);
        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 4]);
        assert_eq!(arena.len(), 3);
    }
}
