// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Delay rings.
//!
//! A [`Delay`] is a ring of `count` same-typed data objects addressed by
//! logical index. Logical index `i` (with `|i| < count`) maps to physical slot
//! `(base + |i|) mod count`. Aging advances `base` by one, and every node
//! parameter bound to physical slot `p` must be rebound to `(p + 1) mod count`
//! so it keeps seeing the same logical index. The delay records those
//! bindings per physical slot; [`Delay::age`] returns the rebinding plan and
//! the caller applies it.

use crate::data::{Connection, DataRef};
use crate::error::{Result, VisionError};
use crate::handle::Handle;
use crate::reference::{RefHeader, ReferenceType};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One parameter that must move from slot `from` to slot `to` after aging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebind {
    pub connection: Connection,
    pub from: usize,
    pub to: usize,
}

struct DelayState {
    base: usize,
    associations: Vec<Vec<Connection>>,
}

pub struct Delay {
    header: RefHeader,
    handle: Handle,
    slots: Vec<DataRef>,
    state: Mutex<DelayState>,
}

impl std::fmt::Debug for Delay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delay")
            .field("name", &self.header.name())
            .field("count", &self.slots.len())
            .field("base", &self.base())
            .finish_non_exhaustive()
    }
}

/// Slots of a delay ring, checked to be non-empty.
#[derive(Debug, Clone)]
pub struct DelaySlots(Vec<DataRef>);

impl DelaySlots {
    /// # Errors
    ///
    /// Returns `InvalidParameters` for an empty ring.
    pub fn new(slots: Vec<DataRef>) -> Result<Self> {
        if slots.is_empty() {
            return Err(VisionError::InvalidParameters("a delay needs at least one slot".into()));
        }
        Ok(Self(slots))
    }
}

impl Delay {
    pub fn new(handle: Handle, scope: Option<Handle>, slots: DelaySlots) -> Self {
        let slots = slots.0;
        let count = slots.len();
        Self {
            header: RefHeader::new(ReferenceType::Delay, scope),
            handle,
            slots,
            state: Mutex::new(DelayState { base: 0, associations: vec![Vec::new(); count] }),
        }
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    pub const fn handle(&self) -> Handle {
        self.handle
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Slots in physical order.
    pub fn slots(&self) -> &[DataRef] {
        &self.slots
    }

    fn lock(&self) -> MutexGuard<'_, DelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base(&self) -> usize {
        self.lock().base
    }

    /// Physical slot of logical index `index`, if `|index| < count`.
    pub fn physical_index(&self, index: i32) -> Option<usize> {
        let offset = index.unsigned_abs() as usize;
        (offset < self.count()).then(|| (self.base() + offset) % self.count())
    }

    pub fn get_reference(&self, index: i32) -> Option<DataRef> {
        self.physical_index(index).map(|slot| DataRef::clone(&self.slots[slot]))
    }

    /// Physical slot holding `object`, matched by handle.
    pub fn slot_of(&self, object: &DataRef) -> Option<usize> {
        self.slots.iter().position(|s| s.handle() == object.handle())
    }

    pub fn add_association(&self, slot: usize, connection: Connection) {
        if let Some(list) = self.lock().associations.get_mut(slot) {
            list.push(connection);
        }
    }

    /// Returns whether the association existed.
    pub fn remove_association(&self, slot: usize, connection: Connection) -> bool {
        let mut state = self.lock();
        let Some(list) = state.associations.get_mut(slot) else {
            return false;
        };
        // One entry per binding; a rebind onto the same slot adds before it removes.
        match list.iter().position(|c| *c == connection) {
            Some(position) => {
                list.remove(position);
                true
            },
            None => false,
        }
    }

    /// Snapshot of bindings per physical slot.
    pub fn associations(&self) -> Vec<Vec<Connection>> {
        self.lock().associations.clone()
    }

    /// Advances the ring by one and returns the bindings to move.
    pub fn age(&self) -> Vec<Rebind> {
        let mut state = self.lock();
        let count = self.slots.len();
        state.base = (state.base + 1) % count;
        let plan = state
            .associations
            .iter()
            .enumerate()
            .flat_map(|(from, list)| {
                list.iter().map(move |connection| Rebind { connection: *connection, from, to: (from + 1) % count })
            })
            .collect();
        tracing::debug!(delay = %self.header.name(), base = state.base, "delay aged");
        plan
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::data::{DataFlags, DataObject};
    use crate::handle::Arena;
    use crate::shape::{DataShape, ImageShape};
    use crate::types::DfImage;
    use std::sync::Arc;

    fn ring(arena: &mut Arena<()>, count: usize) -> Delay {
        let slots = (0..count)
            .map(|_| {
                Arc::new(DataObject::new(
                    arena.insert(()),
                    None,
                    DataShape::Image(ImageShape::new(4, 4, DfImage::U8)),
                    DataFlags::default(),
                ))
            })
            .collect();
        Delay::new(arena.insert(()), None, DelaySlots::new(slots).unwrap())
    }

    #[test]
    fn test_logical_index_bounds() {
        let mut arena = Arena::new();
        let delay = ring(&mut arena, 3);
        assert_eq!(delay.physical_index(0), Some(0));
        assert_eq!(delay.physical_index(-2), Some(2));
        assert_eq!(delay.physical_index(3), None);
        assert_eq!(delay.physical_index(-3), None);
    }

    #[test]
    fn test_empty_ring_rejected() {
        let mut arena: Arena<()> = Arena::new();
        assert!(DelaySlots::new(Vec::new()).is_err());
    }

    #[test]
    fn test_age_plans_rebind_to_next_slot() {
        let mut arena = Arena::new();
        let delay = ring(&mut arena, 3);
        let node = arena.insert(());
        let connection = Connection { node, index: 0 };
        delay.add_association(2, connection);

        let plan = delay.age();
        assert_eq!(plan, vec![Rebind { connection, from: 2, to: 0 }]);
        assert_eq!(delay.base(), 1);
        assert!(delay.remove_association(2, connection));
        assert!(!delay.remove_association(2, connection));
    }

    #[test]
    fn test_single_slot_rebind_keeps_association() {
        let mut arena = Arena::new();
        let delay = ring(&mut arena, 1);
        let connection = Connection { node: arena.insert(()), index: 1 };
        delay.add_association(0, connection);

        let plan = delay.age();
        assert_eq!(plan, vec![Rebind { connection, from: 0, to: 0 }]);
        delay.add_association(0, connection);
        assert!(delay.remove_association(0, connection));
        assert_eq!(delay.associations(), vec![vec![connection]]);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod proptests {
    use super::*;
    use crate::data::{DataFlags, DataObject};
    use crate::handle::Arena;
    use crate::shape::{DataShape, ScalarShape};
    use crate::types::ScalarType;
    use proptest::prelude::*;
    use std::sync::Arc;

    proptest! {
        /// After `k` agings, logical index `i` resolves to the object that
        /// was originally at physical slot `(i + k) mod n`.
        #[test]
        fn rotation_matches_ring_offset(n in 1usize..8, k in 0usize..32) {
            let mut arena = Arena::new();
            let slots: Vec<DataRef> = (0..n)
                .map(|_| {
                    Arc::new(DataObject::new(
                        arena.insert(()),
                        None,
                        DataShape::Scalar(ScalarShape { data_type: ScalarType::Int32 }),
                        DataFlags::default(),
                    ))
                })
                .collect();
            let original: Vec<Handle> = slots.iter().map(|s| s.handle()).collect();
            let delay = Delay::new(arena.insert(()), None, DelaySlots::new(slots).unwrap());

            for _ in 0..k {
                delay.age();
            }
            for i in 0..n {
                let logical = i32::try_from(i).unwrap();
                let got = delay.get_reference(logical).unwrap().handle();
                prop_assert_eq!(got, original[(i + k) % n]);
                prop_assert_eq!(delay.get_reference(-logical).unwrap().handle(), got);
            }
        }
    }
}
