// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Reference identity and reference counting.
//!
//! Every object carries a [`RefHeader`]: a process-unique id, a type tag, an
//! optional owning scope and a pair of counters. External counts belong to the
//! application; internal counts belong to other objects and are tagged with the
//! [`Holder`] that took them so mismatched releases can be detected.
//!
//! ## Over-release
//!
//! Driving a counter below zero, or releasing an internal count under a holder
//! that never took one, is a programming error. Debug builds fail a
//! `debug_assert!`; release builds log at error level and clamp the counter at
//! zero so the object is never destroyed twice.

use crate::handle::Handle;
use crate::types::ScalarType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

static NEXT_REF_ID: AtomicU32 = AtomicU32::new(1);

/// Type tag of a reference, also used for kernel parameter signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Context,
    Graph,
    Node,
    Kernel,
    Parameter,
    Target,
    Error,
    Meta,
    Delay,
    Lut,
    Distribution,
    Pyramid,
    Threshold,
    Matrix,
    Convolution,
    Scalar,
    Array,
    Image,
    Remap,
    /// A specific scalar subtype in a kernel signature.
    Value(ScalarType),
    /// A registered user struct type.
    UserStruct(u32),
}

impl ReferenceType {
    /// Whether references of this type carry data and can be bound to nodes.
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            Self::Delay
                | Self::Lut
                | Self::Distribution
                | Self::Pyramid
                | Self::Threshold
                | Self::Matrix
                | Self::Convolution
                | Self::Scalar
                | Self::Array
                | Self::Image
                | Self::Remap
        )
    }

    /// Prefix used for default object names.
    pub const fn name_prefix(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Graph => "graph",
            Self::Node => "node",
            Self::Kernel => "kernel",
            Self::Parameter => "parameter",
            Self::Target => "target",
            Self::Error => "error",
            Self::Meta => "meta",
            Self::Delay => "delay",
            Self::Lut => "lut",
            Self::Distribution => "distribution",
            Self::Pyramid => "pyramid",
            Self::Threshold => "threshold",
            Self::Matrix => "matrix",
            Self::Convolution => "convolution",
            Self::Scalar | Self::Value(_) => "scalar",
            Self::Array => "array",
            Self::Image => "image",
            Self::Remap => "remap",
            Self::UserStruct(_) => "user_struct",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(scalar) => write!(f, "scalar<{scalar:?}>"),
            Self::UserStruct(id) => write!(f, "user_struct<{id}>"),
            other => f.write_str(other.name_prefix()),
        }
    }
}

/// Which counter an increment or decrement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Internal,
    External,
}

/// The party holding an internal count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    Context,
    Object(Handle),
}

/// Internal/external counters plus the list of internal holders.
#[derive(Debug, Default)]
pub struct RefCounts {
    internal: u32,
    external: u32,
    holders: Vec<Holder>,
}

impl RefCounts {
    pub const fn internal(&self) -> u32 {
        self.internal
    }

    pub const fn external(&self) -> u32 {
        self.external
    }

    pub const fn total(&self) -> u32 {
        self.internal + self.external
    }

    pub fn holders(&self) -> &[Holder] {
        &self.holders
    }

    /// Returns the new total.
    pub fn increment(&mut self, kind: RefKind, holder: Holder) -> u32 {
        match kind {
            RefKind::External => self.external += 1,
            RefKind::Internal => {
                self.internal += 1;
                self.holders.push(holder);
            },
        }
        self.total()
    }

    /// Returns the new total. Over-release is clamped at zero.
    pub fn decrement(&mut self, kind: RefKind, holder: Holder, name: &str) -> u32 {
        match kind {
            RefKind::Internal => {
                debug_assert!(self.internal > 0, "internal ref count of {name} is already zero");
                if self.internal == 0 {
                    tracing::error!(reference = name, ?holder, "internal ref count is already zero");
                } else {
                    self.internal -= 1;
                }

                let pos = self.holders.iter().position(|h| *h == holder);
                debug_assert!(pos.is_some(), "{holder:?} does not hold {name}");
                if let Some(pos) = pos {
                    self.holders.remove(pos);
                } else {
                    tracing::error!(
                        reference = name,
                        ?holder,
                        holders = ?self.holders,
                        "releasing holder does not hold this reference"
                    );
                }
            },
            RefKind::External => {
                debug_assert!(self.external > 0, "external ref count of {name} is already zero");
                if self.external == 0 {
                    tracing::error!(reference = name, "external ref count is already zero");
                } else {
                    self.external -= 1;
                }
            },
        }
        self.total()
    }
}

/// Identity and counters shared by every object.
#[derive(Debug)]
pub struct RefHeader {
    id: u32,
    ty: ReferenceType,
    scope: Option<Handle>,
    name: Mutex<String>,
    counts: Mutex<RefCounts>,
}

impl RefHeader {
    pub fn new(ty: ReferenceType, scope: Option<Handle>) -> Self {
        let id = NEXT_REF_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            ty,
            scope,
            name: Mutex::new(format!("{}_{id}", ty.name_prefix())),
            counts: Mutex::new(RefCounts::default()),
        }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn ty(&self) -> ReferenceType {
        self.ty
    }

    /// Owning object; `None` means the context itself.
    pub const fn scope(&self) -> Option<Handle> {
        self.scope
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn increment(&self, kind: RefKind, holder: Holder) -> u32 {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).increment(kind, holder)
    }

    pub fn decrement(&self, kind: RefKind, holder: Holder) -> u32 {
        let name = self.name();
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).decrement(kind, holder, &name)
    }

    pub fn internal_count(&self) -> u32 {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).internal()
    }

    pub fn external_count(&self) -> u32 {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).external()
    }

    pub fn total_count(&self) -> u32 {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).total()
    }

    pub fn holders(&self) -> Vec<Holder> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).holders().to_vec()
    }

    pub fn info(&self) -> ReferenceInfo {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        ReferenceInfo {
            id: self.id,
            name: self.name(),
            ty: self.ty,
            internal_count: counts.internal(),
            external_count: counts.external(),
        }
    }
}

/// Snapshot returned by reference queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub id: u32,
    pub name: String,
    pub ty: ReferenceType,
    pub internal_count: u32,
    pub external_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Arena;

    fn holder(n: u32) -> Holder {
        let mut arena = Arena::new();
        let mut last = arena.insert(());
        for _ in 0..n {
            last = arena.insert(());
        }
        Holder::Object(last)
    }

    #[test]
    fn test_increment_decrement_tracks_holders() {
        let mut counts = RefCounts::default();
        let a = holder(0);
        let b = holder(1);
        assert_eq!(counts.increment(RefKind::External, Holder::Context), 1);
        assert_eq!(counts.increment(RefKind::Internal, a), 2);
        assert_eq!(counts.increment(RefKind::Internal, b), 3);
        assert_eq!(counts.holders(), &[a, b]);

        assert_eq!(counts.decrement(RefKind::Internal, a, "obj"), 2);
        assert_eq!(counts.holders(), &[b]);
        assert_eq!(counts.decrement(RefKind::External, Holder::Context, "obj"), 1);
        assert_eq!(counts.decrement(RefKind::Internal, b, "obj"), 0);
    }

    #[test]
    fn test_same_holder_may_hold_twice() {
        let mut counts = RefCounts::default();
        let a = holder(0);
        counts.increment(RefKind::Internal, a);
        counts.increment(RefKind::Internal, a);
        assert_eq!(counts.decrement(RefKind::Internal, a, "obj"), 1);
        assert_eq!(counts.holders(), &[a]);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already zero")]
    fn test_over_release_asserts_in_debug() {
        let mut counts = RefCounts::default();
        counts.decrement(RefKind::External, Holder::Context, "obj");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_over_release_clamps_in_release() {
        let mut counts = RefCounts::default();
        assert_eq!(counts.decrement(RefKind::External, Holder::Context, "obj"), 0);
        assert_eq!(counts.decrement(RefKind::Internal, Holder::Context, "obj"), 0);
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn test_header_default_name_and_unique_ids() {
        let a = RefHeader::new(ReferenceType::Image, None);
        let b = RefHeader::new(ReferenceType::Image, None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), format!("image_{}", a.id()));
        a.set_name("input");
        assert_eq!(a.info().name, "input");
    }

    #[test]
    fn test_data_types() {
        assert!(ReferenceType::Image.is_data());
        assert!(ReferenceType::Delay.is_data());
        assert!(!ReferenceType::Node.is_data());
        assert!(!ReferenceType::Value(ScalarType::Int32).is_data());
    }
}
