// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! VisionFlow Core - object model of the VisionFlow dataflow runtime.
//!
//! This crate defines everything a graph is built from, independent of how
//! graphs are verified and executed:
//!
//! ## Core Modules
//!
//! - [`handle`]: Generation-checked handles and the object arena
//! - [`reference`]: Reference identity and internal/external counting
//! - [`types`]: Plain value types (formats, rectangles, directions)
//! - [`shape`]: Buffer shapes of the typed data objects
//! - [`meta`]: Shapes declared by output validators
//! - [`memory`]: Physical planes and the allocator seam
//! - [`data`]: Data objects, connections, alliances and views
//! - [`resource_manager`]: Slot rings and input/output queues
//! - [`delay`]: Delay rings and aging
//! - [`kernel`]: Kernel descriptors and callbacks
//! - [`registry`]: Kernel registry and targets
//! - [`state`]: Graph and node states
//! - [`perf`]: Execution timing
//! - [`error`]: Error types and status codes

pub mod data;
pub mod delay;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod memory;
pub mod meta;
pub mod perf;
pub mod reference;
pub mod registry;
pub mod resource_manager;
pub mod shape;
pub mod state;
pub mod types;

// Error handling
pub use error::{Result, Status, VisionError};

// Object model
pub use data::{Connection, DataFlags, DataObject, DataRef, View, ViewKind};
pub use delay::{Delay, DelaySlots};
pub use handle::{Arena, Handle};
pub use reference::{Holder, RefHeader, RefKind, ReferenceInfo, ReferenceType};

// Kernels
pub use kernel::{Kernel, KernelArgs, KernelCallbacks, KernelParam};
pub use meta::Meta;
pub use registry::KernelRegistry;

// Storage
pub use memory::{Allocator, HeapAllocator, Import, Memory, SharedMemory};
pub use resource_manager::{InputQueueManager, OutputQueueManager, ResourceKind, SlotManager};
pub use shape::{DataShape, ImageShape, ResourceAlloc};

// Lifecycle and timing
pub use perf::{Perf, PerfMonitor};
pub use state::{CallbackAction, GraphState, NodeStatus};
pub use types::{
    BorderMode, Direction, DfImage, ExecMode, ItemType, ParamState, Rectangle, ScalarType,
};
