// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Data objects: the typed references nodes read and write.
//!
//! A [`DataObject`] combines a [`RefHeader`] with
//! - a [`DataShape`] (inferred during verification for virtual objects),
//! - per-graph connection lists recording which node parameters read and
//!   write it,
//! - an alliance set of objects sharing its storage (ROI and parent image,
//!   pyramid and its levels),
//! - an optional delay membership,
//! - its physical backing: one solid buffer, a slot ring, or a queue.
//!
//! Objects backed by several buffers own one clone per buffer. A clone shares
//! the original's handle and shape and is bound to exactly one buffer, so a
//! kernel working on frame `n` sees frame `n`'s storage while the logical
//! object stays single.

use crate::error::{Result, VisionError};
use crate::handle::Handle;
use crate::memory::{Allocator, Memory, Plane, SharedMemory};
use crate::meta::Meta;
use crate::reference::{RefHeader, ReferenceType};
use crate::resource_manager::{InputQueueManager, OutputQueueManager, ResourceKind, SlotManager};
use crate::shape::DataShape;
use crate::types::{Direction, Rectangle};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

pub type DataRef = Arc<DataObject>;

/// One node parameter bound to a data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub node: Handle,
    pub index: u32,
}

#[derive(Debug, Default)]
struct GraphLinks {
    writers: Vec<Connection>,
    readers: Vec<Connection>,
}

/// Slot of a delay ring an object occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayMembership {
    pub delay: Handle,
    pub slot: usize,
}

#[derive(Debug, Default)]
struct Links {
    graphs: IndexMap<Handle, GraphLinks>,
    alliance: Vec<Weak<DataObject>>,
    roi_children: Vec<Weak<DataObject>>,
    delay: Option<DelayMembership>,
}

/// How a view maps onto its parent's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Region of an image.
    Roi(Rectangle),
    /// One level of a pyramid.
    Level(usize),
}

#[derive(Debug, Clone)]
pub struct View {
    pub parent: DataRef,
    pub kind: ViewKind,
}

/// Physical storage of a data object.
pub enum Backing {
    None,
    Solid(SharedMemory),
    Slot(Arc<SlotManager<DataRef>>),
    InputQueue(Arc<InputQueueManager<DataRef>>),
    OutputQueue(Arc<OutputQueueManager<DataRef>>),
}

impl Backing {
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::None => ResourceKind::None,
            Self::Solid(_) => ResourceKind::Solid,
            Self::Slot(_) => ResourceKind::Slot,
            Self::InputQueue(_) => ResourceKind::InputQueue,
            Self::OutputQueue(_) => ResourceKind::OutputQueue,
        }
    }
}

struct ResourceState {
    backing: Backing,
    clones: Vec<DataRef>,
}

/// Creation flags of a data object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFlags {
    pub is_virtual: bool,
    /// Fed or drained by the application through a queue.
    pub queue: bool,
}

pub struct DataObject {
    header: RefHeader,
    handle: Handle,
    flags: DataFlags,
    clone_index: Option<usize>,
    shape: RwLock<DataShape>,
    view: Option<View>,
    links: Mutex<Links>,
    resource: Mutex<ResourceState>,
}

impl std::fmt::Debug for DataObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObject")
            .field("name", &self.header.name())
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("clone_index", &self.clone_index)
            .field("shape", &self.shape())
            .finish_non_exhaustive()
    }
}

impl DataObject {
    pub fn new(handle: Handle, scope: Option<Handle>, shape: DataShape, flags: DataFlags) -> Self {
        Self {
            header: RefHeader::new(shape.reference_type(), scope),
            handle,
            flags,
            clone_index: None,
            shape: RwLock::new(shape),
            view: None,
            links: Mutex::new(Links::default()),
            resource: Mutex::new(ResourceState { backing: Backing::None, clones: Vec::new() }),
        }
    }

    /// Creates a view onto `parent`'s storage.
    pub fn new_view(handle: Handle, scope: Option<Handle>, shape: DataShape, view: View) -> Self {
        let flags = DataFlags { is_virtual: view.parent.is_virtual(), queue: false };
        let mut object = Self::new(handle, scope, shape, flags);
        object.view = Some(view);
        object
    }

    /// Builds the clone bound to buffer `index`.
    pub fn make_clone(original: &DataRef, index: usize, memory: SharedMemory) -> DataRef {
        let header = RefHeader::new(original.header.ty(), original.header.scope());
        header.set_name(format!("{}_clone{index}", original.header.name()));
        Arc::new(Self {
            header,
            handle: original.handle,
            flags: original.flags,
            clone_index: Some(index),
            shape: RwLock::new(original.shape()),
            view: None,
            links: Mutex::new(Links::default()),
            resource: Mutex::new(ResourceState { backing: Backing::Solid(memory), clones: Vec::new() }),
        })
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    /// Arena handle of the logical object; clones report their original's.
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> String {
        self.header.name()
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.header.ty()
    }

    pub const fn is_virtual(&self) -> bool {
        self.flags.is_virtual
    }

    pub const fn is_queue(&self) -> bool {
        self.flags.queue
    }

    pub const fn clone_index(&self) -> Option<usize> {
        self.clone_index
    }

    pub const fn view(&self) -> Option<&View> {
        self.view.as_ref()
    }

    pub fn shape(&self) -> DataShape {
        if let Some(View { parent, kind: ViewKind::Level(level) }) = &self.view {
            if let DataShape::Pyramid(pyramid) = parent.shape() {
                return DataShape::Image(pyramid.level(*level));
            }
        }
        *self.shape.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_shape(&self, shape: DataShape) {
        *self.shape.write().unwrap_or_else(PoisonError::into_inner) = shape;
    }

    /// Checks (or for virtual objects, adopts) the shape a producer declared.
    ///
    /// # Errors
    ///
    /// Returns the shape's verification error, or `InvalidDimension` if a
    /// virtual object is still incomplete and the producer declared nothing.
    pub fn verify_meta(&self, meta: &Meta) -> Result<()> {
        let mut shape = self.shape.write().unwrap_or_else(PoisonError::into_inner);
        match meta.shape() {
            Some(produced) => shape.verify_meta(produced, self.is_virtual()),
            None if self.is_virtual() && !shape.is_complete() => {
                Err(VisionError::InvalidDimension(format!(
                    "cannot infer the shape of virtual {}",
                    self.header.name()
                )))
            },
            None => Ok(()),
        }
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resource(&self) -> MutexGuard<'_, ResourceState> {
        self.resource.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Connection bookkeeping

    /// Records `node`'s parameter `index` as reader or writer in `graph`.
    /// Inputs read; outputs and bidirectional parameters write.
    pub fn connect(&self, graph: Handle, node: Handle, index: u32, direction: Direction) {
        let mut links = self.links();
        let entry = links.graphs.entry(graph).or_default();
        let connection = Connection { node, index };
        match direction {
            Direction::Input => entry.readers.push(connection),
            Direction::Output | Direction::Bidirectional => entry.writers.push(connection),
        }
    }

    pub fn disconnect(&self, graph: Handle, node: Handle, index: u32) {
        let mut links = self.links();
        let connection = Connection { node, index };
        if let Some(entry) = links.graphs.get_mut(&graph) {
            entry.writers.retain(|c| *c != connection);
            entry.readers.retain(|c| *c != connection);
            if entry.writers.is_empty() && entry.readers.is_empty() {
                links.graphs.shift_remove(&graph);
            }
        }
    }

    pub fn writers(&self, graph: Handle) -> Vec<Connection> {
        self.links().graphs.get(&graph).map(|e| e.writers.clone()).unwrap_or_default()
    }

    pub fn readers(&self, graph: Handle) -> Vec<Connection> {
        self.links().graphs.get(&graph).map(|e| e.readers.clone()).unwrap_or_default()
    }

    pub fn direct_writer_count(&self, graph: Handle) -> usize {
        self.links().graphs.get(&graph).map_or(0, |e| e.writers.len())
    }

    pub fn direct_reader_count(&self, graph: Handle) -> usize {
        self.links().graphs.get(&graph).map_or(0, |e| e.readers.len())
    }

    /// Writers of this object and of every ally.
    pub fn indirect_writers(&self, graph: Handle) -> Vec<Connection> {
        let mut all = self.writers(graph);
        for ally in self.allies() {
            all.extend(ally.writers(graph));
        }
        all
    }

    /// Readers of this object and of every ally.
    pub fn indirect_readers(&self, graph: Handle) -> Vec<Connection> {
        let mut all = self.readers(graph);
        for ally in self.allies() {
            all.extend(ally.readers(graph));
        }
        all
    }

    pub fn indirect_writer_count(&self, graph: Handle) -> usize {
        self.indirect_writers(graph).len()
    }

    pub fn indirect_reader_count(&self, graph: Handle) -> usize {
        self.indirect_readers(graph).len()
    }

    /// Graphs this object is connected in.
    pub fn graphs(&self) -> Vec<Handle> {
        self.links().graphs.keys().copied().collect()
    }

    // Alliance

    /// Registers `a` and `b` as sharing storage.
    pub fn ally(a: &DataRef, b: &DataRef) {
        if Arc::ptr_eq(a, b) {
            return;
        }
        a.links().alliance.push(Arc::downgrade(b));
        b.links().alliance.push(Arc::downgrade(a));
    }

    pub fn allies(&self) -> Vec<DataRef> {
        let mut links = self.links();
        links.alliance.retain(|w| w.strong_count() > 0);
        links.alliance.iter().filter_map(Weak::upgrade).collect()
    }

    /// Leaves every alliance this object belongs to.
    pub fn leave_alliances(self: &Arc<Self>) {
        for ally in self.allies() {
            ally.links().alliance.retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(self)));
        }
        self.links().alliance.clear();
    }

    pub fn add_roi_child(&self, child: &DataRef) {
        self.links().roi_children.push(Arc::downgrade(child));
    }

    pub fn roi_children(&self) -> Vec<DataRef> {
        let mut links = self.links();
        links.roi_children.retain(|w| w.strong_count() > 0);
        links.roi_children.iter().filter_map(Weak::upgrade).collect()
    }

    // Delay membership

    pub fn delay_membership(&self) -> Option<DelayMembership> {
        self.links().delay
    }

    pub fn set_delay_membership(&self, membership: Option<DelayMembership>) {
        self.links().delay = membership;
    }

    // Storage aliasing

    /// Walks views up to the object that owns the storage and returns it with
    /// the pyramid level and region this object covers.
    pub fn storage_root(self: &Arc<Self>) -> (DataRef, Option<usize>, Option<Rectangle>) {
        let mut current = Arc::clone(self);
        let mut level = None;
        let mut rect: Option<Rectangle> = None;
        while let Some(view) = current.view.clone() {
            match view.kind {
                ViewKind::Roi(parent_rect) => {
                    rect = Some(rect.map_or(parent_rect, |r| r.offset_by(&parent_rect)));
                },
                ViewKind::Level(index) => level = Some(index),
            }
            current = view.parent;
        }
        (current, level, rect)
    }

    /// Whether writing `a` and writing `b` touch the same storage: the same
    /// object, a pyramid and one of its levels, or overlapping regions of the
    /// same image.
    pub fn check_write_dependency(a: &DataRef, b: &DataRef) -> bool {
        if a.handle == b.handle {
            return true;
        }
        let (root_a, level_a, rect_a) = a.storage_root();
        let (root_b, level_b, rect_b) = b.storage_root();
        if root_a.handle != root_b.handle {
            return false;
        }
        let same_level = match (level_a, level_b) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        };
        let overlap = match (rect_a, rect_b) {
            (Some(x), Some(y)) => x.intersects(&y),
            _ => true,
        };
        same_level && overlap
    }

    // Resources

    pub fn resource_kind(&self) -> ResourceKind {
        self.resource().backing.kind()
    }

    pub fn is_allocated(&self) -> bool {
        match &self.view {
            Some(view) => view.parent.is_allocated(),
            None => self.resource_kind() != ResourceKind::None,
        }
    }

    /// Allocates one buffer for the object. A no-op if already allocated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` for incomplete shapes or `NoResources` if the
    /// allocator fails.
    pub fn allocate_solid(&self, allocator: &dyn Allocator) -> Result<()> {
        if let Some(view) = &self.view {
            return view.parent.allocate_solid(allocator);
        }
        let mut state = self.resource();
        if !matches!(state.backing, Backing::None) {
            return Ok(());
        }
        let memory = self.shape().allocate(allocator)?;
        state.backing = Backing::Solid(memory.into_shared());
        tracing::debug!(object = %self.header.name(), "allocated solid resource");
        Ok(())
    }

    /// Allocates `count` buffers rotated through a slot ring.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if any buffer fails; buffers already obtained are freed.
    pub fn allocate_slots(self: &Arc<Self>, allocator: &dyn Allocator, count: usize) -> Result<()> {
        let mut state = self.resource();
        if !matches!(state.backing, Backing::None) {
            return Ok(());
        }
        let clones = self.allocate_clones(allocator, count)?;
        state.backing = Backing::Slot(Arc::new(SlotManager::new(self.header.name(), clones.clone())));
        state.clones = clones;
        tracing::debug!(object = %self.header.name(), count, "allocated slot ring");
        Ok(())
    }

    /// Prepares an input queue the application pushes buffers into.
    pub fn setup_input_queue(&self, capacity: usize) {
        let mut state = self.resource();
        if matches!(state.backing, Backing::None) {
            state.backing = Backing::InputQueue(Arc::new(InputQueueManager::new(self.header.name(), capacity)));
        }
    }

    /// Prepares an output queue and lends it `prefill` buffers of its own.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if a prefill buffer fails; buffers already obtained are freed.
    pub fn setup_output_queue(
        self: &Arc<Self>,
        allocator: &dyn Allocator,
        capacity: usize,
        prefill: usize,
    ) -> Result<()> {
        let mut state = self.resource();
        if !matches!(state.backing, Backing::None) {
            return Ok(());
        }
        let clones = self.allocate_clones(allocator, prefill.min(capacity))?;
        let manager = Arc::new(OutputQueueManager::new(self.header.name(), capacity));
        for (index, clone) in clones.iter().enumerate() {
            manager.push(index, Arc::clone(clone))?;
        }
        state.backing = Backing::OutputQueue(manager);
        state.clones = clones;
        Ok(())
    }

    fn allocate_clones(self: &Arc<Self>, allocator: &dyn Allocator, count: usize) -> Result<Vec<DataRef>> {
        let shape = self.shape();
        let mut clones: Vec<DataRef> = Vec::with_capacity(count);
        for index in 0..count {
            match shape.allocate(allocator) {
                Ok(memory) => clones.push(Self::make_clone(self, index, memory.into_shared())),
                Err(err) => {
                    tracing::error!(object = %self.header.name(), index, "clone allocation failed, rolling back");
                    for clone in clones {
                        clone.free_resources(allocator);
                    }
                    return Err(err);
                },
            }
        }
        Ok(clones)
    }

    /// Registers an application buffer as a new clone.
    pub fn add_clone(self: &Arc<Self>, memory: SharedMemory) -> DataRef {
        let mut state = self.resource();
        let clone = Self::make_clone(self, state.clones.len(), memory);
        state.clones.push(Arc::clone(&clone));
        clone
    }

    /// Forgets a clone without freeing its buffer.
    pub fn remove_clone(&self, clone: &DataRef) {
        self.resource().clones.retain(|c| !Arc::ptr_eq(c, clone));
    }

    pub fn clones(&self) -> Vec<DataRef> {
        self.resource().clones.clone()
    }

    pub fn slot_manager(&self) -> Option<Arc<SlotManager<DataRef>>> {
        match &self.resource().backing {
            Backing::Slot(manager) => Some(Arc::clone(manager)),
            _ => None,
        }
    }

    pub fn input_queue(&self) -> Option<Arc<InputQueueManager<DataRef>>> {
        match &self.resource().backing {
            Backing::InputQueue(manager) => Some(Arc::clone(manager)),
            _ => None,
        }
    }

    pub fn output_queue(&self) -> Option<Arc<OutputQueueManager<DataRef>>> {
        match &self.resource().backing {
            Backing::OutputQueue(manager) => Some(Arc::clone(manager)),
            _ => None,
        }
    }

    /// The buffer backing this object (for views, the storage owner's).
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if the object has no single buffer.
    pub fn memory(&self) -> Result<SharedMemory> {
        if let Some(view) = &self.view {
            return view.parent.memory();
        }
        match &self.resource().backing {
            Backing::Solid(memory) => Ok(Arc::clone(memory)),
            other => Err(VisionError::NoResources(format!(
                "{} has no solid buffer (resource kind {:?})",
                self.header.name(),
                other.kind()
            ))),
        }
    }

    /// Runs `f` on the planes of this object. Level views see only their
    /// level's planes; ROI views see the full parent planes (see
    /// [`storage_root`](Self::storage_root) for the region).
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if the object is not backed by a buffer.
    pub fn with_planes<T>(&self, f: impl FnOnce(&mut [Plane]) -> T) -> Result<T> {
        let memory = self.memory()?;
        let mut guard = memory.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.view {
            Some(View { parent, kind: ViewKind::Level(level) }) => {
                let pyramid = parent.shape();
                let pyramid = pyramid
                    .as_pyramid()
                    .ok_or_else(|| VisionError::InvalidReference("level parent is not a pyramid".into()))?;
                let per_level = pyramid.format.planes().len();
                let first = pyramid.first_plane_of(*level);
                let planes = guard.planes.get_mut(first..first + per_level).ok_or_else(|| {
                    VisionError::NoResources(format!("pyramid level {level} is not allocated"))
                })?;
                Ok(f(planes))
            },
            _ => Ok(f(&mut guard.planes)),
        }
    }

    /// Replaces the solid buffer, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` for views and objects without a solid buffer.
    pub fn swap_memory(&self, memory: Memory) -> Result<Memory> {
        if self.view.is_some() {
            return Err(VisionError::NotSupported("cannot swap the buffer of a view".into()));
        }
        let mut state = self.resource();
        match &state.backing {
            Backing::Solid(current) => {
                let mut guard = current.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(std::mem::replace(&mut *guard, memory))
            },
            Backing::None => {
                state.backing = Backing::Solid(memory.into_shared());
                Ok(Memory::default())
            },
            other => Err(VisionError::NotSupported(format!(
                "cannot swap a {:?} resource",
                other.kind()
            ))),
        }
    }

    /// Adopts an existing buffer as the solid backing.
    pub fn attach_memory(&self, memory: Memory) {
        self.resource().backing = Backing::Solid(memory.into_shared());
    }

    /// Releases every buffer exactly once and drops the manager.
    pub fn free_resources(&self, allocator: &dyn Allocator) {
        let mut state = self.resource();
        let backing = std::mem::replace(&mut state.backing, Backing::None);
        let clones = std::mem::take(&mut state.clones);
        drop(state);

        if let Backing::Solid(memory) = backing {
            free_shared(&self.shape(), memory, allocator);
        }
        for clone in clones {
            clone.free_resources(allocator);
        }
    }
}

fn free_shared(shape: &DataShape, memory: SharedMemory, allocator: &dyn Allocator) {
    match Arc::try_unwrap(memory) {
        Ok(mutex) => shape.free(mutex.into_inner().unwrap_or_else(PoisonError::into_inner), allocator),
        Err(shared) => {
            // Still borrowed by a running kernel or the application; hand the
            // planes back now and leave an empty buffer behind.
            let taken = std::mem::take(&mut *shared.lock().unwrap_or_else(PoisonError::into_inner));
            shape.free(taken, allocator);
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handle::Arena;
    use crate::memory::HeapAllocator;
    use crate::shape::{ImageShape, PyramidShape};
    use crate::types::DfImage;

    fn image(arena: &mut Arena<()>, w: u32, h: u32) -> DataRef {
        let handle = arena.insert(());
        Arc::new(DataObject::new(
            handle,
            None,
            DataShape::Image(ImageShape::new(w, h, DfImage::U8)),
            DataFlags::default(),
        ))
    }

    fn roi(arena: &mut Arena<()>, parent: &DataRef, rect: Rectangle) -> DataRef {
        let handle = arena.insert(());
        let shape = DataShape::Image(ImageShape::new(rect.width(), rect.height(), DfImage::U8));
        let child = Arc::new(DataObject::new_view(
            handle,
            None,
            shape,
            View { parent: Arc::clone(parent), kind: ViewKind::Roi(rect) },
        ));
        DataObject::ally(parent, &child);
        child
    }

    #[test]
    fn test_connections_per_graph() {
        let mut arena = Arena::new();
        let graph = arena.insert(());
        let other = arena.insert(());
        let (n1, n2) = (arena.insert(()), arena.insert(()));
        let object = image(&mut arena, 8, 8);

        object.connect(graph, n1, 1, Direction::Output);
        object.connect(graph, n2, 0, Direction::Input);
        object.connect(other, n2, 0, Direction::Bidirectional);
        assert_eq!(object.direct_writer_count(graph), 1);
        assert_eq!(object.direct_reader_count(graph), 1);
        assert_eq!(object.direct_writer_count(other), 1);

        object.disconnect(graph, n1, 1);
        assert_eq!(object.direct_writer_count(graph), 0);
        assert_eq!(object.graphs().len(), 2);
        object.disconnect(graph, n2, 0);
        assert_eq!(object.graphs(), vec![other]);
    }

    #[test]
    fn test_indirect_counts_include_allies() {
        let mut arena = Arena::new();
        let graph = arena.insert(());
        let node = arena.insert(());
        let parent = image(&mut arena, 64, 64);
        let child = roi(&mut arena, &parent, Rectangle::new(0, 0, 32, 32));
        child.connect(graph, node, 1, Direction::Output);
        assert_eq!(parent.direct_writer_count(graph), 0);
        assert_eq!(parent.indirect_writer_count(graph), 1);
    }

    #[test]
    fn test_write_dependency_between_rois() {
        let mut arena = Arena::new();
        let parent = image(&mut arena, 64, 64);
        let a = roi(&mut arena, &parent, Rectangle::new(0, 0, 32, 32));
        let b = roi(&mut arena, &parent, Rectangle::new(16, 16, 48, 48));
        let c = roi(&mut arena, &parent, Rectangle::new(32, 32, 64, 64));
        let unrelated = image(&mut arena, 64, 64);

        assert!(DataObject::check_write_dependency(&a, &b));
        assert!(!DataObject::check_write_dependency(&a, &c));
        assert!(DataObject::check_write_dependency(&a, &parent));
        assert!(!DataObject::check_write_dependency(&a, &unrelated));
    }

    #[test]
    fn test_nested_roi_is_offset_into_root() {
        let mut arena = Arena::new();
        let parent = image(&mut arena, 64, 64);
        let outer = roi(&mut arena, &parent, Rectangle::new(32, 32, 64, 64));
        let inner = roi(&mut arena, &outer, Rectangle::new(0, 0, 8, 8));
        let (root, level, rect) = inner.storage_root();
        assert_eq!(root.handle(), parent.handle());
        assert_eq!(level, None);
        assert_eq!(rect, Some(Rectangle::new(32, 32, 40, 40)));
    }

    #[test]
    fn test_pyramid_levels_alias_their_pyramid_only() {
        let mut arena = Arena::new();
        let pyramid = Arc::new(DataObject::new(
            arena.insert(()),
            None,
            DataShape::Pyramid(PyramidShape { levels: 2, scale: 0.5, width: 16, height: 16, format: DfImage::U8 }),
            DataFlags::default(),
        ));
        let level = |arena: &mut Arena<()>, index| {
            Arc::new(DataObject::new_view(
                arena.insert(()),
                Some(pyramid.handle()),
                pyramid.shape(),
                View { parent: Arc::clone(&pyramid), kind: ViewKind::Level(index) },
            ))
        };
        let l0 = level(&mut arena, 0);
        let l1 = level(&mut arena, 1);
        assert!(DataObject::check_write_dependency(&l0, &pyramid));
        assert!(!DataObject::check_write_dependency(&l0, &l1));
        assert_eq!(l1.shape(), DataShape::Image(ImageShape::new(8, 8, DfImage::U8)));

        let allocator = HeapAllocator::default();
        l1.allocate_solid(&allocator).unwrap();
        assert!(pyramid.is_allocated());
        let len = l1.with_planes(|planes| planes[0].len()).unwrap();
        assert_eq!(len, 64);
    }

    #[test]
    fn test_solid_allocation_is_idempotent_and_freed_once() {
        let mut arena = Arena::new();
        let object = image(&mut arena, 8, 8);
        let allocator = HeapAllocator::default();
        object.allocate_solid(&allocator).unwrap();
        object.allocate_solid(&allocator).unwrap();
        assert_eq!(allocator.stats().allocated, 1);
        assert_eq!(object.resource_kind(), ResourceKind::Solid);

        object.free_resources(&allocator);
        object.free_resources(&allocator);
        assert_eq!(allocator.stats().freed, 1);
        assert_eq!(object.resource_kind(), ResourceKind::None);
    }

    #[test]
    fn test_slot_allocation_creates_one_clone_per_buffer() {
        let mut arena = Arena::new();
        let object = image(&mut arena, 8, 8);
        let allocator = HeapAllocator::default();
        object.allocate_slots(&allocator, 3).unwrap();
        let clones = object.clones();
        assert_eq!(clones.len(), 3);
        assert!(clones.iter().all(|c| c.handle() == object.handle()));
        assert_eq!(object.slot_manager().unwrap().len(), 3);

        object.free_resources(&allocator);
        assert_eq!(allocator.stats().live(), 0);
    }

    #[test]
    fn test_slot_allocation_failure_rolls_back() {
        let mut arena = Arena::new();
        let object = image(&mut arena, 8, 8);
        let allocator = HeapAllocator::default().with_limit(2);
        let err = object.allocate_slots(&allocator, 3).unwrap_err();
        assert!(matches!(err, VisionError::NoResources(_)));
        assert_eq!(allocator.stats().live(), 0);
        assert_eq!(object.resource_kind(), ResourceKind::None);
    }

    #[test]
    fn test_virtual_object_without_claim_cannot_be_inferred() {
        let mut arena = Arena::new();
        let object = Arc::new(DataObject::new(
            arena.insert(()),
            None,
            DataShape::Image(ImageShape::new(0, 0, DfImage::Virt)),
            DataFlags { is_virtual: true, queue: false },
        ));
        let meta = Meta::new(ReferenceType::Image);
        assert!(matches!(object.verify_meta(&meta), Err(VisionError::InvalidDimension(_))));
    }

    #[test]
    fn test_leave_alliances() {
        let mut arena = Arena::new();
        let parent = image(&mut arena, 16, 16);
        let child = roi(&mut arena, &parent, Rectangle::new(0, 0, 4, 4));
        assert_eq!(parent.allies().len(), 1);
        child.leave_alliances();
        assert!(parent.allies().is_empty());
    }
}
