// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Data object factories, delays and application access to buffers.
//!
//! Every factory returns a handle carrying one external count. Virtual and
//! queue objects are additionally held by the graph they are scoped to, so
//! they live at least as long as that graph unless it is destroyed first.

use crate::context::Context;
use crate::object::Object;
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use visionflow_core::data::DelayMembership;
use visionflow_core::memory::Plane;
use visionflow_core::shape::{
    ArrayShape, ConvolutionShape, DistributionShape, LutShape, MatrixShape, PyramidShape, RemapShape,
    ScalarShape, ThresholdShape,
};
use visionflow_core::types::ThresholdKind;
use visionflow_core::{
    DataFlags, DataObject, DataRef, DataShape, Delay, DelaySlots, DfImage, Handle, Holder, ImageShape, Import,
    ItemType, Memory, RefKind, Rectangle, ReferenceType, ResourceKind, Result, ScalarType, View,
    ViewKind, VisionError,
};

/// Snapshot returned by [`Context::query_data`].
#[derive(Debug, Clone, Serialize)]
pub struct DataInfo {
    pub name: String,
    pub ty: ReferenceType,
    pub shape: DataShape,
    pub is_virtual: bool,
    pub resource: ResourceKind,
    pub allocated: bool,
}

impl Context {
    /// Registers a data object. Pyramids get their level views as well.
    fn new_data(&self, scope: Option<Handle>, shape: DataShape, flags: DataFlags) -> Result<(Handle, DataRef)> {
        let (handle, data) = self.register(
            RefKind::External,
            |h| Arc::new(DataObject::new(h, scope, shape, flags)),
            Object::Data,
        )?;
        if let DataShape::Pyramid(pyramid) = shape {
            if let Err(err) = self.create_levels(&data, &pyramid) {
                self.release_reference(handle)?;
                return Err(err);
            }
        }
        Ok((handle, data))
    }

    fn create_levels(&self, pyramid: &DataRef, shape: &PyramidShape) -> Result<()> {
        let owner = pyramid.handle();
        for level in 0..shape.levels {
            let view = View { parent: Arc::clone(pyramid), kind: ViewKind::Level(level) };
            let (handle, data) = self.register_held(
                RefKind::Internal,
                Holder::Object(owner),
                |h| Arc::new(DataObject::new_view(h, Some(owner), DataShape::Image(shape.level(level)), view)),
                Object::Data,
            )?;
            DataObject::ally(pyramid, &data);
            self.inner.levels.lock().unwrap_or_else(PoisonError::into_inner).entry(owner).or_default().push(handle);
        }
        Ok(())
    }

    /// Registers an object scoped to `graph`, which holds a count on it.
    fn new_scoped(&self, graph: Handle, shape: DataShape, flags: DataFlags) -> Result<Handle> {
        let owner = self.graph_idle(graph)?;
        let (handle, data) = self.new_data(Some(graph), shape, flags)?;
        self.retain_internal(handle, graph)?;
        owner.add_scoped(handle);
        tracing::debug!(object = %data.name(), graph = %owner.name(), "scoped object created");
        Ok(handle)
    }

    fn new_concrete(&self, shape: DataShape) -> Result<Handle> {
        if !shape.is_complete() {
            return Err(VisionError::InvalidParameters(format!("incomplete {} shape {shape:?}", shape.reference_type())));
        }
        Ok(self.new_data(None, shape, DataFlags::default())?.0)
    }

    /// Creates any data object from its shape.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for incomplete shapes.
    pub fn create_data_object(&self, shape: DataShape) -> Result<Handle> {
        self.new_concrete(shape)
    }

    // Images

    /// # Errors
    ///
    /// Returns `InvalidParameters` for a zero size or the virtual format.
    pub fn create_image(&self, width: u32, height: u32, format: DfImage) -> Result<Handle> {
        self.new_concrete(DataShape::Image(ImageShape::new(width, height, format)))
    }

    /// Creates an image whose unknown size (`0`) and format ([`DfImage::Virt`])
    /// are inferred when `graph` is verified.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running.
    pub fn create_virtual_image(&self, graph: Handle, width: u32, height: u32, format: DfImage) -> Result<Handle> {
        self.new_scoped(
            graph,
            DataShape::Image(ImageShape::new(width, height, format)),
            DataFlags { is_virtual: true, queue: false },
        )
    }

    /// Creates an image fed or drained by the application through a queue
    /// while `graph` streams.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for an incomplete shape.
    pub fn create_image_from_queue(&self, graph: Handle, width: u32, height: u32, format: DfImage) -> Result<Handle> {
        let shape = DataShape::Image(ImageShape::new(width, height, format));
        if !shape.is_complete() {
            return Err(VisionError::InvalidParameters("queue images need a concrete shape".into()));
        }
        self.new_scoped(graph, shape, DataFlags { is_virtual: false, queue: true })
    }

    /// Creates a view of `rect` inside `image`. The view shares storage with
    /// its parent and with every sibling region it overlaps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidType` unless `image` is an image and
    /// `InvalidParameters` for an empty or out-of-bounds rectangle.
    pub fn create_image_from_roi(&self, image: Handle, rect: Rectangle) -> Result<Handle> {
        let parent = self.data(image)?;
        let Some(&parent_shape) = parent.shape().as_image() else {
            return Err(VisionError::InvalidType(format!("{} is not an image", parent.name())));
        };
        let fits = parent_shape.width == 0 || (rect.end_x <= parent_shape.width && rect.end_y <= parent_shape.height);
        if rect.is_empty() || !fits {
            return Err(VisionError::InvalidParameters(format!(
                "{rect:?} does not fit {}x{}",
                parent_shape.width, parent_shape.height
            )));
        }
        let shape = DataShape::Image(ImageShape::new(rect.width(), rect.height(), parent_shape.format));
        let view = View { parent: Arc::clone(&parent), kind: ViewKind::Roi(rect) };
        let scope = parent.header().scope();
        let (handle, roi) = self.register(
            RefKind::External,
            |h| Arc::new(DataObject::new_view(h, scope, shape, view)),
            Object::Data,
        )?;
        self.retain_internal(image, handle)?;
        for sibling in parent.roi_children() {
            if let Some(View { kind: ViewKind::Roi(other), .. }) = sibling.view() {
                if other.intersects(&rect) {
                    DataObject::ally(&roi, &sibling);
                }
            }
        }
        DataObject::ally(&parent, &roi);
        parent.add_roi_child(&roi);
        Ok(handle)
    }

    /// Creates an image over application memory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` when the plane count does not match the
    /// format or a plane is too small.
    pub fn create_image_from_handle(
        &self,
        width: u32,
        height: u32,
        format: DfImage,
        planes: Vec<Import>,
    ) -> Result<Handle> {
        let shape = DataShape::Image(ImageShape::new(width, height, format));
        let memory = self.import_for(&shape, planes)?;
        let handle = self.new_concrete(shape)?;
        self.data(handle)?.attach_memory(memory);
        Ok(handle)
    }

    /// Creates an image with every pixel of every plane set to `value`
    /// (little endian, truncated to the pixel size).
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for an incomplete shape and `NoResources`
    /// if the allocator fails.
    pub fn create_uniform_image(&self, width: u32, height: u32, format: DfImage, value: u32) -> Result<Handle> {
        let handle = self.create_image(width, height, format)?;
        let data = self.data(handle)?;
        data.allocate_solid(self.allocator())?;
        let layouts = format.planes();
        data.with_planes(|planes| {
            for (plane, layout) in planes.iter_mut().zip(&layouts) {
                let bytes = value.to_le_bytes();
                let pixel = &bytes[..layout.bytes_per_pixel.min(4)];
                for chunk in plane.data.chunks_mut(layout.bytes_per_pixel) {
                    let n = chunk.len().min(pixel.len());
                    chunk[..n].copy_from_slice(&pixel[..n]);
                }
            }
        })?;
        Ok(handle)
    }

    // Arrays and scalars

    fn check_item_type(&self, item_type: ItemType) -> Result<()> {
        if let ItemType::UserStruct { id, size } = item_type {
            if self.user_struct_size(id) != Some(size) {
                return Err(VisionError::InvalidType(format!("user struct {id} of {size} bytes is not registered")));
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for a zero capacity and `InvalidType` for
    /// an unregistered user struct.
    pub fn create_array(&self, item_type: ItemType, capacity: usize) -> Result<Handle> {
        self.check_item_type(item_type)?;
        self.new_concrete(DataShape::Array(ArrayShape { item_type, capacity }))
    }

    /// An array whose capacity (`0` for unknown) is inferred at verification.
    ///
    /// # Errors
    ///
    /// Returns `InvalidType` for an unregistered user struct.
    pub fn create_virtual_array(&self, graph: Handle, item_type: ItemType, capacity: usize) -> Result<Handle> {
        self.check_item_type(item_type)?;
        self.new_scoped(
            graph,
            DataShape::Array(ArrayShape { item_type, capacity }),
            DataFlags { is_virtual: true, queue: false },
        )
    }

    /// Creates a scalar holding `value`, which must be exactly the size of
    /// `data_type`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` when the value size does not match.
    pub fn create_scalar(&self, data_type: ScalarType, value: &[u8]) -> Result<Handle> {
        if value.len() != data_type.size() {
            return Err(VisionError::InvalidParameters(format!(
                "{data_type:?} takes {} bytes, got {}",
                data_type.size(),
                value.len()
            )));
        }
        let handle = self.new_concrete(DataShape::Scalar(ScalarShape { data_type }))?;
        let data = self.data(handle)?;
        data.allocate_solid(self.allocator())?;
        data.with_planes(|planes| planes[0].data.copy_from_slice(value))?;
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running.
    pub fn create_virtual_scalar(&self, graph: Handle, data_type: ScalarType) -> Result<Handle> {
        self.new_scoped(
            graph,
            DataShape::Scalar(ScalarShape { data_type }),
            DataFlags { is_virtual: true, queue: false },
        )
    }

    // Pyramids

    fn pyramid_shape(levels: usize, scale: f32, width: u32, height: u32, format: DfImage) -> Result<DataShape> {
        if levels == 0 || !(scale > 0.0 && scale <= 1.0) {
            return Err(VisionError::InvalidParameters(format!("{levels} levels at scale {scale}")));
        }
        Ok(DataShape::Pyramid(PyramidShape { levels, scale, width, height, format }))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for zero levels, a scale outside `(0, 1]`
    /// or an incomplete base image.
    pub fn create_pyramid(&self, levels: usize, scale: f32, width: u32, height: u32, format: DfImage) -> Result<Handle> {
        self.new_concrete(Self::pyramid_shape(levels, scale, width, height, format)?)
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for zero levels or a scale outside `(0, 1]`.
    pub fn create_virtual_pyramid(
        &self,
        graph: Handle,
        levels: usize,
        scale: f32,
        width: u32,
        height: u32,
        format: DfImage,
    ) -> Result<Handle> {
        let shape = Self::pyramid_shape(levels, scale, width, height, format)?;
        self.new_scoped(graph, shape, DataFlags { is_virtual: true, queue: false })
    }

    /// Level `index` of `pyramid`. The caller receives one external count.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` past the last level.
    pub fn get_pyramid_level(&self, pyramid: Handle, index: usize) -> Result<Handle> {
        self.data(pyramid)?;
        let level = self
            .inner
            .levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pyramid)
            .and_then(|levels| levels.get(index).copied())
            .ok_or_else(|| VisionError::InvalidParameters(format!("pyramid {pyramid} has no level {index}")))?;
        self.retain_reference(level)?;
        Ok(level)
    }

    // Other object types

    /// # Errors
    ///
    /// Returns `InvalidParameters` for an empty matrix.
    pub fn create_matrix(&self, data_type: ScalarType, rows: usize, columns: usize) -> Result<Handle> {
        self.new_concrete(DataShape::Matrix(MatrixShape { data_type, rows, columns }))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for an empty table.
    pub fn create_lut(&self, data_type: ScalarType, count: usize) -> Result<Handle> {
        self.new_concrete(DataShape::Lut(LutShape { data_type, count }))
    }

    /// # Errors
    ///
    /// Returns `Runtime` if the object table rejects the object.
    pub fn create_threshold(&self, kind: ThresholdKind, data_type: ScalarType) -> Result<Handle> {
        self.new_concrete(DataShape::Threshold(ThresholdShape { kind, data_type }))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for an empty destination.
    pub fn create_remap(&self, src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Result<Handle> {
        self.new_concrete(DataShape::Remap(RemapShape { src_width, src_height, dst_width, dst_height }))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for zero bins.
    pub fn create_distribution(&self, bins: usize, offset: i32, range: u32) -> Result<Handle> {
        self.new_concrete(DataShape::Distribution(DistributionShape { bins, offset, range }))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for an empty kernel.
    pub fn create_convolution(&self, rows: usize, columns: usize) -> Result<Handle> {
        self.new_concrete(DataShape::Convolution(ConvolutionShape { rows, columns, scale: 1 }))
    }

    // Delays

    /// Creates a ring of `count` objects shaped like `exemplar`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for a zero count or an exemplar whose shape
    /// is not known yet.
    pub fn create_delay(&self, exemplar: Handle, count: usize) -> Result<Handle> {
        let exemplar = self.data(exemplar)?;
        let shape = exemplar.shape();
        if count == 0 || !shape.is_complete() {
            return Err(VisionError::InvalidParameters(format!(
                "cannot build a delay of {count} from {}",
                exemplar.name()
            )));
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match self.new_data(None, shape, DataFlags::default()) {
                Ok((_, slot)) => slots.push(slot),
                Err(err) => {
                    for slot in &slots {
                        self.release_reference(slot.handle())?;
                    }
                    return Err(err);
                },
            }
        }
        let members = DelaySlots::new(slots.clone())?;
        let (handle, delay) =
            self.register(RefKind::External, |h| Arc::new(Delay::new(h, None, members)), Object::Delay)?;
        // The delay takes over the creator's count on each slot.
        for (index, slot) in slots.iter().enumerate() {
            self.retain_internal(slot.handle(), handle)?;
            slot.set_delay_membership(Some(DelayMembership { delay: handle, slot: index }));
            self.release_reference(slot.handle())?;
        }
        tracing::debug!(delay = %delay.header().name(), count, "delay created");
        Ok(handle)
    }

    /// The object at logical `index` of `delay`. No count is added.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` unless `|index| < count`.
    pub fn get_reference_from_delay(&self, delay: Handle, index: i32) -> Result<Handle> {
        let delay = self.delay(delay)?;
        delay.get_reference(index).map(|data| data.handle()).ok_or_else(|| {
            VisionError::InvalidParameters(format!("index {index} is outside a delay of {}", delay.count()))
        })
    }

    /// Rotates `delay` by one and rebinds every node parameter bound to one
    /// of its slots so it keeps seeing the same logical index.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` unless `delay` is a delay.
    pub fn age_delay(&self, delay: Handle) -> Result<()> {
        let delay = self.delay(delay)?;
        let result = self.age(&delay);
        self.track(delay.header().id(), result)
    }

    pub(crate) fn age(&self, delay: &Delay) -> Result<()> {
        for rebind in delay.age() {
            let node = self.node(rebind.connection.node)?;
            let target = delay
                .slots()
                .get(rebind.to)
                .cloned()
                .ok_or_else(|| VisionError::Runtime(format!("delay slot {} is missing", rebind.to)))?;
            self.bind(&node, rebind.connection.index, Some(target))?;
        }
        Ok(())
    }

    pub(crate) fn destroy_delay(&self, delay: &Delay) {
        for slot in delay.slots() {
            slot.set_delay_membership(None);
            self.release_logged(slot.handle(), delay.handle());
        }
    }

    pub(crate) fn destroy_data(&self, data: &DataRef) {
        data.leave_alliances();
        data.free_resources(self.allocator());
        if let Some(View { parent, kind: ViewKind::Roi(_) }) = data.view() {
            self.release_logged(parent.handle(), data.handle());
        }
        let levels = self.inner.levels.lock().unwrap_or_else(PoisonError::into_inner).shift_remove(&data.handle());
        for level in levels.unwrap_or_default() {
            self.release_logged(level, data.handle());
        }
    }

    // Application access

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `object` is a data object.
    pub fn query_data(&self, object: Handle) -> Result<DataInfo> {
        let data = self.data(object)?;
        Ok(DataInfo {
            name: data.name(),
            ty: data.reference_type(),
            shape: data.shape(),
            is_virtual: data.is_virtual(),
            resource: data.resource_kind(),
            allocated: data.is_allocated(),
        })
    }

    /// Runs `f` on the planes of `object`, allocating them on first access.
    ///
    /// # Errors
    ///
    /// Returns `OptimizedAway` for virtual objects and `NoResources` if the
    /// object is backed by a slot ring or queue.
    pub fn map_data<T>(&self, object: Handle, f: impl FnOnce(&mut [Plane]) -> T) -> Result<T> {
        let data = self.accessible(object)?;
        if !data.is_allocated() {
            data.allocate_solid(self.allocator())?;
        }
        data.with_planes(f)
    }

    fn accessible(&self, object: Handle) -> Result<DataRef> {
        let data = self.data(object)?;
        if data.is_virtual() {
            return Err(VisionError::OptimizedAway(format!("{} is virtual", data.name())));
        }
        Ok(data)
    }

    fn accessible_image(&self, object: Handle) -> Result<DataRef> {
        let data = self.accessible(object)?;
        if data.reference_type() != ReferenceType::Image {
            return Err(VisionError::InvalidType(format!("{} is not an image", data.name())));
        }
        Ok(data)
    }

    /// Builds memory for `shape` from imported planes.
    fn import_for(&self, shape: &DataShape, planes: Vec<Import>) -> Result<Memory> {
        let sizes = shape.plane_sizes();
        if planes.len() != sizes.len() {
            return Err(VisionError::InvalidParameters(format!(
                "expected {} planes, got {}",
                sizes.len(),
                planes.len()
            )));
        }
        let memory = Memory::import(self.allocator(), planes)?;
        if let Some((index, _)) = memory.planes.iter().zip(&sizes).enumerate().find(|(_, (p, s))| p.len() < **s) {
            return Err(VisionError::InvalidParameters(format!("plane {index} is too small")));
        }
        Ok(memory)
    }

    /// Export descriptors of the planes of `image`.
    ///
    /// # Errors
    ///
    /// Returns `OptimizedAway` for virtual images.
    pub fn access_image_handle(&self, image: Handle) -> Result<Vec<Option<i32>>> {
        let data = self.accessible_image(image)?;
        if !data.is_allocated() {
            data.allocate_solid(self.allocator())?;
        }
        let memory = data.memory()?;
        let fds = memory.lock().unwrap_or_else(PoisonError::into_inner).fds();
        Ok(fds)
    }

    /// Replaces the planes of `image` with imported ones. The previous planes
    /// are returned to the allocator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` when the planes do not fit the image.
    pub fn commit_image_handle(&self, image: Handle, planes: Vec<Import>) -> Result<()> {
        let data = self.accessible_image(image)?;
        let shape = data.shape();
        let memory = self.import_for(&shape, planes)?;
        let previous = data.swap_memory(memory)?;
        shape.free(previous, self.allocator());
        Ok(())
    }

    /// Swaps the buffer of `image` for `memory` and returns the previous one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` when the plane count does not match.
    pub fn swap_image_handle(&self, image: Handle, memory: Memory) -> Result<Memory> {
        let data = self.accessible_image(image)?;
        let expected = data.shape().plane_sizes().len();
        if memory.planes.len() != expected {
            return Err(VisionError::InvalidParameters(format!(
                "expected {expected} planes, got {}",
                memory.planes.len()
            )));
        }
        data.swap_memory(memory)
    }

    /// Allocates a buffer shaped like `object` for the application to fill,
    /// e.g. before pushing it into an input queue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` for incomplete shapes.
    pub fn allocate_memory(&self, object: Handle) -> Result<Memory> {
        self.data(object)?.shape().allocate(self.allocator())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn image_size(context: &Context, handle: Handle) -> Option<(u32, u32)> {
        context.query_data(handle).unwrap().shape.as_image().map(|s| (s.width, s.height))
    }

    #[test]
    fn test_scalar_value_must_match_type() {
        let context = Context::new();
        let err = context.create_scalar(ScalarType::Int32, &[1, 2]).unwrap_err();
        assert!(matches!(err, VisionError::InvalidParameters(_)));

        let scalar = context.create_scalar(ScalarType::Int32, &7i32.to_le_bytes()).unwrap();
        let value = context.map_data(scalar, |planes| planes[0].data.to_vec()).unwrap();
        assert_eq!(value, 7i32.to_le_bytes());
        assert_eq!(context.reference_type(scalar).unwrap(), ReferenceType::Scalar);
    }

    #[test]
    fn test_pyramid_levels_halve_and_round_up() {
        let context = Context::new();
        let pyramid = context.create_pyramid(3, 0.5, 63, 40, DfImage::U8).unwrap();
        let sizes: Vec<_> =
            (0..3).map(|i| image_size(&context, context.get_pyramid_level(pyramid, i).unwrap())).collect();
        assert_eq!(sizes, vec![Some((63, 40)), Some((32, 20)), Some((16, 10))]);
        assert!(matches!(context.get_pyramid_level(pyramid, 3), Err(VisionError::InvalidParameters(_))));
        assert!(context.create_pyramid(2, 1.5, 8, 8, DfImage::U8).is_err());
        assert!(context.create_pyramid(0, 0.5, 8, 8, DfImage::U8).is_err());
    }

    #[test]
    fn test_roi_keeps_parent_alive() {
        let context = Context::new();
        let image = context.create_image(16, 16, DfImage::U8).unwrap();
        let roi = context.create_image_from_roi(image, Rectangle::new(4, 4, 12, 8)).unwrap();
        assert_eq!(image_size(&context, roi), Some((8, 4)));

        let outside = context.create_image_from_roi(image, Rectangle::new(8, 8, 20, 12));
        assert!(matches!(outside, Err(VisionError::InvalidParameters(_))));
        let empty = context.create_image_from_roi(image, Rectangle::new(3, 3, 3, 9));
        assert!(matches!(empty, Err(VisionError::InvalidParameters(_))));

        context.release_reference(image).unwrap();
        assert!(context.query_data(image).is_ok());
        context.release_reference(roi).unwrap();
        assert!(context.query_data(image).is_err());
    }

    #[test]
    fn test_swap_image_handle_returns_previous_buffer() {
        let context = Context::new();
        let image = context.create_image(4, 4, DfImage::U8).unwrap();
        context.map_data(image, |planes| planes[0].data.fill(7)).unwrap();
        let mut replacement = context.allocate_memory(image).unwrap();
        replacement.planes[0].data.fill(9);

        let previous = context.swap_image_handle(image, replacement).unwrap();
        assert!(previous.planes[0].data.iter().all(|b| *b == 7));
        assert_eq!(context.map_data(image, |planes| planes[0].data[0]).unwrap(), 9);
        assert!(context.swap_image_handle(image, Memory::default()).is_err());
    }

    #[test]
    fn test_virtual_objects_are_not_mappable() {
        let context = Context::new();
        let graph = context.create_graph().unwrap();
        let virt = context.create_virtual_image(graph, 8, 8, DfImage::U8).unwrap();
        assert!(matches!(context.map_data(virt, |_| ()), Err(VisionError::OptimizedAway(_))));
        assert!(context.query_data(virt).unwrap().is_virtual);
    }
}
