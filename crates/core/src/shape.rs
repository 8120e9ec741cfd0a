// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffer shapes of the typed data objects.
//!
//! A [`DataShape`] describes what a data object stores without owning any
//! memory. Each variant implements [`ResourceAlloc`], which knows how large the
//! planes of that variant are, how to allocate and free them, and how to check
//! (or, for virtual objects, adopt) the shape a producing kernel declares
//! through its output validator.

use crate::error::{Result, VisionError};
use crate::memory::{Allocator, Memory};
use crate::reference::ReferenceType;
use crate::types::{DfImage, ItemType, ScalarType, ThresholdKind};
use serde::{Deserialize, Serialize};

/// Allocation and verification behavior of one data object variant.
pub trait ResourceAlloc {
    /// Byte size of every plane backing this shape.
    fn plane_sizes(&self) -> Vec<usize>;

    /// Whether every field needed for allocation is known.
    fn is_complete(&self) -> bool;

    /// Checks the shape declared by a producing kernel against `self`.
    ///
    /// Virtual objects adopt the unknown parts of `produced`; concrete objects
    /// must match exactly.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat`, `InvalidDimension`, `InvalidType` or
    /// `InvalidValue` depending on which field disagrees.
    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()>;

    /// # Errors
    ///
    /// Returns `InvalidDimension` for incomplete shapes and `NoResources` if
    /// the allocator fails. Partially obtained planes are released first.
    fn allocate(&self, allocator: &dyn Allocator) -> Result<Memory> {
        if !self.is_complete() {
            return Err(VisionError::InvalidDimension("cannot allocate an incomplete shape".into()));
        }
        Memory::allocate(allocator, &self.plane_sizes())
    }

    fn free(&self, memory: Memory, allocator: &dyn Allocator) {
        memory.free(allocator);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub width: u32,
    pub height: u32,
    pub format: DfImage,
}

impl ImageShape {
    pub const fn new(width: u32, height: u32, format: DfImage) -> Self {
        Self { width, height, format }
    }
}

impl ResourceAlloc for ImageShape {
    fn plane_sizes(&self) -> Vec<usize> {
        self.format
            .planes()
            .iter()
            .map(|p| {
                (self.width / p.x_div) as usize
                    * (self.height / p.y_div) as usize
                    * p.bytes_per_pixel
            })
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.width > 0 && self.height > 0 && self.format != DfImage::Virt
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if is_virtual {
            if self.format != DfImage::Virt && self.format != produced.format {
                return Err(VisionError::InvalidFormat(format!(
                    "virtual image is {:?}, producer declares {:?}",
                    self.format, produced.format
                )));
            }
            self.width = produced.width;
            self.height = produced.height;
            self.format = produced.format;
            return Ok(());
        }

        if self.width != produced.width || self.height != produced.height {
            return Err(VisionError::InvalidDimension(format!(
                "image is {}x{}, producer declares {}x{}",
                self.width, self.height, produced.width, produced.height
            )));
        }
        if self.format != produced.format {
            return Err(VisionError::InvalidFormat(format!(
                "image is {:?}, producer declares {:?}",
                self.format, produced.format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayShape {
    pub item_type: ItemType,
    pub capacity: usize,
}

impl ResourceAlloc for ArrayShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.item_type.size() * self.capacity]
    }

    fn is_complete(&self) -> bool {
        self.capacity > 0
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if self.item_type != produced.item_type {
            return Err(VisionError::InvalidType(format!(
                "array holds {:?}, producer declares {:?}",
                self.item_type, produced.item_type
            )));
        }
        if is_virtual && self.capacity == 0 {
            self.capacity = produced.capacity;
            return Ok(());
        }
        if self.capacity < produced.capacity {
            return Err(VisionError::InvalidDimension(format!(
                "array capacity {} is below the declared {}",
                self.capacity, produced.capacity
            )));
        }
        Ok(())
    }
}

/// Rounds `value * scale^level` up, the size rule of pyramid levels.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn pyramid_level_dim(value: u32, scale: f32, level: usize) -> u32 {
    let factor = f64::from(scale).powi(level as i32);
    (f64::from(value) * factor).ceil() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PyramidShape {
    pub levels: usize,
    pub scale: f32,
    pub width: u32,
    pub height: u32,
    pub format: DfImage,
}

impl PyramidShape {
    pub fn level(&self, index: usize) -> ImageShape {
        ImageShape::new(
            pyramid_level_dim(self.width, self.scale, index),
            pyramid_level_dim(self.height, self.scale, index),
            self.format,
        )
    }

    /// Index of the first plane belonging to `level`.
    pub fn first_plane_of(&self, level: usize) -> usize {
        level * self.format.planes().len()
    }
}

impl ResourceAlloc for PyramidShape {
    fn plane_sizes(&self) -> Vec<usize> {
        (0..self.levels).flat_map(|i| self.level(i).plane_sizes()).collect()
    }

    fn is_complete(&self) -> bool {
        self.levels > 0 && self.level(0).is_complete()
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if self.levels != produced.levels || (self.scale - produced.scale).abs() > f32::EPSILON {
            return Err(VisionError::InvalidValue(format!(
                "pyramid has {} levels at scale {}, producer declares {} at {}",
                self.levels, self.scale, produced.levels, produced.scale
            )));
        }
        let mut base = self.level(0);
        base.verify_meta(&produced.level(0), is_virtual)?;
        self.width = base.width;
        self.height = base.height;
        self.format = base.format;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarShape {
    pub data_type: ScalarType,
}

impl ResourceAlloc for ScalarShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.data_type.size()]
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn verify_meta(&mut self, produced: &Self, _is_virtual: bool) -> Result<()> {
        if self.data_type == produced.data_type {
            Ok(())
        } else {
            Err(VisionError::InvalidType(format!(
                "scalar is {:?}, producer declares {:?}",
                self.data_type, produced.data_type
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixShape {
    pub data_type: ScalarType,
    pub rows: usize,
    pub columns: usize,
}

impl ResourceAlloc for MatrixShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.data_type.size() * self.rows * self.columns]
    }

    fn is_complete(&self) -> bool {
        self.rows > 0 && self.columns > 0
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if self.data_type != produced.data_type {
            return Err(VisionError::InvalidType(format!(
                "matrix holds {:?}, producer declares {:?}",
                self.data_type, produced.data_type
            )));
        }
        if is_virtual && !self.is_complete() {
            self.rows = produced.rows;
            self.columns = produced.columns;
            return Ok(());
        }
        if self.rows != produced.rows || self.columns != produced.columns {
            return Err(VisionError::InvalidDimension(format!(
                "matrix is {}x{}, producer declares {}x{}",
                self.rows, self.columns, produced.rows, produced.columns
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LutShape {
    pub data_type: ScalarType,
    pub count: usize,
}

impl ResourceAlloc for LutShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.data_type.size() * self.count]
    }

    fn is_complete(&self) -> bool {
        self.count > 0
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if self.data_type != produced.data_type {
            return Err(VisionError::InvalidType(format!(
                "lut holds {:?}, producer declares {:?}",
                self.data_type, produced.data_type
            )));
        }
        if is_virtual && self.count == 0 {
            self.count = produced.count;
        } else if self.count != produced.count {
            return Err(VisionError::InvalidValue(format!(
                "lut has {} entries, producer declares {}",
                self.count, produced.count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdShape {
    pub kind: ThresholdKind,
    pub data_type: ScalarType,
}

impl ResourceAlloc for ThresholdShape {
    fn plane_sizes(&self) -> Vec<usize> {
        // value, lower, upper, true value, false value
        vec![self.data_type.size() * 5]
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn verify_meta(&mut self, produced: &Self, _is_virtual: bool) -> Result<()> {
        if self.kind != produced.kind || self.data_type != produced.data_type {
            return Err(VisionError::InvalidType(format!(
                "threshold is {:?}/{:?}, producer declares {:?}/{:?}",
                self.kind, self.data_type, produced.kind, produced.data_type
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapShape {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
}

impl ResourceAlloc for RemapShape {
    fn plane_sizes(&self) -> Vec<usize> {
        // One (x, y) float pair per destination pixel.
        vec![self.dst_width as usize * self.dst_height as usize * 8]
    }

    fn is_complete(&self) -> bool {
        self.dst_width > 0 && self.dst_height > 0
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if is_virtual && !self.is_complete() {
            *self = *produced;
            return Ok(());
        }
        if self != produced {
            return Err(VisionError::InvalidDimension(format!(
                "remap {self:?} does not match producer {produced:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionShape {
    pub bins: usize,
    pub offset: i32,
    pub range: u32,
}

impl ResourceAlloc for DistributionShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.bins * 4]
    }

    fn is_complete(&self) -> bool {
        self.bins > 0
    }

    fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        if is_virtual && !self.is_complete() {
            *self = *produced;
            return Ok(());
        }
        if self != produced {
            return Err(VisionError::InvalidDimension(format!(
                "distribution {self:?} does not match producer {produced:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionShape {
    pub rows: usize,
    pub columns: usize,
    pub scale: u32,
}

impl ResourceAlloc for ConvolutionShape {
    fn plane_sizes(&self) -> Vec<usize> {
        vec![self.rows * self.columns * 2]
    }

    fn is_complete(&self) -> bool {
        self.rows > 0 && self.columns > 0
    }

    fn verify_meta(&mut self, produced: &Self, _is_virtual: bool) -> Result<()> {
        if self.rows != produced.rows || self.columns != produced.columns {
            return Err(VisionError::InvalidDimension(format!(
                "convolution is {}x{}, producer declares {}x{}",
                self.rows, self.columns, produced.rows, produced.columns
            )));
        }
        Ok(())
    }
}

/// Shape of any typed data object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShape {
    Image(ImageShape),
    Array(ArrayShape),
    Pyramid(PyramidShape),
    Scalar(ScalarShape),
    Matrix(MatrixShape),
    Lut(LutShape),
    Threshold(ThresholdShape),
    Remap(RemapShape),
    Distribution(DistributionShape),
    Convolution(ConvolutionShape),
}

macro_rules! dispatch {
    ($self:expr, $shape:ident => $body:expr) => {
        match $self {
            DataShape::Image($shape) => $body,
            DataShape::Array($shape) => $body,
            DataShape::Pyramid($shape) => $body,
            DataShape::Scalar($shape) => $body,
            DataShape::Matrix($shape) => $body,
            DataShape::Lut($shape) => $body,
            DataShape::Threshold($shape) => $body,
            DataShape::Remap($shape) => $body,
            DataShape::Distribution($shape) => $body,
            DataShape::Convolution($shape) => $body,
        }
    };
}

impl DataShape {
    pub const fn reference_type(&self) -> ReferenceType {
        match self {
            Self::Image(_) => ReferenceType::Image,
            Self::Array(_) => ReferenceType::Array,
            Self::Pyramid(_) => ReferenceType::Pyramid,
            Self::Scalar(_) => ReferenceType::Scalar,
            Self::Matrix(_) => ReferenceType::Matrix,
            Self::Lut(_) => ReferenceType::Lut,
            Self::Threshold(_) => ReferenceType::Threshold,
            Self::Remap(_) => ReferenceType::Remap,
            Self::Distribution(_) => ReferenceType::Distribution,
            Self::Convolution(_) => ReferenceType::Convolution,
        }
    }

    pub fn plane_sizes(&self) -> Vec<usize> {
        dispatch!(self, s => s.plane_sizes())
    }

    pub fn is_complete(&self) -> bool {
        dispatch!(self, s => s.is_complete())
    }

    /// # Errors
    ///
    /// See [`ResourceAlloc::allocate`].
    pub fn allocate(&self, allocator: &dyn Allocator) -> Result<Memory> {
        dispatch!(self, s => s.allocate(allocator))
    }

    pub fn free(&self, memory: Memory, allocator: &dyn Allocator) {
        dispatch!(self, s => s.free(memory, allocator));
    }

    /// Verifies a produced shape of the same variant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidType` when the variants differ, otherwise whatever the
    /// variant's [`ResourceAlloc::verify_meta`] reports.
    pub fn verify_meta(&mut self, produced: &Self, is_virtual: bool) -> Result<()> {
        match (self, produced) {
            (Self::Image(a), Self::Image(b)) => a.verify_meta(b, is_virtual),
            (Self::Array(a), Self::Array(b)) => a.verify_meta(b, is_virtual),
            (Self::Pyramid(a), Self::Pyramid(b)) => a.verify_meta(b, is_virtual),
            (Self::Scalar(a), Self::Scalar(b)) => a.verify_meta(b, is_virtual),
            (Self::Matrix(a), Self::Matrix(b)) => a.verify_meta(b, is_virtual),
            (Self::Lut(a), Self::Lut(b)) => a.verify_meta(b, is_virtual),
            (Self::Threshold(a), Self::Threshold(b)) => a.verify_meta(b, is_virtual),
            (Self::Remap(a), Self::Remap(b)) => a.verify_meta(b, is_virtual),
            (Self::Distribution(a), Self::Distribution(b)) => a.verify_meta(b, is_virtual),
            (Self::Convolution(a), Self::Convolution(b)) => a.verify_meta(b, is_virtual),
            (own, other) => Err(VisionError::InvalidType(format!(
                "{} cannot take the shape of a {}",
                own.reference_type(),
                other.reference_type()
            ))),
        }
    }

    pub const fn as_image(&self) -> Option<&ImageShape> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    pub const fn as_pyramid(&self) -> Option<&PyramidShape> {
        match self {
            Self::Pyramid(pyramid) => Some(pyramid),
            _ => None,
        }
    }

    pub const fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub const fn as_scalar(&self) -> Option<&ScalarShape> {
        match self {
            Self::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }
}
