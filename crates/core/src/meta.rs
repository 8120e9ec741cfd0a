// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The meta format an output validator fills in.

use crate::reference::ReferenceType;
use crate::shape::{ArrayShape, DataShape, ImageShape, PyramidShape, ScalarShape};
use crate::types::{DfImage, ItemType, ScalarType};

/// Shape declared by a kernel for one of its outputs.
///
/// A fresh `Meta` carries only the parameter type from the kernel signature.
/// The output validator sets the shape; a validator that leaves it empty makes
/// no claim about the output.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    ty: ReferenceType,
    shape: Option<DataShape>,
}

impl Meta {
    pub const fn new(ty: ReferenceType) -> Self {
        Self { ty, shape: None }
    }

    pub const fn ty(&self) -> ReferenceType {
        self.ty
    }

    pub const fn shape(&self) -> Option<&DataShape> {
        self.shape.as_ref()
    }

    pub fn set_shape(&mut self, shape: DataShape) {
        self.shape = Some(shape);
    }

    pub fn set_image(&mut self, width: u32, height: u32, format: DfImage) {
        self.shape = Some(DataShape::Image(ImageShape::new(width, height, format)));
    }

    pub fn set_array(&mut self, item_type: ItemType, capacity: usize) {
        self.shape = Some(DataShape::Array(ArrayShape { item_type, capacity }));
    }

    pub fn set_scalar(&mut self, data_type: ScalarType) {
        self.shape = Some(DataShape::Scalar(ScalarShape { data_type }));
    }

    pub fn set_pyramid(&mut self, levels: usize, scale: f32, width: u32, height: u32, format: DfImage) {
        self.shape = Some(DataShape::Pyramid(PyramidShape { levels, scale, width, height, format }));
    }
}
