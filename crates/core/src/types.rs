// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Plain value types shared by data objects, kernels and graphs.

use serde::{Deserialize, Serialize};

/// Image pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DfImage {
    /// Format not yet known; only valid on virtual images before verification.
    Virt,
    U8,
    U16,
    S16,
    U32,
    S32,
    Rgb,
    Rgbx,
    Nv12,
    Nv21,
    Iyuv,
    Yuv4,
    Uyvy,
    Yuyv,
}

/// Layout of one image plane relative to the image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub bytes_per_pixel: usize,
    /// Horizontal subsampling factor.
    pub x_div: u32,
    /// Vertical subsampling factor.
    pub y_div: u32,
}

impl DfImage {
    pub fn planes(self) -> Vec<PlaneLayout> {
        let full = |bpp| PlaneLayout { bytes_per_pixel: bpp, x_div: 1, y_div: 1 };
        match self {
            Self::Virt => Vec::new(),
            Self::U8 => vec![full(1)],
            Self::U16 | Self::S16 | Self::Uyvy | Self::Yuyv => vec![full(2)],
            Self::U32 | Self::S32 | Self::Rgbx => vec![full(4)],
            Self::Rgb => vec![full(3)],
            Self::Nv12 | Self::Nv21 => {
                vec![full(1), PlaneLayout { bytes_per_pixel: 2, x_div: 2, y_div: 2 }]
            },
            Self::Iyuv => vec![
                full(1),
                PlaneLayout { bytes_per_pixel: 1, x_div: 2, y_div: 2 },
                PlaneLayout { bytes_per_pixel: 1, x_div: 2, y_div: 2 },
            ],
            Self::Yuv4 => vec![full(1), full(1), full(1)],
        }
    }
}

/// Scalar data types. Also used as specific parameter types in kernel signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Char,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Enum,
    Bool,
    Size,
    DfImage,
    Rectangle,
    Coordinates2d,
    Coordinates3d,
    Keypoint,
}

impl ScalarType {
    pub const fn size(self) -> usize {
        match self {
            Self::Char | Self::Int8 | Self::Uint8 | Self::Bool => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 | Self::Enum | Self::DfImage => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 | Self::Size | Self::Coordinates2d => 8,
            Self::Coordinates3d => 12,
            Self::Rectangle => 16,
            // x, y, strength, scale, orientation, tracking_status, error
            Self::Keypoint => 28,
        }
    }
}

/// Item type of an array. Either a built-in type or a registered user struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Scalar(ScalarType),
    UserStruct { id: u32, size: usize },
}

impl ItemType {
    pub const fn size(self) -> usize {
        match self {
            Self::Scalar(scalar) => scalar.size(),
            Self::UserStruct { size, .. } => size,
        }
    }
}

/// Half-open rectangle `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub start_x: u32,
    pub start_y: u32,
    pub end_x: u32,
    pub end_y: u32,
}

impl Rectangle {
    pub const fn new(start_x: u32, start_y: u32, end_x: u32, end_y: u32) -> Self {
        Self { start_x, start_y, end_x, end_y }
    }

    pub const fn width(&self) -> u32 {
        self.end_x.saturating_sub(self.start_x)
    }

    pub const fn height(&self) -> u32 {
        self.end_y.saturating_sub(self.start_y)
    }

    pub const fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub const fn intersects(&self, other: &Self) -> bool {
        self.start_x < other.end_x
            && self.end_x > other.start_x
            && self.start_y < other.end_y
            && self.end_y > other.start_y
    }

    /// Translates `self` by the origin of `outer`.
    pub const fn offset_by(&self, outer: &Self) -> Self {
        Self {
            start_x: self.start_x + outer.start_x,
            start_y: self.start_y + outer.start_y,
            end_x: self.end_x + outer.start_x,
            end_y: self.end_y + outer.start_y,
        }
    }
}

/// Parameter direction in a kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
    /// Read and written; bookkept as an output.
    Bidirectional,
}

impl Direction {
    /// Whether the parameter is read by the kernel.
    pub const fn reads(self) -> bool {
        matches!(self, Self::Input | Self::Bidirectional)
    }

    /// Whether the parameter is written by the kernel.
    pub const fn writes(self) -> bool {
        matches!(self, Self::Output | Self::Bidirectional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamState {
    Required,
    Optional,
}

/// Border handling requested from a kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    #[default]
    Undefined,
    Constant(u32),
    Replicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Binary,
    Range,
}

/// Execution mode hint of a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Synchronous, one frame per `process_graph` call.
    #[default]
    Normal,
    /// Pipelined, frames flow through slot rings and queues.
    Stream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_intersection() {
        let a = Rectangle::new(0, 0, 32, 32);
        let b = Rectangle::new(16, 16, 48, 48);
        let c = Rectangle::new(32, 0, 64, 32);
        assert!(a.intersects(&b));
        // Touching edges do not overlap.
        assert!(!a.intersects(&c));
        assert_eq!(b.width(), 32);
    }

    #[test]
    fn test_offset_by() {
        let inner = Rectangle::new(1, 2, 3, 4);
        let outer = Rectangle::new(10, 20, 50, 60);
        assert_eq!(inner.offset_by(&outer), Rectangle::new(11, 22, 13, 24));
    }

    #[test]
    fn test_plane_layouts() {
        assert_eq!(DfImage::U8.planes().len(), 1);
        assert_eq!(DfImage::Iyuv.planes().len(), 3);
        assert_eq!(DfImage::Nv12.planes()[1].x_div, 2);
        assert!(DfImage::Virt.planes().is_empty());
    }

    #[test]
    fn test_direction() {
        assert!(Direction::Bidirectional.reads());
        assert!(Direction::Bidirectional.writes());
        assert!(!Direction::Input.writes());
    }
}
