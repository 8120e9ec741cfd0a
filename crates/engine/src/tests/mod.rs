// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Scenario tests for the engine crate.

mod pipeline;

use crate::Context;
use visionflow_core::{DfImage, Direction, Handle, KernelCallbacks, ParamState, ReferenceType, VisionError};

/// Registers an image-in, image-out kernel that copies its input and sizes
/// its output like the input.
#[allow(clippy::unwrap_used)]
pub(super) fn identity(context: &Context, enumeration: u32, name: &str) -> Handle {
    let callbacks = KernelCallbacks::new(|args| {
        let input = args.param(0)?.with_planes(|planes| planes.iter().map(|p| p.data.to_vec()).collect::<Vec<_>>())?;
        args.param(1)?.with_planes(|planes| {
            for (plane, data) in planes.iter_mut().zip(&input) {
                plane.data.copy_from_slice(data);
            }
        })
    })
    .with_input_validate(|args, index| match args.param(index)?.shape().as_image() {
        Some(_) => Ok(()),
        None => Err(VisionError::InvalidType(format!("parameter {index} is not an image"))),
    })
    .with_output_validate(|args, _, meta| {
        meta.set_shape(args.param(0)?.shape());
        Ok(())
    });
    let kernel = context.add_kernel(enumeration, name, 2, callbacks).unwrap();
    context.add_parameter_to_kernel(kernel, 0, Direction::Input, ReferenceType::Image, ParamState::Required).unwrap();
    context.add_parameter_to_kernel(kernel, 1, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
    context.finalize_kernel(kernel).unwrap();
    kernel
}

#[allow(clippy::unwrap_used)]
pub(super) fn connect(context: &Context, graph: Handle, kernel: Handle, params: &[Handle]) -> Handle {
    let node = context.create_generic_node(graph, kernel).unwrap();
    for (index, param) in params.iter().enumerate() {
        context.set_parameter_by_index(node, u32::try_from(index).unwrap(), Some(*param)).unwrap();
    }
    node
}

/// An `width`x`height` U8 image filled with `value`.
#[allow(clippy::unwrap_used)]
pub(super) fn filled_image(context: &Context, width: u32, height: u32, value: u8) -> Handle {
    let image = context.create_image(width, height, DfImage::U8).unwrap();
    context.map_data(image, |planes| planes[0].data.fill(value)).unwrap();
    image
}

#[allow(clippy::unwrap_used)]
pub(super) fn first_byte(context: &Context, image: Handle) -> u8 {
    context.map_data(image, |planes| planes[0].data[0]).unwrap()
}
