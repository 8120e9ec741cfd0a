// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

use super::{connect, filled_image, first_byte, identity};
use crate::Context;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use visionflow_core::{CallbackAction, DfImage, GraphState, NodeStatus, Status, VisionError};

#[test]
fn test_identity_through_virtual_image() {
    let context = Context::new();
    let kernel = identity(&context, 1, "cpu.identity");
    let graph = context.create_graph().unwrap();
    let input = context.create_image(64, 64, DfImage::U8).unwrap();
    let middle = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
    let output = context.create_image(64, 64, DfImage::U8).unwrap();
    context
        .map_data(input, |planes| {
            for (i, byte) in planes[0].data.iter_mut().enumerate() {
                *byte = u8::try_from(i % 251).unwrap();
            }
        })
        .unwrap();
    let first = connect(&context, graph, kernel, &[input, middle]);
    let second = connect(&context, graph, kernel, &[middle, output]);

    context.process_graph(graph).unwrap();

    let expected = context.map_data(input, |planes| planes[0].data.to_vec()).unwrap();
    let produced = context.map_data(output, |planes| planes[0].data.to_vec()).unwrap();
    assert_eq!(produced, expected);
    assert_eq!(context.graph_state(graph).unwrap(), GraphState::Completed);
    assert_eq!(context.query_node(first).unwrap().status, NodeStatus::Success);
    assert_eq!(context.query_node(second).unwrap().status, NodeStatus::Success);

    let inferred = context.query_data(middle).unwrap();
    assert!(inferred.is_virtual);
    assert_eq!(inferred.shape.as_image().map(|s| (s.width, s.height, s.format)), Some((64, 64, DfImage::U8)));
    assert!(matches!(context.map_data(middle, |_| ()), Err(VisionError::OptimizedAway(_))));

    let frames: Vec<u64> = context.frame_stamps(graph).unwrap().iter().map(|s| s.frame).collect();
    assert_eq!(frames, vec![1]);
}

#[test]
fn test_rebinding_an_input_between_frames() {
    let context = Context::new();
    let kernel = identity(&context, 1, "cpu.identity");
    let graph = context.create_graph().unwrap();
    let first = filled_image(&context, 8, 8, 7);
    let second = filled_image(&context, 8, 8, 9);
    let output = context.create_image(8, 8, DfImage::U8).unwrap();
    let node = connect(&context, graph, kernel, &[first, output]);

    context.process_graph(graph).unwrap();
    assert_eq!(first_byte(&context, output), 7);

    context.set_parameter_by_index(node, 0, Some(second)).unwrap();
    assert!(!context.is_graph_verified(graph).unwrap());
    context.process_graph(graph).unwrap();
    assert_eq!(first_byte(&context, output), 9);
    assert_eq!(context.query_graph(graph).unwrap().frame_count, 2);
}

#[test]
fn test_callback_abandons_the_rest_of_the_frame() {
    let context = Context::new();
    let kernel = identity(&context, 1, "cpu.identity");
    let graph = context.create_graph().unwrap();
    let input = filled_image(&context, 8, 8, 3);
    let middle = context.create_image(8, 8, DfImage::U8).unwrap();
    let output = context.create_image(8, 8, DfImage::U8).unwrap();
    let first = connect(&context, graph, kernel, &[input, middle]);
    let second = connect(&context, graph, kernel, &[middle, output]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    context
        .assign_node_callback(
            first,
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                CallbackAction::Abandon
            })),
        )
        .unwrap();
    let again = context.assign_node_callback(first, Some(Arc::new(|_| CallbackAction::Continue)));
    assert!(matches!(again, Err(VisionError::NotSupported(_))));

    let err = context.process_graph(graph).unwrap_err();
    assert!(matches!(err, VisionError::GraphAbandoned(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let info = context.query_graph(graph).unwrap();
    assert_eq!(info.state, GraphState::Abandoned);
    assert_eq!(info.error_status, Status::GraphAbandoned);
    assert_eq!(context.query_node(first).unwrap().status, NodeStatus::Success);
    assert_eq!(context.query_node(second).unwrap().status, NodeStatus::Pending);

    context.assign_node_callback(first, None).unwrap();
    context.process_graph(graph).unwrap();
    assert_eq!(first_byte(&context, output), 3);
}

#[test]
fn test_releasing_everything_restores_reference_count() {
    let context = Context::new();
    let kernel = identity(&context, 1, "cpu.identity");
    let baseline = context.num_references();

    let graph = context.create_graph().unwrap();
    let input = filled_image(&context, 16, 16, 1);
    let middle = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
    let output = context.create_image(16, 16, DfImage::U8).unwrap();
    let first = connect(&context, graph, kernel, &[input, middle]);
    let second = connect(&context, graph, kernel, &[middle, output]);
    context.process_graph(graph).unwrap();
    assert!(context.num_references() > baseline);

    for handle in [first, second, input, middle, output] {
        context.release_reference(handle).unwrap();
    }
    // The graph still holds its nodes and through them the images.
    assert!(context.num_references() > baseline);
    context.release_reference(graph).unwrap();
    assert_eq!(context.num_references(), baseline);

    context.remove_kernel(kernel).unwrap();
    assert!(context.get_kernel_by_name("cpu.identity").is_err());
}

#[test]
fn test_uniform_image_feeds_a_graph() {
    let context = Context::new();
    let kernel = identity(&context, 1, "cpu.identity");
    let graph = context.create_graph().unwrap();
    let input = context.create_uniform_image(4, 4, DfImage::U8, 42).unwrap();
    let output = context.create_image(4, 4, DfImage::U8).unwrap();
    connect(&context, graph, kernel, &[input, output]);

    context.process_graph(graph).unwrap();
    let produced = context.map_data(output, |planes| planes[0].data.to_vec()).unwrap();
    assert!(produced.iter().all(|b| *b == 42));
}
