// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Synchronous execution of verified graphs.

use crate::context::Context;
use crate::graph::Graph;
use crate::node::Node;
use std::sync::Arc;
use visionflow_core::perf::{now_ns, FrameStamp};
use visionflow_core::{
    CallbackAction, ExecMode, GraphState, Handle, NodeStatus, Result, Status, VisionError,
};

impl Context {
    /// Runs `graph` once, verifying it first if needed.
    ///
    /// # Errors
    ///
    /// - `InvalidGraph`: the graph streams or is already running
    /// - `GraphAbandoned`: a node callback stopped the graph
    /// - `Kernel`: a node failed; [`Graph::error_status`] holds its status
    /// - any verification error
    pub fn process_graph(&self, graph: Handle) -> Result<()> {
        let graph = self.graph(graph)?;
        let result = self.process(&graph, None);
        self.track(graph.header().id(), result)
    }

    /// Runs one frame. Child graphs run under the frame number of their parent.
    pub(crate) fn process(&self, graph: &Arc<Graph>, parent_frame: Option<u64>) -> Result<()> {
        if graph.exec_mode() == ExecMode::Stream {
            return Err(VisionError::InvalidGraph(format!(
                "{} is a streaming graph; use schedule_graph",
                graph.name()
            )));
        }
        if graph.state().is_working() {
            return Err(VisionError::InvalidGraph(format!("{} is already running", graph.name())));
        }
        if !graph.is_verified() {
            self.verify(graph, &[])?;
        }
        let plan = graph.try_begin()?;
        let frame = parent_frame.unwrap_or_else(|| graph.next_frame());

        graph.set_error_status(Status::Success);
        let beg = now_ns();
        tracing::debug!(graph = %graph.name(), frame, "processing frame");

        for node in &plan.sorted {
            if let Err(err) = self.run_node(node, frame) {
                let status = match node.status() {
                    NodeStatus::Failed { status, .. } => status,
                    _ => err.status(),
                };
                graph.set_error_status(status);
                graph.set_state(GraphState::Abandoned);
                self.metrics().kernel_failed(&graph.name(), node.kernel().name());
                return Err(err);
            }
            if let Some(callback) = node.callback() {
                if callback(node.handle()) == CallbackAction::Abandon {
                    tracing::info!(graph = %graph.name(), node = %node.name(), frame, "graph abandoned by callback");
                    graph.set_error_status(Status::GraphAbandoned);
                    graph.set_state(GraphState::Abandoned);
                    return Err(VisionError::GraphAbandoned(format!(
                        "{} stopped {} at frame {frame}",
                        node.name(),
                        graph.name()
                    )));
                }
            }
        }

        for delay in graph.auto_aged() {
            let delay = self.delay(delay)?;
            self.age(&delay)?;
        }

        let end = now_ns();
        graph.record_perf(beg, end);
        self.record_frame(FrameStamp { graph: graph.header().id(), frame, beg, end });
        self.metrics().frame_completed(&graph.name());
        graph.set_state(GraphState::Completed);
        Ok(())
    }

    fn run_node(&self, node: &Node, frame: u64) -> Result<()> {
        match node.child_graph() {
            Some(child) => match self.process(&child, Some(frame)) {
                Ok(()) => {
                    node.set_status(NodeStatus::Success);
                    Ok(())
                },
                Err(err) => {
                    node.set_status(NodeStatus::Failed { status: err.status(), message: err.to_string() });
                    Err(err)
                },
            },
            None => node.execute(&node.params(), frame),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use visionflow_core::{DfImage, Direction, KernelCallbacks, ParamState, ReferenceType};

    fn failing_kernel(context: &Context) -> Handle {
        let callbacks =
            KernelCallbacks::new(|_| Err(VisionError::NoResources("scratch buffer unavailable".into())));
        let kernel = context.add_kernel(9, "cpu.fail", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        kernel
    }

    #[test]
    fn test_kernel_failure_sets_error_status() {
        let context = Context::new();
        let kernel = failing_kernel(&context);
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        let image = context.create_image(4, 4, DfImage::U8).unwrap();
        context.set_parameter_by_index(node, 0, Some(image)).unwrap();

        let err = context.process_graph(graph).unwrap_err();
        assert!(matches!(err, VisionError::Kernel { .. }));
        let info = context.query_graph(graph).unwrap();
        assert_eq!(info.state, GraphState::Abandoned);
        assert_eq!(info.error_status, Status::NoResources);
        assert_eq!(context.query_node(node).unwrap().status.status(), Status::NoResources);
    }

    #[test]
    fn test_frames_are_numbered_and_stamped() {
        let context = Context::new();
        let seen = Arc::new(AtomicU64::new(0));
        let last = Arc::clone(&seen);
        let callbacks = KernelCallbacks::new(move |args| {
            last.store(args.frame, Ordering::SeqCst);
            Ok(())
        });
        let kernel = context.add_kernel(3, "cpu.touch", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Bidirectional, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        let image = context.create_image(4, 4, DfImage::U8).unwrap();
        context.set_parameter_by_index(node, 0, Some(image)).unwrap();

        context.process_graph(graph).unwrap();
        context.process_graph(graph).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(context.graph_state(graph).unwrap(), GraphState::Completed);
        let frames: Vec<u64> = context.frame_stamps(graph).unwrap().iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![1, 2]);
        assert_eq!(context.query_graph(graph).unwrap().perf.num, 2);
    }

    #[test]
    fn test_concurrent_processing_runs_graph_once() {
        let context = Context::new();
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        let callbacks = KernelCallbacks::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        let kernel = context.add_kernel(3, "cpu.slow", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Bidirectional, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        let image = context.create_image(4, 4, DfImage::U8).unwrap();
        context.set_parameter_by_index(node, 0, Some(image)).unwrap();
        context.verify_graph(graph).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let context = context.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    context.process_graph(graph)
                })
            })
            .collect();
        let results: Vec<Result<()>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.into_iter().find_map(Result::err).unwrap();
        assert!(matches!(&rejected, VisionError::InvalidGraph(message) if message.contains("already running")));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(context.query_graph(graph).unwrap().frame_count, 1);
        assert_eq!(context.graph_state(graph).unwrap(), GraphState::Completed);
    }

    #[test]
    fn test_streaming_graph_cannot_be_processed() {
        let context = Context::new();
        let graph = context.create_graph().unwrap();
        context.set_graph_exec_mode(graph, ExecMode::Stream).unwrap();
        assert!(matches!(context.process_graph(graph), Err(VisionError::InvalidGraph(_))));
    }
}
