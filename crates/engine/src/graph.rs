// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graphs: node containers with a verification state.
//!
//! A graph starts [`GraphState::Unverified`]. Verification computes a
//! [`Plan`] and moves it to `Verified`; any structural change (a node added
//! or removed, a parameter rebound, a target or mode switched) drops the plan
//! and returns it to `Unverified`. While `Running`, structure is frozen.

use crate::context::Context;
use crate::node::Node;
use crate::object::Object;
use crate::stream::StreamRuntime;
use crate::verify::Plan;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use visionflow_core::{
    Connection, ExecMode, GraphState, Handle, Perf, RefHeader, RefKind, ReferenceType, Result,
    Status, VisionError,
};

#[derive(Default)]
struct GraphInner {
    nodes: Vec<Arc<Node>>,
    state: GraphState,
    exec_mode: ExecMode,
    params: Vec<Connection>,
    plan: Option<Arc<Plan>>,
    error_status: Option<Status>,
    perf: Perf,
    /// Objects scoped to this graph (virtual and queue objects) it holds a count on.
    scoped: Vec<Handle>,
    /// Delays aged after every processed frame.
    auto_aged: Vec<Handle>,
}

pub struct Graph {
    header: RefHeader,
    handle: Handle,
    inner: Mutex<GraphInner>,
    frame_counter: AtomicU64,
    stream: Mutex<Option<StreamRuntime>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name())
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Snapshot returned by [`Context::query_graph`].
#[derive(Debug, Clone, Serialize)]
pub struct GraphInfo {
    pub name: String,
    pub state: GraphState,
    pub exec_mode: ExecMode,
    pub error_status: Status,
    pub perf: Perf,
    pub num_nodes: usize,
    pub num_params: usize,
    /// Frames processed or scheduled so far.
    pub frame_count: u64,
}

impl Graph {
    fn new(handle: Handle) -> Self {
        Self {
            header: RefHeader::new(ReferenceType::Graph, None),
            handle,
            inner: Mutex::new(GraphInner::default()),
            frame_counter: AtomicU64::new(0),
            stream: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    pub const fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> String {
        self.header.name()
    }

    pub fn state(&self) -> GraphState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: GraphState) {
        self.lock().state = state;
    }

    /// Claims a verified graph for one execution and returns its plan.
    /// The state check and the switch to `Running` happen under one lock.
    pub(crate) fn try_begin(&self) -> Result<Arc<Plan>> {
        let mut inner = self.lock();
        if inner.state.is_working() {
            return Err(VisionError::InvalidGraph(format!("{} is already running", self.header.name())));
        }
        let plan = match (&inner.plan, inner.state) {
            (Some(plan), state) if state != GraphState::Unverified => Arc::clone(plan),
            _ => return Err(VisionError::InvalidGraph(format!("{} has no plan", self.header.name()))),
        };
        inner.state = GraphState::Running;
        Ok(plan)
    }

    /// Whether a plan exists. Completed and abandoned graphs keep theirs.
    pub fn is_verified(&self) -> bool {
        let inner = self.lock();
        inner.state != GraphState::Unverified && inner.plan.is_some()
    }

    /// Drops the plan; the next execution verifies again.
    pub(crate) fn invalidate(&self) {
        let mut inner = self.lock();
        if inner.state != GraphState::Unverified {
            tracing::debug!(graph = %self.header.name(), "graph invalidated");
        }
        inner.state = GraphState::Unverified;
        inner.plan = None;
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.lock().nodes.clone()
    }

    pub(crate) fn add_node(&self, node: Arc<Node>) {
        let mut inner = self.lock();
        inner.nodes.push(node);
        inner.state = GraphState::Unverified;
        inner.plan = None;
    }

    /// Removes `node` and every graph parameter pointing at it.
    pub(crate) fn remove_node(&self, node: Handle) -> bool {
        let mut inner = self.lock();
        let before = inner.nodes.len();
        inner.nodes.retain(|n| n.handle() != node);
        if inner.nodes.len() == before {
            return false;
        }
        inner.params.retain(|c| c.node != node);
        inner.state = GraphState::Unverified;
        inner.plan = None;
        true
    }

    pub(crate) fn plan(&self) -> Option<Arc<Plan>> {
        self.lock().plan.clone()
    }

    pub(crate) fn set_plan(&self, plan: Plan) {
        let mut inner = self.lock();
        inner.plan = Some(Arc::new(plan));
        inner.state = GraphState::Verified;
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.lock().exec_mode
    }

    pub fn params(&self) -> Vec<Connection> {
        self.lock().params.clone()
    }

    /// Status of the last execution; `Success` when nothing failed.
    pub fn error_status(&self) -> Status {
        self.lock().error_status.unwrap_or(Status::Success)
    }

    pub(crate) fn set_error_status(&self, status: Status) {
        self.lock().error_status = (!status.is_success()).then_some(status);
    }

    pub fn perf(&self) -> Perf {
        self.lock().perf
    }

    pub(crate) fn record_perf(&self, beg: u64, end: u64) {
        let mut inner = self.lock();
        inner.perf.beg = beg;
        inner.perf.end = end;
        inner.perf.record(end.saturating_sub(beg));
    }

    pub(crate) fn add_scoped(&self, object: Handle) {
        self.lock().scoped.push(object);
    }

    pub(crate) fn auto_aged(&self) -> Vec<Handle> {
        self.lock().auto_aged.clone()
    }

    /// Issues the next frame number. The first frame is 1.
    pub(crate) fn next_frame(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advances the frame counter to at least `frame`.
    pub(crate) fn observe_frame(&self, frame: u64) {
        self.frame_counter.fetch_max(frame, Ordering::AcqRel);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    pub(crate) fn stream(&self) -> MutexGuard<'_, Option<StreamRuntime>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels a running stream without waiting for its tasks.
    pub(crate) fn cancel_stream(&self) {
        if let Some(runtime) = self.stream().take() {
            tracing::info!(graph = %self.header.name(), "cancelling stream");
            runtime.abort();
        }
    }
}

impl Context {
    /// # Errors
    ///
    /// Returns `Runtime` if the object table rejects the graph.
    pub fn create_graph(&self) -> Result<Handle> {
        let (handle, graph) = self.register(RefKind::External, |h| Arc::new(Graph::new(h)), Object::Graph)?;
        tracing::debug!(graph = %graph.name(), "graph created");
        Ok(handle)
    }

    /// Exposes parameter `index` of `node` as the graph's next parameter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidNode` if the node belongs to another graph and
    /// `InvalidValue` past the kernel signature.
    pub fn add_parameter_to_graph(&self, graph: Handle, node: Handle, index: u32) -> Result<u32> {
        let target = self.graph_idle(graph)?;
        let node = self.node(node)?;
        if node.graph() != graph {
            return Err(VisionError::InvalidNode(format!("{} is not part of {}", node.name(), target.name())));
        }
        if node.kernel().param(index).is_none() {
            return Err(VisionError::InvalidValue(format!("{} has no parameter {index}", node.name())));
        }
        let mut inner = target.lock();
        inner.params.push(Connection { node: node.handle(), index });
        Ok(u32::try_from(inner.params.len() - 1).unwrap_or(u32::MAX))
    }

    fn graph_param(&self, graph: Handle, index: u32) -> Result<Connection> {
        let graph = self.graph(graph)?;
        graph.params().get(index as usize).copied().ok_or_else(|| {
            VisionError::InvalidValue(format!("{} has no parameter {index}", graph.name()))
        })
    }

    /// Binds `value` to the node parameter behind graph parameter `index`.
    ///
    /// # Errors
    ///
    /// See [`set_parameter_by_index`](Self::set_parameter_by_index).
    pub fn set_graph_parameter_by_index(&self, graph: Handle, index: u32, value: Option<Handle>) -> Result<()> {
        let connection = self.graph_param(graph, index)?;
        self.set_parameter_by_index(connection.node, connection.index, value)
    }

    /// # Errors
    ///
    /// Returns `InvalidValue` past the declared graph parameters.
    pub fn get_graph_parameter_by_index(&self, graph: Handle, index: u32) -> Result<Option<Handle>> {
        let connection = self.graph_param(graph, index)?;
        self.get_parameter_by_index(connection.node, connection.index)
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `graph` is a graph.
    pub fn query_graph(&self, graph: Handle) -> Result<GraphInfo> {
        let graph = self.graph(graph)?;
        let inner = graph.lock();
        Ok(GraphInfo {
            name: graph.name(),
            state: inner.state,
            exec_mode: inner.exec_mode,
            error_status: inner.error_status.unwrap_or(Status::Success),
            perf: inner.perf,
            num_nodes: inner.nodes.len(),
            num_params: inner.params.len(),
            frame_count: graph.frame_count(),
        })
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `graph` is a graph.
    pub fn is_graph_verified(&self, graph: Handle) -> Result<bool> {
        Ok(self.graph(graph)?.is_verified())
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `graph` is a graph.
    pub fn graph_state(&self, graph: Handle) -> Result<GraphState> {
        Ok(self.graph(graph)?.state())
    }

    /// Switches between synchronous and pipelined execution. The graph must
    /// be verified again afterwards.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running or streaming.
    pub fn set_graph_exec_mode(&self, graph: Handle, mode: ExecMode) -> Result<()> {
        let graph = self.graph_idle(graph)?;
        if graph.stream().is_some() {
            return Err(VisionError::InvalidGraph(format!("{} is scheduled", graph.name())));
        }
        let changed = {
            let mut inner = graph.lock();
            let changed = inner.exec_mode != mode;
            inner.exec_mode = mode;
            changed
        };
        if changed {
            graph.invalidate();
        }
        Ok(())
    }

    /// Ages `delay` automatically after every frame `graph` processes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` unless `delay` is a delay.
    pub fn register_auto_aging(&self, graph: Handle, delay: Handle) -> Result<()> {
        let target = self.graph_idle(graph)?;
        self.delay(delay)?;
        if target.lock().auto_aged.contains(&delay) {
            return Ok(());
        }
        self.retain_internal(delay, graph)?;
        target.lock().auto_aged.push(delay);
        Ok(())
    }

    pub(crate) fn destroy_graph(&self, graph: &Arc<Graph>) {
        graph.cancel_stream();
        let (nodes, scoped, auto_aged) = {
            let mut inner = graph.lock();
            inner.plan = None;
            inner.params.clear();
            (
                std::mem::take(&mut inner.nodes),
                std::mem::take(&mut inner.scoped),
                std::mem::take(&mut inner.auto_aged),
            )
        };
        tracing::debug!(graph = %graph.name(), nodes = nodes.len(), "destroying graph");
        for node in nodes {
            self.release_logged(node.handle(), graph.handle());
        }
        for handle in scoped.into_iter().chain(auto_aged) {
            self.release_logged(handle, graph.handle());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use visionflow_core::{Direction, KernelCallbacks, ParamState};

    fn context_with_copy() -> (Context, Handle) {
        let context = Context::new();
        let kernel = context.add_kernel(1, "cpu.copy", 2, KernelCallbacks::new(|_| Ok(()))).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Input, ReferenceType::Image, ParamState::Required).unwrap();
        context.add_parameter_to_kernel(kernel, 1, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        (context, kernel)
    }

    #[test]
    fn test_frame_numbers_start_at_one() {
        let graph = Graph::new(visionflow_core::Arena::<()>::new().insert(()));
        assert_eq!(graph.frame_count(), 0);
        assert_eq!(graph.next_frame(), 1);
        assert_eq!(graph.next_frame(), 2);
    }

    #[test]
    fn test_graph_parameters() {
        let (context, kernel) = context_with_copy();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        assert_eq!(context.add_parameter_to_graph(graph, node, 1).unwrap(), 0);
        assert!(context.add_parameter_to_graph(graph, node, 2).is_err());

        let image = context.create_image(8, 8, visionflow_core::DfImage::U8).unwrap();
        context.set_graph_parameter_by_index(graph, 0, Some(image)).unwrap();
        assert_eq!(context.get_parameter_by_index(node, 1).unwrap(), Some(image));
        assert_eq!(context.get_graph_parameter_by_index(graph, 0).unwrap(), Some(image));
        assert!(context.get_graph_parameter_by_index(graph, 1).is_err());

        let info = context.query_graph(graph).unwrap();
        assert_eq!((info.num_nodes, info.num_params), (1, 1));
        assert_eq!(info.error_status, Status::Success);
    }

    #[test]
    fn test_remove_node_drops_its_graph_parameters() {
        let (context, kernel) = context_with_copy();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        context.add_parameter_to_graph(graph, node, 0).unwrap();
        let before = context.num_references();
        context.remove_node(node).unwrap();
        assert_eq!(context.num_references(), before - 1);
        assert_eq!(context.query_graph(graph).unwrap().num_params, 0);
        assert!(context.query_node(node).is_err());
    }

    #[test]
    fn test_destroying_graph_releases_nodes_and_virtual_objects() {
        let (context, kernel) = context_with_copy();
        let baseline = context.num_references();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        let virt = context.create_virtual_image(graph, 0, 0, visionflow_core::DfImage::Virt).unwrap();
        context.set_parameter_by_index(node, 1, Some(virt)).unwrap();

        context.release_reference(virt).unwrap();
        context.release_reference(node).unwrap();
        assert!(context.query_node(node).is_ok(), "the graph still holds its node");
        context.release_reference(graph).unwrap();
        assert_eq!(context.num_references(), baseline);
        assert!(context.query_reference(virt).is_err());
    }

    #[test]
    fn test_graph_info_serializes_for_diagnostics() {
        let context = Context::new();
        let graph = context.create_graph().unwrap();
        context.set_reference_name(graph, "preview").unwrap();
        let info = serde_json::to_value(context.query_graph(graph).unwrap()).unwrap();
        assert_eq!(info["name"], "preview");
        assert_eq!(info["state"], "unverified");
        assert_eq!(info["exec_mode"], "normal");
        assert_eq!(info["error_status"], "success");
        assert_eq!(info["frame_count"], 0);
    }

    #[test]
    fn test_exec_mode_switch_invalidates() {
        let context = Context::new();
        let graph = context.create_graph().unwrap();
        context.set_graph_exec_mode(graph, ExecMode::Stream).unwrap();
        assert_eq!(context.query_graph(graph).unwrap().exec_mode, ExecMode::Stream);
        assert!(!context.is_graph_verified(graph).unwrap());
    }
}
