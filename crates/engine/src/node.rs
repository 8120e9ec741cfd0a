// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Nodes and parameter binding.
//!
//! A [`Node`] binds a kernel to concrete data objects inside one graph.
//! Each parameter slot is unbound, bound, or rebound; every transition goes
//! through [`Context::bind`], which keeps four things consistent:
//!
//! - the node's internal count on the bound object,
//! - the object's per-graph reader/writer lists,
//! - for delay slots, the delay's association list and the node's internal
//!   count on the delay,
//! - the slot itself.
//!
//! The new object is linked before the old one is unlinked. Binding the
//! object a slot already holds changes nothing.

use crate::context::Context;
use crate::graph::Graph;
use crate::object::Object;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use visionflow_core::kernel::LocalData;
use visionflow_core::{
    BorderMode, CallbackAction, Connection, DataRef, Direction, Handle, Kernel, KernelArgs,
    NodeStatus, Perf, RefHeader, RefKind, ReferenceType, Result, VisionError,
};

/// Completion callback of a node. Returning [`CallbackAction::Abandon`]
/// stops the graph.
pub type NodeCallback = Arc<dyn Fn(Handle) -> CallbackAction + Send + Sync>;

/// Execution target requested for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Whatever target kernel lookup by enumeration resolves to.
    Any,
    Named(String),
}

struct BoundKernel {
    handle: Handle,
    kernel: Arc<Kernel>,
    sub_indices: Vec<(Direction, usize)>,
}

impl BoundKernel {
    fn new(handle: Handle, kernel: Arc<Kernel>) -> Self {
        let count = u32::try_from(kernel.num_params()).unwrap_or(u32::MAX);
        let sub_indices = (0..count).filter_map(|i| kernel.sub_index(i)).collect();
        Self { handle, kernel, sub_indices }
    }
}

/// Snapshot returned by [`Context::query_node`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub kernel: String,
    pub target: String,
    pub status: NodeStatus,
    pub perf: Perf,
    pub local_data_size: usize,
    pub border: BorderMode,
    pub num_params: usize,
    pub has_child_graph: bool,
}

pub struct Node {
    header: RefHeader,
    handle: Handle,
    graph: Handle,
    kernel: RwLock<BoundKernel>,
    params: Mutex<Vec<Option<DataRef>>>,
    status: Mutex<NodeStatus>,
    perf: Mutex<Perf>,
    local_data: LocalData,
    local_data_size: Mutex<Option<usize>>,
    border: Mutex<BorderMode>,
    callback: Mutex<Option<NodeCallback>>,
    child_graph: Mutex<Option<Arc<Graph>>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("handle", &self.handle)
            .field("kernel", &self.kernel().name())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Node {
    pub(crate) fn new(handle: Handle, graph: Handle, kernel_handle: Handle, kernel: Arc<Kernel>) -> Self {
        let header = RefHeader::new(ReferenceType::Node, Some(graph));
        header.set_name(format!("{}_{}", kernel.name(), header.id()));
        let params = vec![None; kernel.num_params()];
        Self {
            header,
            handle,
            graph,
            kernel: RwLock::new(BoundKernel::new(kernel_handle, kernel)),
            params: Mutex::new(params),
            status: Mutex::new(NodeStatus::default()),
            perf: Mutex::new(Perf::default()),
            local_data: Mutex::new(Vec::new()),
            local_data_size: Mutex::new(None),
            border: Mutex::new(BorderMode::default()),
            callback: Mutex::new(None),
            child_graph: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// The graph this node belongs to.
    pub const fn graph(&self) -> Handle {
        self.graph
    }

    pub fn name(&self) -> String {
        self.header.name()
    }

    pub fn kernel(&self) -> Arc<Kernel> {
        Arc::clone(&self.kernel.read().unwrap_or_else(PoisonError::into_inner).kernel)
    }

    pub fn kernel_handle(&self) -> Handle {
        self.kernel.read().unwrap_or_else(PoisonError::into_inner).handle
    }

    pub fn target(&self) -> String {
        self.kernel().target().to_string()
    }

    fn set_kernel(&self, handle: Handle, kernel: Arc<Kernel>) -> Handle {
        let mut bound = self.kernel.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *bound, BoundKernel::new(handle, kernel)).handle
    }

    /// Position of parameter `index` among the node's inputs, or among its
    /// outputs and bidirectional parameters.
    pub fn sub_index(&self, index: u32) -> Option<(Direction, usize)> {
        self.kernel.read().unwrap_or_else(PoisonError::into_inner).sub_indices.get(index as usize).copied()
    }

    pub fn params(&self) -> Vec<Option<DataRef>> {
        lock(&self.params).clone()
    }

    pub fn param(&self, index: u32) -> Option<DataRef> {
        lock(&self.params).get(index as usize).cloned().flatten()
    }

    fn replace_param(&self, index: u32, data: Option<DataRef>) -> Option<DataRef> {
        lock(&self.params).get_mut(index as usize).and_then(|slot| std::mem::replace(slot, data))
    }

    pub fn status(&self) -> NodeStatus {
        lock(&self.status).clone()
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        *lock(&self.status) = status;
    }

    pub fn perf(&self) -> Perf {
        *lock(&self.perf)
    }

    pub fn border(&self) -> BorderMode {
        *lock(&self.border)
    }

    /// Local data size: the node's own setting, else the kernel's.
    pub fn local_data_size(&self) -> usize {
        lock(&self.local_data_size).unwrap_or_else(|| self.kernel().local_data_size())
    }

    pub(crate) fn callback(&self) -> Option<NodeCallback> {
        lock(&self.callback).clone()
    }

    pub fn child_graph(&self) -> Option<Arc<Graph>> {
        lock(&self.child_graph).clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn kernel_args<'a>(
        &'a self,
        name: &'a str,
        params: &'a [Option<DataRef>],
        frame: u64,
    ) -> KernelArgs<'a> {
        KernelArgs { node: name, params, border: self.border(), local_data: &self.local_data, frame }
    }

    /// Sizes the local data and runs the kernel's init callback. A node that
    /// was initialized before is deinitialized first.
    pub(crate) fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            self.deinitialize();
        }
        *lock(&self.local_data) = vec![0; self.local_data_size()];
        let kernel = self.kernel();
        if let Some(init) = &kernel.callbacks().init {
            let name = self.name();
            let params = self.params();
            init(&self.kernel_args(&name, &params, 0))?;
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn deinitialize(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let kernel = self.kernel();
        if let Some(deinit) = &kernel.callbacks().deinit {
            let name = self.name();
            let params = self.params();
            if let Err(err) = deinit(&self.kernel_args(&name, &params, 0)) {
                tracing::warn!(node = %name, error = %err, "kernel deinit failed");
            }
        }
    }

    /// Runs the kernel on `params` inside the perf bracket and records the
    /// outcome as the node status.
    pub(crate) fn execute(&self, params: &[Option<DataRef>], frame: u64) -> Result<()> {
        let kernel = self.kernel();
        let name = self.name();
        lock(&self.perf).start();
        let result = (kernel.callbacks().run)(&self.kernel_args(&name, params, frame));
        lock(&self.perf).end();
        match result {
            Ok(()) => {
                self.set_status(NodeStatus::Success);
                Ok(())
            },
            Err(err) => {
                tracing::error!(node = %name, frame, error = %err, "kernel run failed");
                self.set_status(NodeStatus::Failed { status: err.status(), message: err.to_string() });
                Err(VisionError::kernel(name, err.to_string()))
            },
        }
    }
}

/// Whether an object of `actual` type may be bound where `expected` is declared.
fn check_param_type(expected: ReferenceType, data: &DataRef) -> Result<()> {
    let actual = data.reference_type();
    if actual == expected {
        return Ok(());
    }
    if let ReferenceType::Value(subtype) = expected {
        if actual == ReferenceType::Scalar && data.shape().as_scalar().map(|s| s.data_type) == Some(subtype) {
            return Ok(());
        }
    }
    Err(VisionError::InvalidType(format!("expected {expected}, got {actual} ({})", data.name())))
}

impl Context {
    /// Creates a node running `kernel` in `graph`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` for an unfinalized kernel and `InvalidGraph`
    /// while the graph is running.
    pub fn create_generic_node(&self, graph: Handle, kernel: Handle) -> Result<Handle> {
        let parent = self.graph(graph)?;
        if parent.state().is_working() {
            return Err(VisionError::InvalidGraph(format!("{} is running", parent.name())));
        }
        let kernel_ref = self.kernel(kernel)?;
        if !kernel_ref.is_finalized() {
            return Err(VisionError::InvalidReference(format!("kernel {} is not finalized", kernel_ref.name())));
        }
        let (handle, node) = self.register(
            RefKind::External,
            |handle| Arc::new(Node::new(handle, graph, kernel, kernel_ref)),
            Object::Node,
        )?;
        self.retain_internal(kernel, handle)?;
        self.retain_internal(handle, graph)?;
        tracing::debug!(node = %node.name(), graph = %parent.name(), "node created");
        parent.add_node(node);
        Ok(handle)
    }

    /// Binds `value` to parameter `index` of `node`, or unbinds it with `None`.
    ///
    /// # Errors
    ///
    /// - `InvalidValue`: `index` is past the kernel signature
    /// - `InvalidType`: the object's type does not match the signature
    /// - `InvalidParameters`: unbinding a required parameter
    /// - `InvalidGraph`: the graph is running
    pub fn set_parameter_by_index(&self, node: Handle, index: u32, value: Option<Handle>) -> Result<()> {
        let node = self.node(node)?;
        let result = self.set_parameter(&node, index, value);
        self.track(node.header().id(), result)
    }

    fn set_parameter(&self, node: &Arc<Node>, index: u32, value: Option<Handle>) -> Result<()> {
        let graph = self.graph(node.graph())?;
        if graph.state().is_working() {
            return Err(VisionError::InvalidGraph(format!("{} is running", graph.name())));
        }
        let kernel = node.kernel();
        let param = kernel.param(index).ok_or_else(|| {
            VisionError::InvalidValue(format!("{} has no parameter {index}", kernel.name()))
        })?;
        let data = match value {
            Some(handle) => {
                let data = self.data(handle)?;
                check_param_type(param.ty, &data)?;
                Some(data)
            },
            None if param.state == visionflow_core::ParamState::Required && node.param(index).is_some() => {
                return Err(VisionError::InvalidParameters(format!(
                    "parameter {index} of {} is required",
                    node.name()
                )));
            },
            None => None,
        };
        self.bind(node, index, data)?;
        graph.invalidate();
        Ok(())
    }

    /// The object bound at `index`, if any. No count is added.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` past the kernel signature.
    pub fn get_parameter_by_index(&self, node: Handle, index: u32) -> Result<Option<Handle>> {
        let node = self.node(node)?;
        if index as usize >= node.kernel().num_params() {
            return Err(VisionError::InvalidValue(format!("{} has no parameter {index}", node.name())));
        }
        Ok(node.param(index).map(|data| data.handle()))
    }

    /// Moves parameter `index` of `node` to `data`, fixing counts, connection
    /// lists and delay associations. Does not invalidate the graph.
    pub(crate) fn bind(&self, node: &Arc<Node>, index: u32, data: Option<DataRef>) -> Result<()> {
        let direction = node
            .kernel()
            .param(index)
            .map(|p| p.direction)
            .ok_or_else(|| VisionError::InvalidValue(format!("{} has no parameter {index}", node.name())))?;
        if let (Some(new), Some(current)) = (&data, node.param(index)) {
            if Arc::ptr_eq(new, &current) {
                return Ok(());
            }
        }
        if let Some(new) = &data {
            self.link(node, index, direction, new)?;
        }
        if let Some(old) = node.replace_param(index, data) {
            self.unlink(node, index, &old);
        }
        Ok(())
    }

    fn link(&self, node: &Node, index: u32, direction: Direction, data: &DataRef) -> Result<()> {
        let holder = node.handle();
        self.retain_internal(data.handle(), holder)?;
        if let Some(membership) = data.delay_membership() {
            let retained = self
                .delay(membership.delay)
                .and_then(|delay| self.retain_internal(membership.delay, holder).map(|()| delay));
            match retained {
                Ok(delay) => delay.add_association(membership.slot, Connection { node: holder, index }),
                Err(err) => {
                    self.release_logged(data.handle(), holder);
                    return Err(err);
                },
            }
        }
        data.connect(node.graph(), holder, index, direction);
        Ok(())
    }

    fn unlink(&self, node: &Node, index: u32, data: &DataRef) {
        let holder = node.handle();
        data.disconnect(node.graph(), holder, index);
        if let Some(membership) = data.delay_membership() {
            if let Ok(delay) = self.delay(membership.delay) {
                delay.remove_association(membership.slot, Connection { node: holder, index });
            }
            self.release_logged(membership.delay, holder);
        }
        self.release_logged(data.handle(), holder);
    }

    pub(crate) fn release_logged(&self, handle: Handle, holder: Handle) {
        if let Err(err) = self.release_internal(handle, holder) {
            tracing::error!(%handle, %holder, error = %err, "internal release failed");
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `node` is a node.
    pub fn query_node(&self, node: Handle) -> Result<NodeInfo> {
        let node = self.node(node)?;
        let kernel = node.kernel();
        Ok(NodeInfo {
            name: node.name(),
            kernel: kernel.name().to_string(),
            target: kernel.target().to_string(),
            status: node.status(),
            perf: node.perf(),
            local_data_size: node.local_data_size(),
            border: node.border(),
            num_params: kernel.num_params(),
            has_child_graph: node.child_graph().is_some(),
        })
    }

    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running.
    pub fn set_node_border_mode(&self, node: Handle, border: BorderMode) -> Result<()> {
        let node = self.node(node)?;
        self.graph_idle(node.graph())?;
        *lock(&node.border) = border;
        Ok(())
    }

    /// Overrides the kernel's local data size for this node. Takes effect at
    /// the next verification.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running.
    pub fn set_node_local_data_size(&self, node: Handle, size: usize) -> Result<()> {
        let node = self.node(node)?;
        let graph = self.graph_idle(node.graph())?;
        *lock(&node.local_data_size) = Some(size);
        graph.invalidate();
        Ok(())
    }

    /// Copies the node's local data out.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` unless `node` is a node.
    pub fn node_local_data(&self, node: Handle) -> Result<Vec<u8>> {
        Ok(lock(&self.node(node)?.local_data).clone())
    }

    /// Installs the completion callback; `None` removes it.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` when a callback is already installed.
    pub fn assign_node_callback(&self, node: Handle, callback: Option<NodeCallback>) -> Result<()> {
        let node = self.node(node)?;
        let mut slot = lock(&node.callback);
        match callback {
            Some(_) if slot.is_some() => {
                Err(VisionError::NotSupported(format!("{} already has a callback", node.name())))
            },
            callback => {
                *slot = callback;
                Ok(())
            },
        }
    }

    /// Moves `node` to a kernel with the same enumeration on another target.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the target lacks the kernel or its signature
    /// differs, and `InvalidGraph` while the graph is running.
    pub fn set_node_target(&self, node: Handle, target: &Target) -> Result<()> {
        let node = self.node(node)?;
        let graph = self.graph_idle(node.graph())?;
        let current = node.kernel();
        let (handle, kernel) = match target {
            Target::Any => {
                let handle = self.get_kernel_by_enum(current.enumeration())?;
                (handle, self.kernel(handle)?)
            },
            Target::Named(name) => self.kernel_in_target(name, current.enumeration()).ok_or_else(|| {
                VisionError::NotSupported(format!("target '{name}' has no kernel {}", current.enumeration()))
            })?,
        };
        if handle == node.kernel_handle() {
            return Ok(());
        }
        if kernel.signature() != current.signature() {
            return Err(VisionError::NotSupported(format!(
                "{} and {} have different signatures",
                kernel.name(),
                current.name()
            )));
        }
        node.deinitialize();
        self.retain_internal(handle, node.handle())?;
        let previous = node.set_kernel(handle, kernel);
        self.release_logged(previous, node.handle());
        graph.invalidate();
        Ok(())
    }

    /// Makes `node` execute `child` instead of its kernel. The child graph's
    /// declared parameters must mirror the kernel signature.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` for the node's own graph or a mismatching
    /// parameter list, `InvalidType` for a mismatching parameter.
    pub fn set_child_graph_of_node(&self, node: Handle, child: Handle) -> Result<()> {
        let node = self.node(node)?;
        let graph = self.graph_idle(node.graph())?;
        if child == node.graph() {
            return Err(VisionError::InvalidGraph("a graph cannot be its own child".into()));
        }
        let child_graph = self.graph(child)?;
        let signature = node.kernel().signature();
        let params = child_graph.params();
        if params.len() != signature.len() {
            return Err(VisionError::InvalidGraph(format!(
                "{} declares {} parameters, kernel has {}",
                child_graph.name(),
                params.len(),
                signature.len()
            )));
        }
        for (index, (connection, expected)) in params.iter().zip(&signature).enumerate() {
            let inner = self.node(connection.node)?;
            let declared = inner.kernel().param(connection.index);
            if declared != Some(*expected) {
                return Err(VisionError::InvalidType(format!(
                    "parameter {index} of {} does not match the kernel signature",
                    child_graph.name()
                )));
            }
        }
        self.retain_internal(child, node.handle())?;
        let previous = lock(&node.child_graph).replace(child_graph);
        if let Some(previous) = previous {
            self.release_logged(previous.handle(), node.handle());
        }
        graph.invalidate();
        Ok(())
    }

    /// Removes `node` from its graph and drops the caller's count on it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` while the graph is running.
    pub fn remove_node(&self, node: Handle) -> Result<()> {
        let node = self.node(node)?;
        let graph = self.graph_idle(node.graph())?;
        if !graph.remove_node(node.handle()) {
            return Err(VisionError::InvalidNode(format!("{} is not part of {}", node.name(), graph.name())));
        }
        self.unbind_all(&node);
        let has_external = node.header().external_count() > 0;
        self.release_logged(node.handle(), graph.handle());
        if has_external {
            self.release_reference(node.handle())?;
        }
        Ok(())
    }

    fn unbind_all(&self, node: &Arc<Node>) {
        for index in 0..u32::try_from(node.kernel().num_params()).unwrap_or(0) {
            if let Err(err) = self.bind(node, index, None) {
                tracing::error!(node = %node.name(), index, error = %err, "unbinding failed");
            }
        }
    }

    pub(crate) fn destroy_node(&self, node: &Arc<Node>) {
        node.deinitialize();
        self.unbind_all(node);
        self.release_logged(node.kernel_handle(), node.handle());
        if let Some(child) = lock(&node.child_graph).take() {
            self.release_logged(child.handle(), node.handle());
        }
    }

    /// The graph, provided it is not running.
    pub(crate) fn graph_idle(&self, graph: Handle) -> Result<Arc<Graph>> {
        let graph = self.graph(graph)?;
        if graph.state().is_working() {
            return Err(VisionError::InvalidGraph(format!("{} is running", graph.name())));
        }
        Ok(graph)
    }
}
