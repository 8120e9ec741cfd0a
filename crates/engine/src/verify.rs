// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graph verification.
//!
//! Verification turns a set of nodes into a [`Plan`]:
//!
//! 1. every required parameter is bound;
//! 2. nodes are sorted so each runs after every writer of what it reads;
//! 3. no two parameters write overlapping storage;
//! 4. kernels validate their inputs and declare their outputs, which fixes
//!    the shape of virtual objects;
//! 5. nodes are grouped into subgraphs (runs of nodes on one target);
//! 6. resources are chosen and allocated for the execution mode;
//! 7. kernels are initialized.
//!
//! Any failure leaves the graph unverified.

use crate::context::Context;
use crate::graph::Graph;
use crate::node::Node;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use visionflow_core::{
    DataObject, DataRef, Direction, ExecMode, Handle, Meta, NodeStatus, ParamState, ResourceKind, Result,
    VisionError,
};

/// Maximum number of producers one subgraph may wait on.
pub(crate) const MAX_SUBGRAPH_SOURCES: usize = 64;

/// Where a subgraph's input for a frame comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Source {
    Subgraph(usize),
    InputQueue(Handle),
}

/// A run of consecutive nodes on the same target.
#[derive(Debug)]
pub(crate) struct Subgraph {
    pub(crate) index: usize,
    pub(crate) target: String,
    pub(crate) nodes: Vec<Arc<Node>>,
    /// One bit of the per-frame ready mask each.
    pub(crate) sources: Vec<Source>,
    /// `(subgraph, bit)` to notify when a frame is done.
    pub(crate) consumers: Vec<(usize, usize)>,
    /// Objects written here and the number of other subgraphs reading them.
    pub(crate) writes: Vec<(DataRef, u32)>,
    /// Objects produced elsewhere (or queued by the application) and read here.
    pub(crate) reads: Vec<DataRef>,
}

/// Result of a successful verification.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) sorted: Vec<Arc<Node>>,
    pub(crate) subgraphs: Vec<Subgraph>,
    /// Every object bound in the graph, in first-use order.
    pub(crate) objects: Vec<DataRef>,
    /// Objects read but never written in the graph.
    pub(crate) headers: Vec<Handle>,
    /// Objects written but never read in the graph.
    pub(crate) footers: Vec<Handle>,
}

impl Plan {
    pub(crate) fn input_queues(&self) -> impl Iterator<Item = &DataRef> {
        self.objects.iter().filter(|d| d.resource_kind() == ResourceKind::InputQueue)
    }

    pub(crate) fn output_queues(&self) -> impl Iterator<Item = &DataRef> {
        self.objects.iter().filter(|d| d.resource_kind() == ResourceKind::OutputQueue)
    }
}

/// Parameters of `node` as `(index, direction, object)`, bound ones only.
fn bound_params(node: &Node) -> Vec<(u32, Direction, DataRef)> {
    let kernel = node.kernel();
    node.params()
        .into_iter()
        .enumerate()
        .filter_map(|(i, data)| {
            let index = u32::try_from(i).ok()?;
            Some((index, kernel.param(index)?.direction, data?))
        })
        .collect()
}

impl Context {
    /// Verifies `graph`, preparing it for execution in its current mode.
    ///
    /// # Errors
    ///
    /// - `InvalidGraph`: the graph is empty, running, cyclic, or uses an
    ///   object the execution mode cannot back
    /// - `NotSufficient`: a required parameter is unbound
    /// - `MultipleWriters`: two parameters write overlapping storage
    /// - `InvalidScope`: a virtual object is used outside its graph
    /// - any error reported by a kernel validator or initializer
    pub fn verify_graph(&self, graph: Handle) -> Result<()> {
        let graph = self.graph(graph)?;
        let result = self.verify(&graph, &[]);
        self.track(graph.header().id(), result)
    }

    /// Verifies `graph`, accepting virtual objects scoped to it or to any
    /// graph in `outer` (the parents of a child graph).
    pub(crate) fn verify(&self, graph: &Arc<Graph>, outer: &[Handle]) -> Result<()> {
        if graph.state().is_working() || graph.stream().is_some() {
            return Err(VisionError::InvalidGraph(format!("{} is running", graph.name())));
        }
        graph.invalidate();
        let mut scopes = outer.to_vec();
        scopes.push(graph.handle());
        match self.build_plan(graph, &scopes) {
            Ok(plan) => {
                tracing::info!(
                    graph = %graph.name(),
                    nodes = plan.sorted.len(),
                    subgraphs = plan.subgraphs.len(),
                    mode = ?graph.exec_mode(),
                    "graph verified"
                );
                for node in &plan.sorted {
                    node.set_status(NodeStatus::Pending);
                }
                graph.set_plan(plan);
                self.metrics().verified(&graph.name(), true);
                Ok(())
            },
            Err(err) => {
                tracing::warn!(graph = %graph.name(), error = %err, "graph verification failed");
                graph.invalidate();
                self.metrics().verified(&graph.name(), false);
                Err(err)
            },
        }
    }

    fn build_plan(&self, graph: &Arc<Graph>, scopes: &[Handle]) -> Result<Plan> {
        let nodes = graph.nodes();
        if nodes.is_empty() {
            return Err(VisionError::InvalidGraph(format!("{} has no nodes", graph.name())));
        }
        check_required(&nodes)?;
        let sorted = topological_sort(graph.handle(), &nodes)?;
        check_writers(&sorted)?;
        for node in &sorted {
            self.validate_node(graph, node, scopes)?;
        }
        let (objects, headers, footers) = classify(graph.handle(), &sorted);
        let subgraphs = partition(graph.handle(), &sorted, &headers)?;
        let plan = Plan { sorted, subgraphs, objects, headers, footers };
        match graph.exec_mode() {
            ExecMode::Normal => self.allocate_normal(graph, &plan)?,
            ExecMode::Stream => self.allocate_stream(graph, &plan)?,
        }
        for node in plan.sorted.iter().filter(|n| n.child_graph().is_none()) {
            node.initialize()?;
        }
        Ok(plan)
    }

    /// Input validation and output meta inference for one node. A node
    /// running a child graph hands its parameters to the child and verifies it.
    fn validate_node(&self, graph: &Graph, node: &Arc<Node>, scopes: &[Handle]) -> Result<()> {
        if let Some(child) = node.child_graph() {
            for (index, connection) in child.params().iter().enumerate() {
                let inner = self.node(connection.node)?;
                let value = u32::try_from(index).ok().and_then(|i| node.param(i));
                self.bind(&inner, connection.index, value)?;
            }
            return self.verify(&child, scopes);
        }

        let kernel = node.kernel();
        let name = node.name();
        let params = node.params();
        let args = node.kernel_args(&name, &params, 0);
        let callbacks = kernel.callbacks();
        for (index, direction, data) in bound_params(node) {
            if direction == Direction::Output {
                continue;
            }
            if data.is_virtual()
                && data.header().scope() == Some(graph.handle())
                && data.indirect_writer_count(graph.handle()) == 0
            {
                return Err(VisionError::InvalidGraph(format!(
                    "{name} reads virtual {} which nothing writes",
                    data.name()
                )));
            }
            if let Some(validate) = &callbacks.input_validate {
                validate(&args, index)?;
            }
        }
        for (index, direction, data) in bound_params(node) {
            if direction != Direction::Output {
                continue;
            }
            if let Some(scope) = data.header().scope() {
                if data.is_virtual() && !scopes.contains(&scope) {
                    return Err(VisionError::InvalidScope(format!(
                        "{} belongs to another graph than {}",
                        data.name(),
                        graph.name()
                    )));
                }
            }
            let ty = kernel.param(index).map_or(data.reference_type(), |p| p.ty);
            let mut meta = Meta::new(ty);
            if let Some(validate) = &callbacks.output_validate {
                validate(&args, index, &mut meta)?;
            }
            data.verify_meta(&meta)?;
        }
        Ok(())
    }

    fn allocate_normal(&self, graph: &Graph, plan: &Plan) -> Result<()> {
        let mut objects: Vec<DataRef> = plan.objects.clone();
        for data in &plan.objects {
            if data.is_queue() {
                return Err(VisionError::InvalidGraph(format!(
                    "queue object {} needs streaming execution",
                    data.name()
                )));
            }
            if let Some(membership) = data.delay_membership() {
                objects.extend(self.delay(membership.delay)?.slots().iter().cloned());
            }
        }
        for data in &objects {
            let kind = data.resource_kind();
            if kind != ResourceKind::None && kind != ResourceKind::Solid {
                if data.header().scope() != Some(graph.handle()) {
                    return Err(VisionError::InvalidGraph(format!(
                        "{} is backed by a {kind:?} resource of another graph",
                        data.name()
                    )));
                }
                data.free_resources(self.allocator());
            }
            data.allocate_solid(self.allocator())?;
        }
        Ok(())
    }

    fn allocate_stream(&self, graph: &Graph, plan: &Plan) -> Result<()> {
        if let Some(node) = plan.sorted.iter().find(|n| n.child_graph().is_some()) {
            return Err(VisionError::NotSupported(format!(
                "{} runs a child graph, which streaming does not support",
                node.name()
            )));
        }
        let config = self.config();
        for data in &plan.objects {
            if data.delay_membership().is_some() {
                return Err(VisionError::InvalidGraph(format!(
                    "delay slot {} cannot be used in a streaming graph",
                    data.name()
                )));
            }
            let wanted = if data.is_virtual() {
                if data.view().is_some() || !data.allies().is_empty() {
                    return Err(VisionError::InvalidGraph(format!(
                        "virtual {} shares storage, which streaming does not support",
                        data.name()
                    )));
                }
                ResourceKind::Slot
            } else if data.is_queue() {
                if plan.headers.contains(&data.handle()) {
                    ResourceKind::InputQueue
                } else if plan.footers.contains(&data.handle()) {
                    ResourceKind::OutputQueue
                } else {
                    return Err(VisionError::InvalidGraph(format!(
                        "queue object {} is both read and written inside {}",
                        data.name(),
                        graph.name()
                    )));
                }
            } else if plan.headers.contains(&data.handle()) {
                ResourceKind::Solid
            } else {
                return Err(VisionError::InvalidGraph(format!(
                    "{} is written by {}; streaming outputs must be virtual or queue objects",
                    data.name(),
                    graph.name()
                )));
            };

            let current = data.resource_kind();
            if current != ResourceKind::None && current != wanted {
                if data.header().scope() != Some(graph.handle()) {
                    return Err(VisionError::InvalidGraph(format!(
                        "{} is already backed by a {current:?} resource",
                        data.name()
                    )));
                }
                data.free_resources(self.allocator());
            }
            match wanted {
                ResourceKind::Slot => data.allocate_slots(self.allocator(), config.slot_num)?,
                ResourceKind::InputQueue => data.setup_input_queue(config.queue_capacity),
                ResourceKind::OutputQueue => {
                    data.setup_output_queue(self.allocator(), config.queue_capacity, config.slot_num)?;
                },
                ResourceKind::Solid | ResourceKind::None => data.allocate_solid(self.allocator())?,
            }
        }
        Ok(())
    }
}

fn check_required(nodes: &[Arc<Node>]) -> Result<()> {
    for node in nodes {
        let kernel = node.kernel();
        for (index, param) in kernel.signature().iter().enumerate() {
            let bound = u32::try_from(index).ok().and_then(|i| node.param(i)).is_some();
            if param.state == ParamState::Required && !bound {
                return Err(VisionError::NotSufficient(format!(
                    "required parameter {index} of {} is unbound",
                    node.name()
                )));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm. Each node waits for one decrement per writer of each
/// object it reads (allies included); ready nodes are taken in insertion
/// order, so the result is deterministic.
pub(crate) fn topological_sort(graph: Handle, nodes: &[Arc<Node>]) -> Result<Vec<Arc<Node>>> {
    let mut pending: IndexMap<Handle, usize> = nodes
        .iter()
        .map(|node| {
            let waits = bound_params(node)
                .iter()
                .filter(|(_, direction, _)| *direction == Direction::Input)
                .map(|(_, _, data)| data.indirect_writer_count(graph))
                .sum();
            (node.handle(), waits)
        })
        .collect();

    let mut sorted: Vec<Arc<Node>> = Vec::with_capacity(nodes.len());
    let mut done = vec![false; nodes.len()];
    loop {
        let mut progressed = false;
        for (position, node) in nodes.iter().enumerate() {
            if done[position] || pending.get(&node.handle()).copied().unwrap_or(0) > 0 {
                continue;
            }
            done[position] = true;
            progressed = true;
            for (_, direction, data) in bound_params(node) {
                if !direction.writes() {
                    continue;
                }
                for reader in data.indirect_readers(graph) {
                    if let Some(count) = pending.get_mut(&reader.node) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            sorted.push(Arc::clone(node));
        }
        if sorted.len() == nodes.len() {
            return Ok(sorted);
        }
        if !progressed {
            let stuck: Vec<String> =
                nodes.iter().zip(&done).filter(|(_, d)| !**d).map(|(n, _)| n.name()).collect();
            return Err(VisionError::InvalidGraph(format!("cycle through {}", stuck.join(", "))));
        }
    }
}

fn check_writers(nodes: &[Arc<Node>]) -> Result<()> {
    let written: Vec<(String, u32, DataRef)> = nodes
        .iter()
        .flat_map(|node| {
            let name = node.name();
            bound_params(node)
                .into_iter()
                .filter(|(_, direction, _)| direction.writes())
                .map(move |(index, _, data)| (name.clone(), index, data))
        })
        .collect();
    for (i, (node_a, index_a, a)) in written.iter().enumerate() {
        for (node_b, index_b, b) in &written[i + 1..] {
            if DataObject::check_write_dependency(a, b) {
                return Err(VisionError::MultipleWriters(format!(
                    "{node_a}[{index_a}] writes {} and {node_b}[{index_b}] writes {}",
                    a.name(),
                    b.name()
                )));
            }
        }
    }
    Ok(())
}

/// Every bound object in first-use order, with the headers (read, never
/// written) and footers (written, never read).
fn classify(graph: Handle, sorted: &[Arc<Node>]) -> (Vec<DataRef>, Vec<Handle>, Vec<Handle>) {
    let mut objects: IndexMap<Handle, DataRef> = IndexMap::new();
    for node in sorted {
        for (_, _, data) in bound_params(node) {
            objects.entry(data.handle()).or_insert(data);
        }
    }
    let mut headers = Vec::new();
    let mut footers = Vec::new();
    for (handle, data) in &objects {
        let writers = data.direct_writer_count(graph);
        let readers = data.direct_reader_count(graph);
        if writers == 0 && readers > 0 {
            headers.push(*handle);
        } else if writers > 0 && readers == 0 {
            footers.push(*handle);
        }
    }
    (objects.into_values().collect(), headers, footers)
}

/// Splits the sorted nodes into runs of equal target and wires the runs
/// together.
fn partition(graph: Handle, sorted: &[Arc<Node>], headers: &[Handle]) -> Result<Vec<Subgraph>> {
    let mut subgraphs: Vec<Subgraph> = Vec::new();
    let mut owner: IndexMap<Handle, usize> = IndexMap::new();
    for node in sorted {
        let target = node.target();
        let index = match subgraphs.last() {
            Some(last) if last.target == target => last.index,
            _ => {
                subgraphs.push(Subgraph {
                    index: subgraphs.len(),
                    target,
                    nodes: Vec::new(),
                    sources: Vec::new(),
                    consumers: Vec::new(),
                    writes: Vec::new(),
                    reads: Vec::new(),
                });
                subgraphs.len() - 1
            },
        };
        subgraphs[index].nodes.push(Arc::clone(node));
        owner.insert(node.handle(), index);
    }

    for index in 0..subgraphs.len() {
        let mut sources: IndexSet<Source> = IndexSet::new();
        let mut reads: IndexMap<Handle, DataRef> = IndexMap::new();
        let mut writes: IndexMap<Handle, DataRef> = IndexMap::new();
        for node in &subgraphs[index].nodes {
            for (_, direction, data) in bound_params(node) {
                if direction.writes() {
                    writes.entry(data.handle()).or_insert_with(|| data.clone());
                }
                if direction != Direction::Input {
                    continue;
                }
                if data.is_queue() && headers.contains(&data.handle()) {
                    sources.insert(Source::InputQueue(data.handle()));
                    reads.entry(data.handle()).or_insert(data);
                    continue;
                }
                let mut external = false;
                for writer in data.indirect_writers(graph) {
                    match owner.get(&writer.node) {
                        Some(&producer) if producer != index => {
                            sources.insert(Source::Subgraph(producer));
                            external = true;
                        },
                        _ => {},
                    }
                }
                if external {
                    reads.entry(data.handle()).or_insert(data);
                }
            }
        }
        if sources.len() > MAX_SUBGRAPH_SOURCES {
            return Err(VisionError::NotSupported(format!(
                "subgraph {index} waits on {} producers, at most {MAX_SUBGRAPH_SOURCES} are supported",
                sources.len()
            )));
        }
        let writes = writes
            .into_values()
            .map(|data| {
                let demand: IndexSet<usize> = data
                    .readers(graph)
                    .iter()
                    .filter_map(|reader| owner.get(&reader.node).copied())
                    .filter(|&consumer| consumer != index)
                    .collect();
                (data, u32::try_from(demand.len()).unwrap_or(u32::MAX))
            })
            .collect();
        let subgraph = &mut subgraphs[index];
        subgraph.sources = sources.into_iter().collect();
        subgraph.reads = reads.into_values().collect();
        subgraph.writes = writes;
    }

    for consumer in 0..subgraphs.len() {
        let wired: Vec<(usize, usize)> = subgraphs[consumer]
            .sources
            .iter()
            .enumerate()
            .filter_map(|(bit, source)| match source {
                Source::Subgraph(producer) => Some((*producer, bit)),
                Source::InputQueue(_) => None,
            })
            .collect();
        for (producer, bit) in wired {
            subgraphs[producer].consumers.push((consumer, bit));
        }
    }
    Ok(subgraphs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use visionflow_core::{DfImage, KernelCallbacks, Rectangle, ReferenceType, Status};

    /// A context with `cpu.copy` (image in, image out) that sizes its
    /// output like its input.
    fn context() -> (Context, Handle) {
        let context = Context::new();
        let callbacks = KernelCallbacks::new(|_| Ok(())).with_output_validate(|args, _, meta| {
            let input = args.param(0)?.shape();
            meta.set_shape(input);
            Ok(())
        });
        let kernel = context.add_kernel(1, "cpu.copy", 2, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Input, ReferenceType::Image, ParamState::Required).unwrap();
        context.add_parameter_to_kernel(kernel, 1, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        (context, kernel)
    }

    fn copy(context: &Context, graph: Handle, kernel: Handle, from: Handle, to: Handle) -> Handle {
        let node = context.create_generic_node(graph, kernel).unwrap();
        context.set_parameter_by_index(node, 0, Some(from)).unwrap();
        context.set_parameter_by_index(node, 1, Some(to)).unwrap();
        node
    }

    #[test]
    fn test_sort_follows_data_not_insertion() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let input = context.create_image(16, 16, DfImage::U8).unwrap();
        let middle = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        let output = context.create_image(16, 16, DfImage::U8).unwrap();
        let second = copy(&context, graph, kernel, middle, output);
        let first = copy(&context, graph, kernel, input, middle);

        context.verify_graph(graph).unwrap();
        let plan = context.graph(graph).unwrap().plan().unwrap();
        let order: Vec<Handle> = plan.sorted.iter().map(|n| n.handle()).collect();
        assert_eq!(order, vec![first, second]);
        assert_eq!(plan.headers, vec![input]);
        assert_eq!(plan.footers, vec![output]);

        let inferred = context.query_data(middle).unwrap();
        assert_eq!(inferred.shape.as_image().map(|s| (s.width, s.height, s.format)), Some((16, 16, DfImage::U8)));
    }

    #[test]
    fn test_cycle_rejected() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let a = context.create_image(8, 8, DfImage::U8).unwrap();
        let b = context.create_image(8, 8, DfImage::U8).unwrap();
        copy(&context, graph, kernel, a, b);
        copy(&context, graph, kernel, b, a);
        let err = context.verify_graph(graph).unwrap_err();
        assert_eq!(err.status(), Status::InvalidGraph);
        assert!(!context.is_graph_verified(graph).unwrap());
    }

    #[test]
    fn test_unbound_required_parameter() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let node = context.create_generic_node(graph, kernel).unwrap();
        let image = context.create_image(8, 8, DfImage::U8).unwrap();
        context.set_parameter_by_index(node, 0, Some(image)).unwrap();
        assert!(matches!(context.verify_graph(graph), Err(VisionError::NotSufficient(_))));
    }

    #[test]
    fn test_two_writers_of_one_object() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let a = context.create_image(8, 8, DfImage::U8).unwrap();
        let b = context.create_image(8, 8, DfImage::U8).unwrap();
        let out = context.create_image(8, 8, DfImage::U8).unwrap();
        copy(&context, graph, kernel, a, out);
        copy(&context, graph, kernel, b, out);
        assert!(matches!(context.verify_graph(graph), Err(VisionError::MultipleWriters(_))));
    }

    #[test]
    fn test_overlapping_regions_are_multiple_writers() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let source = context.create_image(8, 8, DfImage::U8).unwrap();
        let canvas = context.create_image(16, 16, DfImage::U8).unwrap();
        let left = context.create_image_from_roi(canvas, Rectangle::new(0, 0, 8, 8)).unwrap();
        let overlap = context.create_image_from_roi(canvas, Rectangle::new(4, 4, 12, 12)).unwrap();
        copy(&context, graph, kernel, source, left);
        copy(&context, graph, kernel, source, overlap);
        assert!(matches!(context.verify_graph(graph), Err(VisionError::MultipleWriters(_))));
    }

    #[test]
    fn test_disjoint_regions_verify() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let source = context.create_image(8, 8, DfImage::U8).unwrap();
        let canvas = context.create_image(16, 8, DfImage::U8).unwrap();
        let left = context.create_image_from_roi(canvas, Rectangle::new(0, 0, 8, 8)).unwrap();
        let right = context.create_image_from_roi(canvas, Rectangle::new(8, 0, 16, 8)).unwrap();
        copy(&context, graph, kernel, source, left);
        copy(&context, graph, kernel, source, right);
        context.verify_graph(graph).unwrap();
    }

    #[test]
    fn test_reader_of_region_waits_for_parent_writer() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let source = context.create_image(16, 16, DfImage::U8).unwrap();
        let canvas = context.create_image(16, 16, DfImage::U8).unwrap();
        let corner = context.create_image_from_roi(canvas, Rectangle::new(0, 0, 8, 8)).unwrap();
        let sink = context.create_image(8, 8, DfImage::U8).unwrap();
        let reader = copy(&context, graph, kernel, corner, sink);
        let writer = copy(&context, graph, kernel, source, canvas);
        context.verify_graph(graph).unwrap();
        let plan = context.graph(graph).unwrap().plan().unwrap();
        let order: Vec<Handle> = plan.sorted.iter().map(|n| n.handle()).collect();
        assert_eq!(order, vec![writer, reader]);
    }

    #[test]
    fn test_virtual_from_other_graph_is_scope_error() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let other = context.create_graph().unwrap();
        let input = context.create_image(8, 8, DfImage::U8).unwrap();
        let foreign = context.create_virtual_image(other, 0, 0, DfImage::Virt).unwrap();
        copy(&context, graph, kernel, input, foreign);
        assert!(matches!(context.verify_graph(graph), Err(VisionError::InvalidScope(_))));
    }

    #[test]
    fn test_unwritten_virtual_input_rejected() {
        let (context, kernel) = context();
        let graph = context.create_graph().unwrap();
        let virt = context.create_virtual_image(graph, 8, 8, DfImage::U8).unwrap();
        let output = context.create_image(8, 8, DfImage::U8).unwrap();
        copy(&context, graph, kernel, virt, output);
        assert!(matches!(context.verify_graph(graph), Err(VisionError::InvalidGraph(_))));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let context = Context::new();
        let graph = context.create_graph().unwrap();
        assert!(matches!(context.verify_graph(graph), Err(VisionError::InvalidGraph(_))));
    }

    #[test]
    fn test_subgraphs_split_on_target() {
        let (context, cpu) = context();
        let callbacks = KernelCallbacks::new(|_| Ok(())).with_output_validate(|args, _, meta| {
            meta.set_shape(args.param(0)?.shape());
            Ok(())
        });
        let gpu = context.add_kernel(1, "gpu.copy", 2, callbacks).unwrap();
        context.add_parameter_to_kernel(gpu, 0, Direction::Input, ReferenceType::Image, ParamState::Required).unwrap();
        context.add_parameter_to_kernel(gpu, 1, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(gpu).unwrap();

        let graph = context.create_graph().unwrap();
        let input = context.create_image(8, 8, DfImage::U8).unwrap();
        let a = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        let b = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        let output = context.create_image(8, 8, DfImage::U8).unwrap();
        copy(&context, graph, cpu, input, a);
        copy(&context, graph, gpu, a, b);
        copy(&context, graph, cpu, b, output);
        context.verify_graph(graph).unwrap();

        let plan = context.graph(graph).unwrap().plan().unwrap();
        let targets: Vec<&str> = plan.subgraphs.iter().map(|s| s.target.as_str()).collect();
        assert_eq!(targets, vec!["cpu", "gpu", "cpu"]);
        assert!(plan.subgraphs[0].sources.is_empty());
        assert_eq!(plan.subgraphs[1].sources, vec![Source::Subgraph(0)]);
        assert_eq!(plan.subgraphs[0].consumers, vec![(1, 0)]);
        assert_eq!(plan.subgraphs[0].writes.iter().map(|(d, n)| (d.handle(), *n)).collect::<Vec<_>>(), vec![(a, 1)]);
    }
}
