// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipelined execution of streaming graphs.
//!
//! Scheduling a streaming graph spawns one tokio task per subgraph, a
//! schedule task and an error task. A subgraph runs frame `n` once each of
//! its sources has reported `n`:
//!
//! - a producer subgraph sends a [`DoneEvent`] after publishing its slots;
//! - the schedule task sends one per buffer pushed into an input queue;
//! - subgraphs without sources are released by the schedule task directly.
//!
//! Subgraphs may work on different frames at the same time. A producer
//! waits for a free slot before writing, so the depth of the slot rings
//! bounds how far ahead it can run.
//!
//! Stopping cancels every task and joins it with a bounded wait.

use crate::context::Context;
use crate::graph::Graph;
use crate::messages::{DoneEvent, Progress, ScheduleMessage, StreamFailure, Trigger};
use crate::node::Node;
use crate::verify::{Plan, Source, Subgraph};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use visionflow_core::perf::{now_ns, FrameStamp};
use visionflow_core::resource_manager::Acquired;
use visionflow_core::{
    CallbackAction, DataObject, DataRef, ExecMode, GraphState, Handle, InputQueueManager, Memory,
    NodeStatus, OutputQueueManager, ResourceKind, Result, SlotManager, VisionError,
};

/// Grace period for a task that ignored cancellation and was aborted.
const ABORT_GRACE: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A buffer handed back to the application by [`Context::pop_image`].
#[derive(Debug)]
pub struct PoppedImage {
    /// Clone index the buffer was bound to while queued.
    pub index: usize,
    /// `false` if the frame failed somewhere upstream.
    pub valid: bool,
    pub memory: Memory,
}

/// State shared by the tasks of one stream and the application side.
pub(crate) struct StreamShared {
    progress: watch::Sender<Progress>,
    failure: Mutex<Option<StreamFailure>>,
    /// Sink subgraphs that finished each in-flight frame.
    finished: Mutex<IndexMap<u64, usize>>,
    sinks: usize,
    /// Release time of each in-flight frame.
    released: Mutex<IndexMap<u64, u64>>,
    /// Next frame id of each input queue.
    next_frames: Mutex<IndexMap<Handle, u64>>,
    /// `(subgraph, bit)` fed by each input queue.
    queue_consumers: IndexMap<Handle, Vec<(usize, usize)>>,
}

impl StreamShared {
    fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    fn submit(&self, frame: u64) {
        self.progress.send_modify(|p| p.submitted = p.submitted.max(frame));
    }

    fn complete(&self) -> Progress {
        self.progress.send_modify(|p| p.completed += 1);
        self.progress()
    }

    /// Counts one sink finishing `frame`; `true` once all of them have.
    fn sink_finished(&self, frame: u64) -> bool {
        let mut finished = lock(&self.finished);
        let count = finished.entry(frame).or_insert(0);
        *count += 1;
        if *count < self.sinks {
            return false;
        }
        finished.shift_remove(&frame);
        true
    }

    fn record_failure(&self, failure: StreamFailure) {
        lock(&self.failure).get_or_insert(failure);
    }

    fn take_failure(&self) -> Option<StreamFailure> {
        lock(&self.failure).take()
    }

    /// Whether frames enter through input queues rather than `schedule_graph`.
    fn queue_driven(&self) -> bool {
        !self.queue_consumers.is_empty()
    }
}

/// The tasks of a scheduled graph.
pub(crate) struct StreamRuntime {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    schedule_tx: mpsc::Sender<ScheduleMessage>,
    shared: Arc<StreamShared>,
}

impl StreamRuntime {
    fn spawn(context: &Context, graph: &Arc<Graph>, plan: &Plan) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VisionError::Runtime(format!("streaming needs a tokio runtime: {e}")))?;
        let config = context.config();
        let base = graph.frame_count();
        let ports = plan.subgraphs.iter().map(Ports::resolve).collect::<Result<Vec<_>>>()?;

        let mut queue_consumers: IndexMap<Handle, Vec<(usize, usize)>> = IndexMap::new();
        for subgraph in &plan.subgraphs {
            for (bit, source) in subgraph.sources.iter().enumerate() {
                if let Source::InputQueue(object) = source {
                    queue_consumers.entry(*object).or_default().push((subgraph.index, bit));
                }
            }
        }
        let (progress, _) = watch::channel(Progress { submitted: base, completed: base });
        let shared = Arc::new(StreamShared {
            progress,
            failure: Mutex::new(None),
            finished: Mutex::new(IndexMap::new()),
            sinks: plan.subgraphs.iter().filter(|s| s.consumers.is_empty()).count(),
            released: Mutex::new(IndexMap::new()),
            next_frames: Mutex::new(queue_consumers.keys().map(|h| (*h, base + 1)).collect()),
            queue_consumers,
        });

        let token = CancellationToken::new();
        let (events_tx, events_rx): (Vec<_>, Vec<_>) =
            plan.subgraphs.iter().map(|_| mpsc::channel::<DoneEvent>(config.done_event_capacity)).unzip();
        let (errors_tx, errors_rx) = mpsc::channel(config.error_queue_capacity);
        let (schedule_tx, schedule_rx) = mpsc::channel(config.schedule_queue_capacity);

        let mut tasks = Vec::with_capacity(plan.subgraphs.len() + 2);
        for ((subgraph, ports), events) in plan.subgraphs.iter().zip(ports).zip(events_rx) {
            let task = SubgraphTask {
                context: context.clone(),
                graph: Arc::clone(graph),
                shared: Arc::clone(&shared),
                index: subgraph.index,
                nodes: subgraph.nodes.clone(),
                ready: ready_mask(subgraph.sources.len()),
                ports,
                consumers: subgraph.consumers.iter().map(|&(c, bit)| (events_tx[c].clone(), bit)).collect(),
                errors: errors_tx.clone(),
                token: token.clone(),
                next: base + 1,
            };
            tasks.push(runtime.spawn(task.run(events)));
        }

        let scheduler = ScheduleTask {
            context: context.clone(),
            graph: Arc::clone(graph),
            shared: Arc::clone(&shared),
            roots: plan
                .subgraphs
                .iter()
                .filter(|s| s.sources.is_empty())
                .map(|s| events_tx[s.index].clone())
                .collect(),
            queues: shared
                .queue_consumers
                .iter()
                .map(|(object, consumers)| {
                    (*object, consumers.iter().map(|&(c, bit)| (events_tx[c].clone(), bit)).collect())
                })
                .collect(),
            token: token.clone(),
            released: base,
        };
        tasks.push(runtime.spawn(scheduler.run(schedule_rx)));
        tasks.push(runtime.spawn(report_errors(context.clone(), Arc::clone(graph), errors_rx, token.clone())));

        Ok(Self { token, tasks, schedule_tx, shared })
    }

    /// Cancels every task without waiting for it.
    pub(crate) fn abort(&self) {
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Cancels every task and waits up to `wait` for each to finish.
    async fn shutdown(self, wait: Duration, graph: &str) {
        self.token.cancel();
        let stops = self.tasks.into_iter().map(|mut task| async move {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                tracing::warn!(graph, ?wait, "stream task did not stop in time, aborting");
                task.abort();
                let _ = tokio::time::timeout(ABORT_GRACE, task).await;
            }
        });
        futures::future::join_all(stops).await;
    }
}

/// Mask with one bit per source; a sourceless subgraph waits for the announce bit.
const fn ready_mask(sources: usize) -> u64 {
    match sources {
        0 => 1,
        n if n >= 64 => u64::MAX,
        n => (1u64 << n) - 1,
    }
}

async fn deliver(tx: &mpsc::Sender<DoneEvent>, event: DoneEvent, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

enum Reader {
    Slot(Arc<SlotManager<DataRef>>),
    Queue(Arc<InputQueueManager<DataRef>>),
}

impl Reader {
    fn get(&self, frame: u64) -> Result<Acquired<DataRef>> {
        match self {
            Self::Slot(ring) => ring.get_filled_res(frame),
            Self::Queue(queue) => queue.get_filled_res(frame),
        }
    }

    fn put(&self, frame: u64) -> Result<()> {
        match self {
            Self::Slot(ring) => ring.put_filled_res(frame),
            Self::Queue(queue) => queue.put_filled_res(frame),
        }
    }
}

enum Writer {
    Slot(Arc<SlotManager<DataRef>>),
    Queue(Arc<OutputQueueManager<DataRef>>),
}

impl Writer {
    async fn acquire(&self, frame: u64) -> Acquired<DataRef> {
        match self {
            Self::Slot(ring) => ring.wait_and_get_empty_res_and_wr_lk(frame).await,
            Self::Queue(queue) => queue.wait_and_get_empty(frame).await,
        }
    }

    fn publish(&self, frame: u64, demand: u32, valid: bool) -> Result<()> {
        match self {
            Self::Slot(ring) => ring.set_filled_res_and_rd_lk(frame, demand, valid),
            Self::Queue(queue) => queue.set_filled_res(frame, valid),
        }
    }
}

/// Resource managers a subgraph reads from and writes to.
struct Ports {
    reads: Vec<(Handle, Reader)>,
    writes: Vec<(Handle, u32, Writer)>,
}

impl Ports {
    fn resolve(subgraph: &Subgraph) -> Result<Self> {
        let unbacked = |data: &DataRef| {
            VisionError::InvalidGraph(format!(
                "{} has no streaming resource (kind {:?})",
                data.name(),
                data.resource_kind()
            ))
        };
        let mut reads = Vec::with_capacity(subgraph.reads.len());
        for data in &subgraph.reads {
            let reader = match data.resource_kind() {
                ResourceKind::Slot => data.slot_manager().map(Reader::Slot),
                ResourceKind::InputQueue => data.input_queue().map(Reader::Queue),
                _ => None,
            };
            reads.push((data.handle(), reader.ok_or_else(|| unbacked(data))?));
        }
        let mut writes = Vec::with_capacity(subgraph.writes.len());
        for (data, demand) in &subgraph.writes {
            let writer = match data.resource_kind() {
                ResourceKind::Slot => data.slot_manager().map(Writer::Slot),
                ResourceKind::OutputQueue => data.output_queue().map(Writer::Queue),
                _ => None,
            };
            writes.push((data.handle(), *demand, writer.ok_or_else(|| unbacked(data))?));
        }
        Ok(Self { reads, writes })
    }
}

struct SubgraphTask {
    context: Context,
    graph: Arc<Graph>,
    shared: Arc<StreamShared>,
    index: usize,
    nodes: Vec<Arc<Node>>,
    ready: u64,
    ports: Ports,
    consumers: Vec<(mpsc::Sender<DoneEvent>, usize)>,
    errors: mpsc::Sender<StreamFailure>,
    token: CancellationToken,
    /// Frames run strictly in order; this is the next one.
    next: u64,
}

impl SubgraphTask {
    async fn run(mut self, mut events: mpsc::Receiver<DoneEvent>) {
        let graph = self.graph.name();
        tracing::debug!(graph = %graph, subgraph = self.index, nodes = self.nodes.len(), "subgraph task started");
        let mut pending: IndexMap<u64, u64> = IndexMap::new();
        loop {
            let event = tokio::select! {
                () = self.token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let bit = match event.trigger {
                Trigger::Announce => 0,
                Trigger::Source(bit) => bit,
            };
            *pending.entry(event.frame).or_insert(0) |= 1u64 << bit;

            while pending.get(&self.next) == Some(&self.ready) {
                pending.shift_remove(&self.next);
                if !self.run_frame(self.next).await {
                    tracing::debug!(graph = %graph, subgraph = self.index, "subgraph task cancelled mid-frame");
                    return;
                }
                self.next += 1;
            }
        }
        tracing::debug!(graph = %graph, subgraph = self.index, "subgraph task stopped");
    }

    /// Runs `frame` through the subgraph. Returns `false` if cancelled.
    async fn run_frame(&self, frame: u64) -> bool {
        let mut bound: IndexMap<Handle, DataRef> = IndexMap::new();
        let mut valid = true;
        let mut taken = Vec::with_capacity(self.ports.reads.len());
        for (handle, reader) in &self.ports.reads {
            match reader.get(frame) {
                Ok(acquired) => {
                    valid &= acquired.valid;
                    bound.insert(*handle, acquired.resource);
                    taken.push(reader);
                },
                Err(err) => {
                    tracing::error!(subgraph = self.index, frame, error = %err, "input not ready");
                    valid = false;
                },
            }
        }
        for (handle, _, writer) in &self.ports.writes {
            let acquired = tokio::select! {
                () = self.token.cancelled() => return false,
                acquired = writer.acquire(frame) => acquired,
            };
            bound.insert(*handle, acquired.resource);
        }

        if valid {
            for node in &self.nodes {
                if let Err(error) = run_node(node, &bound, frame) {
                    self.fail(frame, node, error).await;
                    valid = false;
                    break;
                }
            }
        } else {
            tracing::debug!(subgraph = self.index, frame, "skipping invalid frame");
        }

        for (_, demand, writer) in &self.ports.writes {
            if let Err(err) = writer.publish(frame, *demand, valid) {
                tracing::error!(subgraph = self.index, frame, error = %err, "failed to publish output");
            }
        }
        for reader in taken {
            if let Err(err) = reader.put(frame) {
                tracing::error!(subgraph = self.index, frame, error = %err, "failed to release input");
            }
        }
        for (tx, bit) in &self.consumers {
            let event = DoneEvent { frame, trigger: Trigger::Source(*bit) };
            if !deliver(tx, event, &self.token).await {
                return false;
            }
        }
        if self.consumers.is_empty() {
            self.finish(frame);
        }
        true
    }

    async fn fail(&self, frame: u64, node: &Node, error: VisionError) {
        let status = match node.status() {
            NodeStatus::Failed { status, .. } => status,
            _ => error.status(),
        };
        tracing::warn!(graph = %self.graph.name(), node = %node.name(), frame, "frame marked invalid");
        self.graph.set_error_status(status);
        let failure = StreamFailure { frame, node: node.name(), kernel: node.kernel().name().to_string(), error };
        self.shared.record_failure(failure.clone());
        tokio::select! {
            () = self.token.cancelled() => {},
            _ = self.errors.send(failure) => {},
        }
    }

    fn finish(&self, frame: u64) {
        if !self.shared.sink_finished(frame) {
            return;
        }
        let end = now_ns();
        let beg = lock(&self.shared.released).shift_remove(&frame).unwrap_or(end);
        self.graph.record_perf(beg, end);
        self.context.record_frame(FrameStamp { graph: self.graph.header().id(), frame, beg, end });
        let name = self.graph.name();
        self.context.metrics().frame_completed(&name);
        let progress = self.shared.complete();
        self.context.metrics().inflight(&name, progress.inflight());
        tracing::debug!(graph = %name, frame, "stream frame completed");
    }
}

/// Runs one node with every streamed object replaced by its clone for this frame.
fn run_node(node: &Node, bound: &IndexMap<Handle, DataRef>, frame: u64) -> Result<()> {
    let params: Vec<Option<DataRef>> = node
        .params()
        .into_iter()
        .map(|param| param.map(|data| bound.get(&data.handle()).cloned().unwrap_or(data)))
        .collect();
    node.execute(&params, frame)?;
    if let Some(callback) = node.callback() {
        if callback(node.handle()) == CallbackAction::Abandon {
            return Err(VisionError::GraphAbandoned(format!("{} stopped frame {frame}", node.name())));
        }
    }
    Ok(())
}

struct ScheduleTask {
    context: Context,
    graph: Arc<Graph>,
    shared: Arc<StreamShared>,
    roots: Vec<mpsc::Sender<DoneEvent>>,
    queues: IndexMap<Handle, Vec<(mpsc::Sender<DoneEvent>, usize)>>,
    token: CancellationToken,
    /// Highest frame released so far.
    released: u64,
}

impl ScheduleTask {
    async fn run(mut self, mut messages: mpsc::Receiver<ScheduleMessage>) {
        loop {
            let message = tokio::select! {
                () = self.token.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let (frame, pushed) = match message {
                ScheduleMessage::Frame(frame) => (frame, None),
                ScheduleMessage::Pushed { frame, object } => (frame, Some(object)),
            };
            if !self.release_through(frame).await {
                break;
            }
            let Some(object) = pushed else {
                continue;
            };
            for (tx, bit) in self.queues.get(&object).map(Vec::as_slice).unwrap_or_default() {
                let event = DoneEvent { frame, trigger: Trigger::Source(*bit) };
                if !deliver(tx, event, &self.token).await {
                    return;
                }
            }
        }
        tracing::debug!(graph = %self.graph.name(), released = self.released, "schedule task stopped");
    }

    /// Releases every frame up to `frame` to the sourceless subgraphs.
    async fn release_through(&mut self, frame: u64) -> bool {
        while self.released < frame {
            self.released += 1;
            let frame = self.released;
            lock(&self.shared.released).insert(frame, now_ns());
            self.shared.submit(frame);
            self.context.metrics().inflight(&self.graph.name(), self.shared.progress().inflight());
            for tx in &self.roots {
                if !deliver(tx, DoneEvent { frame, trigger: Trigger::Announce }, &self.token).await {
                    return false;
                }
            }
        }
        true
    }
}

async fn report_errors(
    context: Context,
    graph: Arc<Graph>,
    mut errors: mpsc::Receiver<StreamFailure>,
    token: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            () = token.cancelled() => break,
            failure = errors.recv() => match failure {
                Some(failure) => failure,
                None => break,
            },
        };
        tracing::error!(
            graph = %graph.name(),
            node = %failure.node,
            frame = failure.frame,
            error = %failure.error,
            "streaming frame failed"
        );
        context.report(graph.header().id(), &failure.error);
        context.metrics().kernel_failed(&graph.name(), &failure.kernel);
    }
}

fn check_planes(data: &DataObject, memory: &Memory) -> Result<()> {
    let sizes = data.shape().plane_sizes();
    let fits = memory.planes.len() == sizes.len() && memory.planes.iter().zip(&sizes).all(|(p, s)| p.len() >= *s);
    if fits {
        Ok(())
    } else {
        Err(VisionError::InvalidParameters(format!(
            "buffer does not fit {}: expected planes of {sizes:?} bytes",
            data.name()
        )))
    }
}

fn take_buffer(data: &DataObject, index: usize, clone: &DataRef, valid: bool) -> Result<PoppedImage> {
    let memory = clone.swap_memory(Memory::default())?;
    data.remove_clone(clone);
    Ok(PoppedImage { index, valid, memory })
}

fn not_a_queue(data: &DataObject) -> VisionError {
    VisionError::InvalidParameters(format!(
        "{} is not a queue object of a verified streaming graph (resource kind {:?})",
        data.name(),
        data.resource_kind()
    ))
}

impl Context {
    /// Starts `graph` streaming, or releases one more frame if it already is.
    ///
    /// Graphs fed through input queues take their frames from
    /// [`push_image_patch`](Self::push_image_patch); for them this only
    /// starts the stream. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `InvalidGraph`: the graph is not in streaming mode
    /// - `Runtime`: no tokio runtime is available
    /// - `NoResources`: the schedule queue is full
    /// - any verification error
    pub fn schedule_graph(&self, graph: Handle) -> Result<()> {
        let graph = self.graph(graph)?;
        let result = self.schedule(&graph);
        self.track(graph.header().id(), result)
    }

    fn schedule(&self, graph: &Arc<Graph>) -> Result<()> {
        if graph.exec_mode() != ExecMode::Stream {
            return Err(VisionError::InvalidGraph(format!(
                "{} is not a streaming graph; use process_graph",
                graph.name()
            )));
        }
        if graph.stream().is_none() {
            if !graph.is_verified() {
                self.verify(graph, &[])?;
            }
            let plan = graph
                .plan()
                .ok_or_else(|| VisionError::InvalidGraph(format!("{} has no plan", graph.name())))?;
            let runtime = StreamRuntime::spawn(self, graph, &plan)?;
            let mut stream = graph.stream();
            if stream.is_some() {
                runtime.abort();
            } else {
                *stream = Some(runtime);
                graph.set_state(GraphState::Running);
                tracing::info!(
                    graph = %graph.name(),
                    subgraphs = plan.subgraphs.len(),
                    first_frame = graph.frame_count() + 1,
                    "stream started"
                );
            }
        }

        let stream = graph.stream();
        let runtime = stream
            .as_ref()
            .ok_or_else(|| VisionError::Runtime(format!("stream of {} stopped concurrently", graph.name())))?;
        if runtime.shared.queue_driven() {
            return Ok(());
        }
        let permit = runtime
            .schedule_tx
            .try_reserve()
            .map_err(|_| VisionError::NoResources(format!("schedule queue of {} is full", graph.name())))?;
        let frame = graph.next_frame();
        runtime.shared.submit(frame);
        permit.send(ScheduleMessage::Frame(frame));
        tracing::trace!(graph = %graph.name(), frame, "frame scheduled");
        Ok(())
    }

    /// Waits until every frame scheduled so far has completed, then reports
    /// the first failure since the previous wait.
    ///
    /// # Errors
    ///
    /// - `Timeout`: frames are still in flight after `wait_graph_timeout_ms`
    /// - `InvalidGraph`: the graph is not scheduled
    /// - the error of the first failed node, reported once
    pub async fn wait_graph(&self, graph: Handle) -> Result<()> {
        let graph = self.graph(graph)?;
        let result = self.wait(&graph).await;
        self.track(graph.header().id(), result)
    }

    async fn wait(&self, graph: &Graph) -> Result<()> {
        let shared = graph
            .stream()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.shared))
            .ok_or_else(|| VisionError::InvalidGraph(format!("{} is not scheduled", graph.name())))?;
        let mut progress = shared.progress.subscribe();
        let limit = Duration::from_millis(self.config().wait_graph_timeout_ms);
        let waited = tokio::time::timeout(limit, progress.wait_for(|p| p.is_idle()))
            .await
            .map(|seen| seen.map(|_| ()));
        match waited {
            Ok(Ok(())) => {},
            Ok(Err(_)) => {
                return Err(VisionError::Runtime(format!("stream of {} ended while waiting", graph.name())));
            },
            Err(_) => {
                let inflight = progress.borrow().inflight();
                return Err(VisionError::Timeout(format!(
                    "{inflight} frames of {} still in flight after {limit:?}",
                    graph.name()
                )));
            },
        }
        match shared.take_failure() {
            Some(failure) => {
                tracing::info!(graph = %graph.name(), node = %failure.node, frame = failure.frame, "reporting stream failure");
                Err(failure.error)
            },
            None => Ok(()),
        }
    }

    /// Stops a streaming graph: cancels and joins its tasks and returns every
    /// queued buffer. The graph stays verified and can be scheduled again.
    /// A no-op for graphs that are not scheduled.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` unless `graph` is a graph.
    pub async fn stop_graph(&self, graph: Handle) -> Result<()> {
        let graph = self.graph(graph)?;
        let runtime = graph.stream().take();
        let Some(runtime) = runtime else {
            return Ok(());
        };
        let name = graph.name();
        runtime.shutdown(Duration::from_millis(self.config().complete_wait_ms), &name).await;
        if let Some(plan) = graph.plan() {
            for data in &plan.objects {
                if let Some(ring) = data.slot_manager() {
                    ring.reset();
                }
                if let Some(queue) = data.input_queue() {
                    queue.reset();
                }
                if let Some(queue) = data.output_queue() {
                    queue.reset();
                }
            }
        }
        graph.set_state(GraphState::Verified);
        self.metrics().inflight(&name, 0);
        tracing::info!(graph = %name, frames = graph.frame_count(), "stream stopped");
        Ok(())
    }

    /// Hands `memory` to a queue object.
    ///
    /// For an input queue the buffer becomes the next frame and is read by
    /// the graph; for an output queue it is an empty buffer the graph may
    /// fill. Either way it comes back through [`pop_image`](Self::pop_image).
    ///
    /// # Errors
    ///
    /// - `InvalidParameters`: not a queue object, or `memory` does not fit it
    /// - `InvalidGraph`: an input queue whose graph is not scheduled
    /// - `NoResources`: the queue or the schedule queue is full
    pub fn push_image_patch(&self, object: Handle, memory: Memory) -> Result<()> {
        let data = self.data(object)?;
        let result = self.push_patch(&data, memory);
        self.track(data.header().id(), result)
    }

    fn push_patch(&self, data: &DataRef, memory: Memory) -> Result<()> {
        check_planes(data, &memory)?;
        match data.resource_kind() {
            ResourceKind::InputQueue => {
                let queue = data.input_queue().ok_or_else(|| not_a_queue(data))?;
                let graph = self.graph(data.header().scope().ok_or_else(|| not_a_queue(data))?)?;
                let (shared, schedule_tx) = {
                    let stream = graph.stream();
                    let runtime = stream
                        .as_ref()
                        .ok_or_else(|| VisionError::InvalidGraph(format!("{} is not scheduled", graph.name())))?;
                    (Arc::clone(&runtime.shared), runtime.schedule_tx.clone())
                };
                let permit = schedule_tx
                    .try_reserve()
                    .map_err(|_| VisionError::NoResources(format!("schedule queue of {} is full", graph.name())))?;
                let demand = shared.queue_consumers.get(&data.handle()).map_or(0, Vec::len);

                let mut next_frames = lock(&shared.next_frames);
                let frame = next_frames.get(&data.handle()).copied().ok_or_else(|| {
                    VisionError::InvalidGraph(format!("{} is not read by {}", data.name(), graph.name()))
                })?;
                let clone = data.add_clone(memory.into_shared());
                let index = clone.clone_index().unwrap_or_default();
                if let Err(err) = queue.push(index, Arc::clone(&clone), frame, u32::try_from(demand).unwrap_or(u32::MAX)) {
                    data.remove_clone(&clone);
                    return Err(err);
                }
                next_frames.insert(data.handle(), frame + 1);
                drop(next_frames);

                graph.observe_frame(frame);
                shared.submit(frame);
                permit.send(ScheduleMessage::Pushed { frame, object: data.handle() });
                tracing::trace!(object = %data.name(), frame, "input buffer pushed");
                Ok(())
            },
            ResourceKind::OutputQueue => {
                let queue = data.output_queue().ok_or_else(|| not_a_queue(data))?;
                let clone = data.add_clone(memory.into_shared());
                let index = clone.clone_index().unwrap_or_default();
                if let Err(err) = queue.push(index, Arc::clone(&clone)) {
                    data.remove_clone(&clone);
                    return Err(err);
                }
                Ok(())
            },
            _ => Err(not_a_queue(data)),
        }
    }

    /// Takes back the oldest buffer the graph is done with: a consumed input
    /// or a filled output. `None` if there is none yet.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` unless `object` is a queue object.
    pub fn pop_image(&self, object: Handle) -> Result<Option<PoppedImage>> {
        let data = self.data(object)?;
        let result = self.pop_patch(&data);
        self.track(data.header().id(), result)
    }

    fn pop_patch(&self, data: &DataRef) -> Result<Option<PoppedImage>> {
        let popped = match data.resource_kind() {
            ResourceKind::InputQueue => {
                data.input_queue().and_then(|queue| queue.pop()).map(|(index, clone)| (index, clone, true))
            },
            ResourceKind::OutputQueue => data.output_queue().and_then(|queue| queue.pop()),
            _ => return Err(not_a_queue(data)),
        };
        popped.map(|(index, clone, valid)| take_buffer(data, index, &clone, valid)).transpose()
    }

    /// Like [`pop_image`](Self::pop_image), waiting up to
    /// `wait_graph_timeout_ms` for a buffer.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if nothing arrives in time and `InvalidParameters`
    /// unless `object` is a queue object.
    pub async fn wait_pop_image(&self, object: Handle) -> Result<PoppedImage> {
        let data = self.data(object)?;
        let result = self.wait_pop(&data).await;
        self.track(data.header().id(), result)
    }

    async fn wait_pop(&self, data: &DataRef) -> Result<PoppedImage> {
        let limit = Duration::from_millis(self.config().wait_graph_timeout_ms);
        let waited = match data.resource_kind() {
            ResourceKind::InputQueue => {
                let queue = data.input_queue().ok_or_else(|| not_a_queue(data))?;
                tokio::time::timeout(limit, queue.wait_and_pop()).await.map(|(index, clone)| (index, clone, true))
            },
            ResourceKind::OutputQueue => {
                let queue = data.output_queue().ok_or_else(|| not_a_queue(data))?;
                tokio::time::timeout(limit, queue.wait_and_pop()).await
            },
            _ => return Err(not_a_queue(data)),
        };
        let (index, clone, valid) = waited
            .map_err(|_| VisionError::Timeout(format!("no buffer of {} within {limit:?}", data.name())))?;
        take_buffer(data, index, &clone, valid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use visionflow_core::{DfImage, Direction, KernelCallbacks, ParamState, ReferenceType, Status};

    /// Image in, image out: every byte plus one.
    fn increment(context: &Context, enumeration: u32, name: &str) -> Handle {
        let callbacks = KernelCallbacks::new(|args| {
            let input = args.param(0)?.with_planes(|planes| planes[0].data.to_vec())?;
            args.param(1)?.with_planes(|planes| {
                for (out, value) in planes[0].data.iter_mut().zip(&input) {
                    *out = value.wrapping_add(1);
                }
            })
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

    /// Writes an 8x8 image whose first byte is the frame number.
    /// Fails with `NoResources` on frame `fail_on`.
    fn source(context: &Context, fail_on: Option<u64>) -> Handle {
        let callbacks = KernelCallbacks::new(move |args| {
            if Some(args.frame) == fail_on {
                return Err(VisionError::NoResources("sensor dropped the frame".into()));
            }
            let frame = u8::try_from(args.frame % 256).unwrap();
            args.param(0)?.with_planes(|planes| planes[0].data[0] = frame)
        })
        .with_output_validate(|_, _, meta| {
            meta.set_image(8, 8, DfImage::U8);
            Ok(())
        });
        let kernel = context.add_kernel(20, "cpu.source", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        kernel
    }

    /// Records the first byte of every frame it sees.
    fn sink(context: &Context, seen: Arc<Mutex<Vec<u8>>>) -> Handle {
        let callbacks = KernelCallbacks::new(move |args| {
            let first = args.param(0)?.with_planes(|planes| planes[0].data[0])?;
            seen.lock().unwrap().push(first);
            Ok(())
        });
        let kernel = context.add_kernel(21, "gpu.sink", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(kernel, 0, Direction::Input, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(kernel).unwrap();
        kernel
    }

    fn connect(context: &Context, graph: Handle, kernel: Handle, params: &[Handle]) -> Handle {
        let node = context.create_generic_node(graph, kernel).unwrap();
        for (index, param) in params.iter().enumerate() {
            context.set_parameter_by_index(node, u32::try_from(index).unwrap(), Some(*param)).unwrap();
        }
        node
    }

    /// source (cpu) -> virtual -> sink (gpu), two subgraphs.
    fn source_to_sink(context: &Context, fail_on: Option<u64>) -> (Handle, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let produce = source(context, fail_on);
        let consume = sink(context, Arc::clone(&seen));
        let graph = context.create_graph().unwrap();
        context.set_graph_exec_mode(graph, ExecMode::Stream).unwrap();
        let link = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        connect(context, graph, produce, &[link]);
        connect(context, graph, consume, &[link]);
        (graph, seen)
    }

    #[test]
    fn test_ready_mask() {
        assert_eq!(ready_mask(0), 1);
        assert_eq!(ready_mask(3), 0b111);
        assert_eq!(ready_mask(64), u64::MAX);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_pipeline_across_targets() {
        let context = Context::new();
        let cpu = increment(&context, 1, "cpu.increment");
        let gpu = increment(&context, 2, "gpu.increment");
        let graph = context.create_graph().unwrap();
        context.set_graph_exec_mode(graph, ExecMode::Stream).unwrap();
        let input = context.create_image_from_queue(graph, 4, 4, DfImage::U8).unwrap();
        let middle = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        let output = context.create_image_from_queue(graph, 4, 4, DfImage::U8).unwrap();
        connect(&context, graph, cpu, &[input, middle]);
        connect(&context, graph, gpu, &[middle, output]);

        context.schedule_graph(graph).unwrap();
        assert_eq!(context.graph_state(graph).unwrap(), GraphState::Running);
        for value in [10u8, 20, 30] {
            let mut memory = context.allocate_memory(input).unwrap();
            memory.planes[0].data.fill(value);
            context.push_image_patch(input, memory).unwrap();
        }
        context.wait_graph(graph).await.unwrap();

        let mut results = Vec::new();
        while let Some(popped) = context.pop_image(output).unwrap() {
            assert!(popped.valid);
            assert!(popped.memory.planes[0].data.iter().all(|b| *b == popped.memory.planes[0].data[0]));
            results.push(popped.memory.planes[0].data[0]);
        }
        assert_eq!(results, vec![12, 22, 32]);
        let returned = std::iter::from_fn(|| context.pop_image(input).unwrap()).count();
        assert_eq!(returned, 3);
        assert_eq!(context.query_graph(graph).unwrap().frame_count, 3);

        context.stop_graph(graph).await.unwrap();
        assert_eq!(context.graph_state(graph).unwrap(), GraphState::Verified);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduled_frames_reach_the_sink_in_order() {
        let context = Context::new();
        let (graph, seen) = source_to_sink(&context, None);
        for _ in 0..3 {
            context.schedule_graph(graph).unwrap();
        }
        context.wait_graph(graph).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        let frames: Vec<u64> = context.frame_stamps(graph).unwrap().iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![1, 2, 3]);
        context.stop_graph(graph).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_reported_once_and_frame_skipped() {
        let context = Context::new();
        let (graph, seen) = source_to_sink(&context, Some(2));
        for _ in 0..3 {
            context.schedule_graph(graph).unwrap();
        }
        let err = context.wait_graph(graph).await.unwrap_err();
        assert!(matches!(err, VisionError::Kernel { .. }));
        assert_eq!(context.query_graph(graph).unwrap().error_status, Status::NoResources);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);

        context.wait_graph(graph).await.unwrap();
        context.stop_graph(graph).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_times_out_on_slow_kernel() {
        let config = ContextConfig { wait_graph_timeout_ms: 50, ..ContextConfig::default() };
        let context = Context::with_config(config).unwrap();
        let callbacks = KernelCallbacks::new(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .with_output_validate(|_, _, meta| {
            meta.set_image(8, 8, DfImage::U8);
            Ok(())
        });
        let slow = context.add_kernel(30, "cpu.slow", 1, callbacks).unwrap();
        context.add_parameter_to_kernel(slow, 0, Direction::Output, ReferenceType::Image, ParamState::Required).unwrap();
        context.finalize_kernel(slow).unwrap();
        let graph = context.create_graph().unwrap();
        context.set_graph_exec_mode(graph, ExecMode::Stream).unwrap();
        let scratch = context.create_virtual_image(graph, 0, 0, DfImage::Virt).unwrap();
        connect(&context, graph, slow, &[scratch]);

        context.schedule_graph(graph).unwrap();
        let err = context.wait_graph(graph).await.unwrap_err();
        assert_eq!(err.status(), Status::Timeout);
        context.stop_graph(graph).await.unwrap();
        assert_eq!(context.graph_state(graph).unwrap(), GraphState::Verified);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_graph_can_be_rescheduled() {
        let context = Context::new();
        let (graph, seen) = source_to_sink(&context, None);
        context.schedule_graph(graph).unwrap();
        context.wait_graph(graph).await.unwrap();
        context.stop_graph(graph).await.unwrap();
        context.stop_graph(graph).await.unwrap();

        context.schedule_graph(graph).unwrap();
        context.schedule_graph(graph).unwrap();
        context.wait_graph(graph).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        context.stop_graph(graph).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_misuse() {
        let context = Context::new();
        let image = context.create_image(4, 4, DfImage::U8).unwrap();
        let memory = context.allocate_memory(image).unwrap();
        let err = context.push_image_patch(image, memory).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
        assert_eq!(context.pop_image(image).unwrap_err().status(), Status::InvalidParameters);

        let graph = context.create_graph().unwrap();
        let err = context.wait_graph(graph).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidGraph);
    }

    #[test]
    fn test_schedule_requires_streaming_mode_and_runtime() {
        let context = Context::new();
        let (graph, _) = source_to_sink(&context, None);
        let err = context.schedule_graph(graph).unwrap_err();
        assert!(matches!(err, VisionError::Runtime(_)));
        assert!(context.graph(graph).unwrap().stream().is_none());

        context.set_graph_exec_mode(graph, ExecMode::Normal).unwrap();
        let err = context.schedule_graph(graph).unwrap_err();
        assert_eq!(err.status(), Status::InvalidGraph);
    }

    #[test]
    fn test_progress_counts_inflight_frames() {
        let progress = Progress { submitted: 5, completed: 3 };
        assert_eq!(progress.inflight(), 2);
        assert!(!progress.is_idle());
        assert!(Progress { submitted: 3, completed: 3 }.is_idle());
    }
}
