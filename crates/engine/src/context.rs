// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The context: root of the ownership tree.
//!
//! A [`Context`] owns the object table every handle resolves through, the
//! kernel registry, user struct types, one error object per status code,
//! the log callback and the performance monitor. It is cheap to clone; all
//! clones share the same state.
//!
//! ## Ownership
//!
//! Every object carries an internal and an external count. Factories hand
//! the caller one external count. Objects that depend on another take an
//! internal count on it, tagged with themselves as holder:
//!
//! - a node holds its kernel, every bound data object and the delay of a
//!   bound delay slot;
//! - a graph holds its nodes and the virtual objects scoped to it;
//! - a delay holds its slots, a pyramid its levels, a region its parent;
//! - the context holds registered kernels and the error objects.
//!
//! An object is destroyed when the sum of both counts reaches zero, by
//! whoever performed the last decrement. Destruction releases the counts the
//! object itself held, so teardown cascades.

use crate::config::ContextConfig;
use crate::constants::{MAX_USER_STRUCTS, USER_STRUCT_START};
use crate::graph::Graph;
use crate::metrics::EngineMetrics;
use crate::node::Node;
use crate::object::{ErrorObject, Object};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use visionflow_core::kernel::KernelAttributes;
use visionflow_core::perf::FrameStamp;
use visionflow_core::{
    Allocator, Arena, DataRef, Delay, Handle, HeapAllocator, Holder, Kernel, KernelCallbacks,
    KernelRegistry, PerfMonitor, RefKind, ReferenceInfo, ReferenceType, Result, Status,
    VisionError,
};
use visionflow_core::types::{Direction, ParamState};

/// Receives `(reference id, status, message)` for every failed operation
/// while logging is enabled.
pub type LogCallback = Arc<dyn Fn(u32, Status, &str) + Send + Sync>;

struct LogSink {
    callback: LogCallback,
    reentrant: bool,
}

pub(crate) struct ContextShared {
    config: ContextConfig,
    objects: Mutex<Arena<Object>>,
    registry: Mutex<KernelRegistry>,
    user_structs: Mutex<IndexMap<u32, usize>>,
    /// Level views of each pyramid, in level order.
    pub(crate) levels: Mutex<IndexMap<Handle, Vec<Handle>>>,
    error_objects: IndexMap<Status, Handle>,
    log: RwLock<Option<LogSink>>,
    log_serial: Mutex<()>,
    log_enabled: AtomicBool,
    allocator: Arc<dyn Allocator>,
    immediate_target: Mutex<Option<String>>,
    perf: Mutex<PerfMonitor>,
    metrics: EngineMetrics,
}

/// Handle to a VisionFlow context.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextShared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("references", &self.num_references())
            .field("kernels", &self.num_kernels())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context with the default configuration and heap allocator.
    pub fn new() -> Self {
        Self::build(ContextConfig::default(), Arc::new(HeapAllocator::default()))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` if the configuration is invalid.
    pub fn with_config(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Arc::new(HeapAllocator::default())))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` if the configuration is invalid.
    pub fn with_allocator(config: ContextConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, allocator))
    }

    fn build(config: ContextConfig, allocator: Arc<dyn Allocator>) -> Self {
        let mut objects = Arena::new();
        let mut error_objects = IndexMap::new();
        for status in Status::ERRORS {
            let error = Arc::new(ErrorObject::new(status));
            error.header().increment(RefKind::Internal, Holder::Context);
            error_objects.insert(status, objects.insert(Object::Error(error)));
        }
        let log_enabled = AtomicBool::new(config.log_enabled);
        let perf = Mutex::new(PerfMonitor::new(config.perf_trace_frames));
        tracing::debug!(slot_num = config.slot_num, queue_capacity = config.queue_capacity, "context created");
        Self {
            inner: Arc::new(ContextShared {
                config,
                objects: Mutex::new(objects),
                registry: Mutex::new(KernelRegistry::new()),
                user_structs: Mutex::new(IndexMap::new()),
                levels: Mutex::new(IndexMap::new()),
                error_objects,
                log: RwLock::new(None),
                log_serial: Mutex::new(()),
                log_enabled,
                allocator,
                immediate_target: Mutex::new(None),
                perf,
                metrics: EngineMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub(crate) fn allocator(&self) -> &dyn Allocator {
        self.inner.allocator.as_ref()
    }

    pub(crate) fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    fn objects(&self) -> MutexGuard<'_, Arena<Object>> {
        self.inner.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, KernelRegistry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Object table

    /// Inserts a new object and gives it one count of `kind` held by the context.
    pub(crate) fn register<T: Clone>(
        &self,
        kind: RefKind,
        build: impl FnOnce(Handle) -> T,
        wrap: fn(T) -> Object,
    ) -> Result<(Handle, T)> {
        self.register_held(kind, Holder::Context, build, wrap)
    }

    /// Like [`register`](Self::register), with the first count taken by `holder`.
    pub(crate) fn register_held<T: Clone>(
        &self,
        kind: RefKind,
        holder: Holder,
        build: impl FnOnce(Handle) -> T,
        wrap: fn(T) -> Object,
    ) -> Result<(Handle, T)> {
        let mut created = None;
        let mut objects = self.objects();
        let handle = objects.insert_with(|handle| {
            let value = build(handle);
            created = Some(value.clone());
            wrap(value)
        });
        if let Some(object) = objects.get(handle) {
            object.header().increment(kind, holder);
        }
        drop(objects);
        let value = created.ok_or_else(|| VisionError::Runtime("object construction did not run".into()))?;
        Ok((handle, value))
    }

    pub(crate) fn object(&self, handle: Handle) -> Result<Object> {
        self.objects()
            .get(handle)
            .cloned()
            .ok_or_else(|| VisionError::InvalidReference(format!("stale or unknown handle {handle}")))
    }

    fn wrong_type(handle: Handle, expected: &str, found: &Object) -> VisionError {
        VisionError::InvalidReference(format!("{handle} is a {}, expected a {expected}", found.kind_name()))
    }

    pub(crate) fn data(&self, handle: Handle) -> Result<DataRef> {
        match self.object(handle)? {
            Object::Data(data) => Ok(data),
            other => Err(Self::wrong_type(handle, "data object", &other)),
        }
    }

    pub(crate) fn delay(&self, handle: Handle) -> Result<Arc<Delay>> {
        match self.object(handle)? {
            Object::Delay(delay) => Ok(delay),
            other => Err(Self::wrong_type(handle, "delay", &other)),
        }
    }

    pub(crate) fn kernel(&self, handle: Handle) -> Result<Arc<Kernel>> {
        match self.object(handle)? {
            Object::Kernel(kernel) => Ok(kernel),
            other => Err(Self::wrong_type(handle, "kernel", &other)),
        }
    }

    pub(crate) fn node(&self, handle: Handle) -> Result<Arc<Node>> {
        match self.object(handle)? {
            Object::Node(node) => Ok(node),
            other => Err(Self::wrong_type(handle, "node", &other)),
        }
    }

    pub(crate) fn graph(&self, handle: Handle) -> Result<Arc<Graph>> {
        match self.object(handle)? {
            Object::Graph(graph) => Ok(graph),
            other => Err(Self::wrong_type(handle, "graph", &other)),
        }
    }

    pub(crate) fn graphs(&self) -> Vec<Arc<Graph>> {
        self.objects()
            .iter()
            .filter_map(|(_, object)| match object {
                Object::Graph(graph) => Some(Arc::clone(graph)),
                _ => None,
            })
            .collect()
    }

    // Reference counting

    /// Adds one external count.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles.
    pub fn retain_reference(&self, handle: Handle) -> Result<u32> {
        let object = self.object(handle)?;
        Ok(object.header().increment(RefKind::External, Holder::Context))
    }

    /// Drops one external count, destroying the object when no count is left.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles and for objects the
    /// application holds no count on.
    pub fn release_reference(&self, handle: Handle) -> Result<()> {
        if self.object(handle)?.header().external_count() == 0 {
            let err = VisionError::InvalidReference(format!("{handle} has no external reference to release"));
            tracing::error!(%handle, "external reference released twice");
            return Err(err);
        }
        self.release(handle, RefKind::External, Holder::Context)
    }

    pub(crate) fn retain_internal(&self, handle: Handle, holder: Handle) -> Result<()> {
        self.object(handle)?.header().increment(RefKind::Internal, Holder::Object(holder));
        Ok(())
    }

    pub(crate) fn release_internal(&self, handle: Handle, holder: Handle) -> Result<()> {
        self.release(handle, RefKind::Internal, Holder::Object(holder))
    }

    /// The single release routine. The decrement and the removal from the
    /// table happen under the table lock so exactly one caller destroys.
    pub(crate) fn release(&self, handle: Handle, kind: RefKind, holder: Holder) -> Result<()> {
        let object = {
            let mut objects = self.objects();
            let object = objects
                .get(handle)
                .cloned()
                .ok_or_else(|| VisionError::InvalidReference(format!("stale or unknown handle {handle}")))?;
            if object.header().decrement(kind, holder) > 0 {
                return Ok(());
            }
            objects.remove(handle);
            object
        };
        tracing::debug!(%handle, name = %object.header().name(), kind = object.kind_name(), "destroying object");
        self.destroy(object);
        Ok(())
    }

    fn destroy(&self, object: Object) {
        match object {
            Object::Data(data) => self.destroy_data(&data),
            Object::Delay(delay) => self.destroy_delay(&delay),
            Object::Node(node) => self.destroy_node(&node),
            Object::Graph(graph) => self.destroy_graph(&graph),
            Object::Kernel(_) | Object::Error(_) => {},
        }
    }

    // Queries

    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles.
    pub fn query_reference(&self, handle: Handle) -> Result<ReferenceInfo> {
        Ok(self.object(handle)?.header().info())
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles.
    pub fn set_reference_name(&self, handle: Handle, name: &str) -> Result<()> {
        self.object(handle)?.header().set_name(name);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles.
    pub fn reference_type(&self, handle: Handle) -> Result<ReferenceType> {
        Ok(self.object(handle)?.header().ty())
    }

    /// Number of live objects, error objects and kernels included.
    pub fn num_references(&self) -> usize {
        self.objects().len()
    }

    pub fn num_kernels(&self) -> usize {
        self.registry().num_kernels()
    }

    pub fn num_unique_kernels(&self) -> usize {
        self.registry().num_unique_kernels()
    }

    pub fn num_targets(&self) -> usize {
        self.registry().num_targets()
    }

    pub fn targets(&self) -> Vec<String> {
        self.registry().targets()
    }

    /// `(enumeration, name)` once per enumeration.
    pub fn unique_kernel_table(&self) -> Vec<(u32, String)> {
        self.registry().unique_kernel_table()
    }

    pub fn kernel_definitions(&self) -> Vec<KernelAttributes> {
        self.registry().definitions()
    }

    // Kernels

    /// Registers a kernel. Its parameters are declared with
    /// [`add_parameter_to_kernel`](Self::add_parameter_to_kernel) and the
    /// kernel becomes usable after [`finalize_kernel`](Self::finalize_kernel).
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if a kernel with the same name exists.
    pub fn add_kernel(
        &self,
        enumeration: u32,
        name: &str,
        num_params: usize,
        callbacks: KernelCallbacks,
    ) -> Result<Handle> {
        let mut registry = self.registry();
        if registry.contains(name) {
            return Err(VisionError::InvalidParameters(format!("kernel '{name}' is already registered")));
        }
        let kernel = Arc::new(Kernel::new(enumeration, name, num_params, callbacks));
        let (handle, kernel) = self.register(RefKind::Internal, move |_| kernel, Object::Kernel)?;
        registry.register(handle, kernel)?;
        Ok(handle)
    }

    /// # Errors
    ///
    /// See [`Kernel::add_parameter`].
    pub fn add_parameter_to_kernel(
        &self,
        kernel: Handle,
        index: u32,
        direction: Direction,
        ty: ReferenceType,
        state: ParamState,
    ) -> Result<()> {
        self.kernel(kernel)?.add_parameter(index, direction, ty, state)
    }

    /// # Errors
    ///
    /// Returns `NotSupported` once the kernel is finalized.
    pub fn set_kernel_local_data_size(&self, kernel: Handle, size: usize) -> Result<()> {
        self.kernel(kernel)?.set_local_data_size(size)
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` if declared parameters are missing.
    pub fn finalize_kernel(&self, kernel: Handle) -> Result<()> {
        let kernel = self.kernel(kernel)?;
        let result = kernel.finalize();
        self.track(kernel.header().id(), result)
    }

    /// Unregisters and destroys a kernel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` while any node still uses the kernel.
    pub fn remove_kernel(&self, handle: Handle) -> Result<()> {
        let kernel = self.kernel(handle)?;
        if kernel.header().holders().iter().any(|h| matches!(h, Holder::Object(_))) {
            return Err(VisionError::InvalidReference(format!(
                "kernel {} is still used by nodes",
                kernel.name()
            )));
        }
        self.registry().unregister(kernel.name());
        self.release(handle, RefKind::Internal, Holder::Context)
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` if no kernel has that name.
    pub fn get_kernel_by_name(&self, name: &str) -> Result<Handle> {
        self.registry()
            .by_name(name)
            .map(|entry| entry.handle)
            .ok_or_else(|| VisionError::InvalidReference(format!("no kernel named '{name}'")))
    }

    /// Resolves an enumeration through the immediate-mode target, the
    /// configured preset and finally the first target providing it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` if no target provides the enumeration.
    pub fn get_kernel_by_enum(&self, enumeration: u32) -> Result<Handle> {
        let immediate = self.immediate_target();
        let preset = self.inner.config.preset_for(enumeration);
        self.registry()
            .by_enum(enumeration, immediate.as_deref(), preset)
            .map(|entry| entry.handle)
            .ok_or_else(|| VisionError::InvalidReference(format!("no kernel with enumeration {enumeration}")))
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` for stale handles.
    pub fn query_kernel(&self, kernel: Handle) -> Result<KernelAttributes> {
        Ok(self.kernel(kernel)?.attributes())
    }

    pub(crate) fn kernel_in_target(&self, target: &str, enumeration: u32) -> Option<(Handle, Arc<Kernel>)> {
        self.registry().in_target(target, enumeration).map(|e| (e.handle, Arc::clone(&e.kernel)))
    }

    // Targets

    /// Prefers `target` for kernel lookups by enumeration; `None` clears it.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` for a target no kernel was registered under.
    pub fn set_immediate_mode_target(&self, target: Option<&str>) -> Result<()> {
        if let Some(name) = target {
            if !self.registry().targets().iter().any(|t| t == name) {
                return Err(VisionError::NotSupported(format!("unknown target '{name}'")));
            }
        }
        *self.inner.immediate_target.lock().unwrap_or_else(PoisonError::into_inner) = target.map(str::to_string);
        Ok(())
    }

    pub fn immediate_target(&self) -> Option<String> {
        self.inner.immediate_target.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // User structs

    /// Registers a user struct of `size` bytes and returns its type id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for a zero size and `NoResources` once the
    /// id range is exhausted.
    pub fn register_user_struct(&self, size: usize) -> Result<u32> {
        if size == 0 {
            return Err(VisionError::InvalidParameters("user struct size must be positive".into()));
        }
        let mut structs = self.inner.user_structs.lock().unwrap_or_else(PoisonError::into_inner);
        let count = u32::try_from(structs.len()).unwrap_or(u32::MAX);
        if count >= MAX_USER_STRUCTS {
            return Err(VisionError::NoResources("user struct table is full".into()));
        }
        let id = USER_STRUCT_START + count;
        structs.insert(id, size);
        Ok(id)
    }

    pub fn user_struct_size(&self, id: u32) -> Option<usize> {
        self.inner.user_structs.lock().unwrap_or_else(PoisonError::into_inner).get(&id).copied()
    }

    // Error objects

    /// The error object standing for `status`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for `Status::Success`.
    pub fn get_error_object(&self, status: Status) -> Result<Handle> {
        self.inner
            .error_objects
            .get(&status)
            .copied()
            .ok_or_else(|| VisionError::InvalidParameters(format!("no error object for {status:?}")))
    }

    /// # Errors
    ///
    /// Returns `InvalidReference` unless `handle` is an error object.
    pub fn error_object_status(&self, handle: Handle) -> Result<Status> {
        match self.object(handle)? {
            Object::Error(error) => Ok(error.status()),
            other => Err(Self::wrong_type(handle, "error object", &other)),
        }
    }

    // Logging

    /// Installs the log callback. A non-reentrant callback is never invoked
    /// concurrently.
    pub fn register_log_callback(&self, callback: LogCallback, reentrant: bool) {
        *self.inner.log.write().unwrap_or_else(PoisonError::into_inner) = Some(LogSink { callback, reentrant });
    }

    pub fn set_log_enabled(&self, enabled: bool) {
        self.inner.log_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Reports a failed operation on the object with reference id `id`.
    pub(crate) fn report(&self, id: u32, err: &VisionError) {
        tracing::debug!(reference = id, status = ?err.status(), error = %err, "operation failed");
        if !self.inner.log_enabled.load(Ordering::Relaxed) {
            return;
        }
        let log = self.inner.log.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = log.as_ref() else {
            return;
        };
        let message = err.to_string();
        if sink.reentrant {
            (sink.callback)(id, err.status(), &message);
        } else {
            let _serial = self.inner.log_serial.lock().unwrap_or_else(PoisonError::into_inner);
            (sink.callback)(id, err.status(), &message);
        }
    }

    /// Passes `result` through, reporting it if it is an error.
    pub(crate) fn track<T>(&self, id: u32, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.report(id, err);
        }
        result
    }

    // Performance

    pub(crate) fn record_frame(&self, stamp: FrameStamp) {
        self.inner.perf.lock().unwrap_or_else(PoisonError::into_inner).record_frame(stamp);
    }

    /// The most recent frame stamps of `graph`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` unless `graph` is a graph.
    pub fn frame_stamps(&self, graph: Handle) -> Result<Vec<FrameStamp>> {
        let id = self.graph(graph)?.header().id();
        Ok(self.inner.perf.lock().unwrap_or_else(PoisonError::into_inner).frames_of(id))
    }

    // Teardown

    /// Stops every streaming graph and destroys every object, regardless of
    /// outstanding counts.
    pub fn shutdown(&self) {
        for graph in self.graphs() {
            graph.cancel_stream();
        }
        let objects = std::mem::take(&mut *self.objects());
        let mut freed = 0usize;
        for (_, object) in objects.iter() {
            match object {
                Object::Data(data) => {
                    data.free_resources(self.allocator());
                    freed += 1;
                },
                Object::Node(node) => node.deinitialize(),
                _ => {},
            }
        }
        *self.registry() = KernelRegistry::new();
        tracing::info!(objects = objects.len(), data_objects = freed, "context shut down");
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
