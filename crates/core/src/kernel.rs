// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel descriptors and the back-end callback contract.
//!
//! A [`Kernel`] names a computation, declares its parameter signature and
//! carries five callbacks: input validation, output validation (which fills
//! a [`Meta`]), initialization, deinitialization and the run function. The
//! engine never looks inside a kernel; it only calls these.
//!
//! Parameters are added in index order and the kernel is then finalized,
//! after which its signature and attributes are frozen.

use crate::data::DataRef;
use crate::error::{Result, VisionError};
use crate::meta::Meta;
use crate::reference::{RefHeader, ReferenceType};
use crate::types::{BorderMode, Direction, ParamState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Target name used for kernels whose name has no `target.` prefix.
pub const DEFAULT_TARGET: &str = "default";

/// One entry of a kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelParam {
    pub direction: Direction,
    pub ty: ReferenceType,
    pub state: ParamState,
}

/// Scratch memory owned by a node and handed to its kernel.
pub type LocalData = Mutex<Vec<u8>>;

/// What a kernel callback sees of the node it runs for.
pub struct KernelArgs<'a> {
    pub node: &'a str,
    pub params: &'a [Option<DataRef>],
    pub border: BorderMode,
    pub local_data: &'a LocalData,
    /// Frame being processed; zero during verification.
    pub frame: u64,
}

impl KernelArgs<'_> {
    /// The object bound at `index`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` past the signature and `NotSufficient` for
    /// an unbound parameter.
    pub fn param(&self, index: u32) -> Result<&DataRef> {
        self.params
            .get(index as usize)
            .ok_or_else(|| {
                VisionError::InvalidParameters(format!("{}: no parameter {index}", self.node))
            })?
            .as_ref()
            .ok_or_else(|| VisionError::NotSufficient(format!("{}: parameter {index} is unbound", self.node)))
    }

    pub fn local_data(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.local_data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub type InputValidateFn = Arc<dyn Fn(&KernelArgs<'_>, u32) -> Result<()> + Send + Sync>;
pub type OutputValidateFn = Arc<dyn Fn(&KernelArgs<'_>, u32, &mut Meta) -> Result<()> + Send + Sync>;
pub type LifecycleFn = Arc<dyn Fn(&KernelArgs<'_>) -> Result<()> + Send + Sync>;
pub type RunFn = Arc<dyn Fn(&KernelArgs<'_>) -> Result<()> + Send + Sync>;

/// The five back-end entry points of a kernel.
#[derive(Clone)]
pub struct KernelCallbacks {
    pub input_validate: Option<InputValidateFn>,
    pub output_validate: Option<OutputValidateFn>,
    pub init: Option<LifecycleFn>,
    pub deinit: Option<LifecycleFn>,
    pub run: RunFn,
}

impl KernelCallbacks {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self { input_validate: None, output_validate: None, init: None, deinit: None, run: Arc::new(run) }
    }

    #[must_use]
    pub fn with_input_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelArgs<'_>, u32) -> Result<()> + Send + Sync + 'static,
    {
        self.input_validate = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_output_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelArgs<'_>, u32, &mut Meta) -> Result<()> + Send + Sync + 'static,
    {
        self.output_validate = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_init<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_deinit<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.deinit = Some(Arc::new(f));
        self
    }
}

/// Serializable snapshot of a kernel's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAttributes {
    pub name: String,
    pub enumeration: u32,
    pub target: String,
    pub num_params: usize,
    pub local_data_size: usize,
    pub finalized: bool,
}

#[derive(Default)]
struct KernelState {
    params: Vec<KernelParam>,
    local_data_size: usize,
    finalized: bool,
}

pub struct Kernel {
    header: RefHeader,
    enumeration: u32,
    name: String,
    num_params: usize,
    callbacks: KernelCallbacks,
    state: RwLock<KernelState>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("enumeration", &self.enumeration)
            .field("num_params", &self.num_params)
            .finish_non_exhaustive()
    }
}

/// Target part of a kernel name: everything before the last `.`.
pub fn target_of(name: &str) -> &str {
    name.rsplit_once('.').map_or(DEFAULT_TARGET, |(target, _)| target)
}

impl Kernel {
    pub fn new(enumeration: u32, name: impl Into<String>, num_params: usize, callbacks: KernelCallbacks) -> Self {
        let name = name.into();
        let header = RefHeader::new(ReferenceType::Kernel, None);
        header.set_name(name.clone());
        Self { header, enumeration, name, num_params, callbacks, state: RwLock::new(KernelState::default()) }
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        target_of(&self.name)
    }

    pub const fn enumeration(&self) -> u32 {
        self.enumeration
    }

    pub const fn num_params(&self) -> usize {
        self.num_params
    }

    pub const fn callbacks(&self) -> &KernelCallbacks {
        &self.callbacks
    }

    /// Declares parameter `index`. Indices must be added in order.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` after finalization and `InvalidParameters` for
    /// an out-of-order or out-of-range index.
    pub fn add_parameter(&self, index: u32, direction: Direction, ty: ReferenceType, state: ParamState) -> Result<()> {
        let mut inner = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if inner.finalized {
            return Err(VisionError::NotSupported(format!("kernel {} is finalized", self.name)));
        }
        let index = index as usize;
        if index >= self.num_params || index != inner.params.len() {
            return Err(VisionError::InvalidParameters(format!(
                "kernel {} expects parameter {} next (of {})",
                self.name,
                inner.params.len(),
                self.num_params
            )));
        }
        inner.params.push(KernelParam { direction, ty, state });
        Ok(())
    }

    /// Freezes the signature.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if not every declared parameter was added.
    pub fn finalize(&self) -> Result<()> {
        let mut inner = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if inner.params.len() != self.num_params {
            return Err(VisionError::InvalidParameters(format!(
                "kernel {} declares {} parameters but {} were added",
                self.name,
                self.num_params,
                inner.params.len()
            )));
        }
        inner.finalized = true;
        tracing::debug!(kernel = %self.name, "kernel finalized");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).finalized
    }

    /// # Errors
    ///
    /// Returns `NotSupported` after finalization.
    pub fn set_local_data_size(&self, size: usize) -> Result<()> {
        let mut inner = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if inner.finalized {
            return Err(VisionError::NotSupported(format!(
                "local data size of {} is frozen",
                self.name
            )));
        }
        inner.local_data_size = size;
        Ok(())
    }

    pub fn local_data_size(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).local_data_size
    }

    pub fn signature(&self) -> Vec<KernelParam> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).params.clone()
    }

    pub fn param(&self, index: u32) -> Option<KernelParam> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).params.get(index as usize).copied()
    }

    /// Position of `index` among parameters of the same kind (inputs, or
    /// outputs and bidirectional parameters together).
    pub fn sub_index(&self, index: u32) -> Option<(Direction, usize)> {
        let signature = self.signature();
        let direction = signature.get(index as usize)?.direction;
        let writes = direction.writes();
        let position = signature[..index as usize].iter().filter(|p| p.direction.writes() == writes).count();
        Some((direction, position))
    }

    pub fn attributes(&self) -> KernelAttributes {
        let inner = self.state.read().unwrap_or_else(PoisonError::into_inner);
        KernelAttributes {
            name: self.name.clone(),
            enumeration: self.enumeration,
            target: self.target().to_string(),
            num_params: self.num_params,
            local_data_size: inner.local_data_size,
            finalized: inner.finalized,
        }
    }
}
