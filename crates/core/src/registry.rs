// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel registry and target discovery.
//!
//! Kernels are grouped by target, the prefix of their name before the last
//! `.`. A target exists as soon as its first kernel is registered. Several
//! targets may provide the same enumeration; lookup by enumeration picks one
//! in the order immediate-mode target, configured preset, first registered
//! target.

use crate::error::{Result, VisionError};
use crate::handle::Handle;
use crate::kernel::{target_of, Kernel, KernelAttributes};
use indexmap::IndexMap;
use std::sync::Arc;

/// A registered kernel and the handle it lives at.
#[derive(Clone)]
pub struct KernelEntry {
    pub handle: Handle,
    pub kernel: Arc<Kernel>,
}

/// The KernelRegistry holds every kernel the context can instantiate nodes from.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    targets: IndexMap<String, IndexMap<String, KernelEntry>>,
}

impl KernelRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kernel` under its name's target.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if a kernel with the same name exists.
    pub fn register(&mut self, handle: Handle, kernel: Arc<Kernel>) -> Result<()> {
        let target = kernel.target().to_string();
        let kernels = self.targets.entry(target.clone()).or_default();
        if kernels.contains_key(kernel.name()) {
            return Err(VisionError::InvalidParameters(format!(
                "kernel '{}' is already registered",
                kernel.name()
            )));
        }
        tracing::debug!(kernel = %kernel.name(), %target, enumeration = kernel.enumeration(), "kernel registered");
        kernels.insert(kernel.name().to_string(), KernelEntry { handle, kernel });
        Ok(())
    }

    /// Removes a kernel by name. Empty targets are kept.
    pub fn unregister(&mut self, name: &str) -> Option<KernelEntry> {
        self.targets.get_mut(target_of(name))?.shift_remove(name)
    }

    pub fn by_name(&self, name: &str) -> Option<&KernelEntry> {
        self.targets.get(target_of(name))?.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name(name).is_some()
    }

    /// The kernel implementing `enumeration` on `target`.
    pub fn in_target(&self, target: &str, enumeration: u32) -> Option<&KernelEntry> {
        self.targets.get(target)?.values().find(|e| e.kernel.enumeration() == enumeration)
    }

    /// Resolves `enumeration` with priority `immediate`, then `preset`, then
    /// the first target providing it.
    pub fn by_enum(&self, enumeration: u32, immediate: Option<&str>, preset: Option<&str>) -> Option<&KernelEntry> {
        if let Some(entry) = immediate.and_then(|t| self.in_target(t, enumeration)) {
            return Some(entry);
        }
        if let Some(target) = preset {
            if let Some(entry) = self.in_target(target, enumeration) {
                return Some(entry);
            }
            tracing::warn!(enumeration, target, "preset target lacks kernel, falling back");
        }
        self.targets.values().flat_map(IndexMap::values).find(|e| e.kernel.enumeration() == enumeration)
    }

    pub fn num_kernels(&self) -> usize {
        self.targets.values().map(IndexMap::len).sum()
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    /// `(enumeration, name)` once per enumeration, first registration wins.
    pub fn unique_kernel_table(&self) -> Vec<(u32, String)> {
        let mut table: IndexMap<u32, String> = IndexMap::new();
        for entry in self.targets.values().flat_map(IndexMap::values) {
            table.entry(entry.kernel.enumeration()).or_insert_with(|| entry.kernel.name().to_string());
        }
        table.into_iter().collect()
    }

    pub fn num_unique_kernels(&self) -> usize {
        self.unique_kernel_table().len()
    }

    /// Returns attributes of every registered kernel.
    pub fn definitions(&self) -> Vec<KernelAttributes> {
        self.targets.values().flat_map(IndexMap::values).map(|e| e.kernel.attributes()).collect()
    }

    /// Every registered entry, in registration order per target.
    pub fn entries(&self) -> Vec<KernelEntry> {
        self.targets.values().flat_map(IndexMap::values).cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handle::Arena;
    use crate::kernel::KernelCallbacks;

    fn registry() -> (KernelRegistry, Arena<()>) {
        let mut arena = Arena::new();
        let mut registry = KernelRegistry::new();
        for (enumeration, name) in [(1, "cpu.identity"), (2, "cpu.blur"), (1, "gpu.identity")] {
            let kernel = Arc::new(Kernel::new(enumeration, name, 0, KernelCallbacks::new(|_| Ok(()))));
            registry.register(arena.insert(()), kernel).unwrap();
        }
        (registry, arena)
    }

    #[test]
    fn test_targets_and_counts() {
        let (registry, _) = registry();
        assert_eq!(registry.targets(), vec!["cpu".to_string(), "gpu".to_string()]);
        assert_eq!(registry.num_kernels(), 3);
        assert_eq!(registry.num_unique_kernels(), 2);
        assert_eq!(
            registry.unique_kernel_table(),
            vec![(1, "cpu.identity".to_string()), (2, "cpu.blur".to_string())]
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut registry, mut arena) = registry();
        let dup = Arc::new(Kernel::new(9, "cpu.blur", 0, KernelCallbacks::new(|_| Ok(()))));
        assert!(registry.register(arena.insert(()), dup).is_err());
    }

    #[test]
    fn test_lookup_priority() {
        let (registry, _) = registry();
        let name = |e: Option<&KernelEntry>| e.map(|e| e.kernel.name().to_string());
        assert_eq!(name(registry.by_enum(1, None, None)), Some("cpu.identity".into()));
        assert_eq!(name(registry.by_enum(1, None, Some("gpu"))), Some("gpu.identity".into()));
        assert_eq!(name(registry.by_enum(1, Some("cpu"), Some("gpu"))), Some("cpu.identity".into()));
        // Immediate target without the kernel falls through to the preset.
        assert_eq!(name(registry.by_enum(1, Some("dsp"), Some("gpu"))), Some("gpu.identity".into()));
        assert_eq!(name(registry.by_enum(2, None, Some("gpu"))), Some("cpu.blur".into()));
        assert!(registry.by_enum(3, None, None).is_none());
    }

    #[test]
    fn test_unregister() {
        let (mut registry, _) = registry();
        assert!(registry.unregister("gpu.identity").is_some());
        assert!(!registry.contains("gpu.identity"));
        assert_eq!(registry.num_targets(), 2);
    }
}
