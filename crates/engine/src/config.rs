// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration of a context.

use crate::constants::{
    COMPLETE_WAIT_TIME_MS, DEFAULT_DONE_EVENT_CAPACITY, DEFAULT_ERROR_QUEUE_CAPACITY,
    DEFAULT_SCHEDULE_QUEUE_CAPACITY, DEFAULT_SLOT_NUM, DEFAULT_WAIT_GRAPH_TIMEOUT_MS,
    MAX_QUEUE_RES_NUM, MAX_TRACE_FRAME_NUM,
};
use serde::{Deserialize, Serialize};
use visionflow_core::{Result, VisionError};

/// Pins kernel enumeration `kernel` to `target` when several targets provide it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelTargetPreset {
    pub kernel: u32,
    pub target: String,
}

/// Configuration for a [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Buffers per virtual object in streaming graphs (default: 3)
    pub slot_num: usize,
    /// Capacity of input and output queues (default: 10)
    pub queue_capacity: usize,
    /// Timeout of `wait_graph` in milliseconds (default: 5000)
    pub wait_graph_timeout_ms: u64,
    /// Time a stopping graph grants each subgraph task (default: 1000)
    pub complete_wait_ms: u64,
    pub done_event_capacity: usize,
    pub error_queue_capacity: usize,
    pub schedule_queue_capacity: usize,
    /// Frame stamps kept by the performance monitor (default: 100)
    pub perf_trace_frames: usize,
    /// Whether failed operations are reported to the log callback
    pub log_enabled: bool,
    pub kernel_target_presets: Vec<KernelTargetPreset>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            slot_num: DEFAULT_SLOT_NUM,
            queue_capacity: MAX_QUEUE_RES_NUM,
            wait_graph_timeout_ms: DEFAULT_WAIT_GRAPH_TIMEOUT_MS,
            complete_wait_ms: COMPLETE_WAIT_TIME_MS,
            done_event_capacity: DEFAULT_DONE_EVENT_CAPACITY,
            error_queue_capacity: DEFAULT_ERROR_QUEUE_CAPACITY,
            schedule_queue_capacity: DEFAULT_SCHEDULE_QUEUE_CAPACITY,
            perf_trace_frames: MAX_TRACE_FRAME_NUM,
            log_enabled: false,
            kernel_target_presets: Vec::new(),
        }
    }
}

impl ContextConfig {
    /// Parses a YAML document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if the document does not parse or a
    /// capacity is zero.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_saphyr::from_str(yaml)
            .map_err(|e| VisionError::InvalidParameters(format!("invalid context config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` for zero ring depths or channel capacities.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("slot_num", self.slot_num),
            ("queue_capacity", self.queue_capacity),
            ("done_event_capacity", self.done_event_capacity),
            ("error_queue_capacity", self.error_queue_capacity),
            ("schedule_queue_capacity", self.schedule_queue_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(VisionError::InvalidParameters(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Preset target of kernel enumeration `kernel`, if one is configured.
    pub fn preset_for(&self, kernel: u32) -> Option<&str> {
        self.kernel_target_presets.iter().find(|p| p.kernel == kernel).map(|p| p.target.as_str())
    }
}
