// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! visionflow-engine: verification and execution of VisionFlow graphs.
//!
//! Everything is reached through a [`Context`], which owns every object and
//! hands out [`Handle`](visionflow_core::Handle)s:
//!
//! ```ignore
//! let context = Context::new();
//! let graph = context.create_graph()?;
//! let node = context.create_generic_node(graph, kernel)?;
//! context.set_parameter_by_index(node, 0, Some(input))?;
//! context.process_graph(graph)?;
//! ```
//!
//! Graphs in [`ExecMode::Stream`](visionflow_core::ExecMode) are pipelined
//! instead: [`Context::schedule_graph`] starts them on the ambient tokio
//! runtime and [`Context::wait_graph`] waits for the frames in flight.

// --- Public Modules ---

pub mod config;
pub mod constants;

// --- Engine Modules ---

mod context;
mod execute;
mod graph;
mod messages;
mod metrics;
mod node;
mod object;
mod objects;
mod stream;
mod verify;

// Re-exports
pub use config::{ContextConfig, KernelTargetPreset};
pub use context::{Context, LogCallback};
pub use graph::GraphInfo;
pub use node::{NodeCallback, NodeInfo, Target};
pub use objects::DataInfo;
pub use stream::PoppedImage;
pub use visionflow_core;

#[cfg(test)]
mod tests;
