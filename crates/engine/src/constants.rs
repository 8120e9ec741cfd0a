// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared capacity and timing constants.
//!
//! This module provides the canonical default values for every tunable of
//! the engine. [`ContextConfig`](crate::config::ContextConfig) starts from
//! these and applications override them per context.
//!
//! # Buffer depth guidelines
//!
//! Slot rings and queues are measured in frames, not bytes. The memory
//! footprint of a streaming graph is roughly
//! `slot_num × Σ(virtual object size) + queue_capacity × Σ(queue object size)`.
//!
//! - **Deeper rings** = more frames in flight, more memory, smoother throughput
//! - **Shallower rings** = lower latency, earlier backpressure

// === Streaming Buffers ===

/// Default number of buffers per virtual object in a streaming graph.
///
/// Bounds how many frames may be in flight between two subgraphs. A
/// producer that finds every slot still demanded by readers waits.
pub const DEFAULT_SLOT_NUM: usize = 3;

/// Default capacity of application-facing input and output queues.
pub const MAX_QUEUE_RES_NUM: usize = 10;

// === Timeouts ===

/// How long `wait_graph` waits for a frame to complete.
pub const DEFAULT_WAIT_GRAPH_TIMEOUT_MS: u64 = 5000;

/// How long a stopping graph waits for each subgraph task to finish.
pub const COMPLETE_WAIT_TIME_MS: u64 = 1000;

// === Channel Capacities ===

/// Default buffer size of each subgraph's done-event channel.
///
/// A done event announces that one producer subgraph finished a frame. The
/// channel is bounded so a fast producer is throttled by its consumers.
pub const DEFAULT_DONE_EVENT_CAPACITY: usize = 64;

/// Default buffer size of the per-graph error channel.
pub const DEFAULT_ERROR_QUEUE_CAPACITY: usize = 32;

/// Default buffer size of the per-graph schedule channel.
pub const DEFAULT_SCHEDULE_QUEUE_CAPACITY: usize = 32;

// === Tracing ===

/// Number of frame stamps the performance monitor keeps.
pub const MAX_TRACE_FRAME_NUM: usize = 100;

// === User Structs ===

/// First type id handed out by `register_user_struct`.
pub const USER_STRUCT_START: u32 = 0x100;

/// Maximum number of user struct types per context.
pub const MAX_USER_STRUCTS: u32 = 256;
