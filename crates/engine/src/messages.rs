// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Internal message types of the streaming runtime.

use visionflow_core::{Handle, VisionError};

/// Which bit of a subgraph's per-frame ready mask an event sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// The scheduler released the frame to a subgraph without sources.
    Announce,
    /// Source `n` of the receiving subgraph finished the frame.
    Source(usize),
}

/// Tells a subgraph that one of its inputs is ready for `frame`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DoneEvent {
    pub frame: u64,
    pub trigger: Trigger,
}

/// Requests handled by the schedule task of a streaming graph.
#[derive(Debug)]
pub(crate) enum ScheduleMessage {
    /// Release every frame up to this one to the sourceless subgraphs.
    Frame(u64),
    /// The application pushed `frame` into the input queue `object`.
    Pushed { frame: u64, object: Handle },
}

/// First failure of a streaming graph, kept until `wait_graph` reports it.
#[derive(Debug, Clone)]
pub(crate) struct StreamFailure {
    pub frame: u64,
    pub node: String,
    pub kernel: String,
    pub error: VisionError,
}

/// Frame counters published to `wait_graph`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    /// Highest frame released to the subgraphs.
    pub submitted: u64,
    /// Frames every sink subgraph has finished.
    pub completed: u64,
}

impl Progress {
    pub(crate) const fn inflight(self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }

    pub(crate) const fn is_idle(self) -> bool {
        self.completed >= self.submitted
    }
}
