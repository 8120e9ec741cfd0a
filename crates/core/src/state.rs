// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graph and node lifecycle states.
//!
//! ## Graph state machine
//!
//! ```text
//!     Unverified ──verify──▶ Verified ──process/schedule──▶ Running
//!         ▲                     ▲                             │
//!         │                     └────── Completed ◀───────────┤
//!         │                                                   │
//!         └──── structural change ───── Abandoned ◀───────────┘
//! ```
//!
//! Any structural mutation returns a graph to `Unverified`. `Completed` and
//! `Abandoned` still count as verified: the next execution reuses the
//! verification result.

use crate::error::Status;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    #[default]
    Unverified,
    Verified,
    /// A frame is being processed or the stream is scheduled.
    Running,
    /// The last execution failed or a node callback abandoned it.
    Abandoned,
    /// The last execution finished successfully.
    Completed,
}

impl GraphState {
    /// Parameters and structure are immutable while working.
    pub const fn is_working(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Execution status of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Never executed since creation or the last verification.
    #[default]
    Pending,
    Success,
    Failed {
        status: Status,
        message: String,
    },
}

impl NodeStatus {
    pub fn status(&self) -> Status {
        match self {
            Self::Success => Status::Success,
            Self::Pending => Status::Failure,
            Self::Failed { status, .. } => *status,
        }
    }
}

/// Returned by a node completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAction {
    Continue,
    /// Stop the graph; the remaining nodes of the frame are not executed.
    Abandon,
}
