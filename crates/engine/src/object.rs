// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Entries of the context's object table.

use crate::graph::Graph;
use crate::node::Node;
use std::sync::Arc;
use visionflow_core::{DataRef, Delay, Kernel, RefHeader, ReferenceType, Status};

/// Immutable object standing for one status code.
#[derive(Debug)]
pub struct ErrorObject {
    header: RefHeader,
    status: Status,
}

impl ErrorObject {
    pub(crate) fn new(status: Status) -> Self {
        let header = RefHeader::new(ReferenceType::Error, None);
        header.set_name(format!("error_{status:?}").to_lowercase());
        Self { header, status }
    }

    pub const fn header(&self) -> &RefHeader {
        &self.header
    }

    pub const fn status(&self) -> Status {
        self.status
    }
}

/// Everything a handle can point at.
#[derive(Clone)]
pub(crate) enum Object {
    Data(DataRef),
    Delay(Arc<Delay>),
    Kernel(Arc<Kernel>),
    Node(Arc<Node>),
    Graph(Arc<Graph>),
    Error(Arc<ErrorObject>),
}

impl Object {
    pub(crate) fn header(&self) -> &RefHeader {
        match self {
            Self::Data(data) => data.header(),
            Self::Delay(delay) => delay.header(),
            Self::Kernel(kernel) => kernel.header(),
            Self::Node(node) => node.header(),
            Self::Graph(graph) => graph.header(),
            Self::Error(error) => error.header(),
        }
    }

    pub(crate) const fn kind_name(&self) -> &'static str {
        match self {
            Self::Data(_) => "data object",
            Self::Delay(_) => "delay",
            Self::Kernel(_) => "kernel",
            Self::Node(_) => "node",
            Self::Graph(_) => "graph",
            Self::Error(_) => "error object",
        }
    }
}
