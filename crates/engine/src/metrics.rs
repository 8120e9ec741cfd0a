// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry instruments of the engine.

use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::KeyValue;

pub(crate) struct EngineMetrics {
    frames_counter: Counter<u64>,
    kernel_failures_counter: Counter<u64>,
    verifications_counter: Counter<u64>,
    inflight_gauge: Gauge<u64>,
}

impl EngineMetrics {
    pub(crate) fn new() -> Self {
        let meter = opentelemetry::global::meter("visionflow");
        let frames_counter = meter
            .u64_counter("graph.frames_processed")
            .with_description("Frames completed per graph")
            .build();
        let kernel_failures_counter = meter
            .u64_counter("graph.kernel_failures")
            .with_description("Kernel run functions that reported failure")
            .build();
        let verifications_counter = meter
            .u64_counter("graph.verifications")
            .with_description("Graph verifications by outcome")
            .build();
        let inflight_gauge = meter
            .u64_gauge("graph.stream_frames_inflight")
            .with_description("Frames scheduled but not yet completed in streaming graphs")
            .build();
        Self { frames_counter, kernel_failures_counter, verifications_counter, inflight_gauge }
    }

    pub(crate) fn frame_completed(&self, graph: &str) {
        self.frames_counter.add(1, &[KeyValue::new("graph", graph.to_string())]);
    }

    pub(crate) fn kernel_failed(&self, graph: &str, kernel: &str) {
        self.kernel_failures_counter.add(
            1,
            &[KeyValue::new("graph", graph.to_string()), KeyValue::new("kernel", kernel.to_string())],
        );
    }

    pub(crate) fn verified(&self, graph: &str, ok: bool) {
        self.verifications_counter.add(
            1,
            &[
                KeyValue::new("graph", graph.to_string()),
                KeyValue::new("outcome", if ok { "success" } else { "failure" }),
            ],
        );
    }

    pub(crate) fn inflight(&self, graph: &str, frames: u64) {
        self.inflight_gauge.record(frames, &[KeyValue::new("graph", graph.to_string())]);
    }
}
