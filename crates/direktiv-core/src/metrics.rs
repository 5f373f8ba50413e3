// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine metrics.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding application.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Names
// ============================================================================

/// Instances created, per namespace and workflow.
pub const WORKFLOWS_INVOKED: &str = "direktiv_workflows_invoked_total";

/// Instances that completed.
pub const WORKFLOWS_SUCCESS: &str = "direktiv_workflows_success_total";

/// Instances that failed, crashed or were cancelled.
pub const WORKFLOWS_FAILED: &str = "direktiv_workflows_failed_total";

/// Instance run time.
pub const WORKFLOW_DURATION: &str = "direktiv_workflow_duration_ms";

/// Time spent in one state.
pub const STATE_DURATION: &str = "direktiv_state_duration_ms";

/// Registers metric descriptions. Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!(WORKFLOWS_INVOKED, "Workflow instances created");
    describe_counter!(WORKFLOWS_SUCCESS, "Workflow instances completed successfully");
    describe_counter!(WORKFLOWS_FAILED, "Workflow instances that did not complete");
    describe_histogram!(WORKFLOW_DURATION, "Workflow instance duration in milliseconds");
    describe_histogram!(STATE_DURATION, "State duration in milliseconds");
}

// ============================================================================
// Recording
// ============================================================================

fn labels(namespace: &str, workflow: &str) -> [(&'static str, String); 2] {
    [
        ("namespace", namespace.to_string()),
        ("workflow", workflow.to_string()),
    ]
}

/// Records an instance creation.
pub fn record_invoked(namespace: &str, workflow: &str) {
    counter!(WORKFLOWS_INVOKED, &labels(namespace, workflow)).increment(1);
}

/// Records a terminal instance and its duration.
pub fn record_finished(namespace: &str, workflow: &str, success: bool, duration_ms: f64) {
    let labels = labels(namespace, workflow);
    if success {
        counter!(WORKFLOWS_SUCCESS, &labels).increment(1);
    } else {
        counter!(WORKFLOWS_FAILED, &labels).increment(1);
    }
    histogram!(WORKFLOW_DURATION, &labels).record(duration_ms);
}

/// Records the time spent in a state.
pub fn record_state(state: &str, duration_ms: f64) {
    histogram!(STATE_DURATION, "state" => state.to_string()).record(duration_ms);
}
