// Copyright 2025 Buildmesh Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lazy_static::lazy_static;
use prometheus::{IntCounter, Registry};

lazy_static! {
    static ref BUILDS_SUBMITTED: IntCounter = IntCounter::new(
        "buildmesh_builds_submitted_total",
        "Number of builds accepted by the controller"
    )
    .unwrap();
    static ref BUILDS_ASSIGNED: IntCounter = IntCounter::new(
        "buildmesh_builds_assigned_total",
        "Number of successful build claims"
    )
    .unwrap();
    static ref BUILDS_COMPLETED: IntCounter = IntCounter::new(
        "buildmesh_builds_completed_total",
        "Number of builds completed successfully"
    )
    .unwrap();
    static ref BUILDS_FAILED: IntCounter = IntCounter::new(
        "buildmesh_builds_failed_total",
        "Number of builds that finished in failure (including cancellations)"
    )
    .unwrap();
    static ref BUILDS_REQUEUED: IntCounter = IntCounter::new(
        "buildmesh_builds_requeued_total",
        "Number of builds returned to the queue after a heartbeat timeout"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry.register(Box::new(BUILDS_SUBMITTED.clone())).unwrap();
    registry.register(Box::new(BUILDS_ASSIGNED.clone())).unwrap();
    registry.register(Box::new(BUILDS_COMPLETED.clone())).unwrap();
    registry.register(Box::new(BUILDS_FAILED.clone())).unwrap();
    registry.register(Box::new(BUILDS_REQUEUED.clone())).unwrap();
    registry
}

pub fn record_build_submitted() {
    BUILDS_SUBMITTED.inc();
}

pub fn record_build_assigned() {
    BUILDS_ASSIGNED.inc();
}

pub fn record_build_completed() {
    BUILDS_COMPLETED.inc();
}

pub fn record_build_failed() {
    BUILDS_FAILED.inc();
}

pub fn record_build_requeued() {
    BUILDS_REQUEUED.inc();
}
