/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSetStatus;
use crate::gamestatefulset::k8s::meta::DEFAULT_NAMESPACE;

const REPLICA_STATES: [&str; 4] = ["desired", "ready", "current", "updated"];

struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    sync_duration: HistogramVec,
    workload_replicas: IntGaugeVec,
    inplace_updates: IntCounterVec,
    hook_runs_created: IntCounterVec,
    workqueue_depth: IntGauge,
}

impl Metrics {
    fn register() -> Self {
        let registry = Registry::new_custom(Some("gamestatefulset".to_string()), None)
            .expect("failed to initialise gamestatefulset metrics registry");
        let counter = |name: &str, help: &str, labels: &[&str]| {
            let counter = IntCounterVec::new(Opts::new(name, help), labels)
                .expect("failed to build gamestatefulset counter");
            registry
                .register(Box::new(counter.clone()))
                .expect("failed to register gamestatefulset counter");
            counter
        };
        let reconciles = counter(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
            &["controller", "result"],
        );
        let inplace_updates = counter(
            "inplace_updates_total",
            "In-place and hot-patch pod updates grouped by strategy and result",
            &["strategy", "result"],
        );
        let hook_runs_created = counter(
            "hook_runs_created_total",
            "Hook runs created by the controller grouped by hook type",
            &["type"],
        );

        let sync_duration = HistogramVec::new(
            HistogramOpts::new(
                "controller_sync_duration_seconds",
                "Wall time spent in a single controller sync",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["controller"],
        )
        .expect("failed to build controller sync histogram");
        let workload_replicas = IntGaugeVec::new(
            Opts::new(
                "workload_replicas",
                "Replica counts of each GameStatefulSet grouped by state",
            ),
            &["namespace", "workload", "state"],
        )
        .expect("failed to build workload replica gauge");
        let workqueue_depth =
            IntGauge::new("workqueue_depth", "Keys waiting in the controller queue")
                .expect("failed to build workqueue depth gauge");
        registry
            .register(Box::new(sync_duration.clone()))
            .and_then(|_| registry.register(Box::new(workload_replicas.clone())))
            .and_then(|_| registry.register(Box::new(workqueue_depth.clone())))
            .expect("failed to register gamestatefulset metrics");

        Self {
            registry,
            reconciles,
            sync_duration,
            workload_replicas,
            inplace_updates,
            hook_runs_created,
            workqueue_depth,
        }
    }
}

fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::register)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerReconcileResult {
    Success,
    Error,
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    let label = result_label(result == ControllerReconcileResult::Success);
    metrics().reconciles.with_label_values(&[controller, label]).inc();
}

pub fn observe_sync_duration(controller: &str, elapsed: Duration) {
    metrics()
        .sync_duration
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn record_workload_status(namespace: Option<&str>, workload: &str, status: &GameStatefulSetStatus) {
    let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
    let values = [
        status.replicas,
        status.ready_replicas,
        status.current_replicas,
        status.updated_replicas,
    ];
    for (state, value) in REPLICA_STATES.iter().zip(values) {
        metrics()
            .workload_replicas
            .with_label_values(&[namespace, workload, state])
            .set(i64::from(value));
    }
}

pub fn clear_workload(namespace: Option<&str>, workload: &str) {
    let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
    for state in REPLICA_STATES {
        let _ = metrics()
            .workload_replicas
            .remove_label_values(&[namespace, workload, state]);
    }
}

pub fn record_inplace_update(strategy: &str, success: bool) {
    metrics()
        .inplace_updates
        .with_label_values(&[strategy, result_label(success)])
        .inc();
}

pub fn record_hook_run_created(hook_type: &str) {
    metrics().hook_runs_created.with_label_values(&[hook_type]).inc();
}

pub fn set_workqueue_depth(depth: usize) {
    metrics()
        .workqueue_depth
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metrics().registry.gather(), &mut buffer)?;
    Ok(buffer)
}
