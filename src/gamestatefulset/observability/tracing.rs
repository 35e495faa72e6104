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

//! Per-sync spans. Every reconcile of a workload runs inside a `tracing`
//! span and a task-local [`SyncContext`], which the logger reads to stamp
//! each line with the trace ids and the workload key being synced.

use rand::{rngs::OsRng, Rng};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct SyncContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
    workload: Arc<str>,
}

impl SyncContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// `namespace/name` of the workload under reconciliation.
    pub fn workload(&self) -> &str {
        &self.workload
    }
}

task_local! {
    static ACTIVE_SYNC: SyncContext;
}

/// Installs the global subscriber filtered by `RUST_LOG` (default `info`).
/// Only the first call has an effect.
pub fn init() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry().with(filter));
    });
}

pub fn current_context() -> Option<SyncContext> {
    ACTIVE_SYNC.try_with(SyncContext::clone).ok()
}

/// Runs the sync of `key` inside a fresh span. A sync started from within
/// another one joins its trace.
pub async fn sync_span<T>(key: &str, fut: impl Future<Output = T>) -> T {
    let trace_id = current_context()
        .map(|parent| parent.trace_id)
        .unwrap_or_else(|| format!("{:032x}", OsRng.gen::<u128>()).into());
    let context = SyncContext {
        trace_id,
        span_id: format!("{:016x}", OsRng.gen::<u64>()).into(),
        workload: key.into(),
    };
    let span = tracing::info_span!(
        "sync",
        workload = key,
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    ACTIVE_SYNC.scope(context, fut.instrument(span)).await
}
