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

use super::gamestatefulset::HookArgument;
use super::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookRunPhase {
    #[default]
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
}

impl HookRunPhase {
    pub fn is_completed(self) -> bool {
        !matches!(self, HookRunPhase::Pending | HookRunPhase::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            HookRunPhase::Failed | HookRunPhase::Error | HookRunPhase::Inconclusive
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookRunPhase::Pending => "Pending",
            HookRunPhase::Running => "Running",
            HookRunPhase::Successful => "Successful",
            HookRunPhase::Failed => "Failed",
            HookRunPhase::Error => "Error",
            HookRunPhase::Inconclusive => "Inconclusive",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRunSpec {
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<HookArgument>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookRunStatus {
    #[serde(default)]
    pub phase: HookRunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Out-of-band verification run executed by an external analysis agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRun {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: HookRunSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HookRunStatus>,
}

impl Default for HookRun {
    fn default() -> Self {
        Self {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta::default(),
            spec: HookRunSpec::default(),
            status: None,
        }
    }
}

impl HookRun {
    pub fn phase(&self) -> HookRunPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }
}

impl Resource for HookRun {
    const KIND: &'static str = "HookRun";
    const API_VERSION: &'static str = "tkex.tencent.com/v1alpha1";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}
