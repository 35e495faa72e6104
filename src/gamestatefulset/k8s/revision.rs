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

use super::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable, numbered snapshot of a workload's pod template.
///
/// `data` holds the structural patch produced from the workload, not a full
/// copy of it. Two snapshots are equal when their serialized data is
/// byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevision {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub revision: i64,
}

impl Default for ControllerRevision {
    fn default() -> Self {
        Self {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta::default(),
            data: Value::Null,
            revision: 0,
        }
    }
}

impl ControllerRevision {
    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    /// Canonical bytes of the stored patch. Object keys serialize sorted, so
    /// equal patches always yield equal bytes.
    pub fn raw_data(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.data)
    }
}

impl Resource for ControllerRevision {
    const KIND: &'static str = "ControllerRevision";
    const API_VERSION: &'static str = "apps/v1";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
