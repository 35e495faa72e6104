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

pub mod canary;
pub mod control;
pub mod gamestatefulset;
pub mod history;
pub mod identity;
pub mod inplace;
pub mod ownership;
pub mod pod_control;
pub mod predelete;
pub mod requeue;
pub mod retry;
pub mod rollout;
pub mod runtime;
pub mod status;
