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

//! Structured log lines for the controller.
//!
//! A line is an ordered list of fields rendered either as `key=value` text
//! or as one JSON object. Lines emitted inside a sync carry the trace ids and
//! the workload key of that sync.

use crate::gamestatefulset::observability::tracing::{self, SyncContext};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

const SERVICE_NAME: &str = "gamestatefulset";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    if JSON_OUTPUT.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Selects the output format and installs the span subscriber. Called once
/// when the controller starts.
pub fn init(format: LogFormat) {
    set_log_format(format);
    tracing::init();
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Builds the field list of one line. Caller metadata comes last; an empty
/// key is dropped and a caller-supplied `workload` replaces the sync's.
fn fields<'a>(
    timestamp: &'a str,
    level: LogLevel,
    component: &'a str,
    message: &'a str,
    sync: Option<&'a SyncContext>,
    metadata: &'a [(&'a str, &'a str)],
) -> Vec<(&'a str, &'a str)> {
    let mut fields = vec![
        ("ts", timestamp),
        ("level", level.as_str()),
        ("service", SERVICE_NAME),
        ("component", component),
        ("msg", message),
    ];
    if let Some(sync) = sync {
        fields.push(("trace_id", sync.trace_id()));
        fields.push(("span_id", sync.span_id()));
        if !metadata.iter().any(|(key, _)| *key == "workload") {
            fields.push(("workload", sync.workload()));
        }
    }
    fields.extend(metadata.iter().copied().filter(|(key, _)| !key.is_empty()));
    fields
}

fn render(format: LogFormat, fields: &[(&str, &str)]) -> String {
    match format {
        LogFormat::Text => fields
            .iter()
            .map(|(key, value)| format!("{key}={}", quote(value)))
            .collect::<Vec<_>>()
            .join(" "),
        LogFormat::Json => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
                .collect::<Map<_, _>>(),
        )
        .to_string(),
    }
}

/// Quotes a text value when it is empty or contains whitespace or a
/// character used by the line syntax.
fn quote(value: &str) -> Cow<'_, str> {
    let bare = !value.is_empty()
        && !value.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
        });
    if bare {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value:?}"))
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let sync = tracing::current_context();
    let line = render(
        current_log_format(),
        &fields(&timestamp, level, component, message, sync.as_ref(), metadata),
    );
    sink::write(level, line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
mod sink {
    use super::LogLevel;
    use std::io::{self, Write};

    /// Warnings and errors go to stderr, everything else to stdout.
    pub(super) fn write(level: LogLevel, line: String) {
        let result = match level {
            LogLevel::Warn | LogLevel::Error => writeln!(io::stderr().lock(), "{line}"),
            LogLevel::Debug | LogLevel::Info => writeln!(io::stdout().lock(), "{line}"),
        };
        if let Err(err) = result {
            let _ = writeln!(io::stderr().lock(), "{}: dropped log line: {err}", super::SERVICE_NAME);
        }
    }
}


#[cfg(test)]
pub(crate) use sink::take as take_test_logs;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestatefulset::observability::tracing::{current_context, sync_span};
    use serial_test::serial;

    #[test]
    fn text_lines_quote_only_when_needed() {
        let line = render(
            LogFormat::Text,
            &[("msg", "Scaling down pod"), ("pod", "web-2"), ("error", "rv=\"7\"")],
        );
        assert_eq!(line, "msg=\"Scaling down pod\" pod=web-2 error=\"rv=\\\"7\\\"\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[test]
    fn json_lines_keep_every_field() {
        let metadata = [("key", "default/web"), ("", "dropped")];
        let list = fields("ts", LogLevel::Warn, "unit", "hello", None, &metadata);
        let payload: Value = serde_json::from_str(&render(LogFormat::Json, &list)).expect("json");
        assert_eq!(payload["level"], "WARN");
        assert_eq!(payload["component"], "unit");
        assert_eq!(payload["key"], "default/web");
        assert!(payload.get("").is_none());
        assert!(payload.get("trace_id").is_none());
    }

    #[tokio::test]
    async fn sync_context_stamps_the_workload() {
        let list = sync_span("default/web", async {
            let sync = current_context().expect("sync context");
            fields("ts", LogLevel::Info, "unit", "msg", Some(&sync), &[])
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<Vec<_>>()
        })
        .await;
        let keys: Vec<&str> = list.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            ["ts", "level", "service", "component", "msg", "trace_id", "span_id", "workload"]
        );
        assert_eq!(list[7].1, "default/web");
    }

    #[tokio::test]
    async fn explicit_workload_is_not_duplicated() {
        sync_span("default/web", async {
            let sync = current_context().expect("sync context");
            let metadata = [("workload", "default/db")];
            let list = fields("ts", LogLevel::Info, "unit", "msg", Some(&sync), &metadata);
            let workloads: Vec<&str> = list
                .iter()
                .filter(|(key, _)| *key == "workload")
                .map(|(_, value)| *value)
                .collect();
            assert_eq!(workloads, ["default/db"]);
        })
        .await;
    }

    #[tokio::test]
    #[serial]
    async fn lines_inside_a_sync_reach_the_sink() {
        sync_span("default/web", async {
            log_info("unit", "sink-marker", &[]);
        })
        .await;
        let lines: Vec<String> = take_test_logs()
            .into_iter()
            .map(|(_, line)| line)
            .filter(|line| line.contains("sink-marker"))
            .collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("default/web"), "{}", lines[0]);
    }

    #[test]
    fn parses_log_format() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
