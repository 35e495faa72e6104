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

use crate::gamestatefulset::controller::retry::Backoff;
use crate::gamestatefulset::controller::runtime::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::gamestatefulset::logger::LogFormat;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Workers,
    LogFormat,
    HookPollInterval,
    StatusUpdateRetries,
    PodUpdateRetries,
    QueueBaseDelay,
    QueueMaxDelay,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Workers => "GSTS_WORKERS",
            Config::LogFormat => "GSTS_LOG_FORMAT",
            Config::HookPollInterval => "GSTS_HOOK_POLL_INTERVAL",
            Config::StatusUpdateRetries => "GSTS_STATUS_UPDATE_RETRIES",
            Config::PodUpdateRetries => "GSTS_POD_UPDATE_RETRIES",
            Config::QueueBaseDelay => "GSTS_QUEUE_BASE_DELAY",
            Config::QueueMaxDelay => "GSTS_QUEUE_MAX_DELAY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub log_format: LogFormat,
    /// How often a running hook run or an unfinished pause is re-checked.
    pub hook_poll_interval: Duration,
    pub status_update_retries: u32,
    pub pod_update_retries: u32,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub retry_backoff: Backoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            log_format: LogFormat::Text,
            hook_poll_interval: Duration::from_secs(10),
            status_update_retries: 10,
            pod_update_retries: 5,
            queue_base_delay: DEFAULT_BASE_DELAY,
            queue_max_delay: DEFAULT_MAX_DELAY,
            retry_backoff: Backoff::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from `lookup`, falling back to defaults for unset
    /// variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            workers: parse_number(&lookup, Config::Workers)?.unwrap_or(defaults.workers),
            log_format: parse_with(&lookup, Config::LogFormat, |raw| raw.parse::<LogFormat>())?
                .unwrap_or(defaults.log_format),
            hook_poll_interval: parse_duration(&lookup, Config::HookPollInterval)?
                .unwrap_or(defaults.hook_poll_interval),
            status_update_retries: parse_number(&lookup, Config::StatusUpdateRetries)?
                .unwrap_or(defaults.status_update_retries),
            pod_update_retries: parse_number(&lookup, Config::PodUpdateRetries)?
                .unwrap_or(defaults.pod_update_retries),
            queue_base_delay: parse_duration(&lookup, Config::QueueBaseDelay)?
                .unwrap_or(defaults.queue_base_delay),
            queue_max_delay: parse_duration(&lookup, Config::QueueMaxDelay)?
                .unwrap_or(defaults.queue_max_delay),
            retry_backoff: defaults.retry_backoff,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid(Config::Workers, "0", "at least one worker is required"));
        }
        if self.status_update_retries == 0 {
            return Err(invalid(Config::StatusUpdateRetries, "0", "must be positive"));
        }
        if self.pod_update_retries == 0 {
            return Err(invalid(Config::PodUpdateRetries, "0", "must be positive"));
        }
        if self.hook_poll_interval.is_zero() {
            return Err(invalid(Config::HookPollInterval, "0s", "must be positive"));
        }
        if self.queue_base_delay > self.queue_max_delay {
            return Err(invalid(
                Config::QueueBaseDelay,
                &humantime::format_duration(self.queue_base_delay).to_string(),
                "must not exceed GSTS_QUEUE_MAX_DELAY",
            ));
        }
        Ok(())
    }
}

fn invalid(config: Config, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var: config.env_var(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_with<F, T, P, E>(lookup: &F, config: Config, parse: P) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: FnOnce(&str) -> Result<T, E>,
    E: ToString,
{
    match lookup(config.env_var()) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse(raw.trim())
            .map(Some)
            .map_err(|err| invalid(config, &raw, &err.to_string())),
    }
}

fn parse_number<F, T>(lookup: &F, config: Config) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    parse_with(lookup, config, |raw| raw.parse::<T>())
}

fn parse_duration<F>(lookup: &F, config: Config) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_with(lookup, config, humantime::parse_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ControllerConfig::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.queue_base_delay, Duration::from_millis(5));
        assert_eq!(config.queue_max_delay, Duration::from_secs(1000));
    }

    #[test]
    fn parses_humantime_and_numbers() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("GSTS_WORKERS", "8"),
            ("GSTS_LOG_FORMAT", "json"),
            ("GSTS_HOOK_POLL_INTERVAL", "2s 500ms"),
            ("GSTS_POD_UPDATE_RETRIES", "3"),
        ]))
        .expect("valid config");
        assert_eq!(config.workers, 8);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.hook_poll_interval, Duration::from_millis(2500));
        assert_eq!(config.pod_update_retries, 3);
    }

    #[test]
    fn rejects_bad_values() {
        let err = ControllerConfig::from_lookup(lookup(&[("GSTS_WORKERS", "many")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("GSTS_WORKERS"), "{err}");

        let err = ControllerConfig::from_lookup(lookup(&[("GSTS_WORKERS", "0")]))
            .expect_err("zero workers");
        assert!(err.to_string().contains("at least one worker"), "{err}");

        let err = ControllerConfig::from_lookup(lookup(&[
            ("GSTS_QUEUE_BASE_DELAY", "10s"),
            ("GSTS_QUEUE_MAX_DELAY", "1s"),
        ]))
        .expect_err("base above max");
        assert!(err.to_string().contains("GSTS_QUEUE_BASE_DELAY"), "{err}");
    }

    #[test]
    #[serial]
    fn reads_process_environment() {
        env::set_var("GSTS_STATUS_UPDATE_RETRIES", "4");
        let config = ControllerConfig::from_env();
        env::remove_var("GSTS_STATUS_UPDATE_RETRIES");
        assert_eq!(config.expect("env config").status_update_retries, 4);
    }
}
