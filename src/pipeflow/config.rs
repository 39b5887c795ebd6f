// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Loaded from an optional YAML file, then overridden by `PIPEFLOW_*`
//! environment variables.

use crate::adk::error::{EngineError, Result};
use crate::pipeflow::pipeline::types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite URL; in-memory store when unset
    pub database_url: Option<String>,
    pub agent_service_url: String,
    pub agent_timeout_secs: u64,
    /// Default cap on in-flight nodes per run
    pub max_concurrency: usize,
    /// How long cancelled executors get to wind down
    pub cancel_grace_ms: u64,
    pub run_timeout_secs: Option<u64>,
    pub max_loop_iterations: u32,
    pub event_capacity: usize,
    /// Applied to nodes without their own retry policy
    pub default_retry: Option<RetryPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            agent_service_url: "http://localhost:8000".to_string(),
            agent_timeout_secs: 300,
            max_concurrency: 8,
            cancel_grace_ms: 500,
            run_timeout_secs: None,
            max_loop_iterations: 10,
            event_capacity: 256,
            default_retry: None,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the file (if any), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `PIPEFLOW_*` overrides read through `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PIPEFLOW_DATABASE_URL") {
            self.database_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("PIPEFLOW_AGENT_SERVICE_URL") {
            self.agent_service_url = v;
        }
        if let Some(v) = lookup("PIPEFLOW_AGENT_TIMEOUT_SECS") {
            self.agent_timeout_secs = parse_var("PIPEFLOW_AGENT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PIPEFLOW_MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("PIPEFLOW_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("PIPEFLOW_CANCEL_GRACE_MS") {
            self.cancel_grace_ms = parse_var("PIPEFLOW_CANCEL_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("PIPEFLOW_RUN_TIMEOUT_SECS") {
            self.run_timeout_secs = Some(parse_var("PIPEFLOW_RUN_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("PIPEFLOW_MAX_LOOP_ITERATIONS") {
            self.max_loop_iterations = parse_var("PIPEFLOW_MAX_LOOP_ITERATIONS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::config("max_concurrency must be at least 1"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(EngineError::config("agent_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::config(format!("{} has invalid value '{}'", key, value)))
}
