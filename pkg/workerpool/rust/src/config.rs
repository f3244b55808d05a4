// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::StartupError;
use crate::memory;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SPOOL_DIR: &str = "/var/spool/dd-workerpool";

fn default_name() -> String {
    "workerpool".to_string()
}

fn default_resident_workers() -> usize {
    3
}

fn default_max_workers() -> usize {
    8
}

fn default_thirty() -> u64 {
    30
}

fn default_reserve_timeout_secs() -> u64 {
    2
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_poll_timeout_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOL_DIR)
}

fn default_handler_command() -> String {
    "/bin/sh".to_string()
}

fn default_handler_args() -> Vec<String> {
    vec!["-c".to_string(), "cat >/dev/null".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Add a temporary worker when nobody reports idle.
    #[default]
    Idle,
    /// Add a temporary worker when the backlog outgrows the pool.
    Backlog,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    #[serde(default = "default_handler_command")]
    pub command: String,
    #[serde(default = "default_handler_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            command: default_handler_command(),
            args: default_handler_args(),
            env: HashMap::new(),
        }
    }
}

/// On-disk pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_resident_workers")]
    pub resident_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 0 derives the ceiling from the process memory limit.
    #[serde(default)]
    pub memory_limit_mb: u64,
    /// 0 disables the watchdog.
    #[serde(default = "default_thirty")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_thirty")]
    pub idle_timeout_secs: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub tasks_per_worker: u64,
    #[serde(default = "default_reserve_timeout_secs")]
    pub reserve_timeout_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    pub heartbeat_socket: Option<PathBuf>,
    #[serde(default)]
    pub scaling: ScalingMode,
    #[serde(default)]
    pub replace_retired_residents: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
}

impl PoolConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if contents.trim().is_empty() {
            return Ok(serde_yaml::from_str("{}")?);
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn limits(&self) -> Result<Limits> {
        let limits = self.build_limits();
        limits.validate()?;
        Ok(limits)
    }

    /// Checked once, by `PoolSettings::validate`.
    pub fn settings(&self) -> Result<PoolSettings> {
        let settings = PoolSettings {
            name: self.name.clone(),
            limits: self.build_limits(),
            reserve_timeout: Duration::from_secs(self.reserve_timeout_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            heartbeat_socket: self.heartbeat_socket.clone(),
            scaling: self.scaling,
            replace_retired_residents: self.replace_retired_residents,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn build_limits(&self) -> Limits {
        Limits {
            max_workers: self.max_workers,
            resident_count: self.resident_workers,
            per_worker_memory_bytes: match self.memory_limit_mb {
                0 => memory::default_memory_limit(),
                mb => mb.saturating_mul(1024 * 1024),
            },
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            tasks_per_worker_quota: (self.tasks_per_worker > 0).then_some(self.tasks_per_worker),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_workers: usize,
    pub resident_count: usize,
    pub per_worker_memory_bytes: u64,
    pub task_timeout: Duration,
    pub idle_timeout: Duration,
    pub tasks_per_worker_quota: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            resident_count: default_resident_workers(),
            per_worker_memory_bytes: memory::default_memory_limit(),
            task_timeout: Duration::from_secs(default_thirty()),
            idle_timeout: Duration::from_secs(default_thirty()),
            tasks_per_worker_quota: None,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.max_workers == 0 {
            return Err(StartupError::InvalidLimits(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.resident_count > self.max_workers {
            return Err(StartupError::InvalidLimits(format!(
                "resident_workers ({}) exceeds max_workers ({})",
                self.resident_count, self.max_workers
            )));
        }
        Ok(())
    }
}

/// Everything the supervisor needs at runtime.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub name: String,
    pub limits: Limits,
    pub reserve_timeout: Duration,
    pub tick_interval: Duration,
    pub poll_timeout: Duration,
    /// Derived from the name and master pid when unset.
    pub heartbeat_socket: Option<PathBuf>,
    pub scaling: ScalingMode,
    pub replace_retired_residents: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            limits: Limits::default(),
            reserve_timeout: Duration::from_secs(default_reserve_timeout_secs()),
            tick_interval: Duration::from_millis(default_tick_interval_ms()),
            poll_timeout: Duration::from_millis(default_poll_timeout_ms()),
            heartbeat_socket: None,
            scaling: ScalingMode::default(),
            replace_retired_residents: false,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<(), StartupError> {
        self.limits.validate()?;
        if self.reserve_timeout.is_zero() {
            return Err(StartupError::InvalidLimits(
                "reserve_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
