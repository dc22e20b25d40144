use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FINISH_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ALLOCATION_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Upper bound for `wait_for_message`.
    pub message_timeout_ms: u64,
    /// Upper bound for `finish`.
    pub finish_timeout_ms: u64,
    /// Size of the per-context kernel pool, 0 lets rayon decide.
    pub worker_threads: usize,
    /// Byte budget shared by every allocation of one context.
    pub max_allocation_bytes: u64,
    pub gpu: GpuConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GpuConfig {
    pub enabled: bool,
    pub power_preference: PowerPreference,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerPreference {
    High,
    Low,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            finish_timeout_ms: DEFAULT_FINISH_TIMEOUT_MS,
            worker_threads: 0,
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION_BYTES,
            gpu: GpuConfig::default(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            power_preference: PowerPreference::High,
        }
    }
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(pref: PowerPreference) -> Self {
        match pref {
            PowerPreference::High => wgpu::PowerPreference::HighPerformance,
            PowerPreference::Low => wgpu::PowerPreference::LowPower,
        }
    }
}

impl HarnessConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse harness config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Applies `RS_HARNESS_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("RS_HARNESS_MESSAGE_TIMEOUT_MS") {
            self.message_timeout_ms = v
                .parse()
                .with_context(|| format!("RS_HARNESS_MESSAGE_TIMEOUT_MS={v}"))?;
        }
        if let Some(v) = lookup("RS_HARNESS_FINISH_TIMEOUT_MS") {
            self.finish_timeout_ms = v
                .parse()
                .with_context(|| format!("RS_HARNESS_FINISH_TIMEOUT_MS={v}"))?;
        }
        if let Some(v) = lookup("RS_HARNESS_WORKER_THREADS") {
            self.worker_threads = v
                .parse()
                .with_context(|| format!("RS_HARNESS_WORKER_THREADS={v}"))?;
        }
        Ok(self)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}
