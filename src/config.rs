use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::profiler::ProfilerSettings;
use crate::registry::RegistrySettings;

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ProfilerConfig::default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub trace_handlers: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerConfig {
    /// Reject a handler whose name is already used on the same event.
    #[serde(default)]
    pub reject_duplicate_names: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorLogConfig {
    #[serde(default = "ErrorLogConfig::default_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default = "ScriptConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub handlers: HandlerConfig,
    #[serde(default)]
    pub errors: ErrorLogConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scripts: ScriptConfig,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchConfigOverrides {
    pub profile: Option<bool>,
    pub trace_handlers: Option<bool>,
    pub script_root: Option<PathBuf>,
}

impl ProfilerConfig {
    const fn default_capacity() -> usize {
        120
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self { enabled: false, capacity: Self::default_capacity(), trace_handlers: false }
    }
}

impl ErrorLogConfig {
    const fn default_capacity() -> usize {
        256
    }
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self { capacity: Self::default_capacity() }
    }
}

impl LogConfig {
    fn default_filter() -> String {
        "kestrel_events=info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: Self::default_filter() }
    }
}

impl ScriptConfig {
    const fn default_poll_interval_ms() -> u64 {
        300
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { root: None, watch: false, poll_interval_ms: Self::default_poll_interval_ms() }
    }
}

impl DispatchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &DispatchConfigOverrides) {
        if let Some(profile) = overrides.profile {
            self.profiler.enabled = profile;
        }
        if let Some(trace) = overrides.trace_handlers {
            self.profiler.trace_handlers = trace;
        }
        if let Some(root) = &overrides.script_root {
            self.scripts.root = Some(root.clone());
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            reject_duplicate_names: self.handlers.reject_duplicate_names,
            profiling: self.profiler.enabled,
            profiler: ProfilerSettings {
                capacity: self.profiler.capacity,
                trace_handlers: self.profiler.trace_handlers,
            },
            error_capacity: self.errors.capacity,
        }
    }
}

impl DispatchConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && self.trace_handlers.is_none() && self.script_root.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.profile.is_some() {
            fields.push("profile");
        }
        if self.trace_handlers.is_some() {
            fields.push("trace_handlers");
        }
        if self.script_root.is_some() {
            fields.push("script_root");
        }
        fields
    }
}
