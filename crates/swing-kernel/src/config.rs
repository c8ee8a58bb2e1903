use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::KernelError;

/// Where a vat's code runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ManagerType {
    /// Liveslots inside the kernel process, called directly.
    #[default]
    Local,
    /// A worker thread over an in-memory byte channel. Cannot block.
    Thread,
    /// A `swing-worker` child process over stdin/stdout. Cannot block.
    Subprocess,
    /// A `swing-worker` child process that waits for syscall answers.
    Isolated,
}

impl ManagerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagerType::Local => "local",
            ManagerType::Thread => "thread",
            ManagerType::Subprocess => "subprocess",
            ManagerType::Isolated => "isolated",
        }
    }

    /// Whether the worker waits for each syscall's answer.
    pub fn is_blocking(self) -> bool {
        matches!(self, ManagerType::Local | ManagerType::Isolated)
    }
}

impl fmt::Display for ManagerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ManagerType::Local),
            "thread" => Ok(ManagerType::Thread),
            "subprocess" => Ok(ManagerType::Subprocess),
            "isolated" | "xsnap" => Ok(ManagerType::Isolated),
            other => Err(KernelError::Config(format!("unknown manager type {other:?}"))),
        }
    }
}

/// Kernel-wide settings.
#[derive(Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Manager used for vats that do not pick one.
    pub default_manager: ManagerType,
    /// Path to the `swing-worker` binary used by out-of-process managers.
    pub worker_bin: Option<PathBuf>,
    /// Deadline for one out-of-process delivery; the worker is killed past it.
    pub delivery_timeout: Option<Duration>,
    /// Computron budget per delivery for vats that do not set one.
    pub default_meter_limit: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_manager: ManagerType::Local,
            worker_bin: None,
            delivery_timeout: None,
            default_meter_limit: None,
        }
    }
}

impl fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConfig")
            .field("default_manager", &self.default_manager.as_str())
            .field("worker_bin", &self.worker_bin)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("default_meter_limit", &self.default_meter_limit)
            .finish()
    }
}

impl KernelConfig {
    /// Read overrides from `SWINGSET_*` environment variables.
    pub fn from_env() -> Result<Self, KernelError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`KernelConfig::from_env`] with a caller-supplied variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KernelError> {
        let mut config = Self::default();
        if let Some(kind) = lookup("SWINGSET_MANAGER_TYPE") {
            config.default_manager = kind.parse()?;
        }
        if let Some(path) = lookup("SWINGSET_WORKER_BIN") {
            if !path.is_empty() {
                config.worker_bin = Some(PathBuf::from(path));
            }
        }
        if let Some(ms) = lookup("SWINGSET_DELIVERY_TIMEOUT_MS") {
            config.delivery_timeout = Some(Duration::from_millis(parse_number(
                "SWINGSET_DELIVERY_TIMEOUT_MS",
                &ms,
            )?));
        }
        if let Some(limit) = lookup("SWINGSET_METER_LIMIT") {
            config.default_meter_limit = Some(parse_number("SWINGSET_METER_LIMIT", &limit)?);
        }
        Ok(config)
    }

    pub fn with_default_manager(mut self, manager: ManagerType) -> Self {
        self.default_manager = manager;
        self
    }

    pub fn with_worker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_bin = Some(path.into());
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = Some(timeout);
        self
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, KernelError> {
    raw.trim()
        .parse()
        .map_err(|_| KernelError::Config(format!("{name} must be a non-negative integer, got {raw:?}")))
}

/// Per-vat settings, persisted as `{vatID}.options`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    pub bundle: String,
    #[serde(default)]
    pub vat_parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_type: Option<ManagerType>,
    #[serde(default = "enabled")]
    pub enable_transcript: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_limit: Option<u64>,
}

fn enabled() -> bool {
    true
}

impl VatOptions {
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            vat_parameters: serde_json::Value::Null,
            manager_type: None,
            enable_transcript: true,
            meter_limit: None,
        }
    }

    pub fn with_parameters(mut self, params: serde_json::Value) -> Self {
        self.vat_parameters = params;
        self
    }

    pub fn with_manager(mut self, manager: ManagerType) -> Self {
        self.manager_type = Some(manager);
        self
    }

    pub fn with_meter_limit(mut self, limit: u64) -> Self {
        self.meter_limit = Some(limit);
        self
    }

    pub fn without_transcript(mut self) -> Self {
        self.enable_transcript = false;
        self
    }
}
