use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::handoff::RUNTIME_DIR_TOKEN;
use crate::volume::{ConfigVolume, RuntimeDir};
use crate::waiter::WatchedResource;

pub(crate) const DEFAULT_SIGNAL_CHANNEL: &str = "/dev/virtio-ports/org.linuxcontainers.incus";
pub(crate) const DEFAULT_VOLUME_DEVICE: &str = "/dev/disk/by-label/incus_agent";
pub(crate) const DEFAULT_MOUNT_POINT: &str = "/mnt/incus_agent_iso";
pub(crate) const DEFAULT_RUNTIME_DIR: &str = "/run/incus_agent";
pub(crate) const DEFAULT_AGENT_BINARY: &str = "./incus-agent";

/// Deployment settings. Every field has a compiled-in default; a YAML file
/// only needs to name what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WrapperConfig {
    pub signal_channel: WaitConfig,
    pub volume: VolumeConfig,
    pub runtime_dir: PathBuf,
    pub dir_mode: u32,
    pub file_mode: u32,
    pub agent: AgentConfig,
    /// JSONL stage timings; disabled when unset.
    pub ops_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    pub path: PathBuf,
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeConfig {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub binary: PathBuf,
    /// Arguments after argv[0]; `{runtime_dir}` expands to the runtime directory.
    pub args: Vec<String>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            signal_channel: WaitConfig::default(),
            volume: VolumeConfig::default(),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            dir_mode: 0o700,
            file_mode: 0o600,
            agent: AgentConfig::default(),
            ops_log: None,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SIGNAL_CHANNEL),
            timeout_secs: 120,
            interval_ms: 2_000,
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_VOLUME_DEVICE),
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            timeout_secs: 30,
            interval_ms: 500,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_AGENT_BINARY),
            args: vec!["--secrets-location".into(), RUNTIME_DIR_TOKEN.into()],
        }
    }
}

impl WaitConfig {
    pub fn resource(&self) -> WatchedResource {
        WatchedResource {
            path: self.path.clone(),
            deadline: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.interval_ms),
        }
    }
}

impl VolumeConfig {
    /// The device node to wait for before mounting.
    pub fn device_resource(&self) -> WatchedResource {
        WatchedResource {
            path: self.device.clone(),
            deadline: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.interval_ms),
        }
    }

    pub fn config_volume(&self) -> ConfigVolume {
        ConfigVolume {
            device: self.device.clone(),
            mount_point: self.mount_point.clone(),
        }
    }
}

impl WrapperConfig {
    pub fn runtime(&self) -> RuntimeDir {
        RuntimeDir {
            path: self.runtime_dir.clone(),
            dir_mode: self.dir_mode,
            file_mode: self.file_mode,
        }
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    ///
    /// The agent binary is left alone: a relative binary is resolved against
    /// the process working directory at startup.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.signal_channel.path);
        resolve(&mut self.volume.device);
        resolve(&mut self.volume.mount_point);
        resolve(&mut self.runtime_dir);
        if let Some(ops_log) = &mut self.ops_log {
            resolve(ops_log);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.signal_channel.interval_ms == 0 || self.volume.interval_ms == 0 {
            return Err(ConfigError("poll interval must be greater than zero".into()));
        }
        if self.dir_mode > 0o7777 || self.file_mode > 0o7777 {
            return Err(ConfigError(format!(
                "invalid mode: dir_mode={:o} file_mode={:o}",
                self.dir_mode, self.file_mode
            )));
        }
        if self.agent.binary.as_os_str().is_empty() {
            return Err(ConfigError("agent.binary must not be empty".into()));
        }
        Ok(())
    }
}

/// Load the config, starting from the defaults and applying `path` if given.
pub fn load(path: Option<&Path>) -> Result<WrapperConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(WrapperConfig::default());
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("read {}: {e}", path.display())))?;
    let mut config: WrapperConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ConfigError(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Render the effective config as YAML.
pub fn to_yaml(config: &WrapperConfig) -> Result<String, ConfigError> {
    serde_yaml_ng::to_string(config).map_err(|e| ConfigError(format!("serialize config: {e}")))
}
