//! Boot sequence:
//! 1. Resolve the agent binary (before any chdir)
//! 2. Wait for the virtio-serial signaling channel
//! 3. Create the runtime directory
//! 4. Unless already provisioned: wait for the config drive, then extract it
//! 5. Verify the required TLS files
//! 6. chdir into the runtime directory and exec the agent

use std::time::Instant;

use guest_common::telemetry::OpsLog;
use tracing::info;

use crate::config::WrapperConfig;
use crate::error::{WrapperError, WrapperResult};
use crate::handoff::{self, HandoffSpec};
use crate::volume::{self, Mounter, SystemMounter};
use crate::{guard, waiter};

pub struct Orchestrator<M = SystemMounter> {
    config: WrapperConfig,
    mounter: M,
    ops: OpsLog,
}

impl Orchestrator<SystemMounter> {
    pub fn new(config: WrapperConfig) -> Self {
        Self::with_mounter(config, SystemMounter)
    }
}

impl<M: Mounter> Orchestrator<M> {
    pub fn with_mounter(config: WrapperConfig, mounter: M) -> Self {
        let ops = OpsLog::new(config.ops_log.clone());
        Self {
            config,
            mounter,
            ops,
        }
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Run every step up to the exec and return what to exec.
    pub fn prepare(&self) -> WrapperResult<HandoffSpec> {
        let binary = handoff::resolve_binary(&self.config.agent.binary)?;

        self.stage("wait_signal_channel", || {
            waiter::wait(&self.config.signal_channel.resource())
        })?;

        let runtime = self.config.runtime();
        volume::ensure_dir(&runtime.path, runtime.dir_mode)?;

        if guard::already_provisioned(&runtime.path) {
            info!(
                runtime_dir = %runtime.path.display(),
                "certificates already present, skipping config drive"
            );
        } else {
            self.stage("wait_volume_device", || {
                waiter::wait(&self.config.volume.device_resource())
            })?;
            let report = self.stage("provision", || {
                volume::provision(&self.mounter, &self.config.volume.config_volume(), &runtime)
            })?;
            info!(
                copied = report.copied.len(),
                denied = report.denied.len(),
                "certificates copied from config drive"
            );
        }

        self.stage("verify", || guard::verify_required(&runtime.path))?;

        Ok(HandoffSpec::new(
            binary,
            &self.config.agent.args,
            &runtime.path,
        ))
    }

    /// Provision, then replace this process with the agent.
    ///
    /// Only returns on failure.
    pub fn run(&self) -> WrapperError {
        let start = Instant::now();
        let spec = match self.prepare() {
            Ok(spec) => spec,
            Err(e) => return e,
        };
        self.ops.record("handoff_prepare", start.elapsed(), true, None);

        let err = spec.exec();
        self.ops.record("handoff", start.elapsed(), false, Some(&err.to_string()));
        WrapperError::from(err)
    }

    /// Time `f` and record it in the ops log under `action`.
    fn stage<T, E, F>(&self, action: &str, f: F) -> Result<T, WrapperError>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<WrapperError> + std::fmt::Display,
    {
        let start = Instant::now();
        let result = f();
        match &result {
            Ok(_) => self.ops.record(action, start.elapsed(), true, None),
            Err(e) => self
                .ops
                .record(action, start.elapsed(), false, Some(&e.to_string())),
        }
        result.map_err(Into::into)
    }
}
