//! Blocking wait for hypervisor-provided device nodes.
//!
//! Nothing at this boot stage notifies user space when a virtio port or a
//! block device shows up, so readiness is detected by polling `stat`.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::TimeoutError;

/// A filesystem entry whose existence signals that a resource is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedResource {
    pub path: PathBuf,
    pub deadline: Duration,
    pub poll_interval: Duration,
}

/// Block until `resource.path` exists or `resource.deadline` has elapsed.
///
/// The first check happens before any sleep. Any successful `stat` counts as
/// present; every error, including `EACCES`, counts as not yet present. The
/// last sleep is clamped to the deadline so a timeout is reported no later
/// than one poll interval past it.
pub fn wait(resource: &WatchedResource) -> Result<(), TimeoutError> {
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if std::fs::metadata(&resource.path).is_ok() {
            info!(
                path = %resource.path.display(),
                attempts,
                elapsed_ms = start.elapsed().as_millis(),
                "resource present"
            );
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= resource.deadline {
            return Err(TimeoutError {
                path: resource.path.clone(),
                deadline: resource.deadline,
            });
        }

        if attempts == 1 {
            info!(path = %resource.path.display(), "waiting for resource");
        } else {
            debug!(path = %resource.path.display(), attempts, "still waiting");
        }

        thread::sleep(resource.poll_interval.min(resource.deadline - elapsed));
    }
}
