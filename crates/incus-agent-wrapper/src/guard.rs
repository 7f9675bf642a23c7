//! Restart resilience: decide whether the runtime directory already holds
//! the agent's TLS material.

use std::path::Path;

use crate::error::ProvisionError;

/// Files the agent cannot start without.
pub const REQUIRED_FILES: [&str; 3] = ["agent.crt", "agent.key", "server.crt"];

/// True iff every required file exists as a regular file directly in `dir`.
///
/// Evaluated fresh on every boot; a directory holding only part of the set
/// is not trusted and provisioning runs again.
pub fn already_provisioned(dir: &Path) -> bool {
    REQUIRED_FILES
        .iter()
        .all(|name| std::fs::metadata(dir.join(name)).is_ok_and(|m| m.is_file()))
}

/// Fail with the first required file that does not exist in `dir`.
pub fn verify_required(dir: &Path) -> Result<(), ProvisionError> {
    for name in REQUIRED_FILES {
        let path = dir.join(name);
        if std::fs::metadata(&path).is_err() {
            return Err(ProvisionError::MissingRequiredFile { name, path });
        }
    }
    Ok(())
}
