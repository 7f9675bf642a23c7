//! Terminal exec into the agent.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::error::HandoffError;

/// Placeholder in configured agent arguments, replaced by the runtime directory.
pub const RUNTIME_DIR_TOKEN: &str = "{runtime_dir}";

/// Everything needed to replace this process with the agent.
///
/// The environment is inherited unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSpec {
    /// Absolute path, resolved before any chdir.
    pub binary: PathBuf,
    /// Arguments after argv[0].
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Resolve `binary` against the current directory.
///
/// Must run before anything changes the working directory, or a relative
/// path would point somewhere else.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf, HandoffError> {
    std::path::absolute(binary).map_err(|source| HandoffError::ResolveBinary {
        path: binary.to_path_buf(),
        source,
    })
}

impl HandoffSpec {
    /// Build a spec, expanding [`RUNTIME_DIR_TOKEN`] in `args`.
    pub fn new(binary: PathBuf, args: &[String], runtime_dir: &Path) -> Self {
        let dir = runtime_dir.to_string_lossy();
        let args = args
            .iter()
            .map(|a| a.replace(RUNTIME_DIR_TOKEN, &dir))
            .collect();

        Self {
            binary,
            args,
            working_dir: runtime_dir.to_path_buf(),
        }
    }

    /// Change into `working_dir` and exec the agent.
    ///
    /// Never returns on success: the process image is replaced and no
    /// destructors run, so every resource must be released before calling
    /// this. The returned value is always the reason the exec failed.
    pub fn exec(&self) -> HandoffError {
        if let Err(e) = self.check_executable() {
            return e;
        }

        if let Err(source) = std::env::set_current_dir(&self.working_dir) {
            return HandoffError::Chdir {
                path: self.working_dir.clone(),
                source,
            };
        }

        info!(
            binary = %self.binary.display(),
            args = ?self.args,
            cwd = %self.working_dir.display(),
            "exec agent"
        );
        let source = Command::new(&self.binary).args(&self.args).exec();
        HandoffError::Exec {
            binary: self.binary.clone(),
            source,
        }
    }

    fn check_executable(&self) -> Result<(), HandoffError> {
        let meta = std::fs::metadata(&self.binary).map_err(|source| HandoffError::Exec {
            binary: self.binary.clone(),
            source,
        })?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(HandoffError::NotExecutable {
                path: self.binary.clone(),
            });
        }
        Ok(())
    }
}
