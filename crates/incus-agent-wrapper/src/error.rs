use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// A watched path never appeared before its deadline.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {}s waiting for {}", .deadline.as_secs_f64(), .path.display())]
pub struct TimeoutError {
    pub path: PathBuf,
    pub deadline: Duration,
}

/// Failure while extracting files from the mounted volume.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read volume directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copy {} to {}: {source}", .from.display(), .to.display())]
    File {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("create directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mount {} at {}: {source}", .device.display(), .target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The copy failed; `unmount` holds the cleanup failure if that failed too.
    #[error(
        "{copy}{}",
        .unmount.as_ref().map(|e| format!(" (unmount also failed: {e})")).unwrap_or_default()
    )]
    Copy {
        #[source]
        copy: CopyError,
        unmount: Option<nix::Error>,
    },

    #[error("required file missing: {}", .path.display())]
    MissingRequiredFile { name: &'static str, path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("resolve agent binary {}: {source}", .path.display())]
    ResolveBinary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("agent binary is not executable: {}", .path.display())]
    NotExecutable { path: PathBuf },

    #[error("chdir to {}: {source}", .path.display())]
    Chdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("exec {}: {source}", .binary.display())]
    Exec {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Top-level error: every variant is fatal for the process.
#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

impl WrapperError {
    /// Short name of the stage that failed, used as the diagnostic prefix.
    pub fn stage(&self) -> &'static str {
        match self {
            WrapperError::Config(_) => "config",
            WrapperError::Timeout(_) => "wait",
            WrapperError::Provision(ProvisionError::MissingRequiredFile { .. }) => "verify",
            WrapperError::Provision(_) => "provision",
            WrapperError::Handoff(_) => "handoff",
        }
    }
}

pub type WrapperResult<T> = Result<T, WrapperError>;
