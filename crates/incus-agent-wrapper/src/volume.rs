//! Config drive extraction.
//!
//! One transaction per fresh boot:
//! 1. Create the runtime directory and the mount point (warn if it is not empty)
//! 2. Mount the config drive read-only (iso9660)
//! 3. Copy every top-level regular file that is not deny-listed
//! 4. Unmount, whether or not the copy succeeded
//!
//! Required-file verification is left to the caller.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, info, warn};

use crate::error::{CopyError, ProvisionError};
use crate::guard::REQUIRED_FILES;

/// Filesystem type of the config drive.
pub const FS_TYPE: &str = "iso9660";

/// Names that are never copied off the drive.
///
/// The drive also ships the agent binary and the installer used by the
/// systemd-based bootstrap. Copying them would put a second agent next to
/// the credentials, shadowing the binary this process is about to exec.
pub const DENY_LIST: [&str; 4] = ["incus-agent", "incus-agent-setup", "install.sh", "lxd-agent"];

/// How a top-level file on the drive is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Required,
    Optional,
    Denied,
}

pub fn classify(name: &str) -> FileClass {
    if DENY_LIST.contains(&name) {
        FileClass::Denied
    } else if REQUIRED_FILES.contains(&name) {
        FileClass::Required
    } else {
        FileClass::Optional
    }
}

/// The attached config drive and where it gets mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigVolume {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

/// Destination for provisioned files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDir {
    pub path: PathBuf,
    pub dir_mode: u32,
    pub file_mode: u32,
}

/// Mount operations used by the provisioner.
pub trait Mounter {
    /// Mount `device` read-only at `target`.
    fn mount(&self, device: &Path, target: &Path) -> nix::Result<()>;

    fn unmount(&self, target: &Path) -> nix::Result<()>;
}

/// `mount(2)` / `umount2(2)` against the real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, device: &Path, target: &Path) -> nix::Result<()> {
        mount(
            Some(device),
            target,
            Some(FS_TYPE),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        umount2(target, MntFlags::empty())
    }
}

/// Outcome of a completed transaction.
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Names copied into the runtime directory, in copy order.
    pub copied: Vec<String>,
    /// Deny-listed names found on the drive.
    pub denied: Vec<String>,
    /// Set when the copy succeeded but the cleanup unmount did not.
    pub unmount_error: Option<nix::Error>,
}

/// Create `path` (and parents) with `mode`; an existing directory is fine.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<(), ProvisionError> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|source| ProvisionError::Directory {
            path: path.to_path_buf(),
            source,
        })
}

/// Run the mount, copy, unmount transaction.
pub fn provision<M: Mounter + ?Sized>(
    mounter: &M,
    volume: &ConfigVolume,
    dest: &RuntimeDir,
) -> Result<ProvisionReport, ProvisionError> {
    ensure_dir(&dest.path, dest.dir_mode)?;
    ensure_dir(&volume.mount_point, 0o755)?;
    if !is_empty_dir(&volume.mount_point) {
        warn!(
            mount_point = %volume.mount_point.display(),
            "mount point is not empty, its contents will be hidden by the mount"
        );
    }

    info!(
        device = %volume.device.display(),
        mount_point = %volume.mount_point.display(),
        "mounting config drive"
    );
    mounter
        .mount(&volume.device, &volume.mount_point)
        .map_err(|source| ProvisionError::Mount {
            device: volume.device.clone(),
            target: volume.mount_point.clone(),
            source,
        })?;

    let copied = copy_entries(&volume.mount_point, dest);
    let unmounted = mounter.unmount(&volume.mount_point);

    match (copied, unmounted) {
        (Ok(report), Ok(())) => {
            debug!(mount_point = %volume.mount_point.display(), "config drive unmounted");
            Ok(report)
        }
        (Ok(mut report), Err(e)) => {
            warn!(
                mount_point = %volume.mount_point.display(),
                error = %e,
                "unmount failed after successful copy"
            );
            report.unmount_error = Some(e);
            Ok(report)
        }
        (Err(copy), unmounted) => {
            let unmount = unmounted.err();
            if let Some(e) = &unmount {
                warn!(mount_point = %volume.mount_point.display(), error = %e, "unmount failed");
            }
            Err(ProvisionError::Copy { copy, unmount })
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

/// Copy the flat top level of `src` into `dest`, sorted by name.
fn copy_entries(src: &Path, dest: &RuntimeDir) -> Result<ProvisionReport, CopyError> {
    let read_dir_err = |source: io::Error| CopyError::ReadDir {
        path: src.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(src)
        .map_err(read_dir_err)?
        .collect::<io::Result<Vec<_>>>()
        .map_err(read_dir_err)?;
    entries.sort_by_key(|e| e.file_name());

    let mut report = ProvisionReport::default();
    for entry in entries {
        let file_name = entry.file_name();
        // Lossy form is for logs and the report only.
        let name = file_name.to_string_lossy().into_owned();
        let from = entry.path();

        // Follow symlinks so a link to a directory is skipped too.
        if fs::metadata(&from).is_ok_and(|m| m.is_dir()) {
            debug!(name = %name, "skipping directory");
            continue;
        }

        match classify(&name) {
            FileClass::Denied => {
                info!(name = %name, "skipping deny-listed file");
                report.denied.push(name);
            }
            class => {
                let to = dest.path.join(&file_name);
                copy_file(&from, &to, dest.file_mode).map_err(|source| CopyError::File {
                    from: from.clone(),
                    to,
                    source,
                })?;
                info!(name = %name, required = class == FileClass::Required, "copied");
                report.copied.push(name);
            }
        }
    }

    Ok(report)
}

fn copy_file(from: &Path, to: &Path, mode: u32) -> io::Result<()> {
    let mut input = File::open(from)?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(to)?;
    // `mode` only applies on creation; tighten files left by an earlier boot.
    output.set_permissions(fs::Permissions::from_mode(mode))?;
    io::copy(&mut input, &mut output)?;
    output.sync_all()
}
