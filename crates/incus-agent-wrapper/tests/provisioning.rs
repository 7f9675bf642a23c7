use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use incus_agent_wrapper::Orchestrator;
use incus_agent_wrapper::config::{AgentConfig, VolumeConfig, WaitConfig, WrapperConfig};
use incus_agent_wrapper::error::{CopyError, ProvisionError, WrapperError};
use incus_agent_wrapper::volume::Mounter;
use tempfile::TempDir;

/// Stands in for the kernel: "mounting" copies the drive image directory into
/// the mount point, "unmounting" empties it again.
struct FakeDrive {
    image: PathBuf,
    mounts: Cell<u32>,
    unmounts: Cell<u32>,
}

impl FakeDrive {
    fn new(image: PathBuf) -> Self {
        Self {
            image,
            mounts: Cell::new(0),
            unmounts: Cell::new(0),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir(&dest)?;
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

impl Mounter for FakeDrive {
    fn mount(&self, _device: &Path, target: &Path) -> nix::Result<()> {
        self.mounts.set(self.mounts.get() + 1);
        copy_tree(&self.image, target).map_err(|_| nix::Error::EIO)
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        self.unmounts.set(self.unmounts.get() + 1);
        for entry in fs::read_dir(target).map_err(|_| nix::Error::EIO)? {
            let path = entry.map_err(|_| nix::Error::EIO)?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|_| nix::Error::EIO)?;
        }
        Ok(())
    }
}

struct Guest {
    root: TempDir,
}

impl Guest {
    /// A guest whose signaling channel and drive device already exist.
    fn booted() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();
        fs::create_dir_all(root.path().join("image")).unwrap();
        fs::write(root.path().join("dev/vport"), b"").unwrap();
        fs::write(root.path().join("dev/sr0"), b"").unwrap();
        Self { root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn runtime_dir(&self) -> PathBuf {
        self.path("run/incus_agent")
    }

    fn mount_point(&self) -> PathBuf {
        self.path("mnt/incus_agent_iso")
    }

    fn put_on_drive(&self, name: &str, content: &[u8]) {
        let path = self.path("image").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn config(&self) -> WrapperConfig {
        WrapperConfig {
            signal_channel: WaitConfig {
                path: self.path("dev/vport"),
                timeout_secs: 1,
                interval_ms: 50,
            },
            volume: VolumeConfig {
                device: self.path("dev/sr0"),
                mount_point: self.mount_point(),
                timeout_secs: 1,
                interval_ms: 50,
            },
            runtime_dir: self.runtime_dir(),
            agent: AgentConfig {
                binary: self.path("bin/incus-agent"),
                args: vec!["--secrets-location".into(), "{runtime_dir}".into()],
            },
            ops_log: Some(self.path("ops.jsonl")),
            ..WrapperConfig::default()
        }
    }

    fn orchestrator(&self) -> Orchestrator<FakeDrive> {
        Orchestrator::with_mounter(self.config(), FakeDrive::new(self.path("image")))
    }
}

fn put_certs(guest: &Guest) {
    guest.put_on_drive("agent.crt", b"A");
    guest.put_on_drive("agent.key", b"B");
    guest.put_on_drive("server.crt", b"C");
}

fn sorted_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn fresh_boot_copies_drive_and_prepares_handoff() {
    let guest = Guest::booted();
    put_certs(&guest);
    guest.put_on_drive("extra.conf", b"D");
    let orchestrator = guest.orchestrator();

    let spec = orchestrator.prepare().unwrap();

    let runtime = guest.runtime_dir();
    assert_eq!(
        sorted_names(&runtime),
        ["agent.crt", "agent.key", "extra.conf", "server.crt"]
    );
    for (name, content) in [
        ("agent.crt", b"A"),
        ("agent.key", b"B"),
        ("server.crt", b"C"),
        ("extra.conf", b"D"),
    ] {
        assert_eq!(fs::read(runtime.join(name)).unwrap(), content, "{name}");
    }

    let drive = orchestrator.mounter();
    assert_eq!((drive.mounts.get(), drive.unmounts.get()), (1, 1));
    assert!(sorted_names(&guest.mount_point()).is_empty());

    assert_eq!(spec.binary, guest.path("bin/incus-agent"));
    assert!(spec.binary.is_absolute());
    assert_eq!(spec.working_dir, runtime);
    assert_eq!(
        spec.args,
        ["--secrets-location".to_string(), runtime.display().to_string()]
    );
}

#[test]
fn provisioned_runtime_dir_never_touches_drive() {
    let guest = Guest::booted();
    let runtime = guest.runtime_dir();
    fs::create_dir_all(&runtime).unwrap();
    for name in ["agent.crt", "agent.key", "server.crt"] {
        fs::write(runtime.join(name), b"").unwrap();
    }
    // The drive may already be detached after the first boot.
    fs::remove_file(guest.path("dev/sr0")).unwrap();
    let orchestrator = guest.orchestrator();

    let spec = orchestrator.prepare().unwrap();

    assert_eq!(orchestrator.mounter().mounts.get(), 0);
    assert_eq!(orchestrator.mounter().unmounts.get(), 0);
    assert_eq!(spec.working_dir, runtime);
}

#[test]
fn partial_runtime_dir_is_reprovisioned() {
    let guest = Guest::booted();
    put_certs(&guest);
    let runtime = guest.runtime_dir();
    fs::create_dir_all(&runtime).unwrap();
    fs::write(runtime.join("agent.crt"), b"stale").unwrap();
    let orchestrator = guest.orchestrator();

    orchestrator.prepare().unwrap();

    assert_eq!(orchestrator.mounter().mounts.get(), 1);
    assert_eq!(fs::read(runtime.join("agent.crt")).unwrap(), b"A");
}

#[test]
fn failed_second_copy_still_unmounts_once() {
    let guest = Guest::booted();
    put_certs(&guest);
    // agent.key sorts second; a directory in its place makes the write fail.
    fs::create_dir_all(guest.runtime_dir().join("agent.key")).unwrap();
    let orchestrator = guest.orchestrator();

    let err = orchestrator.prepare().unwrap_err();

    match &err {
        WrapperError::Provision(ProvisionError::Copy { copy, unmount }) => {
            assert!(matches!(copy, CopyError::File { to, .. } if to.ends_with("agent.key")));
            assert!(unmount.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.stage(), "provision");
    assert_eq!(orchestrator.mounter().unmounts.get(), 1);
    assert_eq!(fs::read(guest.runtime_dir().join("agent.crt")).unwrap(), b"A");
    assert!(!guest.runtime_dir().join("server.crt").exists());
}

#[test]
fn deny_listed_agent_binary_is_not_copied() {
    let guest = Guest::booted();
    put_certs(&guest);
    guest.put_on_drive("incus-agent", b"\x7fELF");
    guest.put_on_drive("install.sh", b"#!/bin/sh");

    guest.orchestrator().prepare().unwrap();

    assert_eq!(
        sorted_names(&guest.runtime_dir()),
        ["agent.crt", "agent.key", "server.crt"]
    );
}

#[test]
fn drive_subdirectories_are_not_copied() {
    let guest = Guest::booted();
    put_certs(&guest);
    guest.put_on_drive("systemd/incus-agent.service", b"[Unit]");
    guest.put_on_drive("udev/99-incus-agent.rules", b"");

    guest.orchestrator().prepare().unwrap();

    let runtime = guest.runtime_dir();
    assert!(!runtime.join("systemd").exists());
    assert!(!runtime.join("udev").exists());
    assert!(!runtime.join("incus-agent.service").exists());
}

#[test]
fn drive_without_server_cert_fails_verification() {
    let guest = Guest::booted();
    guest.put_on_drive("agent.crt", b"A");
    guest.put_on_drive("agent.key", b"B");
    let orchestrator = guest.orchestrator();

    let err = orchestrator.prepare().unwrap_err();

    assert!(matches!(
        err,
        WrapperError::Provision(ProvisionError::MissingRequiredFile { name: "server.crt", .. })
    ));
    assert_eq!(err.stage(), "verify");
    assert_eq!(orchestrator.mounter().unmounts.get(), 1);
}

#[test]
fn missing_signal_channel_times_out_before_any_mount() {
    let guest = Guest::booted();
    put_certs(&guest);
    fs::remove_file(guest.path("dev/vport")).unwrap();
    let orchestrator = guest.orchestrator();

    let err = orchestrator.prepare().unwrap_err();

    assert!(matches!(&err, WrapperError::Timeout(t) if t.path == guest.path("dev/vport")));
    assert_eq!(err.stage(), "wait");
    assert_eq!(orchestrator.mounter().mounts.get(), 0);
    assert!(!guest.runtime_dir().exists());
}

#[test]
fn missing_drive_device_times_out() {
    let guest = Guest::booted();
    fs::remove_file(guest.path("dev/sr0")).unwrap();
    let orchestrator = guest.orchestrator();

    let err = orchestrator.prepare().unwrap_err();

    assert!(matches!(&err, WrapperError::Timeout(t) if t.path == guest.path("dev/sr0")));
    assert_eq!(orchestrator.mounter().mounts.get(), 0);
    // The runtime directory exists before the drive is waited on.
    assert!(guest.runtime_dir().is_dir());
}

#[test]
fn stages_are_recorded_in_ops_log() {
    let guest = Guest::booted();
    put_certs(&guest);

    guest.orchestrator().prepare().unwrap();

    let log = fs::read_to_string(guest.path("ops.jsonl")).unwrap();
    let actions: Vec<String> = log
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            assert_eq!(v["success"], true);
            v["action_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        actions,
        ["wait_signal_channel", "wait_volume_device", "provision", "verify"]
    );
}
