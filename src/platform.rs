// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Facts about the running system: kernel command line, device-tree
//! identity, mounted filesystems, vboot key locations.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use command_run::Command;
use fs_err as fs;
use regex::Regex;

/// Tokens of the booted kernel's command line. Missing /proc/cmdline
/// (containers, tests) yields an empty list.
pub fn kernel_cmdline() -> Vec<String> {
    kernel_cmdline_from(Utf8Path::new("/proc/cmdline"))
}

pub fn kernel_cmdline_from(path: &Utf8Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text.split_whitespace().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

/// The value the bootloader substituted for the `kern_guid=%U` token,
/// i.e. the partition UUID we booted from.
pub fn kern_guid(cmdline: &[String]) -> Option<&str> {
    cmdline
        .iter()
        .find_map(|arg| arg.strip_prefix("kern_guid="))
}

/// Whether the ChromeOS firmware booted this system.
pub fn is_cros_boot() -> bool {
    if Utf8Path::new("/proc/device-tree/firmware/chromeos").is_dir() {
        return true;
    }
    // ChromeOS firmware injects this into the kernel cmdline.
    kernel_cmdline().iter().any(|arg| arg == "cros_secure")
}

/// The device-tree compatible strings for this machine, best match
/// first. NUL-separated in the procfs file.
pub fn dt_compatibles() -> Vec<String> {
    match fs::read_to_string("/proc/device-tree/compatible") {
        Ok(text) => text
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Whether a `root=...` value is one the kernel can mount without an
/// initramfs. The accepted shapes follow init/do_mounts.c in the Linux
/// tree; anything else (e.g. root by filesystem UUID or label) needs
/// userspace help.
pub fn root_requires_initramfs(root: &str) -> Result<bool> {
    let x = "[0-9a-fA-F]";
    // The bootloader replaces %U with a partition UUID, so accept the
    // unexpanded token too.
    let uuid = format!("({x}{{8}}-{x}{{4}}-{x}{{4}}-{x}{{4}}-{x}{{12}}|%U)");
    let ntsig = format!("{x}{{8}}-{x}{{2}}");

    let patterns = [
        "[0-9a-fA-F]{4}".to_string(),
        "/dev/nfs".to_string(),
        "/dev/[0-9a-zA-Z]+".to_string(),
        "/dev/[0-9a-zA-Z]+[0-9]+".to_string(),
        "/dev/[0-9a-zA-Z]+p[0-9]+".to_string(),
        format!("PARTUUID=({uuid}|{ntsig})"),
        format!("PARTUUID=({uuid}|{ntsig})/PARTNROFF=[0-9]+"),
        "[0-9]+:[0-9]+".to_string(),
        "PARTLABEL=.+".to_string(),
        "/dev/cifs".to_string(),
    ];

    for pattern in patterns {
        let re = Regex::new(&format!("^(?:{pattern})$"))?;
        if re.is_match(root) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The device a path is mounted from, checked against fstab first and
/// the kernel's view second. `None` if findmnt knows nothing about it.
pub fn mount_source(mountpoint: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    for fstab in [true, false] {
        let mut cmd = Command::new("findmnt");
        if fstab {
            cmd.add_arg("--fstab");
        }
        cmd.add_args(["--first-only", "--noheadings", "--output", "SOURCE"]);
        cmd.add_arg(mountpoint);
        cmd.capture = true;
        cmd.log_command = false;
        cmd.check = false;
        let output = cmd.run()?;
        if output.status.success() {
            let source = output.stdout_string_lossy().trim().to_string();
            if source.starts_with('/') {
                return Ok(Some(Utf8PathBuf::from(source)));
            }
        }
    }
    Ok(None)
}

/// A set of vboot signing keys found in one directory.
pub struct VbootKeys {
    pub keyblock: Option<Utf8PathBuf>,
    pub signprivate: Option<Utf8PathBuf>,
    pub signpubkey: Option<Utf8PathBuf>,
}

/// Search directories for the vboot keys, falling back to the
/// distribution devkey locations. The first directory containing any of
/// the three files wins.
pub fn vboot_keys(keydirs: &[Utf8PathBuf]) -> VbootKeys {
    let system_dirs = [
        Utf8PathBuf::from("/usr/share/vboot/devkeys"),
        Utf8PathBuf::from("/usr/local/share/vboot/devkeys"),
    ];

    for keydir in keydirs.iter().chain(&system_dirs) {
        if !keydir.is_dir() {
            continue;
        }
        let existing = |name: &str| {
            let path = keydir.join(name);
            path.is_file().then_some(path)
        };
        let keys = VbootKeys {
            keyblock: existing("kernel.keyblock"),
            signprivate: existing("kernel_data_key.vbprivk"),
            signpubkey: existing("kernel_subkey.vbpubk"),
        };
        if keys.keyblock.is_some() || keys.signprivate.is_some() || keys.signpubkey.is_some() {
            return keys;
        }
    }

    VbootKeys {
        keyblock: None,
        signprivate: None,
        signpubkey: None,
    }
}

/// The distribution name from /etc/os-release, for image descriptions.
pub fn os_name() -> Option<String> {
    os_name_from(Utf8Path::new("/etc/os-release"))
}

pub fn os_name_from(path: &Utf8Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("NAME=") {
            return Some(value.trim_matches(|c| c == '\'' || c == '"').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kern_guid() {
        let cmdline: Vec<String> = [
            "console=ttyS0",
            "kern_guid=b2a34d10-43b7-4d82-b5ba-1de2797d0b39",
            "root=/dev/sda3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            kern_guid(&cmdline),
            Some("b2a34d10-43b7-4d82-b5ba-1de2797d0b39")
        );
        assert_eq!(kern_guid(&cmdline[..1]), None);
    }

    #[test]
    fn test_root_requires_initramfs() {
        for root in [
            "/dev/sda2",
            "/dev/mmcblk0p3",
            "/dev/nfs",
            "PARTUUID=b2a34d10-43b7-4d82-b5ba-1de2797d0b39",
            "PARTUUID=%U/PARTNROFF=1",
            "PARTUUID=1234abcd-02",
            "179:3",
            "PARTLABEL=ROOT-A",
        ] {
            assert!(!root_requires_initramfs(root).unwrap(), "{root}");
        }

        for root in [
            "UUID=b2a34d10-43b7-4d82-b5ba-1de2797d0b39",
            "LABEL=rootfs",
            "/dev/disk/by-label/rootfs",
            "",
        ] {
            assert!(root_requires_initramfs(root).unwrap(), "{root}");
        }
    }

    #[test]
    fn test_os_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("os-release")).unwrap();
        fs::write(&path, "PRETTY_NAME=\"Debian GNU/Linux 12\"\nNAME=\"Debian GNU/Linux\"\n")
            .unwrap();
        assert_eq!(os_name_from(&path).as_deref(), Some("Debian GNU/Linux"));
    }
}
