// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery of kernels installed under /boot, so `build` and `write`
//! can take a kernel release name instead of explicit file paths.

use crate::platform;
use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fs_err as fs;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One installed kernel: the image plus whatever initramfs and
/// device-tree directory share its release string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelEntry {
    /// `None` for a bare unversioned /boot/vmlinuz.
    pub release: Option<String>,
    pub kernel: Utf8PathBuf,
    pub initrd: Option<Utf8PathBuf>,
    pub fdtdir: Option<Utf8PathBuf>,
}

impl KernelEntry {
    /// Human-readable text for the image description field.
    pub fn description(&self) -> String {
        let os_name = platform::os_name();
        let release = self.release.as_deref().unwrap_or("kernel");
        match os_name {
            Some(name) => format!("{name}, with Linux {release}"),
            None => format!("Linux {release}"),
        }
    }
}

/// Scan a filesystem root for installed kernels, newest release first.
pub fn installed_kernels(root: &Utf8Path) -> Result<Vec<KernelEntry>> {
    let boot = root.join("boot");

    let mut kernels: BTreeMap<Option<String>, Utf8PathBuf> = BTreeMap::new();
    let mut initrds: BTreeMap<Option<String>, Utf8PathBuf> = BTreeMap::new();
    let mut fdtdirs: BTreeMap<Option<String>, Utf8PathBuf> = BTreeMap::new();

    for (name, path) in files_in(&boot) {
        for prefix in ["vmlinuz-", "vmlinux-"] {
            if let Some(release) = name.strip_prefix(prefix) {
                kernels.insert(Some(release.to_string()), path.clone());
            }
        }
        for prefix in ["initrd-", "initrd.img-"] {
            if let Some(release) = name.strip_prefix(prefix) {
                initrds.insert(Some(release.to_string()), path.clone());
            }
        }
    }

    // Unversioned fallbacks, in order of preference.
    for name in ["vmlinuz", "vmlinux", "Image", "zImage", "bzImage"] {
        let path = boot.join(name);
        if path.is_file() {
            kernels.entry(None).or_insert(path);
            break;
        }
    }
    for name in ["initrd.img", "initrd", "initramfs-linux.img"] {
        let path = boot.join(name);
        if path.is_file() {
            initrds.entry(None).or_insert(path);
            break;
        }
    }

    for (name, path) in dirs_in(&root.join("usr/lib")) {
        if let Some(release) = name.strip_prefix("linux-image-") {
            fdtdirs.insert(Some(release.to_string()), path);
        }
    }
    for (name, path) in dirs_in(&boot.join("dtbs")) {
        if kernels.contains_key(&Some(name.clone())) {
            fdtdirs.insert(Some(name), path);
        }
    }

    let mut entries: Vec<KernelEntry> = kernels
        .into_iter()
        .map(|(release, kernel)| KernelEntry {
            initrd: initrds.get(&release).cloned(),
            fdtdir: fdtdirs.get(&release).cloned(),
            release,
            kernel,
        })
        .collect();
    entries.sort_by(|a, b| compare_releases(b.release.as_deref(), a.release.as_deref()));
    Ok(entries)
}

/// Order two kernel release strings the way Debian version comparison
/// would: numeric runs compare as numbers, `~` sorts before anything,
/// and `rc`/`trunk` suffixes sort below the plain release.
pub fn compare_releases(a: Option<&str>, b: Option<&str>) -> Ordering {
    let mut a = release_key(a);
    let mut b = release_key(b);
    // A shorter key must not rank as a bare prefix: "4.9" has to sort
    // above "4.9-rc3", so pad both keys with neutral parts before
    // comparing.
    let len = a.len().max(b.len());
    a.resize(len, neutral_part());
    b.resize(len, neutral_part());
    a.cmp(&b)
}

type ReleasePart = (i8, (i8, String), u64);

fn neutral_part() -> ReleasePart {
    (0, (0, String::new()), 0)
}

fn release_key(release: Option<&str>) -> Vec<ReleasePart> {
    let Some(release) = release else {
        return Vec::new();
    };

    // Each part is an optional separator, a run of letters and a run of
    // digits. The pattern is a literal, so compilation cannot fail.
    let Ok(re) = Regex::new("([^a-zA-Z0-9]?)([a-zA-Z]*)([0-9]*)") else {
        return Vec::new();
    };

    let mut parts = Vec::new();
    for caps in re.captures_iter(release) {
        let sep = match &caps[1] {
            "~" => -1,
            "." => 1,
            _ => 0,
        };
        let text = &caps[2];
        let text_rank = match text {
            "rc" | "trunk" => -1,
            _ => 0,
        };
        let num: u64 = caps[3].parse().unwrap_or(0);
        parts.push((sep, (text_rank, text.to_string()), num));
    }
    parts
}

/// All .dtb files under a directory, recursively, sorted.
pub fn dtbs_in(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| anyhow::anyhow!("non-UTF-8 path '{}'", path.display()))?;
            if path.is_dir() {
                stack.push(path);
            } else if path.extension() == Some("dtb") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn files_in(dir: &Utf8Path) -> Vec<(String, Utf8PathBuf)> {
    entries_in(dir, |path| path.is_file())
}

fn dirs_in(dir: &Utf8Path) -> Vec<(String, Utf8PathBuf)> {
    entries_in(dir, |path| path.is_dir())
}

fn entries_in(dir: &Utf8Path, keep: fn(&Utf8Path) -> bool) -> Vec<(String, Utf8PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(String, Utf8PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).ok()?;
            keep(&path).then_some((name, path))
        })
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_release_ordering() {
        let ordered = [
            "4.9-rc3",
            "4.9",
            "4.9.1",
            "4.10",
            "5.10.0-8-amd64",
            "5.10.0-12-amd64",
            "6.1.0-18-arm64",
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_releases(Some(pair[0]), Some(pair[1])),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(
            compare_releases(Some("4.9"), Some("4.9")),
            Ordering::Equal
        );
        // An unversioned kernel sorts below any versioned one.
        assert_eq!(compare_releases(None, Some("4.9")), Ordering::Less);
    }

    #[test]
    fn test_installed_kernels() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let boot = root.join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz-6.1.0-18-arm64"), "k1").unwrap();
        fs::write(boot.join("vmlinuz-6.1.0-9-arm64"), "k2").unwrap();
        fs::write(boot.join("initrd.img-6.1.0-18-arm64"), "i1").unwrap();
        fs::create_dir_all(boot.join("dtbs/6.1.0-18-arm64")).unwrap();

        let kernels = installed_kernels(root).unwrap();
        assert_eq!(kernels.len(), 2);

        // Newest release first, with its initrd and fdtdir attached.
        let newest = &kernels[0];
        assert_eq!(newest.release.as_deref(), Some("6.1.0-18-arm64"));
        assert_eq!(newest.kernel, boot.join("vmlinuz-6.1.0-18-arm64"));
        assert_eq!(
            newest.initrd.as_deref(),
            Some(boot.join("initrd.img-6.1.0-18-arm64").as_path())
        );
        assert_eq!(
            newest.fdtdir.as_deref(),
            Some(boot.join("dtbs/6.1.0-18-arm64").as_path())
        );

        let older = &kernels[1];
        assert_eq!(older.release.as_deref(), Some("6.1.0-9-arm64"));
        assert_eq!(older.initrd, None);
    }

    #[test]
    fn test_dtbs_in() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        fs::create_dir_all(root.join("rockchip")).unwrap();
        fs::write(root.join("rockchip/rk3399-gru-kevin.dtb"), "a").unwrap();
        fs::write(root.join("top.dtb"), "b").unwrap();
        fs::write(root.join("README"), "c").unwrap();

        let dtbs = dtbs_in(root).unwrap();
        assert_eq!(
            dtbs,
            [
                root.join("rockchip/rk3399-gru-kevin.dtb"),
                root.join("top.dtb"),
            ]
        );
    }
}
