// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolution of block-device references down to physical disks, and
//! decomposition of partition device paths into (disk, number) pairs.

use camino::{Utf8Path, Utf8PathBuf};
use fs_err as fs;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Result of decomposing a block-device name into a disk name and a
/// partition number.
#[derive(Debug, Eq, PartialEq)]
pub enum PartName {
    /// The name has the shape of a partition on a disk.
    Partition { disk: String, partno: u32 },
    /// The name is a whole device (or a non-partition hardware area
    /// such as an eMMC boot/rpmb region).
    Whole,
    /// The name ends in digits but the number does not fit a partition
    /// number. Callers must treat this as its own failure, not fall
    /// back to a default.
    BadNumber,
}

/// Device name suffixes that mark special eMMC hardware areas, not GPT
/// partitions.
const OPAQUE_SUFFIXES: &[&str] = &["boot0", "boot1", "rpmb"];

/// Split a block-device name following the kernel's naming convention:
/// disks whose name ends in a digit take a `p` separator before the
/// partition number (`nvme0n1p3`, `mmcblk0p2`), others append it
/// directly (`sda3`).
#[must_use]
pub fn split_partition_name(name: &str) -> PartName {
    for suffix in OPAQUE_SUFFIXES {
        if let Some(stem) = name.strip_suffix(suffix) {
            if stem.ends_with(|c: char| c.is_ascii_digit()) {
                return PartName::Whole;
            }
        }
    }

    let digits = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return PartName::Whole;
    }

    let (stem, number) = name.split_at(name.len() - digits);

    // mmcblk0p2-style: the disk name itself ends in a digit, so the
    // partition number sits behind a `p` separator.
    if let Some(disk) = stem.strip_suffix('p') {
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            return match number.parse() {
                Ok(partno) if partno > 0 => PartName::Partition {
                    disk: disk.to_string(),
                    partno,
                },
                _ => PartName::BadNumber,
            };
        }
    }

    // sda3-style: the disk name does not end in a digit.
    if !stem.is_empty() && !stem.ends_with(|c: char| c.is_ascii_digit()) {
        return match number.parse::<u32>() {
            Ok(partno) if partno > 0 => PartName::Partition {
                disk: stem.to_string(),
                partno,
            },
            // Partition numbers start at 1. A trailing zero can only
            // be part of a numbered whole-device name (mmcblk0,
            // loop0), never a partition number.
            Ok(_) => PartName::Whole,
            Err(_) => PartName::BadNumber,
        };
    }

    PartName::Whole
}

/// Derive the conventional device path for a numbered partition of a
/// disk (the inverse of [`split_partition_name`]).
#[must_use]
pub fn partition_path(disk: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let name = disk.file_name().unwrap_or_default();
    let sep = if name.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    disk.with_file_name(format!("{name}{sep}{partno}"))
}

/// A numbered slot on a disk. `path` is present only when a device node
/// for the partition exists; partitions inside disk image files carry a
/// number but no path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partition {
    pub disk: Utf8PathBuf,
    pub partno: Option<u32>,
    pub path: Option<Utf8PathBuf>,
}

impl Partition {
    /// Partition `partno` of `disk`, with the device path filled in if
    /// a node for it exists.
    pub fn new(disk: &Utf8Path, partno: u32) -> Partition {
        let path = partition_path(disk, partno);
        let path = path_exists(&path).then_some(path);
        Partition {
            disk: disk.to_path_buf(),
            partno: Some(partno),
            path,
        }
    }

    /// Interpret a device path as a partition, splitting off the
    /// partition number. Returns `None` for paths that do not decompose
    /// into an existing disk plus a number.
    pub fn from_device_path(path: &Utf8Path) -> Option<Partition> {
        let name = path.file_name()?;
        match split_partition_name(name) {
            PartName::Partition { disk, partno } => {
                let disk = path.with_file_name(disk);
                if !path_exists(&disk) {
                    return None;
                }
                Some(Partition {
                    disk,
                    partno: Some(partno),
                    path: Some(path.to_path_buf()),
                })
            }
            PartName::Whole | PartName::BadNumber => None,
        }
    }
}

impl fmt::Display for Partition {
    // Prefer the device path, fall back to "disk#partno".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.partno) {
            (Some(path), _) => write!(f, "{path}"),
            (None, Some(partno)) => write!(f, "{}#{partno}", self.disk),
            (None, None) => write!(f, "{}#?", self.disk),
        }
    }
}

fn path_exists(path: &Utf8Path) -> bool {
    path.as_std_path().exists()
}

/// The kernel's block-device topology, read from sysfs: which devices
/// are backed by which. Parents of a node are the devices underneath it
/// (a dm device's parents are its slaves); a node with no parents is a
/// physical disk.
pub struct DeviceGraph {
    parents: BTreeMap<Utf8PathBuf, BTreeSet<Utf8PathBuf>>,
}

impl DeviceGraph {
    /// Scan the running system.
    pub fn scan() -> DeviceGraph {
        Self::with_roots(Utf8Path::new("/sys"), Utf8Path::new("/dev"))
    }

    /// Scan a specific sysfs/dev tree. Tests point this at a fixture
    /// directory.
    pub fn with_roots(sys: &Utf8Path, dev: &Utf8Path) -> DeviceGraph {
        let mut graph = DeviceGraph {
            parents: BTreeMap::new(),
        };

        let class_block = sys.join("class/block");
        for entry in read_dir_names(&class_block) {
            let sysdir = class_block.join(&entry);
            let node = dev.join(&entry);

            // Device-mapper devices register a name under /dev/mapper;
            // the dm-N node is what backs it.
            for dm_name in read_lines(&sysdir.join("dm/name")) {
                graph.add_edge(dev.join("mapper").join(dm_name), node.clone());
            }

            // A virtual device's slaves are the devices underneath it.
            for slave in read_dir_names(&sysdir.join("slaves")) {
                graph.add_edge(node.clone(), dev.join(slave));
            }

            // Holders are stacked on top of this device.
            for holder in read_dir_names(&sysdir.join("holders")) {
                graph.add_edge(dev.join(holder), node.clone());
            }

            // Partitions appear as children whose name extends the
            // disk's name.
            for child in read_dir_names(&sysdir) {
                if child.starts_with(entry.as_str()) && child != entry {
                    graph.add_edge(dev.join(child), node.clone());
                }
            }
        }

        graph
    }

    fn add_edge(&mut self, child: Utf8PathBuf, parent: Utf8PathBuf) {
        let child = canonicalize(&child);
        let parent = canonicalize(&parent);
        if child != parent && path_exists(&child) && path_exists(&parent) {
            self.parents.entry(child).or_default().insert(parent);
        }
    }

    /// Walk a set of device references up to the physical disks backing
    /// them, deduplicating converging paths (LVM over RAID over disks).
    /// With no references, returns every physical disk in the graph.
    ///
    /// References that cannot be traced to any disk in the graph simply
    /// produce no output; callers decide whether an empty result is
    /// fatal.
    pub fn physical_disks<'a, I>(&self, refs: I) -> Vec<Utf8PathBuf>
    where
        I: IntoIterator<Item = &'a Utf8Path>,
    {
        let mut queue: Vec<Utf8PathBuf> = refs.into_iter().map(canonicalize).collect();

        if queue.is_empty() {
            let all_parents: BTreeSet<_> = self.parents.values().flatten().cloned().collect();
            return all_parents
                .into_iter()
                .filter(|node| !self.parents.contains_key(node))
                .collect();
        }

        let mut leaves = BTreeSet::new();
        while let Some(node) = queue.pop() {
            match self.parents.get(&node) {
                Some(parents) => queue.extend(parents.iter().cloned()),
                None => {
                    if path_exists(&node) {
                        leaves.insert(node);
                    } else {
                        debug!("dropping unresolvable device reference '{node}'");
                    }
                }
            }
        }

        leaves.into_iter().collect()
    }
}

fn canonicalize(path: &Utf8Path) -> Utf8PathBuf {
    path.canonicalize_utf8().unwrap_or_else(|_| path.to_path_buf())
}

fn read_dir_names(path: &Utf8Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

fn read_lines(path: &Utf8Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}
