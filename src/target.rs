// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `target` subcommand: pick the kernel partition that is safest to
//! overwrite next.

use crate::attrs;
use crate::cgpt::GptTool;
use crate::device::Partition;
use crate::list::{cros_partitions, CrosPartition};
use anyhow::{anyhow, bail, Result};
use camino::Utf8PathBuf;
use log::{info, warn};
use std::cmp::Ordering;
use std::fmt;

/// Reasons a targeted partition is rejected. Each maps to a documented
/// exit code so scripts can tell them apart.
#[derive(Debug)]
pub enum TargetError {
    NotWritablePartition(Partition),
    NotWritableDisk(Partition),
    NoPartitionNumber(Partition),
    NotKernelType(Partition),
    CurrentlyBooted(Partition),
    TooSmall(Partition, u64),
}

impl TargetError {
    pub fn exit_code(&self) -> u8 {
        match self {
            TargetError::NotWritablePartition(_) => 2,
            TargetError::NotWritableDisk(_) => 3,
            TargetError::NoPartitionNumber(_) => 4,
            TargetError::NotKernelType(_) => 5,
            TargetError::CurrentlyBooted(_) => 6,
            TargetError::TooSmall(_, _) => 7,
        }
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::NotWritablePartition(part) => {
                write!(f, "target '{part}' is not a writable block device")
            }
            TargetError::NotWritableDisk(part) => {
                write!(f, "disk of target '{part}' is not a writable block device")
            }
            TargetError::NoPartitionNumber(part) => {
                write!(f, "could not parse partition number for '{part}'")
            }
            TargetError::NotKernelType(part) => {
                write!(f, "partition '{part}' is not of type ChromeOS kernel")
            }
            TargetError::CurrentlyBooted(part) => {
                write!(f, "partition '{part}' is the currently booted partition")
            }
            TargetError::TooSmall(part, min_size) => {
                write!(f, "partition '{part}' is not bigger than {min_size} bytes")
            }
        }
    }
}

impl std::error::Error for TargetError {}

/// What to select a target from and under which constraints.
pub struct TargetRequest {
    /// Explicitly named partitions.
    pub partitions: Vec<Partition>,
    /// Disks whose kernel partitions are all candidates.
    pub disks: Vec<Utf8PathBuf>,
    /// Only accept partitions strictly larger than this.
    pub min_size: Option<u64>,
    pub allow_current: bool,
    /// The partition the running system booted from, if known.
    pub current: Option<Partition>,
}

/// Order candidates so the best partition to overwrite comes first:
/// never-successful before successful, then lowest priority, then
/// fewest tries left, then smallest.
pub fn worst_first(a: &CrosPartition, b: &CrosPartition) -> Ordering {
    let key = |c: &CrosPartition| {
        (
            c.attrs.successful(),
            c.attrs.priority(),
            c.attrs.tries(),
            c.size,
        )
    };
    key(a).cmp(&key(b))
}

fn is_current(part: &Partition, current: Option<&Partition>) -> bool {
    match current {
        Some(current) => part.disk == current.disk && part.partno == current.partno,
        None => false,
    }
}

/// All the reasons a partition could not be written to, in the order
/// the exit codes document them.
fn validate(
    gpt: &dyn GptTool,
    part: &Partition,
    req: &TargetRequest,
) -> Result<(), TargetError> {
    if let Some(path) = &part.path {
        if !gpt.is_block_device(path) {
            return Err(TargetError::NotWritablePartition(part.clone()));
        }
    }

    if !gpt.is_block_device(&part.disk) {
        return Err(TargetError::NotWritableDisk(part.clone()));
    }

    let Some(partno) = part.partno else {
        return Err(TargetError::NoPartitionNumber(part.clone()));
    };

    let type_guid = gpt
        .type_guid(&part.disk, partno)
        .map_err(|_| TargetError::NotKernelType(part.clone()))?;
    if !attrs::is_kernel_guid(&type_guid) {
        return Err(TargetError::NotKernelType(part.clone()));
    }

    if !req.allow_current && is_current(part, req.current.as_ref()) {
        return Err(TargetError::CurrentlyBooted(part.clone()));
    }

    if let Some(min_size) = req.min_size {
        let size = gpt
            .size_bytes(part)
            .map_err(|_| TargetError::TooSmall(part.clone(), min_size))?;
        if size <= min_size {
            return Err(TargetError::TooSmall(part.clone(), min_size));
        }
    }

    Ok(())
}

/// Pick the least valuable usable kernel partition from the request, or
/// explain why the explicitly requested one cannot be used.
pub fn select_target(gpt: &dyn GptTool, req: &TargetRequest) -> Result<Partition> {
    // An explicit partition next to disks (or several explicit
    // partitions) is ambiguous; it is rejected, never merged into the
    // ranking pool.
    if req.partitions.len() > 1 || (!req.partitions.is_empty() && !req.disks.is_empty()) {
        bail!("pass either a single partition or disks to search, not both");
    }

    // A single explicit partition is checked rather than ranked, so
    // the caller learns exactly why it is unusable.
    if let [part] = req.partitions.as_slice() {
        validate(gpt, part, req)?;
        return Ok(part.clone());
    }

    let mut candidates = cros_partitions(gpt, &req.disks)?;

    candidates.retain(|c| {
        if let Some(min_size) = req.min_size {
            if c.size <= min_size {
                warn!("skipping partition '{}' as too small", c.part);
                return false;
            }
        }
        if !req.allow_current && is_current(&c.part, req.current.as_ref()) {
            info!("skipping currently booted partition '{}'", c.part);
            return false;
        }
        true
    });

    candidates.sort_by(worst_first);

    let chosen = candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no usable ChromeOS kernel partition found"))?;

    validate(gpt, &chosen.part, req)?;
    Ok(chosen.part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::KernelAttributes;
    use crate::cgpt::fake::FakeGpt;
    use camino::Utf8Path;

    fn part(disk: &str, partno: u32) -> Partition {
        Partition {
            disk: Utf8PathBuf::from(disk),
            partno: Some(partno),
            path: None,
        }
    }

    fn cros(disk: &str, partno: u32, raw: u16, size: u64) -> CrosPartition {
        CrosPartition {
            part: part(disk, partno),
            attrs: KernelAttributes::from_raw(raw),
            size,
        }
    }

    fn request(disks: &[&str]) -> TargetRequest {
        TargetRequest {
            partitions: Vec::new(),
            disks: disks.iter().map(Utf8PathBuf::from).collect(),
            min_size: None,
            allow_current: false,
            current: None,
        }
    }

    #[test]
    fn test_worst_first_ordering() {
        // successful dominates priority, priority dominates tries,
        // tries dominate size.
        let successful = cros("/dev/d", 1, 0x111, 10);
        let high_priority = cros("/dev/d", 2, 0x013, 10);
        let low_priority = cros("/dev/d", 3, 0x011, 10);
        let fewer_tries = cros("/dev/d", 4, 0x001, 10);
        let smaller = cros("/dev/d", 5, 0x001, 5);

        let mut list = vec![
            successful.clone(),
            high_priority.clone(),
            low_priority.clone(),
            fewer_tries.clone(),
            smaller.clone(),
        ];
        list.sort_by(worst_first);

        let order: Vec<u32> = list.iter().map(|c| c.part.partno.unwrap()).collect();
        assert_eq!(order, [5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_selects_worst_partition() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x111, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x011, 0x10000);

        let chosen = select_target(&gpt, &request(&["/dev/fake"])).unwrap();
        assert_eq!(chosen.partno, Some(4));
    }

    #[test]
    fn test_min_size_excludes_at_or_below() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x011, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x000, 0x8000);

        // Partition 4 is worse but exactly min_size, so it is excluded.
        let mut req = request(&["/dev/fake"]);
        req.min_size = Some(0x8000);
        let chosen = select_target(&gpt, &req).unwrap();
        assert_eq!(chosen.partno, Some(2));

        // With no candidate above min_size there is no target.
        req.min_size = Some(0x10000);
        assert!(select_target(&gpt, &req).is_err());
    }

    #[test]
    fn test_current_partition_guard() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x000, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x011, 0x10000);

        let mut req = request(&["/dev/fake"]);
        req.current = Some(part("/dev/fake", 2));
        let chosen = select_target(&gpt, &req).unwrap();
        assert_eq!(chosen.partno, Some(4));

        req.allow_current = true;
        let chosen = select_target(&gpt, &req).unwrap();
        assert_eq!(chosen.partno, Some(2));
    }

    #[test]
    fn test_mixed_references_rejected() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x000, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x011, 0x10000);

        // An explicit partition alongside a disk must fail outright,
        // never silently pick a candidate from the merged pool.
        let mut req = request(&["/dev/fake"]);
        req.partitions = vec![part("/dev/fake", 2)];
        assert!(select_target(&gpt, &req).is_err());

        // More than one explicit partition is just as ambiguous.
        let mut req = request(&[]);
        req.partitions = vec![part("/dev/fake", 2), part("/dev/fake", 4)];
        assert!(select_target(&gpt, &req).is_err());
    }

    #[test]
    fn test_explicit_target_exit_codes() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x011, 0x10000);
        gpt.add_partition_with_type(
            disk,
            3,
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
            0x10000,
        );

        let mut req = request(&[]);

        // Not a kernel partition.
        req.partitions = vec![part("/dev/fake", 3)];
        let err = select_target(&gpt, &req).unwrap_err();
        let err = err.downcast_ref::<TargetError>().unwrap();
        assert_eq!(err.exit_code(), 5);

        // The currently booted partition.
        req.partitions = vec![part("/dev/fake", 2)];
        req.current = Some(part("/dev/fake", 2));
        let err = select_target(&gpt, &req).unwrap_err();
        let err = err.downcast_ref::<TargetError>().unwrap();
        assert_eq!(err.exit_code(), 6);

        // Too small for the image.
        req.current = None;
        req.min_size = Some(0x10000);
        let err = select_target(&gpt, &req).unwrap_err();
        let err = err.downcast_ref::<TargetError>().unwrap();
        assert_eq!(err.exit_code(), 7);

        // A disk that is not a block device.
        req.min_size = None;
        req.partitions = vec![part("/dev/other", 1)];
        let err = select_target(&gpt, &req).unwrap_err();
        let err = err.downcast_ref::<TargetError>().unwrap();
        assert_eq!(err.exit_code(), 3);
    }
}
