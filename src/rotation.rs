// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mutations of the kernel rotation state: marking partitions good, bad
//! or next-to-boot, and retiring partitions by image content.

use crate::attrs::KernelAttributes;
use crate::build;
use crate::cgpt::GptTool;
use crate::device::Partition;
use crate::target::TargetError;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs_err as fs;
use fs_err::File;
use log::{info, warn};
use std::io::Read;

/// The vblock header occupies the first 64 KiB of a signed image and
/// contains signatures over the rest, so comparing it is enough to
/// decide whether two images are the same.
const VBLOCK_SIZE: usize = 0x10000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlessMode {
    /// The partition booted fine: keep it bootable and on top.
    Good,
    /// Try the partition once more without marking it successful.
    Oneshot,
    /// Never boot this partition again.
    Bad,
}

/// Update a partition's vboot flags. There is no batched cgpt call, so
/// a crash between the attribute write and the reprioritization can
/// leave the disk with stale priorities; both calls are idempotent and
/// re-running repairs it.
pub fn bless(gpt: &dyn GptTool, part: &Partition, mode: BlessMode) -> Result<()> {
    let partno = part
        .partno
        .with_context(|| format!("partition '{part}' has no partition number"))?;

    let attrs = match mode {
        BlessMode::Good => KernelAttributes::new(true, 1, 1)?,
        BlessMode::Oneshot => KernelAttributes::new(false, 1, 1)?,
        BlessMode::Bad => KernelAttributes::new(false, 0, 0)?,
    };
    gpt.set_attributes(&part.disk, partno, attrs)?;

    if mode == BlessMode::Bad {
        info!("disabled partition '{part}'");
        return Ok(());
    }

    gpt.prioritize(&part.disk, partno)?;
    info!("set partition '{part}' as next to boot");
    Ok(())
}

/// Make a freshly written partition the next boot attempt: one try, not
/// yet successful, highest priority.
pub fn prioritize_fresh(gpt: &dyn GptTool, part: &Partition) -> Result<()> {
    let partno = part
        .partno
        .with_context(|| format!("partition '{part}' has no partition number"))?;
    gpt.set_attributes(&part.disk, partno, KernelAttributes::new(false, 0, 1)?)?;
    gpt.prioritize(&part.disk, partno)?;
    info!("set partition '{part}' as next to boot");
    Ok(())
}

fn read_vblock(path: &Utf8Path) -> Result<Vec<u8>> {
    let mut buf = vec![0; VBLOCK_SIZE];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Disable every active kernel partition that contains this image.
/// Returns the partitions that were disabled.
pub fn remove(
    gpt: &dyn GptTool,
    disks: &[Utf8PathBuf],
    image: &Utf8Path,
    current: Option<&Partition>,
    force: bool,
) -> Result<Vec<Partition>> {
    let image_vblock = fs::read(image)?;
    let image_vblock = &image_vblock[..image_vblock.len().min(VBLOCK_SIZE)];

    let mut badparts = Vec::new();
    for disk in disks {
        for partno in gpt.find_kernel_partnos(disk)? {
            let part = Partition::new(disk, partno);
            info!("checking partition '{part}'");

            let Some(path) = &part.path else {
                continue;
            };
            if read_vblock(path)? != image_vblock {
                continue;
            }
            if gpt.attributes(disk, partno)?.to_raw() != 0 {
                badparts.push(part);
            }
        }
    }

    if badparts.is_empty() {
        warn!("no active partitions contain the given image");
        return Ok(badparts);
    }

    for part in &badparts {
        let booted = match current {
            Some(current) => part.disk == current.disk && part.partno == current.partno,
            None => false,
        };
        if booted {
            if force {
                warn!(
                    "deactivating the currently booted partition '{part}', \
                     this might make your system unbootable"
                );
            } else {
                return Err(TargetError::CurrentlyBooted(part.clone()).into());
            }
        }
    }

    for part in &badparts {
        let partno = part
            .partno
            .with_context(|| format!("partition '{part}' has no partition number"))?;
        gpt.set_attributes(&part.disk, partno, KernelAttributes::new(false, 0, 0)?)
            .with_context(|| format!("failed to deactivate partition '{part}'"))?;
        info!("deactivated partition '{part}'");
    }

    Ok(badparts)
}

/// Delete a deactivated image when it lives in the images directory,
/// along with its fingerprint sidecar, so stale images don't pile up.
/// Images elsewhere belong to the caller and are left alone.
pub fn clean_image(images_dir: &Utf8Path, image: &Utf8Path) -> Result<()> {
    if image.parent() != Some(images_dir) {
        return Ok(());
    }
    fs::remove_file(image)?;
    let sidecar = build::fingerprint_path(image);
    if sidecar.is_file() {
        fs::remove_file(&sidecar)?;
    }
    info!("removed image '{image}'");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgpt::fake::FakeGpt;
    use tempfile::TempDir;

    fn part(disk: &str, partno: u32) -> Partition {
        Partition {
            disk: Utf8PathBuf::from(disk),
            partno: Some(partno),
            path: None,
        }
    }

    #[test]
    fn test_bless_modes() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x010, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x011, 0x10000);

        bless(&gpt, &part("/dev/fake", 2), BlessMode::Good).unwrap();
        let blessed = gpt.attributes(disk, 2).unwrap();
        assert!(blessed.successful());
        assert_eq!(blessed.tries(), 1);
        // Prioritized above the other bootable partition.
        assert!(blessed.priority() > gpt.attributes(disk, 4).unwrap().priority());

        bless(&gpt, &part("/dev/fake", 4), BlessMode::Oneshot).unwrap();
        let oneshot = gpt.attributes(disk, 4).unwrap();
        assert!(!oneshot.successful());
        assert_eq!(oneshot.tries(), 1);
        assert!(oneshot.priority() > gpt.attributes(disk, 2).unwrap().priority());

        bless(&gpt, &part("/dev/fake", 4), BlessMode::Bad).unwrap();
        assert_eq!(gpt.attributes(disk, 4).unwrap().to_raw(), 0);
    }

    /// A full A/B cycle: write to the worst slot, boot it, bless it,
    /// then rotate to the other slot.
    #[test]
    fn test_rotation_cycle() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x111, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x000, 0x10000);

        // A fresh image lands in the empty slot and becomes next to
        // boot, without the successful flag.
        prioritize_fresh(&gpt, &part("/dev/fake", 4)).unwrap();
        let fresh = gpt.attributes(disk, 4).unwrap();
        assert!(!fresh.successful());
        assert_eq!(fresh.tries(), 1);
        assert!(fresh.priority() > gpt.attributes(disk, 2).unwrap().priority());

        // The old partition still boots if the new one fails its tries.
        assert!(gpt.attributes(disk, 2).unwrap().bootable());
        assert!(gpt.attributes(disk, 2).unwrap().successful());

        // The new kernel boots and userspace acknowledges it.
        bless(&gpt, &part("/dev/fake", 4), BlessMode::Good).unwrap();
        let blessed = gpt.attributes(disk, 4).unwrap();
        assert!(blessed.successful());
        assert!(blessed.priority() > gpt.attributes(disk, 2).unwrap().priority());

        // The next update now targets the other slot.
        let req = crate::target::TargetRequest {
            partitions: Vec::new(),
            disks: vec![disk.to_path_buf()],
            min_size: None,
            allow_current: false,
            current: Some(part("/dev/fake", 4)),
        };
        let next = crate::target::select_target(&gpt, &req).unwrap();
        assert_eq!(next.partno, Some(2));
    }

    #[test]
    fn test_remove_by_content() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let disk = root.join("disk");
        fs::write(&disk, "").unwrap();
        fs::write(root.join("disk1"), b"image-a".as_slice()).unwrap();
        fs::write(root.join("disk2"), b"image-b".as_slice()).unwrap();
        let image = root.join("image");
        fs::write(&image, b"image-b".as_slice()).unwrap();

        let gpt = FakeGpt::new();
        gpt.add_kernel_partition(&disk, 1, 0x111, 0x10000);
        gpt.add_kernel_partition(&disk, 2, 0x011, 0x10000);

        let disks = vec![disk.clone()];
        let removed = remove(&gpt, &disks, &image, None, false).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].partno, Some(2));
        assert_eq!(gpt.raw_attributes(&disk, 2), 0);
        // The non-matching partition is untouched.
        assert_eq!(gpt.raw_attributes(&disk, 1), 0x111);
    }

    #[test]
    fn test_clean_image_scoped_to_images_dir() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let images_dir = root.join("images");
        fs::create_dir_all(&images_dir).unwrap();

        let image = images_dir.join("test.img");
        let sidecar = images_dir.join("test.img.fingerprint");
        fs::write(&image, "image").unwrap();
        fs::write(&sidecar, "abc").unwrap();

        clean_image(&images_dir, &image).unwrap();
        assert!(!image.exists());
        assert!(!sidecar.exists());

        // An image outside the images dir is the caller's business.
        let outside = root.join("other.img");
        fs::write(&outside, "image").unwrap();
        clean_image(&images_dir, &outside).unwrap();
        assert!(outside.exists());
    }

    #[test]
    fn test_remove_current_needs_force() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let disk = root.join("disk");
        fs::write(&disk, "").unwrap();
        fs::write(root.join("disk1"), b"image-a".as_slice()).unwrap();
        let image = root.join("image");
        fs::write(&image, b"image-a".as_slice()).unwrap();

        let gpt = FakeGpt::new();
        gpt.add_kernel_partition(&disk, 1, 0x111, 0x10000);

        let disks = vec![disk.clone()];
        let current = Partition::new(&disk, 1);
        let err = remove(&gpt, &disks, &image, Some(&current), false).unwrap_err();
        let err = err.downcast_ref::<TargetError>().unwrap();
        assert_eq!(err.exit_code(), 6);
        assert_eq!(gpt.raw_attributes(&disk, 1), 0x111);

        let removed = remove(&gpt, &disks, &image, Some(&current), true).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(gpt.raw_attributes(&disk, 1), 0);
    }
}
