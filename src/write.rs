// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `write` subcommand: put an image into the best kernel partition
//! and only then make it bootable.

use crate::cgpt::GptTool;
use crate::device::Partition;
use crate::rotation;
use crate::target::{select_target, TargetRequest};
use anyhow::{bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs_err as fs;
use log::{info, warn};

pub struct WriteRequest {
    pub image: Utf8PathBuf,
    /// A disk or partition to write to; `None` scans `disks`.
    pub target: Option<Utf8PathBuf>,
    /// Disks to pick a target from when none is given.
    pub disks: Vec<Utf8PathBuf>,
    pub force: bool,
    pub allow_current: bool,
    pub prioritize: bool,
    pub current: Option<Partition>,
}

/// Write `image` to a target partition. The sequence is fixed: pick a
/// target big enough for the image, check the image, write the bytes,
/// and only once they are on disk touch the boot flags. A failure at
/// any step leaves the rotation state as it was.
///
/// `check` validates the image for this board; failures abort unless
/// `--force` was given.
pub fn write_image(
    gpt: &dyn GptTool,
    req: &WriteRequest,
    check: impl Fn(&Utf8Path) -> Result<()>,
) -> Result<Partition> {
    let image_size = fs::metadata(&req.image)?.len();

    let (partitions, disks) = match &req.target {
        Some(target) => match Partition::from_device_path(target) {
            Some(part) => (vec![part], Vec::new()),
            None => (Vec::new(), vec![target.clone()]),
        },
        None => (Vec::new(), req.disks.clone()),
    };

    info!("searching disks for a target partition");
    let target = select_target(
        gpt,
        &TargetRequest {
            partitions,
            disks,
            min_size: Some(image_size),
            allow_current: req.allow_current,
            current: req.current.clone(),
        },
    )?;

    let Some(path) = target.path.clone() else {
        bail!("cannot write to target partition '{target}' without a device path");
    };
    info!("targeted partition '{target}'");

    if let Err(err) = check(&req.image) {
        if req.force {
            warn!(
                "image '{}' is not bootable on this board, continuing due to --force",
                req.image
            );
        } else {
            return Err(err);
        }
    }

    let booted = match &req.current {
        Some(current) => target.disk == current.disk && target.partno == current.partno,
        None => false,
    };
    if booted {
        warn!(
            "overwriting the currently booted partition '{target}', \
             this might make your system unbootable"
        );
    }

    fs::write(&path, fs::read(&req.image)?)?;
    info!("wrote image '{}' to partition '{target}'", req.image);

    if req.prioritize {
        rotation::prioritize_fresh(gpt, &target)?;
    }

    Ok(target)
}
