// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `check` subcommand: decide whether an image would actually boot
//! on this board before anything writes it to disk.

use crate::board::{Board, ImageFormat};
use anyhow::Result;
use camino::Utf8Path;
use command_run::Command;
use fs_err as fs;
use log::info;
use std::fmt;

#[derive(Debug)]
pub enum CheckError {
    NotAFile,
    TooBig,
    InvalidImage,
    BadSignature,
    NotFit,
}

impl CheckError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CheckError::NotAFile => 2,
            CheckError::TooBig => 3,
            CheckError::InvalidImage => 4,
            CheckError::BadSignature => 5,
            CheckError::NotFit => 6,
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CheckError::NotAFile => "image is not a readable file",
            CheckError::TooBig => "image is too big for this board",
            CheckError::InvalidImage => "image couldn't be interpreted by vbutil_kernel",
            CheckError::BadSignature => "image is not signed by the configured keys",
            CheckError::NotFit => "packed vmlinuz is not a FIT image",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for CheckError {}

fn vbutil_kernel(args: &[&str]) -> Result<command_run::Output> {
    let mut cmd = Command::new("futility");
    cmd.add_arg("vbutil_kernel");
    cmd.add_args(args);
    cmd.capture = true;
    cmd.log_command = false;
    cmd.check = false;
    Ok(cmd.run()?)
}

/// Validate an image against the board's constraints and the vboot
/// tooling. Errors come out in a fixed order so the exit code tells the
/// caller the first thing that is wrong.
pub fn check_image(
    board: &Board,
    image: &Utf8Path,
    signpubkey: Option<&Utf8Path>,
    tmpdir: &Utf8Path,
) -> Result<()> {
    info!("verifying image for board '{}'", board.name);

    if !image.is_file() {
        return Err(CheckError::NotAFile.into());
    }

    info!("checking if image fits into size limit");
    let size = fs::metadata(image)?.len();
    if !board.fits(size) {
        return Err(CheckError::TooBig.into());
    }

    info!("checking depthcharge image validity");
    if !vbutil_kernel(&["--verify", image.as_str()])?.status.success() {
        return Err(CheckError::InvalidImage.into());
    }

    if let Some(signpubkey) = signpubkey {
        info!("checking depthcharge image signatures");
        let verify = vbutil_kernel(&[
            "--verify",
            image.as_str(),
            "--signpubkey",
            signpubkey.as_str(),
        ])?;
        if !verify.status.success() {
            return Err(CheckError::BadSignature.into());
        }
    }

    if board.image_format() == ImageFormat::Fit {
        info!("checking FIT image format");
        let itb = tmpdir.join(format!(
            "{}.itb",
            image.file_name().unwrap_or("image")
        ));
        vbutil_kernel(&[
            "--get-vmlinuz",
            image.as_str(),
            "--vmlinuz-out",
            itb.as_str(),
        ])?;

        let mut cmd = Command::with_args("mkimage", ["-l", itb.as_str()]);
        cmd.capture = true;
        cmd.log_command = false;
        cmd.check = false;
        let listing = cmd.run()?;
        if !listing.status.success() {
            return Err(CheckError::NotFit.into());
        }
        let stdout = listing.stdout_string_lossy();
        let head = stdout.lines().next().unwrap_or("");
        if !head.starts_with("FIT description:") {
            return Err(CheckError::NotFit.into());
        }
    }

    Ok(())
}
