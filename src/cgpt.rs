// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GPT operations, performed by shelling out to `cgpt`.
//!
//! Everything that reads or mutates partition tables goes through the
//! [`GptTool`] trait so that selection and rotation logic can be tested
//! against an in-memory implementation.

use crate::attrs::KernelAttributes;
use crate::device::Partition;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use command_run::Command;
use log::debug;
use std::os::unix::fs::FileTypeExt;

pub trait GptTool {
    /// Numbers of the ChromeOS kernel partitions on a disk, in table
    /// order.
    fn find_kernel_partnos(&self, disk: &Utf8Path) -> Result<Vec<u32>>;

    /// Device path of the unique partition with this partition UUID, if
    /// one exists.
    fn find_by_partuuid(&self, partuuid: &str) -> Result<Option<Utf8PathBuf>>;

    /// The 16-bit vboot attribute value of a partition.
    fn attributes(&self, disk: &Utf8Path, partno: u32) -> Result<KernelAttributes>;

    /// Overwrite the vboot attributes of a partition wholesale.
    fn set_attributes(&self, disk: &Utf8Path, partno: u32, attrs: KernelAttributes)
        -> Result<()>;

    /// Reorder priorities so this partition has the highest on its
    /// disk, preserving the relative order of the others.
    fn prioritize(&self, disk: &Utf8Path, partno: u32) -> Result<()>;

    /// The partition type GUID, as a string.
    fn type_guid(&self, disk: &Utf8Path, partno: u32) -> Result<String>;

    /// Partition size in bytes.
    fn size_bytes(&self, part: &Partition) -> Result<u64>;

    /// Whether the path is a block device node.
    fn is_block_device(&self, path: &Utf8Path) -> bool;
}

/// cgpt sometimes prints its entire output twice
/// (crbug.com/463414). Drop the repetition when the two halves are
/// identical.
fn dedupe_output(stdout: &str) -> String {
    let lines: Vec<&str> = stdout.lines().collect();
    let mid = lines.len() / 2;
    if !lines.is_empty() && lines.len() % 2 == 0 && lines[..mid] == lines[mid..] {
        lines[..mid].join("\n")
    } else {
        stdout.trim_end_matches('\n').to_string()
    }
}

/// The real `cgpt` binary.
pub struct Cgpt;

impl Cgpt {
    fn cgpt(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::with_args("cgpt", args);
        cmd.capture = true;
        cmd.log_command = false;
        let output = cmd.run()?;
        let stderr = output.stderr_string_lossy();
        if !stderr.trim().is_empty() {
            debug!("cgpt {}: {}", args.join(" "), stderr.trim_end());
        }
        Ok(dedupe_output(&output.stdout_string_lossy()))
    }
}

impl GptTool for Cgpt {
    fn find_kernel_partnos(&self, disk: &Utf8Path) -> Result<Vec<u32>> {
        // `find -n` prints bare partition numbers. A disk without any
        // matching partition makes cgpt exit nonzero; that is an empty
        // result, not an error.
        let mut cmd =
            Command::with_args("cgpt", ["find", "-n", "-t", "kernel", disk.as_str()]);
        cmd.capture = true;
        cmd.log_command = false;
        cmd.check = false;
        let output = cmd.run()?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        dedupe_output(&output.stdout_string_lossy())
            .lines()
            .map(|line| {
                line.trim()
                    .parse()
                    .with_context(|| format!("unexpected cgpt find output: '{line}'"))
            })
            .collect()
    }

    fn find_by_partuuid(&self, partuuid: &str) -> Result<Option<Utf8PathBuf>> {
        let mut cmd = Command::with_args("cgpt", ["find", "-1", "-u", partuuid]);
        cmd.capture = true;
        cmd.log_command = false;
        cmd.check = false;
        let output = cmd.run()?;
        if !output.status.success() {
            return Ok(None);
        }
        let path = dedupe_output(&output.stdout_string_lossy());
        let path = path.trim();
        if path.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Utf8PathBuf::from(path)))
        }
    }

    fn attributes(&self, disk: &Utf8Path, partno: u32) -> Result<KernelAttributes> {
        let partno = partno.to_string();
        let stdout = self.cgpt(&["show", "-A", "-i", &partno, disk.as_str()])?;
        let hex = stdout.trim().trim_start_matches("0x");
        let raw = u16::from_str_radix(hex, 16)
            .with_context(|| format!("unexpected cgpt attribute output: '{stdout}'"))?;
        Ok(KernelAttributes::from_raw(raw))
    }

    fn set_attributes(
        &self,
        disk: &Utf8Path,
        partno: u32,
        attrs: KernelAttributes,
    ) -> Result<()> {
        let partno = partno.to_string();
        let attrs = format!("{:#x}", attrs.to_raw());
        self.cgpt(&["add", "-A", &attrs, "-i", &partno, disk.as_str()])?;
        Ok(())
    }

    fn prioritize(&self, disk: &Utf8Path, partno: u32) -> Result<()> {
        let partno = partno.to_string();
        self.cgpt(&["prioritize", "-i", &partno, disk.as_str()])?;
        Ok(())
    }

    fn type_guid(&self, disk: &Utf8Path, partno: u32) -> Result<String> {
        let partno = partno.to_string();
        let stdout = self.cgpt(&["show", "-t", "-i", &partno, disk.as_str()])?;
        Ok(stdout.trim().to_string())
    }

    fn size_bytes(&self, part: &Partition) -> Result<u64> {
        // For a real device node blockdev is exact; partitions inside
        // disk image files only exist in the GPT, so fall back to the
        // sector count there.
        if let Some(path) = &part.path {
            let output = Command::with_args("blockdev", ["--getsize64", path.as_str()])
                .enable_capture()
                .run()?;
            let stdout = output.stdout_string_lossy();
            return stdout
                .trim()
                .parse()
                .with_context(|| format!("unexpected blockdev output: '{stdout}'"));
        }

        let partno = part
            .partno
            .with_context(|| format!("partition '{part}' has no partition number"))?
            .to_string();
        let stdout = self.cgpt(&["show", "-s", "-i", &partno, part.disk.as_str()])?;
        let sectors: u64 = stdout
            .trim()
            .parse()
            .with_context(|| format!("unexpected cgpt size output: '{stdout}'"))?;
        Ok(sectors * 512)
    }

    fn is_block_device(&self, path: &Utf8Path) -> bool {
        match fs_err::metadata(path) {
            Ok(metadata) => metadata.file_type().is_block_device(),
            Err(_) => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_output() {
        assert_eq!(dedupe_output("2\n4\n2\n4\n"), "2\n4");
        assert_eq!(dedupe_output("2\n4\n"), "2\n4");
        assert_eq!(dedupe_output("2\n2\n4\n"), "2\n2\n4");
        assert_eq!(dedupe_output("2\n"), "2");
        assert_eq!(dedupe_output(""), "");
    }

    #[test]
    fn test_fake_prioritize() {
        use fake::FakeGpt;

        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/dev/fake");
        gpt.add_kernel_partition(disk, 2, 0x112, 0x1000);
        gpt.add_kernel_partition(disk, 4, 0x011, 0x1000);
        gpt.add_kernel_partition(disk, 6, 0x000, 0x1000);

        gpt.prioritize(disk, 4).unwrap();

        // Partition 4 takes the top slot, 2 keeps its relative rank,
        // and the disabled partition 6 stays at zero.
        assert_eq!(gpt.attributes(disk, 4).unwrap().priority(), 2);
        assert_eq!(gpt.attributes(disk, 2).unwrap().priority(), 1);
        assert_eq!(gpt.attributes(disk, 6).unwrap().priority(), 0);
    }
}
