// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `list` subcommand: find ChromeOS kernel partitions and print
//! them as a table.

use crate::attrs::KernelAttributes;
use crate::cgpt::GptTool;
use crate::device::{DeviceGraph, Partition};
use crate::platform;
use anyhow::{bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::info;
use std::str::FromStr;

/// An output column. Short and long spellings parse to the same
/// column; headings use the short one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Column {
    Attribute,
    Successful,
    Priority,
    Tries,
    Path,
    DiskPath,
    Partno,
    Size,
}

impl Column {
    pub const DEFAULT: &'static [Column] =
        &[Column::Successful, Column::Priority, Column::Tries, Column::Path];

    fn heading(self) -> &'static str {
        match self {
            Column::Attribute => "A",
            Column::Successful => "S",
            Column::Priority => "P",
            Column::Tries => "T",
            Column::Path => "PATH",
            Column::DiskPath => "DISKPATH",
            Column::Partno => "PARTNO",
            Column::Size => "SIZE",
        }
    }
}

impl FromStr for Column {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Column> {
        match s {
            "A" | "ATTRIBUTE" => Ok(Column::Attribute),
            "S" | "SUCCESSFUL" => Ok(Column::Successful),
            "P" | "PRIORITY" => Ok(Column::Priority),
            "T" | "TRIES" => Ok(Column::Tries),
            "PATH" => Ok(Column::Path),
            "DISKPATH" => Ok(Column::DiskPath),
            "PARTNO" => Ok(Column::Partno),
            "SIZE" => Ok(Column::Size),
            _ => bail!("unsupported output column '{s}'"),
        }
    }
}

/// Parse a comma-separated `-o` argument.
pub fn parse_columns(arg: &str) -> Result<Vec<Column>> {
    arg.split(',').map(str::parse).collect()
}

/// One ChromeOS kernel partition with the data the table can show.
#[derive(Clone, Debug)]
pub struct CrosPartition {
    pub part: Partition,
    pub attrs: KernelAttributes,
    pub size: u64,
}

impl CrosPartition {
    fn cell(&self, column: Column) -> String {
        match column {
            Column::Attribute => self.attrs.to_raw().to_string(),
            Column::Successful => u8::from(self.attrs.successful()).to_string(),
            Column::Priority => self.attrs.priority().to_string(),
            Column::Tries => self.attrs.tries().to_string(),
            Column::Path => match &self.part.path {
                Some(path) => path.to_string(),
                None => "-".to_string(),
            },
            Column::DiskPath => self.part.disk.to_string(),
            Column::Partno => match self.part.partno {
                Some(partno) => partno.to_string(),
                None => "-".to_string(),
            },
            Column::Size => self.size.to_string(),
        }
    }
}

/// All ChromeOS kernel partitions on the given disks, in disk order.
/// Disks listed twice contribute their partitions once.
pub fn cros_partitions(
    gpt: &dyn GptTool,
    disks: &[Utf8PathBuf],
) -> Result<Vec<CrosPartition>> {
    let mut disks: Vec<&Utf8PathBuf> = disks.iter().collect();
    disks.dedup();

    let mut found = Vec::new();
    for disk in disks {
        for partno in gpt.find_kernel_partnos(disk)? {
            let part = Partition::new(disk, partno);
            let attrs = gpt.attributes(disk, partno)?;
            let size = gpt.size_bytes(&part)?;
            found.push(CrosPartition { part, attrs, size });
        }
    }
    found.sort_by(|a, b| (&a.part.disk, a.part.partno).cmp(&(&b.part.disk, b.part.partno)));
    found.dedup_by(|a, b| a.part == b.part);
    Ok(found)
}

/// The disks the firmware could boot from: the physical devices backing
/// the root and boot filesystems.
pub fn bootable_disks(graph: &DeviceGraph) -> Result<Vec<Utf8PathBuf>> {
    let mut mounts = Vec::new();
    for mountpoint in ["/", "/boot"] {
        if let Some(source) = platform::mount_source(Utf8Path::new(mountpoint))? {
            mounts.push(source);
        }
    }
    let disks = graph.physical_disks(mounts.iter().map(Utf8PathBuf::as_path));
    info!("using bootable disks: {disks:?}");
    Ok(disks)
}

/// Render rows with each column padded to its widest cell (at least 4
/// characters, so short headings don't squeeze the data).
pub fn format_table(
    parts: &[CrosPartition],
    columns: &[Column],
    headings: bool,
) -> String {
    let mut rows: Vec<Vec<String>> = Vec::new();
    if headings {
        rows.push(columns.iter().map(|c| c.heading().to_string()).collect());
    }
    for part in parts {
        rows.push(columns.iter().map(|c| part.cell(*c)).collect());
    }

    let widths: Vec<usize> = (0..columns.len())
        .map(|i| rows.iter().map(|row| row[i].len()).max().unwrap_or(0).max(4))
        .collect();

    rows.iter()
        .map(|row| {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join(" ");
            line.trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgpt::fake::FakeGpt;

    #[test]
    fn test_parse_columns() {
        assert_eq!(
            parse_columns("S,P,T,PATH").unwrap(),
            [Column::Successful, Column::Priority, Column::Tries, Column::Path]
        );
        assert_eq!(
            parse_columns("SUCCESSFUL,SIZE").unwrap(),
            [Column::Successful, Column::Size]
        );
        assert!(parse_columns("S,NOPE").is_err());
        assert!(parse_columns("").is_err());
    }

    #[test]
    fn test_cros_partitions_and_table() {
        let gpt = FakeGpt::new();
        let disk = Utf8Path::new("/nonexistent/fakedisk");
        gpt.add_kernel_partition(disk, 2, 0x111, 0x10000);
        gpt.add_kernel_partition(disk, 4, 0x010, 0x20000);

        // Passing the disk twice must not duplicate rows.
        let disks = vec![disk.to_path_buf(), disk.to_path_buf()];
        let parts = cros_partitions(&gpt, &disks).unwrap();
        assert_eq!(parts.len(), 2);

        let columns = [Column::Successful, Column::Priority, Column::Partno, Column::Size];
        let table = format_table(&parts, &columns, true);
        let expected = "\
S    P    PARTNO SIZE
1    1    2      65536
0    0    4      131072";
        assert_eq!(table, expected);

        let bare = format_table(&parts, &columns, false);
        assert_eq!(bare.lines().count(), 2);
    }
}
