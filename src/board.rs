// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Board profiles: what kind of image a machine's depthcharge build
//! accepts and how big it may be.

use anyhow::{bail, Result};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm,
    #[serde(alias = "aarch64")]
    Arm64,
    #[serde(alias = "i386")]
    X86,
    #[serde(alias = "x86_64")]
    Amd64,
}

impl Arch {
    /// The name mkdepthcharge takes for `--arch`.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::Amd64 => "amd64",
        }
    }

    /// Depthcharge boots x86 boards from a zimage and ARM boards from a
    /// FIT image.
    pub fn default_image_format(self) -> ImageFormat {
        match self {
            Arch::Arm | Arch::Arm64 => ImageFormat::Fit,
            Arch::X86 | Arch::Amd64 => ImageFormat::Zimage,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Fit,
    Zimage,
}

/// FIT kernel compression types, ordered weakest to strongest.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Compression {
    None,
    Lz4,
    Lzma,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Lzma => "lzma",
        }
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Compression> {
        match s {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "lzma" => Ok(Compression::Lzma),
            _ => bail!("unsupported compression type '{s}'"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One machine model's depthcharge constraints, from the config file's
/// `[boards.<codename>]` tables.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Board {
    /// Marketing name, for log messages.
    pub name: String,
    pub arch: Arch,
    #[serde(default)]
    pub image_format: Option<ImageFormat>,
    /// Largest image the firmware will load, in bytes. 0 means the
    /// firmware enforces no limit.
    #[serde(default)]
    pub image_max_size: u64,
    #[serde(default)]
    pub boots_lz4_kernel: bool,
    #[serde(default)]
    pub boots_lzma_kernel: bool,
    /// Regex over this machine's device-tree compatible strings, used
    /// to pick a board profile when none is configured.
    #[serde(default)]
    pub dt_compatible: Option<String>,
}

impl Board {
    pub fn image_format(&self) -> ImageFormat {
        self.image_format
            .unwrap_or_else(|| self.arch.default_image_format())
    }

    /// Compression types worth attempting for this board, weakest
    /// first. zimage does not support compression at all.
    pub fn supported_compressions(&self) -> Vec<Compression> {
        if self.image_format() == ImageFormat::Zimage {
            return vec![Compression::None];
        }
        let mut list = vec![Compression::None];
        if self.boots_lz4_kernel {
            list.push(Compression::Lz4);
        }
        if self.boots_lzma_kernel {
            list.push(Compression::Lzma);
        }
        list
    }

    /// Whether an image of this size fits the board's limit.
    pub fn fits(&self, size: u64) -> bool {
        self.image_max_size == 0 || size < self.image_max_size
    }

    pub fn dt_compatible_regex(&self) -> Result<Option<Regex>> {
        match &self.dt_compatible {
            Some(pattern) => Ok(Some(Regex::new(pattern)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit_board() -> Board {
        Board {
            name: "Test".to_string(),
            arch: Arch::Arm64,
            image_format: None,
            image_max_size: 0x1000,
            boots_lz4_kernel: true,
            boots_lzma_kernel: false,
            dt_compatible: None,
        }
    }

    #[test]
    fn test_compression_order() {
        assert!(Compression::None < Compression::Lz4);
        assert!(Compression::Lz4 < Compression::Lzma);
        assert_eq!("lz4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert!("gzip".parse::<Compression>().is_err());
    }

    #[test]
    fn test_supported_compressions() {
        let board = fit_board();
        assert_eq!(
            board.supported_compressions(),
            [Compression::None, Compression::Lz4]
        );

        let mut zimage = fit_board();
        zimage.arch = Arch::Amd64;
        assert_eq!(zimage.image_format(), ImageFormat::Zimage);
        assert_eq!(zimage.supported_compressions(), [Compression::None]);
    }

    #[test]
    fn test_size_limit() {
        let board = fit_board();
        assert!(board.fits(0xfff));
        assert!(!board.fits(0x1000));

        let mut unlimited = fit_board();
        unlimited.image_max_size = 0;
        assert!(unlimited.fits(u64::MAX));
    }
}
