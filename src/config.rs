// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::board::Board;
use crate::platform;
use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs_err as fs;
use log::info;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Default config location.
pub const CONFIG_PATH: &str = "/etc/depthchargectl.toml";

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Codename of the board profile to use on this machine.
    #[serde(default)]
    pub board: Option<String>,

    /// Where `build` stores images when no output path is given.
    #[serde(default)]
    pub images_dir: Option<Utf8PathBuf>,

    /// Directories to search for vboot signing keys, before the system
    /// devkey locations.
    #[serde(default)]
    pub vboot_keydirs: Vec<Utf8PathBuf>,

    #[serde(default)]
    pub vboot_keyblock: Option<Utf8PathBuf>,
    #[serde(default)]
    pub vboot_public_key: Option<Utf8PathBuf>,
    #[serde(default)]
    pub vboot_private_key: Option<Utf8PathBuf>,

    /// Extra kernel cmdline parameters for built images.
    #[serde(default)]
    pub kernel_cmdline: Vec<String>,

    /// Build images without an initramfs even if one is installed.
    #[serde(default)]
    pub ignore_initramfs: bool,

    #[serde(default)]
    pub boards: BTreeMap<String, Board>,
}

impl Config {
    /// Read the config file, or start from the built-in defaults when
    /// the default path does not exist. An explicitly given path must
    /// exist.
    pub fn load(path: Option<&Utf8Path>) -> Result<Config> {
        let default = Utf8Path::new(CONFIG_PATH);
        let path = path.unwrap_or(default);
        if !path.is_file() && path == default {
            return Ok(Config::default());
        }
        let src = fs::read_to_string(path)?;
        Config::parse(&src).with_context(|| format!("failed to parse '{path}'"))
    }

    pub fn parse(src: &str) -> Result<Config> {
        Ok(toml::de::from_str(src)?)
    }

    /// Resolve the board profile to operate on: an explicit codename
    /// first, then the configured one, then a profile whose
    /// dt-compatible pattern matches this machine's device tree.
    pub fn board(&self, codename: Option<&str>) -> Result<&Board> {
        if let Some(codename) = codename.or(self.board.as_deref()) {
            return self
                .boards
                .get(codename)
                .with_context(|| format!("unknown board '{codename}'"));
        }

        let compatibles = platform::dt_compatibles();
        for (codename, board) in &self.boards {
            if let Some(re) = board.dt_compatible_regex()? {
                if compatibles.iter().any(|c| re.is_match(c)) {
                    info!("detected board '{codename}' from device tree");
                    return Ok(board);
                }
            }
        }

        bail!("no board configured and none detected; pass --board");
    }

    pub fn images_dir(&self) -> Utf8PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("/boot/depthcharge"))
    }
}
