// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `build` subcommand: pack a kernel into a depthcharge image that
//! fits the board's size limit, escalating compression as needed.

use crate::board::{Board, Compression, ImageFormat};
use crate::platform;
use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use command_run::Command;
use fs_err as fs;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::UNIX_EPOCH;

/// Build failures with their own exit codes: a built image that does
/// not pass the board checks, and the two no-image-fits cases. The
/// initramfs variant gets its own code because shrinking the initramfs
/// is the usual fix.
#[derive(Debug)]
pub enum BuildError {
    FailedCheck,
    TooBig,
    InitramfsTooBig,
}

impl BuildError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BuildError::FailedCheck => 2,
            BuildError::InitramfsTooBig => 3,
            BuildError::TooBig => 4,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::FailedCheck => {
                write!(f, "built image does not pass the checks for this board")
            }
            BuildError::TooBig => {
                write!(f, "couldn't build a small enough image for this board")
            }
            BuildError::InitramfsTooBig => write!(
                f,
                "couldn't build a small enough image for this board; \
                 this is usually solvable by making the initramfs smaller"
            ),
        }
    }
}

impl std::error::Error for BuildError {}

/// Everything that goes into one image.
pub struct BuildInputs {
    pub vmlinuz: Utf8PathBuf,
    pub initramfs: Option<Utf8PathBuf>,
    pub dtbs: Vec<Utf8PathBuf>,
    /// Fully assembled kernel command line.
    pub cmdline: Vec<String>,
    pub description: String,
    pub keyblock: Option<Utf8PathBuf>,
    pub signprivate: Option<Utf8PathBuf>,
    pub signpubkey: Option<Utf8PathBuf>,
    pub timestamp: u64,
}

/// One packaging attempt at a fixed compression level.
pub struct PackageRequest<'a> {
    pub board: &'a Board,
    pub inputs: &'a BuildInputs,
    pub compress: Compression,
    pub output: &'a Utf8Path,
}

/// Packs inputs into a depthcharge image. The build loop drives this
/// once per compression attempt.
pub trait Packager {
    fn package(&self, req: &PackageRequest) -> Result<()>;
}

/// The real packager, shelling out to mkdepthcharge.
pub struct Mkdepthcharge;

impl Packager for Mkdepthcharge {
    fn package(&self, req: &PackageRequest) -> Result<()> {
        let inputs = req.inputs;
        let cmdline = inputs.cmdline.join(" ");

        let mut cmd = Command::new("mkdepthcharge");
        cmd.add_args(["--arch", req.board.arch.as_str()]);
        match req.board.image_format() {
            ImageFormat::Fit => {
                cmd.add_args(["--format", "fit"]);
                cmd.add_args(["--compress", req.compress.as_str()]);
                cmd.add_args(["--name", &inputs.description]);
            }
            ImageFormat::Zimage => {
                cmd.add_args(["--format", "zimage"]);
            }
        }
        // The cmdline already carries the kern_guid token.
        cmd.add_args(["--no-kern-guid", "--cmdline", &cmdline]);
        for (flag, key) in [
            ("--keyblock", &inputs.keyblock),
            ("--signprivate", &inputs.signprivate),
            ("--signpubkey", &inputs.signpubkey),
        ] {
            if let Some(key) = key {
                cmd.add_args([flag, key.as_str()]);
            }
        }
        cmd.add_args(["--output", req.output.as_str(), "--"]);
        cmd.add_arg(&inputs.vmlinuz);
        if let Some(initramfs) = &inputs.initramfs {
            cmd.add_arg(initramfs);
        }
        for dtb in &inputs.dtbs {
            cmd.add_arg(dtb);
        }
        cmd.capture = true;
        cmd.log_command = false;

        // mkdepthcharge keeps its outputs reproducible from this.
        std::env::set_var("SOURCE_DATE_EPOCH", inputs.timestamp.to_string());
        cmd.run()?;
        Ok(())
    }
}

/// Prepare the kernel command line for a built image:
/// - drop any `root=` that disagrees with the derived root, and append
///   the derived one if missing;
/// - append `noinitrd` when the initramfs is deliberately left out;
/// - make sure the `kern_guid=%U` token is present, so the kernel can
///   report which partition the firmware booted;
/// - reject configurations whose root device needs an initramfs when
///   none will be packed.
pub fn assemble_cmdline(
    cmdline: &[String],
    root: Option<&str>,
    has_initramfs: bool,
    ignore_initramfs: bool,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut append_root = root.is_some();

    for arg in cmdline {
        if let Some(rhs) = arg.strip_prefix("root=") {
            match root {
                Some(root) if rhs == root => {
                    append_root = false;
                }
                _ => {
                    warn!("kernel cmdline has a different root '{rhs}', removing it");
                    continue;
                }
            }
        }
        out.push(arg.clone());
    }

    if let Some(root) = root {
        if append_root {
            info!("appending 'root={root}' to kernel cmdline");
            out.push(format!("root={root}"));
        }
    }

    if ignore_initramfs {
        warn!("ignoring initramfs as configured, appending 'noinitrd'");
        out.push("noinitrd".to_string());
    }

    if let Some(root) = root {
        if (!has_initramfs || ignore_initramfs) && platform::root_requires_initramfs(root)? {
            bail!("an initramfs is required for root '{root}'");
        }
    }

    if !out.iter().any(|arg| arg.starts_with("kern_guid=")) {
        out.push("kern_guid=%U".to_string());
    }

    Ok(out)
}

/// Pick the build timestamp: an explicit value, then the environment's
/// SOURCE_DATE_EPOCH, then the newest input mtime. The initramfs is
/// generated after the kernel, so prefer its mtime.
pub fn resolve_timestamp(
    explicit: Option<u64>,
    vmlinuz: &Utf8Path,
    initramfs: Option<&Utf8Path>,
) -> Result<u64> {
    if let Some(seconds) = explicit {
        return Ok(seconds);
    }
    if let Ok(value) = std::env::var("SOURCE_DATE_EPOCH") {
        return value
            .trim()
            .parse()
            .with_context(|| format!("invalid SOURCE_DATE_EPOCH '{value}'"));
    }

    let path = initramfs.unwrap_or(vmlinuz);
    let mtime = fs::metadata(path)?.modified()?;
    let seconds = mtime
        .duration_since(UNIX_EPOCH)
        .context("input file mtime predates the epoch")?
        .as_secs();
    Ok(seconds)
}

/// Hash of everything that affects the output image. A matching
/// fingerprint sidecar means the existing image is already current.
pub fn fingerprint(board: &Board, inputs: &BuildInputs) -> Result<String> {
    let mut hasher = Sha256::new();

    hasher.update(board.name.as_bytes());
    hasher.update(board.arch.as_str().as_bytes());
    hasher.update(board.image_max_size.to_le_bytes());
    hasher.update(inputs.cmdline.join(" ").as_bytes());
    hasher.update(inputs.description.as_bytes());
    hasher.update(inputs.timestamp.to_le_bytes());

    let mut hash_file = |path: &Utf8Path| -> Result<()> {
        hasher.update(fs::read(path)?);
        Ok(())
    };
    hash_file(&inputs.vmlinuz)?;
    for path in [&inputs.initramfs, &inputs.keyblock, &inputs.signprivate] {
        if let Some(path) = path {
            hash_file(path)?;
        }
    }
    for dtb in &inputs.dtbs {
        hash_file(dtb)?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn fingerprint_path(output: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{output}.fingerprint"))
}

fn input_sizes(inputs: &BuildInputs) -> Result<(u64, u64)> {
    let mut total = fs::metadata(&inputs.vmlinuz)?.len();
    let mut initramfs_size = 0;
    if let Some(initramfs) = &inputs.initramfs {
        initramfs_size = fs::metadata(initramfs)?.len();
        total += initramfs_size;
    }
    for dtb in &inputs.dtbs {
        total += fs::metadata(dtb)?.len();
    }
    Ok((total, initramfs_size))
}

/// Build an image for the board into `output`, attempting the board's
/// compression types weakest to strongest until one fits. The fitting
/// image must pass `check` before it and its fingerprint sidecar are
/// moved into place, so a failed build never clobbers a good one.
pub fn build_image(
    packager: &dyn Packager,
    board: &Board,
    inputs: &BuildInputs,
    compress_override: Option<Vec<Compression>>,
    output: &Utf8Path,
    tmpdir: &Utf8Path,
    check: impl Fn(&Utf8Path) -> Result<()>,
) -> Result<Utf8PathBuf> {
    warn!("building depthcharge image for board '{}'", board.name);

    let fingerprint = fingerprint(board, inputs)?;
    let sidecar = fingerprint_path(output);
    if output.is_file() {
        if let Ok(existing) = fs::read_to_string(&sidecar) {
            if existing.trim() == fingerprint {
                info!("image '{output}' is already up to date");
                return Ok(output.to_path_buf());
            }
        }
    }

    let (inputs_size, initramfs_size) = input_sizes(inputs)?;
    if initramfs_size > 0 && !board.fits(initramfs_size) {
        return Err(BuildError::InitramfsTooBig)
            .context("initramfs alone is larger than the maximum image size");
    }

    let mut compressions = match compress_override {
        Some(list) => list,
        None => board.supported_compressions(),
    };
    if !board.fits(inputs_size) {
        info!("inputs are too big, skipping uncompressed build");
        compressions.retain(|c| *c != Compression::None);
    }

    let tmp_image = tmpdir.join(
        output
            .file_name()
            .context("output path has no file name")?,
    );

    let mut built = false;
    for compress in compressions {
        info!("trying with compression '{compress}'");
        packager.package(&PackageRequest {
            board,
            inputs,
            compress,
            output: &tmp_image,
        })?;

        let size = fs::metadata(&tmp_image)?.len();
        if board.fits(size) {
            built = true;
            break;
        }
        warn!("image with compression '{compress}' is too big for this board");
    }

    if !built {
        if inputs.initramfs.is_some() {
            return Err(BuildError::InitramfsTooBig.into());
        }
        return Err(BuildError::TooBig.into());
    }

    check(&tmp_image).context(BuildError::FailedCheck)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = Utf8PathBuf::from(format!("{output}.tmp"));
    fs::copy(&tmp_image, &staging)?;
    fs::rename(&staging, output)?;
    fs::write(&sidecar, format!("{fingerprint}\n"))?;

    info!("built depthcharge image '{output}'");
    Ok(output.to_path_buf())
}
