// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod attrs;
mod board;
mod build;
mod cgpt;
mod check;
mod config;
mod device;
mod kernels;
mod list;
mod logging;
mod platform;
mod rotation;
mod target;
mod write;

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use board::Compression;
use build::{BuildError, BuildInputs, Mkdepthcharge};
use camino::{Utf8Path, Utf8PathBuf};
use cgpt::{Cgpt, GptTool};
use check::CheckError;
use config::Config;
use device::{split_partition_name, DeviceGraph, PartName, Partition};
use kernels::KernelEntry;
use std::process;
use target::{TargetError, TargetRequest};
use tempfile::TempDir;

/// Manage the ChromeOS bootloader's kernel partitions.
#[derive(FromArgs, PartialEq, Debug)]
pub struct Opt {
    /// print info messages about what is being done
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// print debug messages, including external tool output
    #[argh(switch)]
    debug: bool,

    /// read configuration from this file instead of the default
    #[argh(option)]
    config: Option<Utf8PathBuf>,

    /// codename of the board to operate on
    #[argh(option)]
    board: Option<String>,

    /// subcommand to run
    #[argh(subcommand)]
    action: Action,
}

impl Opt {
    fn verbosity(&self) -> u8 {
        if self.debug {
            2
        } else if self.verbose {
            1
        } else {
            0
        }
    }
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Action {
    Build(BuildAction),
    Check(CheckAction),
    List(ListAction),
    Target(TargetAction),
    Write(WriteAction),
    Bless(BlessAction),
    Remove(RemoveAction),
}

/// Build a depthcharge image for this system.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "build")]
struct BuildAction {
    /// installed kernel version to build an image for
    #[argh(positional)]
    kernel_version: Option<String>,

    /// kernel image file to use instead of an installed one
    #[argh(option)]
    kernel: Option<Utf8PathBuf>,

    /// initramfs file to include
    #[argh(option)]
    initramfs: Option<Utf8PathBuf>,

    /// device-tree blob to include; may be given multiple times
    #[argh(option)]
    dtb: Vec<Utf8PathBuf>,

    /// human-readable description for the image
    #[argh(option)]
    description: Option<String>,

    /// extra kernel cmdline parameter; may be given multiple times
    #[argh(option)]
    cmdline: Vec<String>,

    /// root device to use instead of the currently mounted one
    #[argh(option)]
    root: Option<String>,

    /// compression type to attempt; may be given multiple times
    #[argh(option)]
    compress: Vec<String>,

    /// unix timestamp to build the image with
    #[argh(option)]
    timestamp: Option<u64>,

    /// build the image without an initramfs
    #[argh(switch)]
    ignore_initramfs: bool,

    /// output image to this path instead of the images dir
    #[argh(option, short = 'o')]
    output: Option<Utf8PathBuf>,
}

/// Check if a depthcharge image can be booted on this board.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "check")]
struct CheckAction {
    /// image to check
    #[argh(positional)]
    image: Utf8PathBuf,
}

/// List ChromeOS kernel partitions.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "list")]
struct ListAction {
    /// disks to check for ChromeOS kernel partitions
    #[argh(positional)]
    disks: Vec<Utf8PathBuf>,

    /// check all physical disks
    #[argh(switch, short = 'a')]
    all_disks: bool,

    /// don't print column headings
    #[argh(switch, short = 'n')]
    no_headings: bool,

    /// comma-separated list of columns to output
    #[argh(option, short = 'o')]
    output: Option<String>,
}

/// Choose the next kernel partition to write an image to.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "target")]
struct TargetAction {
    /// disks or partitions to choose from
    #[argh(positional)]
    devices: Vec<Utf8PathBuf>,

    /// only consider partitions bigger than this many bytes
    #[argh(option, short = 's')]
    min_size: Option<u64>,

    /// allow targeting the currently booted partition
    #[argh(switch)]
    allow_current: bool,
}

/// Write an image to a kernel partition and make it next to boot.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "write")]
struct WriteAction {
    /// installed kernel version to build and write
    #[argh(positional)]
    kernel_version: Option<String>,

    /// depthcharge image to write
    #[argh(option)]
    image: Option<Utf8PathBuf>,

    /// disk or partition to write to
    #[argh(option, short = 't')]
    target: Option<Utf8PathBuf>,

    /// write the image even if it fails the board checks
    #[argh(switch, short = 'f')]
    force: bool,

    /// allow overwriting the currently booted partition
    #[argh(switch)]
    allow_current: bool,

    /// don't make the written partition next to boot
    #[argh(switch)]
    no_prioritize: bool,
}

/// Mark a partition as successfully booted, next to try, or bad.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "bless")]
struct BlessAction {
    /// partition to mark; defaults to the currently booted one
    #[argh(positional)]
    partition: Option<Utf8PathBuf>,

    /// make the partition bootable once without marking it successful
    #[argh(switch)]
    oneshot: bool,

    /// mark the partition as unbootable
    #[argh(switch)]
    bad: bool,
}

/// Disable kernel partitions that contain a given image.
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "remove")]
struct RemoveAction {
    /// image whose partitions should be disabled
    #[argh(positional)]
    image: Utf8PathBuf,

    /// allow disabling the currently booted partition
    #[argh(switch, short = 'f')]
    force: bool,
}

/// The partition this system booted from, located through the
/// `kern_guid=` parameter depthcharge put on the kernel cmdline.
fn current_partition(gpt: &dyn GptTool) -> Option<Partition> {
    let cmdline = platform::kernel_cmdline();
    let uuid = platform::kern_guid(&cmdline)?;
    let path = gpt.find_by_partuuid(uuid).ok().flatten()?;
    Partition::from_device_path(&path)
}

/// Sort a device argument into an explicit partition or a whole disk.
/// A name that looks like a partition but has an unusable number is
/// reported as such rather than silently rescanned as a disk.
fn classify_device(path: &Utf8Path) -> Result<DeviceArg> {
    if let Some(part) = Partition::from_device_path(path) {
        return Ok(DeviceArg::Partition(part));
    }
    if let Some(name) = path.file_name() {
        if split_partition_name(name) == PartName::BadNumber {
            let part = Partition {
                disk: path.to_path_buf(),
                partno: None,
                path: Some(path.to_path_buf()),
            };
            return Err(TargetError::NoPartitionNumber(part).into());
        }
    }
    Ok(DeviceArg::Disk(path.to_path_buf()))
}

enum DeviceArg {
    Partition(Partition),
    Disk(Utf8PathBuf),
}

/// Usage mistakes get a pointer at the relevant help text on top of the
/// error message.
fn usage_error(msg: &str, subcommand: &str) -> anyhow::Error {
    anyhow!("{msg} (see 'depthchargectl {subcommand} --help')")
}

/// Resolve what `write` should put on disk: an explicit image, or an
/// image built for an installed kernel. Giving both is an error.
fn write_source(
    kernel_version: Option<&str>,
    image: Option<&Utf8Path>,
) -> Result<WriteSource> {
    match (kernel_version, image) {
        (Some(_), Some(_)) => Err(usage_error(
            "a kernel version and an image cannot be given together",
            "write",
        )),
        (_, Some(image)) => Ok(WriteSource::Image(image.to_path_buf())),
        (version, None) => Ok(WriteSource::Build(version.map(str::to_string))),
    }
}

#[derive(Debug, PartialEq)]
enum WriteSource {
    Image(Utf8PathBuf),
    Build(Option<String>),
}

fn utf8_temp_path(tmpdir: &TempDir) -> Result<&Utf8Path> {
    Utf8Path::from_path(tmpdir.path()).context("temp dir path is not UTF-8")
}

fn resolve_kernel_entry(version: Option<&str>) -> Result<KernelEntry> {
    let kernels = kernels::installed_kernels(Utf8Path::new("/"))?;
    match version {
        Some(version) => kernels
            .into_iter()
            .find(|k| k.release.as_deref() == Some(version))
            .with_context(|| {
                format!("could not find an installed kernel for version '{version}'")
            }),
        None => kernels
            .into_iter()
            .next()
            .context("could not find any installed kernel"),
    }
}

fn run_build(opt: &Opt, action: &BuildAction, config: &Config) -> Result<Utf8PathBuf> {
    let board = config.board(opt.board.as_deref())?;

    let (entry, release) = if let Some(kernel) = &action.kernel {
        let entry = KernelEntry {
            release: action.kernel_version.clone(),
            kernel: kernel.clone(),
            initrd: None,
            fdtdir: None,
        };
        (entry, action.kernel_version.clone())
    } else {
        let entry = resolve_kernel_entry(action.kernel_version.as_deref())?;
        let release = entry.release.clone();
        (entry, release)
    };

    let ignore_initramfs = action.ignore_initramfs || config.ignore_initramfs;
    let initramfs = if ignore_initramfs {
        None
    } else {
        action.initramfs.clone().or_else(|| entry.initrd.clone())
    };

    let mut dtbs = action.dtb.clone();
    if dtbs.is_empty() {
        if let Some(fdtdir) = &entry.fdtdir {
            dtbs = kernels::dtbs_in(fdtdir)?;
        }
    }
    if board.image_format() == board::ImageFormat::Zimage && !dtbs.is_empty() {
        return Err(usage_error(
            "device tree files are not supported with the zimage format",
            "build",
        ));
    }

    let root = match &action.root {
        Some(root) => Some(root.strip_prefix("root=").unwrap_or(root).to_string()),
        None => platform::mount_source(Utf8Path::new("/"))?.map(|p| p.to_string()),
    };

    let mut cmdline = config.kernel_cmdline.clone();
    cmdline.extend(action.cmdline.iter().cloned());
    let cmdline = build::assemble_cmdline(
        &cmdline,
        root.as_deref(),
        initramfs.is_some(),
        ignore_initramfs,
    )?;

    let timestamp =
        build::resolve_timestamp(action.timestamp, &entry.kernel, initramfs.as_deref())?;

    let keys = platform::vboot_keys(&config.vboot_keydirs);
    let inputs = BuildInputs {
        vmlinuz: entry.kernel.clone(),
        initramfs,
        dtbs,
        cmdline,
        description: action
            .description
            .clone()
            .unwrap_or_else(|| entry.description()),
        keyblock: config.vboot_keyblock.clone().or(keys.keyblock),
        signprivate: config.vboot_private_key.clone().or(keys.signprivate),
        signpubkey: config.vboot_public_key.clone().or(keys.signpubkey),
        timestamp,
    };

    let compress_override = if action.compress.is_empty() {
        None
    } else {
        let list: Result<Vec<Compression>> =
            action.compress.iter().map(|c| c.parse()).collect();
        Some(list?)
    };

    let output = match &action.output {
        Some(output) => output.clone(),
        None => {
            let name = release.as_deref().unwrap_or("default");
            config.images_dir().join(format!("{name}.img"))
        }
    };

    let tmpdir = TempDir::new()?;
    let tmp = utf8_temp_path(&tmpdir)?;
    build::build_image(
        &Mkdepthcharge,
        board,
        &inputs,
        compress_override,
        &output,
        tmp,
        |image| check::check_image(board, image, inputs.signpubkey.as_deref(), tmp),
    )
}

fn run_check(opt: &Opt, action: &CheckAction, config: &Config) -> Result<()> {
    let board = config.board(opt.board.as_deref())?;
    let tmpdir = TempDir::new()?;
    check::check_image(
        board,
        &action.image,
        config.vboot_public_key.as_deref(),
        utf8_temp_path(&tmpdir)?,
    )
}

fn run_list(action: &ListAction, gpt: &dyn GptTool) -> Result<()> {
    let disks = if !action.disks.is_empty() {
        let graph = DeviceGraph::scan();
        graph.physical_disks(action.disks.iter().map(Utf8PathBuf::as_path))
    } else if action.all_disks {
        DeviceGraph::scan().physical_disks(std::iter::empty::<&Utf8Path>())
    } else {
        list::bootable_disks(&DeviceGraph::scan())?
    };

    let columns = match &action.output {
        Some(arg) => list::parse_columns(arg)?,
        None => list::Column::DEFAULT.to_vec(),
    };

    let parts = list::cros_partitions(gpt, &disks)?;
    let table = list::format_table(&parts, &columns, !action.no_headings);
    if !table.is_empty() {
        println!("{table}");
    }
    Ok(())
}

fn run_target(action: &TargetAction, gpt: &dyn GptTool) -> Result<()> {
    let mut partitions = Vec::new();
    let mut disks = Vec::new();
    for device in &action.devices {
        match classify_device(device)? {
            DeviceArg::Partition(part) => partitions.push(part),
            DeviceArg::Disk(disk) => disks.push(disk),
        }
    }
    if partitions.is_empty() && disks.is_empty() {
        disks = list::bootable_disks(&DeviceGraph::scan())?;
    }

    let chosen = target::select_target(
        gpt,
        &TargetRequest {
            partitions,
            disks,
            min_size: action.min_size,
            allow_current: action.allow_current,
            current: current_partition(gpt),
        },
    )?;
    println!("{chosen}");
    Ok(())
}

fn run_write(opt: &Opt, action: &WriteAction, config: &Config, gpt: &dyn GptTool) -> Result<()> {
    let image = match write_source(action.kernel_version.as_deref(), action.image.as_deref())? {
        WriteSource::Image(image) => image,
        WriteSource::Build(version) => {
            let build_action = BuildAction {
                kernel_version: version,
                kernel: None,
                initramfs: None,
                dtb: Vec::new(),
                description: None,
                cmdline: Vec::new(),
                root: None,
                compress: Vec::new(),
                timestamp: None,
                ignore_initramfs: false,
                output: None,
            };
            run_build(opt, &build_action, config)?
        }
    };

    let board = config.board(opt.board.as_deref())?;
    let tmpdir = TempDir::new()?;
    let tmp = utf8_temp_path(&tmpdir)?;
    let signpubkey = config.vboot_public_key.clone();

    let disks = if action.target.is_some() {
        Vec::new()
    } else {
        list::bootable_disks(&DeviceGraph::scan())?
    };

    write::write_image(
        gpt,
        &write::WriteRequest {
            image,
            target: action.target.clone(),
            disks,
            force: action.force,
            allow_current: action.allow_current,
            prioritize: !action.no_prioritize,
            current: current_partition(gpt),
        },
        |image| check::check_image(board, image, signpubkey.as_deref(), tmp),
    )?;
    Ok(())
}

fn run_bless(action: &BlessAction, gpt: &dyn GptTool) -> Result<()> {
    if action.oneshot && action.bad {
        return Err(usage_error(
            "--oneshot and --bad cannot be given together",
            "bless",
        ));
    }
    let mode = if action.bad {
        rotation::BlessMode::Bad
    } else if action.oneshot {
        rotation::BlessMode::Oneshot
    } else {
        rotation::BlessMode::Good
    };

    let part = match &action.partition {
        Some(path) => match classify_device(path)? {
            DeviceArg::Partition(part) => part,
            DeviceArg::Disk(_) => {
                return Err(usage_error(&format!("'{path}' is not a partition"), "bless"))
            }
        },
        None => {
            if !platform::is_cros_boot() {
                bail!("this system doesn't appear to have been booted by depthcharge");
            }
            current_partition(gpt)
                .context("couldn't figure out the currently booted partition")?
        }
    };

    rotation::bless(gpt, &part, mode)
}

fn run_remove(action: &RemoveAction, config: &Config, gpt: &dyn GptTool) -> Result<()> {
    let disks = list::bootable_disks(&DeviceGraph::scan())?;
    let current = current_partition(gpt);
    let removed = rotation::remove(
        gpt,
        &disks,
        &action.image,
        current.as_ref(),
        action.force,
    )?;
    if !removed.is_empty() {
        rotation::clean_image(&config.images_dir(), &action.image)?;
    }
    Ok(())
}

fn run(opt: &Opt) -> Result<()> {
    let config = Config::load(opt.config.as_deref())?;
    let gpt = Cgpt;

    match &opt.action {
        Action::Build(action) => {
            let output = run_build(opt, action, &config)?;
            println!("{output}");
            Ok(())
        }
        Action::Check(action) => run_check(opt, action, &config),
        Action::List(action) => run_list(action, &gpt),
        Action::Target(action) => run_target(action, &gpt),
        Action::Write(action) => run_write(opt, action, &config, &gpt),
        Action::Bless(action) => run_bless(action, &gpt),
        Action::Remove(action) => run_remove(action, &config, &gpt),
    }
}

/// Typed failures carry their own exit codes so scripts can react to
/// specific conditions; everything else exits 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<TargetError>() {
        err.exit_code()
    } else if let Some(err) = err.downcast_ref::<BuildError>() {
        err.exit_code()
    } else if let Some(err) = err.downcast_ref::<CheckError>() {
        err.exit_code()
    } else {
        1
    }
}

fn main() {
    let opt: Opt = argh::from_env();
    if let Err(err) = logging::init(opt.verbosity()) {
        eprintln!("depthchargectl: failed to set up logging: {err}");
    }

    if let Err(err) = run(&opt) {
        eprintln!("depthchargectl: error: {err:#}");
        process::exit(exit_code(&err).into());
    }
}
