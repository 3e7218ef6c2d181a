//! sparsecopy CLI - Write sparse virtual disk images onto raw destinations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use sparsecopy_core::{
    convert, describe, open_destination, open_image, ConvertOptions, ConvertProgress, DiskInfo,
    Format, ProgressCallback, SourceImage, DIRECT_IO_ALIGNMENT,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Copy the allocated blocks of a SESparse, VHD, VHDX or VMFS sparse image
/// onto a raw file or block device.
///
/// Without a destination, prints what the image describes as key=value lines.
#[derive(Parser)]
#[command(name = "sparsecopy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Input image.
    input: PathBuf,

    /// Raw destination. It must already exist unless --create is given.
    destination: Option<PathBuf>,

    /// Input format.
    #[arg(short, long, value_enum, default_value = "auto")]
    format: FormatArg,

    /// Open the destination with O_DIRECT.
    #[arg(long, value_enum, default_value = "auto")]
    direct: DirectArg,

    /// Create the destination sized to the virtual disk if it does not exist.
    #[arg(long)]
    create: bool,

    /// Maximum segments per vectored write (1-1024).
    #[arg(long, default_value = "256", value_parser = clap::value_parser!(u16).range(1..=1024))]
    max_segments: u16,

    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Input format argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    /// Detect from the image signature.
    Auto,
    /// VMware SESparse extent.
    Sesparse,
    /// Dynamic or differencing VHD.
    Vhd,
    /// VHDX.
    Vhdx,
    /// VMware VMFS sparse (COWD) extent.
    VmfsSparse,
}

impl From<FormatArg> for Option<Format> {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Auto => None,
            FormatArg::Sesparse => Some(Format::SeSparse),
            FormatArg::Vhd => Some(Format::Vhd),
            FormatArg::Vhdx => Some(Format::Vhdx),
            FormatArg::VmfsSparse => Some(Format::VmfsSparse),
        }
    }
}

/// Direct I/O argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectArg {
    /// On for the VMware formats, off otherwise.
    Auto,
    On,
    Off,
}

impl DirectArg {
    fn enabled(self, format: Format) -> bool {
        match self {
            DirectArg::Auto => format.prefers_direct_io(),
            DirectArg::On => true,
            DirectArg::Off => false,
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let source = SourceImage::open(&cli.input)?;
    let image = open_image(source.data(), cli.format.into())
        .with_context(|| format!("failed to open {}", cli.input.display()))?;

    match cli.destination.as_deref() {
        None => print_info(&describe(image.as_ref())),
        Some(destination) => run_convert(&cli, image.as_ref(), destination)?,
    }

    Ok(())
}

fn run_convert(
    cli: &Cli,
    image: &dyn sparsecopy_core::SparseImage,
    destination: &Path,
) -> Result<()> {
    let format = image.format();
    let virtual_size = image.virtual_size();
    let direct = cli.direct.enabled(format);

    let create_len = cli.create.then_some(virtual_size);
    let mut target = open_destination(destination, direct, create_len)?;

    let options = ConvertOptions {
        max_segments: usize::from(cli.max_segments),
        alignment: direct.then_some(DIRECT_IO_ALIGNMENT),
        ..ConvertOptions::default()
    };
    info!(%format, virtual_size, direct, destination = %destination.display(), "converting");

    let progress_bar = if cli.quiet {
        None
    } else {
        let pb = ProgressBar::new(virtual_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let callback: Option<ProgressCallback> = progress_bar.clone().map(|pb| {
        Box::new(move |progress: ConvertProgress| {
            pb.set_position(progress.virtual_offset);
            pb.set_message(format!("{} written", HumanBytes(progress.bytes_written)));
        }) as ProgressCallback
    });

    let report = convert(image, &mut target, &options, callback)
        .with_context(|| format!("failed to write {}", destination.display()))?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("done");
    }

    if !cli.quiet {
        eprintln!(
            "{}: {} written in {} writes ({} present, {} partial, {} zero, {} skipped)",
            destination.display(),
            HumanBytes(report.stats.bytes_written),
            report.stats.writes,
            report.present,
            report.partial,
            report.zero_filled,
            report.skipped,
        );
    }

    Ok(())
}

fn print_info(info: &DiskInfo) {
    println!("format={}", info.format);
    println!("virtualSize={}", info.virtual_size);
    if let Some(id) = info.disk_id {
        println!("dataGuid={id}");
    }
    if let Some(name) = &info.name {
        println!("name={name}");
    }
    if let Some(parent) = &info.parent {
        if let Some(linkage) = parent.linkage {
            println!("parentDataGuid={linkage}");
        }
        if let Some(path) = &parent.path {
            println!("parentPath={path}");
        }
        if let Some(volume_path) = &parent.volume_path {
            println!("parentVolumePath={volume_path}");
        }
    }
}
