#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use wfs::{Entry, Image, OpenOptions};

#[derive(Parser)]
#[command(name = "wfs", about = "WitnessFS — read-only E01 image toolkit", version)]
struct Cli {
    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Raise checksum mismatches as errors instead of warnings.
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show image geometry, case metadata, and warnings.
    Info {
        /// Path to the primary .E01 segment.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List the partition table of the reconstructed disk.
    Partitions {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Detect the filesystem inside the image.
    Detect { image: PathBuf },
    /// List a directory of the contained filesystem.
    Ls {
        image: PathBuf,
        /// Directory path inside the filesystem.
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a contained file to stdout or to a local file.
    Cat {
        image: PathBuf,
        /// File path inside the filesystem.
        path: String,
        /// Write to this local file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Re-read the whole image and compare its MD5 with the stored
    /// acquisition hash.
    Verify { image: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(format!("wfs={}", cli.log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = OpenOptions {
        strict: cli.strict,
        ..OpenOptions::default()
    };

    match cli.command {
        Command::Info { image, json } => info(&image, json, options),
        Command::Partitions { image, json } => partitions(&image, json, options),
        Command::Detect { image } => detect(&image, options),
        Command::Ls { image, path, json } => ls(&image, &path, json, options),
        Command::Cat {
            image,
            path,
            output,
        } => cat(&image, &path, output.as_deref(), options),
        Command::Verify { image } => verify(&image, options),
    }
}

fn open(path: &std::path::Path, options: OpenOptions) -> Result<Image> {
    Image::open_with(path, options)
        .with_context(|| format!("opening {} as an EWF image", path.display()))
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    segment_number: u16,
    sector_size: u32,
    sector_count: u64,
    size_bytes: u64,
    chunk_count: u64,
    metadata: &'a wfs::EwfMetadata,
    warnings: Vec<wfs::Warning>,
}

fn info(path: &std::path::Path, json: bool, options: OpenOptions) -> Result<()> {
    let image = open(path, options)?;
    let metadata = image.metadata();

    if json {
        let output = InfoOutput {
            segment_number: metadata.segment_number,
            sector_size: image.sector_size(),
            sector_count: image.sector_count(),
            size_bytes: image.size_bytes(),
            chunk_count: metadata.volume.chunk_count,
            metadata,
            warnings: image.warnings(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("segment:       {}", metadata.segment_number);
    println!(
        "geometry:      {} sectors x {} bytes ({} bytes total)",
        image.sector_count(),
        image.sector_size(),
        image.size_bytes()
    );
    println!(
        "chunks:        {} x {} sectors",
        metadata.volume.chunk_count, metadata.volume.sectors_per_chunk
    );
    if let Some(case) = &metadata.case_info {
        if let Some(number) = &case.case_number {
            println!("case:          {number}");
        }
        if let Some(evidence) = &case.evidence_number {
            println!("evidence:      {evidence}");
        }
        if let Some(examiner) = &case.examiner {
            println!("examiner:      {examiner}");
        }
        if let Some(description) = &case.unique_description {
            println!("description:   {description}");
        }
    }
    if let Some(guid) = &metadata.volume.set_identifier {
        println!("set id:        {guid}");
    }
    for digest in [&metadata.digest, &metadata.hash].into_iter().flatten() {
        if let Some(md5) = &digest.md5 {
            println!("md5:           {md5}");
        }
        if let Some(sha1) = &digest.sha1 {
            println!("sha1:          {sha1}");
        }
    }
    if !metadata.acquisition_errors.is_empty() {
        println!(
            "read errors:   {} ranges recorded at acquisition",
            metadata.acquisition_errors.len()
        );
    }
    for warning in image.warnings() {
        println!("warning:       {warning}");
    }
    Ok(())
}

fn partitions(path: &std::path::Path, json: bool, options: OpenOptions) -> Result<()> {
    let image = open(path, options)?;
    let partitions = image.partitions()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&partitions)?);
        return Ok(());
    }

    if partitions.is_empty() {
        println!("no partition table found");
        return Ok(());
    }
    for partition in partitions {
        let kind = match &partition.kind {
            wfs::PartitionKind::Mbr { partition_type } => format!("mbr type {partition_type:#04x}"),
            wfs::PartitionKind::Gpt { type_guid } => format!("gpt {type_guid}"),
        };
        println!(
            "{:>2}  start {:>10}  sectors {:>10}  {}{}",
            partition.index,
            partition.start_lba,
            partition.sector_count,
            kind,
            partition
                .name
                .as_deref()
                .map(|n| format!("  \"{n}\""))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn detect(path: &std::path::Path, options: OpenOptions) -> Result<()> {
    let image = open(path, options)?;
    println!("{}", image.detect_filesystem()?);
    Ok(())
}

fn format_entry(entry: &Entry) -> String {
    let kind = if entry.is_dir() { "d" } else { "-" };
    let timestamp = entry
        .meta
        .modified
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_owned());
    format!(
        "{kind} {:>12}  {timestamp}  {}{}",
        entry.meta.size,
        entry.meta.name,
        if entry.meta.deleted { "  (deleted)" } else { "" }
    )
}

fn ls(path: &std::path::Path, dir_path: &str, json: bool, options: OpenOptions) -> Result<()> {
    let image = open(path, options)?;
    let filesystem = image.open_filesystem()?;
    let dir = filesystem.open_dir(dir_path)?;
    let entries = dir.entries()?;

    if json {
        let metas: Vec<_> = entries.iter().map(|e| &e.meta).collect();
        println!("{}", serde_json::to_string_pretty(&metas)?);
        return Ok(());
    }
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn cat(
    path: &std::path::Path,
    file_path: &str,
    output: Option<&std::path::Path>,
    options: OpenOptions,
) -> Result<()> {
    let image = open(path, options)?;
    let filesystem = image.open_filesystem()?;
    let file = filesystem.open_file(file_path)?;

    match output {
        Some(target) => {
            let mut out = std::fs::File::create(target)
                .with_context(|| format!("creating {}", target.display()))?;
            for chunk in file.open_stream() {
                out.write_all(&chunk?)?;
            }
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            for chunk in file.open_stream() {
                lock.write_all(&chunk?)?;
            }
        }
    }
    Ok(())
}

fn verify(path: &std::path::Path, options: OpenOptions) -> Result<()> {
    let image = open(path, options)?;
    let Some(stored) = image
        .metadata()
        .digest
        .as_ref()
        .and_then(|d| d.md5.clone())
        .or_else(|| image.metadata().hash.as_ref().and_then(|h| h.md5.clone()))
    else {
        bail!("image carries no MD5 to verify against");
    };

    let mut context = md5::Context::new();
    let total = image.sector_count();
    let batch = 2048_u64;
    let mut lba = 0_u64;
    while lba < total {
        let count = batch.min(total - lba);
        context.consume(image.read_sectors(lba, count)?);
        lba += count;
    }
    let computed = format!("{:x}", context.compute());

    if computed == stored {
        println!("md5 ok: {computed}");
        Ok(())
    } else {
        bail!("md5 mismatch: stored {stored}, computed {computed}")
    }
}
