#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use rfs_alloc::{AllocOptions, Allocator, Geometry, MemQuota, write_fresh_bitmaps};
use rfs_block::{BlockDevice, FileBlockDevice};
use rfs_journal::MemJournal;
use rfs_types::{BitmapIndex, BlockSize, parse_auto_radix_u64};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct BitmapSummary {
    index: u32,
    location: u64,
    free: u32,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    block_count: u64,
    bitmap_count: u32,
    free_blocks: u64,
    options: String,
    bitmaps: Vec<BitmapSummary>,
}

fn main() {
    if let Err(error) = run(&env::args().skip(1).collect::<Vec<_>>()) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Flags shared by the subcommands.
#[derive(Debug, Default)]
struct Flags {
    image: Option<PathBuf>,
    block_size: Option<u32>,
    blocks: Option<u64>,
    options: Option<String>,
    json: bool,
}

fn parse_flags(args: &[String]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--block-size" => {
                let raw = value("--block-size")?;
                let size = parse_auto_radix_u64("block_size", &raw)?;
                flags.block_size =
                    Some(u32::try_from(size).context("block size does not fit in u32")?);
            }
            "--blocks" => {
                let raw = value("--blocks")?;
                flags.blocks = Some(parse_auto_radix_u64("blocks", &raw)?);
            }
            "--options" => flags.options = Some(value("--options")?),
            "--json" => flags.json = true,
            other if other.starts_with("--") => bail!("unknown flag: {other}"),
            path => {
                if flags.image.replace(PathBuf::from(path)).is_some() {
                    bail!("more than one image path given");
                }
            }
        }
    }
    Ok(flags)
}

fn run(args: &[String]) -> Result<()> {
    let Some((command, rest)) = args.split_first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "format" => {
            let flags = parse_flags(rest)?;
            let image = flags.image.context("format requires an image path")?;
            let block_size = flags.block_size.context("format requires --block-size")?;
            let blocks = flags.blocks.context("format requires --blocks")?;
            let geometry = format(&image, block_size, blocks)?;
            println!(
                "formatted {}: {} blocks of {} bytes, {} bitmaps",
                image.display(),
                geometry.block_count(),
                block_size,
                geometry.bitmap_count()
            );
            Ok(())
        }
        "inspect" => {
            let flags = parse_flags(rest)?;
            let image = flags.image.context("inspect requires an image path")?;
            let block_size = flags.block_size.context("inspect requires --block-size")?;
            let output = inspect(&image, block_size, flags.options.as_deref())?;
            if flags.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&output).context("serialize output")?
                );
            } else {
                print_inspect(&output);
            }
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("rfs-cli\n");
    println!("USAGE:");
    println!("  rfs-cli format <image-path> --block-size <bytes> --blocks <count>");
    println!("  rfs-cli inspect <image-path> --block-size <bytes> [--options <alloc-opts>] [--json]");
}

fn geometry(block_size: u32, blocks: u64) -> Result<Geometry> {
    let block_size = BlockSize::new(block_size)?;
    Ok(Geometry::new(block_size, blocks)?)
}

fn format(image: &Path, block_size: u32, blocks: u64) -> Result<Geometry> {
    let geometry = geometry(block_size, blocks)?;
    let device = FileBlockDevice::create(image, block_size, blocks)
        .with_context(|| format!("failed to create image {}", image.display()))?;
    write_fresh_bitmaps(&device, &geometry)?;
    Ok(geometry)
}

fn inspect(image: &Path, block_size: u32, options: Option<&str>) -> Result<InspectOutput> {
    let device = FileBlockDevice::open(image, block_size)
        .with_context(|| format!("failed to open image {}", image.display()))?;
    let geometry = geometry(block_size, device.block_count())?;
    let options = AllocOptions::parse(options.unwrap_or_default())?;
    let journal = Arc::new(MemJournal::new(geometry.bits_per_bitmap()));
    let alloc = Allocator::mount(&device, geometry, options, journal, Arc::new(MemQuota::new()))
        .with_context(|| format!("failed to load bitmaps from {}", image.display()))?;
    alloc.check_consistency()?;

    let bitmaps = (0_u32..)
        .zip(alloc.bitmap_free_counts())
        .map(|(index, free)| BitmapSummary {
            index,
            location: geometry.bitmap_location(BitmapIndex(index)).0,
            free,
        })
        .collect();
    Ok(InspectOutput {
        block_size,
        block_count: geometry.block_count(),
        bitmap_count: geometry.bitmap_count(),
        free_blocks: alloc.free_blocks(),
        options: alloc.options().to_string(),
        bitmaps,
    })
}

fn print_inspect(output: &InspectOutput) {
    println!("rfs bitmap inspector");
    println!("block_size: {}", output.block_size);
    println!("block_count: {}", output.block_count);
    println!("bitmap_count: {}", output.bitmap_count);
    println!("free_blocks: {}", output.free_blocks);
    println!("options: {}", output.options);
    for bitmap in &output.bitmaps {
        println!(
            "  bitmap {:>4} @ {:>10}: {} free",
            bitmap.index, bitmap.location, bitmap.free
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn format_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fs.img");
        let geometry = format(&image, 512, 10_000).unwrap();
        assert_eq!(geometry.bitmap_count(), 3);

        let output = inspect(&image, 512, None).unwrap();
        assert_eq!(output.block_count, 10_000);
        assert_eq!(output.free_blocks, 10_000 - 4);
        let free: Vec<u32> = output.bitmaps.iter().map(|b| b.free).collect();
        assert_eq!(free, vec![4094, 4095, 1807]);
        assert_eq!(output.bitmaps[1].location, 4096);

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["bitmaps"][2]["free"], 1807);
        assert_eq!(
            json["options"],
            "dirid_groups:packing_groups:skip_busy:preallocmin=0:preallocsize=17"
        );
    }

    #[test]
    fn inspect_with_wrong_block_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fs.img");
        format(&image, 1024, 2048).unwrap();
        // A 2 MiB image read as 4 KiB blocks: bitmap 0 is not where it should be.
        assert!(inspect(&image, 4096, None).is_err());
    }

    #[test]
    fn flags_parse_hex_and_reject_unknown() {
        let flags = parse_flags(&args(&["img", "--block-size", "0x1000", "--json"])).unwrap();
        assert_eq!(flags.block_size, Some(4096));
        assert!(flags.json);
        assert_eq!(flags.image, Some(PathBuf::from("img")));
        assert!(parse_flags(&args(&["--bogus"])).is_err());
        assert!(parse_flags(&args(&["--blocks"])).is_err());
        assert!(parse_flags(&args(&["a", "b"])).is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(run(&args(&["frobnicate"])).is_err());
        assert!(run(&[]).is_ok());
    }
}
