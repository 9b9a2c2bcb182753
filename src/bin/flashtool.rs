//! Erase and/or write an image to a raw NAND MTD device, optionally generating the ECC in
//! software.
//!
//! Exit status: 0 on success, 2 when a bad block is hit with `--failbad`, 3 when the request
//! doesn't fit on the device, 1 for anything else.

use anyhow::Context;
use clap::{ArgGroup, Parser};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use flashtool::ecc::OobLayout;
use flashtool::flash::{flash, FlashOptions, FlashSummary};
#[cfg(target_os = "linux")]
use flashtool::nand::mtd::MtdNand;
use flashtool::nand::{NandLayout, SimNand};
use flashtool::util::parse_int;
use flashtool::{Error, Result};

#[derive(Parser, Debug)]
#[clap(version, about)]
#[clap(group(ArgGroup::new("action").required(true).multiple(true).args(["write", "erase"])))]
struct Cli {
    /// MTD device to flash (`/dev/mtdX`, or just `mtdX`); with --sim, the NAND image file
    device: String,

    /// Image to write
    #[clap(requires = "write")]
    image: Option<PathBuf>,

    /// Write the image
    #[clap(short, long, requires = "image")]
    write: bool,

    /// Erase each block first (or, without --write, only erase)
    #[clap(short, long)]
    erase: bool,

    /// Device offset to start at; must be page aligned
    #[clap(short, long, value_parser = parse_int)]
    start: u64,

    /// Bytes to write or erase [default: the image size]
    #[clap(short, long, value_parser = parse_int)]
    length: Option<u64>,

    /// Never touch the device at or above this offset
    #[clap(long, value_parser = parse_int)]
    maxoff: Option<u64>,

    /// Fail on the first bad block rather than skipping it
    #[clap(long)]
    failbad: bool,

    /// Generate ECC in software, interleaved with the data ("legacy" OOB layout)
    #[clap(long, conflicts_with = "dm365_rbl")]
    legacy: bool,

    /// Generate ECC in software, in the OOB layout the DM365 boot ROM reads
    #[clap(long)]
    dm365_rbl: bool,

    /// Leave trailing all-0xFF pages of each block unwritten, for UBI images
    #[clap(long)]
    ubi: bool,

    /// Only report warnings and errors
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Report every page written
    #[clap(short, long)]
    verbose: bool,

    /// Work on a simulated NAND of this layout (e.g. 1024x64x2048+64), kept in the DEVICE file
    #[clap(long)]
    sim: Option<NandLayout>,
}

impl Cli {
    fn oob_layout(&self) -> Option<OobLayout> {
        match (self.legacy, self.dm365_rbl) {
            (true, _) => Some(OobLayout::Legacy),
            (_, true) => Some(OobLayout::Dm365Rbl),
            _ => None,
        }
    }

    /// Open the image, and settle how many bytes the request covers
    fn open_image(&self) -> Result<(Option<BufReader<File>>, u64)> {
        let Some(path) = self.image.as_ref().filter(|_| self.write) else {
            let length = self
                .length
                .ok_or_else(|| Error::Config("--length is required when only erasing".into()))?;
            return Ok((None, length));
        };

        let file = File::open(path).with_context(|| path.display().to_string())?;
        let size = file.metadata()?.len();
        let length = self.length.unwrap_or(size);
        if length > size {
            return Err(Error::Config(format!(
                "length {length:#x} is more than the image size {size:#x}"
            )));
        }

        Ok((Some(BufReader::new(file)), length))
    }

    fn options(&self, length: u64) -> FlashOptions {
        FlashOptions {
            start: self.start,
            length,
            max_offset: self.maxoff,
            erase: self.erase,
            fail_bad: self.failbad,
            oob_layout: self.oob_layout(),
            skip_trailing_erased: self.ubi,
        }
    }
}

/// `mtdN` is shorthand for `/dev/mtdN`
fn device_path(device: &str) -> PathBuf {
    match device.strip_prefix("mtd") {
        Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            Path::new("/dev").join(device)
        }
        _ => PathBuf::from(device),
    }
}

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => Level::WARN,
        (_, true) => Level::DEBUG,
        _ => Level::INFO,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    if !cli.quiet {
        howudoin::init(howudoin::consumers::TermLine::default());
    }
}

/// Flash a simulated NAND, persisting it in `path` whatever the outcome
fn run_sim(
    layout: NandLayout,
    path: &Path,
    image: Option<BufReader<File>>,
    options: &FlashOptions,
) -> Result<FlashSummary> {
    let mut nand = SimNand::new(layout);
    if path.exists() {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        nand.load(&mut BufReader::new(file))?;
    }
    info!("Simulating {layout:?} NAND in {}", path.display());

    let result = flash(&mut nand, image, options);
    nand.save(&mut File::create(path)?)?;
    result
}

fn run(cli: &Cli) -> Result<FlashSummary> {
    let (image, length) = cli.open_image()?;
    let options = cli.options(length);

    if let Some(layout) = cli.sim {
        return run_sim(layout, Path::new(&cli.device), image, &options);
    }

    #[cfg(target_os = "linux")]
    {
        let mut nand = MtdNand::open(device_path(&cli.device))?;
        flash(&mut nand, image, &options)
    }

    #[cfg(not(target_os = "linux"))]
    Err(Error::Config(format!(
        "{}: MTD devices are only supported on Linux; try --sim",
        device_path(&cli.device).display()
    )))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.use_stderr() {
                true => ExitCode::FAILURE,
                false => ExitCode::SUCCESS,
            };
        }
    };
    init_logging(&cli);

    let result = run(&cli);
    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[test]
fn test_device_path() {
    assert_eq!(device_path("mtd3"), Path::new("/dev/mtd3"));
    assert_eq!(device_path("/dev/mtd3"), Path::new("/dev/mtd3"));
    assert_eq!(device_path("mtd"), Path::new("mtd"));
    assert_eq!(device_path("mtdblock1"), Path::new("mtdblock1"));
    assert_eq!(device_path("nand.img"), Path::new("nand.img"));
}

#[test]
fn test_cli() {
    let cli = Cli::try_parse_from(["flashtool", "-w", "-s", "0x20000", "mtd0", "uboot.bin"])
        .unwrap();
    assert_eq!(cli.start, 0x20000);
    assert_eq!(cli.oob_layout(), None);
    assert_eq!(cli.image.as_deref(), Some(Path::new("uboot.bin")));

    let cli = Cli::try_parse_from(["flashtool", "-e", "-s", "0", "-l", "04000", "mtd0"]).unwrap();
    assert_eq!(cli.length, Some(0x800));
    let options = cli.options(0x800);
    assert!(options.erase);
    assert_eq!(options.max_offset, None);

    let cli = Cli::try_parse_from([
        "flashtool", "-w", "-s", "0", "--dm365-rbl", "--ubi", "mtd0", "ubl.bin",
    ])
    .unwrap();
    assert_eq!(cli.oob_layout(), Some(OobLayout::Dm365Rbl));
    assert!(cli.options(0).skip_trailing_erased);

    // Neither write nor erase
    assert!(Cli::try_parse_from(["flashtool", "-s", "0", "mtd0"]).is_err());
    // Both ECC layouts
    assert!(Cli::try_parse_from([
        "flashtool", "-w", "-s", "0", "--legacy", "--dm365-rbl", "mtd0", "x"
    ])
    .is_err());
    // Writing without an image
    assert!(Cli::try_parse_from(["flashtool", "-w", "-s", "0", "mtd0"]).is_err());
    // Missing start offset
    assert!(Cli::try_parse_from(["flashtool", "-e", "-l", "1", "mtd0"]).is_err());
    // Bad numbers
    assert!(Cli::try_parse_from(["flashtool", "-e", "-s", "0x", "-l", "1", "mtd0"]).is_err());
}

#[test]
fn test_sim_round_trip() -> anyhow::Result<()> {
    use std::io::Write;

    let dir = tempfile::tempdir()?;
    let nand_path = dir.path().join("nand.bin");
    let image_path = dir.path().join("image.bin");
    File::create(&image_path)?.write_all(&[0x5A; 3000])?;

    let args = |extra: &[&str]| {
        let mut args = vec!["flashtool", "--sim", "8x4x2048+64", "-s", "0x2000"];
        args.extend_from_slice(extra);
        args.push(nand_path.to_str().unwrap());
        Cli::try_parse_from(args)
    };

    let cli = args(&["-w", "--legacy", image_path.to_str().unwrap()])?;
    assert_eq!(run(&cli)?.bytes_done, 3000);

    let mut nand = SimNand::new(cli.sim.unwrap());
    nand.load(&mut File::open(&nand_path)?)?;
    assert_eq!(nand.page_data(1, 0), &[0x5A; 2048][..]);
    assert_eq!(&nand.page_data(1, 1)[..952], &[0x5A; 952][..]);

    // The saved NAND is picked up again; writing again without erasing retires the block
    let cli = args(&["-w", image_path.to_str().unwrap()])?;
    assert_eq!(run(&cli)?.retired_blocks, 1);

    let cli = args(&["-w", "-l", "4000", image_path.to_str().unwrap()])?;
    assert_eq!(run(&cli).unwrap_err().exit_code(), 1);

    let cli = args(&["-e", "-l", "0x100000"])?;
    assert_eq!(run(&cli).unwrap_err().exit_code(), 3);
    Ok(())
}

#[test]
fn test_missing_image() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image_path = dir.path().join("missing.bin");

    let cli = Cli::try_parse_from([
        "flashtool",
        "--sim",
        "8x4x2048+64",
        "-w",
        "-s",
        "0",
        "nand.bin",
        image_path.to_str().unwrap(),
    ])?;

    let err = run(&cli).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(format!("{err:#}").contains("missing.bin"));
    Ok(())
}
