use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use esp_uart_loader::{FlashOptions, FlashPart, Manifest, Options, Programmer, ProgressEvent, StubImage};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate used to talk to the ROM loader
    #[structopt(long, default_value = "115200")]
    baud: u32,

    /// Baud rate to switch to once connected
    #[structopt(long)]
    flash_baud: Option<u32>,

    /// Stub description (esptool `stub_flasher_*.json`) to run before other commands
    #[structopt(long)]
    stub: Option<PathBuf>,

    #[structopt(subcommand)]
    operation: Operation,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Identify the chip and flash
    Info,

    /// Read a device register
    ReadReg {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
    },

    /// Erase the whole flash (needs the stub)
    EraseFlash,

    /// Erase a sector aligned flash region
    EraseRegion {
        #[structopt(parse(try_from_str = parse_u32))]
        offset: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
    },

    /// Write firmware parts
    Write {
        /// Firmware manifest listing parts per chip
        #[structopt(long, conflicts_with = "parts")]
        manifest: Option<PathBuf>,

        /// Parts as `file@offset`
        #[structopt(parse(try_from_str = parse_part))]
        parts: Vec<PartArg>,

        /// Erase the whole flash first
        #[structopt(long)]
        erase_all: bool,

        /// Send deflate compressed blocks
        #[structopt(long)]
        compress: bool,

        /// Flash frequency to write into the bootloader header, `keep` leaves it
        #[structopt(long)]
        flash_freq: Option<String>,

        /// Flash size to write into the bootloader header, `detect` uses the size read from the chip
        #[structopt(long)]
        flash_size: Option<String>,
    },

    /// Print output from the running application
    Monitor,
}

#[derive(Clone, Debug)]
pub struct PartArg {
    path: PathBuf,
    offset: u32,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_part(s: &str) -> Result<PartArg, String> {
    let (path, offset) = s.rsplit_once('@').ok_or_else(|| format!("expected file@offset, got {}", s))?;
    let offset = parse_u32(offset).map_err(|e| format!("invalid offset {}: {}", offset, e))?;
    Ok(PartArg { path: PathBuf::from(path), offset })
}

fn load_parts(chip: &str, manifest: &Option<PathBuf>, parts: &[PartArg]) -> anyhow::Result<Vec<FlashPart>> {
    if let Some(path) = manifest {
        let s = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let m = Manifest::from_json(&s)?;
        let build = m.build_for(chip).ok_or_else(|| anyhow!("manifest has no builds"))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        return Ok(build.load(base)?);
    }

    parts
        .iter()
        .map(|p| {
            let data = fs::read(&p.path).with_context(|| format!("reading {}", p.path.display()))?;
            Ok(FlashPart::new(p.offset, data))
        })
        .collect()
}

/// One bar per part, replaced when the part index moves on
struct Bars {
    current: Option<(usize, ProgressBar)>,
}

impl Bars {
    fn update(&mut self, ev: ProgressEvent) {
        let fresh = match &self.current {
            Some((part, _)) => *part != ev.part,
            None => true,
        };

        if fresh {
            if let Some((_, bar)) = self.current.take() {
                bar.finish();
            }
            let bar = ProgressBar::new(ev.total as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40}] {bytes}/{total_bytes}")
                    .progress_chars("=> "),
            );
            bar.set_message(&format!("part {}", ev.part));
            self.current = Some((ev.part, bar));
        }

        if let Some((_, bar)) = &self.current {
            bar.set_position(ev.written as u64);
        }
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }
}

fn run<P, D, E>(p: &mut Programmer<P, D, E>, op: &Operation) -> anyhow::Result<()>
where
    P: esp_uart_loader::SerialPort<E>,
    D: embedded_hal::blocking::delay::DelayMs<u32>,
    E: core::fmt::Debug + Send + Sync + 'static,
{
    let chip = *p.chip().ok_or_else(|| anyhow!("not connected"))?;

    match op {
        Operation::Info => {
            info!("Chip: {} ({})", chip, chip.features.join(", "));
            match p.flash_size()? {
                Some(s) => info!("Flash size: {}", bytefmt::format(s as u64)),
                None => warn!("Flash size unknown"),
            }

            let (blocks, key_valid) = p.key_info()?;
            for b in &blocks {
                info!("Key block {}: {}", b.block, b.name.unwrap_or("unknown purpose"));
            }
            if !blocks.is_empty() {
                info!("Flash encryption key: {}", if key_valid { "present" } else { "not present" });
            }
        }
        Operation::ReadReg { addr } => {
            let v = p.read_reg(*addr)?;
            println!("0x{:08x}: 0x{:08x}", addr, v);
        }
        Operation::EraseFlash => p.erase_flash()?,
        Operation::EraseRegion { offset, size } => p.erase_region(*offset, *size)?,
        Operation::Write { manifest, parts, erase_all, compress, flash_freq, flash_size } => {
            let parts = load_parts(chip.name, manifest, parts)?;
            if parts.is_empty() {
                return Err(anyhow!("nothing to write"));
            }

            for (i, part) in parts.iter().enumerate() {
                info!(
                    "Part {}: {} at 0x{:08x}, md5 {}",
                    i,
                    bytefmt::format(part.data.len() as u64),
                    part.offset,
                    hex::encode(md5::compute(&part.data).0)
                );
            }

            if *erase_all {
                p.erase_flash()?;
            }

            let opts = FlashOptions {
                compress: *compress,
                flash_freq: flash_freq.clone(),
                flash_size: flash_size.clone(),
            };

            let mut bars = Bars { current: None };
            let r = p.write_flash(&parts, &opts, |ev| bars.update(ev));
            bars.finish();
            r?;

            info!("Write complete");
        }
        Operation::Monitor => (),
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Opening serial port {}", o.port);
    let mut p = Programmer::linux(&o.port, o.options.clone())
        .map_err(|e| anyhow!("Error opening serial port {}: {:?}", o.port, e))?;

    if let Operation::Monitor = o.operation {
        let _handle = p.monitor().spawn(Duration::from_millis(10), |b| {
            let mut out = std::io::stdout();
            let _ = out.write_all(b);
            let _ = out.flush();
        });
        info!("Monitoring at {} baud, interrupt to exit", o.options.monitor_baud);
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }

    info!("Connecting to bootloader");
    let chip = p.connect(o.baud)?;
    info!("Connected to {}", chip);

    let r = (|| -> anyhow::Result<()> {
        if let Some(path) = &o.stub {
            let s = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            p.load_stub(&StubImage::from_json(&s)?)?;
        }
        if let Some(baud) = o.flash_baud {
            p.change_baud(baud)?;
        }
        run(&mut p, &o.operation)
    })();

    if let Err(e) = &r {
        error!("{}", e);
    }

    // Already reset if the failure ended the session
    if p.state() != esp_uart_loader::State::Disconnected {
        p.disconnect()?;
    }

    r
}
