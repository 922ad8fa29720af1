//! Flash erase / write / verify.

use core::fmt::Debug;
use std::convert::TryFrom;
use std::io::Write as _;

use embedded_hal::blocking::delay::DelayMs;
use flate2::{write::ZlibEncoder, Compression};

use crate::chips::ChipDescriptor;
use crate::protocol::*;
use crate::{Connection, Error, SerialPort};

/// Image bytes destined for one flash offset
#[derive(Clone, PartialEq, Debug)]
pub struct FlashPart {
    pub data: Vec<u8>,
    pub offset: u32,
}

impl FlashPart {
    pub fn new(offset: u32, data: Vec<u8>) -> Self {
        Self { data, offset }
    }

    fn end(&self) -> Option<u32> {
        u32::try_from(self.data.len()).ok().and_then(|len| self.offset.checked_add(len))
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct FlashOptions {
    /// Send deflate compressed blocks
    pub compress: bool,
    /// Flash frequency written into the bootloader header, `None` keeps it
    pub flash_freq: Option<String>,
    /// Flash size written into the bootloader header, `None` keeps it and
    /// `"detect"` uses the size read from the flash ID
    pub flash_size: Option<String>,
}

/// Bytes sent so far for one part, counted as transmitted
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ProgressEvent {
    pub part: usize,
    pub written: usize,
    pub total: usize,
}

/// Flash size from a JEDEC ID (`manufacturer, type, capacity` LSB first)
pub fn size_from_id(id: u32) -> Option<u32> {
    let capacity = (id >> 16) & 0xFF;
    match capacity {
        0x12..=0x1A => Some(1 << capacity),
        _ => None,
    }
}

/// Smallest `sector` aligned `(offset, size)` covering `len` bytes at `offset`,
/// `None` when the span runs past the end of the address space
pub fn sector_span(offset: u32, len: u32, sector: u32) -> Option<(u32, u32)> {
    let start = offset - offset % sector;
    let end = offset.checked_add(len)?.checked_add(sector - 1)? / sector * sector;
    Some((start, end - start))
}

/// Header name for a flash size in bytes, as used in the chip's size table
fn size_name(bytes: u32) -> String {
    if bytes >= 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else {
        format!("{}KB", bytes / 1024)
    }
}

fn blocks(len: usize, block: usize) -> usize {
    (len + block - 1) / block
}

/// Device rejections of flash commands become flash operation failures
fn flash_op<T, E: Debug>(r: Result<T, Error<E>>) -> Result<T, Error<E>> {
    r.map_err(|e| match e {
        Error::Rejected { command, status } => {
            Error::FlashOp(format!("{:?} rejected by device (error 0x{:02x})", command, status))
        }
        e => e,
    })
}

/// Check parts against each other, the flash size and the memory map
pub fn validate<E: Debug>(chip: &ChipDescriptor, flash_size: Option<u32>, parts: &[FlashPart]) -> Result<(), Error<E>> {
    let mut spans = Vec::with_capacity(parts.len());

    for p in parts {
        if p.data.is_empty() {
            return Err(Error::Image(format!("part at 0x{:08x} is empty", p.offset)));
        }
        let end = p
            .end()
            .ok_or_else(|| Error::Image(format!("part at 0x{:08x} overflows the address space", p.offset)))?;

        if let Some(size) = flash_size {
            if end > size {
                return Err(Error::Image(format!(
                    "part at 0x{:08x} ends at 0x{:08x}, beyond the end of flash (0x{:08x})",
                    p.offset, end, size
                )));
            }
        }

        if let Some(r) = chip.non_writable_overlap(p.offset, end) {
            return Err(Error::Image(format!(
                "part at 0x{:08x} overlaps {:?} region 0x{:08x}..0x{:08x}",
                p.offset, r.kind, r.start, r.end
            )));
        }

        spans.push((p.offset, end));
    }

    spans.sort_unstable();
    for w in spans.windows(2) {
        if w[1].0 < w[0].1 {
            return Err(Error::Image(format!("parts at 0x{:08x} and 0x{:08x} overlap", w[0].0, w[1].0)));
        }
    }

    Ok(())
}

/// Rewrite the flash mode byte of a bootloader image with the requested
/// frequency and size.
///
/// `"keep"` for either value leaves it as it is, a flash size of `"detect"`
/// takes `detected` (the size read from the flash ID).
pub fn patch_header<E: Debug>(
    chip: &ChipDescriptor,
    offset: u32,
    image: &mut [u8],
    opts: &FlashOptions,
    detected: Option<u32>,
) -> Result<bool, Error<E>> {
    if offset != chip.bootloader_offset || image.len() < 4 || image[0] != IMAGE_MAGIC {
        return Ok(false);
    }

    let freq = opts.flash_freq.as_deref().filter(|f| *f != "keep");
    let size = match opts.flash_size.as_deref() {
        None | Some("keep") => None,
        Some("detect") => match detected {
            Some(bytes) => Some(size_name(bytes)),
            None => {
                warn!("Flash size was not detected, keeping the header value");
                None
            }
        },
        Some(s) => Some(s.to_string()),
    };
    if freq.is_none() && size.is_none() {
        return Ok(false);
    }

    let mut b = image[3];
    if let Some(f) = freq {
        let code = chip
            .flash_freq_code(f)
            .ok_or_else(|| Error::Image(format!("flash frequency {} not supported by {}", f, chip)))?;
        b = (b & 0xF0) | code;
    }
    if let Some(s) = size {
        let code = chip
            .flash_size_code(&s)
            .ok_or_else(|| Error::Image(format!("flash size {} not supported by {}", s, chip)))?;
        b = (b & 0x0F) | code;
    }

    if b == image[3] {
        return Ok(false);
    }

    debug!("Flash params set to 0x{:02x}", b);
    image[3] = b;

    if image.len() > 23 && image[23] == 1 {
        warn!("Image has an appended SHA256 digest which no longer matches the patched header");
    }
    Ok(true)
}

/// Erase the whole flash chip
pub fn erase_all<P, D, E>(conn: &mut Connection<'_, P, D, E>) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    info!("Erasing flash (this may take a while)...");
    flash_op(conn.execute_once(Command::EraseFlash, &[], CHIP_ERASE_TIMEOUT_MS))?;
    info!("Chip erase completed");
    Ok(())
}

fn begin_payload(chip: &ChipDescriptor, stub: bool, size: u32, blocks: u32, block_size: u32, offset: u32) -> Vec<u8> {
    let mut p = words(&[size, blocks, block_size, offset]);
    if !stub && chip.encrypted_flash_begin {
        p.extend_from_slice(&0u32.to_le_bytes());
    }
    p
}

/// Check an erase region is sector aligned and inside the flash
pub fn check_region<E: Debug>(flash_size: Option<u32>, offset: u32, size: u32) -> Result<u32, Error<E>> {
    if offset % FLASH_SECTOR_SIZE != 0 || size % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::Image(format!(
            "erase region 0x{:08x}+0x{:x} is not aligned to 0x{:x} byte sectors",
            offset, size, FLASH_SECTOR_SIZE
        )));
    }
    let end = offset
        .checked_add(size)
        .ok_or_else(|| Error::Image(format!("erase region 0x{:08x}+0x{:x} overflows the address space", offset, size)))?;

    if let Some(flash) = flash_size {
        if end > flash {
            return Err(Error::Image(format!(
                "erase region 0x{:08x}..0x{:08x} is beyond the end of flash (0x{:08x})",
                offset, end, flash
            )));
        }
    }
    Ok(end)
}

/// Erase a sector aligned region
pub fn erase_region<P, D, E>(
    conn: &mut Connection<'_, P, D, E>,
    chip: &ChipDescriptor,
    flash_size: Option<u32>,
    offset: u32,
    size: u32,
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    let end = check_region(flash_size, offset, size)?;
    if size == 0 {
        return Ok(());
    }

    info!("Erasing region 0x{:08x}..0x{:08x}", offset, end);
    let timeout = timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB_MS, size);

    if conn.is_stub() {
        flash_op(conn.execute_once(Command::EraseRegion, &words(&[offset, size]), timeout))?;
    } else {
        // The ROM erases the whole span when a download begins
        let ws = ROM_FLASH_WRITE_SIZE as u32;
        let payload = begin_payload(chip, false, size, (size + ws - 1) / ws, ws, offset);
        flash_op(conn.execute_once(Command::FlashBegin, &payload, timeout))?;
    }
    Ok(())
}

/// Emits progress, dropping repeats of the last event
struct Progress<'a> {
    sink: &'a mut dyn FnMut(ProgressEvent),
    last: Option<ProgressEvent>,
}

impl<'a> Progress<'a> {
    fn report(&mut self, part: usize, written: usize, total: usize) {
        let ev = ProgressEvent { part, written, total };
        if self.last != Some(ev) {
            self.last = Some(ev);
            (self.sink)(ev);
        }
    }
}

fn write_raw<P, D, E>(
    conn: &mut Connection<'_, P, D, E>,
    chip: &ChipDescriptor,
    index: usize,
    offset: u32,
    image: &[u8],
    progress: &mut Progress<'_>,
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    let stub = conn.is_stub();
    let ws = if stub { STUB_FLASH_WRITE_SIZE } else { ROM_FLASH_WRITE_SIZE };
    let count = blocks(image.len(), ws);

    let payload = begin_payload(chip, stub, image.len() as u32, count as u32, ws as u32, offset);
    let timeout = timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB_MS, image.len() as u32);
    flash_op(conn.execute(Command::FlashBegin, &payload, timeout))?;

    let mut written = 0;
    for (seq, chunk) in image.chunks(ws).enumerate() {
        let mut payload = data_header(ws, seq as u32);
        payload.extend_from_slice(chunk);
        payload.resize(16 + ws, 0xFF);

        flash_op(conn.execute(Command::FlashData, &payload, DEFAULT_TIMEOUT_MS))?;

        written += chunk.len();
        progress.report(index, written, image.len());
    }

    Ok(())
}

fn write_compressed<P, D, E>(
    conn: &mut Connection<'_, P, D, E>,
    chip: &ChipDescriptor,
    index: usize,
    offset: u32,
    image: &[u8],
    progress: &mut Progress<'_>,
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
    enc.write_all(image)
        .map_err(|e| Error::Image(format!("compression failed: {}", e)))?;
    let compressed = enc
        .finish()
        .map_err(|e| Error::Image(format!("compression failed: {}", e)))?;

    let stub = conn.is_stub();
    let ws = if stub { STUB_FLASH_WRITE_SIZE } else { ROM_FLASH_WRITE_SIZE };
    let count = blocks(compressed.len(), ws);

    // The ROM wants the erase size in whole blocks, the stub the image size
    let size = (if stub { image.len() } else { blocks(image.len(), ws) * ws }) as u32;

    debug!(
        "Compressed {} bytes to {} ({:.1}%)",
        image.len(),
        compressed.len(),
        100.0 * compressed.len() as f64 / image.len() as f64
    );

    let payload = begin_payload(chip, stub, size, count as u32, ws as u32, offset);
    let timeout = timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB_MS, size);
    flash_op(conn.execute(Command::FlashDeflBegin, &payload, timeout))?;

    let mut written = 0;
    for (seq, chunk) in compressed.chunks(ws).enumerate() {
        let mut payload = data_header(chunk.len(), seq as u32);
        payload.extend_from_slice(chunk);

        flash_op(conn.execute(Command::FlashDeflData, &payload, DEFAULT_TIMEOUT_MS))?;

        written += chunk.len();
        progress.report(index, written, compressed.len());
    }

    Ok(())
}

/// Write `parts`, then check each against the device's MD5.
///
/// Nothing is rewritten on a verify mismatch.
pub fn write<P, D, E>(
    conn: &mut Connection<'_, P, D, E>,
    chip: &ChipDescriptor,
    flash_size: Option<u32>,
    parts: &[FlashPart],
    opts: &FlashOptions,
    progress: &mut dyn FnMut(ProgressEvent),
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    validate(chip, flash_size, parts)?;

    let mut progress = Progress { sink: progress, last: None };
    let mut digests = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        let mut image = part.data.clone();
        patch_header(chip, part.offset, &mut image, opts, flash_size)?;

        info!("Writing {} bytes at 0x{:08x}...", image.len(), part.offset);
        if opts.compress {
            write_compressed(conn, chip, i, part.offset, &image, &mut progress)?;
        } else {
            write_raw(conn, chip, i, part.offset, &image, &mut progress)?;
        }

        if conn.is_stub() {
            // Stub acks the last block before it is committed, a read waits it out
            conn.read_reg(CHIP_DETECT_MAGIC_REG)?;
        }

        digests.push((part.offset, image.len() as u32, md5::compute(&image).0));
    }

    for (offset, len, expected) in digests {
        let actual = conn.flash_md5(offset, len)?;
        if actual != expected {
            return Err(Error::Verify {
                address: offset,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        info!("Hash of data at 0x{:08x} verified", offset);
    }

    if conn.is_stub() {
        // Leave the stub in the loader, the session resets the chip itself
        let ws = STUB_FLASH_WRITE_SIZE as u32;
        let (begin, end) = if opts.compress {
            (Command::FlashDeflBegin, Command::FlashDeflEnd)
        } else {
            (Command::FlashBegin, Command::FlashEnd)
        };
        flash_op(conn.execute(begin, &begin_payload(chip, true, 0, 0, ws, 0), DEFAULT_TIMEOUT_MS))?;
        flash_op(conn.execute(end, &words(&[1]), DEFAULT_TIMEOUT_MS))?;
    }

    Ok(())
}
