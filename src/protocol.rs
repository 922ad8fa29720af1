//! ESP serial bootloader protocol constants.
//!
//! Shared by the ROM loader and the RAM stub, see the esptool serial
//! protocol documentation.

/// Direction byte of a host request
pub const DIR_REQUEST: u8 = 0x00;
/// Direction byte of a device response
pub const DIR_RESPONSE: u8 = 0x01;

/// Seed for the data checksum
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Register holding the chip detection magic value
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

/// Greeting frame sent by the stub once it is running
pub const STUB_GREETING: &[u8] = b"OHAI";

/// Status trailer length with the ROM loader
pub const ROM_STATUS_LEN: usize = 4;
/// Status trailer length with the stub
pub const STUB_STATUS_LEN: usize = 2;

/// Maximum block size for RAM uploads
pub const RAM_BLOCK_SIZE: usize = 0x1800;
/// Flash block size with the ROM loader
pub const ROM_FLASH_WRITE_SIZE: usize = 0x400;
/// Flash block size with the stub
pub const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Flash sector size, the erase granularity
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

/// Default per-command timeout
pub const DEFAULT_TIMEOUT_MS: u32 = 3_000;
/// Timeout for a whole-chip erase
pub const CHIP_ERASE_TIMEOUT_MS: u32 = 120_000;
/// Region erase timeout per MiB
pub const ERASE_REGION_TIMEOUT_PER_MB_MS: u32 = 30_000;
/// MD5 timeout per MiB
pub const MD5_TIMEOUT_PER_MB_MS: u32 = 8_000;
/// Timeout while waiting for the stub greeting
pub const STUB_GREETING_TIMEOUT_MS: u32 = 1_000;

/// First image byte of an application or bootloader image
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Sync payload: `07 07 12 20` followed by 32 `0x55` bytes
pub fn sync_payload() -> [u8; 36] {
    let mut p = [0x55u8; 36];
    p[..4].copy_from_slice(&[0x07, 0x07, 0x12, 0x20]);
    p
}

/// Scale a per-MiB timeout by `size`, never going below the default
pub fn timeout_per_mb(per_mb_ms: u32, size: u32) -> u32 {
    let t = (per_mb_ms as u64 * size as u64 / 1_000_000) as u32;
    t.max(DEFAULT_TIMEOUT_MS)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Begin flash download, erasing the target region
    FlashBegin = 0x02,

    /// Flash download data block
    FlashData = 0x03,

    /// Finish flash download
    FlashEnd = 0x04,

    /// Begin RAM download
    MemBegin = 0x05,

    /// Finish RAM download, optionally jumping to an entry point
    MemEnd = 0x06,

    /// RAM download data block
    MemData = 0x07,

    /// Synchronise with the loader
    Sync = 0x08,

    /// Write a 32-bit register
    WriteReg = 0x09,

    /// Read a 32-bit register
    ReadReg = 0x0A,

    /// Configure SPI flash geometry
    SpiSetParams = 0x0B,

    /// Attach the SPI flash
    SpiAttach = 0x0D,

    /// Switch the UART baud rate
    ChangeBaudrate = 0x0F,

    /// Begin compressed flash download
    FlashDeflBegin = 0x10,

    /// Compressed flash data block
    FlashDeflData = 0x11,

    /// Finish compressed flash download
    FlashDeflEnd = 0x12,

    /// Compute the MD5 of a flash region
    SpiFlashMd5 = 0x13,

    /// Erase the whole flash (stub only)
    EraseFlash = 0xD0,

    /// Erase a flash region (stub only)
    EraseRegion = 0xD1,
}

impl Command {
    /// Data commands carry a checksummed payload after a 16 byte header
    pub fn is_data(&self) -> bool {
        matches!(self, Command::FlashData | Command::MemData | Command::FlashDeflData)
    }

    /// Commands only meaningful while talking to the ROM loader
    pub fn rom_only(&self) -> bool {
        matches!(self, Command::MemBegin | Command::MemData | Command::MemEnd)
    }

    /// Commands the ROM loader does not implement
    pub fn stub_only(&self) -> bool {
        matches!(self, Command::EraseFlash | Command::EraseRegion)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        use Command::*;
        let c = match v {
            0x02 => FlashBegin,
            0x03 => FlashData,
            0x04 => FlashEnd,
            0x05 => MemBegin,
            0x06 => MemEnd,
            0x07 => MemData,
            0x08 => Sync,
            0x09 => WriteReg,
            0x0A => ReadReg,
            0x0B => SpiSetParams,
            0x0D => SpiAttach,
            0x0F => ChangeBaudrate,
            0x10 => FlashDeflBegin,
            0x11 => FlashDeflData,
            0x12 => FlashDeflEnd,
            0x13 => SpiFlashMd5,
            0xD0 => EraseFlash,
            0xD1 => EraseRegion,
            _ => return None,
        };
        Some(c)
    }
}

/// Build the 16 byte header preceding a data block
pub fn data_header(len: usize, seq: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(16);
    h.extend_from_slice(&(len as u32).to_le_bytes());
    h.extend_from_slice(&seq.to_le_bytes());
    h.extend_from_slice(&[0u8; 8]);
    h
}

/// Pack a list of little-endian words
pub fn words(w: &[u32]) -> Vec<u8> {
    w.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
}
