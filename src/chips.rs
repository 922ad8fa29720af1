//! Chip descriptor registry.
//!
//! Every supported family is a `const` [`ChipDescriptor`]. Families that only
//! differ from another in a handful of fields are built with struct update
//! syntax from that base, so `ESP32C5` reads as "ESP32-C6 except for ...".

use core::fmt;

/// Read / write access to 32-bit device registers
pub trait RegisterAccess {
    type Error;

    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error>;

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Padding,
    Drom,
    Irom,
    Dram,
    Iram,
    ByteAccessible,
    DromMask,
    IromMask,
    RtcIram,
    RtcDram,
    RtcData,
    ExtramData,
    MemInternal,
    MemInternal2,
    CachePro,
    CacheApp,
    DiramDram,
    DiramIram,
}

impl RegionKind {
    /// Mask ROM can never be the target of a download
    pub fn is_writable(&self) -> bool {
        !matches!(self, RegionKind::IromMask | RegionKind::DromMask)
    }
}

/// One `[start, end)` memory map entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u32,
    pub end: u32,
    pub kind: RegionKind,
}

const fn region(start: u32, end: u32, kind: RegionKind) -> MemoryRegion {
    MemoryRegion { start, end, kind }
}

impl MemoryRegion {
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        start < self.end && self.start < end
    }
}

/// SPI controller registers used for user commands (flash ID)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiRegisters {
    pub base: u32,
    pub usr: u32,
    pub usr2: u32,
    pub w0: u32,
    pub mosi_dlen: u32,
    pub miso_dlen: u32,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }
}

/// How the crystal frequency is worked out
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XtalDetect {
    /// Only one crystal is supported
    Fixed(u32),
    /// Derived from the UART clock divider the ROM programmed at boot.
    /// `steps` are `(threshold_mhz, freq_mhz)` pairs checked in order.
    UartDivider {
        divider: u32,
        steps: &'static [(u32, u32)],
        fallback: u32,
    },
}

/// Field holding the crystal frequency the ROM was configured for
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RomCrystal {
    pub reg: u32,
    pub mask: u32,
    pub shift: u32,
}

/// Core reset used on USB-JTAG-serial links where RTS cannot reset the chip
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchdogReset {
    Unsupported,
    Rtc { wprotect: u32, config0: u32, config1: u32 },
    /// Known to be needed but the register sequence is not documented yet
    Placeholder,
}

/// `(efuse offset, shift)` of each key block purpose field
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyPurposeLayout {
    pub fields: &'static [(u32, u32)],
    pub mask: u32,
    pub names: &'static [(u8, &'static str)],
    pub xts_aes_128: u8,
    /// `(efuse offset, shift, value)` forcing the key manager's XTS key
    pub key_manager: Option<(u32, u32, u32)>,
}

/// Purpose burned into one eFuse key block
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyBlock {
    pub block: usize,
    pub purpose: u8,
    pub name: Option<&'static str>,
}

/// Package / revision fields in efuse block 1
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RevisionLayout {
    pub offset: u32,
    pub pkg: (u32, u32),
    pub major: (u32, u32),
    pub minor: (u32, u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChipDescriptor {
    pub name: &'static str,
    pub magic_values: &'static [u32],
    pub image_chip_id: u16,
    pub bootloader_offset: u32,

    pub efuse_base: u32,
    pub uart_clkdiv_reg: u32,
    pub rom_crystal: Option<RomCrystal>,
    pub spi: SpiRegisters,

    pub memory_map: &'static [MemoryRegion],
    pub flash_freq: &'static [(&'static str, u8)],
    pub flash_sizes: &'static [(&'static str, u8)],
    pub key_purposes: Option<KeyPurposeLayout>,
    pub revision: Option<RevisionLayout>,
    pub features: &'static [&'static str],

    pub xtal: XtalDetect,
    /// `(UARTDEV_BUF_NO address, value when USB-JTAG-serial is in use)`
    pub usb_jtag_serial: Option<(u32, u32)>,
    pub watchdog: WatchdogReset,
    /// ROM FLASH_BEGIN takes a fifth "encrypted" word
    pub encrypted_flash_begin: bool,
}

pub const UART_CLKDIV_MASK: u32 = 0xFFFFF;
pub const WDT_WKEY: u32 = 0x50D8_3AA1;

const WDT_CONFIG0_FLAGS: u32 = (1 << 31) | (5 << 28) | (1 << 8) | (1 << 2);

impl ChipDescriptor {
    pub fn accepts(&self, magic: u32) -> bool {
        self.magic_values.contains(&magic)
    }

    pub fn flash_freq_code(&self, freq: &str) -> Option<u8> {
        self.flash_freq.iter().find(|(n, _)| *n == freq).map(|(_, c)| *c)
    }

    pub fn flash_size_code(&self, size: &str) -> Option<u8> {
        self.flash_sizes.iter().find(|(n, _)| *n == size).map(|(_, c)| *c)
    }

    /// First non-writable region intersecting `[start, end)`
    pub fn non_writable_overlap(&self, start: u32, end: u32) -> Option<&MemoryRegion> {
        self.memory_map
            .iter()
            .find(|r| !r.kind.is_writable() && r.overlaps(start, end))
    }

    /// Crystal frequency in MHz, warning when the measured value is off
    pub fn crystal_freq<R: RegisterAccess>(&self, regs: &mut R, baud: u32) -> Result<u32, R::Error> {
        let (divider, steps, fallback) = match self.xtal {
            XtalDetect::Fixed(f) => return Ok(f),
            XtalDetect::UartDivider { divider, steps, fallback } => (divider, steps, fallback),
        };

        let uart_div = regs.read_reg(self.uart_clkdiv_reg)? & UART_CLKDIV_MASK;
        let ets_xtal = baud as f64 * uart_div as f64 / 1_000_000.0 / divider as f64;

        let norm = steps
            .iter()
            .find(|(threshold, _)| ets_xtal > *threshold as f64)
            .map(|(_, f)| *f)
            .unwrap_or(fallback);

        if (norm as f64 - ets_xtal).abs() > 1.0 {
            warn!("Unsupported crystal in use ({:.1} MHz measured)", ets_xtal);
        }

        Ok(norm)
    }

    /// Crystal frequency the ROM code expects, on chips that record it
    pub fn rom_expected_crystal_freq<R: RegisterAccess>(
        &self,
        regs: &mut R,
    ) -> Result<Option<u32>, R::Error> {
        match self.rom_crystal {
            Some(c) => Ok(Some((regs.read_reg(c.reg)? & c.mask) >> c.shift)),
            None => Ok(None),
        }
    }

    /// Check whether the ROM is talking over the built-in USB-JTAG-serial
    pub fn uses_usb_jtag_serial<R: RegisterAccess>(&self, regs: &mut R) -> Result<bool, R::Error> {
        match self.usb_jtag_serial {
            Some((addr, value)) => Ok(regs.read_reg(addr)? & 0xFF == value),
            None => Ok(false),
        }
    }

    /// Arm the RTC watchdog to reset the core.
    ///
    /// Returns `false` if this chip has no usable watchdog reset, the caller
    /// should fall back to toggling the control lines.
    pub fn watchdog_reset<R: RegisterAccess>(&self, regs: &mut R) -> Result<bool, R::Error> {
        match self.watchdog {
            WatchdogReset::Rtc { wprotect, config0, config1 } => {
                info!("Hard resetting with a watchdog...");
                regs.write_reg(wprotect, WDT_WKEY)?;
                regs.write_reg(config1, 2000)?;
                regs.write_reg(config0, WDT_CONFIG0_FLAGS)?;
                regs.write_reg(wprotect, 0)?;
                Ok(true)
            }
            WatchdogReset::Placeholder => {
                info!("Hard resetting with a watchdog...");
                warn!("Watchdog reset is not implemented for {}, continuing", self.name);
                Ok(false)
            }
            WatchdogReset::Unsupported => Ok(false),
        }
    }

    /// Purpose of a key block, `None` when the block number is out of range
    pub fn key_block_purpose<R: RegisterAccess>(
        &self,
        regs: &mut R,
        block: usize,
    ) -> Result<Option<u8>, R::Error> {
        let layout = match &self.key_purposes {
            Some(l) => l,
            None => return Ok(None),
        };
        let (offset, shift) = match layout.fields.get(block) {
            Some(f) => *f,
            None => return Ok(None),
        };
        let v = regs.read_reg(self.efuse_base + offset)?;
        Ok(Some(((v >> shift) & layout.mask) as u8))
    }

    pub fn key_purpose_name(&self, purpose: u8) -> Option<&'static str> {
        self.key_purposes
            .as_ref()?
            .names
            .iter()
            .find(|(p, _)| *p == purpose)
            .map(|(_, n)| *n)
    }

    /// Purposes of every key block, empty for chips without key blocks
    pub fn key_blocks<R: RegisterAccess>(&self, regs: &mut R) -> Result<Vec<KeyBlock>, R::Error> {
        let count = self.key_purposes.map_or(0, |l| l.fields.len());
        let mut blocks = Vec::with_capacity(count);
        for block in 0..count {
            if let Some(purpose) = self.key_block_purpose(regs, block)? {
                blocks.push(KeyBlock { block, purpose, name: self.key_purpose_name(purpose) });
            }
        }
        Ok(blocks)
    }

    /// An XTS-AES-128 key is burned, or the key manager is forced to provide one
    pub fn is_flash_encryption_key_valid<R: RegisterAccess>(
        &self,
        regs: &mut R,
    ) -> Result<bool, R::Error> {
        let layout = match self.key_purposes {
            Some(l) => l,
            None => return Ok(false),
        };

        for block in 0..layout.fields.len() {
            if self.key_block_purpose(regs, block)? == Some(layout.xts_aes_128) {
                return Ok(true);
            }
        }

        match layout.key_manager {
            Some((offset, shift, value)) => {
                let v = regs.read_reg(self.efuse_base + offset)?;
                Ok((v >> shift) & value != 0)
            }
            None => Ok(false),
        }
    }

    /// Human readable package and revision
    pub fn description<R: RegisterAccess>(&self, regs: &mut R) -> Result<String, R::Error> {
        let rev = match self.revision {
            Some(r) => r,
            None => return Ok(self.name.to_string()),
        };

        let word = regs.read_reg(self.efuse_base + rev.offset)?;
        let field = |(shift, mask): (u32, u32)| (word >> shift) & mask;

        let desc = match field(rev.pkg) {
            0 => self.name.to_string(),
            _ => format!("unknown {}", self.name),
        };
        Ok(format!("{} (revision v{}.{})", desc, field(rev.major), field(rev.minor)))
    }
}

impl fmt::Display for ChipDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Set of descriptors identification chooses from
#[derive(Clone, Debug)]
pub struct Registry {
    chips: Vec<ChipDescriptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn new(chips: Vec<ChipDescriptor>) -> Self {
        Self { chips }
    }

    /// All families this crate knows about
    pub fn builtin() -> Self {
        Self::new(vec![ESP32, ESP32S2, ESP32S3, ESP32C2, ESP32C3, ESP32C6, ESP32C5, ESP32H2])
    }

    /// First descriptor accepting `magic`
    pub fn lookup(&self, magic: u32) -> Option<&ChipDescriptor> {
        self.chips.iter().find(|c| c.accepts(magic))
    }

    pub fn by_name(&self, name: &str) -> Option<&ChipDescriptor> {
        self.chips.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChipDescriptor> {
        self.chips.iter()
    }
}

use RegionKind::*;

const FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
    ("32MB", 0x50),
    ("64MB", 0x60),
    ("128MB", 0x70),
];

const FLASH_FREQ: &[(&str, u8)] = &[("80m", 0xF), ("40m", 0x0), ("26m", 0x1), ("20m", 0x2)];

const SPI_S2: SpiRegisters = SpiRegisters {
    base: 0x3F40_2000,
    usr: 0x18,
    usr2: 0x20,
    w0: 0x58,
    mosi_dlen: 0x24,
    miso_dlen: 0x28,
};

const KEY_PURPOSE_FIELDS: &[(u32, u32)] =
    &[(0x34, 24), (0x34, 28), (0x38, 0), (0x38, 4), (0x38, 8), (0x38, 12)];

const KEY_PURPOSES_S: KeyPurposeLayout = KeyPurposeLayout {
    fields: KEY_PURPOSE_FIELDS,
    mask: 0xF,
    names: &[
        (0, "USER/EMPTY"),
        (1, "RESERVED"),
        (2, "XTS_AES_256_KEY_1"),
        (3, "XTS_AES_256_KEY_2"),
        (4, "XTS_AES_128_KEY"),
        (5, "HMAC_DOWN_ALL"),
        (6, "HMAC_DOWN_JTAG"),
        (7, "HMAC_DOWN_DIGITAL_SIGNATURE"),
        (8, "HMAC_UP"),
        (9, "SECURE_BOOT_DIGEST0"),
        (10, "SECURE_BOOT_DIGEST1"),
        (11, "SECURE_BOOT_DIGEST2"),
    ],
    xts_aes_128: 4,
    key_manager: None,
};

const KEY_PURPOSES_C: KeyPurposeLayout = KeyPurposeLayout {
    names: &[
        (0, "USER/EMPTY"),
        (1, "RESERVED"),
        (4, "XTS_AES_128_KEY"),
        (5, "HMAC_DOWN_ALL"),
        (6, "HMAC_DOWN_JTAG"),
        (7, "HMAC_DOWN_DIGITAL_SIGNATURE"),
        (8, "HMAC_UP"),
        (9, "SECURE_BOOT_DIGEST0"),
        (10, "SECURE_BOOT_DIGEST1"),
        (11, "SECURE_BOOT_DIGEST2"),
    ],
    ..KEY_PURPOSES_S
};

pub const ESP32: ChipDescriptor = ChipDescriptor {
    name: "ESP32",
    magic_values: &[0x00F0_1D83],
    image_chip_id: 0,
    bootloader_offset: 0x1000,

    efuse_base: 0x3FF5_A000,
    uart_clkdiv_reg: 0x3FF4_0014,
    rom_crystal: None,
    spi: SpiRegisters {
        base: 0x3FF4_2000,
        usr: 0x1C,
        usr2: 0x24,
        w0: 0x80,
        mosi_dlen: 0x28,
        miso_dlen: 0x2C,
    },

    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x3F40_0000, 0x3F80_0000, Drom),
        region(0x3F80_0000, 0x3FC0_0000, ExtramData),
        region(0x3FF8_0000, 0x3FF8_2000, RtcDram),
        region(0x3FF9_0000, 0x4000_0000, ByteAccessible),
        region(0x3FFA_E000, 0x4000_0000, Dram),
        region(0x3FFE_0000, 0x3FFF_FFFC, DiramDram),
        region(0x4000_0000, 0x4007_0000, Irom),
        region(0x4007_0000, 0x4007_8000, CachePro),
        region(0x4007_8000, 0x4008_0000, CacheApp),
        region(0x4008_0000, 0x400A_0000, Iram),
        region(0x400A_0000, 0x400B_FFFC, DiramIram),
        region(0x400C_0000, 0x400C_2000, RtcIram),
        region(0x400D_0000, 0x4040_0000, Irom),
        region(0x5000_0000, 0x5000_2000, RtcData),
    ],
    flash_freq: FLASH_FREQ,
    flash_sizes: FLASH_SIZES,
    key_purposes: None,
    revision: None,
    features: &["WiFi", "BT", "Dual Core"],

    xtal: XtalDetect::UartDivider { divider: 1, steps: &[(33, 40)], fallback: 26 },
    usb_jtag_serial: None,
    watchdog: WatchdogReset::Unsupported,
    encrypted_flash_begin: false,
};

pub const ESP32S2: ChipDescriptor = ChipDescriptor {
    name: "ESP32-S2",
    magic_values: &[0x0000_07C6],
    image_chip_id: 2,
    efuse_base: 0x3F41_A000,
    uart_clkdiv_reg: 0x3F40_0014,
    spi: SPI_S2,
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x3F00_0000, 0x3FF8_0000, Drom),
        region(0x3F50_0000, 0x3FF8_0000, ExtramData),
        region(0x3FF9_E000, 0x3FFA_0000, RtcDram),
        region(0x3FF9_E000, 0x4000_0000, ByteAccessible),
        region(0x3FF9_E000, 0x4007_2000, MemInternal),
        region(0x3FFB_0000, 0x4000_0000, Dram),
        region(0x4000_0000, 0x4001_A100, IromMask),
        region(0x4002_0000, 0x4007_0000, Iram),
        region(0x4007_0000, 0x4007_2000, RtcIram),
        region(0x4008_0000, 0x4080_0000, Irom),
        region(0x5000_0000, 0x5000_2000, RtcData),
    ],
    key_purposes: Some(KEY_PURPOSES_S),
    features: &["WiFi"],
    xtal: XtalDetect::Fixed(40),
    watchdog: WatchdogReset::Rtc { wprotect: 0x3F40_80AC, config0: 0x3F40_8094, config1: 0x3F40_8098 },
    encrypted_flash_begin: true,
    ..ESP32
};

pub const ESP32S3: ChipDescriptor = ChipDescriptor {
    name: "ESP32-S3",
    magic_values: &[0x9],
    image_chip_id: 9,
    bootloader_offset: 0x0,
    efuse_base: 0x6000_7000,
    uart_clkdiv_reg: 0x6000_0014,
    spi: SpiRegisters { base: 0x6000_2000, ..SPI_S2 },
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x3C00_0000, 0x3D00_0000, Drom),
        region(0x3D00_0000, 0x3E00_0000, ExtramData),
        region(0x3FC8_8000, 0x3FD0_0000, ByteAccessible),
        region(0x3FC8_8000, 0x403E_2000, MemInternal),
        region(0x3FC8_8000, 0x3FD0_0000, Dram),
        region(0x4000_0000, 0x4006_0000, IromMask),
        region(0x4037_0000, 0x403E_0000, Iram),
        region(0x4200_0000, 0x4280_0000, Irom),
        region(0x5000_0000, 0x5000_2000, RtcData),
        region(0x600F_E000, 0x6010_0000, RtcIram),
        region(0x600F_E000, 0x6010_0000, RtcDram),
    ],
    features: &["WiFi", "BLE", "Dual Core"],
    usb_jtag_serial: Some((0x3FCE_F14C, 4)),
    watchdog: WatchdogReset::Rtc { wprotect: 0x6000_80B0, config0: 0x6000_8098, config1: 0x6000_809C },
    ..ESP32S2
};

pub const ESP32C3: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C3",
    magic_values: &[0x6921_506F, 0x1B31_506F, 0x4881_606F, 0x4361_606F],
    image_chip_id: 5,
    efuse_base: 0x6000_8800,
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x3C00_0000, 0x3C80_0000, Drom),
        region(0x3FC8_0000, 0x3FCE_0000, Dram),
        region(0x3FC8_8000, 0x3FD0_0000, ByteAccessible),
        region(0x3FF0_0000, 0x3FF2_0000, DromMask),
        region(0x4000_0000, 0x4006_0000, IromMask),
        region(0x4200_0000, 0x4280_0000, Irom),
        region(0x4037_C000, 0x403E_0000, Iram),
        region(0x5000_0000, 0x5000_2000, RtcIram),
        region(0x5000_0000, 0x5000_2000, RtcDram),
        region(0x600F_E000, 0x6010_0000, MemInternal2),
    ],
    key_purposes: Some(KEY_PURPOSES_C),
    features: &["WiFi", "BLE", "Single Core"],
    usb_jtag_serial: Some((0x3FCD_F07C, 3)),
    watchdog: WatchdogReset::Rtc { wprotect: 0x6000_80A8, config0: 0x6000_8090, config1: 0x6000_8094 },
    ..ESP32S3
};

pub const ESP32C2: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C2",
    magic_values: &[0x6F51_306F, 0x7C41_A06F],
    image_chip_id: 12,
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x3C00_0000, 0x3C40_0000, Drom),
        region(0x3FCA_0000, 0x3FCE_0000, Dram),
        region(0x3FC8_8000, 0x3FD0_0000, ByteAccessible),
        region(0x3FF0_0000, 0x3FF5_0000, DromMask),
        region(0x4000_0000, 0x4009_0000, IromMask),
        region(0x4200_0000, 0x4240_0000, Irom),
        region(0x4037_C000, 0x403C_0000, Iram),
    ],
    flash_freq: &[("60m", 0xF), ("30m", 0x0), ("20m", 0x1), ("15m", 0x2)],
    key_purposes: None,
    xtal: XtalDetect::UartDivider { divider: 1, steps: &[(33, 40)], fallback: 26 },
    usb_jtag_serial: None,
    watchdog: WatchdogReset::Unsupported,
    ..ESP32C3
};

pub const ESP32C6: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C6",
    magic_values: &[0x2CE0_806F],
    image_chip_id: 13,
    efuse_base: 0x600B_0800,
    spi: SpiRegisters { base: 0x6000_3000, ..SPI_S2 },
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x4280_0000, 0x4300_0000, Drom),
        region(0x4080_0000, 0x4088_0000, Dram),
        region(0x4080_0000, 0x4088_0000, ByteAccessible),
        region(0x4004_AC00, 0x4005_0000, DromMask),
        region(0x4000_0000, 0x4004_AC00, IromMask),
        region(0x4200_0000, 0x4280_0000, Irom),
        region(0x4080_0000, 0x4088_0000, Iram),
        region(0x5000_0000, 0x5000_4000, RtcIram),
        region(0x5000_0000, 0x5000_4000, RtcDram),
        region(0x600F_E000, 0x6010_0000, MemInternal2),
    ],
    flash_freq: &[("80m", 0x0), ("40m", 0x0), ("20m", 0x2)],
    revision: Some(RevisionLayout {
        offset: 0x44 + 4 * 3,
        pkg: (24, 0x07),
        major: (22, 0x03),
        minor: (18, 0x0F),
    }),
    features: &["WiFi 6", "BT 5", "IEEE802.15.4"],
    usb_jtag_serial: Some((0x4087_F580, 3)),
    watchdog: WatchdogReset::Unsupported,
    ..ESP32C3
};

pub const ESP32C5: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C5",
    magic_values: &[0x1101_406F, 0x63E1_406F, 0x5FD1_406F],
    image_chip_id: 23,
    bootloader_offset: 0x2000,
    efuse_base: 0x600B_4800,
    rom_crystal: Some(RomCrystal { reg: 0x6009_6110, mask: 0x7F << 24, shift: 24 }),
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x4200_0000, 0x4400_0000, Drom),
        region(0x4080_0000, 0x4086_0000, Dram),
        region(0x4080_0000, 0x4086_0000, ByteAccessible),
        region(0x4003_A000, 0x4004_0000, DromMask),
        region(0x4000_0000, 0x4003_A000, IromMask),
        region(0x4200_0000, 0x4400_0000, Irom),
        region(0x4080_0000, 0x4086_0000, Iram),
        region(0x5000_0000, 0x5000_4000, RtcIram),
        region(0x5000_0000, 0x5000_4000, RtcDram),
        region(0x600F_E000, 0x6010_0000, MemInternal2),
    ],
    flash_freq: &[("80m", 0xF), ("40m", 0x0), ("20m", 0x2)],
    key_purposes: Some(KeyPurposeLayout {
        fields: &[(0x34, 22), (0x34, 27), (0x38, 0), (0x38, 5), (0x38, 10), (0x38, 15)],
        mask: 0x1F,
        names: &[
            (0, "USER/EMPTY"),
            (1, "ECDSA_KEY"),
            (4, "XTS_AES_128_KEY"),
            (5, "HMAC_DOWN_ALL"),
            (6, "HMAC_DOWN_JTAG"),
            (7, "HMAC_DOWN_DIGITAL_SIGNATURE"),
            (8, "HMAC_UP"),
            (9, "SECURE_BOOT_DIGEST0"),
            (10, "SECURE_BOOT_DIGEST1"),
            (11, "SECURE_BOOT_DIGEST2"),
            (12, "KM_INIT_KEY"),
            (15, "XTS_AES_128_PSRAM_KEY"),
            (16, "ECDSA_KEY_P192"),
            (17, "ECDSA_KEY_P384_L"),
            (18, "ECDSA_KEY_P384_H"),
        ],
        xts_aes_128: 4,
        key_manager: Some((0x34, 10, 2)),
    }),
    revision: Some(RevisionLayout {
        offset: 0x44 + 4 * 2,
        pkg: (26, 0x07),
        major: (4, 0x03),
        minor: (0, 0x0F),
    }),
    features: &["Wi-Fi 6 (dual-band)", "BT 5 (LE)", "IEEE802.15.4", "Single Core + LP Core", "240MHz"],
    xtal: XtalDetect::UartDivider { divider: 1, steps: &[(45, 48), (33, 40)], fallback: 26 },
    usb_jtag_serial: Some((0x4085_F514, 3)),
    watchdog: WatchdogReset::Placeholder,
    ..ESP32C6
};

pub const ESP32H2: ChipDescriptor = ChipDescriptor {
    name: "ESP32-H2",
    magic_values: &[0xD7B7_3E80],
    image_chip_id: 16,
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, Padding),
        region(0x4280_0000, 0x4300_0000, Drom),
        region(0x4080_0000, 0x4085_0000, Dram),
        region(0x4080_0000, 0x4085_0000, ByteAccessible),
        region(0x4001_C400, 0x4002_0000, DromMask),
        region(0x4000_0000, 0x4001_C400, IromMask),
        region(0x4200_0000, 0x4280_0000, Irom),
        region(0x4080_0000, 0x4085_0000, Iram),
        region(0x5000_0000, 0x5000_1000, RtcIram),
        region(0x5000_0000, 0x5000_1000, RtcDram),
        region(0x600F_E000, 0x6010_0000, MemInternal2),
    ],
    flash_freq: &[("48m", 0xF), ("24m", 0x0), ("16m", 0x1), ("12m", 0x2)],
    revision: None,
    features: &["BLE", "IEEE802.15.4"],
    xtal: XtalDetect::Fixed(32),
    usb_jtag_serial: Some((0x4084_FEFC, 3)),
    ..ESP32C6
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Regs {
        values: HashMap<u32, u32>,
        writes: Vec<(u32, u32)>,
    }

    impl RegisterAccess for Regs {
        type Error = ();

        fn read_reg(&mut self, addr: u32) -> Result<u32, ()> {
            Ok(*self.values.get(&addr).unwrap_or(&0))
        }

        fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), ()> {
            self.writes.push((addr, value));
            Ok(())
        }
    }

    #[test]
    fn first_match_wins() {
        const CHIP_A: ChipDescriptor =
            ChipDescriptor { name: "ChipA", magic_values: &[0x1101_406F, 0x63E1_406F], ..ESP32C6 };
        const CHIP_B: ChipDescriptor = ChipDescriptor { name: "ChipB", magic_values: &[0xAA], ..ESP32 };

        let registry = Registry::new(vec![CHIP_A, CHIP_B]);
        assert_eq!(registry.lookup(0x63E1_406F).unwrap().name, "ChipA");
        assert_eq!(registry.lookup(0xAA).unwrap().name, "ChipB");
        assert!(registry.lookup(0xDEAD).is_none());

        let builtin = Registry::builtin();
        assert_eq!(builtin.lookup(0x5FD1_406F).unwrap().name, "ESP32-C5");
        assert_eq!(builtin.lookup(0x2CE0_806F).unwrap().name, "ESP32-C6");
        assert_eq!(builtin.by_name("esp32-s3").unwrap().image_chip_id, 9);
    }

    #[test]
    fn magic_values_are_unique() {
        let chips: Vec<_> = Registry::builtin().iter().cloned().collect();
        for (i, a) in chips.iter().enumerate() {
            for b in &chips[i + 1..] {
                for m in a.magic_values {
                    assert!(!b.accepts(*m), "{} and {} both accept {:#x}", a, b, m);
                }
            }
        }
    }

    #[test]
    fn memory_maps_do_not_overlap_within_kind() {
        for chip in Registry::builtin().iter() {
            for (i, a) in chip.memory_map.iter().enumerate() {
                assert!(a.start < a.end);
                for b in &chip.memory_map[i + 1..] {
                    if a.kind == b.kind {
                        assert!(!a.overlaps(b.start, b.end), "{}: {:?} / {:?}", chip, a, b);
                    }
                }
            }
        }
    }

    #[test]
    fn c5_overrides_c6() {
        assert_eq!(ESP32C5.spi, ESP32C6.spi);
        assert_eq!(ESP32C5.uart_clkdiv_reg, ESP32C6.uart_clkdiv_reg);
        assert_ne!(ESP32C5.efuse_base, ESP32C6.efuse_base);
        assert_eq!(ESP32C5.flash_freq_code("80m"), Some(0xF));
        assert_eq!(ESP32C6.flash_freq_code("80m"), Some(0x0));
        assert_eq!(ESP32C5.flash_size_code("4MB"), Some(0x20));
        assert_eq!(ESP32C5.bootloader_offset, 0x2000);
    }

    #[test]
    fn crystal_detection() {
        let mut regs = Regs::default();

        // 115200 * 347 / 1e6 = 39.97
        regs.values.insert(ESP32C5.uart_clkdiv_reg, 347);
        assert_eq!(ESP32C5.crystal_freq(&mut regs, 115_200), Ok(40));

        // 115200 * 416 / 1e6 = 47.9
        regs.values.insert(ESP32C5.uart_clkdiv_reg, 416);
        assert_eq!(ESP32C5.crystal_freq(&mut regs, 115_200), Ok(48));
        assert_eq!(ESP32.crystal_freq(&mut regs, 115_200), Ok(40));

        regs.values.insert(ESP32C5.uart_clkdiv_reg, 226);
        assert_eq!(ESP32C5.crystal_freq(&mut regs, 115_200), Ok(26));

        assert_eq!(ESP32H2.crystal_freq(&mut regs, 115_200), Ok(32));

        regs.values.insert(0x6009_6110, 48 << 24 | 0x1234);
        assert_eq!(ESP32C5.rom_expected_crystal_freq(&mut regs), Ok(Some(48)));
        assert_eq!(ESP32C6.rom_expected_crystal_freq(&mut regs), Ok(None));
    }

    #[test]
    fn usb_jtag_detection() {
        let mut regs = Regs::default();
        regs.values.insert(0x4085_F514, 0x0000_0103);
        assert_eq!(ESP32C5.uses_usb_jtag_serial(&mut regs), Ok(true));
        regs.values.insert(0x4085_F514, 0x0000_0001);
        assert_eq!(ESP32C5.uses_usb_jtag_serial(&mut regs), Ok(false));
        assert_eq!(ESP32.uses_usb_jtag_serial(&mut regs), Ok(false));
    }

    #[test]
    fn watchdog_reset_strategies() {
        let mut regs = Regs::default();
        assert_eq!(ESP32C3.watchdog_reset(&mut regs), Ok(true));
        assert_eq!(
            regs.writes,
            vec![
                (0x6000_80A8, WDT_WKEY),
                (0x6000_8094, 2000),
                (0x6000_8090, WDT_CONFIG0_FLAGS),
                (0x6000_80A8, 0),
            ]
        );

        let mut regs = Regs::default();
        assert_eq!(ESP32C5.watchdog_reset(&mut regs), Ok(false));
        assert_eq!(ESP32C6.watchdog_reset(&mut regs), Ok(false));
        assert!(regs.writes.is_empty());
    }

    #[test]
    fn key_purposes() {
        let mut regs = Regs::default();
        let base = ESP32C5.efuse_base;

        // KEY1 = XTS_AES_128_KEY
        regs.values.insert(base + 0x34, 4 << 27);
        assert_eq!(ESP32C5.key_block_purpose(&mut regs, 1), Ok(Some(4)));
        assert_eq!(ESP32C5.key_block_purpose(&mut regs, 6), Ok(None));
        assert_eq!(ESP32C5.key_purpose_name(4), Some("XTS_AES_128_KEY"));
        assert_eq!(ESP32C5.is_flash_encryption_key_valid(&mut regs), Ok(true));

        regs.values.insert(base + 0x34, 0);
        assert_eq!(ESP32C5.is_flash_encryption_key_valid(&mut regs), Ok(false));

        // Key manager forced to provide the XTS key
        regs.values.insert(base + 0x34, 2 << 10);
        assert_eq!(ESP32C5.is_flash_encryption_key_valid(&mut regs), Ok(true));
        assert_eq!(ESP32C6.is_flash_encryption_key_valid(&mut Regs::default()), Ok(false));

        regs.values.insert(base + 0x34, 4 << 27);
        let blocks = ESP32C5.key_blocks(&mut regs).unwrap();
        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks[0], KeyBlock { block: 0, purpose: 0, name: Some("USER/EMPTY") });
        assert_eq!(blocks[1], KeyBlock { block: 1, purpose: 4, name: Some("XTS_AES_128_KEY") });
        assert!(ESP32.key_blocks(&mut regs).unwrap().is_empty());
    }

    #[test]
    fn description_from_efuse() {
        let mut regs = Regs::default();
        regs.values.insert(ESP32C5.efuse_base + 0x44 + 8, (1 << 4) | 2);
        assert_eq!(ESP32C5.description(&mut regs).unwrap(), "ESP32-C5 (revision v1.2)");

        regs.values.insert(ESP32C5.efuse_base + 0x44 + 8, 1 << 26);
        assert_eq!(ESP32C5.description(&mut regs).unwrap(), "unknown ESP32-C5 (revision v0.0)");

        assert_eq!(ESP32.description(&mut regs).unwrap(), "ESP32");
    }

    #[test]
    fn mask_rom_is_not_writable() {
        assert!(ESP32C5.non_writable_overlap(0x4000_0000, 0x4000_0010).is_some());
        assert!(ESP32C5.non_writable_overlap(0x0, 0x10_0000).is_none());
    }
}
