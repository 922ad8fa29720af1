//! Simulated ESP device behind a serial port.
//!
//! Models the parts of the ROM loader and stub the programmer relies on: the
//! auto-reset circuit, SLIP framed commands, register access, a NOR flash
//! where programming can only clear bits, and the MD5 command.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Read as _;
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};
use flate2::read::ZlibDecoder;

use esp_uart_loader::chips::{ChipDescriptor, SpiRegisters};
use esp_uart_loader::protocol::*;
use esp_uart_loader::slip::{self, Decoder};
use esp_uart_loader::SerialPort;

pub const FLASH_SIZE: usize = 0x40_0000;
pub const JEDEC_ID: u32 = 0x0016_40EF;
pub const BOOT_BAUD: u32 = 115_200;

pub const ROM_BANNER: &[u8] = b"ESP-ROM:esp32c5-20240126\nwaiting for download\n";
pub const APP_OUTPUT: &[u8] = b"hello from app\n";

const ERR_INVALID: u8 = 0x05;
const ERR_CHECKSUM: u8 = 0x07;
const ERR_DEFLATE: u8 = 0x0B;

const SPI_CMD_USR: u32 = 1 << 18;

struct Download {
    offset: u32,
    block: u32,
    compressed: bool,
    data: Vec<u8>,
}

pub struct Device {
    pub magic: u32,
    pub spi: SpiRegisters,
    pub regs: HashMap<u32, u32>,
    pub flash: Vec<u8>,
    pub ram: Vec<(u32, Vec<u8>)>,
    pub stub_entry: Option<u32>,

    pub stub: bool,
    pub in_bootloader: bool,
    /// Answer commands at all
    pub respond: bool,
    /// Prefix every reply with line noise and a stale response
    pub noise: bool,
    pub baud: u32,
    pub host_baud: u32,

    pub rts: bool,
    pub dtr: bool,
    /// `true` for a reset into the bootloader, `false` into the application
    pub resets: Vec<bool>,

    pub commands: Vec<u8>,
    pub sync_seen: usize,
    pub flash_params: Option<u32>,
    /// Flip this flash byte right before the next MD5 is computed
    pub corrupt_before_md5: Option<usize>,

    rx: VecDeque<u8>,
    decoder: Decoder,
    download: Option<Download>,
}

impl Device {
    pub fn new(chip: &ChipDescriptor) -> Self {
        let mut regs = HashMap::new();
        regs.insert(CHIP_DETECT_MAGIC_REG, chip.magic_values[0]);
        // 40 MHz crystal at the boot baud rate
        regs.insert(chip.uart_clkdiv_reg, 347);
        if let Some(c) = chip.rom_crystal {
            regs.insert(c.reg, 40 << c.shift);
        }

        Self {
            magic: chip.magic_values[0],
            spi: chip.spi,
            regs,
            flash: vec![0xFF; FLASH_SIZE],
            ram: vec![],
            stub_entry: None,
            stub: false,
            in_bootloader: false,
            respond: true,
            noise: false,
            baud: BOOT_BAUD,
            host_baud: BOOT_BAUD,
            rts: false,
            dtr: false,
            resets: vec![],
            commands: vec![],
            sync_seen: 0,
            flash_params: None,
            corrupt_before_md5: None,
            rx: VecDeque::new(),
            decoder: Decoder::new(),
            download: None,
        }
    }

    pub fn shared(self) -> Arc<Mutex<Device>> {
        Arc::new(Mutex::new(self))
    }

    pub fn set_magic(&mut self, magic: u32) {
        self.magic = magic;
        self.regs.insert(CHIP_DETECT_MAGIC_REG, magic);
    }

    fn reset(&mut self, boot: bool) {
        self.resets.push(boot);
        self.stub = false;
        self.baud = BOOT_BAUD;
        self.download = None;
        self.decoder.reset();
        self.rx.clear();
        self.in_bootloader = boot;
        self.rx.extend(if boot { ROM_BANNER } else { APP_OUTPUT });
    }

    fn status(&self, ok: bool, code: u8) -> Vec<u8> {
        let mut s = vec![if ok { 0 } else { 1 }, code];
        if !self.stub {
            s.extend_from_slice(&[0, 0]);
        }
        s
    }

    fn reply_data(&mut self, command: u8, value: u32, data: &[u8]) {
        if self.noise {
            self.rx.extend(&[0x00, 0x42, slip::END, 0x99, slip::END]);
            let stale = slip::encode_response(Command::Sync as u8, 0, &self.status(true, 0));
            self.rx.extend(stale);
        }
        let mut body = data.to_vec();
        body.extend(self.status(true, 0));
        self.rx.extend(slip::encode_response(command, value, &body));
    }

    fn reply(&mut self, command: u8, value: u32) {
        self.reply_data(command, value, &[]);
    }

    fn reject(&mut self, command: u8, code: u8) {
        let status = self.status(false, code);
        self.rx.extend(slip::encode_response(command, 0, &status));
    }

    fn erase(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        let start = (offset - offset % FLASH_SECTOR_SIZE) as usize;
        let end = ((offset + size + FLASH_SECTOR_SIZE - 1) / FLASH_SECTOR_SIZE * FLASH_SECTOR_SIZE) as usize;
        let end = end.min(self.flash.len());
        for b in &mut self.flash[start..end] {
            *b = 0xFF;
        }
    }

    /// NOR programming: bits can only go from 1 to 0
    fn program(&mut self, addr: usize, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            if let Some(f) = self.flash.get_mut(addr + i) {
                *f &= *b;
            }
        }
    }

    fn finish_download(&mut self) -> bool {
        let d = match self.download.take() {
            Some(d) => d,
            None => return true,
        };
        if !d.compressed || d.data.is_empty() {
            return true;
        }

        let mut out = vec![];
        if ZlibDecoder::new(&d.data[..]).read_to_end(&mut out).is_err() {
            return false;
        }
        self.program(d.offset as usize, &out);
        true
    }

    fn receive(&mut self, b: u8) {
        if self.host_baud != self.baud || !self.in_bootloader {
            return;
        }

        let frame = match self.decoder.push(b) {
            Some(Ok(f)) => f,
            _ => return,
        };
        let pkt = match slip::parse_request(&frame) {
            Ok(p) => p,
            Err(_) => return,
        };

        if pkt.command == Command::Sync as u8 {
            self.sync_seen += 1;
        }
        if !self.respond {
            return;
        }

        self.commands.push(pkt.command);
        self.handle(pkt.command, &pkt.payload, pkt.checksum_ok);
    }

    fn handle(&mut self, op: u8, payload: &[u8], checksum_ok: bool) {
        let w = |i: usize| -> u32 {
            payload
                .get(i * 4..i * 4 + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };

        let command = match Command::from_u8(op) {
            Some(c) => c,
            None => return self.reject(op, ERR_INVALID),
        };

        if command.is_data() && !checksum_ok {
            return self.reject(op, ERR_CHECKSUM);
        }

        match command {
            Command::Sync => {
                // The ROM answers every SYNC several times
                for _ in 0..3 {
                    self.reply(op, 0);
                }
            }
            Command::ReadReg => {
                let v = *self.regs.get(&w(0)).unwrap_or(&0);
                self.reply(op, v);
            }
            Command::WriteReg => {
                let (addr, value) = (w(0), w(1));
                if addr == self.spi.cmd() && value & SPI_CMD_USR != 0 {
                    let w0 = self.spi.base + self.spi.w0;
                    self.regs.insert(w0, JEDEC_ID);
                    self.regs.insert(addr, 0);
                } else {
                    self.regs.insert(addr, value);
                }
                self.reply(op, 0);
            }
            Command::SpiAttach => self.reply(op, 0),
            Command::SpiSetParams => {
                self.flash_params = Some(w(1));
                self.reply(op, 0);
            }
            Command::ChangeBaudrate => {
                self.reply(op, 0);
                self.baud = w(0);
            }
            Command::MemBegin | Command::MemData | Command::MemEnd if self.stub => self.reject(op, ERR_INVALID),
            Command::MemBegin => {
                self.ram.push((w(3), Vec::with_capacity(w(0) as usize)));
                self.reply(op, 0);
            }
            Command::MemData => {
                if let Some((_, seg)) = self.ram.last_mut() {
                    seg.extend_from_slice(&payload[16..]);
                }
                self.reply(op, 0);
            }
            Command::MemEnd => {
                self.reply(op, 0);
                if w(0) == 0 {
                    self.stub_entry = Some(w(1));
                    self.stub = true;
                    self.rx.extend(slip::encode_frame(STUB_GREETING));
                }
            }
            Command::FlashBegin | Command::FlashDeflBegin => {
                if !self.finish_download() {
                    return self.reject(op, ERR_DEFLATE);
                }
                let (size, block, offset) = (w(0), w(2), w(3));
                self.erase(offset, size);
                self.download = Some(Download {
                    offset,
                    block,
                    compressed: command == Command::FlashDeflBegin,
                    data: vec![],
                });
                self.reply(op, 0);
            }
            Command::FlashData => {
                let seq = w(1);
                let target = match &self.download {
                    Some(d) if !d.compressed => (d.offset + seq * d.block) as usize,
                    _ => return self.reject(op, ERR_INVALID),
                };
                self.program(target, &payload[16..]);
                self.reply(op, 0);
            }
            Command::FlashDeflData => {
                let accepted = match &mut self.download {
                    Some(d) if d.compressed => {
                        d.data.extend_from_slice(&payload[16..]);
                        true
                    }
                    _ => false,
                };
                if accepted {
                    self.reply(op, 0);
                } else {
                    self.reject(op, ERR_INVALID);
                }
            }
            Command::FlashEnd | Command::FlashDeflEnd => {
                if self.finish_download() {
                    self.reply(op, 0);
                } else {
                    self.reject(op, ERR_DEFLATE);
                }
            }
            Command::SpiFlashMd5 => {
                if !self.finish_download() {
                    return self.reject(op, ERR_DEFLATE);
                }
                if let Some(a) = self.corrupt_before_md5.take() {
                    self.flash[a] ^= 0xFF;
                }
                let (addr, size) = (w(0) as usize, w(1) as usize);
                let digest = md5::compute(&self.flash[addr..addr + size]).0;
                let data = if self.stub { digest.to_vec() } else { hex::encode(digest).into_bytes() };
                self.reply_data(op, 0, &data);
            }
            Command::EraseFlash | Command::EraseRegion if !self.stub => self.reject(op, ERR_INVALID),
            Command::EraseFlash => {
                for b in &mut self.flash {
                    *b = 0xFF;
                }
                self.reply(op, 0);
            }
            Command::EraseRegion => {
                self.erase(w(0), w(1));
                self.reply(op, 0);
            }
        }
    }
}

/// Host end of the link to a [`Device`]
pub struct SimPort(pub Arc<Mutex<Device>>);

impl SimPort {
    fn dev(&self) -> MutexGuard<'_, Device> {
        self.0.lock().unwrap()
    }
}

impl Read<u8> for SimPort {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        self.dev().rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimPort {
    type Error = ();

    fn write(&mut self, word: u8) -> nb::Result<(), ()> {
        self.dev().receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        Ok(())
    }
}

impl SerialPort<()> for SimPort {
    fn set_rts(&mut self, level: bool) -> Result<(), ()> {
        let mut d = self.dev();
        // Chip comes out of reset when EN is released
        if d.rts && !level {
            let boot = d.dtr;
            d.reset(boot);
        }
        d.rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ()> {
        self.dev().dtr = level;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), ()> {
        self.dev().host_baud = baud;
        Ok(())
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Deterministic, incompressible-ish test data
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}
