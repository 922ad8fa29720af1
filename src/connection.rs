//! Command / response engine.
//!
//! One command is in flight at a time: the request is written, then bytes are
//! polled and decoded until a response carrying the same opcode arrives or the
//! per-command timeout expires. Responses to other opcodes are stale leftovers
//! from an earlier exchange and are dropped.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::chips::{RegisterAccess, SpiRegisters};
use crate::monitor::CancelToken;
use crate::protocol::*;
use crate::slip::{self, Decoder, FrameError, Response};
use crate::{Error, Options, SerialPort};

/// Value and data (status trailer removed) of a successful command
#[derive(Clone, PartialEq, Debug)]
pub struct Reply {
    pub value: u32,
    pub data: Vec<u8>,
}

const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;

const SPIFLASH_RDID: u8 = 0x9F;

pub struct Connection<'a, P, D, E> {
    port: &'a mut P,
    delay: &'a mut D,
    options: &'a Options,
    cancel: &'a CancelToken,
    decoder: Decoder,
    /// Framing error from the last wait, kept only if no clean frame followed
    garbled: Option<FrameError>,
    stub: bool,
    baud: u32,
    _err: PhantomData<E>,
}

impl<'a, P, D, E> Connection<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(
        port: &'a mut P,
        delay: &'a mut D,
        options: &'a Options,
        cancel: &'a CancelToken,
        stub: bool,
        baud: u32,
    ) -> Self {
        Self {
            port,
            delay,
            options,
            cancel,
            decoder: Decoder::new(),
            garbled: None,
            stub,
            baud,
            _err: PhantomData,
        }
    }

    /// Whether the stub is answering instead of the ROM
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// Mark the stub as running, there is no way back to the ROM loader
    pub fn set_stub(&mut self) {
        self.stub = true;
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn options(&self) -> &Options {
        self.options
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Reopen the host side at `baud`
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error<E>> {
        if baud != self.baud {
            debug!("Setting host baud rate to {}", baud);
            self.port.set_baud(baud)?;
            self.baud = baud;
        }
        Ok(())
    }

    /// Classic DTR / RTS sequence latching the boot pin low across reset
    pub fn reset_to_bootloader(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting into bootloader");

        self.port.set_control_lines(true, false)?;
        self.delay.delay_ms(100);

        self.port.set_control_lines(false, true)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        self.port.set_control_lines(false, false)?;
        Ok(())
    }

    /// Pulse reset with the boot pin released so the application starts
    pub fn reset_to_run(&mut self) -> Result<(), Error<E>> {
        debug!("Hard resetting via RTS");

        self.port.set_control_lines(true, false)?;
        self.delay.delay_ms(100);

        self.port.set_control_lines(false, false)?;
        self.delay.delay_ms(200);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        for b in frame {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Microseconds one byte occupies on the line (start, 8 data, stop bits)
    fn byte_time_us(&self) -> u64 {
        (10_000_000 / self.baud.max(1)).max(1) as u64
    }

    /// Drop anything already received, at most one sync timeout's worth of bytes
    fn flush_input(&mut self) -> Result<(), Error<E>> {
        let limit = (self.options.sync_timeout_ms.max(1) as u64 * 1000 / self.byte_time_us()).max(1);
        let mut n = 0u64;
        while n < limit {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }
        if n > 0 {
            trace!("Flushed {} stale bytes", n);
        }
        self.decoder.reset();
        Ok(())
    }

    /// Poll the port until `accept` takes a frame or `timeout_ms` passes.
    ///
    /// Time spent idle and the line time of every received byte both count
    /// against the timeout, so a link that never goes quiet still expires.
    fn wait_for<T>(
        &mut self,
        timeout_ms: u32,
        mut accept: impl FnMut(&[u8]) -> Option<T>,
    ) -> Result<Option<T>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let byte_us = self.byte_time_us();
        let budget_us = timeout_ms as u64 * 1000;
        let mut spent_us = 0u64;
        let mut clean = false;
        self.garbled = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.port.read() {
                Ok(b) => {
                    match self.decoder.push(b) {
                        Some(Ok(frame)) => {
                            clean = true;
                            self.garbled = None;
                            if let Some(v) = accept(&frame) {
                                return Ok(Some(v));
                            }
                        }
                        Some(Err(e)) => {
                            debug!("Dropping malformed frame: {}", e);
                            if !clean {
                                self.garbled = Some(e);
                            }
                        }
                        None => (),
                    }

                    spent_us += byte_us;
                    if spent_us >= budget_us {
                        trace!("Input did not settle within {} ms", timeout_ms);
                        return Ok(None);
                    }
                }
                Err(nb::Error::WouldBlock) => {
                    if spent_us >= budget_us {
                        return Ok(None);
                    }
                    self.delay.delay_ms(poll);
                    spent_us += poll as u64 * 1000;
                }
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }
    }

    fn wait_response(&mut self, command: Command, timeout_ms: u32) -> Result<Option<Response>, Error<E>> {
        self.wait_for(timeout_ms, |frame| match slip::parse_response(frame) {
            Ok(r) if r.command == command as u8 => Some(r),
            Ok(r) => {
                debug!("Discarding stale response to 0x{:02x} while waiting for {:?}", r.command, command);
                None
            }
            Err(e) => {
                debug!("Discarding frame: {}", e);
                None
            }
        })
    }

    fn status_len(&self) -> usize {
        if self.stub {
            STUB_STATUS_LEN
        } else {
            ROM_STATUS_LEN
        }
    }

    fn check_status(&self, command: Command, r: Response) -> Result<Reply, Error<E>> {
        let n = self.status_len();
        if r.data.len() < n {
            return Err(Error::Protocol(format!(
                "{:?} response too short for status ({} bytes)",
                command,
                r.data.len()
            )));
        }

        let (data, status) = r.data.split_at(r.data.len() - n);
        if status[0] != 0 {
            return Err(Error::Rejected { command, status: status[1] });
        }

        Ok(Reply { value: r.value, data: data.to_vec() })
    }

    fn check_available(&self, command: Command) -> Result<(), Error<E>> {
        if self.stub && command.rom_only() {
            return Err(Error::NotAvailable { command, loader: "stub" });
        }
        if !self.stub && command.stub_only() {
            return Err(Error::NotAvailable { command, loader: "ROM" });
        }
        Ok(())
    }

    /// Send a command without waiting for its response
    pub fn write_command(&mut self, command: Command, payload: &[u8]) -> Result<(), Error<E>> {
        self.check_available(command)?;
        trace!("Sending {:?} ({} bytes), not waiting", command, payload.len());
        self.write_frame(&slip::encode(command, payload))
    }

    fn send(&mut self, command: Command, payload: &[u8], timeout_ms: u32, attempts: u32) -> Result<Reply, Error<E>> {
        self.check_available(command)?;

        let frame = slip::encode(command, payload);
        for attempt in 1..=attempts {
            trace!("Sending {:?} ({} bytes)", command, payload.len());
            self.write_frame(&frame)?;

            if let Some(r) = self.wait_response(command, timeout_ms)? {
                return self.check_status(command, r);
            }
            debug!("No response to {:?} (attempt {}/{})", command, attempt, attempts);
        }

        // Only garbage came back on the last attempt
        match self.garbled.take() {
            Some(e) => Err(Error::Frame(e)),
            None => Err(Error::Timeout(command)),
        }
    }

    /// Send a command and wait for its response, resending on timeout
    pub fn execute(&mut self, command: Command, payload: &[u8], timeout_ms: u32) -> Result<Reply, Error<E>> {
        let attempts = self.options.command_attempts.max(1);
        self.send(command, payload, timeout_ms, attempts)
    }

    /// As [`execute`](Self::execute) without resending
    pub fn execute_once(&mut self, command: Command, payload: &[u8], timeout_ms: u32) -> Result<Reply, Error<E>> {
        self.send(command, payload, timeout_ms, 1)
    }

    /// Send SYNC until the loader answers
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        let frame = slip::encode(Command::Sync, &sync_payload());
        let attempts = self.options.sync_attempts;

        for attempt in 1..=attempts {
            self.flush_input()?;
            self.write_frame(&frame)?;

            if self.wait_response(Command::Sync, self.options.sync_timeout_ms)?.is_some() {
                // ROM answers a single SYNC several times
                self.flush_input()?;
                debug!("Synced after {} attempt(s)", attempt);
                return Ok(());
            }
            debug!("No sync response (attempt {}/{})", attempt, attempts);
        }

        Err(Error::Timeout(Command::Sync))
    }

    /// Wait for a raw frame matching `expected`
    pub fn wait_frame(&mut self, expected: &[u8], timeout_ms: u32) -> Result<bool, Error<E>> {
        Ok(self.wait_for(timeout_ms, |f| if f == expected { Some(()) } else { None })?.is_some())
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        Ok(self.execute(Command::ReadReg, &addr.to_le_bytes(), timeout)?.value)
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay_us: u32) -> Result<(), Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.execute(Command::WriteReg, &words(&[addr, value, mask, delay_us]), timeout)?;
        Ok(())
    }

    /// Attach the default SPI flash pins
    pub fn spi_attach(&mut self) -> Result<(), Error<E>> {
        let mut payload = 0u32.to_le_bytes().to_vec();
        if !self.stub {
            // ROM takes an extra "legacy" flag word
            payload.extend_from_slice(&[0u8; 4]);
        }
        let timeout = self.options.response_timeout_ms;
        self.execute(Command::SpiAttach, &payload, timeout)?;
        Ok(())
    }

    /// Tell the loader the flash geometry
    pub fn spi_set_params(&mut self, size: u32) -> Result<(), Error<E>> {
        let params = words(&[0, size, 64 * 1024, FLASH_SECTOR_SIZE, 256, 0xFFFF]);
        let timeout = self.options.response_timeout_ms;
        self.execute(Command::SpiSetParams, &params, timeout)?;
        Ok(())
    }

    /// Run a flash command through the SPI controller's user command registers
    pub fn spi_command(
        &mut self,
        spi: &SpiRegisters,
        command: u8,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32, Error<E>> {
        if read_bits > 32 || data.len() > 64 {
            return Err(Error::Protocol(format!("SPI command 0x{:02x} exceeds register window", command)));
        }

        let reg = |offset: u32| spi.base + offset;
        let old_usr = self.read_reg(reg(spi.usr))?;
        let old_usr2 = self.read_reg(reg(spi.usr2))?;

        let data_bits = data.len() as u32 * 8;
        let mut flags = SPI_USR_COMMAND;
        if read_bits > 0 {
            flags |= SPI_USR_MISO;
            self.write_reg(reg(spi.miso_dlen), read_bits - 1, 0xFFFF_FFFF, 0)?;
        }
        if data_bits > 0 {
            flags |= SPI_USR_MOSI;
            self.write_reg(reg(spi.mosi_dlen), data_bits - 1, 0xFFFF_FFFF, 0)?;
        }

        self.write_reg(reg(spi.usr), flags, 0xFFFF_FFFF, 0)?;
        self.write_reg(reg(spi.usr2), (7 << SPI_USR2_COMMAND_LEN_SHIFT) | command as u32, 0xFFFF_FFFF, 0)?;

        if data.is_empty() {
            self.write_reg(reg(spi.w0), 0, 0xFFFF_FFFF, 0)?;
        } else {
            for (i, chunk) in data.chunks(4).enumerate() {
                let mut w = [0u8; 4];
                w[..chunk.len()].copy_from_slice(chunk);
                self.write_reg(reg(spi.w0) + 4 * i as u32, u32::from_le_bytes(w), 0xFFFF_FFFF, 0)?;
            }
        }

        self.write_reg(spi.cmd(), SPI_CMD_USR, 0xFFFF_FFFF, 0)?;

        let mut done = false;
        for _ in 0..10 {
            if self.read_reg(spi.cmd())? & SPI_CMD_USR == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(Error::Protocol(format!("SPI command 0x{:02x} did not complete", command)));
        }

        let status = self.read_reg(reg(spi.w0))?;

        self.write_reg(reg(spi.usr), old_usr, 0xFFFF_FFFF, 0)?;
        self.write_reg(reg(spi.usr2), old_usr2, 0xFFFF_FFFF, 0)?;

        Ok(status)
    }

    /// JEDEC ID of the attached flash
    pub fn flash_id(&mut self, spi: &SpiRegisters) -> Result<u32, Error<E>> {
        self.spi_command(spi, SPIFLASH_RDID, &[], 24)
    }

    /// MD5 of a flash region as computed by the device
    pub fn flash_md5(&mut self, addr: u32, size: u32) -> Result<[u8; 16], Error<E>> {
        let timeout = timeout_per_mb(MD5_TIMEOUT_PER_MB_MS, size);
        let reply = self.execute(Command::SpiFlashMd5, &words(&[addr, size, 0, 0]), timeout)?;

        let mut digest = [0u8; 16];
        match reply.data.len() {
            // Stub sends raw bytes
            16 => digest.copy_from_slice(&reply.data),
            // ROM sends lowercase hex
            32 => hex::decode_to_slice(&reply.data, &mut digest)
                .map_err(|e| Error::Protocol(format!("invalid MD5 reply: {}", e)))?,
            n => return Err(Error::Protocol(format!("unexpected MD5 reply length {}", n))),
        }
        Ok(digest)
    }

    /// Switch both ends to `baud`
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error<E>> {
        info!("Changing baud rate to {}", baud);

        // The stub wants the rate it is currently running at, the ROM takes 0
        let prior = if self.stub { self.baud } else { 0 };
        let timeout = self.options.response_timeout_ms;
        self.execute(Command::ChangeBaudrate, &words(&[baud, prior]), timeout)?;

        self.port.set_baud(baud)?;
        self.baud = baud;

        // Let the device switch over before talking again
        self.delay.delay_ms(50);
        self.flush_input()
    }
}

impl<'a, P, D, E> RegisterAccess for Connection<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = Error<E>;

    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error> {
        Connection::read_reg(self, addr)
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error> {
        Connection::write_reg(self, addr, value, 0xFFFF_FFFF, 0)
    }
}
