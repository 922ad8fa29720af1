//! ESP Serial Bootloader.
//!
//! Host side of the Espressif ROM / stub UART bootloader protocol: framing,
//! chip identification, stub loading and flash erase / write / verify.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod chips;
pub mod connection;
pub mod detect;
pub mod flash;
pub mod manifest;
pub mod monitor;
pub mod protocol;
pub mod slip;
pub mod stub;

pub use chips::{ChipDescriptor, KeyBlock, Registry};
pub use connection::Connection;
pub use flash::{FlashOptions, FlashPart, ProgressEvent};
pub use manifest::Manifest;
pub use monitor::{CancelToken, Monitor, MonitorHandle, PortLock};
pub use protocol::Command;
pub use slip::FrameError;
pub use stub::StubImage;

use monitor::Gate;
use protocol::FLASH_SECTOR_SIZE;

/// Byte channel to the device with control over the auto-reset lines.
///
/// RTS drives the chip enable (reset) line and DTR the boot-select strapping
/// pin on the usual USB-UART auto reset circuit.
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;

    fn set_dtr(&mut self, level: bool) -> Result<(), E>;

    /// Reopen the port at a new baud rate
    fn set_baud(&mut self, baud: u32) -> Result<(), E>;

    fn set_control_lines(&mut self, assert_reset: bool, assert_boot_select: bool) -> Result<(), E> {
        self.set_dtr(assert_boot_select)?;
        self.set_rts(assert_reset)
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Identifying,
    RomOnly,
    Stubbed,
    Flashing,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("framing error: {0}")]
    Frame(FrameError),

    #[error("timeout waiting for {0:?} response")]
    Timeout(Command),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{command:?} rejected by device (error 0x{status:02x})")]
    Rejected { command: Command, status: u8 },

    #[error("{command:?} is not available with the {loader} loader")]
    NotAvailable { command: Command, loader: &'static str },

    #[error("unknown chip (magic value 0x{0:08x})")]
    UnknownChip(u32),

    #[error("stub upload failed: {0}")]
    StubUpload(String),

    #[error("flash operation failed: {0}")]
    FlashOp(String),

    #[error("verification failed at 0x{address:08x}: expected {expected}, device reported {actual}")]
    Verify { address: u32, expected: String, actual: String },

    #[error("{operation} is not permitted in state {state:?}")]
    InvalidState { state: State, operation: &'static str },

    #[error("invalid image: {0}")]
    Image(String),

    #[error("transport is owned by another operation")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError: Debug> Error<SerialError> {
    /// Errors after which the device state is unknown and the session must end
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Serial(_) | Error::Frame(_) | Error::Timeout(_) | Error::Cancelled | Error::StubUpload(_)
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the boot pin after releasing reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Number of sync commands sent before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "7"))]
    pub sync_attempts: u32,

    /// Time to wait for each sync response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub sync_timeout_ms: u32,

    /// Number of times a command is sent before reporting a timeout
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub command_attempts: u32,

    /// Baud rate the serial monitor runs at
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "115200"))]
    pub monitor_baud: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: protocol::DEFAULT_TIMEOUT_MS,
            poll_delay_ms: 1,
            init_delay_ms: 50,
            sync_attempts: 7,
            sync_timeout_ms: 50,
            command_attempts: 3,
            monitor_baud: 115_200,
        }
    }
}

/// Bootloader session over one serial port
pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: PortLock<P>,
    delay: D,
    registry: Registry,
    cancel: CancelToken,
    gate: Gate,

    baud: u32,
    chip: Option<ChipDescriptor>,
    stub: bool,
    usb_jtag: bool,
    spi_attached: bool,
    flash_size: Option<u32>,

    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance, the port is expected to be open
    /// at `options.monitor_baud`
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            baud: options.monitor_baud,
            options,
            port: PortLock::new(port),
            delay,
            registry: Registry::builtin(),
            cancel: CancelToken::default(),
            gate: Gate::default(),
            chip: None,
            stub: false,
            usb_jtag: false,
            spi_attached: false,
            flash_size: None,
            _err: PhantomData,
        }
    }

    /// Replace the set of chips identification picks from
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Chip bound by identification
    pub fn chip(&self) -> Option<&ChipDescriptor> {
        self.chip.as_ref()
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Token aborting the running operation at its next response wait
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Passive reader sharing this programmer's port
    pub fn monitor(&self) -> Monitor<P, E> {
        Monitor::new(self.port.clone(), self.gate.clone())
    }

    fn require(&self, allowed: &[State], operation: &'static str) -> Result<State, Error<E>> {
        if allowed.contains(&self.state) {
            Ok(self.state)
        } else {
            Err(Error::InvalidState { state: self.state, operation })
        }
    }

    /// Run `f` with exclusive use of the port
    fn session<R>(
        &mut self,
        f: impl FnOnce(&mut Connection<'_, P, D, E>) -> Result<R, Error<E>>,
    ) -> Result<R, Error<E>> {
        let mut port = self.port.lock();
        let mut conn = Connection::new(&mut *port, &mut self.delay, &self.options, &self.cancel, self.stub, self.baud);

        let r = f(&mut conn);

        self.stub |= conn.is_stub();
        self.baud = conn.baud();
        r
    }

    /// End the session after an error that leaves the device in an unknown state
    fn abort(&mut self, e: &Error<E>) {
        error!("Ending session: {}", e);
        if let Err(e) = self.disconnect() {
            warn!("Reset after failure did not complete: {}", e);
        }
    }

    fn check<R>(&mut self, r: Result<R, Error<E>>) -> Result<R, Error<E>> {
        if let Err(e) = &r {
            if e.is_fatal() {
                self.abort(e);
            }
        }
        r
    }

    /// Reset into the bootloader, sync and identify the chip
    pub fn connect(&mut self, baud: u32) -> Result<ChipDescriptor, Error<E>> {
        self.require(&[State::Disconnected], "connect")?;

        // Monitor must not see protocol traffic
        self.gate.pause();
        self.cancel.reset();

        self.state = State::Identifying;
        self.chip = None;
        self.stub = false;
        self.usb_jtag = false;
        self.spi_attached = false;
        self.flash_size = None;

        let registry = self.registry.clone();
        let reset = !self.options.no_reset;

        let r = self.session(|conn| {
            conn.set_baud(baud)?;
            if reset {
                conn.reset_to_bootloader()?;
            }
            detect::identify(conn, &registry)
        });

        match r {
            Ok((chip, usb_jtag)) => {
                self.chip = Some(chip);
                self.usb_jtag = usb_jtag;
                self.state = State::RomOnly;
                Ok(chip)
            }
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    /// Upload and start the RAM stub
    pub fn load_stub(&mut self, stub: &StubImage) -> Result<(), Error<E>> {
        self.require(&[State::RomOnly], "load_stub")?;

        let r = self.session(|conn| stub::upload(conn, stub));
        let r = self.check(r);

        if r.is_ok() {
            self.state = State::Stubbed;
        }
        r
    }

    /// Run a flash operation, returning to the prior state afterwards
    fn flashing<R>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut Self, ChipDescriptor) -> Result<R, Error<E>>,
    ) -> Result<R, Error<E>> {
        let prior = self.require(&[State::RomOnly, State::Stubbed], operation)?;
        let chip = self.chip.ok_or(Error::InvalidState { state: self.state, operation })?;

        self.state = State::Flashing;
        let r = f(self, chip);
        self.state = prior;

        self.check(r)
    }

    fn ensure_attached(&mut self) -> Result<(), Error<E>> {
        if !self.spi_attached {
            self.session(|conn| conn.spi_attach())?;
            self.spi_attached = true;
        }
        Ok(())
    }

    fn detect_flash_size(&mut self, chip: &ChipDescriptor) -> Result<Option<u32>, Error<E>> {
        if let Some(size) = self.flash_size {
            return Ok(Some(size));
        }

        self.ensure_attached()?;

        let spi = chip.spi;
        let size = self.session(|conn| {
            let id = conn.flash_id(&spi)?;
            let size = flash::size_from_id(id);
            match size {
                Some(s) => {
                    info!("Flash ID 0x{:06x}, {} bytes", id, s);
                    conn.spi_set_params(s)?;
                }
                None => warn!("Could not work out flash size from ID 0x{:06x}", id),
            }
            Ok(size)
        })?;

        self.flash_size = size;
        Ok(size)
    }

    /// Read a device register
    pub fn read_reg(&mut self, addr: u32) -> Result<u32, Error<E>> {
        self.require(&[State::RomOnly, State::Stubbed], "read_reg")?;

        let r = self.session(|conn| conn.read_reg(addr));
        self.check(r)
    }

    /// eFuse key block purposes, and whether flash encryption has a usable key
    pub fn key_info(&mut self) -> Result<(Vec<KeyBlock>, bool), Error<E>> {
        let chip = self.chip.ok_or(Error::InvalidState { state: self.state, operation: "key_info" })?;
        self.require(&[State::RomOnly, State::Stubbed], "key_info")?;

        let r = self.session(|conn| {
            let blocks = chip.key_blocks(conn)?;
            let valid = chip.is_flash_encryption_key_valid(conn)?;
            Ok((blocks, valid))
        });
        self.check(r)
    }

    /// Flash size, detected on first use
    pub fn flash_size(&mut self) -> Result<Option<u32>, Error<E>> {
        let chip = self.chip.ok_or(Error::InvalidState { state: self.state, operation: "flash_size" })?;
        self.require(&[State::RomOnly, State::Stubbed], "flash_size")?;

        let r = self.detect_flash_size(&chip);
        self.check(r)
    }

    /// Erase the whole flash, needs the stub
    pub fn erase_flash(&mut self) -> Result<(), Error<E>> {
        self.flashing("erase_flash", |s, _| {
            s.ensure_attached()?;
            s.session(|conn| flash::erase_all(conn))
        })
    }

    /// Erase a sector aligned region
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error<E>> {
        self.flashing("erase_region", |s, chip| {
            let flash_size = s.detect_flash_size(&chip)?;
            s.session(|conn| flash::erase_region(conn, &chip, flash_size, offset, size))
        })
    }

    /// Erase the sectors touched by `parts`
    pub fn erase_parts(&mut self, parts: &[FlashPart]) -> Result<(), Error<E>> {
        self.flashing("erase_parts", |s, chip| {
            let flash_size = s.detect_flash_size(&chip)?;
            flash::validate(&chip, flash_size, parts)?;

            let mut spans = Vec::with_capacity(parts.len());
            for p in parts {
                let span = flash::sector_span(p.offset, p.data.len() as u32, FLASH_SECTOR_SIZE)
                    .ok_or_else(|| Error::Image(format!("part at 0x{:08x} overflows the address space", p.offset)))?;
                spans.push(span);
            }

            s.session(|conn| {
                for (offset, size) in spans {
                    flash::erase_region(conn, &chip, flash_size, offset, size)?;
                }
                Ok(())
            })
        })
    }

    /// Write and verify `parts`, reporting progress per block
    pub fn write_flash<F>(&mut self, parts: &[FlashPart], opts: &FlashOptions, mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(ProgressEvent),
    {
        self.flashing("write_flash", |s, chip| {
            let size = s.detect_flash_size(&chip)?;
            s.session(|conn| flash::write(conn, &chip, size, parts, opts, &mut progress))
        })
    }

    /// Switch baud rate on both ends.
    ///
    /// While disconnected this only changes the monitor's rate.
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error<E>> {
        match self.state {
            State::Disconnected => {
                self.port.lock().set_baud(baud)?;
                self.baud = baud;
                self.options.monitor_baud = baud;
                Ok(())
            }
            State::RomOnly | State::Stubbed => {
                let chip = self.chip;
                let r = self.session(|conn| {
                    if let Some(chip) = chip {
                        detect::check_rom_crystal(conn, &chip)?;
                    }
                    conn.change_baud(baud)
                });
                self.check(r)
            }
            state => Err(Error::InvalidState { state, operation: "change_baud" }),
        }
    }

    /// Reset the chip into its application
    pub fn hard_reset(&mut self) -> Result<(), Error<E>> {
        let watchdog = match (self.state, self.chip) {
            (State::RomOnly, Some(c)) | (State::Stubbed, Some(c)) if self.usb_jtag => Some(c),
            _ => None,
        };

        self.session(|conn| {
            if let Some(chip) = watchdog {
                match chip.watchdog_reset(conn) {
                    Ok(true) => {
                        conn.delay_ms(50);
                        return Ok(());
                    }
                    Ok(false) => (),
                    Err(e) => warn!("Watchdog reset failed ({}), using control lines", e),
                }
            }
            conn.reset_to_run()
        })
    }

    /// Reset the device, return the port to the monitor rate and release it
    pub fn disconnect(&mut self) -> Result<(), Error<E>> {
        let reset = self.hard_reset();

        self.state = State::Disconnected;
        self.chip = None;
        self.stub = false;
        self.usb_jtag = false;
        self.spi_attached = false;
        self.flash_size = None;

        let monitor_baud = self.options.monitor_baud;
        let reopen = self.port.lock().set_baud(monitor_baud).map_err(Error::from);
        self.baud = monitor_baud;

        self.gate.resume();
        info!("Disconnected");

        reset.and(reopen)
    }
}
