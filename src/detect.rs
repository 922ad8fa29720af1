//! Chip identification.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::chips::{ChipDescriptor, Registry};
use crate::protocol::CHIP_DETECT_MAGIC_REG;
use crate::{Connection, Error, SerialPort};

/// Sync with the loader and bind the chip answering it.
///
/// Returns the descriptor and whether the link runs over the chip's built-in
/// USB-JTAG-serial controller.
pub fn identify<P, D, E>(
    conn: &mut Connection<'_, P, D, E>,
    registry: &Registry,
) -> Result<(ChipDescriptor, bool), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    conn.sync()?;

    let magic = conn.read_reg(CHIP_DETECT_MAGIC_REG)?;
    debug!("Chip magic value 0x{:08x}", magic);

    let chip = *registry.lookup(magic).ok_or(Error::UnknownChip(magic))?;

    let description = chip.description(conn)?;
    info!("Chip is {}", description);
    if !chip.features.is_empty() {
        info!("Features: {}", chip.features.join(", "));
    }

    let baud = conn.baud();
    let xtal = chip.crystal_freq(conn, baud)?;
    info!("Crystal is {}MHz", xtal);

    let usb_jtag = chip.uses_usb_jtag_serial(conn)?;
    if usb_jtag {
        debug!("Connected over USB-JTAG-serial");
    }

    Ok((chip, usb_jtag))
}

/// Compare the crystal the ROM was set up for with the one fitted.
///
/// A mismatch makes the ROM compute baud rate dividers from the wrong clock.
/// Correcting for it is not supported, only reported.
pub fn check_rom_crystal<P, D, E>(conn: &mut Connection<'_, P, D, E>, chip: &ChipDescriptor) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    if conn.is_stub() {
        return Ok(());
    }

    let expected = match chip.rom_expected_crystal_freq(conn)? {
        Some(f) => f,
        None => return Ok(()),
    };

    let baud = conn.baud();
    let actual = chip.crystal_freq(conn, baud)?;
    debug!("ROM expects {}MHz crystal, detected {}MHz", expected, actual);

    if expected != actual {
        warn!(
            "ROM configured for a {}MHz crystal but {}MHz is fitted, baud rate correction is not implemented",
            expected, actual
        );
    }
    Ok(())
}
