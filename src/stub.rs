//! RAM stub image and upload.

use core::fmt::Debug;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use embedded_hal::blocking::delay::DelayMs;
use serde::Deserialize;

use crate::protocol::*;
use crate::{Connection, Error, SerialPort};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid stub description: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid segment encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("stub has no text segment")]
    Empty,
}

/// Stub description as shipped with esptool (`stub_flasher_*.json`)
#[derive(Deserialize)]
struct StubJson {
    entry: u32,
    text: String,
    text_start: u32,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    data_start: Option<u32>,
}

/// Second stage loader, placed in RAM and started by the ROM
#[derive(Clone, PartialEq, Debug)]
pub struct StubImage {
    pub entry: u32,
    pub text: Vec<u8>,
    pub text_start: u32,
    pub data: Vec<u8>,
    pub data_start: u32,
}

impl StubImage {
    /// Parse a stub description with base64 encoded segments
    pub fn from_json(s: &str) -> Result<Self, ImageError> {
        let j: StubJson = serde_json::from_str(s)?;

        let text = STANDARD.decode(&j.text)?;
        if text.is_empty() {
            return Err(ImageError::Empty);
        }

        let data = match &j.data {
            Some(d) => STANDARD.decode(d)?,
            None => vec![],
        };

        Ok(Self {
            entry: j.entry,
            text,
            text_start: j.text_start,
            data,
            data_start: j.data_start.unwrap_or(0),
        })
    }

    /// Non-empty `(load address, bytes)` segments in upload order
    pub fn segments(&self) -> Vec<(u32, &[u8])> {
        let mut s = vec![(self.text_start, &self.text[..])];
        if !self.data.is_empty() {
            s.push((self.data_start, &self.data[..]));
        }
        s
    }
}

fn load_segment<P, D, E>(conn: &mut Connection<'_, P, D, E>, addr: u32, data: &[u8]) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    let blocks = (data.len() + RAM_BLOCK_SIZE - 1) / RAM_BLOCK_SIZE;
    debug!("Loading {} bytes to 0x{:08x} in {} block(s)", data.len(), addr, blocks);

    conn.execute_once(
        Command::MemBegin,
        &words(&[data.len() as u32, blocks as u32, RAM_BLOCK_SIZE as u32, addr]),
        DEFAULT_TIMEOUT_MS,
    )?;

    for (seq, chunk) in data.chunks(RAM_BLOCK_SIZE).enumerate() {
        let mut payload = data_header(chunk.len(), seq as u32);
        payload.extend_from_slice(chunk);
        conn.execute_once(Command::MemData, &payload, DEFAULT_TIMEOUT_MS)?;
    }

    Ok(())
}

fn load_and_run<P, D, E>(conn: &mut Connection<'_, P, D, E>, stub: &StubImage) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    for (addr, data) in stub.segments() {
        load_segment(conn, addr, data)?;
    }

    info!("Running stub...");
    // The ROM may jump before answering, the greeting is what counts
    conn.write_command(Command::MemEnd, &words(&[(stub.entry == 0) as u32, stub.entry]))?;

    if !conn.wait_frame(STUB_GREETING, STUB_GREETING_TIMEOUT_MS)? {
        return Err(Error::StubUpload("no greeting from stub".to_string()));
    }
    Ok(())
}

/// Upload `stub` through the ROM loader and wait for it to report in.
///
/// Nothing is retried: a failure leaves RAM half written and the caller has
/// to start over from a fresh sync.
pub fn upload<P, D, E>(conn: &mut Connection<'_, P, D, E>, stub: &StubImage) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    if conn.is_stub() {
        info!("Stub already running");
        return Ok(());
    }

    info!("Uploading stub...");

    match load_and_run(conn, stub) {
        Ok(()) => {
            conn.set_stub();
            info!("Stub running");
            Ok(())
        }
        Err(e @ Error::Cancelled) | Err(e @ Error::Serial(_)) | Err(e @ Error::StubUpload(_)) => Err(e),
        Err(e) => Err(Error::StubUpload(e.to_string())),
    }
}
