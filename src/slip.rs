//! SLIP framing and packet encoding for the ESP bootloader.
//!
//! Each packet travels between two `0xC0` delimiters. `0xC0` and `0xDB`
//! inside the packet are escaped as `0xDB 0xDC` and `0xDB 0xDD`.

use crate::protocol::{Command, CHECKSUM_SEED, DIR_REQUEST, DIR_RESPONSE};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Length of the request / response header
pub const HEADER_LEN: usize = 8;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid escape sequence 0xdb 0x{0:02x}")]
    InvalidEscape(u8),

    #[error("length mismatch (header {expected}, received {actual})")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("frame terminated before the header was complete ({0} bytes)")]
    Truncated(usize),

    #[error("unexpected direction byte 0x{0:02x}")]
    Direction(u8),

    #[error("no complete frame in input")]
    Incomplete,
}

/// Decoded request packet
#[derive(Clone, PartialEq, Debug)]
pub struct Packet {
    pub command: u8,
    pub payload: Vec<u8>,
    pub checksum_ok: bool,
}

/// Decoded response packet, status trailer still attached to `data`
#[derive(Clone, PartialEq, Debug)]
pub struct Response {
    pub command: u8,
    pub value: u32,
    pub data: Vec<u8>,
}

/// XOR checksum over `data` starting at `seed`
pub fn checksum_with(seed: u8, data: &[u8]) -> u32 {
    data.iter().fold(seed, |acc, b| acc ^ b) as u32
}

/// Checksum field for a request payload.
///
/// Data commands are checked by the device over the bytes following the 16 byte
/// block header, seeded with `0xEF`. Other commands are not checked by the device,
/// we still fill the field (seed 0, whole payload) so a corrupted frame is visible.
pub fn checksum(command: Command, payload: &[u8]) -> u32 {
    if command.is_data() {
        checksum_with(CHECKSUM_SEED, payload.get(16..).unwrap_or(&[]))
    } else {
        checksum_with(0, payload)
    }
}

/// Escape and delimit a raw packet
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2 + data.len() / 16);
    out.push(END);
    for b in data {
        match *b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            v => out.push(v),
        }
    }
    out.push(END);
    out
}

/// Encode a request packet into a complete SLIP frame
pub fn encode(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
    raw.push(DIR_REQUEST);
    raw.push(command as u8);
    raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    raw.extend_from_slice(&checksum(command, payload).to_le_bytes());
    raw.extend_from_slice(payload);
    encode_frame(&raw)
}

/// Encode a response packet (used by device doubles)
pub fn encode_response(command: u8, value: u32, data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_LEN + data.len());
    raw.push(DIR_RESPONSE);
    raw.push(command);
    raw.extend_from_slice(&(data.len() as u16).to_le_bytes());
    raw.extend_from_slice(&value.to_le_bytes());
    raw.extend_from_slice(data);
    encode_frame(&raw)
}

fn split_header(frame: &[u8], direction: u8) -> Result<(u8, u32, &[u8]), FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    if frame[0] != direction {
        return Err(FrameError::Direction(frame[0]));
    }
    let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    let field = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let body = &frame[HEADER_LEN..];
    if body.len() != len {
        return Err(FrameError::LengthMismatch { expected: len, actual: body.len() });
    }
    Ok((frame[1], field, body))
}

/// Parse an unescaped request frame
pub fn parse_request(frame: &[u8]) -> Result<Packet, FrameError> {
    let (command, field, payload) = split_header(frame, DIR_REQUEST)?;

    let checksum_ok = match Command::from_u8(command) {
        Some(c) if c.is_data() => {
            // Block header length must match the data that follows it and the
            // padding words must be zero. The sequence number is not covered.
            let declared = payload
                .get(..4)
                .map(|l| u32::from_le_bytes([l[0], l[1], l[2], l[3]]) as usize);
            let padding_clear = payload.get(8..16).map_or(false, |p| p.iter().all(|b| *b == 0));
            declared == Some(payload.len().saturating_sub(16)) && padding_clear && checksum(c, payload) == field
        }
        Some(c) => checksum(c, payload) == field,
        None => checksum_with(0, payload) == field,
    };

    Ok(Packet { command, payload: payload.to_vec(), checksum_ok })
}

/// Parse an unescaped response frame
pub fn parse_response(frame: &[u8]) -> Result<Response, FrameError> {
    let (command, value, data) = split_header(frame, DIR_RESPONSE)?;
    Ok(Response { command, value, data: data.to_vec() })
}

/// Decode the first request found in a raw byte stream
pub fn decode(stream: &[u8]) -> Result<Packet, FrameError> {
    let mut d = Decoder::new();
    for b in stream {
        if let Some(frame) = d.push(*b) {
            return parse_request(&frame?);
        }
    }
    Err(FrameError::Incomplete)
}

/// Incremental SLIP decoder.
///
/// Bytes outside a frame are dropped, and a malformed frame is reported once
/// its closing delimiter arrives so the stream resynchronises on the next one.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    error: Option<FrameError>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.escaped = false;
        self.error = None;
    }

    /// Feed a byte, returning a frame once one is complete
    pub fn push(&mut self, b: u8) -> Option<Result<Vec<u8>, FrameError>> {
        if b == END {
            if self.escaped {
                self.error.get_or_insert(FrameError::InvalidEscape(END));
            }
            let had_data = !self.buf.is_empty() || self.error.is_some();
            let out = match self.error.take() {
                Some(e) => Err(e),
                None => Ok(core::mem::take(&mut self.buf)),
            };
            self.buf.clear();
            self.escaped = false;

            // Back to back delimiters open a new frame
            self.in_frame = true;
            return if had_data { Some(out) } else { None };
        }

        if !self.in_frame {
            trace!("Discarding 0x{:02x} outside frame", b);
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match b {
                ESC_END => self.buf.push(END),
                ESC_ESC => self.buf.push(ESC),
                v => {
                    self.error.get_or_insert(FrameError::InvalidEscape(v));
                }
            }
        } else if b == ESC {
            self.escaped = true;
        } else {
            self.buf.push(b);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(bytes: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        let mut d = Decoder::new();
        bytes.iter().filter_map(|b| d.push(*b)).collect()
    }

    #[test]
    fn escapes_delimiter_and_escape() {
        let f = encode_frame(&[0x01, END, 0x02, ESC, 0x03]);
        assert_eq!(f, vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]);
    }

    #[test]
    fn round_trip_with_special_bytes() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![END, END, ESC, ESC],
            (0..=255u8).collect(),
            vec![ESC, ESC_END, END, ESC_ESC],
        ];

        for p in payloads {
            let frame = encode(Command::WriteReg, &p);
            let pkt = decode(&frame).unwrap();
            assert_eq!(pkt.command, Command::WriteReg as u8);
            assert_eq!(pkt.payload, p);
            assert!(pkt.checksum_ok);
        }
    }

    #[test]
    fn data_command_checksum() {
        let data = [0x01u8, 0x02, 0x03];
        let mut payload = crate::protocol::data_header(data.len(), 0);
        payload.extend_from_slice(&data);

        assert_eq!(checksum(Command::FlashData, &payload), (0xEF ^ 0x01 ^ 0x02 ^ 0x03) as u32);

        let pkt = decode(&encode(Command::FlashData, &payload)).unwrap();
        assert!(pkt.checksum_ok);
    }

    #[test]
    fn single_byte_flip_breaks_checksum() {
        let data: Vec<u8> = (0..64u8).collect();
        let mut payload = crate::protocol::data_header(data.len(), 3);
        payload.extend_from_slice(&data);

        let mut raw = vec![DIR_REQUEST, Command::MemData as u8];
        raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        raw.extend_from_slice(&checksum(Command::MemData, &payload).to_le_bytes());
        raw.extend_from_slice(&payload);

        // Block header bytes 4..8 carry the sequence number, which no check covers
        let sequence = (HEADER_LEN + 4)..(HEADER_LEN + 8);
        for i in (HEADER_LEN..raw.len()).filter(|i| !sequence.contains(i)) {
            for flip in &[0x01u8, 0x80, 0xFF] {
                let mut bad = raw.clone();
                bad[i] ^= flip;
                let pkt = parse_request(&bad).unwrap();
                assert!(!pkt.checksum_ok, "flip at {} not detected", i);
            }
        }

        for i in sequence {
            let mut bad = raw.clone();
            bad[i] ^= 0x01;
            assert!(parse_request(&bad).unwrap().checksum_ok);
        }

        let payload = [0x10u8, 0x20, 0x30, 0x40];
        let frame = encode(Command::ReadReg, &payload);
        let mut raw = frames(&frame).remove(0).unwrap();
        for i in HEADER_LEN..raw.len() {
            raw[i] ^= 0x04;
            assert!(!parse_request(&raw).unwrap().checksum_ok);
            raw[i] ^= 0x04;
        }
    }

    #[test]
    fn decoder_resynchronises_after_bad_escape() {
        let mut stream = vec![0x11, 0x22, END, 0x01, ESC, 0x42, 0x02, END];
        stream.extend(encode_response(0x0A, 7, &[0, 0, 0, 0]));

        let out = frames(&stream);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Err(FrameError::InvalidEscape(0x42)));

        let r = parse_response(out[1].as_ref().unwrap()).unwrap();
        assert_eq!(r.command, 0x0A);
        assert_eq!(r.value, 7);
    }

    #[test]
    fn truncated_and_mismatched_frames() {
        assert_eq!(parse_request(&[0x00, 0x08, 0x04]), Err(FrameError::Truncated(3)));

        let mut raw = vec![DIR_REQUEST, 0x08, 0x05, 0x00, 0, 0, 0, 0];
        raw.extend_from_slice(&[1, 2]);
        assert_eq!(
            parse_request(&raw),
            Err(FrameError::LengthMismatch { expected: 5, actual: 2 })
        );

        assert_eq!(decode(&[END, 0x00, 0x08]), Err(FrameError::Incomplete));
    }
}
