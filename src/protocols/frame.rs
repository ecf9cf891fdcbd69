//! BF-2300 fixed-length frame format
//!
//! Every message on the wire is exactly [`FRAME_LEN`] bytes:
//!
//! ```text
//! offset  size  field
//!      0     2  start marker 0xF0F0
//!      2     2  command code (big-endian)
//!      4    32  Data1
//!     36    32  Data2
//!     68     2  end marker 0xF0F0
//!     70     1  checksum = sum(bytes[0..70]) mod 256
//! ```
//!
//! Everything in this module is pure: encoding and decoding never touch
//! external state.

use crate::error::{FrameError, MonitorError};

/// Total size of one frame on the wire
pub const FRAME_LEN: usize = 71;

/// Size of each of the two payload blocks
pub const BLOCK_LEN: usize = 32;

/// Start and end marker value
pub const MARKER: u16 = 0xF0F0;

const COMMAND_OFFSET: usize = 2;
const DATA1_OFFSET: usize = 4;
const DATA2_OFFSET: usize = DATA1_OFFSET + BLOCK_LEN;
const END_OFFSET: usize = DATA2_OFFSET + BLOCK_LEN;
const CHECKSUM_OFFSET: usize = END_OFFSET + 2;

/// Application command carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `0x0001` - request the current digital I/O levels (empty payload)
    ReadDigitalIo,
    /// `0x0010` - Data1 = input levels, Data2 = output levels, one byte per pin
    AutoReport,
    /// Any other code; a valid frame, but nothing this engine consumes
    Other(u16),
}

impl Command {
    pub const READ_DIGITAL_IO: u16 = 0x0001;
    pub const AUTO_REPORT: u16 = 0x0010;

    pub const fn code(self) -> u16 {
        match self {
            Command::ReadDigitalIo => Self::READ_DIGITAL_IO,
            Command::AutoReport => Self::AUTO_REPORT,
            Command::Other(code) => code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            Self::READ_DIGITAL_IO => Command::ReadDigitalIo,
            Self::AUTO_REPORT => Command::AutoReport,
            other => Command::Other(other),
        }
    }
}

impl From<u16> for Command {
    fn from(code: u16) -> Self {
        Command::from_code(code)
    }
}

/// A decoded frame. Payload blocks are always full width, zero padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub data1: [u8; BLOCK_LEN],
    pub data2: [u8; BLOCK_LEN],
}

impl Frame {
    /// Build a frame, zero padding short payload blocks.
    ///
    /// Blocks longer than [`BLOCK_LEN`] are a caller error.
    pub fn new(command: Command, data1: &[u8], data2: &[u8]) -> Result<Self, FrameError> {
        Ok(Self {
            command,
            data1: pad_block(data1)?,
            data2: pad_block(data2)?,
        })
    }

    /// The Read Digital I/O request sent every poll cycle
    pub fn read_digital_io() -> Self {
        Self {
            command: Command::ReadDigitalIo,
            data1: [0; BLOCK_LEN],
            data2: [0; BLOCK_LEN],
        }
    }

    /// Auto Report response with one byte (0/1) per pin; extra levels are ignored.
    pub fn auto_report(inputs: &[bool], outputs: &[bool]) -> Self {
        Self {
            command: Command::AutoReport,
            data1: levels_to_block(inputs),
            data2: levels_to_block(outputs),
        }
    }

    /// Serialize into exactly one wire frame with a correct checksum.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..COMMAND_OFFSET].copy_from_slice(&MARKER.to_be_bytes());
        buf[COMMAND_OFFSET..DATA1_OFFSET].copy_from_slice(&self.command.code().to_be_bytes());
        buf[DATA1_OFFSET..DATA2_OFFSET].copy_from_slice(&self.data1);
        buf[DATA2_OFFSET..END_OFFSET].copy_from_slice(&self.data2);
        buf[END_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&MARKER.to_be_bytes());
        buf[CHECKSUM_OFFSET] = checksum(&buf[..CHECKSUM_OFFSET]);
        buf
    }

    /// Parse the first [`FRAME_LEN`] bytes of `bytes`.
    ///
    /// Fails on short input, bad markers or a checksum mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                expected: FRAME_LEN,
            });
        }
        let bytes = &bytes[..FRAME_LEN];

        let start = u16::from_be_bytes([bytes[0], bytes[1]]);
        if start != MARKER {
            return Err(FrameError::BadStartMarker(start));
        }
        let end = u16::from_be_bytes([bytes[END_OFFSET], bytes[END_OFFSET + 1]]);
        if end != MARKER {
            return Err(FrameError::BadEndMarker(end));
        }
        let computed = checksum(&bytes[..CHECKSUM_OFFSET]);
        let found = bytes[CHECKSUM_OFFSET];
        if computed != found {
            return Err(FrameError::Checksum { found, computed });
        }

        let command = u16::from_be_bytes([bytes[COMMAND_OFFSET], bytes[COMMAND_OFFSET + 1]]);
        let mut data1 = [0u8; BLOCK_LEN];
        let mut data2 = [0u8; BLOCK_LEN];
        data1.copy_from_slice(&bytes[DATA1_OFFSET..DATA2_OFFSET]);
        data2.copy_from_slice(&bytes[DATA2_OFFSET..END_OFFSET]);

        Ok(Self {
            command: Command::from_code(command),
            data1,
            data2,
        })
    }
}

/// Encode a frame straight from raw parts.
pub fn encode(command: Command, data1: &[u8], data2: &[u8]) -> Result<[u8; FRAME_LEN], FrameError> {
    Frame::new(command, data1, data2).map(|frame| frame.to_bytes())
}

/// Decode a frame from raw bytes. See [`Frame::decode`].
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    Frame::decode(bytes)
}

/// Sum of all bytes modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn pad_block(data: &[u8]) -> Result<[u8; BLOCK_LEN], FrameError> {
    if data.len() > BLOCK_LEN {
        return Err(FrameError::PayloadTooLong {
            len: data.len(),
            max: BLOCK_LEN,
        });
    }
    let mut block = [0u8; BLOCK_LEN];
    block[..data.len()].copy_from_slice(data);
    Ok(block)
}

fn levels_to_block(levels: &[bool]) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    for (slot, level) in block.iter_mut().zip(levels) {
        *slot = u8::from(*level);
    }
    block
}

/// Pin levels carried by an Auto Report (`0x0010`) response.
///
/// Pins are numbered from 1; `inputs[0]` is pin 1. Any non-zero byte reads as
/// a high level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoReport {
    pub inputs: [bool; BLOCK_LEN],
    /// Output pin levels; carried along but not used for alarm derivation
    pub outputs: [bool; BLOCK_LEN],
}

impl AutoReport {
    /// Interpret a frame as an Auto Report, rejecting any other command.
    pub fn from_frame(frame: &Frame) -> Result<Self, MonitorError> {
        if frame.command != Command::AutoReport {
            return Err(MonitorError::UnknownCommand(frame.command.code()));
        }
        Ok(Self {
            inputs: frame.data1.map(|b| b != 0),
            outputs: frame.data2.map(|b| b != 0),
        })
    }

    /// Level of a 1-based input pin, `None` outside 1..=32.
    pub fn input(&self, pin: u8) -> Option<bool> {
        let index = usize::from(pin).checked_sub(1)?;
        self.inputs.get(index).copied()
    }

    /// `(pin, level)` for the first `count` input pins (capped at 32).
    pub fn input_levels(&self, count: u8) -> impl Iterator<Item = (u8, bool)> + '_ {
        let count = usize::from(count).min(BLOCK_LEN);
        self.inputs[..count]
            .iter()
            .enumerate()
            .map(|(i, level)| ((i + 1) as u8, *level))
    }
}
