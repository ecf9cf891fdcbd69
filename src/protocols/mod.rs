// src/protocols/mod.rs - BF-2300 wire protocol
//!
//! The box protocol is a request/response exchange of fixed 71-byte frames.
//! [`frame`] holds the pure encode/decode logic; [`codec`] adapts it to
//! `tokio_util` framed streams.
//!
//! # Examples
//!
//! ```rust
//! use boxwatch::protocols::{decode, Command, Frame};
//!
//! let request = Frame::read_digital_io().to_bytes();
//! let frame = decode(&request)?;
//! assert_eq!(frame.command, Command::ReadDigitalIo);
//! # Ok::<(), boxwatch::FrameError>(())
//! ```

pub mod codec;
pub mod frame;

pub use codec::Bf2300Codec;
pub use frame::{
    checksum, decode, encode, AutoReport, Command, Frame, BLOCK_LEN, FRAME_LEN, MARKER,
};
