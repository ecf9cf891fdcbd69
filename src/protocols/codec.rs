// src/protocols/codec.rs - Stream framing for BF-2300 frames
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::frame::{Frame, FRAME_LEN};
use crate::error::{MonitorError, Result};

/// Splits a byte stream into fixed-size frames.
///
/// Used with [`tokio_util::codec::Framed`] on both ends of the connection
/// (the engine's client and the simulator).
#[derive(Debug, Default, Clone, Copy)]
pub struct Bf2300Codec;

impl Decoder for Bf2300Codec {
    type Item = Frame;
    type Error = MonitorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }
        let raw = src.split_to(FRAME_LEN);
        let frame = Frame::decode(&raw)?;
        trace!(command = frame.command.code(), "decoded frame");
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for Bf2300Codec {
    type Error = MonitorError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(&frame.to_bytes());
        Ok(())
    }
}
