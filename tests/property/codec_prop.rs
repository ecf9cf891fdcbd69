use boxwatch::protocols::{decode, encode, AutoReport, Bf2300Codec, Command, Frame, BLOCK_LEN, FRAME_LEN};
use boxwatch::FrameError;
use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Decoder;

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::ReadDigitalIo),
        Just(Command::AutoReport),
        any::<u16>().prop_map(Command::from_code),
    ]
}

fn block() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=BLOCK_LEN)
}

fn padded(data: &[u8]) -> [u8; BLOCK_LEN] {
    let mut out = [0u8; BLOCK_LEN];
    out[..data.len()].copy_from_slice(data);
    out
}

proptest! {
    #[test]
    fn test_decode_inverts_encode(cmd in command(), d1 in block(), d2 in block()) {
        let bytes = encode(cmd, &d1, &d2).unwrap();
        prop_assert_eq!(bytes.len(), FRAME_LEN);

        let frame = decode(&bytes).unwrap();
        prop_assert_eq!(frame.command, cmd);
        prop_assert_eq!(frame.data1, padded(&d1));
        prop_assert_eq!(frame.data2, padded(&d2));
    }

    #[test]
    fn test_any_single_byte_change_is_rejected(
        cmd in command(),
        d1 in block(),
        d2 in block(),
        index in 0..FRAME_LEN,
        delta in 1u8..=255,
    ) {
        let mut bytes = encode(cmd, &d1, &d2).unwrap();
        bytes[index] = bytes[index].wrapping_add(delta);
        prop_assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_frames_rejected(len in 0..FRAME_LEN) {
        let bytes = Frame::read_digital_io().to_bytes();
        prop_assert_eq!(
            decode(&bytes[..len]),
            Err(FrameError::TooShort { len, expected: FRAME_LEN })
        );
    }

    #[test]
    fn test_codec_reassembles_arbitrary_splits(
        inputs in prop::collection::vec(any::<bool>(), 0..=BLOCK_LEN),
        split in 1..FRAME_LEN,
    ) {
        let bytes = Frame::auto_report(&inputs, &[]).to_bytes();
        let mut codec = Bf2300Codec;
        let mut buf = BytesMut::from(&bytes[..split]);
        prop_assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[split..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let report = AutoReport::from_frame(&frame).unwrap();
        for (i, level) in inputs.iter().enumerate() {
            prop_assert_eq!(report.input((i + 1) as u8), Some(*level));
        }
    }
}
