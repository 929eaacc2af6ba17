//! Frame codec: 1-byte tag, LEB128 varint payload length, bincode payload.
//!
//! `decode_frame` is incremental: it reports how many bytes it consumed and
//! returns `None` when the buffer does not yet hold a whole frame, so the
//! connection read loop can feed it straight from the socket buffer.

use crate::error::ProtoError;
use crate::messages::NodeMsg;

/// Hard cap on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted varint encoding (enough for `MAX_FRAME_SIZE`).
const MAX_VARINT_BYTES: usize = 5;

/// Append a LEB128 varint to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read a LEB128 varint. Returns `(value, bytes_consumed)`, or `None` when
/// `buf` ends mid-varint.
pub fn read_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, ProtoError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(ProtoError::BadVarint);
        }
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(ProtoError::BadVarint);
    }
    Ok(None)
}

/// Encode a message into a complete frame.
pub fn encode_frame(msg: &NodeMsg) -> Result<Vec<u8>, ProtoError> {
    let payload = msg.encode_payload()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(msg.tag());
    write_varint(&mut frame, payload.len() as u64);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((msg, consumed)))` for a complete frame, `Ok(None)` when
/// more bytes are needed, and an error for oversized or malformed frames;
/// a decode error is a protocol violation, the connection must be dropped.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(NodeMsg, usize)>, ProtoError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf[0];
    let Some((len, len_bytes)) = read_varint(&buf[1..])? else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(len));
    }
    let header = 1 + len_bytes;
    if buf.len() < header + len {
        return Ok(None);
    }
    let msg = NodeMsg::decode_payload(tag, &buf[header..header + len])?;
    Ok(Some((msg, header + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GetTransaction, HaveTransaction, Ping};
    use mist_types::KernelId;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, 5_000_000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let (back, used) = read_varint(&buf).unwrap().unwrap();
            assert_eq!(back, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn varint_short_buffer_needs_more() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 5_000_000);
        assert!(read_varint(&buf[..1]).unwrap().is_none());
    }

    #[test]
    fn varint_overlong_rejected() {
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(read_varint(&buf).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let msg = NodeMsg::HaveTransaction(HaveTransaction {
            id: KernelId::new([0xAA; 32]),
        });
        let frame = encode_frame(&msg).unwrap();
        let (back, consumed) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(back, msg);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn partial_frame_needs_more() {
        let msg = NodeMsg::GetTransaction(GetTransaction {
            id: KernelId::new([1; 32]),
        });
        let frame = encode_frame(&msg).unwrap();
        for cut in 0..frame.len() {
            assert!(decode_frame(&frame[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = NodeMsg::Ping(Ping);
        let b = NodeMsg::HaveTransaction(HaveTransaction {
            id: KernelId::new([2; 32]),
        });
        let mut buf = encode_frame(&a).unwrap();
        buf.extend(encode_frame(&b).unwrap());

        let (first, used) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, used2) = decode_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, b);
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn oversized_length_rejected_before_body_arrives() {
        let mut buf = vec![0x17]; // Body tag
        write_varint(&mut buf, (MAX_FRAME_SIZE as u64) + 1);
        assert!(matches!(
            decode_frame(&buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn unknown_tag_surfaces() {
        let buf = [0xEEu8, 0x00];
        assert!(matches!(
            decode_frame(&buf),
            Err(ProtoError::UnknownTag(0xEE))
        ));
    }
}
