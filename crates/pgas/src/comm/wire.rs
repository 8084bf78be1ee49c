//! Wire Format - Frame Codec for the Message Engine
//!
//! Every frame is little-endian: a 24-byte header, a fixed 32-byte body,
//! and an optional trailing payload.
//!
//! ```text
//! header:  u32 msg_type | u32 msg_len | u16 src | u16 dst | u64 request_id
//! body:    ptr {u16 node, u16 segment, u32 flags, u64 offset} | u64 size | u64 value
//! payload: msg_len - 56 bytes (PUT requests and GET responses)
//! ```
//!
//! `msg_len` counts the whole frame including the header. For CAS the
//! `value` field carries the expected word and `size` carries the desired
//! word; the serializer preserves that layout exactly.
//!
//! A connection is prefixed by a bare little-endian `u32` carrying the
//! initiator's node id: four raw bytes, no header, no framing.

use crate::ptr::GlobalPtr;
use std::io::{self, Read, Write};

/// Header length in bytes
pub const HEADER_LEN: usize = 24;
/// Fixed body length in bytes
pub const BODY_LEN: usize = 32;
/// Header plus body
pub const FIXED_LEN: usize = HEADER_LEN + BODY_LEN;
/// Upper bound on trailing payload accepted from a peer
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Message kinds carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Get = 1,
    Put = 2,
    GetResp = 3,
    PutResp = 4,
    AtomicFaa = 5,
    AtomicCas = 6,
    AtomicResp = 7,
    Barrier = 8,
    BarrierResp = 9,
    Alloc = 10,
    AllocResp = 11,
    Free = 12,
}

impl MsgType {
    pub fn from_u32(value: u32) -> Option<MsgType> {
        Some(match value {
            1 => MsgType::Get,
            2 => MsgType::Put,
            3 => MsgType::GetResp,
            4 => MsgType::PutResp,
            5 => MsgType::AtomicFaa,
            6 => MsgType::AtomicCas,
            7 => MsgType::AtomicResp,
            8 => MsgType::Barrier,
            9 => MsgType::BarrierResp,
            10 => MsgType::Alloc,
            11 => MsgType::AllocResp,
            12 => MsgType::Free,
            _ => return None,
        })
    }
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub src: u16,
    pub dst: u16,
    pub request_id: u64,
    pub ptr: GlobalPtr,
    pub size: u64,
    pub value: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame with a null pointer and zeroed operands
    pub fn new(msg_type: MsgType, src: u16, dst: u16, request_id: u64) -> Self {
        Self {
            msg_type,
            src,
            dst,
            request_id,
            ptr: GlobalPtr::null(),
            size: 0,
            value: 0,
            payload: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + self.payload.len()
    }

    /// Serialize into a single contiguous buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.msg_type as u32).to_le_bytes());
        buf.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.src.to_le_bytes());
        buf.extend_from_slice(&self.dst.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());

        buf.extend_from_slice(&self.ptr.node_id.to_le_bytes());
        buf.extend_from_slice(&self.ptr.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.ptr.flags.to_le_bytes());
        buf.extend_from_slice(&self.ptr.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());

        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one frame, including its payload
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut fixed = [0u8; FIXED_LEN];
    reader.read_exact(&mut fixed)?;

    let msg_type_raw = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
    let msg_type = MsgType::from_u32(msg_type_raw).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown message type {}", msg_type_raw),
        )
    })?;
    let msg_len = u32::from_le_bytes(fixed[4..8].try_into().unwrap()) as usize;
    if msg_len < FIXED_LEN || msg_len > FIXED_LEN + MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {}", msg_len),
        ));
    }

    let mut payload = vec![0u8; msg_len - FIXED_LEN];
    reader.read_exact(&mut payload)?;

    Ok(Frame {
        msg_type,
        src: u16::from_le_bytes(fixed[8..10].try_into().unwrap()),
        dst: u16::from_le_bytes(fixed[10..12].try_into().unwrap()),
        request_id: u64::from_le_bytes(fixed[16..24].try_into().unwrap()),
        ptr: GlobalPtr {
            node_id: u16::from_le_bytes(fixed[24..26].try_into().unwrap()),
            segment_id: u16::from_le_bytes(fixed[26..28].try_into().unwrap()),
            flags: u32::from_le_bytes(fixed[28..32].try_into().unwrap()),
            offset: u64::from_le_bytes(fixed[32..40].try_into().unwrap()),
        },
        size: u64::from_le_bytes(fixed[40..48].try_into().unwrap()),
        value: u64::from_le_bytes(fixed[48..56].try_into().unwrap()),
        payload,
    })
}

/// Write one frame as a single buffer
///
/// A single `write_all` keeps the frame contiguous on the socket while the
/// caller holds the send lock.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(MsgType::Barrier, 1, 2, 77);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FIXED_LEN);
        assert_eq!(&bytes[0..4], &8u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(FIXED_LEN as u32).to_le_bytes());
        assert_eq!(&bytes[8..10], &1u16.to_le_bytes());
        assert_eq!(&bytes[10..12], &2u16.to_le_bytes());
        assert_eq!(&bytes[16..24], &77u64.to_le_bytes());
    }

    #[test]
    fn test_put_frame_roundtrip() {
        let mut frame = Frame::new(MsgType::Put, 0, 1, 42);
        frame.ptr = GlobalPtr::new(1, 0x1234);
        frame.size = 4;
        frame.payload = vec![0xDE, 0xAD, 0xBE, 0xEF];

        let mut cursor = Cursor::new(frame.encode());
        let decoded = read_frame(&mut cursor).unwrap();

        assert_eq!(decoded.msg_type, MsgType::Put);
        assert_eq!(decoded.ptr, frame.ptr);
        assert_eq!(decoded.size, 4);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_cas_field_reuse_survives_the_wire() {
        let mut frame = Frame::new(MsgType::AtomicCas, 0, 1, 1);
        frame.value = 111; // expected
        frame.size = 222; // desired travels in the size field

        let mut cursor = Cursor::new(frame.encode());
        let decoded = read_frame(&mut cursor).unwrap();
        assert_eq!(decoded.value, 111);
        assert_eq!(decoded.size, 222);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = Frame::new(MsgType::Get, 0, 1, 1).encode();
        frame[0] = 0xFF;
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_bad_length_rejected() {
        let mut frame = Frame::new(MsgType::Get, 0, 1, 1).encode();
        frame[4..8].copy_from_slice(&10u32.to_le_bytes());
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut frame = Frame::new(MsgType::Get, 0, 1, 1).encode();
        frame[4..8].copy_from_slice(&(u32::MAX).to_le_bytes());
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame() {
        let frame = Frame::new(MsgType::Get, 0, 1, 1).encode();
        let err = read_frame(&mut Cursor::new(&frame[..FIXED_LEN - 1])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut bytes = Frame::new(MsgType::Barrier, 0, 1, 1).encode();
        let mut put = Frame::new(MsgType::Put, 0, 1, 2);
        put.size = 2;
        put.payload = vec![9, 9];
        bytes.extend_from_slice(&put.encode());

        let mut cursor = Cursor::new(bytes);
        assert_eq!(read_frame(&mut cursor).unwrap().msg_type, MsgType::Barrier);
        let second = read_frame(&mut cursor).unwrap();
        assert_eq!(second.msg_type, MsgType::Put);
        assert_eq!(second.payload, vec![9, 9]);
    }
}
