//! Length-prefixed message framing
//!
//! Each message on a stream is carried as a 1-byte flag (bit 0 =
//! compressed), a 4-byte big-endian length and the payload. Messages are
//! independent of DATA frame boundaries in both directions.

use super::error::{ErrorCode, H2Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Size of the per-message prefix
pub const MESSAGE_HEADER_SIZE: usize = 5;

const FLAG_COMPRESSED: u8 = 0x1;

/// One application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub compressed: bool,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Message {
            payload: payload.into(),
            compressed: false,
        }
    }

    pub fn compressed(payload: impl Into<Bytes>) -> Self {
        Message {
            payload: payload.into(),
            compressed: true,
        }
    }

    /// Bytes this message occupies on the wire
    pub fn wire_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Prefix plus payload
    pub fn encode(&self) -> Result<Bytes> {
        let len = encoded_message_len(self.payload.len())?;
        let mut out = BytesMut::with_capacity(self.wire_len());
        out.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        out.put_u32(len);
        out.extend_from_slice(&self.payload);
        Ok(out.freeze())
    }
}

/// Length field for a payload of `len` bytes. Payloads the 4-byte field
/// cannot express are refused.
pub fn encoded_message_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        H2Error::internal(format!(
            "message payload of {} bytes exceeds the {} byte framing limit",
            len,
            u32::MAX
        ))
    })
}

/// Reassembles messages from DATA frame payloads
#[derive(Debug)]
pub struct MessageAssembler {
    stream_id: u32,
    buffer: BytesMut,
    end_stream: bool,
}

impl MessageAssembler {
    pub fn new(stream_id: u32) -> Self {
        MessageAssembler {
            stream_id,
            buffer: BytesMut::new(),
            end_stream: false,
        }
    }

    /// Buffer the payload of one DATA frame
    pub fn append_new_data_frame(&mut self, payload: Bytes, is_end_stream: bool) -> Result<()> {
        self.buffer
            .len()
            .checked_add(payload.len())
            .ok_or_else(|| H2Error::internal("message buffer length overflow"))?;
        self.buffer.extend_from_slice(&payload);
        self.end_stream |= is_end_stream;
        Ok(())
    }

    /// Take the next complete message.
    ///
    /// `Ok(None)` means more bytes are needed. Leftover bytes after the
    /// stream ended are a truncated message.
    pub fn extract_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < MESSAGE_HEADER_SIZE {
            return self.incomplete();
        }
        let flags = self.buffer[0];
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(H2Error::stream(
                self.stream_id,
                ErrorCode::ProtocolError,
                format!("reserved message flag bits set: 0x{:02x}", flags),
            ));
        }
        let len = u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]);
        let len = usize::try_from(len)
            .map_err(|_| H2Error::internal("message length does not fit in usize"))?;
        let total = MESSAGE_HEADER_SIZE
            .checked_add(len)
            .ok_or_else(|| H2Error::internal("message length overflow"))?;
        if self.buffer.len() < total {
            return self.incomplete();
        }
        let mut frame = self.buffer.split_to(total);
        frame.advance(MESSAGE_HEADER_SIZE);
        Ok(Some(Message {
            payload: frame.freeze(),
            compressed: flags & FLAG_COMPRESSED != 0,
        }))
    }

    fn incomplete(&self) -> Result<Option<Message>> {
        if self.end_stream && !self.buffer.is_empty() {
            return Err(H2Error::stream(
                self.stream_id,
                ErrorCode::ProtocolError,
                format!(
                    "stream ended with {} bytes of incomplete message",
                    self.buffer.len()
                ),
            ));
        }
        Ok(None)
    }

    /// Bytes buffered but not yet returned as messages
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Turns encoded messages into DATA frame payloads
#[derive(Debug, Default)]
pub struct MessageDisassembler {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl MessageDisassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one message
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let encoded = message.encode()?;
        self.len += encoded.len();
        self.chunks.push_back(encoded);
        Ok(())
    }

    /// Queue raw already-framed bytes
    pub fn append_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Take up to `max_len` queued bytes as one frame payload, coalescing
    /// small messages
    pub fn get_next_frame(&mut self, max_len: usize) -> Option<Bytes> {
        if self.len == 0 || max_len == 0 {
            return None;
        }
        let take = self.len.min(max_len);
        // Avoid a copy when the front chunk covers the whole frame
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= take {
                let out = front.split_to(take);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                self.len -= take;
                return Some(out);
            }
        }
        let mut out = BytesMut::with_capacity(take);
        while out.len() < take {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(take - out.len());
            out.extend_from_slice(&front.split_to(n));
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= out.len();
        Some(out.freeze())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix() {
        let encoded = Message::compressed(&b"abc"[..]).encode().unwrap();
        assert_eq!(encoded.as_ref(), &[1, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_length_field_limit() {
        assert_eq!(encoded_message_len(0).unwrap(), 0);
        assert_eq!(encoded_message_len(u32::MAX as usize).unwrap(), u32::MAX);
        if let Some(too_long) = (u32::MAX as usize).checked_add(1) {
            let err = encoded_message_len(too_long).unwrap_err();
            assert!(matches!(err, H2Error::Internal(_)));
        }
    }

    #[test]
    fn test_messages_across_frame_boundaries() {
        let messages = vec![
            Message::new(&b"hello"[..]),
            Message::new(Bytes::new()),
            Message::compressed(vec![7u8; 300]),
        ];
        let mut wire = BytesMut::new();
        for m in &messages {
            wire.extend_from_slice(&m.encode().unwrap());
        }
        let mut wire = wire.freeze();

        let mut assembler = MessageAssembler::new(1);
        let mut out = Vec::new();
        while !wire.is_empty() {
            let chunk = wire.split_to(wire.len().min(7));
            assembler.append_new_data_frame(chunk, wire.is_empty()).unwrap();
            while let Some(m) = assembler.extract_message().unwrap() {
                out.push(m);
            }
        }
        assert_eq!(out, messages);
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_incomplete_message_waits() {
        let mut assembler = MessageAssembler::new(1);
        assembler
            .append_new_data_frame(Bytes::from_static(&[0, 0, 0]), false)
            .unwrap();
        assert_eq!(assembler.extract_message().unwrap(), None);
        assembler
            .append_new_data_frame(Bytes::from_static(&[0, 2, b'a']), false)
            .unwrap();
        assert_eq!(assembler.extract_message().unwrap(), None);
        assembler
            .append_new_data_frame(Bytes::from_static(b"b"), false)
            .unwrap();
        assert_eq!(
            assembler.extract_message().unwrap(),
            Some(Message::new(&b"ab"[..]))
        );
    }

    #[test]
    fn test_truncated_message_at_end_stream() {
        let mut assembler = MessageAssembler::new(3);
        assembler
            .append_new_data_frame(Bytes::from_static(&[0, 0, 0, 0, 9, 1, 2]), true)
            .unwrap();
        let err = assembler.extract_message().unwrap_err();
        assert_eq!(err.stream_id(), Some(3));
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_empty_end_stream_is_clean() {
        let mut assembler = MessageAssembler::new(1);
        assembler.append_new_data_frame(Bytes::new(), true).unwrap();
        assert_eq!(assembler.extract_message().unwrap(), None);
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut assembler = MessageAssembler::new(1);
        assembler
            .append_new_data_frame(Bytes::from_static(&[0x80, 0, 0, 0, 0]), false)
            .unwrap();
        assert!(assembler.extract_message().is_err());
    }

    #[test]
    fn test_disassembler_splits_and_coalesces() {
        let mut disassembler = MessageDisassembler::new();
        disassembler.append(&Message::new(&b"ab"[..])).unwrap();
        disassembler.append(&Message::new(&b"cd"[..])).unwrap();
        assert_eq!(disassembler.len(), 14);

        let first = disassembler.get_next_frame(10).unwrap();
        assert_eq!(first.as_ref(), &[0, 0, 0, 0, 2, b'a', b'b', 0, 0, 0]);
        let second = disassembler.get_next_frame(10).unwrap();
        assert_eq!(second.as_ref(), &[0, 2, b'c', b'd']);
        assert!(disassembler.get_next_frame(10).is_none());
        assert!(disassembler.is_empty());
    }
}
