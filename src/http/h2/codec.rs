//! HTTP/2 frame encoding and decoding
//!
//! Pure functions over byte buffers: the 9-byte frame header, payload
//! parsing with RFC 9113 validation, and serialization of outgoing frames.
//! Serialization takes frames by value so payload buffers move straight
//! into the output.

use super::error::{ErrorCode, H2Error, Result};
use super::frames::*;
use super::CONNECTION_STREAM_ID;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest frame payload expressible in the 24-bit length field
pub const MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (excludes the header itself)
    pub length: u32,
    /// Raw type byte; unknown types are preserved
    pub frame_type: u8,
    /// Flags byte
    pub flags: FrameFlags,
    /// 31-bit stream identifier
    pub stream_id: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: u32) -> Self {
        FrameHeader {
            length,
            frame_type: frame_type.as_u8(),
            flags,
            stream_id,
        }
    }
}

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(header: &FrameHeader) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        out[0] = ((header.length >> 16) & 0xFF) as u8;
        out[1] = ((header.length >> 8) & 0xFF) as u8;
        out[2] = (header.length & 0xFF) as u8;

        out[3] = header.frame_type;
        out[4] = header.flags.as_u8();

        // Reserved bit is always sent as 0
        let stream_id = header.stream_id & 0x7FFF_FFFF;
        out[5..9].copy_from_slice(&stream_id.to_be_bytes());

        out
    }

    /// Decode a frame header from bytes
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);

        // Reserved bit is ignored on receipt
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Reject frames longer than the negotiated maximum frame size
    pub fn check_frame_size(header: &FrameHeader, max_frame_size: u32) -> Result<()> {
        if header.length > max_frame_size {
            return Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!(
                    "frame of {} bytes exceeds max frame size {}",
                    header.length, max_frame_size
                ),
            ));
        }
        Ok(())
    }

    /// Parse a frame payload whose header has already been decoded.
    ///
    /// `payload` must hold exactly `header.length` bytes.
    pub fn parse_frame_payload(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        if payload.len() != header.length as usize {
            return Err(H2Error::internal(format!(
                "payload of {} bytes for frame header length {}",
                payload.len(),
                header.length
            )));
        }

        let Some(frame_type) = FrameType::from_u8(header.frame_type) else {
            return Ok(Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                stream_id: header.stream_id,
            }));
        };

        match frame_type {
            FrameType::Data => Self::parse_data(header, payload),
            FrameType::Headers => Self::parse_headers(header, payload),
            FrameType::Continuation => Self::parse_continuation(header, payload),
            FrameType::RstStream => Self::parse_rst_stream(header, payload),
            FrameType::Settings => Self::parse_settings(header, payload),
            FrameType::Ping => Self::parse_ping(header, payload),
            FrameType::Goaway => Self::parse_goaway(header, payload),
            FrameType::WindowUpdate => Self::parse_window_update(header, payload),
            FrameType::Security => Self::parse_security(header, payload),
            FrameType::PushPromise => Err(H2Error::protocol("PUSH_PROMISE received, push is disabled")),
            FrameType::Priority => Ok(Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                stream_id: header.stream_id,
            })),
        }
    }

    fn require_stream(header: &FrameHeader, name: &str) -> Result<()> {
        if header.stream_id == CONNECTION_STREAM_ID {
            return Err(H2Error::protocol(format!("{} frame on stream 0", name)));
        }
        Ok(())
    }

    fn require_connection(header: &FrameHeader, name: &str) -> Result<()> {
        if header.stream_id != CONNECTION_STREAM_ID {
            return Err(H2Error::protocol(format!(
                "{} frame on stream {}",
                name, header.stream_id
            )));
        }
        Ok(())
    }

    /// Split off the pad length byte and trailing padding.
    fn strip_padding(header: &FrameHeader, mut payload: Bytes) -> Result<(Bytes, Option<u8>)> {
        if !header.flags.is_padded() {
            return Ok((payload, None));
        }
        if payload.is_empty() {
            return Err(H2Error::protocol("padded frame without pad length"));
        }
        let pad_len = payload.get_u8();
        if pad_len as usize > payload.len() {
            return Err(H2Error::protocol(format!(
                "padding of {} bytes exceeds payload of {} bytes",
                pad_len,
                payload.len()
            )));
        }
        payload.truncate(payload.len() - pad_len as usize);
        Ok((payload, Some(pad_len)))
    }

    fn parse_data(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        Self::require_stream(header, "DATA")?;
        let (data, padding) = Self::strip_padding(header, payload)?;
        Ok(Frame::Data(DataFrame {
            stream_id: header.stream_id,
            data,
            end_stream: header.flags.is_end_stream(),
            padding,
        }))
    }

    fn parse_headers(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        Self::require_stream(header, "HEADERS")?;
        let (mut block, padding) = Self::strip_padding(header, payload)?;
        if header.flags.is_priority() {
            if block.len() < 5 {
                return Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    "HEADERS priority fields truncated",
                ));
            }
            block.advance(5);
        }
        Ok(Frame::Headers(HeadersFrame {
            stream_id: header.stream_id,
            header_block: block,
            end_stream: header.flags.is_end_stream(),
            end_headers: header.flags.is_end_headers(),
            padding,
        }))
    }

    fn parse_continuation(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        Self::require_stream(header, "CONTINUATION")?;
        Ok(Frame::Continuation(ContinuationFrame {
            stream_id: header.stream_id,
            header_block: payload,
            end_headers: header.flags.is_end_headers(),
        }))
    }

    fn parse_rst_stream(header: &FrameHeader, mut payload: Bytes) -> Result<Frame> {
        Self::require_stream(header, "RST_STREAM")?;
        if payload.len() != 4 {
            return Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("RST_STREAM payload of {} bytes", payload.len()),
            ));
        }
        Ok(Frame::RstStream(RstStreamFrame {
            stream_id: header.stream_id,
            error_code: ErrorCode::from_wire(payload.get_u32()),
        }))
    }

    fn parse_settings(header: &FrameHeader, mut payload: Bytes) -> Result<Frame> {
        Self::require_connection(header, "SETTINGS")?;
        if header.flags.is_ack() {
            if !payload.is_empty() {
                return Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ACK with payload",
                ));
            }
            return Ok(Frame::Settings(SettingsFrame::ack()));
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("SETTINGS payload of {} bytes", payload.len()),
            ));
        }
        let mut params = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            params.push((id, value));
        }
        Ok(Frame::Settings(SettingsFrame::new(params)))
    }

    fn parse_ping(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        Self::require_connection(header, "PING")?;
        let data: [u8; 8] = payload.as_ref().try_into().map_err(|_| {
            H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("PING payload of {} bytes", payload.len()),
            )
        })?;
        Ok(Frame::Ping(PingFrame {
            ack: header.flags.is_ack(),
            data,
        }))
    }

    fn parse_goaway(header: &FrameHeader, mut payload: Bytes) -> Result<Frame> {
        Self::require_connection(header, "GOAWAY")?;
        if payload.len() < 8 {
            return Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("GOAWAY payload of {} bytes", payload.len()),
            ));
        }
        let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
        let error_code = ErrorCode::from_wire(payload.get_u32());
        Ok(Frame::Goaway(GoawayFrame {
            last_stream_id,
            error_code,
            debug_data: payload,
        }))
    }

    fn parse_window_update(header: &FrameHeader, mut payload: Bytes) -> Result<Frame> {
        if payload.len() != 4 {
            return Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("WINDOW_UPDATE payload of {} bytes", payload.len()),
            ));
        }
        let size_increment = payload.get_u32() & 0x7FFF_FFFF;
        if size_increment == 0 {
            let message = "WINDOW_UPDATE with zero increment";
            return Err(if header.stream_id == CONNECTION_STREAM_ID {
                H2Error::protocol(message)
            } else {
                H2Error::stream(header.stream_id, ErrorCode::ProtocolError, message)
            });
        }
        Ok(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: header.stream_id,
            size_increment,
        }))
    }

    fn parse_security(header: &FrameHeader, payload: Bytes) -> Result<Frame> {
        Self::require_connection(header, "SECURITY")?;
        Ok(Frame::Security(SecurityFrame { payload }))
    }

    /// Serialize frames in order into `out`
    pub fn serialize(frames: Vec<Frame>, out: &mut BytesMut) {
        for frame in frames {
            Self::encode_frame(frame, out);
        }
    }

    /// Serialize a single frame into `out`
    pub fn encode_frame(frame: Frame, out: &mut BytesMut) {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f, out),
            Frame::Headers(f) => Self::encode_headers_frame(f, out),
            Frame::Continuation(f) => Self::encode_continuation_frame(f, out),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(&f, out),
            Frame::Settings(f) => Self::encode_settings_frame(&f, out),
            Frame::Ping(f) => Self::encode_ping_frame(&f, out),
            Frame::Goaway(f) => Self::encode_goaway_frame(f, out),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(&f, out),
            Frame::Security(f) => Self::encode_security_frame(f, out),
            // Nothing is ever sent for frame types we do not understand
            Frame::Unknown(_) => {}
        }
    }

    fn put_header(out: &mut BytesMut, frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) {
        let header = FrameHeader::new(frame_type, flags, stream_id, length as u32);
        out.put_slice(&Self::encode_header(&header));
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: DataFrame, out: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        Self::put_header(out, FrameType::Data, flags, frame.stream_id, frame.frame_size());
        if let Some(pad_len) = frame.padding {
            out.put_u8(pad_len);
        }
        out.put(frame.data);
        if let Some(pad_len) = frame.padding {
            out.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: HeadersFrame, out: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut payload_len = frame.header_block.len();
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        Self::put_header(out, FrameType::Headers, flags, frame.stream_id, payload_len);
        if let Some(pad_len) = frame.padding {
            out.put_u8(pad_len);
        }
        out.put(frame.header_block);
        if let Some(pad_len) = frame.padding {
            out.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: ContinuationFrame, out: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        Self::put_header(
            out,
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        out.put(frame.header_block);
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame, out: &mut BytesMut) {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let params: &[(u16, u32)] = if frame.ack { &[] } else { &frame.params };
        Self::put_header(out, FrameType::Settings, flags, 0, params.len() * 6);
        for (id, value) in params {
            out.put_u16(*id);
            out.put_u32(*value);
        }
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame, out: &mut BytesMut) {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        Self::put_header(out, FrameType::Ping, flags, 0, 8);
        out.put_slice(&frame.data);
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: GoawayFrame, out: &mut BytesMut) {
        let payload_len = 8 + frame.debug_data.len();
        Self::put_header(out, FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        out.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        out.put_u32(frame.error_code.as_u32());
        out.put(frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame, out: &mut BytesMut) {
        Self::put_header(out, FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        out.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame, out: &mut BytesMut) {
        Self::put_header(out, FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        out.put_u32(frame.error_code.as_u32());
    }

    /// Encode a vendor security frame
    pub fn encode_security_frame(frame: SecurityFrame, out: &mut BytesMut) {
        Self::put_header(out, FrameType::Security, FrameFlags::empty(), 0, frame.payload.len());
        out.put(frame.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(frame: Frame) -> Frame {
        let mut out = BytesMut::new();
        FrameCodec::encode_frame(frame, &mut out);
        let header_bytes: [u8; FRAME_HEADER_SIZE] = out[..FRAME_HEADER_SIZE].try_into().unwrap();
        let header = FrameCodec::decode_header(&header_bytes);
        let payload = out.split_off(FRAME_HEADER_SIZE).freeze();
        FrameCodec::parse_frame_payload(&header, payload).unwrap()
    }

    #[test]
    fn test_encode_decode_header() {
        let header = FrameHeader::new(
            FrameType::Headers,
            FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS),
            42,
            1234,
        );

        let encoded = FrameCodec::encode_header(&header);
        assert_eq!(FrameCodec::decode_header(&encoded), header);
    }

    #[test]
    fn test_header_round_trip_extremes() {
        for (length, frame_type, flags, stream_id) in [
            (0, 0x0, 0x00, 0),
            (MAX_FRAME_SIZE, 0xff, 0xff, 0x7FFF_FFFF),
            (16384, 0xC8, 0x01, 1),
            (1, 0x9, 0x04, 0x4000_0001),
        ] {
            let header = FrameHeader {
                length,
                frame_type,
                flags: FrameFlags::from_u8(flags),
                stream_id,
            };
            let encoded = FrameCodec::encode_header(&header);
            assert_eq!(FrameCodec::decode_header(&encoded), header);
        }
    }

    #[test]
    fn test_decode_header_ignores_reserved_bit() {
        let bytes = [0, 0, 0, 0x0, 0x0, 0x80, 0, 0, 3];
        let header = FrameCodec::decode_header(&bytes);
        assert_eq!(header.stream_id, 3);
    }

    #[test]
    fn test_encode_data_frame() {
        let mut encoded = BytesMut::new();
        FrameCodec::encode_data_frame(DataFrame::new(1, Bytes::from("Hello"), true), &mut encoded);

        assert_eq!(encoded[0..3], [0, 0, 5]);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 1]);
        assert_eq!(&encoded[9..], b"Hello");
    }

    #[test]
    fn test_encode_data_frame_with_padding() {
        let mut encoded = BytesMut::new();
        let frame = DataFrame::new(1, Bytes::from("Hi"), false).with_padding(10);
        FrameCodec::encode_data_frame(frame, &mut encoded);

        // 1 (pad length) + 2 (data) + 10 (padding)
        assert_eq!(encoded[0..3], [0, 0, 13]);
        assert_eq!(encoded[4] & FrameFlags::PADDED, FrameFlags::PADDED);
        assert_eq!(encoded[9], 10);
        assert_eq!(&encoded[10..12], b"Hi");
        assert_eq!(&encoded[12..22], &[0u8; 10]);
    }

    #[test]
    fn test_padded_data_round_trip() {
        let frame = Frame::Data(DataFrame::new(3, Bytes::from("payload"), true).with_padding(4));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_padding_longer_than_payload() {
        let header = FrameHeader::new(FrameType::Data, FrameFlags::from_u8(FrameFlags::PADDED), 1, 3);
        let err = FrameCodec::parse_frame_payload(&header, Bytes::from_static(&[5, 1, 2])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_headers_with_priority_fields() {
        let mut payload = BytesMut::new();
        payload.put_u32(0);
        payload.put_u8(16);
        payload.put_slice(b"block");
        let header = FrameHeader::new(
            FrameType::Headers,
            FrameFlags::from_u8(FrameFlags::PRIORITY | FrameFlags::END_HEADERS),
            1,
            payload.len() as u32,
        );
        let frame = FrameCodec::parse_frame_payload(&header, payload.freeze()).unwrap();
        match frame {
            Frame::Headers(h) => {
                assert_eq!(h.header_block, Bytes::from_static(b"block"));
                assert!(h.end_headers);
                assert!(!h.end_stream);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_control_frames_round_trip() {
        let frames = vec![
            Frame::Settings(SettingsFrame::new(vec![(0x1, 8192), (0x4, 65535), (0xfe03, 1)])),
            Frame::Settings(SettingsFrame::ack()),
            Frame::Ping(PingFrame::with_opaque(77, true)),
            Frame::Goaway(GoawayFrame::new(
                0x7FFF_FFFF,
                ErrorCode::NoError,
                Bytes::from_static(b"bye"),
            )),
            Frame::WindowUpdate(WindowUpdateFrame::new(0, 1000)),
            Frame::RstStream(RstStreamFrame::new(7, ErrorCode::Cancel)),
            Frame::Continuation(ContinuationFrame::new(9, Bytes::from_static(b"x"), true)),
            Frame::Security(SecurityFrame::new(Bytes::from_static(b"key"))),
        ];
        for frame in frames {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_encode_settings_ack() {
        let mut encoded = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut encoded);

        assert_eq!(encoded[0..3], [0, 0, 0]);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_encode_window_update() {
        let mut encoded = BytesMut::new();
        FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(42, 1000), &mut encoded);

        assert_eq!(encoded[0..3], [0, 0, 4]);
        assert_eq!(encoded[3], FrameType::WindowUpdate.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 42]);
        let increment = u32::from_be_bytes([encoded[9], encoded[10], encoded[11], encoded[12]]);
        assert_eq!(increment, 1000);
    }

    #[test]
    fn test_unknown_and_priority_frames_are_ignored() {
        let header = FrameHeader {
            length: 3,
            frame_type: 0x42,
            flags: FrameFlags::empty(),
            stream_id: 5,
        };
        let frame = FrameCodec::parse_frame_payload(&header, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(
            frame,
            Frame::Unknown(UnknownFrame {
                frame_type: 0x42,
                stream_id: 5
            })
        );

        let header = FrameHeader::new(FrameType::Priority, FrameFlags::empty(), 5, 5);
        let frame = FrameCodec::parse_frame_payload(&header, Bytes::from_static(&[0, 0, 0, 1, 16])).unwrap();
        assert!(matches!(frame, Frame::Unknown(_)));
    }

    #[test]
    fn test_malformed_payloads() {
        let cases = [
            (FrameType::Ping, 0, vec![0u8; 7], ErrorCode::FrameSizeError),
            (FrameType::Ping, 1, vec![0u8; 8], ErrorCode::ProtocolError),
            (FrameType::RstStream, 1, vec![0u8; 3], ErrorCode::FrameSizeError),
            (FrameType::RstStream, 0, vec![0u8; 4], ErrorCode::ProtocolError),
            (FrameType::Settings, 0, vec![0u8; 5], ErrorCode::FrameSizeError),
            (FrameType::Settings, 1, vec![0u8; 6], ErrorCode::ProtocolError),
            (FrameType::Goaway, 0, vec![0u8; 7], ErrorCode::FrameSizeError),
            (FrameType::WindowUpdate, 0, vec![0u8; 3], ErrorCode::FrameSizeError),
            (FrameType::Data, 0, vec![0u8; 1], ErrorCode::ProtocolError),
            (FrameType::Headers, 0, vec![0u8; 1], ErrorCode::ProtocolError),
            (FrameType::PushPromise, 2, vec![0u8; 4], ErrorCode::ProtocolError),
            (FrameType::Security, 1, vec![0u8; 1], ErrorCode::ProtocolError),
        ];
        for (frame_type, stream_id, payload, code) in cases {
            let header = FrameHeader::new(frame_type, FrameFlags::empty(), stream_id, payload.len() as u32);
            let err = FrameCodec::parse_frame_payload(&header, Bytes::from(payload)).unwrap_err();
            assert_eq!(err.code(), code, "{}", frame_type);
            assert!(err.is_connection_error(), "{}", frame_type);
        }
    }

    #[test]
    fn test_zero_window_update_levels() {
        let header = FrameHeader::new(FrameType::WindowUpdate, FrameFlags::empty(), 0, 4);
        let err = FrameCodec::parse_frame_payload(&header, Bytes::from_static(&[0; 4])).unwrap_err();
        assert!(err.is_connection_error());

        let header = FrameHeader::new(FrameType::WindowUpdate, FrameFlags::empty(), 3, 4);
        let err = FrameCodec::parse_frame_payload(&header, Bytes::from_static(&[0; 4])).unwrap_err();
        assert_eq!(err.stream_id(), Some(3));
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_settings_ack_with_payload() {
        let header = FrameHeader::new(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, 6);
        let err = FrameCodec::parse_frame_payload(&header, Bytes::from_static(&[0; 6])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_check_frame_size() {
        let header = FrameHeader::new(FrameType::Data, FrameFlags::empty(), 1, 16385);
        assert!(FrameCodec::check_frame_size(&header, 16384).is_err());
        assert!(FrameCodec::check_frame_size(&header, 32768).is_ok());
    }

    #[test]
    fn test_serialize_preserves_order() {
        let mut out = BytesMut::new();
        FrameCodec::serialize(
            vec![
                Frame::Settings(SettingsFrame::ack()),
                Frame::Ping(PingFrame::new([0; 8])),
            ],
            &mut out,
        );
        assert_eq!(out.len(), 9 + 9 + 8);
        assert_eq!(out[3], FrameType::Settings.as_u8());
        assert_eq!(out[12], FrameType::Ping.as_u8());
    }
}
