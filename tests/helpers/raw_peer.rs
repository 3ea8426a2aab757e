//! Hand-driven HTTP/2 peer for exercising a transport frame by frame

use bytes::{Bytes, BytesMut};
use h2rpc::http::h2::codec::{FrameCodec, FRAME_HEADER_SIZE};
use h2rpc::http::h2::frames::{Frame, HeadersFrame, SettingsFrame};
use h2rpc::http::h2::header_codec::{HeaderDecoder, HeaderEncoder, HpackDecoder, HpackEncoder};
use h2rpc::http::h2::CONNECTION_PREFACE;
use h2rpc::http::Metadata;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct RawPeer {
    io: DuplexStream,
    encoder: HpackEncoder,
    decoder: HpackDecoder,
}

impl RawPeer {
    pub(crate) fn new(io: DuplexStream) -> Self {
        RawPeer {
            io,
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
        }
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    pub(crate) async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        FrameCodec::encode_frame(frame, &mut out);
        self.send_raw(&out).await;
    }

    /// Send unless the transport already closed its side
    pub(crate) async fn try_send(&mut self, frame: Frame) -> bool {
        let mut out = BytesMut::new();
        FrameCodec::encode_frame(frame, &mut out);
        self.io.write_all(&out).await.is_ok()
    }

    /// Next frame, or None once the transport closed its side
    pub(crate) async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(RECV_TIMEOUT, self.read_frame())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn read_frame(&mut self) -> Option<Frame> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        self.io.read_exact(&mut header_bytes).await.ok()?;
        let header = FrameCodec::decode_header(&header_bytes);
        let mut payload = vec![0u8; header.length as usize];
        self.io.read_exact(&mut payload).await.ok()?;
        Some(FrameCodec::parse_frame_payload(&header, Bytes::from(payload)).unwrap())
    }

    /// Skip frames until one matches
    pub(crate) async fn recv_until(&mut self, mut pred: impl FnMut(&Frame) -> bool) -> Frame {
        loop {
            let frame = self.recv().await.expect("transport closed");
            if let Frame::Headers(headers) = &frame {
                // Keep the dynamic table in step even for skipped blocks
                if !pred(&frame) {
                    self.decoder.decompress(&headers.header_block).unwrap();
                    continue;
                }
                return frame;
            }
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Read until the transport closes its side, returning what was seen
    pub(crate) async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }

    /// Act as a client: preface, empty SETTINGS, then ack the server's SETTINGS
    pub(crate) async fn client_handshake(&mut self) {
        self.send_raw(CONNECTION_PREFACE).await;
        self.send(Frame::Settings(SettingsFrame::new(Vec::new()))).await;
        self.recv_until(|f| matches!(f, Frame::Settings(s) if !s.ack)).await;
        self.send(Frame::Settings(SettingsFrame::ack())).await;
    }

    pub(crate) fn headers(&mut self, stream_id: u32, metadata: &Metadata, end_stream: bool) -> Frame {
        let block = self.encoder.compress(metadata);
        Frame::Headers(HeadersFrame::new(stream_id, block, end_stream, true))
    }

    pub(crate) fn decode(&mut self, frame: &HeadersFrame) -> Metadata {
        self.decoder.decompress(&frame.header_block).unwrap()
    }
}
