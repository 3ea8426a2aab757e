//! Header block assembly
//!
//! A header block arrives as one HEADERS frame followed by zero or more
//! CONTINUATION frames. RFC 9113 Section 6.10 forbids any other frame on the
//! connection while such a sequence is open; [`IncomingMetadataTracker`]
//! enforces that connection-wide. [`HeaderAssembler`] buffers the block bytes
//! of one stream until the sequence ends, then runs them through the header
//! decoder. [`HeaderDisassembler`] does the reverse for outgoing blocks.

use super::error::{ErrorCode, H2Error, Result};
use super::frames::{ContinuationFrame, Frame, HeadersFrame};
use super::header_codec::HeaderDecoder;
use crate::http::metadata::Metadata;
use bytes::{Bytes, BytesMut};

/// Connection-wide HEADERS/CONTINUATION sequencing
#[derive(Debug, Default)]
pub struct IncomingMetadataTracker {
    in_progress: bool,
    stream_id: u32,
    end_stream: bool,
}

impl IncomingMetadataTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a HEADERS frame.
    ///
    /// Callers must have checked [`Self::check_frame_allowed`] first, so a
    /// sequence in progress here is an engine bug.
    pub fn on_header_received(&mut self, frame: &HeadersFrame) -> Result<()> {
        if self.in_progress {
            return Err(H2Error::internal(format!(
                "HEADERS on stream {} while a header sequence is open on stream {}",
                frame.stream_id, self.stream_id
            )));
        }
        self.stream_id = frame.stream_id;
        self.end_stream = frame.end_stream;
        self.in_progress = !frame.end_headers;
        Ok(())
    }

    /// Record a CONTINUATION frame
    pub fn on_continuation_received(&mut self, frame: &ContinuationFrame) -> Result<()> {
        if !self.in_progress {
            return Err(H2Error::protocol(format!(
                "CONTINUATION on stream {} without a preceding HEADERS",
                frame.stream_id
            )));
        }
        if frame.stream_id != self.stream_id {
            return Err(H2Error::protocol(format!(
                "CONTINUATION on stream {} while waiting on stream {}",
                frame.stream_id, self.stream_id
            )));
        }
        if frame.end_headers {
            self.in_progress = false;
        }
        Ok(())
    }

    pub fn is_waiting_for_continuation_frame(&self) -> bool {
        self.in_progress
    }

    /// Stream of the current or most recent sequence
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Whether the HEADERS frame of the current sequence carried END_STREAM
    pub fn end_stream(&self) -> bool {
        self.end_stream
    }

    /// Reject anything but a CONTINUATION for the waiting stream while a
    /// sequence is open
    pub fn check_frame_allowed(&self, frame: &Frame) -> Result<()> {
        if !self.in_progress {
            if let Frame::Continuation(f) = frame {
                return Err(H2Error::protocol(format!(
                    "unexpected CONTINUATION on stream {}",
                    f.stream_id
                )));
            }
            return Ok(());
        }
        match frame {
            Frame::Continuation(f) if f.stream_id == self.stream_id => Ok(()),
            other => Err(H2Error::protocol(format!(
                "{} on stream {} interleaved with header sequence on stream {}",
                other.name(),
                other.stream_id(),
                self.stream_id
            ))),
        }
    }
}

/// Outcome of reading a completed header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledHeaders {
    /// Block decoded into metadata
    Metadata { metadata: Metadata, end_stream: bool },
    /// Block was over the soft limit; the decoder saw it but nothing was kept
    Discarded { end_stream: bool, size: usize },
}

/// Blocks over the hard limit are still buffered up to this multiple of it
/// so the decoder can consume them and the stream alone is reset. Past
/// that the block is dropped and the compression state is lost, which ends
/// the connection.
pub const HARD_LIMIT_BUFFER_FACTOR: usize = 2;

/// Per-stream header block buffer
#[derive(Debug)]
pub struct HeaderAssembler {
    stream_id: u32,
    buffer: BytesMut,
    buffered_len: usize,
    in_progress: bool,
    complete: bool,
    end_stream: bool,
    soft_limit: usize,
    hard_limit: usize,
}

impl HeaderAssembler {
    /// Create an assembler with soft and hard limits on buffered bytes
    pub fn new(stream_id: u32, soft_limit: usize, hard_limit: usize) -> Self {
        HeaderAssembler {
            stream_id,
            buffer: BytesMut::new(),
            buffered_len: 0,
            in_progress: false,
            complete: false,
            end_stream: false,
            soft_limit,
            hard_limit: hard_limit.max(soft_limit),
        }
    }

    /// Most bytes one block may occupy before the connection is failed
    pub fn max_buffered_len(&self) -> usize {
        self.hard_limit.saturating_mul(HARD_LIMIT_BUFFER_FACTOR)
    }

    fn append(&mut self, block: &Bytes) -> Result<()> {
        let buffered_len = self
            .buffered_len
            .checked_add(block.len())
            .ok_or_else(|| H2Error::internal("header block length overflow"))?;
        if buffered_len > self.max_buffered_len() {
            return Err(H2Error::connection(
                ErrorCode::EnhanceYourCalm,
                format!(
                    "stream {} header block grew past {} bytes before END_HEADERS",
                    self.stream_id,
                    self.max_buffered_len()
                ),
            ));
        }
        self.buffered_len = buffered_len;
        self.buffer.extend_from_slice(block);
        Ok(())
    }

    /// Start a block with a HEADERS frame
    pub fn append_header_frame(&mut self, frame: &HeadersFrame) -> Result<()> {
        if self.in_progress || self.complete {
            return Err(H2Error::internal(format!(
                "stream {} header assembler not reset before new HEADERS",
                self.stream_id
            )));
        }
        self.in_progress = true;
        self.end_stream = frame.end_stream;
        self.append(&frame.header_block)?;
        if frame.end_headers {
            self.in_progress = false;
            self.complete = true;
        }
        Ok(())
    }

    /// Continue a block with a CONTINUATION frame
    pub fn append_continuation_frame(&mut self, frame: &ContinuationFrame) -> Result<()> {
        if !self.in_progress {
            return Err(H2Error::internal(format!(
                "stream {} CONTINUATION without HEADERS in assembler",
                self.stream_id
            )));
        }
        self.append(&frame.header_block)?;
        if frame.end_headers {
            self.in_progress = false;
            self.complete = true;
        }
        Ok(())
    }

    /// Whether a complete block is buffered
    pub fn is_ready(&self) -> bool {
        self.complete
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_len
    }

    fn take_block(&mut self) -> (Bytes, bool, usize) {
        let block = self.buffer.split().freeze();
        let size = self.buffered_len;
        let end_stream = self.end_stream;
        self.buffered_len = 0;
        self.complete = false;
        self.end_stream = false;
        (block, end_stream, size)
    }

    /// Decode the buffered block and reset for the next one.
    ///
    /// Oversized blocks are always fed to the decoder. Above the hard limit
    /// the result is a stream ENHANCE_YOUR_CALM error; above the soft limit
    /// it is [`AssembledHeaders::Discarded`].
    pub fn read_metadata(&mut self, decoder: &mut dyn HeaderDecoder) -> Result<AssembledHeaders> {
        if !self.complete {
            return Err(H2Error::internal(format!(
                "stream {} header block read before END_HEADERS",
                self.stream_id
            )));
        }
        let (block, end_stream, size) = self.take_block();
        if size > self.hard_limit {
            decoder.decompress_discard(&block)?;
            return Err(H2Error::stream(
                self.stream_id,
                ErrorCode::EnhanceYourCalm,
                format!(
                    "header block of {} bytes exceeds hard limit {}",
                    size, self.hard_limit
                ),
            ));
        }
        if size > self.soft_limit {
            decoder.decompress_discard(&block)?;
            return Ok(AssembledHeaders::Discarded { end_stream, size });
        }
        let metadata = decoder.decompress(&block)?;
        Ok(AssembledHeaders::Metadata {
            metadata,
            end_stream,
        })
    }

    /// Feed the buffered block to the decoder without keeping anything
    pub fn discard(&mut self, decoder: &mut dyn HeaderDecoder) -> Result<bool> {
        let (block, end_stream, _) = self.take_block();
        decoder.decompress_discard(&block)?;
        Ok(end_stream)
    }
}

/// Splits an encoded header block into HEADERS + CONTINUATION frames
#[derive(Debug, Clone, Copy)]
pub struct HeaderDisassembler {
    stream_id: u32,
}

impl HeaderDisassembler {
    pub fn new(stream_id: u32) -> Self {
        HeaderDisassembler { stream_id }
    }

    /// Produce frames whose payloads are at most `max_frame_len` bytes
    pub fn frames(&self, mut block: Bytes, end_stream: bool, max_frame_len: usize) -> Vec<Frame> {
        let max_frame_len = max_frame_len.max(1);
        let mut frames = Vec::new();
        let first = block.split_to(block.len().min(max_frame_len));
        frames.push(Frame::Headers(HeadersFrame::new(
            self.stream_id,
            first,
            end_stream,
            block.is_empty(),
        )));
        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max_frame_len));
            frames.push(Frame::Continuation(ContinuationFrame::new(
                self.stream_id,
                chunk,
                block.is_empty(),
            )));
        }
        frames
    }
}
