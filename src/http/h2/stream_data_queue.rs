//! Per-stream outbound queue
//!
//! The call side enqueues metadata, messages and close markers; the write
//! loop drains them into frames. Messages cost their wire length in tokens.
//! An enqueue is admitted when nothing is outstanding or the new total stays
//! within the token limit, otherwise the caller waits for the write loop to
//! drain. Control entries are free and never wait.
//!
//! Ordering rules: initial metadata at most once and before any message;
//! trailing metadata, half-close and reset at most once each; after trailers
//! or half-close only a reset may follow; a reset drops everything still
//! queued and is terminal.

use super::error::{ErrorCode, H2Error, Result};
use super::frames::{DataFrame, Frame, RstStreamFrame};
use super::header_assembler::HeaderDisassembler;
use super::header_codec::HeaderEncoder;
use super::message::{Message, MessageDisassembler, MESSAGE_HEADER_SIZE};
use super::writable_streams::WritableStreamPriority;
use crate::http::metadata::Metadata;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
enum QueueEntry {
    InitialMetadata(Metadata),
    Message(Bytes),
    TrailingMetadata(Metadata),
    HalfClosed,
    ResetStream(ErrorCode),
}

#[derive(Debug, Default)]
struct QueueInner {
    stream_id: u32,
    entries: VecDeque<QueueEntry>,
    outstanding_tokens: usize,
    // Bytes of the front message already emitted
    front_offset: usize,
    initial_metadata_enqueued: bool,
    end_enqueued: bool,
    reset_enqueued: bool,
    enqueue_closed: bool,
    reset_dequeued: bool,
    is_writable: bool,
}

impl QueueInner {
    fn priority(&self) -> WritableStreamPriority {
        if self.end_enqueued || self.reset_enqueued {
            WritableStreamPriority::StreamClosed
        } else {
            WritableStreamPriority::Default
        }
    }

    fn push(&mut self, entry: QueueEntry) -> EnqueueResult {
        self.entries.push_back(entry);
        let became_writable = !self.is_writable;
        self.is_writable = true;
        EnqueueResult {
            became_writable,
            priority: self.priority(),
        }
    }
}

/// Outcome of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// The stream had nothing pending before and must be scheduled
    pub became_writable: bool,
    pub priority: WritableStreamPriority,
}

impl EnqueueResult {
    fn closed() -> Self {
        EnqueueResult {
            became_writable: false,
            priority: WritableStreamPriority::StreamClosed,
        }
    }
}

/// Frames produced by one drain of the queue
#[derive(Debug, Default)]
pub struct DequeueResult {
    pub frames: Vec<Frame>,
    /// Flow-control tokens used by DATA payloads
    pub tokens_consumed: usize,
    /// Entries remain after this drain
    pub is_writable: bool,
    pub priority: Option<WritableStreamPriority>,
    pub initial_metadata_dequeued: bool,
    /// Trailers or half-close went out
    pub end_stream_dequeued: bool,
    /// A reset was taken from the queue (with its code)
    pub reset_dequeued: Option<ErrorCode>,
    /// The front entry is a message that could not get any tokens
    pub blocked_on_tokens: bool,
}

/// Outbound queue of one stream
#[derive(Debug)]
pub struct StreamDataQueue {
    inner: Mutex<QueueInner>,
    space: Notify,
    max_tokens: usize,
}

impl StreamDataQueue {
    /// Create a queue admitting up to `max_tokens` outstanding message bytes
    pub fn new(max_tokens: usize) -> Self {
        StreamDataQueue {
            inner: Mutex::new(QueueInner::default()),
            space: Notify::new(),
            max_tokens,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.lock().stream_id
    }

    pub fn set_stream_id(&self, stream_id: u32) {
        self.inner.lock().stream_id = stream_id;
    }

    /// Whether anything is waiting to be dequeued
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().entries.is_empty()
    }

    /// Message bytes queued but not yet written
    pub fn outstanding_tokens(&self) -> usize {
        self.inner.lock().outstanding_tokens
    }

    pub fn is_enqueue_closed(&self) -> bool {
        self.inner.lock().enqueue_closed
    }

    pub fn enqueue_initial_metadata(&self, metadata: Metadata) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock();
        if inner.enqueue_closed {
            return Ok(EnqueueResult::closed());
        }
        if inner.initial_metadata_enqueued || inner.end_enqueued {
            return Err(H2Error::internal(format!(
                "stream {}: initial metadata enqueued out of order",
                inner.stream_id
            )));
        }
        inner.initial_metadata_enqueued = true;
        Ok(inner.push(QueueEntry::InitialMetadata(metadata)))
    }

    /// Enqueue a message, waiting while the token limit is exceeded.
    ///
    /// Returns a non-writable result without waiting if the queue is closed,
    /// including when it closes during the wait.
    pub async fn enqueue_message(&self, message: Message) -> Result<EnqueueResult> {
        let encoded = message.encode()?;
        let cost = encoded.len();
        let mut encoded = Some(encoded);
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.enqueue_closed {
                    return Ok(EnqueueResult::closed());
                }
                if !inner.initial_metadata_enqueued || inner.end_enqueued {
                    return Err(H2Error::internal(format!(
                        "stream {}: message enqueued out of order",
                        inner.stream_id
                    )));
                }
                if inner.outstanding_tokens == 0
                    || inner.outstanding_tokens + cost <= self.max_tokens
                {
                    inner.outstanding_tokens += cost;
                    let Some(bytes) = encoded.take() else {
                        return Err(H2Error::internal("message consumed twice"));
                    };
                    return Ok(inner.push(QueueEntry::Message(bytes)));
                }
                trace!(
                    stream_id = inner.stream_id,
                    outstanding = inner.outstanding_tokens,
                    cost,
                    "enqueue waiting for tokens"
                );
            }
            notified.await;
        }
    }

    pub fn enqueue_trailing_metadata(&self, metadata: Metadata) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock();
        if inner.enqueue_closed {
            return Ok(EnqueueResult::closed());
        }
        if inner.end_enqueued {
            return Err(H2Error::internal(format!(
                "stream {}: trailing metadata after end of stream",
                inner.stream_id
            )));
        }
        inner.end_enqueued = true;
        Ok(inner.push(QueueEntry::TrailingMetadata(metadata)))
    }

    pub fn enqueue_half_closed(&self) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock();
        if inner.enqueue_closed {
            return Ok(EnqueueResult::closed());
        }
        if inner.end_enqueued {
            return Err(H2Error::internal(format!(
                "stream {}: half-close after end of stream",
                inner.stream_id
            )));
        }
        inner.end_enqueued = true;
        Ok(inner.push(QueueEntry::HalfClosed))
    }

    /// Replace everything still queued with a reset
    pub fn enqueue_reset_stream(&self, code: ErrorCode) -> EnqueueResult {
        let mut inner = self.inner.lock();
        if inner.enqueue_closed {
            return EnqueueResult::closed();
        }
        inner.entries.clear();
        inner.outstanding_tokens = 0;
        inner.front_offset = 0;
        inner.reset_enqueued = true;
        inner.enqueue_closed = true;
        let result = inner.push(QueueEntry::ResetStream(code));
        drop(inner);
        self.space.notify_waiters();
        result
    }

    /// Drop everything and refuse further enqueues; wakes blocked producers
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.enqueue_closed = true;
            inner.entries.clear();
            inner.outstanding_tokens = 0;
            inner.front_offset = 0;
            inner.is_writable = false;
        }
        self.space.notify_waiters();
    }

    /// Drain entries into frames.
    ///
    /// Whole messages are taken while they fit in `max_tokens`. Only when
    /// the first pending message does not fit is part of it emitted, and a
    /// fresh message needs room for its prefix plus one payload byte.
    pub fn dequeue_frames(
        &self,
        max_tokens: usize,
        max_frame_len: usize,
        can_send_reset: bool,
        encoder: &mut dyn HeaderEncoder,
    ) -> DequeueResult {
        let mut inner = self.inner.lock();
        let stream_id = inner.stream_id;
        let headers = HeaderDisassembler::new(stream_id);
        let mut result = DequeueResult::default();
        let mut data = MessageDisassembler::new();
        let mut tokens = max_tokens;
        let mut whole_message_taken = false;

        // Half-close goes out as its own empty END_STREAM DATA frame
        let flush = |data: &mut MessageDisassembler, frames: &mut Vec<Frame>, end_stream: bool| {
            while let Some(chunk) = data.get_next_frame(max_frame_len) {
                frames.push(Frame::Data(DataFrame::new(stream_id, chunk, false)));
            }
            if end_stream {
                frames.push(Frame::Data(DataFrame::new(stream_id, Bytes::new(), true)));
            }
        };

        while let Some(entry) = inner.entries.front() {
            match entry {
                QueueEntry::InitialMetadata(_) => {
                    let Some(QueueEntry::InitialMetadata(metadata)) = inner.entries.pop_front()
                    else {
                        break;
                    };
                    flush(&mut data, &mut result.frames, false);
                    let block = encoder.compress(&metadata);
                    result.frames.extend(headers.frames(block, false, max_frame_len));
                    result.initial_metadata_dequeued = true;
                }
                QueueEntry::Message(bytes) => {
                    let bytes = bytes.clone();
                    let remaining = bytes.len() - inner.front_offset;
                    if remaining <= tokens {
                        let chunk = bytes.slice(inner.front_offset..);
                        inner.entries.pop_front();
                        inner.front_offset = 0;
                        data.append_bytes(chunk);
                        tokens -= remaining;
                        result.tokens_consumed += remaining;
                        whole_message_taken = true;
                        continue;
                    }
                    if !whole_message_taken {
                        let needed = if inner.front_offset == 0 {
                            remaining.min(MESSAGE_HEADER_SIZE + 1)
                        } else {
                            1
                        };
                        if tokens >= needed {
                            let start = inner.front_offset;
                            let chunk = bytes.slice(start..start + tokens);
                            inner.front_offset += tokens;
                            data.append_bytes(chunk);
                            result.tokens_consumed += tokens;
                        } else {
                            result.blocked_on_tokens = true;
                        }
                    }
                    break;
                }
                QueueEntry::TrailingMetadata(_) => {
                    let Some(QueueEntry::TrailingMetadata(metadata)) = inner.entries.pop_front()
                    else {
                        break;
                    };
                    flush(&mut data, &mut result.frames, false);
                    let block = encoder.compress(&metadata);
                    result.frames.extend(headers.frames(block, true, max_frame_len));
                    result.end_stream_dequeued = true;
                }
                QueueEntry::HalfClosed => {
                    inner.entries.pop_front();
                    flush(&mut data, &mut result.frames, true);
                    result.end_stream_dequeued = true;
                }
                QueueEntry::ResetStream(code) => {
                    let code = *code;
                    inner.entries.clear();
                    flush(&mut data, &mut result.frames, false);
                    if can_send_reset && !inner.reset_dequeued {
                        result
                            .frames
                            .push(Frame::RstStream(RstStreamFrame::new(stream_id, code)));
                    }
                    inner.reset_dequeued = true;
                    result.reset_dequeued = Some(code);
                    break;
                }
            }
        }
        flush(&mut data, &mut result.frames, false);

        inner.outstanding_tokens = inner.outstanding_tokens.saturating_sub(result.tokens_consumed);
        result.is_writable = !inner.entries.is_empty();
        inner.is_writable = result.is_writable;
        result.priority = Some(inner.priority());
        drop(inner);

        if result.tokens_consumed > 0 || result.reset_dequeued.is_some() {
            self.space.notify_waiters();
        }
        result
    }
}
