//! HTTP/2 stream management
//!
//! This module implements the stream state machine of RFC 9113 Section 5.1
//! (without the push-only reserved states) and the connection's stream table.

use super::call::StreamEvent;
use super::error::{ErrorCode, H2Error, Result};
use super::flow_control::StreamFlowControl;
use super::header_assembler::HeaderAssembler;
use super::message::MessageAssembler;
use super::stream_data_queue::StreamDataQueue;
use super::MAX_STREAM_ID;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 9113 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    fn rank(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Open => 1,
            StreamState::HalfClosedLocal | StreamState::HalfClosedRemote => 2,
            StreamState::Closed => 3,
        }
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// One call's stream as seen by the transport
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    write_closed: bool,
    initial_metadata_received: bool,
    trailing_metadata_received: bool,
    pub flow_control: StreamFlowControl,
    pub header_assembler: HeaderAssembler,
    pub message_assembler: MessageAssembler,
    pub queue: Arc<StreamDataQueue>,
    pub events: UnboundedSender<StreamEvent>,
}

impl Stream {
    pub fn new(
        id: StreamId,
        flow_control: StreamFlowControl,
        header_limits: (usize, usize),
        queue: Arc<StreamDataQueue>,
        events: UnboundedSender<StreamEvent>,
    ) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            write_closed: false,
            initial_metadata_received: false,
            trailing_metadata_received: false,
            flow_control,
            header_assembler: HeaderAssembler::new(id, header_limits.0, header_limits.1),
            message_assembler: MessageAssembler::new(id),
            queue,
            events,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    // States only move forward
    fn advance(&mut self, next: StreamState) {
        if next.rank() > self.state.rank() {
            self.state = next;
        }
    }

    /// Initial metadata sent or received
    pub fn open(&mut self) {
        self.advance(StreamState::Open);
    }

    /// Our END_STREAM went out
    pub fn half_close_local(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::Open => self.advance(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.advance(StreamState::Closed),
            StreamState::HalfClosedLocal | StreamState::Closed => {}
        }
    }

    /// The peer's END_STREAM arrived
    pub fn half_close_remote(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::Open => self.advance(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => self.advance(StreamState::Closed),
            StreamState::HalfClosedRemote | StreamState::Closed => {}
        }
    }

    /// RST_STREAM sent or received, or connection failure
    pub fn close(&mut self) {
        self.advance(StreamState::Closed);
    }

    pub fn is_stream_idle(&self) -> bool {
        self.state == StreamState::Idle
    }

    pub fn is_stream_half_closed_remote(&self) -> bool {
        self.state == StreamState::HalfClosedRemote
    }

    /// A window update only makes sense while the peer may still send
    pub fn can_send_window_update_frames(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn can_stream_receive_data_frames(&self) -> bool {
        self.state.can_receive()
            && self.initial_metadata_received
            && !self.trailing_metadata_received
    }

    /// Stream error describing why a DATA frame is not acceptable now
    pub fn check_data_allowed(&self) -> Result<()> {
        if self.is_stream_half_closed_remote() || self.state.is_closed() {
            return Err(H2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                "DATA frame on half-closed remote stream",
            ));
        }
        if !self.can_stream_receive_data_frames() {
            return Err(H2Error::stream(
                self.id,
                ErrorCode::ProtocolError,
                "out of order data frame",
            ));
        }
        Ok(())
    }

    pub fn initial_metadata_received(&self) -> bool {
        self.initial_metadata_received
    }

    pub fn trailing_metadata_received(&self) -> bool {
        self.trailing_metadata_received
    }

    pub fn set_initial_metadata_received(&mut self) {
        self.initial_metadata_received = true;
    }

    pub fn set_trailing_metadata_received(&mut self) {
        self.trailing_metadata_received = true;
    }

    /// Whether the stream will emit no further frames
    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Mark the stream write-closed; returns false if it already was
    pub fn set_write_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.write_closed, true)
    }
}

/// Active streams of one connection
#[derive(Debug)]
pub struct StreamTable {
    streams: HashMap<StreamId, Stream>,
    is_client: bool,
    next_stream_id: StreamId,
    last_peer_stream_id: StreamId,
}

impl StreamTable {
    /// Create a table; clients allocate odd ids, servers even ones
    pub fn new(is_client: bool) -> Self {
        StreamTable {
            streams: HashMap::new(),
            is_client,
            next_stream_id: if is_client { 1 } else { 2 },
            last_peer_stream_id: 0,
        }
    }

    /// Take the next locally initiated id, or None once ids are exhausted
    pub fn allocate_id(&mut self) -> Option<StreamId> {
        if self.next_stream_id > MAX_STREAM_ID {
            return None;
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Some(id)
    }

    /// Ids the next allocation would use are not yet exhausted
    pub fn ids_available(&self) -> bool {
        self.next_stream_id <= MAX_STREAM_ID
    }

    fn is_local_id(&self, stream_id: StreamId) -> bool {
        (stream_id % 2 == 1) == self.is_client
    }

    /// Whether `stream_id` was never opened by either side
    pub fn is_idle_stream_id(&self, stream_id: StreamId) -> bool {
        if self.is_local_id(stream_id) {
            stream_id >= self.next_stream_id
        } else {
            stream_id > self.last_peer_stream_id
        }
    }

    /// Validate and record a stream opened by the peer
    pub fn note_peer_stream(&mut self, stream_id: StreamId) -> Result<()> {
        if self.is_client || stream_id % 2 == 0 {
            return Err(H2Error::protocol(format!(
                "peer opened stream {} with invalid parity",
                stream_id
            )));
        }
        if stream_id <= self.last_peer_stream_id {
            return Err(H2Error::protocol(format!(
                "stream id {} not greater than {}",
                stream_id, self.last_peer_stream_id
            )));
        }
        self.last_peer_stream_id = stream_id;
        Ok(())
    }

    pub fn last_peer_stream_id(&self) -> StreamId {
        self.last_peer_stream_id
    }

    pub fn insert(&mut self, stream: Stream) {
        self.streams.insert(stream.id(), stream);
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Get all stream IDs
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }
}
