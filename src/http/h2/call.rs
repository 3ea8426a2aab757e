//! Call-side handle of one stream
//!
//! A [`CallHandle`] is what the RPC layer holds for a single call: it feeds
//! the stream's outbound queue and receives inbound events in order.
//! Dropping a handle before the call finished cancels the stream.

use super::error::ErrorCode;
use super::message::Message;
use super::stream_data_queue::{EnqueueResult, StreamDataQueue};
use super::transport::TransportShared;
use crate::http::metadata::Metadata;
use crate::http::status::Status;
use crate::http::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Inbound event of one call, delivered in wire order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// First header block of the stream
    InitialMetadata(Metadata),
    /// One complete length-prefixed message
    Message(Message),
    /// Trailing header block (on a client, carries the call status)
    TrailingMetadata(Metadata),
    /// The peer finished sending without trailers
    HalfClosed,
    /// Final event; nothing follows
    Closed(Status),
}

/// Handle to one call on a transport
pub struct CallHandle {
    queue: Arc<StreamDataQueue>,
    transport: Arc<TransportShared>,
    events: UnboundedReceiver<StreamEvent>,
    finished: bool,
    trailers_enqueued: AtomicBool,
}

impl CallHandle {
    pub(crate) fn new(
        queue: Arc<StreamDataQueue>,
        transport: Arc<TransportShared>,
        events: UnboundedReceiver<StreamEvent>,
    ) -> Self {
        CallHandle {
            queue,
            transport,
            events,
            finished: false,
            trailers_enqueued: AtomicBool::new(false),
        }
    }

    /// Stream id, or 0 while a client call still waits for one
    pub fn stream_id(&self) -> u32 {
        self.queue.stream_id()
    }

    fn schedule(&self, result: EnqueueResult) {
        if result.became_writable {
            self.transport.on_stream_writable(&self.queue, result.priority);
        }
    }

    /// Queue the first header block (server response headers)
    pub fn enqueue_initial_metadata(&self, metadata: Metadata) -> Result<()> {
        let result = self.queue.enqueue_initial_metadata(metadata)?;
        self.schedule(result);
        Ok(())
    }

    /// Queue one message, waiting while the stream queue is full
    pub async fn enqueue_message(&self, message: Message) -> Result<()> {
        let result = self.queue.enqueue_message(message).await?;
        self.schedule(result);
        Ok(())
    }

    /// Queue the trailing header block; ends the stream in our direction
    pub fn enqueue_trailing_metadata(&self, metadata: Metadata) -> Result<()> {
        let result = self.queue.enqueue_trailing_metadata(metadata)?;
        self.trailers_enqueued.store(true, Ordering::Relaxed);
        self.schedule(result);
        Ok(())
    }

    /// Finish a server call with `status` plus any extra trailers
    pub fn send_status(&self, status: &Status, mut trailers: Metadata) -> Result<()> {
        status.to_trailers(&mut trailers);
        self.enqueue_trailing_metadata(trailers)
    }

    /// End the stream in our direction without trailers
    pub fn enqueue_half_close(&self) -> Result<()> {
        let result = self.queue.enqueue_half_closed()?;
        self.schedule(result);
        Ok(())
    }

    /// Abort the stream with RST_STREAM
    pub fn enqueue_reset_stream(&self, code: ErrorCode) {
        let result = self.queue.enqueue_reset_stream(code);
        self.schedule(result);
    }

    /// Next inbound event; None after [`StreamEvent::Closed`] was returned
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(StreamEvent::Closed(_)) | None => self.finished = true,
            _ => {}
        }
        event
    }

    /// Whether the final event has been observed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drop without cancelling; the transport closes the stream itself
    pub(crate) fn disarm(&mut self) {
        self.finished = true;
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("stream_id", &self.stream_id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        // A call that already sent its trailers completes on its own
        if self.finished || self.trailers_enqueued.load(Ordering::Relaxed) {
            return;
        }
        if !self.queue.is_enqueue_closed() {
            self.enqueue_reset_stream(ErrorCode::Cancel);
        }
    }
}
