//! Write scheduling across streams
//!
//! Streams with pending output are queued here by priority. Streams closing
//! (trailers, half-close or reset pending) are served before ordinary data so
//! that resources are released promptly. A stream that could not write
//! because the connection send window is exhausted is parked until a
//! connection WINDOW_UPDATE arrives.

use std::collections::{HashMap, VecDeque};

/// Scheduling class of a writable stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WritableStreamPriority {
    /// Ordinary metadata and messages
    Default,
    /// Trailers, half-close or reset pending
    StreamClosed,
}

/// Connection-wide set of streams waiting to write
#[derive(Debug, Default)]
pub struct WritableStreams {
    closing: VecDeque<u32>,
    default: VecDeque<u32>,
    // Entries in the deques not matching this map are stale and skipped
    queued: HashMap<u32, WritableStreamPriority>,
    blocked_on_transport_window: Vec<u32>,
}

impl WritableStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream. Re-queueing at a higher priority promotes it;
    /// re-queueing at the same or lower priority is a no-op.
    pub fn enqueue(&mut self, stream_id: u32, priority: WritableStreamPriority) {
        if let Some(current) = self.queued.get(&stream_id) {
            if *current >= priority {
                return;
            }
        }
        self.blocked_on_transport_window.retain(|id| *id != stream_id);
        self.queued.insert(stream_id, priority);
        match priority {
            WritableStreamPriority::StreamClosed => self.closing.push_back(stream_id),
            WritableStreamPriority::Default => self.default.push_back(stream_id),
        }
    }

    /// Next stream to serve, closing streams first
    pub fn dequeue(&mut self) -> Option<(u32, WritableStreamPriority)> {
        for priority in [
            WritableStreamPriority::StreamClosed,
            WritableStreamPriority::Default,
        ] {
            loop {
                let queue = match priority {
                    WritableStreamPriority::StreamClosed => &mut self.closing,
                    WritableStreamPriority::Default => &mut self.default,
                };
                let Some(stream_id) = queue.pop_front() else {
                    break;
                };
                if self.queued.get(&stream_id) == Some(&priority) {
                    self.queued.remove(&stream_id);
                    return Some((stream_id, priority));
                }
            }
        }
        None
    }

    /// Hold a stream until the connection send window reopens
    pub fn park_until_transport_window(&mut self, stream_id: u32) {
        self.queued.remove(&stream_id);
        if !self.blocked_on_transport_window.contains(&stream_id) {
            self.blocked_on_transport_window.push(stream_id);
        }
    }

    /// Requeue every parked stream; called on a connection unstall edge
    pub fn unpark_all(&mut self) {
        for stream_id in std::mem::take(&mut self.blocked_on_transport_window) {
            self.enqueue(stream_id, WritableStreamPriority::Default);
        }
    }

    /// Forget a stream entirely
    pub fn remove(&mut self, stream_id: u32) {
        self.queued.remove(&stream_id);
        self.blocked_on_transport_window.retain(|id| *id != stream_id);
    }

    /// Whether any stream is ready to be served (parked ones excluded)
    pub fn has_ready(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn parked_len(&self) -> usize {
        self.blocked_on_transport_window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WritableStreamPriority::*;

    #[test]
    fn test_fifo_within_priority() {
        let mut writable = WritableStreams::new();
        writable.enqueue(1, Default);
        writable.enqueue(3, Default);
        writable.enqueue(5, Default);

        assert_eq!(writable.dequeue(), Some((1, Default)));
        assert_eq!(writable.dequeue(), Some((3, Default)));
        assert_eq!(writable.dequeue(), Some((5, Default)));
        assert_eq!(writable.dequeue(), None);
    }

    #[test]
    fn test_closing_streams_first() {
        let mut writable = WritableStreams::new();
        writable.enqueue(1, Default);
        writable.enqueue(3, StreamClosed);

        assert_eq!(writable.dequeue(), Some((3, StreamClosed)));
        assert_eq!(writable.dequeue(), Some((1, Default)));
    }

    #[test]
    fn test_duplicates_and_promotion() {
        let mut writable = WritableStreams::new();
        writable.enqueue(1, Default);
        writable.enqueue(1, Default);
        writable.enqueue(1, StreamClosed);
        writable.enqueue(1, Default);

        assert_eq!(writable.dequeue(), Some((1, StreamClosed)));
        assert_eq!(writable.dequeue(), None);
        assert!(!writable.has_ready());
    }

    #[test]
    fn test_park_and_unpark() {
        let mut writable = WritableStreams::new();
        writable.park_until_transport_window(1);
        writable.park_until_transport_window(3);
        writable.park_until_transport_window(1);
        assert_eq!(writable.parked_len(), 2);
        assert_eq!(writable.dequeue(), None);

        writable.unpark_all();
        assert_eq!(writable.parked_len(), 0);
        assert_eq!(writable.dequeue(), Some((1, Default)));
        assert_eq!(writable.dequeue(), Some((3, Default)));
    }

    #[test]
    fn test_remove() {
        let mut writable = WritableStreams::new();
        writable.enqueue(1, Default);
        writable.park_until_transport_window(3);
        writable.remove(1);
        writable.remove(3);

        writable.unpark_all();
        assert_eq!(writable.dequeue(), None);
    }
}
