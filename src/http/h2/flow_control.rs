//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 9113 Section 5.2.
//!
//! Two trackers exist per connection: one transport-wide and one per stream.
//! Each keeps the remote (send) window granted by the peer and the local
//! (receive) window announced to the peer. DATA frames debit both levels.
//! Window updates are produced lazily: only once a configurable fraction of
//! the target window has been consumed.

use super::error::{ErrorCode, H2Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Largest legal window (2^31 - 1)
pub const MAX_WINDOW_SIZE: i64 = 0x7FFF_FFFF;

/// Default fraction of the target window consumed before an update is sent
pub const DEFAULT_LAZY_THRESHOLD: f64 = 0.5;

/// Edge crossed by a send window after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallEdge {
    /// Window stayed on the same side of zero
    NoChange,
    /// Window went from positive to zero or below
    Stalled,
    /// Window went from zero or below to positive
    Unstalled,
}

impl StallEdge {
    fn between(before: i64, after: i64) -> Self {
        match (before > 0, after > 0) {
            (true, false) => StallEdge::Stalled,
            (false, true) => StallEdge::Unstalled,
            _ => StallEdge::NoChange,
        }
    }
}

/// Flow control window
///
/// A signed token count; it may go negative when the peer shrinks
/// SETTINGS_INITIAL_WINDOW_SIZE under data already in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (can be negative if over-committed)
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Check if window has available capacity
    pub fn has_capacity(&self) -> bool {
        self.current_size > 0
    }

    /// Increase window size, failing if it would exceed 2^31-1
    pub fn increase(&mut self, increment: u32) -> std::result::Result<i64, i64> {
        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE {
            return Err(new_size);
        }
        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size
    pub fn decrease(&mut self, amount: u32) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS
    ///
    /// The difference is applied to the current size (RFC 9113 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> std::result::Result<(), i64> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;
        if new_current > MAX_WINDOW_SIZE {
            return Err(new_current);
        }
        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive side shared by both levels: announced window plus the target the
/// engine wants to keep open.
#[derive(Debug, Clone)]
struct RecvWindow {
    announced: FlowControlWindow,
    target: u32,
    lazy_threshold: f64,
}

impl RecvWindow {
    fn new(announced: u32, target: u32, lazy_threshold: f64) -> Self {
        RecvWindow {
            announced: FlowControlWindow::with_initial_size(announced),
            target,
            lazy_threshold,
        }
    }

    fn pending_update(&self) -> Option<u32> {
        let deficit = self.target as i64 - self.announced.size();
        if deficit <= 0 {
            return None;
        }
        let threshold = (self.target as f64 * self.lazy_threshold) as i64;
        if deficit >= threshold.max(1) {
            Some(deficit.min(MAX_WINDOW_SIZE) as u32)
        } else {
            None
        }
    }

    fn update_sent(&mut self, increment: u32) {
        // Increments come from pending_update, which keeps announced <= target
        let _ = self.announced.increase(increment);
    }
}

/// Connection-level flow control
///
/// The connection window always starts at 65535 in both directions; a larger
/// receive target is announced through WINDOW_UPDATE on stream 0.
#[derive(Debug, Clone)]
pub struct ConnectionFlowControl {
    /// Send window (outbound data)
    send_window: FlowControlWindow,
    /// Receive window (inbound data)
    recv_window: RecvWindow,
}

impl ConnectionFlowControl {
    /// Create connection-level flow control aiming for `target_window`
    pub fn new(target_window: u32, lazy_threshold: f64) -> Self {
        ConnectionFlowControl {
            send_window: FlowControlWindow::new(),
            recv_window: RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE, target_window, lazy_threshold),
        }
    }

    /// Bytes the peer currently allows us to send
    pub fn remote_window(&self) -> i64 {
        self.send_window.size()
    }

    /// Bytes we currently allow the peer to send
    pub fn announced_window(&self) -> i64 {
        self.recv_window.announced.size()
    }

    /// Account for a received DATA frame of `n` flow-controlled bytes
    pub fn recv_data(&mut self, n: u32) -> Result<()> {
        if n as i64 > self.announced_window() {
            return Err(H2Error::connection(
                ErrorCode::FlowControlError,
                format!(
                    "received {} bytes with connection window {}",
                    n,
                    self.announced_window()
                ),
            ));
        }
        self.recv_window.announced.decrease(n);
        Ok(())
    }

    /// Account for a sent DATA frame of `n` flow-controlled bytes
    pub fn sent_data(&mut self, n: u32) -> StallEdge {
        let before = self.send_window.size();
        self.send_window.decrease(n);
        StallEdge::between(before, self.send_window.size())
    }

    /// Apply a WINDOW_UPDATE received on stream 0
    pub fn recv_update(&mut self, increment: u32) -> Result<StallEdge> {
        let before = self.send_window.size();
        self.send_window.increase(increment).map_err(|size| {
            H2Error::connection(
                ErrorCode::FlowControlError,
                format!("connection window {} exceeds 2^31-1", size),
            )
        })?;
        Ok(StallEdge::between(before, self.send_window.size()))
    }

    /// Increment to announce now, if the lazy threshold has been crossed
    pub fn make_action(&self) -> Option<u32> {
        self.recv_window.pending_update()
    }

    /// Record that a WINDOW_UPDATE of `increment` was serialized
    pub fn on_update_sent(&mut self, increment: u32) {
        self.recv_window.update_sent(increment);
    }
}

/// Stream-level flow control
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    /// Stream ID
    stream_id: u32,
    /// Send window, starts at the peer's SETTINGS_INITIAL_WINDOW_SIZE
    send_window: FlowControlWindow,
    /// Receive window, starts at our SETTINGS_INITIAL_WINDOW_SIZE
    recv_window: RecvWindow,
}

impl StreamFlowControl {
    /// Create stream-level flow control
    pub fn new(stream_id: u32, send_size: u32, recv_size: u32, lazy_threshold: f64) -> Self {
        StreamFlowControl {
            stream_id,
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: RecvWindow::new(recv_size, recv_size, lazy_threshold),
        }
    }

    /// Get stream ID
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Bytes the peer currently allows us to send on this stream
    pub fn remote_window(&self) -> i64 {
        self.send_window.size()
    }

    /// Bytes we currently allow the peer to send on this stream
    pub fn announced_window(&self) -> i64 {
        self.recv_window.announced.size()
    }

    /// Account for a received DATA frame of `n` flow-controlled bytes
    pub fn recv_data(&mut self, n: u32) -> Result<()> {
        if n as i64 > self.announced_window() {
            return Err(H2Error::stream(
                self.stream_id,
                ErrorCode::FlowControlError,
                format!(
                    "received {} bytes with stream window {}",
                    n,
                    self.announced_window()
                ),
            ));
        }
        self.recv_window.announced.decrease(n);
        Ok(())
    }

    /// Account for a sent DATA frame of `n` flow-controlled bytes
    pub fn sent_data(&mut self, n: u32) -> StallEdge {
        let before = self.send_window.size();
        self.send_window.decrease(n);
        StallEdge::between(before, self.send_window.size())
    }

    /// Apply a WINDOW_UPDATE received on this stream
    pub fn recv_update(&mut self, increment: u32) -> Result<StallEdge> {
        let before = self.send_window.size();
        let stream_id = self.stream_id;
        self.send_window.increase(increment).map_err(|size| {
            H2Error::stream(
                stream_id,
                ErrorCode::FlowControlError,
                format!("stream window {} exceeds 2^31-1", size),
            )
        })?;
        Ok(StallEdge::between(before, self.send_window.size()))
    }

    /// Apply a change of the peer's SETTINGS_INITIAL_WINDOW_SIZE.
    ///
    /// Overflow here is a connection error (RFC 9113 Section 6.9.2).
    pub fn update_send_initial_size(&mut self, new_initial_size: u32) -> Result<StallEdge> {
        let before = self.send_window.size();
        let stream_id = self.stream_id;
        self.send_window
            .update_initial_size(new_initial_size)
            .map_err(|size| {
                H2Error::connection(
                    ErrorCode::FlowControlError,
                    format!("stream {} window {} exceeds 2^31-1", stream_id, size),
                )
            })?;
        Ok(StallEdge::between(before, self.send_window.size()))
    }

    /// Apply a change of our own SETTINGS_INITIAL_WINDOW_SIZE
    pub fn update_recv_initial_size(&mut self, new_initial_size: u32) {
        let old = self.recv_window.target as i64;
        let diff = new_initial_size as i64 - old;
        self.recv_window.target = new_initial_size;
        if diff >= 0 {
            let _ = self.recv_window.announced.increase(diff as u32);
        } else {
            self.recv_window.announced.decrease((-diff) as u32);
        }
    }

    /// Increment to announce now, if the lazy threshold has been crossed
    pub fn make_action(&self) -> Option<u32> {
        self.recv_window.pending_update()
    }

    /// Record that a WINDOW_UPDATE of `increment` was serialized
    pub fn on_update_sent(&mut self, increment: u32) {
        self.recv_window.update_sent(increment);
    }
}
