//! PING bookkeeping
//!
//! Outgoing pings are correlated with their ACK by the 8-byte opaque value.
//! Requests made before a ping is written share that ping's ACK. Received
//! pings are acknowledged in the next write cycle, and a server watches how
//! often the peer pings through [`PingAbusePolicy`].

use super::codec::FrameCodec;
use super::frames::PingFrame;
use bytes::BytesMut;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// Minimum ping interval when no call is active
pub const IDLE_PING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Outstanding pings and pending acks of one connection
#[derive(Debug)]
pub struct PingManager {
    next_opaque: u64,
    pending_requests: Vec<oneshot::Sender<()>>,
    inflight: HashMap<u64, Vec<oneshot::Sender<()>>>,
    acks_to_send: Vec<u64>,
}

impl Default for PingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PingManager {
    pub fn new() -> Self {
        PingManager {
            next_opaque: 1,
            pending_requests: Vec::new(),
            inflight: HashMap::new(),
            acks_to_send: Vec::new(),
        }
    }

    /// Ask for a ping; the receiver resolves when its ACK arrives
    pub fn request_ping(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.push(tx);
        rx
    }

    /// Whether the next write cycle has ping work
    pub fn has_pending_writes(&self) -> bool {
        !self.pending_requests.is_empty() || !self.acks_to_send.is_empty()
    }

    /// Serialize owed ACKs and, if requested, one new ping.
    ///
    /// Returns the opaque value of the new ping.
    pub fn maybe_get_serialized_ping_frames(&mut self, out: &mut BytesMut) -> Option<u64> {
        for opaque in self.acks_to_send.drain(..) {
            FrameCodec::encode_ping_frame(&PingFrame::with_opaque(opaque, true), out);
        }
        if self.pending_requests.is_empty() {
            return None;
        }
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        let waiters = std::mem::take(&mut self.pending_requests);
        self.inflight.insert(opaque, waiters);
        FrameCodec::encode_ping_frame(&PingFrame::with_opaque(opaque, false), out);
        trace!(opaque, "ping sent");
        Some(opaque)
    }

    /// A non-ACK PING arrived; answer it
    pub fn received_ping(&mut self, opaque: u64) {
        self.acks_to_send.push(opaque);
    }

    /// A PING ACK arrived. Returns false for an ack nobody waits on.
    pub fn ack_ping(&mut self, opaque: u64) -> bool {
        match self.inflight.remove(&opaque) {
            Some(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                true
            }
            None => false,
        }
    }

    pub fn is_inflight(&self, opaque: u64) -> bool {
        self.inflight.contains_key(&opaque)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Drop every waiter; their receivers observe an error
    pub fn cancel_all(&mut self) {
        self.pending_requests.clear();
        self.inflight.clear();
        self.acks_to_send.clear();
    }
}

/// Server-side limit on how often the peer may ping
#[derive(Debug, Clone)]
pub struct PingAbusePolicy {
    min_interval: Duration,
    max_strikes: u32,
    last_recv: Option<Instant>,
    strikes: u32,
}

impl PingAbusePolicy {
    pub fn new(min_interval: Duration, max_strikes: u32) -> Self {
        PingAbusePolicy {
            min_interval,
            max_strikes,
            last_recv: None,
            strikes: 0,
        }
    }

    /// Record a received ping. Returns true once the peer has exceeded the
    /// allowed strikes.
    ///
    /// `transport_idle` stretches the allowed interval to two hours.
    pub fn received_one_ping(&mut self, transport_idle: bool) -> bool {
        let now = Instant::now();
        let interval = if transport_idle {
            self.min_interval.max(IDLE_PING_INTERVAL)
        } else {
            self.min_interval
        };
        if let Some(last) = self.last_recv {
            if now.duration_since(last) < interval {
                self.strikes += 1;
            }
        }
        self.last_recv = Some(now);
        self.strikes > self.max_strikes
    }

    /// Forgive past pings; called when we send DATA or HEADERS
    pub fn reset(&mut self) {
        self.strikes = 0;
        self.last_recv = None;
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::codec::FRAME_HEADER_SIZE;

    #[test]
    fn test_request_and_ack() {
        let mut pings = PingManager::new();
        let mut rx1 = pings.request_ping();
        let mut rx2 = pings.request_ping();
        assert!(pings.has_pending_writes());

        let mut out = BytesMut::new();
        let opaque = pings.maybe_get_serialized_ping_frames(&mut out).unwrap();
        assert_eq!(out.len(), FRAME_HEADER_SIZE + 8);
        assert!(pings.is_inflight(opaque));
        assert!(!pings.has_pending_writes());

        assert!(!pings.ack_ping(opaque + 100));
        assert!(pings.ack_ping(opaque));
        assert_eq!(rx1.try_recv(), Ok(()));
        assert_eq!(rx2.try_recv(), Ok(()));
        assert!(!pings.is_inflight(opaque));
    }

    #[test]
    fn test_acks_written_before_new_ping() {
        let mut pings = PingManager::new();
        pings.received_ping(0xdead_beef);
        let mut out = BytesMut::new();
        assert_eq!(pings.maybe_get_serialized_ping_frames(&mut out), None);
        assert_eq!(out.len(), FRAME_HEADER_SIZE + 8);
        // ACK flag set on the written frame
        assert_eq!(out[4], 0x1);
        assert_eq!(&out[FRAME_HEADER_SIZE..], &0xdead_beef_u64.to_be_bytes());
    }

    #[test]
    fn test_distinct_opaque_values() {
        let mut pings = PingManager::new();
        let mut out = BytesMut::new();
        let _rx1 = pings.request_ping();
        let a = pings.maybe_get_serialized_ping_frames(&mut out).unwrap();
        let _rx2 = pings.request_ping();
        let b = pings.maybe_get_serialized_ping_frames(&mut out).unwrap();
        assert_ne!(a, b);
        assert_eq!(pings.inflight_len(), 2);
    }

    #[test]
    fn test_cancel_all() {
        let mut pings = PingManager::new();
        let mut rx = pings.request_ping();
        pings.cancel_all();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abuse_policy_strikes() {
        let mut policy = PingAbusePolicy::new(Duration::from_secs(300), 2);
        assert!(!policy.received_one_ping(false));
        assert!(!policy.received_one_ping(false));
        assert!(!policy.received_one_ping(false));
        assert_eq!(policy.strikes(), 2);
        assert!(policy.received_one_ping(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abuse_policy_spaced_pings_ok() {
        let mut policy = PingAbusePolicy::new(Duration::from_secs(300), 0);
        assert!(!policy.received_one_ping(false));
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!policy.received_one_ping(false));

        // Same spacing is too frequent without active calls
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(policy.received_one_ping(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abuse_policy_reset() {
        let mut policy = PingAbusePolicy::new(Duration::from_secs(300), 1);
        policy.received_one_ping(false);
        policy.received_one_ping(false);
        policy.reset();
        assert_eq!(policy.strikes(), 0);
        assert!(!policy.received_one_ping(false));
        assert!(!policy.received_one_ping(false));
    }
}
