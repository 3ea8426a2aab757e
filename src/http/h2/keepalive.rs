//! Idle connection keepalive
//!
//! When no frame has arrived for `keepalive_time`, a PING is sent and its
//! ACK must arrive within `keepalive_timeout` or the connection is declared
//! dead. Without active calls (and without permission to ping anyway) the
//! interval backs off to two hours instead of stopping.

use super::ping::IDLE_PING_INTERVAL;
use super::transport::wait_closed;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// What keepalive needs from its transport
pub trait KeepaliveInterface: Send + Sync {
    /// Queue a PING; the receiver resolves on its ACK
    fn send_ping(&self) -> oneshot::Receiver<()>;

    /// The keepalive PING was not acknowledged in time
    fn on_keepalive_timeout(&self);

    fn has_active_calls(&self) -> bool;
}

/// Keepalive state of one connection
#[derive(Debug)]
pub struct KeepaliveManager {
    // Milliseconds; 0 disables keepalive
    keepalive_time_ms: AtomicU64,
    keepalive_timeout: Duration,
    permit_without_calls: bool,
    data_received: AtomicBool,
}

impl KeepaliveManager {
    pub fn new(
        keepalive_time: Option<Duration>,
        keepalive_timeout: Duration,
        permit_without_calls: bool,
    ) -> Self {
        let ms = keepalive_time.map_or(0, |t| t.as_millis().min(u64::MAX as u128) as u64);
        KeepaliveManager {
            keepalive_time_ms: AtomicU64::new(ms),
            keepalive_timeout,
            permit_without_calls,
            data_received: AtomicBool::new(false),
        }
    }

    pub fn keepalive_time(&self) -> Option<Duration> {
        match self.keepalive_time_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    pub fn permit_without_calls(&self) -> bool {
        self.permit_without_calls
    }

    /// A frame arrived; the connection is evidently alive
    pub fn got_data(&self) {
        self.data_received.store(true, Ordering::Relaxed);
    }

    /// Double the keepalive time after the peer complained about pings.
    ///
    /// Returns the new time, or None if keepalive is off.
    pub fn throttle(&self) -> Option<Duration> {
        let current = self.keepalive_time_ms.load(Ordering::Relaxed);
        if current == 0 {
            return None;
        }
        let doubled = current.saturating_mul(2);
        self.keepalive_time_ms.store(doubled, Ordering::Relaxed);
        Some(Duration::from_millis(doubled))
    }

    /// How long to wait before the next keepalive check
    pub fn keepalive_interval(&self, has_active_calls: bool) -> Option<Duration> {
        let time = self.keepalive_time()?;
        if has_active_calls || self.permit_without_calls {
            Some(time)
        } else {
            Some(time.max(IDLE_PING_INTERVAL))
        }
    }

    /// Decide after waiting `idle_for` whether to ping now.
    ///
    /// Consumes the "data received" mark.
    pub fn need_to_send_keepalive_ping(&self, has_active_calls: bool, idle_for: Duration) -> bool {
        if self.data_received.swap(false, Ordering::Relaxed) {
            return false;
        }
        if has_active_calls || self.permit_without_calls {
            return true;
        }
        idle_for >= IDLE_PING_INTERVAL
    }

    /// Keepalive loop; returns when the transport closes or keepalive fails
    pub async fn run<I: KeepaliveInterface + ?Sized>(
        &self,
        interface: &I,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let Some(interval) = self.keepalive_interval(interface.has_active_calls()) else {
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_closed(&mut closed) => return,
            }
            if !self.need_to_send_keepalive_ping(interface.has_active_calls(), interval) {
                continue;
            }
            debug!(?interval, "sending keepalive ping");
            let ack = interface.send_ping();
            tokio::select! {
                result = ack => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.keepalive_timeout) => {
                    warn!(timeout = ?self.keepalive_timeout, "keepalive ping not acknowledged");
                    interface.on_keepalive_timeout();
                    return;
                }
                _ = wait_closed(&mut closed) => return,
            }
        }
    }
}
