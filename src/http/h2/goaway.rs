//! GOAWAY negotiation
//!
//! An immediate GOAWAY is written once and ends the negotiation. A graceful
//! GOAWAY (server, NO_ERROR) is written twice: first with the maximum stream
//! id, then, after a PING round trip, with the highest stream id actually
//! accepted. The round trip bounds the streams the peer may have started
//! before it saw the first frame.
//!
//! The manager never calls its [`GoawayInterface`] while holding its own
//! lock, so the interface may take the connection lock.

use super::codec::FrameCodec;
use super::error::ErrorCode;
use super::frames::GoawayFrame;
use super::MAX_STREAM_ID;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// GOAWAY negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoawayState {
    Idle,
    InitialGracefulScheduled,
    FinalGracefulScheduled,
    ImmediateRequested,
    Done,
}

/// Contents of the GOAWAY frame to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayArgs {
    pub error_code: ErrorCode,
    pub last_good_stream_id: u32,
    pub debug_data: Bytes,
}

/// What the manager needs from its transport
pub trait GoawayInterface: Send + Sync {
    /// Make the write loop run soon
    fn trigger_write_cycle(&self);

    /// Queue a PING; the receiver resolves on its ACK and errors if the
    /// transport closes first
    fn send_ping(&self) -> oneshot::Receiver<()>;

    /// Highest peer stream id accepted so far
    fn last_accepted_stream_id(&self) -> u32;
}

#[derive(Debug)]
struct GoawayInner {
    state: GoawayState,
    args: Option<GoawayArgs>,
    // State whose frame has been serialized but not yet reported sent
    serialized_for: Option<GoawayState>,
    frame_written: bool,
}

enum Action {
    Return,
    Wait,
    TriggerAndWait,
    TriggerPingAndWait,
}

/// Drives GOAWAY for one connection
pub struct GoawayManager {
    inner: Mutex<GoawayInner>,
    done_tx: watch::Sender<bool>,
    interface: Box<dyn GoawayInterface>,
}

impl GoawayManager {
    pub fn new(interface: Box<dyn GoawayInterface>) -> Self {
        let (done_tx, _) = watch::channel(false);
        GoawayManager {
            inner: Mutex::new(GoawayInner {
                state: GoawayState::Idle,
                args: None,
                serialized_for: None,
                frame_written: false,
            }),
            done_tx,
            interface,
        }
    }

    pub fn state(&self) -> GoawayState {
        self.inner.lock().state
    }

    /// Whether any GOAWAY has been requested
    pub fn is_requested(&self) -> bool {
        self.state() != GoawayState::Idle
    }

    fn schedule_immediate(
        inner: &mut GoawayInner,
        error_code: ErrorCode,
        debug_data: Bytes,
        last_good_stream_id: u32,
    ) -> bool {
        match inner.state {
            GoawayState::Done | GoawayState::ImmediateRequested => false,
            _ => {
                inner.state = GoawayState::ImmediateRequested;
                inner.args = Some(GoawayArgs {
                    error_code,
                    last_good_stream_id,
                    debug_data,
                });
                inner.frame_written = false;
                true
            }
        }
    }

    /// Schedule an immediate GOAWAY without waiting for it.
    ///
    /// Returns false if one is already requested or negotiation is done.
    pub fn start_immediate(
        &self,
        error_code: ErrorCode,
        debug_data: Bytes,
        last_good_stream_id: u32,
    ) -> bool {
        let scheduled = {
            let mut inner = self.inner.lock();
            Self::schedule_immediate(&mut inner, error_code, debug_data, last_good_stream_id)
        };
        if scheduled {
            debug!(%error_code, last_good_stream_id, "immediate GOAWAY scheduled");
            self.interface.trigger_write_cycle();
        }
        scheduled
    }

    /// Request a GOAWAY and wait until negotiation is done.
    ///
    /// A graceful request with an error code other than NO_ERROR is treated
    /// as immediate.
    pub async fn request_goaway(
        &self,
        error_code: ErrorCode,
        debug_data: Bytes,
        last_good_stream_id: u32,
        immediate: bool,
    ) {
        let immediate = immediate || error_code != ErrorCode::NoError;
        let action = {
            let mut inner = self.inner.lock();
            match inner.state {
                GoawayState::Done => Action::Return,
                _ if immediate => {
                    if Self::schedule_immediate(
                        &mut inner,
                        error_code,
                        debug_data,
                        last_good_stream_id,
                    ) {
                        Action::TriggerAndWait
                    } else {
                        Action::Wait
                    }
                }
                GoawayState::Idle => {
                    inner.state = GoawayState::InitialGracefulScheduled;
                    inner.args = Some(GoawayArgs {
                        error_code: ErrorCode::NoError,
                        last_good_stream_id: MAX_STREAM_ID,
                        debug_data,
                    });
                    inner.frame_written = false;
                    Action::TriggerPingAndWait
                }
                _ => Action::Wait,
            }
        };

        match action {
            Action::Return => return,
            Action::Wait => {}
            Action::TriggerAndWait => {
                debug!(%error_code, last_good_stream_id, "immediate GOAWAY requested");
                self.interface.trigger_write_cycle();
            }
            Action::TriggerPingAndWait => {
                debug!("graceful GOAWAY requested");
                self.interface.trigger_write_cycle();
                let ack = self.interface.send_ping();
                if ack.await.is_ok() {
                    self.on_graceful_ping_ack();
                }
            }
        }
        self.wait_done().await;
    }

    fn on_graceful_ping_ack(&self) {
        let last_accepted = self.interface.last_accepted_stream_id();
        let scheduled = {
            let mut inner = self.inner.lock();
            if inner.state != GoawayState::InitialGracefulScheduled {
                false
            } else {
                inner.state = GoawayState::FinalGracefulScheduled;
                if let Some(args) = inner.args.as_mut() {
                    args.last_good_stream_id = last_accepted;
                }
                inner.frame_written = false;
                true
            }
        };
        if scheduled {
            debug!(last_accepted, "final graceful GOAWAY scheduled");
            self.interface.trigger_write_cycle();
        }
    }

    /// Serialize the GOAWAY due in the current state, once per state.
    ///
    /// Returns the last good stream id written.
    pub fn maybe_get_serialized_goaway_frame(&self, out: &mut BytesMut) -> Option<u32> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            GoawayState::InitialGracefulScheduled
            | GoawayState::FinalGracefulScheduled
            | GoawayState::ImmediateRequested => {}
            GoawayState::Idle | GoawayState::Done => return None,
        }
        if inner.frame_written {
            return None;
        }
        let args = inner.args.clone()?;
        inner.frame_written = true;
        inner.serialized_for = Some(state);
        drop(inner);

        FrameCodec::encode_goaway_frame(
            GoawayFrame::new(args.last_good_stream_id, args.error_code, args.debug_data),
            out,
        );
        Some(args.last_good_stream_id)
    }

    /// Report that the serialized frame reached the endpoint.
    ///
    /// Returns the args of a terminal GOAWAY when this completes negotiation.
    pub fn notify_goaway_sent(&self) -> Option<GoawayArgs> {
        let done = {
            let mut inner = self.inner.lock();
            let sent = inner.serialized_for.take();
            match (sent, inner.state) {
                (Some(GoawayState::FinalGracefulScheduled), GoawayState::FinalGracefulScheduled)
                | (Some(GoawayState::ImmediateRequested), GoawayState::ImmediateRequested) => {
                    inner.state = GoawayState::Done;
                    inner.args.clone()
                }
                _ => None,
            }
        };
        if done.is_some() {
            debug!("GOAWAY negotiation done");
            self.done_tx.send_replace(true);
        }
        done
    }

    /// Resolve every waiter; later requests return at once
    pub fn on_transport_closed(&self) {
        self.inner.lock().state = GoawayState::Done;
        self.done_tx.send_replace(true);
    }

    /// Wait until negotiation is done
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
