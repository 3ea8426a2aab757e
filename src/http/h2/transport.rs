//! Connection engine shared by client and server transports
//!
//! One transport owns three long-lived tasks: a read loop that parses and
//! dispatches frames, a write loop that turns pending control frames and
//! stream queues into one buffer per cycle, and (when configured) a
//! keepalive loop. All per-connection state sits in a single
//! [`ConnState`] behind a `parking_lot::Mutex` that is never held across an
//! await point.
//!
//! Lock order: `ConnState` first, then a stream queue or the GOAWAY
//! manager. Nothing is called back into the application while `ConnState`
//! is locked.

use super::call::{CallHandle, StreamEvent};
use super::codec::{FrameCodec, FRAME_HEADER_SIZE};
use super::config::{Role, TransportConfig};
use super::error::{ErrorCode, H2Error, Result as H2Result};
use super::flow_control::{ConnectionFlowControl, StallEdge, StreamFlowControl};
use super::frames::{
    ContinuationFrame, DataFrame, Frame, GoawayFrame, HeadersFrame, PingFrame, RstStreamFrame,
    SecurityFrame, SettingsFrame, WindowUpdateFrame,
};
use super::goaway::{GoawayInterface, GoawayManager};
use super::header_assembler::{AssembledHeaders, HeaderAssembler, IncomingMetadataTracker};
use super::header_codec::{HpackDecoder, HpackEncoder};
use super::keepalive::{KeepaliveInterface, KeepaliveManager};
use super::ping::{PingAbusePolicy, PingManager};
use super::settings::{SettingsBuilder, SettingsManager};
use super::stream::{Stream, StreamTable};
use super::stream_data_queue::StreamDataQueue;
use super::writable_streams::{WritableStreamPriority, WritableStreams};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::http::endpoint::{Endpoint, EndpointReader, EndpointWriter};
use crate::http::metadata::Metadata;
use crate::http::status::Status;
use crate::http::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, trace, warn};

/// Bound on the last write before a locally initiated close
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait until the transport-closed flag is set (or its sender is gone)
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Client call waiting for a stream id
struct PendingCall {
    queue: Arc<StreamDataQueue>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl PendingCall {
    fn fail(self, status: Status) {
        self.queue.close();
        let _ = self.events.send(StreamEvent::Closed(status));
    }
}

/// Header block for a stream the transport does not track. It is still fed
/// to the decoder so the dynamic table stays in step with the peer.
struct OrphanBlock {
    stream_id: u32,
    assembler: HeaderAssembler,
    refuse: bool,
}

enum PeerStream {
    Accepted,
    Refused,
    Ignored,
}

enum Finished {
    EndStream,
    Reset(ErrorCode),
}

/// Everything the read and write loops mutate
struct ConnState {
    streams: StreamTable,
    pending_calls: VecDeque<PendingCall>,
    writable: WritableStreams,
    flow: ConnectionFlowControl,
    settings: SettingsManager,
    settings_generation: u64,
    ping: PingManager,
    ping_abuse: PingAbusePolicy,
    tracker: IncomingMetadataTracker,
    orphan: Option<OrphanBlock>,
    encoder: HpackEncoder,
    decoder: HpackDecoder,
    // Lowest last_stream_id from any GOAWAY the peer sent
    goaway_received: Option<u32>,
    // last_good_stream_id of our terminal GOAWAY
    goaway_sent_last_good: Option<u32>,
    pending_control: Vec<Frame>,
    window_update_candidates: Vec<u32>,
    security_frames: VecDeque<Bytes>,
    preface_pending: bool,
    // Server streams whose first header block is still incomplete
    unannounced: HashMap<u32, mpsc::UnboundedReceiver<StreamEvent>>,
    incoming: Option<mpsc::UnboundedSender<CallHandle>>,
    closing: Option<Status>,
    closed: bool,
    close_status: Option<Status>,
}

impl ConnState {
    fn new(
        role: Role,
        config: &TransportConfig,
        incoming: Option<mpsc::UnboundedSender<CallHandle>>,
    ) -> Self {
        ConnState {
            streams: StreamTable::new(role.is_client()),
            pending_calls: VecDeque::new(),
            writable: WritableStreams::new(),
            flow: ConnectionFlowControl::new(
                config.connection_window_size,
                config.flow_control_lazy_threshold,
            ),
            settings: SettingsManager::new(&config.local_settings(role)),
            settings_generation: 0,
            ping: PingManager::new(),
            ping_abuse: PingAbusePolicy::new(
                config.ping_abuse_min_interval,
                config.ping_abuse_max_strikes,
            ),
            tracker: IncomingMetadataTracker::new(),
            orphan: None,
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            goaway_received: None,
            goaway_sent_last_good: None,
            pending_control: Vec::new(),
            window_update_candidates: Vec::new(),
            security_frames: VecDeque::new(),
            preface_pending: role.is_client(),
            unannounced: HashMap::new(),
            incoming,
            closing: None,
            closed: false,
            close_status: None,
        }
    }

    fn is_closing(&self) -> bool {
        self.closed || self.closing.is_some()
    }
}

/// Output of one write cycle plus what to do once it hit the endpoint
#[derive(Default)]
struct WriteCycle {
    buf: BytesMut,
    goaway_written: bool,
    new_ping: Option<u64>,
    settings_generation: Option<u64>,
    close_after: Option<Status>,
    more: bool,
}

/// State shared by the transport handle, its tasks and its calls
pub(crate) struct TransportShared {
    role: Role,
    config: TransportConfig,
    state: Mutex<ConnState>,
    write_wakeup: Notify,
    closed_tx: watch::Sender<bool>,
    goaway: GoawayManager,
    keepalive: KeepaliveManager,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// GOAWAY manager's view of the transport
struct GoawayHook(Weak<TransportShared>);

impl GoawayInterface for GoawayHook {
    fn trigger_write_cycle(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.write_wakeup.notify_one();
        }
    }

    fn send_ping(&self) -> oneshot::Receiver<()> {
        match self.0.upgrade() {
            Some(shared) => shared.request_ping(),
            None => oneshot::channel().1,
        }
    }

    fn last_accepted_stream_id(&self) -> u32 {
        self.0
            .upgrade()
            .map_or(0, |shared| shared.state.lock().streams.last_peer_stream_id())
    }
}

impl KeepaliveInterface for TransportShared {
    fn send_ping(&self) -> oneshot::Receiver<()> {
        self.request_ping()
    }

    fn on_keepalive_timeout(&self) {
        self.close_transport(Status::unavailable("keepalive ping not acknowledged"));
    }

    fn has_active_calls(&self) -> bool {
        let st = self.state.lock();
        !st.streams.is_empty() || !st.pending_calls.is_empty()
    }
}

impl TransportShared {
    /// Create the shared state and spawn the connection tasks.
    ///
    /// The receiver yields accepted calls on a server; a client never gets
    /// anything from it.
    pub(crate) fn start<E: Endpoint>(
        role: Role,
        config: TransportConfig,
        endpoint: E,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallHandle>) {
        let peer_addr = endpoint.peer_addr();
        let local_addr = endpoint.local_addr();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let incoming = if role.is_client() { None } else { Some(incoming_tx) };
        let state = ConnState::new(role, &config, incoming);
        let keepalive = KeepaliveManager::new(
            config.keepalive_time,
            config.keepalive_timeout,
            config.keepalive_permit_without_calls,
        );
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new_cyclic(|weak: &Weak<TransportShared>| TransportShared {
            role,
            config,
            state: Mutex::new(state),
            write_wakeup: Notify::new(),
            closed_tx,
            goaway: GoawayManager::new(Box::new(GoawayHook(weak.clone()))),
            keepalive,
            peer_addr,
            local_addr,
        });
        debug!(?role, ?peer_addr, "transport starting");

        let (read_half, write_half) = tokio::io::split(endpoint);
        tokio::spawn(Arc::clone(&shared).read_loop(EndpointReader::new(read_half)));
        tokio::spawn(Arc::clone(&shared).write_loop(EndpointWriter::new(write_half)));
        if shared.keepalive.keepalive_time().is_some() {
            let keepalive_shared = Arc::clone(&shared);
            let closed = shared.closed_tx.subscribe();
            tokio::spawn(async move {
                keepalive_shared
                    .keepalive
                    .run(keepalive_shared.as_ref(), closed)
                    .await
            });
        }
        (shared, incoming_rx)
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn wake(&self) {
        self.write_wakeup.notify_one();
    }

    fn header_limits(&self) -> (usize, usize) {
        (
            self.config.max_header_list_size_soft as usize,
            self.config.max_header_list_size_hard as usize,
        )
    }

    fn new_stream_flow(&self, st: &ConnState, stream_id: u32) -> StreamFlowControl {
        StreamFlowControl::new(
            stream_id,
            st.settings.peer().get_initial_window_size(),
            st.settings.local_initial_window_size(),
            self.config.flow_control_lazy_threshold,
        )
    }

    // ---- operations used by the handles ----

    /// Open a client call. The stream id is assigned by the next write cycle.
    pub(crate) fn start_call(self: &Arc<Self>, metadata: Metadata) -> Result<CallHandle> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.is_closing() {
            return Err(Error::TransportClosed);
        }
        if st.goaway_received.is_some() || self.goaway.is_requested() {
            return Err(Error::Unavailable("connection is going away".to_string()));
        }
        if !self.config.queue_streams_at_max_concurrent {
            if let Some(limit) = st.settings.peer().get_max_concurrent_streams() {
                if st.streams.len() + st.pending_calls.len() >= limit as usize {
                    return Err(Error::ResourceExhausted(format!(
                        "peer allows {} concurrent streams",
                        limit
                    )));
                }
            }
        }
        if !st.streams.ids_available() {
            return Err(Error::ResourceExhausted("stream ids exhausted".to_string()));
        }

        let queue = Arc::new(StreamDataQueue::new(self.config.stream_queue_max_tokens));
        queue.enqueue_initial_metadata(metadata)?;
        let (tx, rx) = mpsc::unbounded_channel();
        st.pending_calls.push_back(PendingCall {
            queue: Arc::clone(&queue),
            events: tx,
        });
        drop(guard);
        self.wake();
        Ok(CallHandle::new(queue, Arc::clone(self), rx))
    }

    /// A call queued output on a stream that had nothing pending
    pub(crate) fn on_stream_writable(&self, queue: &StreamDataQueue, priority: WritableStreamPriority) {
        let stream_id = queue.stream_id();
        {
            let mut st = self.state.lock();
            if stream_id != CONNECTION_STREAM_ID && st.streams.contains(stream_id) {
                st.writable.enqueue(stream_id, priority);
            }
        }
        self.wake();
    }

    fn request_ping(&self) -> oneshot::Receiver<()> {
        let rx = {
            let mut st = self.state.lock();
            if st.is_closing() {
                return oneshot::channel().1;
            }
            st.ping.request_ping()
        };
        self.wake();
        rx
    }

    /// Round-trip a PING
    pub(crate) async fn ping(&self) -> Result<()> {
        let ack = self.request_ping();
        let mut closed = self.closed_tx.subscribe();
        tokio::select! {
            result = ack => result.map_err(|_| Error::TransportClosed),
            _ = wait_closed(&mut closed) => Err(Error::TransportClosed),
        }
    }

    /// Send GOAWAY and wait until the exchange is done.
    ///
    /// Clients always send it immediately.
    pub(crate) async fn request_goaway(&self, error_code: ErrorCode, debug_data: Bytes, immediate: bool) {
        let immediate = immediate || self.role.is_client();
        let last_good = self.state.lock().streams.last_peer_stream_id();
        self.goaway
            .request_goaway(error_code, debug_data, last_good, immediate)
            .await;
    }

    /// Fail every call and close after a final GOAWAY(NO_ERROR)
    pub(crate) fn close(&self) {
        let mut guard = self.state.lock();
        self.begin_close(&mut guard, ErrorCode::NoError, "transport closed locally".to_string());
        drop(guard);
        self.wake();
    }

    pub(crate) async fn closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        wait_closed(&mut closed).await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub(crate) fn close_status(&self) -> Option<Status> {
        self.state.lock().close_status.clone()
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Change local settings; the next write cycle announces them
    pub(crate) fn update_settings(&self, builder: SettingsBuilder) -> Result<()> {
        let changes = builder.build()?;
        {
            let mut st = self.state.lock();
            if st.is_closing() {
                return Err(Error::TransportClosed);
            }
            st.settings.update_local(&changes);
        }
        self.wake();
        Ok(())
    }

    pub(crate) fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Queue a security frame for the peer
    pub(crate) fn send_security_frame(&self, payload: Bytes) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.is_closing() {
                return Err(Error::TransportClosed);
            }
            if !st.settings.security_frame_negotiated() {
                return Err(Error::InvalidState(
                    "security frames were not negotiated".to_string(),
                ));
            }
            st.security_frames.push_back(payload);
        }
        self.wake();
        Ok(())
    }

    // ---- closing ----

    /// Schedule an immediate GOAWAY and close once it is written
    fn begin_close(&self, st: &mut ConnState, code: ErrorCode, message: String) {
        if st.is_closing() {
            return;
        }
        let status = Status::unavailable(message.clone());
        self.fail_all_streams(st, &status);
        st.closing = Some(status);
        let last_good = st.streams.last_peer_stream_id();
        self.goaway.start_immediate(code, Bytes::from(message), last_good);
    }

    fn close_transport(&self, status: Status) {
        let mut guard = self.state.lock();
        self.close_transport_locked(&mut guard, status);
    }

    fn close_transport_locked(&self, st: &mut ConnState, status: Status) {
        if st.closed {
            return;
        }
        st.closed = true;
        st.closing = None;
        debug!(%status, "transport closed");
        self.fail_all_streams(st, &status);
        st.ping.cancel_all();
        st.incoming = None;
        st.unannounced.clear();
        st.writable = WritableStreams::new();
        st.close_status = Some(status);
        self.goaway.on_transport_closed();
        self.closed_tx.send_replace(true);
        self.wake();
    }

    fn fail_all_streams(&self, st: &mut ConnState, status: &Status) {
        for stream_id in st.streams.stream_ids() {
            self.close_stream(st, stream_id, status.clone(), None);
        }
        for pending in st.pending_calls.drain(..) {
            pending.fail(status.clone());
        }
    }

    /// The one place a stream leaves the table. Calling it again for the
    /// same id is a no-op.
    fn close_stream(&self, st: &mut ConnState, stream_id: u32, status: Status, rst: Option<ErrorCode>) {
        let Some(mut stream) = st.streams.remove(stream_id) else {
            return;
        };
        if let Some(code) = rst {
            if !stream.is_stream_idle() {
                st.pending_control
                    .push(Frame::RstStream(RstStreamFrame::new(stream_id, code)));
                self.wake();
            }
        }
        // Keep decoding a half-received header block
        if st.tracker.is_waiting_for_continuation_frame() && st.tracker.stream_id() == stream_id {
            let (soft, hard) = self.header_limits();
            st.orphan = Some(OrphanBlock {
                stream_id,
                assembler: std::mem::replace(
                    &mut stream.header_assembler,
                    HeaderAssembler::new(stream_id, soft, hard),
                ),
                refuse: false,
            });
        }
        stream.close();
        stream.queue.close();
        st.writable.remove(stream_id);
        st.unannounced.remove(&stream_id);
        debug!(stream_id, %status, "stream closed");
        let _ = stream.events.send(StreamEvent::Closed(status));
        if !st.pending_calls.is_empty() {
            // A queued call may fit now
            self.wake();
        }
        self.maybe_finish_drain(st);
    }

    /// After GOAWAY in either direction the transport closes once idle
    fn maybe_finish_drain(&self, st: &mut ConnState) {
        if st.is_closing() || !st.streams.is_empty() || !st.pending_calls.is_empty() {
            return;
        }
        if st.goaway_received.is_some() || st.goaway_sent_last_good.is_some() {
            self.close_transport_locked(st, Status::unavailable("connection drained after GOAWAY"));
        }
    }

    fn handle_error(&self, err: H2Error) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match err {
            H2Error::Stream {
                stream_id,
                code,
                message,
            } => {
                debug!(stream_id, %code, %message, "stream error");
                if st.streams.contains(stream_id) {
                    self.close_stream(st, stream_id, Status::from_h2_error_code(code, message), Some(code));
                } else if !st.streams.is_idle_stream_id(stream_id) {
                    st.pending_control
                        .push(Frame::RstStream(RstStreamFrame::new(stream_id, code)));
                }
            }
            H2Error::Connection { code, message } => {
                debug!(%code, %message, "connection error");
                self.begin_close(st, code, message);
            }
            H2Error::Internal(message) => {
                error!(%message, "internal transport error");
                self.begin_close(st, ErrorCode::InternalError, message);
            }
        }
        drop(guard);
        self.wake();
    }

    // ---- read side ----

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: EndpointReader<R>) {
        let mut closed = self.closed_tx.subscribe();
        let result = tokio::select! {
            result = self.read_frames(&mut reader) => result,
            _ = wait_closed(&mut closed) => Ok(()),
        };
        if let Err(err) = result {
            let message = if err.kind() == io::ErrorKind::UnexpectedEof {
                "connection closed by peer".to_string()
            } else {
                format!("endpoint read failed: {}", err)
            };
            debug!(error = %err, "read loop ended");
            self.close_transport(Status::unavailable(message));
        }
        trace!("read loop finished");
    }

    async fn read_frames<R: AsyncRead + Unpin>(
        self: &Arc<Self>,
        reader: &mut EndpointReader<R>,
    ) -> io::Result<()> {
        if !self.role.is_client() {
            let preface = reader.read(CONNECTION_PREFACE.len()).await?;
            if preface.as_ref() != CONNECTION_PREFACE {
                self.handle_error(H2Error::protocol("invalid connection preface"));
                return Ok(());
            }
            debug!("connection preface received");
        }

        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        loop {
            reader.read_slice(&mut header_bytes).await?;
            let header = FrameCodec::decode_header(&header_bytes);
            let max_frame_size = self.state.lock().settings.local_max_frame_size();
            if let Err(err) = FrameCodec::check_frame_size(&header, max_frame_size) {
                self.handle_error(err);
                return Ok(());
            }
            let payload = reader.read(header.length as usize).await?;
            self.keepalive.got_data();

            let outcome = FrameCodec::parse_frame_payload(&header, payload)
                .and_then(|frame| self.process_frame(frame));
            match outcome {
                Ok(Some(security_payload)) => self.deliver_security_frame(security_payload),
                Ok(None) => {}
                Err(err) => self.handle_error(err),
            }
            if self.state.lock().is_closing() {
                return Ok(());
            }
        }
    }

    fn deliver_security_frame(&self, payload: Bytes) {
        match &self.config.security_frame_handler {
            Some(handler) => handler(payload),
            None => trace!(len = payload.len(), "security frame without handler dropped"),
        }
    }

    /// Dispatch one inbound frame. A returned payload is a security frame
    /// to hand to the configured handler once the lock is released.
    fn process_frame(self: &Arc<Self>, frame: Frame) -> H2Result<Option<Bytes>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.is_closing() {
            return Ok(None);
        }
        trace!(?frame, "<");
        st.tracker.check_frame_allowed(&frame)?;
        match frame {
            Frame::Data(f) => self.on_data(st, f).map(|_| None),
            Frame::Headers(f) => self.on_headers(st, f).map(|_| None),
            Frame::Continuation(f) => self.on_continuation(st, f).map(|_| None),
            Frame::RstStream(f) => self.on_rst_stream(st, f).map(|_| None),
            Frame::Settings(f) => self.on_settings(st, f).map(|_| None),
            Frame::Ping(f) => self.on_ping(st, f).map(|_| None),
            Frame::Goaway(f) => self.on_goaway(st, f).map(|_| None),
            Frame::WindowUpdate(f) => self.on_window_update(st, f).map(|_| None),
            Frame::Security(f) => Ok(self.on_security(f)),
            Frame::Unknown(f) => {
                trace!(frame_type = f.frame_type, "unknown frame ignored");
                Ok(None)
            }
        }
    }

    fn on_data(&self, st: &mut ConnState, frame: DataFrame) -> H2Result<()> {
        let stream_id = frame.stream_id;
        let flow_len = frame.frame_size() as u32;
        st.flow.recv_data(flow_len)?;
        if st.flow.make_action().is_some() {
            self.wake();
        }

        let Some(stream) = st.streams.get_mut(stream_id) else {
            if st.streams.is_idle_stream_id(stream_id) {
                return Err(H2Error::protocol(format!("DATA on idle stream {}", stream_id)));
            }
            trace!(stream_id, "DATA for closed stream ignored");
            return Ok(());
        };
        stream.check_data_allowed()?;
        stream.flow_control.recv_data(flow_len)?;
        stream
            .message_assembler
            .append_new_data_frame(frame.data, frame.end_stream)?;
        while let Some(message) = stream.message_assembler.extract_message()? {
            let _ = stream.events.send(StreamEvent::Message(message));
        }

        if !frame.end_stream {
            if stream.can_send_window_update_frames() && stream.flow_control.make_action().is_some() {
                st.window_update_candidates.push(stream_id);
                self.wake();
            }
            return Ok(());
        }

        stream.half_close_remote();
        if self.role.is_client() {
            return self.finish_client_stream(
                st,
                stream_id,
                Status::internal("server closed the stream without trailing metadata"),
            );
        }
        let _ = stream.events.send(StreamEvent::HalfClosed);
        self.maybe_close_finished(st, stream_id);
        Ok(())
    }

    fn on_headers(self: &Arc<Self>, st: &mut ConnState, frame: HeadersFrame) -> H2Result<()> {
        st.tracker.on_header_received(&frame)?;
        let stream_id = frame.stream_id;
        if !st.streams.contains(stream_id) {
            let refuse = match self.open_peer_stream(st, stream_id)? {
                PeerStream::Accepted => false,
                PeerStream::Refused => true,
                PeerStream::Ignored => false,
            };
            if !st.streams.contains(stream_id) {
                let (soft, hard) = self.header_limits();
                let mut assembler = HeaderAssembler::new(stream_id, soft, hard);
                assembler.append_header_frame(&frame)?;
                st.orphan = Some(OrphanBlock {
                    stream_id,
                    assembler,
                    refuse,
                });
                return self.finish_orphan_block(st);
            }
        }
        if let Some(stream) = st.streams.get_mut(stream_id) {
            stream.header_assembler.append_header_frame(&frame)?;
        }
        self.complete_header_block(st, stream_id)
    }

    fn on_continuation(self: &Arc<Self>, st: &mut ConnState, frame: ContinuationFrame) -> H2Result<()> {
        st.tracker.on_continuation_received(&frame)?;
        let stream_id = frame.stream_id;
        if let Some(orphan) = st.orphan.as_mut().filter(|o| o.stream_id == stream_id) {
            orphan.assembler.append_continuation_frame(&frame)?;
            return self.finish_orphan_block(st);
        }
        match st.streams.get_mut(stream_id) {
            Some(stream) => stream.header_assembler.append_continuation_frame(&frame)?,
            None => return Ok(()),
        }
        self.complete_header_block(st, stream_id)
    }

    /// Decide what to do with a HEADERS frame opening an unknown stream
    fn open_peer_stream(&self, st: &mut ConnState, stream_id: u32) -> H2Result<PeerStream> {
        if !st.streams.is_idle_stream_id(stream_id) {
            trace!(stream_id, "HEADERS for closed stream");
            return Ok(PeerStream::Ignored);
        }
        if self.role.is_client() {
            return Err(H2Error::protocol(format!("HEADERS on idle stream {}", stream_id)));
        }
        st.streams.note_peer_stream(stream_id)?;
        if let Some(last_good) = st.goaway_sent_last_good {
            if stream_id > last_good {
                debug!(stream_id, last_good, "stream after final GOAWAY ignored");
                return Ok(PeerStream::Ignored);
            }
        }
        if st.streams.len() >= self.config.max_concurrent_streams as usize {
            debug!(stream_id, "stream refused at max concurrent streams");
            return Ok(PeerStream::Refused);
        }
        if st.incoming.is_none() {
            return Ok(PeerStream::Refused);
        }

        let queue = Arc::new(StreamDataQueue::new(self.config.stream_queue_max_tokens));
        queue.set_stream_id(stream_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = self.new_stream_flow(st, stream_id);
        st.streams
            .insert(Stream::new(stream_id, flow, self.header_limits(), queue, tx));
        st.unannounced.insert(stream_id, rx);
        trace!(stream_id, "stream accepted");
        Ok(PeerStream::Accepted)
    }

    fn finish_orphan_block(&self, st: &mut ConnState) -> H2Result<()> {
        if !st.orphan.as_ref().is_some_and(|o| o.assembler.is_ready()) {
            return Ok(());
        }
        let Some(mut orphan) = st.orphan.take() else {
            return Ok(());
        };
        orphan.assembler.discard(&mut st.decoder)?;
        if orphan.refuse {
            st.pending_control.push(Frame::RstStream(RstStreamFrame::new(
                orphan.stream_id,
                ErrorCode::RefusedStream,
            )));
            self.wake();
        }
        Ok(())
    }

    fn complete_header_block(self: &Arc<Self>, st: &mut ConnState, stream_id: u32) -> H2Result<()> {
        let Some(stream) = st.streams.get_mut(stream_id) else {
            return Ok(());
        };
        if !stream.header_assembler.is_ready() {
            return Ok(());
        }
        match stream.header_assembler.read_metadata(&mut st.decoder)? {
            AssembledHeaders::Discarded { size, .. } => {
                debug!(stream_id, size, "header block over soft limit discarded");
                self.close_stream(
                    st,
                    stream_id,
                    Status::resource_exhausted(format!(
                        "header block of {} bytes exceeds the soft limit",
                        size
                    )),
                    Some(ErrorCode::Cancel),
                );
                Ok(())
            }
            AssembledHeaders::Metadata {
                metadata,
                end_stream,
            } => self.on_metadata(st, stream_id, metadata, end_stream),
        }
    }

    fn on_metadata(
        self: &Arc<Self>,
        st: &mut ConnState,
        stream_id: u32,
        metadata: Metadata,
        end_stream: bool,
    ) -> H2Result<()> {
        let is_client = self.role.is_client();
        let Some(stream) = st.streams.get_mut(stream_id) else {
            return Ok(());
        };

        if !stream.initial_metadata_received() {
            stream.set_initial_metadata_received();
            if is_client && end_stream {
                // Trailers-only response
                stream.set_trailing_metadata_received();
                stream.half_close_remote();
                let status = Status::from_trailers(&metadata);
                let _ = stream.events.send(StreamEvent::TrailingMetadata(metadata));
                return self.finish_client_stream(st, stream_id, status);
            }
            stream.open();
            let _ = stream.events.send(StreamEvent::InitialMetadata(metadata));
            if end_stream {
                stream.half_close_remote();
                let _ = stream.events.send(StreamEvent::HalfClosed);
            }
            if !is_client {
                self.announce_call(st, stream_id);
            }
            return Ok(());
        }

        if stream.trailing_metadata_received() {
            return Err(H2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "header block after trailing metadata",
            ));
        }
        if !end_stream {
            return Err(H2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "trailing metadata without END_STREAM",
            ));
        }
        stream.set_trailing_metadata_received();
        stream.half_close_remote();
        let status = is_client.then(|| Status::from_trailers(&metadata));
        let _ = stream.events.send(StreamEvent::TrailingMetadata(metadata));
        match status {
            Some(status) => self.finish_client_stream(st, stream_id, status),
            None => {
                self.maybe_close_finished(st, stream_id);
                Ok(())
            }
        }
    }

    /// Hand a server call to `accept()` once its first header block is in
    fn announce_call(self: &Arc<Self>, st: &mut ConnState, stream_id: u32) {
        let Some(events) = st.unannounced.remove(&stream_id) else {
            return;
        };
        let Some(stream) = st.streams.get(stream_id) else {
            return;
        };
        let handle = CallHandle::new(Arc::clone(&stream.queue), Arc::clone(self), events);
        let refused = match st.incoming.as_ref() {
            Some(incoming) => match incoming.send(handle) {
                Ok(()) => false,
                Err(mpsc::error::SendError(mut handle)) => {
                    // Dropping an armed handle would re-enter the state lock
                    handle.disarm();
                    true
                }
            },
            None => {
                let mut handle = handle;
                handle.disarm();
                true
            }
        };
        if refused {
            self.close_stream(
                st,
                stream_id,
                Status::unavailable("server is not accepting calls"),
                Some(ErrorCode::RefusedStream),
            );
        }
    }

    /// The server is done with a client call; stop our direction too
    fn finish_client_stream(&self, st: &mut ConnState, stream_id: u32, status: Status) -> H2Result<()> {
        let write_open = st
            .streams
            .get(stream_id)
            .is_some_and(|s| !s.is_write_closed());
        let rst = write_open.then_some(ErrorCode::Cancel);
        self.close_stream(st, stream_id, status, rst);
        Ok(())
    }

    fn maybe_close_finished(&self, st: &mut ConnState, stream_id: u32) {
        if st
            .streams
            .get(stream_id)
            .is_some_and(|s| s.state().is_closed())
        {
            self.close_stream(st, stream_id, Status::ok(), None);
        }
    }

    fn on_rst_stream(&self, st: &mut ConnState, frame: RstStreamFrame) -> H2Result<()> {
        let stream_id = frame.stream_id;
        if !st.streams.contains(stream_id) {
            if st.streams.is_idle_stream_id(stream_id) {
                return Err(H2Error::protocol(format!(
                    "RST_STREAM on idle stream {}",
                    stream_id
                )));
            }
            return Ok(());
        }
        debug!(stream_id, code = %frame.error_code, "RST_STREAM received");
        let status = Status::from_h2_error_code(
            frame.error_code,
            format!("stream reset by peer with {}", frame.error_code),
        );
        self.close_stream(st, stream_id, status, None);
        Ok(())
    }

    fn on_settings(&self, st: &mut ConnState, frame: SettingsFrame) -> H2Result<()> {
        if frame.ack {
            if st.settings.on_settings_ack().is_none() {
                debug!("SETTINGS ACK without a pending SETTINGS");
                return Ok(());
            }
            trace!("SETTINGS acknowledged");
            self.apply_local_window(st);
            self.wake();
            return Ok(());
        }

        let changes = st.settings.apply_peer(&frame)?;
        if let Some(size) = changes.initial_window_size {
            let mut unstalled = Vec::new();
            for stream in st.streams.iter_mut() {
                let edge = stream.flow_control.update_send_initial_size(size)?;
                if edge == StallEdge::Unstalled
                    || (stream.flow_control.remote_window() > 0 && stream.queue.has_pending())
                {
                    unstalled.push(stream.id());
                }
            }
            for stream_id in unstalled {
                st.writable.enqueue(stream_id, WritableStreamPriority::Default);
            }
        }
        trace!(?changes, "peer SETTINGS applied");
        self.wake();
        Ok(())
    }

    /// Track our own INITIAL_WINDOW_SIZE in every receive window
    fn apply_local_window(&self, st: &mut ConnState) {
        let size = st.settings.local_initial_window_size();
        for stream in st.streams.iter_mut() {
            stream.flow_control.update_recv_initial_size(size);
            if stream.can_send_window_update_frames() && stream.flow_control.make_action().is_some() {
                st.window_update_candidates.push(stream.id());
            }
        }
    }

    fn on_ping(&self, st: &mut ConnState, frame: PingFrame) -> H2Result<()> {
        let opaque = frame.opaque();
        if frame.ack {
            if !st.ping.ack_ping(opaque) {
                debug!(opaque, "PING ACK for unknown ping");
            }
            return Ok(());
        }
        if !self.role.is_client() {
            let idle = st.streams.is_empty() && !self.config.keepalive_permit_without_calls;
            if st.ping_abuse.received_one_ping(idle) {
                debug!(strikes = st.ping_abuse.strikes(), "peer pings too often");
                return Err(H2Error::connection(ErrorCode::EnhanceYourCalm, "too_many_pings"));
            }
        }
        st.ping.received_ping(opaque);
        self.wake();
        Ok(())
    }

    fn on_goaway(&self, st: &mut ConnState, frame: GoawayFrame) -> H2Result<()> {
        let code = frame.error_code;
        debug!(last_stream_id = frame.last_stream_id, %code, "GOAWAY received");
        let last = st
            .goaway_received
            .map_or(frame.last_stream_id, |prev| prev.min(frame.last_stream_id));
        st.goaway_received = Some(last);

        if self.role.is_client() {
            if code == ErrorCode::EnhanceYourCalm && frame.debug_data.as_ref() == b"too_many_pings" {
                if let Some(time) = self.keepalive.throttle() {
                    warn!(?time, "peer sent too_many_pings, keepalive time doubled");
                }
            }
            let status = Status::unavailable("connection received GOAWAY");
            for pending in st.pending_calls.drain(..) {
                pending.fail(status.clone());
            }
            let unprocessed: Vec<u32> = st
                .streams
                .stream_ids()
                .into_iter()
                .filter(|id| *id > last)
                .collect();
            for stream_id in unprocessed {
                self.close_stream(st, stream_id, status.clone(), None);
            }
        }

        if code != ErrorCode::NoError {
            self.close_transport_locked(st, Status::unavailable(format!("GOAWAY received with {}", code)));
            return Ok(());
        }
        self.maybe_finish_drain(st);
        Ok(())
    }

    fn on_window_update(&self, st: &mut ConnState, frame: WindowUpdateFrame) -> H2Result<()> {
        let stream_id = frame.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            if st.flow.recv_update(frame.size_increment)? == StallEdge::Unstalled {
                trace!("transport send window reopened");
            }
            if st.writable.parked_len() > 0 {
                st.writable.unpark_all();
                self.wake();
            }
            return Ok(());
        }
        let Some(stream) = st.streams.get_mut(stream_id) else {
            if st.streams.is_idle_stream_id(stream_id) {
                return Err(H2Error::protocol(format!(
                    "WINDOW_UPDATE on idle stream {}",
                    stream_id
                )));
            }
            return Ok(());
        };
        stream.flow_control.recv_update(frame.size_increment)?;
        if stream.queue.has_pending() {
            st.writable.enqueue(stream_id, WritableStreamPriority::Default);
            self.wake();
        }
        Ok(())
    }

    fn on_security(&self, frame: SecurityFrame) -> Option<Bytes> {
        if !self.config.allow_security_frame {
            trace!("security frame ignored, support not advertised");
            return None;
        }
        Some(frame.payload)
    }

    // ---- write side ----

    async fn write_loop<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: EndpointWriter<W>) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            let cycle = self.build_write_cycle();
            if cycle.buf.is_empty() && cycle.close_after.is_none() {
                if self.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = self.write_wakeup.notified() => continue,
                    _ = wait_closed(&mut closed) => break,
                }
            }

            if !cycle.buf.is_empty() {
                let write = writer.write(&cycle.buf);
                let result = if cycle.close_after.is_some() {
                    match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, write).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "final write timed out")),
                    }
                } else {
                    tokio::select! {
                        result = write => result,
                        _ = wait_closed(&mut closed) => break,
                    }
                };
                if let Err(err) = result {
                    debug!(error = %err, "endpoint write failed");
                    self.close_transport(Status::unavailable(format!("endpoint write failed: {}", err)));
                    break;
                }
            }
            self.after_write(cycle);
        }
        let _ = writer.shutdown().await;
        trace!("write loop finished");
    }

    /// Collect everything due into one buffer.
    ///
    /// Order: preface, SETTINGS and acks, GOAWAY, PING, WINDOW_UPDATE and
    /// resets, security frames, then stream data within the cycle budget.
    fn build_write_cycle(&self) -> WriteCycle {
        let mut cycle = WriteCycle::default();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed {
            return cycle;
        }
        let out = &mut cycle.buf;

        if std::mem::take(&mut st.preface_pending) {
            out.extend_from_slice(CONNECTION_PREFACE);
            debug!("connection preface written");
        }

        if let Some((frame, _previous)) = st.settings.maybe_send_update() {
            trace!(?frame, ">");
            FrameCodec::encode_settings_frame(&frame, out);
            st.settings_generation += 1;
            cycle.settings_generation = Some(st.settings_generation);
            self.apply_local_window(st);
        }
        for _ in 0..st.settings.take_acks_owed() {
            FrameCodec::encode_settings_frame(&SettingsFrame::ack(), out);
        }

        if let Some(last_good) = self.goaway.maybe_get_serialized_goaway_frame(out) {
            debug!(last_good, "GOAWAY written");
            cycle.goaway_written = true;
        }

        cycle.new_ping = st.ping.maybe_get_serialized_ping_frames(out);

        if let Some(increment) = st.flow.make_action() {
            FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(0, increment), out);
            st.flow.on_update_sent(increment);
        }
        let mut candidates = std::mem::take(&mut st.window_update_candidates);
        candidates.sort_unstable();
        candidates.dedup();
        for stream_id in candidates {
            let Some(stream) = st.streams.get_mut(stream_id) else {
                continue;
            };
            if !stream.can_send_window_update_frames() {
                continue;
            }
            if let Some(increment) = stream.flow_control.make_action() {
                FrameCodec::encode_window_update_frame(
                    &WindowUpdateFrame::new(stream_id, increment),
                    out,
                );
                stream.flow_control.on_update_sent(increment);
            }
        }
        for frame in st.pending_control.drain(..) {
            trace!(?frame, ">");
            FrameCodec::encode_frame(frame, out);
        }

        if !st.security_frames.is_empty() && st.settings.security_frame_negotiated() {
            for payload in st.security_frames.drain(..) {
                FrameCodec::encode_security_frame(SecurityFrame::new(payload), out);
            }
        }

        if let Some(status) = st.closing.clone() {
            cycle.close_after = Some(status);
            return cycle;
        }

        if self.role.is_client() {
            self.assign_stream_ids(st);
        }
        cycle.more = self.write_streams(st, out);
        cycle
    }

    /// Give pending client calls their stream ids, oldest first
    fn assign_stream_ids(&self, st: &mut ConnState) {
        while let Some(front) = st.pending_calls.front() {
            if front.queue.is_enqueue_closed() && !front.queue.has_pending() {
                if let Some(pending) = st.pending_calls.pop_front() {
                    pending.fail(Status::cancelled("call cancelled before it started"));
                }
                continue;
            }
            let limit = st
                .settings
                .peer()
                .get_max_concurrent_streams()
                .map_or(usize::MAX, |max| max as usize);
            if st.streams.len() >= limit {
                if self.config.queue_streams_at_max_concurrent {
                    break;
                }
                if let Some(pending) = st.pending_calls.pop_front() {
                    pending.fail(Status::resource_exhausted(format!(
                        "peer allows {} concurrent streams",
                        limit
                    )));
                }
                continue;
            }
            let Some(stream_id) = st.streams.allocate_id() else {
                if let Some(pending) = st.pending_calls.pop_front() {
                    pending.fail(Status::resource_exhausted("stream ids exhausted"));
                }
                continue;
            };
            let Some(pending) = st.pending_calls.pop_front() else {
                break;
            };
            pending.queue.set_stream_id(stream_id);
            let flow = self.new_stream_flow(st, stream_id);
            st.streams.insert(Stream::new(
                stream_id,
                flow,
                self.header_limits(),
                pending.queue,
                pending.events,
            ));
            st.writable.enqueue(stream_id, WritableStreamPriority::Default);
            debug!(stream_id, "stream started");
        }
    }

    /// Drain writable streams into `out`. Returns whether work remains for
    /// another cycle.
    fn write_streams(&self, st: &mut ConnState, out: &mut BytesMut) -> bool {
        let max_frame_len = st.settings.peer().get_max_frame_size() as usize;
        let mut budget = self.config.write_budget_per_cycle;
        let mut retry = Vec::new();
        let mut finished = Vec::new();

        while budget > 0 {
            let Some((stream_id, _)) = st.writable.dequeue() else {
                break;
            };
            let Some(stream) = st.streams.get_mut(stream_id) else {
                continue;
            };
            let transport_window = st.flow.remote_window().max(0) as usize;
            let stream_window = stream.flow_control.remote_window().max(0) as usize;
            let tokens = transport_window.min(stream_window).min(budget);
            let budget_bound = tokens == budget;
            let can_send_reset = !stream.is_stream_idle();

            let result =
                stream
                    .queue
                    .dequeue_frames(tokens, max_frame_len, can_send_reset, &mut st.encoder);
            if result.tokens_consumed > 0 {
                let consumed = result.tokens_consumed as u32;
                stream.flow_control.sent_data(consumed);
                st.flow.sent_data(consumed);
                budget -= result.tokens_consumed;
            }
            if result
                .frames
                .iter()
                .any(|f| matches!(f, Frame::Data(_) | Frame::Headers(_)))
            {
                st.ping_abuse.reset();
            }
            for frame in result.frames {
                trace!(?frame, ">");
                FrameCodec::encode_frame(frame, out);
            }
            if result.initial_metadata_dequeued {
                stream.open();
            }
            if let Some(code) = result.reset_dequeued {
                stream.set_write_closed();
                finished.push((stream_id, Finished::Reset(code)));
                continue;
            }
            if result.end_stream_dequeued {
                stream.set_write_closed();
                stream.half_close_local();
                finished.push((stream_id, Finished::EndStream));
            }
            if !result.is_writable {
                continue;
            }
            if budget_bound {
                retry.push((stream_id, result.priority.unwrap_or(WritableStreamPriority::Default)));
            } else if transport_window <= stream_window {
                st.writable.park_until_transport_window(stream_id);
            } else {
                trace!(stream_id, "stream waiting for its send window");
            }
        }

        for (stream_id, priority) in retry {
            st.writable.enqueue(stream_id, priority);
        }
        for (stream_id, outcome) in finished {
            match outcome {
                Finished::Reset(code) => {
                    debug!(stream_id, %code, "stream reset by call");
                    self.close_stream(
                        st,
                        stream_id,
                        Status::cancelled(format!("stream reset locally with {}", code)),
                        None,
                    );
                }
                Finished::EndStream => {
                    let Some(stream) = st.streams.get(stream_id) else {
                        continue;
                    };
                    if stream.state().is_closed() {
                        self.close_stream(st, stream_id, Status::ok(), None);
                    } else if !self.role.is_client() {
                        // Response complete before the request; stop the client
                        self.close_stream(st, stream_id, Status::ok(), Some(ErrorCode::NoError));
                    }
                }
            }
        }
        st.writable.has_ready()
    }

    fn after_write(self: &Arc<Self>, cycle: WriteCycle) {
        if cycle.goaway_written {
            if let Some(args) = self.goaway.notify_goaway_sent() {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                debug!(
                    last_good = args.last_good_stream_id,
                    code = %args.error_code,
                    "terminal GOAWAY sent"
                );
                st.goaway_sent_last_good = Some(args.last_good_stream_id);
                if args.error_code != ErrorCode::NoError {
                    self.close_transport_locked(
                        st,
                        Status::unavailable(format!("GOAWAY sent with {}", args.error_code)),
                    );
                } else {
                    self.maybe_finish_drain(st);
                }
            }
        }
        if let Some(generation) = cycle.settings_generation {
            self.spawn_settings_guard(generation);
        }
        if let Some(opaque) = cycle.new_ping {
            self.spawn_ping_guard(opaque);
        }
        if let Some(status) = cycle.close_after {
            self.close_transport(status);
        } else if cycle.more {
            self.wake();
        }
    }

    fn spawn_settings_guard(self: &Arc<Self>, generation: u64) {
        let timeout = self.config.effective_settings_timeout();
        let weak = Arc::downgrade(self);
        let mut closed = self.closed_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = wait_closed(&mut closed) => return,
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut guard = shared.state.lock();
            if guard.settings.is_update_in_flight() && guard.settings_generation == generation {
                warn!(?timeout, "SETTINGS not acknowledged");
                shared.begin_close(
                    &mut guard,
                    ErrorCode::SettingsTimeout,
                    "settings ack timeout".to_string(),
                );
                drop(guard);
                shared.wake();
            }
        });
    }

    fn spawn_ping_guard(self: &Arc<Self>, opaque: u64) {
        let timeout = self.config.ping_timeout;
        let weak = Arc::downgrade(self);
        let mut closed = self.closed_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = wait_closed(&mut closed) => return,
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let inflight = shared.state.lock().ping.is_inflight(opaque);
            if inflight {
                warn!(opaque, ?timeout, "PING not acknowledged");
                shared.close_transport(Status::unavailable("ping timeout"));
            }
        });
    }
}
