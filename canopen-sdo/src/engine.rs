//! Asynchronous SDO client transfer engine.
//!
//! Converts between a plain byte buffer and one SDO transaction with a remote
//! node:
//! - chooses expedited or segmented mode from the payload size,
//! - arms a timeout for every request and aborts the peer when it expires,
//! - validates every response against the current phase and aborts on the
//!   first violation.
//!
//! The engine never blocks. It sends a frame, returns, and continues when the
//! host calls [`SdoAsync::feed`] with a response or [`SdoAsync::on_timeout`]
//! when the timer expires. There is one engine per node and at most one
//! transaction in flight on it.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use canopen_common::sdo::{
    CAN_MAX_DLC, EXPEDITED_DATA_IDX, EXPEDITED_DATA_SIZE, SEGMENT_IDX, SEGMENT_MAX_SIZE,
};
use canopen_common::{
    request_cob_id, response_cob_id, ClientCommand, SdoAbortCode, SdoFrame, ServerCommand,
};
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::buffer::{BufferError, SdoBuffer};
use crate::config::{EngineConfig, Quirks};
use crate::socket::SdoSocket;
use crate::timer::Timer;

/// Minimum length of an initiate response (command byte and multiplexer)
const INIT_RESPONSE_MIN_LEN: usize = 4;
/// Minimum length of a segment response (command byte)
const SEGMENT_RESPONSE_MIN_LEN: usize = 1;
/// Length of an upload initiate request
const UPLOAD_INIT_REQUEST_LEN: usize = 4;
/// Length of an upload segment request
const UPLOAD_SEGMENT_REQUEST_LEN: usize = 1;

/// Misuse of the engine by its host. Protocol failures are never reported
/// here; they end the transaction through the completion handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdoAsyncError {
    #[error("invalid node id {0}, expected 1..=127")]
    InvalidNodeId(u8),
    #[error("a transfer is already running")]
    Busy,
    #[error("no transfer is running")]
    NotRunning,
    #[error("a download needs at least one byte of payload")]
    EmptyPayload,
    #[error("payload of {0} bytes exceeds the 32 bit size field")]
    PayloadTooLarge(usize),
    #[error("payload does not fit the transfer buffer: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdoDirection {
    /// Client writes to the server's object dictionary
    Download,
    /// Client reads from the server's object dictionary
    Upload,
}

/// Terminal outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoStatus {
    Ok,
    /// We detected a violation or timeout and told the peer to abort
    LocalAbort(SdoAbortCode),
    /// The peer aborted with the given code
    RemoteAbort(u32),
}

impl SdoStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn abort_code(&self) -> Option<u32> {
        match self {
            Self::Ok => None,
            Self::LocalAbort(code) => Some(code.code()),
            Self::RemoteAbort(code) => Some(*code),
        }
    }
}

impl fmt::Display for SdoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::LocalAbort(code) => write!(f, "local abort {}", code),
            Self::RemoteAbort(code) => write!(
                f,
                "remote abort 0x{:08X} ({})",
                code,
                canopen_common::describe_abort_code(*code)
            ),
        }
    }
}

/// What the completion handler is told about the finished transaction.
/// Uploaded bytes are read from [`SdoAsync::buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoCompletion {
    pub node_id: u8,
    pub direction: SdoDirection,
    pub index: u16,
    pub subindex: u8,
    pub status: SdoStatus,
}

/// Caller state carried through a transaction
pub type Context = Box<dyn Any + Send>;
/// Releases the caller context exactly once
pub type ReleaseFn = Box<dyn FnOnce(Context) + Send>;
/// Completion handler; runs once per started transaction, after the engine
/// is idle again, so it may start the next transaction itself.
pub type DoneFn<S, T> = Box<dyn FnOnce(&mut SdoAsync<S, T>, &SdoCompletion) + Send>;

enum Payload<'a> {
    Download(&'a [u8]),
    Upload,
}

/// Everything `start` needs to run one transaction
pub struct SdoTransferRequest<'a, S, T> {
    payload: Payload<'a>,
    index: u16,
    subindex: u8,
    timeout: Duration,
    on_done: Option<DoneFn<S, T>>,
    context: Option<Context>,
    release: Option<ReleaseFn>,
}

impl<'a, S, T> SdoTransferRequest<'a, S, T> {
    /// Write `data` to `index`/`subindex`
    pub fn download(index: u16, subindex: u8, data: &'a [u8]) -> Self {
        Self::new(Payload::Download(data), index, subindex)
    }

    /// Read `index`/`subindex`
    pub fn upload(index: u16, subindex: u8) -> Self {
        Self::new(Payload::Upload, index, subindex)
    }

    fn new(payload: Payload<'a>, index: u16, subindex: u8) -> Self {
        Self {
            payload,
            index,
            subindex,
            timeout: Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS),
            on_done: None,
            context: None,
            release: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_done<F>(mut self, on_done: F) -> Self
    where
        F: FnOnce(&mut SdoAsync<S, T>, &SdoCompletion) + Send + 'static,
    {
        self.on_done = Some(Box::new(on_done));
        self
    }

    /// Attach caller state; `release` gets it back once the transaction is
    /// over, either after the completion handler or on `stop`
    pub fn context<F>(mut self, context: Context, release: F) -> Self
    where
        F: FnOnce(Context) + Send + 'static,
    {
        self.context = Some(context);
        self.release = Some(Box::new(release));
        self
    }

    pub fn direction(&self) -> SdoDirection {
        match self.payload {
            Payload::Download(_) => SdoDirection::Download,
            Payload::Upload => SdoDirection::Upload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Initiate frame sent
    InitResponse,
    /// Zero or more segment round-trips done
    SegmentResponse,
}

/// Per-transaction state; present only while a transaction runs
struct Transfer<S, T> {
    direction: SdoDirection,
    index: u16,
    subindex: u8,
    phase: Phase,
    pos: usize,
    is_toggled: bool,
    is_size_indicated: bool,
    on_done: Option<DoneFn<S, T>>,
    context: Option<Context>,
    release: Option<ReleaseFn>,
}

impl<S, T> Transfer<S, T> {
    fn release_context(&mut self) {
        if let (Some(context), Some(release)) = (self.context.take(), self.release.take()) {
            release(context);
        }
    }
}

/// Result of processing one response
enum Step {
    /// Next request sent, keep waiting
    Continue,
    Done,
    Abort(SdoAbortCode),
}

/// A segmented download announces its size in 32 bits
fn check_download_size(len: usize) -> Result<(), SdoAsyncError> {
    if u32::try_from(len).is_err() {
        return Err(SdoAsyncError::PayloadTooLarge(len));
    }
    Ok(())
}

/// SDO client engine for a single node
pub struct SdoAsync<S, T> {
    node_id: u8,
    socket: S,
    timer: T,
    quirks: Quirks,
    buffer: SdoBuffer,
    transfer: Option<Transfer<S, T>>,
}

impl<S: SdoSocket, T: Timer> SdoAsync<S, T> {
    pub fn new(node_id: u8, socket: S, timer: T, config: EngineConfig) -> Result<Self, SdoAsyncError> {
        if !(1..=127).contains(&node_id) {
            return Err(SdoAsyncError::InvalidNodeId(node_id));
        }

        let buffer = match config.max_transfer_size {
            Some(limit) => SdoBuffer::with_limit(limit),
            None => SdoBuffer::new(),
        };

        Ok(Self {
            node_id,
            socket,
            timer,
            quirks: config.quirks,
            buffer,
            transfer: None,
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    pub fn is_running(&self) -> bool {
        self.transfer.is_some()
    }

    /// Payload of the current or most recent transaction
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Begin a transaction and send its initiate frame.
    ///
    /// Fails without touching a running transaction.
    pub fn start(&mut self, request: SdoTransferRequest<'_, S, T>) -> Result<(), SdoAsyncError> {
        if self.is_running() {
            return Err(SdoAsyncError::Busy);
        }

        let direction = request.direction();
        match request.payload {
            Payload::Download([]) => return Err(SdoAsyncError::EmptyPayload),
            Payload::Download(data) => {
                check_download_size(data.len())?;
                self.buffer.assign(data)?
            }
            Payload::Upload => self.buffer.clear(),
        }

        self.timer.set_time(request.timeout);

        debug!(
            "SDO {:?} 0x{:04X}:{:02X} on node {} started ({} bytes, timeout {:?})",
            direction,
            request.index,
            request.subindex,
            self.node_id,
            self.buffer.len(),
            request.timeout
        );

        let (index, subindex) = (request.index, request.subindex);
        self.transfer = Some(Transfer {
            direction,
            index,
            subindex,
            phase: Phase::InitResponse,
            pos: 0,
            is_toggled: false,
            is_size_indicated: false,
            on_done: request.on_done,
            context: request.context,
            release: request.release,
        });

        match direction {
            SdoDirection::Download => self.send_init_download(index, subindex),
            SdoDirection::Upload => self.send_init_upload(index, subindex),
        }

        Ok(())
    }

    /// Cancel the running transaction without reporting a result.
    ///
    /// The completion handler is dropped unused; the caller context is
    /// released. Nothing is sent to the peer.
    pub fn stop(&mut self) -> Result<(), SdoAsyncError> {
        let mut transfer = self.transfer.take().ok_or(SdoAsyncError::NotRunning)?;
        self.timer.stop();
        transfer.release_context();
        debug!(
            "SDO {:?} 0x{:04X}:{:02X} on node {} stopped by caller",
            transfer.direction, transfer.index, transfer.subindex, self.node_id
        );
        Ok(())
    }

    /// Timer expiry: abort the peer and finish with a timeout
    pub fn on_timeout(&mut self) -> Result<(), SdoAsyncError> {
        let transfer = self.transfer.take().ok_or(SdoAsyncError::NotRunning)?;
        warn!(
            "SDO {:?} 0x{:04X}:{:02X} on node {} timed out",
            transfer.direction, transfer.index, transfer.subindex, self.node_id
        );
        self.abort(transfer, SdoAbortCode::Timeout);
        Ok(())
    }

    /// Process a frame received on this node's response COB-ID.
    ///
    /// Frames arriving while idle (late duplicates, responses after a
    /// timeout) are refused with [`SdoAsyncError::NotRunning`].
    ///
    /// # Panics
    ///
    /// If `frame` is addressed to another node; routing is the host's job.
    pub fn feed(&mut self, frame: &SdoFrame) -> Result<(), SdoAsyncError> {
        assert_eq!(
            frame.cob_id(),
            response_cob_id(self.node_id),
            "SDO frame routed to the wrong node engine"
        );

        let mut transfer = self.transfer.take().ok_or(SdoAsyncError::NotRunning)?;

        // A response is in hand, the pending timeout no longer applies
        self.timer.stop();
        trace!("SDO node {} rx {}", self.node_id, frame);

        if frame.server_command() == Some(ServerCommand::Abort) {
            let code = frame.abort_code();
            warn!(
                "SDO {:?} 0x{:04X}:{:02X} on node {} aborted by peer: 0x{:08X} ({})",
                transfer.direction,
                transfer.index,
                transfer.subindex,
                self.node_id,
                code,
                canopen_common::describe_abort_code(code)
            );
            self.finish(transfer, SdoStatus::RemoteAbort(code));
            return Ok(());
        }

        let step = match (transfer.direction, transfer.phase) {
            (SdoDirection::Download, Phase::InitResponse) => {
                self.feed_init_download_response(&mut transfer, frame)
            }
            (SdoDirection::Upload, Phase::InitResponse) => {
                self.feed_init_upload_response(&mut transfer, frame)
            }
            (SdoDirection::Download, Phase::SegmentResponse) => {
                self.feed_download_segment_response(&mut transfer, frame)
            }
            (SdoDirection::Upload, Phase::SegmentResponse) => {
                self.feed_upload_segment_response(&mut transfer, frame)
            }
        };

        match step {
            Step::Continue => self.transfer = Some(transfer),
            Step::Done => self.finish(transfer, SdoStatus::Ok),
            Step::Abort(code) => {
                warn!(
                    "SDO {:?} 0x{:04X}:{:02X} on node {}: aborting, {}",
                    transfer.direction, transfer.index, transfer.subindex, self.node_id, code
                );
                self.abort(transfer, code);
            }
        }

        Ok(())
    }

    // --- Termination ---

    /// Tell the peer to abort, then finish locally
    fn abort(&mut self, transfer: Transfer<S, T>, code: SdoAbortCode) {
        self.timer.stop();
        let mut frame = self.init_frame();
        frame.abort(code, transfer.index, transfer.subindex);
        self.send(frame);
        self.finish(transfer, SdoStatus::LocalAbort(code));
    }

    /// The engine is already idle here (`transfer` was taken out), so the
    /// handler may start a new transaction. The context is released last.
    fn finish(&mut self, mut transfer: Transfer<S, T>, status: SdoStatus) {
        self.timer.stop();

        let completion = SdoCompletion {
            node_id: self.node_id,
            direction: transfer.direction,
            index: transfer.index,
            subindex: transfer.subindex,
            status,
        };

        info!(
            "SDO {:?} 0x{:04X}:{:02X} on node {} finished: {} ({} bytes)",
            completion.direction,
            completion.index,
            completion.subindex,
            self.node_id,
            status,
            self.buffer.len()
        );

        if let Some(on_done) = transfer.on_done.take() {
            on_done(self, &completion);
        }

        transfer.release_context();
    }

    // --- Outbound frames ---

    fn init_frame(&self) -> SdoFrame {
        SdoFrame::new(request_cob_id(self.node_id))
    }

    fn send(&mut self, mut frame: SdoFrame) {
        if self.quirks.force_full_frame_length {
            frame.set_len(CAN_MAX_DLC);
        }

        trace!("SDO node {} tx {}", self.node_id, frame);
        if let Err(err) = self.socket.send(&frame) {
            // The transaction timeout reports a lost request
            warn!("SDO node {}: failed to send frame: {}", self.node_id, err);
        }
    }

    fn is_expedited(&self) -> bool {
        self.buffer.len() <= EXPEDITED_DATA_SIZE
    }

    fn send_init_download(&mut self, index: u16, subindex: u8) {
        let mut frame = self.init_frame();
        frame.set_client_command(ClientCommand::InitiateDownload);
        frame.set_index(index);
        frame.set_subindex(subindex);
        frame.indicate_size();

        if self.is_expedited() {
            let size = self.buffer.len();
            frame.expedite();
            frame.set_expedited_size(size);
            frame.data_mut()[EXPEDITED_DATA_IDX..EXPEDITED_DATA_IDX + size]
                .copy_from_slice(self.buffer.as_slice());
            frame.set_len(EXPEDITED_DATA_IDX + size);
        } else {
            frame.set_indicated_size(
                u32::try_from(self.buffer.len()).unwrap_or(u32::MAX),
            );
            frame.set_len(CAN_MAX_DLC);
        }

        self.timer.start();
        self.send(frame);
    }

    fn send_init_upload(&mut self, index: u16, subindex: u8) {
        let mut frame = self.init_frame();
        frame.set_client_command(ClientCommand::InitiateUpload);
        frame.set_index(index);
        frame.set_subindex(subindex);
        frame.set_len(UPLOAD_INIT_REQUEST_LEN);

        self.timer.start();
        self.send(frame);
    }

    fn request_download_segment(&mut self, transfer: &mut Transfer<S, T>) {
        let mut frame = self.init_frame();
        frame.set_client_command(ClientCommand::DownloadSegment);
        if transfer.is_toggled {
            frame.toggle();
        }

        let remaining = self.buffer.len() - transfer.pos;
        let size = SEGMENT_MAX_SIZE.min(remaining);
        debug_assert!(size > 0);

        frame.set_segment_size(size);
        frame.data_mut()[SEGMENT_IDX..SEGMENT_IDX + size]
            .copy_from_slice(&self.buffer.as_slice()[transfer.pos..transfer.pos + size]);
        frame.set_len(SEGMENT_IDX + size);
        transfer.pos += size;

        if self.is_at_end(transfer) {
            frame.end_segment();
        }

        self.timer.start();
        self.send(frame);
    }

    fn request_upload_segment(&mut self, transfer: &Transfer<S, T>) {
        let mut frame = self.init_frame();
        frame.set_client_command(ClientCommand::UploadSegment);
        if transfer.is_toggled {
            frame.toggle();
        }
        frame.set_len(UPLOAD_SEGMENT_REQUEST_LEN);

        self.timer.start();
        self.send(frame);
    }

    // --- Inbound frames ---

    fn is_at_end(&self, transfer: &Transfer<S, T>) -> bool {
        transfer.pos >= self.buffer.len()
    }

    fn echoes_multiplexer(&self, transfer: &Transfer<S, T>, frame: &SdoFrame) -> bool {
        self.quirks.ignore_multiplexer
            || (frame.index() == transfer.index && frame.subindex() == transfer.subindex)
    }

    fn check_init_response(
        &self,
        transfer: &Transfer<S, T>,
        frame: &SdoFrame,
        expected: ServerCommand,
    ) -> Result<(), SdoAbortCode> {
        if frame.len() < INIT_RESPONSE_MIN_LEN {
            return Err(SdoAbortCode::General);
        }
        if frame.server_command() != Some(expected) {
            return Err(SdoAbortCode::InvalidCommand);
        }
        if !self.echoes_multiplexer(transfer, frame) {
            return Err(SdoAbortCode::General);
        }
        Ok(())
    }

    fn feed_init_download_response(&mut self, transfer: &mut Transfer<S, T>, frame: &SdoFrame) -> Step {
        if let Err(code) = self.check_init_response(transfer, frame, ServerCommand::InitiateDownload) {
            return Step::Abort(code);
        }

        if self.is_expedited() {
            return Step::Done;
        }

        self.request_download_segment(transfer);
        transfer.phase = Phase::SegmentResponse;
        debug!("SDO node {}: segmented download accepted", self.node_id);
        Step::Continue
    }

    fn feed_init_upload_response(&mut self, transfer: &mut Transfer<S, T>, frame: &SdoFrame) -> Step {
        if let Err(code) = self.check_init_response(transfer, frame, ServerCommand::InitiateUpload) {
            return Step::Abort(code);
        }

        transfer.is_size_indicated = frame.is_size_indicated();

        if frame.is_expedited() {
            let size = if transfer.is_size_indicated {
                frame.expedited_size()
            } else {
                EXPEDITED_DATA_SIZE
            };
            return match self.buffer.assign(frame.expedited_data(size)) {
                Ok(()) => Step::Done,
                Err(_) => Step::Abort(SdoAbortCode::OutOfMemory),
            };
        }

        // Only a full frame actually carries the size field
        if transfer.is_size_indicated && frame.len() == CAN_MAX_DLC {
            let size = frame.indicated_size() as usize;
            if let Err(err) = self.buffer.reserve(size) {
                debug!("SDO node {}: cannot reserve {} bytes: {}", self.node_id, size, err);
                return Step::Abort(SdoAbortCode::OutOfMemory);
            }
        }

        self.request_upload_segment(transfer);
        transfer.phase = Phase::SegmentResponse;
        debug!("SDO node {}: segmented upload accepted", self.node_id);
        Step::Continue
    }

    fn feed_download_segment_response(&mut self, transfer: &mut Transfer<S, T>, frame: &SdoFrame) -> Step {
        if frame.len() < SEGMENT_RESPONSE_MIN_LEN {
            return Step::Abort(SdoAbortCode::General);
        }
        if frame.server_command() != Some(ServerCommand::DownloadSegment) {
            return Step::Abort(SdoAbortCode::InvalidCommand);
        }

        let at_end = self.is_at_end(transfer);
        if !at_end && frame.is_toggled() != transfer.is_toggled {
            return Step::Abort(SdoAbortCode::ToggleBitNotAlternated);
        }

        transfer.is_toggled = !transfer.is_toggled;

        if at_end {
            Step::Done
        } else {
            self.request_download_segment(transfer);
            Step::Continue
        }
    }

    fn feed_upload_segment_response(&mut self, transfer: &mut Transfer<S, T>, frame: &SdoFrame) -> Step {
        if frame.len() < SEGMENT_RESPONSE_MIN_LEN {
            return Step::Abort(SdoAbortCode::General);
        }
        if frame.server_command() != Some(ServerCommand::UploadSegment) {
            return Step::Abort(SdoAbortCode::InvalidCommand);
        }

        let is_end = frame.is_end_segment();
        if !is_end && frame.is_toggled() != transfer.is_toggled {
            return Step::Abort(SdoAbortCode::ToggleBitNotAlternated);
        }

        transfer.is_toggled = !transfer.is_toggled;

        if self.buffer.append(frame.segment_data()).is_err() {
            return Step::Abort(SdoAbortCode::OutOfMemory);
        }

        if is_end {
            Step::Done
        } else {
            self.request_upload_segment(transfer);
            Step::Continue
        }
    }
}

impl<S, T> fmt::Debug for SdoAsync<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdoAsync")
            .field("node_id", &self.node_id)
            .field("quirks", &self.quirks)
            .field("running", &self.transfer.is_some())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
