// connect.rs
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopen_common::sdo::SDO_RESPONSE_BASE;
use canopen_common::{SdoAbortCode, SdoFrame};
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ClientConfig, Quirks};
use crate::engine::{
    Context, SdoAsync, SdoAsyncError, SdoCompletion, SdoDirection, SdoStatus, SdoTransferRequest,
};
use crate::socket::{CanBusSocket, SdoSocket, TransportError};
use crate::timer::DeadlineTimer;

/// Engine type driven by the connection manager
pub type NodeEngine<S> = SdoAsync<S, DeadlineTimer>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Node {0} not connected")]
    NodeNotConnected(u8),
    #[error("Node {0} already added")]
    NodeAlreadyAdded(u8),
    #[error("Transfer on node {0} was cancelled")]
    Cancelled(u8),
    #[error("SDO 0x{index:04X}:{subindex:02X} aborted locally: {code}")]
    LocalAbort {
        index: u16,
        subindex: u8,
        code: SdoAbortCode,
    },
    #[error("SDO 0x{index:04X}:{subindex:02X} aborted by node with code 0x{code:08X}")]
    RemoteAbort { index: u16, subindex: u8, code: u32 },
    #[error("Connection manager stopped")]
    ManagerStopped,
    #[error("Request rejected: {0}")]
    Engine(#[from] SdoAsyncError),
}

impl ConnectionError {
    /// The SDO abort code carried by this error, if any
    pub fn abort_code(&self) -> Option<u32> {
        match self {
            Self::LocalAbort { code, .. } => Some(code.code()),
            Self::RemoteAbort { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Internal message types for the connection manager
enum ConnectionMessage {
    AddNode {
        node_id: u8,
        quirks: Option<Quirks>,
        timeout: Option<Duration>,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    RemoveNode {
        node_id: u8,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Transfer {
        node_id: u8,
        transfer: PendingTransfer,
    },
}

/// Where the outcome of a transfer is delivered
enum Responder {
    Upload(oneshot::Sender<Result<Vec<u8>, ConnectionError>>),
    Download(oneshot::Sender<Result<(), ConnectionError>>),
}

impl Responder {
    fn send(self, result: Result<Vec<u8>, ConnectionError>) {
        // A caller that went away no longer cares
        match self {
            Self::Upload(tx) => {
                let _ = tx.send(result);
            }
            Self::Download(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
        }
    }
}

/// Shared between the completion handler and the context release, whichever
/// runs first answers the caller
type ResponderSlot = Arc<Mutex<Option<Responder>>>;

fn take_responder(slot: &ResponderSlot) -> Option<Responder> {
    slot.lock().ok().and_then(|mut responder| responder.take())
}

/// A queued SDO request
struct PendingTransfer {
    index: u16,
    subindex: u8,
    /// `Some` for a download
    data: Option<Vec<u8>>,
    timeout: Option<Duration>,
    responder: Responder,
}

/// Per-node state management
struct NodeState<S> {
    engine: NodeEngine<S>,
    // Requests waiting for the engine (FIFO)
    pending: VecDeque<PendingTransfer>,
    // Node-specific timeout
    timeout: Duration,
}

impl<S: SdoSocket + 'static> NodeState<S> {
    fn new(engine: NodeEngine<S>, timeout: Duration) -> Self {
        Self {
            engine,
            pending: VecDeque::new(),
            timeout,
        }
    }

    fn queue(&mut self, transfer: PendingTransfer) {
        self.pending.push_back(transfer);
    }

    /// Start queued requests until one is running or the queue is empty
    fn start_next(&mut self) {
        while !self.engine.is_running() {
            let Some(transfer) = self.pending.pop_front() else {
                return;
            };
            self.start(transfer);
        }
    }

    fn start(&mut self, transfer: PendingTransfer) {
        let node_id = self.engine.node_id();
        let PendingTransfer {
            index,
            subindex,
            data,
            timeout,
            responder,
        } = transfer;

        let slot: ResponderSlot = Arc::new(Mutex::new(Some(responder)));
        let done_slot = slot.clone();

        let request = match &data {
            Some(bytes) => SdoTransferRequest::download(index, subindex, bytes),
            None => SdoTransferRequest::upload(index, subindex),
        };
        let request = request
            .timeout(timeout.unwrap_or(self.timeout))
            .on_done(move |engine: &mut NodeEngine<S>, completion: &SdoCompletion| {
                if let Some(responder) = take_responder(&done_slot) {
                    responder.send(completion_result(completion, engine.buffer()));
                }
            })
            .context(Box::new(slot.clone()), move |context: Context| {
                // Reached with an unanswered caller only when the transfer was stopped
                if let Ok(slot) = context.downcast::<ResponderSlot>() {
                    if let Some(responder) = take_responder(&slot) {
                        responder.send(Err(ConnectionError::Cancelled(node_id)));
                    }
                }
            });

        if let Err(err) = self.engine.start(request) {
            warn!(
                "Node {}: could not start SDO 0x{:04X}:{:02X}: {}",
                node_id, index, subindex, err
            );
            if let Some(responder) = take_responder(&slot) {
                responder.send(Err(err.into()));
            }
        }
    }

    /// Fail everything this node still owes an answer to
    fn cancel_all(&mut self, error: impl Fn() -> ConnectionError) {
        if self.engine.is_running() {
            let _ = self.engine.stop();
        }
        for transfer in self.pending.drain(..) {
            transfer.responder.send(Err(error()));
        }
    }
}

fn completion_result(completion: &SdoCompletion, buffer: &[u8]) -> Result<Vec<u8>, ConnectionError> {
    let (index, subindex) = (completion.index, completion.subindex);
    match completion.status {
        SdoStatus::Ok => match completion.direction {
            SdoDirection::Upload => Ok(buffer.to_vec()),
            SdoDirection::Download => Ok(Vec::new()),
        },
        SdoStatus::LocalAbort(code) => Err(ConnectionError::LocalAbort {
            index,
            subindex,
            code,
        }),
        SdoStatus::RemoteAbort(code) => Err(ConnectionError::RemoteAbort {
            index,
            subindex,
            code,
        }),
    }
}

/// Main SDO connection handle
#[derive(Clone)]
pub struct SdoConnection {
    command_tx: mpsc::UnboundedSender<ConnectionMessage>,
    _tasks: Arc<Vec<JoinHandle<()>>>,
}

impl SdoConnection {
    /// Open the CAN interface named in `config` and start the connection
    /// manager on it
    pub async fn open(config: &ClientConfig) -> Result<Self, ConnectionError> {
        let socket = CanBusSocket::open(&config.can_interface)?;
        info!("Opened CAN interface {}", config.can_interface);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(can_reader_task(socket.clone(), frame_tx));

        Ok(Self::spawn(socket, frame_rx, config.clone(), vec![reader_task]))
    }

    /// Run the connection manager over an arbitrary transport.
    ///
    /// `socket` is cloned into every node engine; `frames` yields every frame
    /// seen on the bus, SDO responses are picked out by COB-ID.
    pub fn with_transport<S>(socket: S, frames: mpsc::UnboundedReceiver<SdoFrame>, config: ClientConfig) -> Self
    where
        S: SdoSocket + Clone + Send + 'static,
    {
        Self::spawn(socket, frames, config, Vec::new())
    }

    fn spawn<S>(
        socket: S,
        frames: mpsc::UnboundedReceiver<SdoFrame>,
        config: ClientConfig,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Self
    where
        S: SdoSocket + Clone + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(connection_manager_task(
            socket, command_rx, frames, config,
        )));

        Self {
            command_tx,
            _tasks: Arc::new(tasks),
        }
    }

    /// Add a node using its configured quirks and timeout
    pub async fn add_node(&self, node_id: u8) -> Result<SdoNodeHandle, ConnectionError> {
        self.add_node_with(node_id, None, None).await
    }

    /// Add a node, overriding the configured quirks and/or timeout
    pub async fn add_node_with(
        &self,
        node_id: u8,
        quirks: Option<Quirks>,
        timeout: Option<Duration>,
    ) -> Result<SdoNodeHandle, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ConnectionMessage::AddNode {
                node_id,
                quirks,
                timeout,
                response_tx,
            })
            .map_err(|_| ConnectionError::ManagerStopped)?;

        response_rx
            .await
            .map_err(|_| ConnectionError::ManagerStopped)??;

        Ok(SdoNodeHandle {
            node_id,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Forget a node. A running transfer is stopped without notifying the
    /// peer; its caller and any queued callers get an error.
    pub async fn remove_node(&self, node_id: u8) -> Result<(), ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ConnectionMessage::RemoveNode {
                node_id,
                response_tx,
            })
            .map_err(|_| ConnectionError::ManagerStopped)?;

        response_rx
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?
    }
}

/// Handle for SDO transfers with a specific node.
///
/// Requests from every clone of a handle are queued and run one at a time.
#[derive(Clone)]
pub struct SdoNodeHandle {
    node_id: u8,
    command_tx: mpsc::UnboundedSender<ConnectionMessage>,
}

impl SdoNodeHandle {
    /// Read `index`/`subindex` from the node
    pub async fn upload(&self, index: u16, subindex: u8) -> Result<Vec<u8>, ConnectionError> {
        self.upload_inner(index, subindex, None).await
    }

    pub async fn upload_with_timeout(
        &self,
        index: u16,
        subindex: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        self.upload_inner(index, subindex, Some(timeout)).await
    }

    /// Write `data` to `index`/`subindex` on the node
    pub async fn download(&self, index: u16, subindex: u8, data: &[u8]) -> Result<(), ConnectionError> {
        self.download_inner(index, subindex, data, None).await
    }

    pub async fn download_with_timeout(
        &self,
        index: u16,
        subindex: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.download_inner(index, subindex, data, Some(timeout)).await
    }

    /// Get the node ID for this handle
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    async fn upload_inner(
        &self,
        index: u16,
        subindex: u8,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(PendingTransfer {
            index,
            subindex,
            data: None,
            timeout,
            responder: Responder::Upload(response_tx),
        })?;

        response_rx
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?
    }

    async fn download_inner(
        &self,
        index: u16,
        subindex: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(PendingTransfer {
            index,
            subindex,
            data: Some(data.to_vec()),
            timeout,
            responder: Responder::Download(response_tx),
        })?;

        response_rx
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?
    }

    fn submit(&self, transfer: PendingTransfer) -> Result<(), ConnectionError> {
        self.command_tx
            .send(ConnectionMessage::Transfer {
                node_id: self.node_id,
                transfer,
            })
            .map_err(|_| ConnectionError::ManagerStopped)
    }
}

/// Poll the non-blocking CAN socket and forward every frame
async fn can_reader_task(socket: CanBusSocket, frame_tx: mpsc::UnboundedSender<SdoFrame>) {
    loop {
        match socket.try_read() {
            Ok(Some(can_frame)) => match SdoFrame::try_from(&can_frame) {
                Ok(frame) => {
                    if frame_tx.send(frame).is_err() {
                        break; // Channel closed
                    }
                }
                Err(err) => trace!("Skipping CAN frame: {}", err),
            },
            Ok(None) => {
                if frame_tx.is_closed() {
                    break;
                }
                // No frame available, sleep briefly
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(err) => {
                warn!("CAN read failed: {}", err);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("CAN reader stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Background task that owns every node engine
async fn connection_manager_task<S>(
    socket: S,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionMessage>,
    mut frame_rx: mpsc::UnboundedReceiver<SdoFrame>,
    config: ClientConfig,
) where
    S: SdoSocket + Clone + Send + 'static,
{
    let mut nodes: HashMap<u8, NodeState<S>> = HashMap::new();
    let mut frames_open = true;

    // Main event loop
    loop {
        let next_deadline = nodes
            .values()
            .filter_map(|node| node.engine.timer().deadline())
            .min();

        tokio::select! {
            // Handle commands from the API
            command = command_rx.recv() => {
                match command {
                    Some(command) => handle_command(&mut nodes, &socket, &config, command),
                    None => break, // Channel closed
                }
            }

            // Handle incoming frames
            frame = frame_rx.recv(), if frames_open => {
                match frame {
                    Some(frame) => handle_frame(&mut nodes, &frame),
                    None => {
                        warn!("Frame source closed, pending transfers will time out");
                        frames_open = false;
                    }
                }
            }

            // Deliver the earliest expired timer
            _ = sleep_until_deadline(next_deadline) => {
                handle_timeouts(&mut nodes, Instant::now());
            }
        }

        // Process any pending requests that can be started
        for node in nodes.values_mut() {
            node.start_next();
        }
    }

    for node in nodes.values_mut() {
        node.cancel_all(|| ConnectionError::ManagerStopped);
    }
    debug!("Connection manager stopped");
}

fn handle_command<S>(
    nodes: &mut HashMap<u8, NodeState<S>>,
    socket: &S,
    config: &ClientConfig,
    command: ConnectionMessage,
) where
    S: SdoSocket + Clone + 'static,
{
    match command {
        ConnectionMessage::AddNode {
            node_id,
            quirks,
            timeout,
            response_tx,
        } => {
            let _ = response_tx.send(add_node(nodes, socket, config, node_id, quirks, timeout));
        }

        ConnectionMessage::RemoveNode {
            node_id,
            response_tx,
        } => {
            let result = match nodes.remove(&node_id) {
                Some(mut node) => {
                    node.cancel_all(|| ConnectionError::NodeNotConnected(node_id));
                    info!("Removed node {}", node_id);
                    Ok(())
                }
                None => Err(ConnectionError::NodeNotConnected(node_id)),
            };
            let _ = response_tx.send(result);
        }

        ConnectionMessage::Transfer { node_id, transfer } => match nodes.get_mut(&node_id) {
            Some(node) => node.queue(transfer),
            None => transfer
                .responder
                .send(Err(ConnectionError::NodeNotConnected(node_id))),
        },
    }
}

fn add_node<S>(
    nodes: &mut HashMap<u8, NodeState<S>>,
    socket: &S,
    config: &ClientConfig,
    node_id: u8,
    quirks: Option<Quirks>,
    timeout: Option<Duration>,
) -> Result<(), ConnectionError>
where
    S: SdoSocket + Clone + 'static,
{
    if nodes.contains_key(&node_id) {
        return Err(ConnectionError::NodeAlreadyAdded(node_id));
    }

    let mut engine_config = config.engine_config(node_id);
    if let Some(quirks) = quirks {
        engine_config.quirks = quirks;
    }
    let timeout = timeout.unwrap_or_else(|| config.timeout_for(node_id));

    let engine = SdoAsync::new(node_id, socket.clone(), DeadlineTimer::new(), engine_config)?;
    nodes.insert(node_id, NodeState::new(engine, timeout));
    info!(
        "Added node {} (timeout {:?}, {:?})",
        node_id, timeout, engine_config.quirks
    );
    Ok(())
}

fn handle_frame<S: SdoSocket>(nodes: &mut HashMap<u8, NodeState<S>>, frame: &SdoFrame) {
    // Only SDO responses (0x580 + node_id) are ours
    let cob_id = frame.cob_id();
    if !(SDO_RESPONSE_BASE + 1..=SDO_RESPONSE_BASE + 0x7F).contains(&cob_id) {
        return;
    }
    let node_id = (cob_id - SDO_RESPONSE_BASE) as u8;

    if let Some(node) = nodes.get_mut(&node_id) {
        if let Err(err) = node.engine.feed(frame) {
            trace!("Node {}: dropped {}: {}", node_id, frame, err);
        }
    }
}

fn handle_timeouts<S: SdoSocket>(nodes: &mut HashMap<u8, NodeState<S>>, now: Instant) {
    for node in nodes.values_mut() {
        if node.engine.timer().is_expired(now) {
            let _ = node.engine.on_timeout();
        }
    }
}
