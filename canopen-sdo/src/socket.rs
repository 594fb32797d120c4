// socket.rs
use canopen_common::SdoFrame;
use socketcan::{CanFrame, CanSocket, Socket};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] canopen_common::SdoError),
    #[error("Transport closed")]
    Closed,
}

/// Outbound half of an SDO transport.
///
/// Inbound frames are routed to the engine by whoever owns it; the engine
/// itself only ever sends.
pub trait SdoSocket {
    fn send(&mut self, frame: &SdoFrame) -> Result<(), TransportError>;
}

/// A raw CAN socket shared between the reader task and every node engine
#[derive(Clone)]
pub struct CanBusSocket {
    socket: Arc<Mutex<CanSocket>>,
}

impl CanBusSocket {
    /// Open `interface` (e.g. `can0`, `vcan0`) in non-blocking mode
    pub fn open(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
        })
    }

    /// Read one frame if available; `Ok(None)` when the socket would block
    pub fn try_read(&self) -> Result<Option<CanFrame>, TransportError> {
        let socket = self.socket.lock().map_err(|_| TransportError::Closed)?;
        match socket.read_frame() {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl SdoSocket for CanBusSocket {
    fn send(&mut self, frame: &SdoFrame) -> Result<(), TransportError> {
        let can_frame = CanFrame::try_from(frame)?;
        let socket = self.socket.lock().map_err(|_| TransportError::Closed)?;
        socket.write_frame(&can_frame)?;
        Ok(())
    }
}

/// In-process transport: frames are handed to whoever holds the receiver
/// (a tunnel, a simulated bus, a test).
impl SdoSocket for mpsc::UnboundedSender<SdoFrame> {
    fn send(&mut self, frame: &SdoFrame) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, *frame).map_err(|_| TransportError::Closed)
    }
}
