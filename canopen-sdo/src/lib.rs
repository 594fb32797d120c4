//! Asynchronous CANopen SDO client.
//!
//! [`SdoAsync`] is a non-blocking transfer engine for one remote node: it
//! performs expedited and segmented uploads and downloads, driven entirely by
//! the frames and timer expiries its owner feeds it. The transport and the
//! timer are traits so the engine runs on a SocketCAN interface, over an
//! in-process channel, or under a test harness alike.
//!
//! [`SdoConnection`] is a tokio host for a set of engines on one bus, with a
//! request queue per node and an async API on [`SdoNodeHandle`].

pub mod buffer;
pub mod config;
pub mod connect;
pub mod engine;
pub mod socket;
pub mod timer;

pub use buffer::{BufferError, SdoBuffer};
pub use config::{ClientConfig, ConfigError, EngineConfig, NodeConfig, Quirks};
pub use connect::{ConnectionError, NodeEngine, SdoConnection, SdoNodeHandle};
pub use engine::{
    SdoAsync, SdoAsyncError, SdoCompletion, SdoDirection, SdoStatus, SdoTransferRequest,
};
pub use socket::{CanBusSocket, SdoSocket, TransportError};
pub use timer::{DeadlineTimer, Timer};

pub use canopen_common::{SdoAbortCode, SdoFrame};
