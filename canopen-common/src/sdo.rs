// sdo.rs - SDO frame layout shared by clients and tooling
use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};
use std::fmt;
use thiserror::Error;

/// Maximum data length of a classic CAN frame
pub const CAN_MAX_DLC: usize = 8;

/// Bytes of payload carried inline by an expedited initiate frame
pub const EXPEDITED_DATA_SIZE: usize = 4;
/// Offset of the inline payload in an expedited initiate frame
pub const EXPEDITED_DATA_IDX: usize = 4;

/// Bytes of payload carried by one segment frame
pub const SEGMENT_MAX_SIZE: usize = 7;
/// Offset of the payload in a segment frame
pub const SEGMENT_IDX: usize = 1;

/// COB-ID base of client -> server SDO frames (RSDO)
pub const SDO_REQUEST_BASE: u16 = 0x600;
/// COB-ID base of server -> client SDO frames (TSDO)
pub const SDO_RESPONSE_BASE: u16 = 0x580;

const CS_SHIFT: u8 = 5;
const TOGGLE_BIT: u8 = 0x10;
const EXPEDITED_BIT: u8 = 0x02;
const SIZE_INDICATED_BIT: u8 = 0x01;
const END_SEGMENT_BIT: u8 = 0x01;

/// COB-ID a client uses to address `node_id`
pub fn request_cob_id(node_id: u8) -> u16 {
    SDO_REQUEST_BASE + node_id as u16
}

/// COB-ID `node_id` answers on
pub fn response_cob_id(node_id: u8) -> u16 {
    SDO_RESPONSE_BASE + node_id as u16
}

/// Client command specifiers (ccs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientCommand {
    /// Download segment request
    DownloadSegment = 0,
    /// Initiate domain download (write)
    InitiateDownload = 1,
    /// Initiate domain upload (read)
    InitiateUpload = 2,
    /// Upload segment request
    UploadSegment = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = SdoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::DownloadSegment),
            1 => Ok(Self::InitiateDownload),
            2 => Ok(Self::InitiateUpload),
            3 => Ok(Self::UploadSegment),
            4 => Ok(Self::Abort),
            other => Err(SdoError::UnknownCommand(other)),
        }
    }
}

/// Server command specifiers (scs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerCommand {
    /// Upload segment response
    UploadSegment = 0,
    /// Download segment response
    DownloadSegment = 1,
    /// Initiate upload response
    InitiateUpload = 2,
    /// Initiate download response
    InitiateDownload = 3,
    /// Abort transfer
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = SdoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::UploadSegment),
            1 => Ok(Self::DownloadSegment),
            2 => Ok(Self::InitiateUpload),
            3 => Ok(Self::InitiateDownload),
            4 => Ok(Self::Abort),
            other => Err(SdoError::UnknownCommand(other)),
        }
    }
}

/// SDO abort codes (CiA 301, table 22)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SdoAbortCode {
    ToggleBitNotAlternated = 0x0503_0000,
    Timeout = 0x0504_0000,
    InvalidCommand = 0x0504_0001,
    InvalidBlockSize = 0x0504_0002,
    InvalidSequenceNumber = 0x0504_0003,
    CrcError = 0x0504_0004,
    OutOfMemory = 0x0504_0005,
    UnsupportedAccess = 0x0601_0000,
    WriteOnly = 0x0601_0001,
    ReadOnly = 0x0601_0002,
    ObjectDoesNotExist = 0x0602_0000,
    ObjectCannotBeMapped = 0x0604_0041,
    PdoLengthExceeded = 0x0604_0042,
    ParameterIncompatibility = 0x0604_0043,
    InternalIncompatibility = 0x0604_0047,
    HardwareError = 0x0606_0000,
    LengthMismatch = 0x0607_0010,
    LengthTooHigh = 0x0607_0012,
    LengthTooLow = 0x0607_0013,
    SubindexDoesNotExist = 0x0609_0011,
    ValueRangeExceeded = 0x0609_0030,
    ValueTooHigh = 0x0609_0031,
    ValueTooLow = 0x0609_0032,
    MaxLessThanMin = 0x0609_0036,
    General = 0x0800_0000,
    TransferOrStorage = 0x0800_0020,
    LocalControl = 0x0800_0021,
    DeviceState = 0x0800_0022,
}

impl SdoAbortCode {
    const ALL: [SdoAbortCode; 28] = [
        Self::ToggleBitNotAlternated,
        Self::Timeout,
        Self::InvalidCommand,
        Self::InvalidBlockSize,
        Self::InvalidSequenceNumber,
        Self::CrcError,
        Self::OutOfMemory,
        Self::UnsupportedAccess,
        Self::WriteOnly,
        Self::ReadOnly,
        Self::ObjectDoesNotExist,
        Self::ObjectCannotBeMapped,
        Self::PdoLengthExceeded,
        Self::ParameterIncompatibility,
        Self::InternalIncompatibility,
        Self::HardwareError,
        Self::LengthMismatch,
        Self::LengthTooHigh,
        Self::LengthTooLow,
        Self::SubindexDoesNotExist,
        Self::ValueRangeExceeded,
        Self::ValueTooHigh,
        Self::ValueTooLow,
        Self::MaxLessThanMin,
        Self::General,
        Self::TransferOrStorage,
        Self::LocalControl,
        Self::DeviceState,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human-readable description of the abort code
    pub fn description(self) -> &'static str {
        match self {
            Self::ToggleBitNotAlternated => "Toggle bit not alternated",
            Self::Timeout => "SDO protocol timed out",
            Self::InvalidCommand => "Client/server command specifier not valid or unknown",
            Self::InvalidBlockSize => "Invalid block size",
            Self::InvalidSequenceNumber => "Invalid sequence number",
            Self::CrcError => "CRC error",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::WriteOnly => "Attempt to read a write only object",
            Self::ReadOnly => "Attempt to write a read only object",
            Self::ObjectDoesNotExist => "Object does not exist in the object dictionary",
            Self::ObjectCannotBeMapped => "Object cannot be mapped to the PDO",
            Self::PdoLengthExceeded => "The number and length of the objects to be mapped would exceed PDO length",
            Self::ParameterIncompatibility => "General parameter incompatibility reason",
            Self::InternalIncompatibility => "General internal incompatibility in the device",
            Self::HardwareError => "Access failed due to a hardware error",
            Self::LengthMismatch => "Data type does not match, length of service parameter does not match",
            Self::LengthTooHigh => "Data type does not match, length of service parameter too high",
            Self::LengthTooLow => "Data type does not match, length of service parameter too low",
            Self::SubindexDoesNotExist => "Sub-index does not exist",
            Self::ValueRangeExceeded => "Value range of parameter exceeded (only for write access)",
            Self::ValueTooHigh => "Value of parameter written too high",
            Self::ValueTooLow => "Value of parameter written too low",
            Self::MaxLessThanMin => "Maximum value is less than minimum value",
            Self::General => "General error",
            Self::TransferOrStorage => "Data cannot be transferred or stored to the application",
            Self::LocalControl => "Data cannot be transferred or stored to the application because of local control",
            Self::DeviceState => "Data cannot be transferred or stored to the application because of the present device state",
        }
    }
}

impl TryFrom<u32> for SdoAbortCode {
    type Error = SdoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.code() == value)
            .ok_or(SdoError::UnknownAbortCode(value))
    }
}

impl fmt::Display for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} ({})", self.code(), self.description())
    }
}

/// Get human-readable description of any SDO abort code, known or not
pub fn describe_abort_code(code: u32) -> String {
    match SdoAbortCode::try_from(code) {
        Ok(known) => known.description().to_string(),
        Err(_) => format!("Unknown abort code: 0x{:08X}", code),
    }
}

/// Errors raised while building or converting SDO frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdoError {
    #[error("Invalid CAN ID 0x{0:X}")]
    InvalidCobId(u32),
    #[error("Extended (29 bit) CAN IDs are not used by SDO")]
    ExtendedId,
    #[error("Remote frames carry no SDO data")]
    RemoteFrame,
    #[error("Frame payload of {0} bytes exceeds 8 bytes")]
    PayloadTooLong(usize),
    #[error("Unknown command specifier {0}")]
    UnknownCommand(u8),
    #[error("Unknown abort code: 0x{0:08X}")]
    UnknownAbortCode(u32),
    #[error("Failed to create CAN frame")]
    FrameConstruction,
}

/// One SDO message: COB-ID, logical length and the 8 byte data field.
///
/// Field accessors always look at the full data field, the same way a
/// zero-initialised CAN frame would be read, so a short frame simply
/// reports zeros for bytes beyond its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoFrame {
    cob_id: u16,
    len: usize,
    data: [u8; CAN_MAX_DLC],
}

impl SdoFrame {
    /// Create a cleared frame of length zero
    pub fn new(cob_id: u16) -> Self {
        Self {
            cob_id,
            len: 0,
            data: [0; CAN_MAX_DLC],
        }
    }

    /// Create a frame holding `payload` verbatim
    pub fn from_payload(cob_id: u16, payload: &[u8]) -> Result<Self, SdoError> {
        if payload.len() > CAN_MAX_DLC {
            return Err(SdoError::PayloadTooLong(payload.len()));
        }
        let mut frame = Self::new(cob_id);
        frame.data[..payload.len()].copy_from_slice(payload);
        frame.len = payload.len();
        Ok(frame)
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the logical length (DLC); clamped to 8
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(CAN_MAX_DLC);
    }

    /// The bytes that go on the wire
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The full data field, independent of the logical length
    pub fn data(&self) -> &[u8; CAN_MAX_DLC] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; CAN_MAX_DLC] {
        &mut self.data
    }

    // --- Command specifier ---

    /// Raw 3 bit command specifier
    pub fn command_specifier(&self) -> u8 {
        self.data[0] >> CS_SHIFT
    }

    pub fn set_client_command(&mut self, command: ClientCommand) {
        self.set_command_specifier(command as u8);
    }

    pub fn set_server_command(&mut self, command: ServerCommand) {
        self.set_command_specifier(command as u8);
    }

    fn set_command_specifier(&mut self, cs: u8) {
        self.data[0] = (self.data[0] & 0x1F) | (cs << CS_SHIFT);
    }

    /// Command specifier read as a server response; `None` for block transfer
    /// and other specifiers a segmented client never expects
    pub fn server_command(&self) -> Option<ServerCommand> {
        ServerCommand::try_from(self.command_specifier()).ok()
    }

    /// Command specifier read as a client request
    pub fn client_command(&self) -> Option<ClientCommand> {
        ClientCommand::try_from(self.command_specifier()).ok()
    }

    // --- Multiplexer ---

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.data[1], self.data[2]])
    }

    pub fn set_index(&mut self, index: u16) {
        self.data[1..3].copy_from_slice(&index.to_le_bytes());
    }

    pub fn subindex(&self) -> u8 {
        self.data[3]
    }

    pub fn set_subindex(&mut self, subindex: u8) {
        self.data[3] = subindex;
    }

    // --- Initiate frames ---

    pub fn is_expedited(&self) -> bool {
        self.data[0] & EXPEDITED_BIT != 0
    }

    pub fn expedite(&mut self) {
        self.data[0] |= EXPEDITED_BIT;
    }

    pub fn is_size_indicated(&self) -> bool {
        self.data[0] & SIZE_INDICATED_BIT != 0
    }

    pub fn indicate_size(&mut self) {
        self.data[0] |= SIZE_INDICATED_BIT;
    }

    /// Number of inline bytes in an expedited frame (`4 - n`)
    pub fn expedited_size(&self) -> usize {
        EXPEDITED_DATA_SIZE - ((self.data[0] >> 2) & 0x03) as usize
    }

    /// Encode the number of inline bytes; `size` must be 1..=4
    pub fn set_expedited_size(&mut self, size: usize) {
        debug_assert!((1..=EXPEDITED_DATA_SIZE).contains(&size));
        let n = (EXPEDITED_DATA_SIZE - size) as u8 & 0x03;
        self.data[0] = (self.data[0] & !0x0C) | (n << 2);
    }

    /// Total transfer size declared by a segmented initiate frame
    pub fn indicated_size(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn set_indicated_size(&mut self, size: u32) {
        self.data[4..8].copy_from_slice(&size.to_le_bytes());
    }

    /// Inline bytes of an expedited frame
    pub fn expedited_data(&self, size: usize) -> &[u8] {
        let size = size.min(EXPEDITED_DATA_SIZE);
        &self.data[EXPEDITED_DATA_IDX..EXPEDITED_DATA_IDX + size]
    }

    // --- Segment frames ---

    pub fn is_toggled(&self) -> bool {
        self.data[0] & TOGGLE_BIT != 0
    }

    pub fn toggle(&mut self) {
        self.data[0] |= TOGGLE_BIT;
    }

    pub fn is_end_segment(&self) -> bool {
        self.data[0] & END_SEGMENT_BIT != 0
    }

    pub fn end_segment(&mut self) {
        self.data[0] |= END_SEGMENT_BIT;
    }

    /// Number of payload bytes in a segment frame (`7 - n`)
    pub fn segment_size(&self) -> usize {
        SEGMENT_MAX_SIZE - ((self.data[0] >> 1) & 0x07) as usize
    }

    /// Encode the number of segment payload bytes; `size` must be 0..=7
    pub fn set_segment_size(&mut self, size: usize) {
        debug_assert!(size <= SEGMENT_MAX_SIZE);
        let n = (SEGMENT_MAX_SIZE - size.min(SEGMENT_MAX_SIZE)) as u8;
        self.data[0] = (self.data[0] & !0x0E) | (n << 1);
    }

    /// Payload bytes of a segment frame as declared by its header
    pub fn segment_data(&self) -> &[u8] {
        &self.data[SEGMENT_IDX..SEGMENT_IDX + self.segment_size()]
    }

    // --- Abort ---

    /// Turn this frame into an abort for `index`/`subindex`
    pub fn abort(&mut self, code: SdoAbortCode, index: u16, subindex: u8) {
        self.data = [0; CAN_MAX_DLC];
        self.set_client_command(ClientCommand::Abort);
        self.set_index(index);
        self.set_subindex(subindex);
        self.data[4..8].copy_from_slice(&code.code().to_le_bytes());
        self.len = CAN_MAX_DLC;
    }

    pub fn abort_code(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }
}

impl TryFrom<&CanFrame> for SdoFrame {
    type Error = SdoError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        if frame.is_remote_frame() {
            return Err(SdoError::RemoteFrame);
        }
        let cob_id = match frame.id() {
            Id::Standard(std_id) => std_id.as_raw(),
            Id::Extended(_) => return Err(SdoError::ExtendedId),
        };
        Self::from_payload(cob_id, frame.data())
    }
}

impl TryFrom<&SdoFrame> for CanFrame {
    type Error = SdoError;

    fn try_from(frame: &SdoFrame) -> Result<Self, SdoError> {
        let id = StandardId::new(frame.cob_id)
            .ok_or(SdoError::InvalidCobId(frame.cob_id as u32))?;
        CanFrame::new(id, frame.payload()).ok_or(SdoError::FrameConstruction)
    }
}

impl fmt::Display for SdoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [{}] {:02X?}", self.cob_id, self.len, self.payload())
    }
}
