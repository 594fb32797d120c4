// canopen-sdo/tests/support/mod.rs
#![allow(dead_code)]

use canopen_common::sdo::{EXPEDITED_DATA_SIZE, SEGMENT_MAX_SIZE};
use canopen_common::{
    request_cob_id, response_cob_id, ClientCommand, SdoAbortCode, SdoFrame, ServerCommand,
};
use canopen_sdo::Timer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Server side of an SDO transfer in progress
#[derive(Debug)]
enum ServerState {
    Idle,
    Downloading {
        index: u16,
        subindex: u8,
        data: Vec<u8>,
        toggle: bool,
    },
    Uploading {
        data: Vec<u8>,
        pos: usize,
        toggle: bool,
    },
}

/// An in-memory SDO server with a flat object dictionary.
///
/// Serves expedited and segmented transfers the way a conforming node does,
/// with a few switches to misbehave on purpose.
pub struct SimulatedNode {
    node_id: u8,
    objects: HashMap<(u16, u8), Vec<u8>>,
    state: ServerState,
    /// Every request seen, aborts included
    pub received: Vec<SdoFrame>,
    /// Answer nothing at all
    pub silent: bool,
    /// Send segments with the toggle bit inverted
    pub break_toggle: bool,
    /// Confirm download segments with the toggle bit inverted
    pub break_download_toggle: bool,
    /// Echo index 0 in every initiate response
    pub wrong_multiplexer: bool,
}

impl SimulatedNode {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            objects: HashMap::new(),
            state: ServerState::Idle,
            received: Vec::new(),
            silent: false,
            break_toggle: false,
            break_download_toggle: false,
            wrong_multiplexer: false,
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn with_object(mut self, index: u16, subindex: u8, data: &[u8]) -> Self {
        self.objects.insert((index, subindex), data.to_vec());
        self
    }

    pub fn object(&self, index: u16, subindex: u8) -> Option<&[u8]> {
        self.objects.get(&(index, subindex)).map(Vec::as_slice)
    }

    pub fn aborts(&self) -> Vec<u32> {
        self.received
            .iter()
            .filter(|frame| frame.client_command() == Some(ClientCommand::Abort))
            .map(SdoFrame::abort_code)
            .collect()
    }

    fn reply(&self) -> SdoFrame {
        SdoFrame::new(response_cob_id(self.node_id))
    }

    fn abort(&mut self, index: u16, subindex: u8, code: SdoAbortCode) -> Option<SdoFrame> {
        self.state = ServerState::Idle;
        let mut frame = self.reply();
        frame.abort(code, index, subindex);
        Some(frame)
    }

    fn initiate_reply(&self, command: ServerCommand, index: u16, subindex: u8) -> SdoFrame {
        let mut frame = self.reply();
        frame.set_server_command(command);
        if !self.wrong_multiplexer {
            frame.set_index(index);
            frame.set_subindex(subindex);
        }
        frame.set_len(8);
        frame
    }

    /// Process one client request, returning the response if any
    pub fn handle(&mut self, request: &SdoFrame) -> Option<SdoFrame> {
        assert_eq!(request.cob_id(), request_cob_id(self.node_id));
        self.received.push(*request);

        if self.silent {
            return None;
        }

        match request.client_command()? {
            ClientCommand::InitiateDownload => self.initiate_download(request),
            ClientCommand::DownloadSegment => self.download_segment(request),
            ClientCommand::InitiateUpload => self.initiate_upload(request),
            ClientCommand::UploadSegment => self.upload_segment(request),
            ClientCommand::Abort => {
                self.state = ServerState::Idle;
                None
            }
        }
    }

    fn initiate_download(&mut self, request: &SdoFrame) -> Option<SdoFrame> {
        let (index, subindex) = (request.index(), request.subindex());

        if request.is_expedited() {
            let size = if request.is_size_indicated() {
                request.expedited_size()
            } else {
                EXPEDITED_DATA_SIZE
            };
            self.objects
                .insert((index, subindex), request.expedited_data(size).to_vec());
            self.state = ServerState::Idle;
        } else {
            let capacity = request.indicated_size() as usize;
            self.state = ServerState::Downloading {
                index,
                subindex,
                data: Vec::with_capacity(capacity),
                toggle: false,
            };
        }

        Some(self.initiate_reply(ServerCommand::InitiateDownload, index, subindex))
    }

    fn download_segment(&mut self, request: &SdoFrame) -> Option<SdoFrame> {
        let break_toggle = self.break_download_toggle;
        let node_id = self.node_id;
        let ServerState::Downloading {
            index,
            subindex,
            data,
            toggle,
        } = &mut self.state
        else {
            return self.abort(0, 0, SdoAbortCode::InvalidCommand);
        };
        let (index, subindex) = (*index, *subindex);

        if request.is_toggled() != *toggle {
            return self.abort(index, subindex, SdoAbortCode::ToggleBitNotAlternated);
        }

        data.extend_from_slice(request.segment_data());
        let mut frame = SdoFrame::new(response_cob_id(node_id));
        frame.set_server_command(ServerCommand::DownloadSegment);
        if *toggle != break_toggle {
            frame.toggle();
        }
        frame.set_len(8);
        *toggle = !*toggle;

        if request.is_end_segment() {
            let data = std::mem::take(data);
            self.objects.insert((index, subindex), data);
            self.state = ServerState::Idle;
        }

        Some(frame)
    }

    fn initiate_upload(&mut self, request: &SdoFrame) -> Option<SdoFrame> {
        let (index, subindex) = (request.index(), request.subindex());
        let Some(data) = self.objects.get(&(index, subindex)).cloned() else {
            return self.abort(index, subindex, SdoAbortCode::ObjectDoesNotExist);
        };

        let mut frame = self.initiate_reply(ServerCommand::InitiateUpload, index, subindex);
        frame.indicate_size();

        if data.len() <= EXPEDITED_DATA_SIZE {
            frame.expedite();
            frame.set_expedited_size(data.len());
            frame.data_mut()[4..4 + data.len()].copy_from_slice(&data);
            self.state = ServerState::Idle;
        } else {
            frame.set_indicated_size(data.len() as u32);
            self.state = ServerState::Uploading {
                data,
                pos: 0,
                toggle: false,
            };
        }

        Some(frame)
    }

    fn upload_segment(&mut self, request: &SdoFrame) -> Option<SdoFrame> {
        let break_toggle = self.break_toggle;
        let node_id = self.node_id;
        let ServerState::Uploading { data, pos, toggle } = &mut self.state else {
            return self.abort(0, 0, SdoAbortCode::InvalidCommand);
        };

        if request.is_toggled() != *toggle {
            return self.abort(0, 0, SdoAbortCode::ToggleBitNotAlternated);
        }

        let size = SEGMENT_MAX_SIZE.min(data.len() - *pos);
        let mut frame = SdoFrame::new(response_cob_id(node_id));
        frame.set_server_command(ServerCommand::UploadSegment);
        if *toggle != break_toggle {
            frame.toggle();
        }
        frame.set_segment_size(size);
        frame.data_mut()[1..1 + size].copy_from_slice(&data[*pos..*pos + size]);
        frame.set_len(8);

        *pos += size;
        *toggle = !*toggle;
        if *pos >= data.len() {
            frame.end_segment();
            self.state = ServerState::Idle;
        }

        Some(frame)
    }
}

/// Timer that is only armed or not; expiry is delivered by the test
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<(Duration, bool)>>,
}

impl ManualTimer {
    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().1
    }

    pub fn period(&self) -> Duration {
        self.state.lock().unwrap().0
    }
}

impl Timer for ManualTimer {
    fn set_time(&mut self, period: Duration) {
        self.state.lock().unwrap().0 = period;
    }

    fn start(&mut self) {
        self.state.lock().unwrap().1 = true;
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().1 = false;
    }
}
