// canopen-sdo/tests/round_trip.rs
mod support;

use canopen_common::{ClientCommand, SdoAbortCode, SdoFrame};
use canopen_sdo::{
    EngineConfig, SdoAsync, SdoCompletion, SdoStatus, SdoTransferRequest,
};
use rand::Rng;
use std::sync::{Arc, Mutex};
use support::{ManualTimer, SimulatedNode};
use tokio::sync::mpsc;

type Engine = SdoAsync<mpsc::UnboundedSender<SdoFrame>, ManualTimer>;

struct Harness {
    engine: Engine,
    bus: mpsc::UnboundedReceiver<SdoFrame>,
    node: SimulatedNode,
    timer: ManualTimer,
    /// Every frame the client put on the bus
    sent: Vec<SdoFrame>,
}

impl Harness {
    fn new(node: SimulatedNode, config: EngineConfig) -> Self {
        support::init_logging();
        let (tx, bus) = mpsc::unbounded_channel();
        let timer = ManualTimer::default();
        let engine = SdoAsync::new(3, tx, timer.clone(), config).unwrap();
        Self {
            engine,
            bus,
            node,
            timer,
            sent: Vec::new(),
        }
    }

    /// Shuttle frames between client and server until the bus is quiet
    fn run(&mut self) {
        while let Ok(request) = self.bus.try_recv() {
            self.sent.push(request);
            if let Some(response) = self.node.handle(&request) {
                let _ = self.engine.feed(&response);
            }
        }
    }

    fn transfer(&mut self, request: SdoTransferRequest<'_, mpsc::UnboundedSender<SdoFrame>, ManualTimer>) -> SdoStatus {
        let status = Arc::new(Mutex::new(None));
        let sink = status.clone();
        self.engine
            .start(request.on_done(move |_: &mut Engine, completion: &SdoCompletion| {
                *sink.lock().unwrap() = Some(completion.status);
            }))
            .unwrap();
        self.run();

        assert!(!self.engine.is_running());
        assert!(!self.timer.is_armed());
        let status = status.lock().unwrap().take();
        status.expect("transfer did not complete")
    }

    fn download_segments(&self) -> usize {
        self.sent
            .iter()
            .filter(|frame| frame.client_command() == Some(ClientCommand::DownloadSegment))
            .count()
    }
}

#[test]
fn random_payloads_survive_download_and_upload() {
    let mut rng = rand::rng();
    let mut harness = Harness::new(SimulatedNode::new(3), EngineConfig::default());

    for len in [1usize, 3, 4, 5, 7, 8, 14, 15, 20, 64, 255, 1000] {
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let subindex = rng.random_range(1..=0xFE);

        harness.sent.clear();
        let status = harness.transfer(SdoTransferRequest::download(0x2100, subindex, &data));
        assert_eq!(status, SdoStatus::Ok, "download of {} bytes", len);
        assert_eq!(harness.node.object(0x2100, subindex), Some(&data[..]));

        let expected_segments = if len <= 4 { 0 } else { len.div_ceil(7) };
        assert_eq!(harness.download_segments(), expected_segments, "{} bytes", len);

        let status = harness.transfer(SdoTransferRequest::upload(0x2100, subindex));
        assert_eq!(status, SdoStatus::Ok, "upload of {} bytes", len);
        assert_eq!(harness.engine.buffer(), &data[..]);
    }
}

#[test]
fn segmented_upload_of_device_name() {
    let name = b"Simulated CANopen node, firmware 1.2.3";
    let node = SimulatedNode::new(3).with_object(0x1008, 0x00, name);
    let mut harness = Harness::new(node, EngineConfig::default());

    let status = harness.transfer(SdoTransferRequest::upload(0x1008, 0x00));
    assert_eq!(status, SdoStatus::Ok);
    assert_eq!(harness.engine.buffer(), &name[..]);
    // initiate plus one request per segment
    assert_eq!(harness.sent.len(), 1 + name.len().div_ceil(7));
}

#[test]
fn missing_object_is_a_remote_abort() {
    let mut harness = Harness::new(SimulatedNode::new(3), EngineConfig::default());

    let status = harness.transfer(SdoTransferRequest::upload(0x5FFF, 0x01));
    assert_eq!(
        status,
        SdoStatus::RemoteAbort(SdoAbortCode::ObjectDoesNotExist.code())
    );
    // The client does not answer an abort
    assert_eq!(harness.sent.len(), 1);
}

#[test]
fn broken_toggle_is_aborted() {
    let mut node = SimulatedNode::new(3).with_object(0x1008, 0x00, &[0xAA; 20]);
    node.break_toggle = true;
    let mut harness = Harness::new(node, EngineConfig::default());

    let status = harness.transfer(SdoTransferRequest::upload(0x1008, 0x00));
    assert_eq!(
        status,
        SdoStatus::LocalAbort(SdoAbortCode::ToggleBitNotAlternated)
    );
    assert_eq!(
        harness.node.aborts(),
        vec![SdoAbortCode::ToggleBitNotAlternated.code()]
    );
}

#[test]
fn broken_download_confirmation_is_aborted() {
    let mut node = SimulatedNode::new(3);
    node.break_download_toggle = true;
    let mut harness = Harness::new(node, EngineConfig::default());

    let status = harness.transfer(SdoTransferRequest::download(0x2000, 0x00, &[0x55; 20]));
    assert_eq!(
        status,
        SdoStatus::LocalAbort(SdoAbortCode::ToggleBitNotAlternated)
    );
    assert_eq!(harness.download_segments(), 1);
    assert_eq!(
        harness.node.aborts(),
        vec![SdoAbortCode::ToggleBitNotAlternated.code()]
    );
    assert_eq!(harness.node.object(0x2000, 0x00), None);
}

#[test]
fn last_download_confirmation_toggle_is_not_checked() {
    let mut node = SimulatedNode::new(3);
    node.break_download_toggle = true;
    let mut harness = Harness::new(node, EngineConfig::default());

    // Six bytes go out as a single end segment
    let status = harness.transfer(SdoTransferRequest::download(0x2000, 0x00, &[1, 2, 3, 4, 5, 6]));
    assert_eq!(status, SdoStatus::Ok);
    assert_eq!(harness.download_segments(), 1);
    assert!(harness.node.aborts().is_empty());
    assert_eq!(harness.node.object(0x2000, 0x00), Some(&[1, 2, 3, 4, 5, 6][..]));
}

#[test]
fn multiplexer_quirk() {
    let mut node = SimulatedNode::new(3).with_object(0x1018, 0x01, &[0x78, 0x56, 0x34, 0x12]);
    node.wrong_multiplexer = true;

    let mut strict = Harness::new(node, EngineConfig::default());
    let status = strict.transfer(SdoTransferRequest::upload(0x1018, 0x01));
    assert_eq!(status, SdoStatus::LocalAbort(SdoAbortCode::General));

    let mut node = SimulatedNode::new(3).with_object(0x1018, 0x01, &[0x78, 0x56, 0x34, 0x12]);
    node.wrong_multiplexer = true;
    let mut config = EngineConfig::default();
    config.quirks.ignore_multiplexer = true;

    let mut lenient = Harness::new(node, config);
    let status = lenient.transfer(SdoTransferRequest::upload(0x1018, 0x01));
    assert_eq!(status, SdoStatus::Ok);
    assert_eq!(lenient.engine.buffer(), &[0x78, 0x56, 0x34, 0x12]);
}

#[test]
fn full_length_quirk_pads_every_request() {
    let mut config = EngineConfig::default();
    config.quirks.force_full_frame_length = true;
    let node = SimulatedNode::new(3).with_object(0x1008, 0x00, &[1; 12]);
    let mut harness = Harness::new(node, config);

    assert_eq!(harness.transfer(SdoTransferRequest::download(0x2000, 0x01, &[5])), SdoStatus::Ok);
    assert_eq!(harness.transfer(SdoTransferRequest::upload(0x1008, 0x00)), SdoStatus::Ok);

    assert!(harness.sent.iter().all(|frame| frame.len() == 8));
    assert_eq!(harness.node.object(0x2000, 0x01), Some(&[5u8][..]));
}

#[test]
fn silent_node_times_out() {
    let mut node = SimulatedNode::new(3);
    node.silent = true;
    let mut harness = Harness::new(node, EngineConfig::default());

    let status = Arc::new(Mutex::new(None));
    let sink = status.clone();
    harness
        .engine
        .start(
            SdoTransferRequest::download(0x2000, 0x00, &[1, 2, 3, 4, 5, 6])
                .on_done(move |_: &mut Engine, completion: &SdoCompletion| {
                    *sink.lock().unwrap() = Some(completion.status);
                }),
        )
        .unwrap();
    harness.run();
    assert!(harness.timer.is_armed());

    harness.engine.on_timeout().unwrap();
    harness.run();

    assert_eq!(
        *status.lock().unwrap(),
        Some(SdoStatus::LocalAbort(SdoAbortCode::Timeout))
    );
    assert_eq!(harness.node.aborts(), vec![SdoAbortCode::Timeout.code()]);
}
