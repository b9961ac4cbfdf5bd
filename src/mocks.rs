//! Mocked implementations of the collaborator seams for use in test.
//!
//! Each mock routes its calls into a channel of call events so tests can
//! assert on the exact sequence of side effects.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::a2dp::{
    A2dpCodecConfig, AvCodecNegotiation, AvFeatures, AvStatus, BtStatus, BtavAudioState,
    BtavConnectionState,
};
use crate::audio::{PeerReadySender, SinkAudioEngine, SourceAudioEngine};
use crate::avrcp::{AvrcpHandler, RcEvent};
use crate::bluetooth_av::{BluetoothAv, IBluetoothAvSink, IBluetoothAvSource, MAX_PEERS};
use crate::callbacks::{CallbackMessage, IAvSinkCallbacks, IAvSourceCallbacks};
use crate::event::{AvEvent, RegisterData, StartData, SuspendData};
use crate::peer::{PeerSep, TransportHandle};
use crate::transport::AvTransport;
use crate::{Address, Message, Stack};

pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Events representing calls to AvTransport.
#[derive(Debug, PartialEq)]
pub enum TransportCall {
    Enable(AvFeatures),
    Disable,
    Register(u8),
    Deregister(TransportHandle),
    Open(Address, TransportHandle),
    Close(TransportHandle),
    Start(TransportHandle, bool),
    Stop(TransportHandle, bool),
    OpenRc(TransportHandle),
    CloseRc(TransportHandle),
    OffloadStart(TransportHandle),
    SetLatency(TransportHandle, bool),
}

/// Routes calls to AvTransport into a channel of TransportCalls.
pub struct MockAvTransport(UnboundedSender<TransportCall>);

impl MockAvTransport {
    pub fn new() -> (Self, UnboundedReceiver<TransportCall>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

impl AvTransport for MockAvTransport {
    fn enable(&mut self, features: AvFeatures) {
        self.0.send(TransportCall::Enable(features)).unwrap();
    }

    fn disable(&mut self) {
        self.0.send(TransportCall::Disable).unwrap();
    }

    fn register(&mut self, peer_id: u8, _service_name: &str, _sep: PeerSep) {
        self.0.send(TransportCall::Register(peer_id)).unwrap();
    }

    fn deregister(&mut self, handle: TransportHandle) {
        self.0.send(TransportCall::Deregister(handle)).unwrap();
    }

    fn open(&mut self, address: Address, handle: TransportHandle) {
        self.0.send(TransportCall::Open(address, handle)).unwrap();
    }

    fn close(&mut self, handle: TransportHandle) {
        self.0.send(TransportCall::Close(handle)).unwrap();
    }

    fn start(&mut self, handle: TransportHandle, use_latency_mode: bool) {
        self.0.send(TransportCall::Start(handle, use_latency_mode)).unwrap();
    }

    fn stop(&mut self, handle: TransportHandle, suspend: bool) {
        self.0.send(TransportCall::Stop(handle, suspend)).unwrap();
    }

    fn open_rc(&mut self, handle: TransportHandle) {
        self.0.send(TransportCall::OpenRc(handle)).unwrap();
    }

    fn close_rc(&mut self, handle: TransportHandle) {
        self.0.send(TransportCall::CloseRc(handle)).unwrap();
    }

    fn offload_start(&mut self, handle: TransportHandle) {
        self.0.send(TransportCall::OffloadStart(handle)).unwrap();
    }

    fn set_latency(&mut self, handle: TransportHandle, is_low_latency: bool) {
        self.0.send(TransportCall::SetLatency(handle, is_low_latency)).unwrap();
    }
}

/// Events representing calls to SourceAudioEngine.
#[derive(Debug, PartialEq)]
pub enum SourceAudioCall {
    Init,
    Cleanup,
    OnStarted(Address, Option<AvStatus>),
    OnStopped(Option<AvStatus>),
    OnSuspended(AvStatus, bool),
    OnIdle,
    OnOffloadStarted(Address, AvStatus),
    CommandAck(BtStatus),
    SetTxFlush(bool),
    StartSession(Address),
    EndSession(Address),
    RestartSession(Option<Address>, Address),
    Shutdown,
    EncoderUserConfigUpdate(Address, usize),
    UpdateCodecOffloadingCapabilities(usize),
    SetAudioDelay(u16),
    ResetAudioDelay,
    SetRemoteDelay(u16),
    SetDynamicAudioBufferSize(u8),
    CodecExtVersion(Address),
    CodecExtConfig(Address),
    SetCodecExtConfig(Address, usize),
    SetCodecExtData(Address, usize),
}

/// Routes calls to SourceAudioEngine into a channel of SourceAudioCalls.
pub struct MockSourceAudioEngine {
    tx: UnboundedSender<SourceAudioCall>,
    /// Whether on_started acknowledgements are delivered.
    pub ack_started: Arc<Mutex<bool>>,
    /// Whether restart_session reports success.
    pub restart_ok: Arc<Mutex<bool>>,
    /// When set, shutdown never signals completion.
    pub hang_shutdown: Arc<Mutex<bool>>,
}

impl MockSourceAudioEngine {
    pub fn new() -> (Self, UnboundedReceiver<SourceAudioCall>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                tx,
                ack_started: Arc::new(Mutex::new(true)),
                restart_ok: Arc::new(Mutex::new(true)),
                hang_shutdown: Arc::new(Mutex::new(false)),
            },
            rx,
        )
    }
}

impl SourceAudioEngine for MockSourceAudioEngine {
    fn init(&mut self) -> bool {
        self.tx.send(SourceAudioCall::Init).unwrap();
        true
    }

    fn cleanup(&mut self) {
        self.tx.send(SourceAudioCall::Cleanup).unwrap();
    }

    fn on_started(&mut self, address: &Address, start: Option<&StartData>) -> bool {
        self.tx.send(SourceAudioCall::OnStarted(*address, start.map(|s| s.status))).unwrap();
        *self.ack_started.lock().unwrap()
    }

    fn on_stopped(&mut self, suspend: Option<&SuspendData>) {
        self.tx.send(SourceAudioCall::OnStopped(suspend.map(|s| s.status))).unwrap();
    }

    fn on_suspended(&mut self, suspend: &SuspendData) {
        self.tx.send(SourceAudioCall::OnSuspended(suspend.status, suspend.initiator)).unwrap();
    }

    fn on_idle(&mut self) {
        self.tx.send(SourceAudioCall::OnIdle).unwrap();
    }

    fn on_offload_started(&mut self, address: &Address, status: AvStatus) {
        self.tx.send(SourceAudioCall::OnOffloadStarted(*address, status)).unwrap();
    }

    fn command_ack(&mut self, status: BtStatus) {
        self.tx.send(SourceAudioCall::CommandAck(status)).unwrap();
    }

    fn set_tx_flush(&mut self, enable: bool) {
        self.tx.send(SourceAudioCall::SetTxFlush(enable)).unwrap();
    }

    fn start_session(&mut self, address: Address, reply: PeerReadySender) {
        self.tx.send(SourceAudioCall::StartSession(address)).unwrap();
        let _ = reply.send(());
    }

    fn end_session(&mut self, address: Address) {
        self.tx.send(SourceAudioCall::EndSession(address)).unwrap();
    }

    fn restart_session(
        &mut self,
        old_address: Option<Address>,
        new_address: Address,
        reply: PeerReadySender,
    ) -> bool {
        self.tx.send(SourceAudioCall::RestartSession(old_address, new_address)).unwrap();
        let _ = reply.send(());
        *self.restart_ok.lock().unwrap()
    }

    fn shutdown(&mut self, done: std::sync::mpsc::Sender<()>) {
        self.tx.send(SourceAudioCall::Shutdown).unwrap();
        if !*self.hang_shutdown.lock().unwrap() {
            let _ = done.send(());
        }
    }

    fn encoder_user_config_update(
        &mut self,
        address: Address,
        codec_preferences: Vec<A2dpCodecConfig>,
        reply: PeerReadySender,
    ) {
        self.tx
            .send(SourceAudioCall::EncoderUserConfigUpdate(address, codec_preferences.len()))
            .unwrap();
        let _ = reply.send(());
    }

    fn update_codec_offloading_capabilities(&mut self, offloading_preference: &[A2dpCodecConfig]) {
        self.tx
            .send(SourceAudioCall::UpdateCodecOffloadingCapabilities(offloading_preference.len()))
            .unwrap();
    }

    fn set_audio_delay(&mut self, delay: u16) {
        self.tx.send(SourceAudioCall::SetAudioDelay(delay)).unwrap();
    }

    fn reset_audio_delay(&mut self) {
        self.tx.send(SourceAudioCall::ResetAudioDelay).unwrap();
    }

    fn set_remote_delay(&mut self, delay: u16) {
        self.tx.send(SourceAudioCall::SetRemoteDelay(delay)).unwrap();
    }

    fn set_dynamic_audio_buffer_size(&mut self, size: u8) {
        self.tx.send(SourceAudioCall::SetDynamicAudioBufferSize(size)).unwrap();
    }

    fn codec_ext_version(&mut self, address: &Address) -> Vec<u8> {
        self.tx.send(SourceAudioCall::CodecExtVersion(*address)).unwrap();
        vec![1, 0]
    }

    fn codec_ext_config(&mut self, address: &Address) -> Vec<u8> {
        self.tx.send(SourceAudioCall::CodecExtConfig(*address)).unwrap();
        Vec::new()
    }

    fn set_codec_ext_config(&mut self, address: &Address, config: Vec<u8>) -> BtStatus {
        self.tx.send(SourceAudioCall::SetCodecExtConfig(*address, config.len())).unwrap();
        BtStatus::Success
    }

    fn set_codec_ext_data(&mut self, address: &Address, data: Vec<u8>) {
        self.tx.send(SourceAudioCall::SetCodecExtData(*address, data.len())).unwrap();
    }
}

/// Events representing calls to SinkAudioEngine.
#[derive(Debug, PartialEq)]
pub enum SinkAudioCall {
    Init,
    Cleanup,
    OnStart,
    OnStopped(Option<AvStatus>),
    OnSuspended(AvStatus),
    OnIdle,
    SetRxFlush(bool),
    StartSession(Address),
    EndSession(Address),
    RestartSession(Option<Address>, Address),
    Shutdown,
    SetFocusState(i32),
    SetAudioTrackGain(f32),
}

/// Routes calls to SinkAudioEngine into a channel of SinkAudioCalls.
pub struct MockSinkAudioEngine {
    tx: UnboundedSender<SinkAudioCall>,
    pub restart_ok: Arc<Mutex<bool>>,
}

impl MockSinkAudioEngine {
    pub fn new() -> (Self, UnboundedReceiver<SinkAudioCall>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, restart_ok: Arc::new(Mutex::new(true)) }, rx)
    }
}

impl SinkAudioEngine for MockSinkAudioEngine {
    fn init(&mut self) -> bool {
        self.tx.send(SinkAudioCall::Init).unwrap();
        true
    }

    fn cleanup(&mut self) {
        self.tx.send(SinkAudioCall::Cleanup).unwrap();
    }

    fn on_start(&mut self) {
        self.tx.send(SinkAudioCall::OnStart).unwrap();
    }

    fn on_stopped(&mut self, suspend: Option<&SuspendData>) {
        self.tx.send(SinkAudioCall::OnStopped(suspend.map(|s| s.status))).unwrap();
    }

    fn on_suspended(&mut self, suspend: &SuspendData) {
        self.tx.send(SinkAudioCall::OnSuspended(suspend.status)).unwrap();
    }

    fn on_idle(&mut self) {
        self.tx.send(SinkAudioCall::OnIdle).unwrap();
    }

    fn set_rx_flush(&mut self, enable: bool) {
        self.tx.send(SinkAudioCall::SetRxFlush(enable)).unwrap();
    }

    fn start_session(&mut self, address: Address, reply: PeerReadySender) {
        self.tx.send(SinkAudioCall::StartSession(address)).unwrap();
        let _ = reply.send(());
    }

    fn end_session(&mut self, address: Address) {
        self.tx.send(SinkAudioCall::EndSession(address)).unwrap();
    }

    fn restart_session(
        &mut self,
        old_address: Option<Address>,
        new_address: Address,
        reply: PeerReadySender,
    ) -> bool {
        self.tx.send(SinkAudioCall::RestartSession(old_address, new_address)).unwrap();
        let _ = reply.send(());
        *self.restart_ok.lock().unwrap()
    }

    fn shutdown(&mut self) {
        self.tx.send(SinkAudioCall::Shutdown).unwrap();
    }

    fn set_focus_state(&mut self, state: i32) {
        self.tx.send(SinkAudioCall::SetFocusState(state)).unwrap();
    }

    fn set_audio_track_gain(&mut self, gain: f32) {
        self.tx.send(SinkAudioCall::SetAudioTrackGain(gain)).unwrap();
    }
}

/// Events representing calls to AvCodecNegotiation.
#[derive(Debug, PartialEq)]
pub enum CodecCall {
    Init(usize),
    SetActivePeer(Option<Address>),
}

pub struct MockCodecNegotiation {
    tx: UnboundedSender<CodecCall>,
    pub accept: Arc<Mutex<bool>>,
}

impl MockCodecNegotiation {
    pub fn new() -> (Self, UnboundedReceiver<CodecCall>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, accept: Arc::new(Mutex::new(true)) }, rx)
    }
}

impl AvCodecNegotiation for MockCodecNegotiation {
    fn init(&mut self, codec_priorities: &[A2dpCodecConfig]) {
        self.tx.send(CodecCall::Init(codec_priorities.len())).unwrap();
    }

    fn set_active_peer(&mut self, peer_address: Option<Address>) -> bool {
        self.tx.send(CodecCall::SetActivePeer(peer_address)).unwrap();
        *self.accept.lock().unwrap()
    }
}

/// Events representing calls to AvrcpHandler.
#[derive(Debug, PartialEq)]
pub enum RcCall {
    HandleEvent(Option<Address>, &'static str),
    CheckPendingPlay(Address, bool),
}

pub struct MockAvrcpHandler {
    tx: UnboundedSender<RcCall>,
    /// Peers whose AVRCP channel is currently up.
    pub connected: Arc<Mutex<HashSet<Address>>>,
    pub handles: Arc<Mutex<HashMap<Address, TransportHandle>>>,
}

impl MockAvrcpHandler {
    pub fn new() -> (Self, UnboundedReceiver<RcCall>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                tx,
                connected: Arc::new(Mutex::new(HashSet::new())),
                handles: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }
}

impl AvrcpHandler for MockAvrcpHandler {
    fn handle_event(&mut self, address: Option<Address>, event: &RcEvent) {
        self.tx.send(RcCall::HandleEvent(address, event.name())).unwrap();
    }

    fn is_connected_peer(&self, address: &Address) -> bool {
        self.connected.lock().unwrap().contains(address)
    }

    fn connected_peer_handle(&self, address: &Address) -> Option<TransportHandle> {
        self.handles.lock().unwrap().get(address).copied()
    }

    fn check_pending_play(&mut self, address: &Address, accepted: bool) {
        self.tx.send(RcCall::CheckPendingPlay(*address, accepted)).unwrap();
    }
}

/// Callbacks that swallow every notification. Tests assert on the callback
/// channel instead.
pub struct NullSourceCallbacks;

impl IAvSourceCallbacks for NullSourceCallbacks {
    fn connection_state(&mut self, _address: Address, _state: BtavConnectionState) {}

    fn audio_state(&mut self, _address: Address, _state: BtavAudioState) {}

    fn audio_config(
        &mut self,
        _address: Address,
        _codec_config: A2dpCodecConfig,
        _codecs_local_capabilities: Vec<A2dpCodecConfig>,
        _codecs_selectable_capabilities: Vec<A2dpCodecConfig>,
    ) {
    }

    fn mandatory_codec_preferred(&mut self, _address: Address) -> bool {
        false
    }
}

pub struct NullSinkCallbacks;

impl IAvSinkCallbacks for NullSinkCallbacks {
    fn connection_state(&mut self, _address: Address, _state: BtavConnectionState) {}

    fn audio_state(&mut self, _address: Address, _state: BtavAudioState) {}

    fn audio_config(&mut self, _address: Address, _sample_rate: i32, _channel_count: i32) {}
}

/// A fully mocked `BluetoothAv` plus the receiving ends of every channel.
pub struct TestStack {
    pub av: BluetoothAv,
    pub msg_rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
    pub cb_rx: tokio::sync::mpsc::UnboundedReceiver<CallbackMessage>,
    pub transport_rx: UnboundedReceiver<TransportCall>,
    pub source_audio_rx: UnboundedReceiver<SourceAudioCall>,
    pub sink_audio_rx: UnboundedReceiver<SinkAudioCall>,
    pub codec_rx: UnboundedReceiver<CodecCall>,
    pub rc_rx: UnboundedReceiver<RcCall>,
    pub ack_started: Arc<Mutex<bool>>,
    pub source_restart_ok: Arc<Mutex<bool>>,
    pub rc_connected: Arc<Mutex<HashSet<Address>>>,
    pub rc_handles: Arc<Mutex<HashMap<Address, TransportHandle>>>,
}

impl TestStack {
    pub fn new() -> TestStack {
        let (tx, msg_rx) = Stack::create_channel();
        let (cb_tx, cb_rx) = Stack::create_callback_channel();
        let (transport, transport_rx) = MockAvTransport::new();
        let (source_audio, source_audio_rx) = MockSourceAudioEngine::new();
        let ack_started = source_audio.ack_started.clone();
        let source_restart_ok = source_audio.restart_ok.clone();
        let (sink_audio, sink_audio_rx) = MockSinkAudioEngine::new();
        let (codec, codec_rx) = MockCodecNegotiation::new();
        let (rc, rc_rx) = MockAvrcpHandler::new();
        let rc_connected = rc.connected.clone();
        let rc_handles = rc.handles.clone();

        let av = BluetoothAv::new(
            tx,
            cb_tx,
            Box::new(transport),
            Box::new(source_audio),
            Box::new(sink_audio),
            Box::new(codec),
            Box::new(rc),
        );

        TestStack {
            av,
            msg_rx,
            cb_rx,
            transport_rx,
            source_audio_rx,
            sink_audio_rx,
            codec_rx,
            rc_rx,
            ack_started,
            source_restart_ok,
            rc_connected,
            rc_handles,
        }
    }

    /// Initializes the source side and plays back the Register events the
    /// transport would confirm, binding peer id N to handle 0x41 + N.
    pub fn init_source(&mut self, max_connected_audio_devices: i32) {
        let status = IBluetoothAvSource::init(
            &mut self.av,
            Box::new(NullSourceCallbacks),
            max_connected_audio_devices,
            vec![],
            vec![],
        );
        assert_eq!(status, BtStatus::Success);
        for peer_id in 0..MAX_PEERS {
            self.av.handle_transport_event(
                PeerSep::Sink,
                AvEvent::Register(RegisterData {
                    handle: 0x41 + peer_id as TransportHandle,
                    peer_id,
                    status: AvStatus::Success,
                }),
            );
        }
        self.drain_all();
    }

    /// Initializes the sink side, mirroring `init_source`.
    pub fn init_sink(&mut self, max_connected_audio_devices: i32) {
        let status = IBluetoothAvSink::init(
            &mut self.av,
            Box::new(NullSinkCallbacks),
            max_connected_audio_devices,
        );
        assert_eq!(status, BtStatus::Success);
        for peer_id in 0..MAX_PEERS {
            self.av.handle_transport_event(
                PeerSep::Source,
                AvEvent::Register(RegisterData {
                    handle: 0x41 + peer_id as TransportHandle,
                    peer_id,
                    status: AvStatus::Success,
                }),
            );
        }
        self.drain_all();
    }

    /// Feeds queued control messages back into the core, the way the
    /// dispatch loop would.
    pub fn pump(&mut self) {
        while let Ok(m) = self.msg_rx.try_recv() {
            self.av.handle_message(m);
        }
    }

    pub fn callbacks(&mut self) -> Vec<CallbackMessage> {
        drain(&mut self.cb_rx)
    }

    pub fn transport_calls(&mut self) -> Vec<TransportCall> {
        drain(&mut self.transport_rx)
    }

    pub fn source_audio_calls(&mut self) -> Vec<SourceAudioCall> {
        drain(&mut self.source_audio_rx)
    }

    pub fn sink_audio_calls(&mut self) -> Vec<SinkAudioCall> {
        drain(&mut self.sink_audio_rx)
    }

    pub fn codec_calls(&mut self) -> Vec<CodecCall> {
        drain(&mut self.codec_rx)
    }

    pub fn rc_calls(&mut self) -> Vec<RcCall> {
        drain(&mut self.rc_rx)
    }

    pub fn drain_all(&mut self) {
        self.callbacks();
        self.transport_calls();
        self.source_audio_calls();
        self.sink_audio_calls();
        self.codec_calls();
        self.rc_calls();
    }
}
