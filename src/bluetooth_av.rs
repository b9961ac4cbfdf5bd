//! Anything related to the per-peer A2DP session registries.
//!
//! Two symmetric registries track the remote peers: the source side owns
//! peers whose stream endpoint is a Sink, the sink side owns peers whose
//! stream endpoint is a Source. Each registry enforces the max-connections
//! policy, maps peer ids to transport handles and tracks its active peer.
//! All mutation is serialized through the control loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::a2dp::{
    A2dpCodecBitsPerSample, A2dpCodecChannelMode, A2dpCodecConfig, A2dpCodecSampleRate,
    AvCodecNegotiation, AvFeatures, BtStatus, BtavAudioState, BtavConnectionState,
};
use crate::audio::{PeerReadySender, SinkAudioEngine, SourceAudioEngine};
use crate::avrcp::AvrcpHandler;
use crate::callbacks::{
    CallbackMessage, IAvSinkCallbacks, IAvSourceCallbacks, SharedSinkCallbacks,
    SharedSourceCallbacks,
};
use crate::config_util;
use crate::event::AvEvent;
use crate::peer::{
    Peer, PeerFlags, PeerSep, PeerState, TransportHandle, AV_OPEN_ON_RC_TIMEOUT_MS, HANDLE_UNKNOWN,
};
use crate::transport::AvTransport;
use crate::{Address, Message};

const SOURCE_SERVICE_NAME: &str = "Advanced Audio Source";
const SINK_SERVICE_NAME: &str = "Advanced Audio Sink";

/// Number of stream endpoint slots registered with the transport per side.
/// Peer ids are allocated densely below this bound.
pub const MAX_PEERS: u8 = 6;

const DEFAULT_MAX_CONNECTED_AUDIO_DEVICES: usize = 1;

/// Bound on the wait for the source pipeline to wind down when the active
/// peer is cleared.
const AUDIO_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

lazy_static! {
    // Hosts the per-peer AV-open-on-RC timers. A single worker keeps the
    // expiry posts serialized with each other.
    static ref TIMER_RUNTIME: Runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("bt_av_timer")
        .enable_time()
        .build()
        .unwrap();
}

/// Registry mechanics shared by the source and sink sides.
pub(crate) struct PeerPool {
    pub(crate) enabled: bool,
    pub(crate) max_connected_peers: usize,
    pub(crate) peers: HashMap<Address, Peer>,
    pub(crate) peer_id_to_handle: HashMap<u8, TransportHandle>,
    pub(crate) active_peer: Option<Address>,
}

impl PeerPool {
    fn new() -> PeerPool {
        PeerPool {
            enabled: false,
            max_connected_peers: DEFAULT_MAX_CONNECTED_AUDIO_DEVICES,
            peers: HashMap::new(),
            peer_id_to_handle: HashMap::new(),
            active_peer: None,
        }
    }

    pub(crate) fn find_peer(&self, address: &Address) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub(crate) fn find_peer_mut(&mut self, address: &Address) -> Option<&mut Peer> {
        self.peers.get_mut(address)
    }

    pub(crate) fn find_address_by_handle(&self, handle: TransportHandle) -> Option<Address> {
        self.peers.values().find(|p| p.handle() == handle).map(|p| *p.address())
    }

    fn find_peer_by_peer_id(&self, peer_id: u8) -> Option<&Peer> {
        self.peers.values().find(|p| p.peer_id() == peer_id)
    }

    fn find_peer_by_peer_id_mut(&mut self, peer_id: u8) -> Option<&mut Peer> {
        self.peers.values_mut().find(|p| p.peer_id() == peer_id)
    }

    pub(crate) fn is_active(&self, address: &Address) -> bool {
        self.active_peer == Some(*address)
    }

    /// Returns an existing peer or creates one in Idle. Fails when no peer
    /// id is free or an unknown handle cannot be resolved from the
    /// registered bindings.
    pub(crate) fn find_or_create_peer(
        &mut self,
        address: Address,
        bta_handle: TransportHandle,
        sep: PeerSep,
    ) -> bool {
        if self.peers.contains_key(&address) {
            return true;
        }

        // Find next available peer id to use
        let peer_id = match (0..MAX_PEERS).find(|id| self.find_peer_by_peer_id(*id).is_none()) {
            Some(id) => id,
            None => {
                error!(
                    "Cannot create peer for peer_address={} : cannot allocate unique peer id",
                    address
                );
                return false;
            }
        };

        // Get the transport handle (if known)
        let handle = if bta_handle == HANDLE_UNKNOWN {
            match self.peer_id_to_handle.get(&peer_id) {
                Some(h) if *h != HANDLE_UNKNOWN => *h,
                _ => {
                    error!(
                        "Cannot create peer for peer_address={} : cannot convert peer id {} \
                         to unique transport handle",
                        address, peer_id
                    );
                    return false;
                }
            }
        } else {
            bta_handle
        };

        info!(
            "Create peer: peer_address={} handle=0x{:x} peer_id={}",
            address, handle, peer_id
        );
        self.peers.insert(address, Peer::new(address, sep, handle, peer_id));

        // The sink side has no upper-layer active-device manager; the first
        // connected Source peer becomes active.
        if sep == PeerSep::Source && self.active_peer.is_none() {
            self.active_peer = Some(address);
        }
        true
    }

    /// Admission check against the maximum number of connected peers. Peers
    /// already connecting or connected are counted; a peer that is itself
    /// among them is always admitted.
    pub(crate) fn allowed_to_connect(&self, address: &Address) -> bool {
        let mut connected = 0;
        for peer in self.peers.values() {
            if peer.state().is_connecting_or_connected() {
                if peer.address() == address {
                    return true; // Already connected or accounted for
                }
                connected += 1;
            }
        }
        connected < self.max_connected_peers
    }

    /// Binds a peer id to the transport handle returned by a Register
    /// event, correcting any peer that was created before the binding.
    pub(crate) fn handle_registered(&mut self, peer_id: u8, handle: TransportHandle) {
        self.peer_id_to_handle.insert(peer_id, handle);

        if let Some(peer) = self.find_peer_by_peer_id_mut(peer_id) {
            if peer.handle() != handle {
                if peer.handle() == HANDLE_UNKNOWN {
                    debug!(
                        "Assign peer: peer_address={} handle=0x{:x} peer_id={}",
                        peer.address(),
                        handle,
                        peer_id
                    );
                } else {
                    warn!(
                        "Correct peer: peer_address={} handle=0x{:x}->0x{:x} peer_id={}",
                        peer.address(),
                        peer.handle(),
                        handle,
                        peer_id
                    );
                }
                peer.set_handle(handle);
            }
        }
    }

    /// Frees every peer that re-entered Idle. A peer that was just created
    /// cannot be deleted yet.
    pub(crate) fn delete_idle_peers(&mut self) {
        let deletable: Vec<Address> = self
            .peers
            .values()
            .filter(|p| p.can_be_deleted())
            .map(|p| *p.address())
            .collect();
        for address in deletable {
            if let Some(mut peer) = self.peers.remove(&address) {
                info!("Deleting idle peer: {} handle=0x{:x}", address, peer.handle());
                peer.cleanup();
            }
        }
    }

    pub(crate) fn cleanup_all_peers(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.cleanup();
        }
    }
}

pub struct BluetoothAv {
    tx: UnboundedSender<Message>,
    cb_tx: UnboundedSender<CallbackMessage>,
    pub(crate) source: PeerPool,
    pub(crate) sink: PeerPool,
    a2dp_offload_enabled: bool,
    source_callbacks: SharedSourceCallbacks,
    sink_callbacks: SharedSinkCallbacks,
    pub(crate) transport: Box<dyn AvTransport>,
    pub(crate) source_audio: Box<dyn SourceAudioEngine>,
    pub(crate) sink_audio: Box<dyn SinkAudioEngine>,
    pub(crate) codec_negotiation: Box<dyn AvCodecNegotiation>,
    pub(crate) rc: Box<dyn AvrcpHandler>,
}

/// Upper-layer API for the source role.
pub trait IBluetoothAvSource {
    fn init(
        &mut self,
        callbacks: Box<dyn IAvSourceCallbacks>,
        max_connected_audio_devices: i32,
        codec_priorities: Vec<A2dpCodecConfig>,
        offloading_preference: Vec<A2dpCodecConfig>,
    ) -> BtStatus;

    fn connect(&mut self, address: String) -> BtStatus;

    fn disconnect(&mut self, address: String) -> BtStatus;

    fn set_silence_device(&mut self, address: String, silence: bool) -> BtStatus;

    /// Routes the peer to the local audio pipeline. An empty address clears
    /// the active peer.
    fn set_active_device(&mut self, address: String) -> BtStatus;

    fn config_codec(&mut self, address: String, codec_preferences: Vec<A2dpCodecConfig>)
        -> BtStatus;

    fn cleanup(&mut self) -> bool;

    // Opaque vendor codec extension channels.
    fn get_codec_ext_version(&mut self, address: String) -> Vec<u8>;

    fn get_codec_ext_config(&mut self, address: String) -> Vec<u8>;

    fn set_codec_ext_config(&mut self, address: String, config: Vec<u8>) -> BtStatus;

    fn set_codec_ext_data(&mut self, address: String, data: Vec<u8>);
}

/// Upper-layer API for the sink role.
pub trait IBluetoothAvSink {
    fn init(
        &mut self,
        callbacks: Box<dyn IAvSinkCallbacks>,
        max_connected_audio_devices: i32,
    ) -> BtStatus;

    fn connect(&mut self, address: String) -> BtStatus;

    fn disconnect(&mut self, address: String) -> BtStatus;

    fn cleanup(&mut self) -> bool;

    /// Final audio focus state decided by the upper layer.
    fn update_audio_focus_state(&mut self, state: i32);

    /// Track gain used for ducking.
    fn update_audio_track_gain(&mut self, gain: f32);

    fn set_active_device(&mut self, address: String) -> BtStatus;
}

impl BluetoothAv {
    pub fn new(
        tx: UnboundedSender<Message>,
        cb_tx: UnboundedSender<CallbackMessage>,
        transport: Box<dyn AvTransport>,
        source_audio: Box<dyn SourceAudioEngine>,
        sink_audio: Box<dyn SinkAudioEngine>,
        codec_negotiation: Box<dyn AvCodecNegotiation>,
        rc: Box<dyn AvrcpHandler>,
    ) -> BluetoothAv {
        BluetoothAv {
            tx,
            cb_tx,
            source: PeerPool::new(),
            sink: PeerPool::new(),
            a2dp_offload_enabled: false,
            source_callbacks: Arc::new(Mutex::new(None)),
            sink_callbacks: Arc::new(Mutex::new(None)),
            transport,
            source_audio,
            sink_audio,
            codec_negotiation,
            rc,
        }
    }

    /// Shared callback cells for constructing the callback dispatcher.
    pub fn callback_cells(&self) -> (SharedSourceCallbacks, SharedSinkCallbacks) {
        (self.source_callbacks.clone(), self.sink_callbacks.clone())
    }

    /// Single entry point for the control dispatch loop.
    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::AvTransport { sep, event } => self.handle_transport_event(sep, event),
            Message::Av { sep, address, handle, event } => {
                self.handle_av_event(sep, address, handle, event)
            }
            Message::SetActivePeer { sep, address, reply } => {
                self.set_active_peer(sep, address, reply);
            }
            Message::UpdateCodecConfig { address, codec_preferences, reply } => {
                self.update_codec_config(address, codec_preferences, reply)
            }
            Message::SetSilence { address, silence } => self.set_silence_peer(address, silence),
            Message::SetMandatoryCodecPreferred { address, preferred } => {
                self.set_mandatory_codec_preferred(address, preferred)
            }
            Message::DeleteIdlePeers { sep } => self.delete_idle_peers(sep),
            Message::AvOpenOnRcTimeout { sep, address } => self.av_open_on_rc_timeout(sep, address),
            Message::SetAudioDelay { address, delay } => self.set_audio_delay(address, delay),
            Message::CleanupSource => self.cleanup_source(),
            Message::CleanupSink => self.cleanup_sink(),
        }
    }

    /// The registry owning peers of the given stream endpoint type.
    pub(crate) fn owning_pool(&self, sep: PeerSep) -> &PeerPool {
        match sep {
            PeerSep::Sink => &self.source,
            PeerSep::Source => &self.sink,
        }
    }

    pub(crate) fn owning_pool_mut(&mut self, sep: PeerSep) -> &mut PeerPool {
        match sep {
            PeerSep::Sink => &mut self.source,
            PeerSep::Source => &mut self.sink,
        }
    }

    pub(crate) fn peer_is_active(&self, sep: PeerSep, address: &Address) -> bool {
        self.owning_pool(sep).is_active(address)
    }

    /// Read fields of a peer.
    pub(crate) fn with_peer<T, F>(&self, sep: PeerSep, address: Address, f: F) -> Option<T>
    where
        F: FnOnce(&Peer) -> T,
    {
        self.owning_pool(sep).find_peer(&address).map(f)
    }

    /// Modify a peer in place.
    pub(crate) fn with_peer_mut<T, F>(&mut self, sep: PeerSep, address: Address, f: F) -> Option<T>
    where
        F: FnOnce(&mut Peer) -> T,
    {
        self.owning_pool_mut(sep).find_peer_mut(&address).map(f)
    }

    pub(crate) fn post(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    pub(crate) fn post_callback(&self, msg: CallbackMessage) {
        let _ = self.cb_tx.send(msg);
    }

    /// Routes a transport event to the peer it addresses. Register and
    /// Enable events are registry-level and consumed here.
    pub fn handle_transport_event(&mut self, sep: PeerSep, event: AvEvent) {
        debug!("Handle transport event {} sep={:?}", event.name(), sep);

        let mut address: Option<Address> = None;
        let mut handle: TransportHandle = HANDLE_UNKNOWN;

        match &event {
            AvEvent::Enable(data) => {
                debug!("Enable features=0x{:x}", data.features.bits());
                return; // Nothing to do
            }
            AvEvent::Register(data) => {
                debug!("Register handle=0x{:x} peer_id={}", data.handle, data.peer_id);
                self.owning_pool_mut(sep).handle_registered(data.peer_id, data.handle);
                return; // Nothing else to do
            }
            AvEvent::Open(data) => {
                address = Some(data.address);
                handle = data.handle;
            }
            AvEvent::Close(data) => handle = data.handle,
            AvEvent::Start(data) => handle = data.handle,
            AvEvent::Stop(data) | AvEvent::Suspend(data) => handle = data.handle,
            AvEvent::Reconfig(data) => handle = data.handle,
            AvEvent::Reject(data) => {
                address = Some(data.address);
                handle = data.handle;
            }
            AvEvent::Pending(data) => address = Some(data.address),
            AvEvent::OffloadStartRsp(_) => address = self.owning_pool(sep).active_peer,
            AvEvent::Rc(rc) => {
                // Command-style events carry no address and are attributed
                // to the active peer.
                address = rc.address().or(self.owning_pool(sep).active_peer);
            }
            _ => {}
        }

        self.handle_av_event(sep, address, handle, event);
    }

    /// Dispatches an event to the addressed peer's state machine, creating
    /// the peer when the address is concrete.
    pub fn handle_av_event(
        &mut self,
        sep: PeerSep,
        address: Option<Address>,
        bta_handle: TransportHandle,
        event: AvEvent,
    ) {
        debug!(
            "Handle event {} peer_address={:?} handle=0x{:x}",
            event.name(),
            address,
            bta_handle
        );

        let key = match address {
            Some(addr) => {
                if self.owning_pool_mut(sep).find_or_create_peer(addr, bta_handle, sep) {
                    Some(addr)
                } else {
                    None
                }
            }
            None if bta_handle != HANDLE_UNKNOWN => {
                self.owning_pool(sep).find_address_by_handle(bta_handle)
            }
            None => None,
        };

        match key {
            Some(addr) => self.process_peer_event(sep, addr, event),
            None => {
                error!(
                    "Cannot find or create peer for peer_address={:?} handle=0x{:x} : \
                     event dropped: {}",
                    address,
                    bta_handle,
                    event.name()
                );
            }
        }
    }

    fn init_source_internal(
        &mut self,
        callbacks: Box<dyn IAvSourceCallbacks>,
        max_connected_audio_devices: i32,
        codec_priorities: Vec<A2dpCodecConfig>,
        offloading_preference: Vec<A2dpCodecConfig>,
    ) -> BtStatus {
        info!("init source: max_connected_audio_devices={}", max_connected_audio_devices);
        if self.source.enabled {
            return BtStatus::Success;
        }
        self.source.cleanup_all_peers();
        self.source.max_connected_peers = max_connected_audio_devices.max(1) as usize;

        self.a2dp_offload_enabled = config_util::offload_enabled();
        debug!("a2dp_offload.enable = {}", self.a2dp_offload_enabled);

        *self.source_callbacks.lock().unwrap() = Some(callbacks);
        if self.a2dp_offload_enabled {
            self.source_audio.update_codec_offloading_capabilities(&offloading_preference);
        }
        self.codec_negotiation.init(&codec_priorities);

        if !self.source_audio.init() {
            return BtStatus::Fail;
        }
        self.execute_source_service(true);
        self.source.enabled = true;
        BtStatus::Success
    }

    fn init_sink_internal(
        &mut self,
        callbacks: Box<dyn IAvSinkCallbacks>,
        max_connected_audio_devices: i32,
    ) -> BtStatus {
        info!("init sink: max_connected_audio_devices={}", max_connected_audio_devices);
        if self.sink.enabled {
            return BtStatus::Success;
        }
        self.sink.cleanup_all_peers();
        self.sink.max_connected_peers = max_connected_audio_devices.max(1) as usize;
        *self.sink_callbacks.lock().unwrap() = Some(callbacks);

        // Default codec priorities.
        self.codec_negotiation.init(&[]);

        if !self.sink_audio.init() {
            return BtStatus::Fail;
        }
        self.execute_sink_service(true);
        self.sink.enabled = true;
        BtStatus::Success
    }

    fn execute_source_service(&mut self, enable: bool) {
        debug!("Source service: {}", if enable { "enable" } else { "disable" });
        if enable {
            // NO_SCO_SUSPEND keeps the transport from auto-suspending the
            // stream on call events; suspends stay app-driven.
            let mut features = AvFeatures::REMOTE_CONTROL_TARGET
                | AvFeatures::METADATA
                | AvFeatures::VENDOR_COMMANDS
                | AvFeatures::NO_SCO_SUSPEND;
            if config_util::delay_reporting_enabled() {
                features |= AvFeatures::DELAY_REPORTING;
            }
            if config_util::absolute_volume_enabled() {
                features |= AvFeatures::REMOTE_CONTROL_CONTROLLER
                    | AvFeatures::ADVANCED_CONTROL
                    | AvFeatures::BROWSING;
            }
            self.transport.enable(features);
            for peer_id in 0..MAX_PEERS {
                self.transport.register(peer_id, SOURCE_SERVICE_NAME, PeerSep::Sink);
            }
        } else {
            let handles: Vec<TransportHandle> =
                self.source.peer_id_to_handle.values().copied().collect();
            for handle in handles {
                self.transport.deregister(handle);
            }
            self.source.peer_id_to_handle.clear();
            self.transport.disable();
        }
    }

    fn execute_sink_service(&mut self, enable: bool) {
        debug!("Sink service: {}", if enable { "enable" } else { "disable" });
        if enable {
            let mut features = AvFeatures::NO_SCO_SUSPEND
                | AvFeatures::REMOTE_CONTROL_CONTROLLER
                | AvFeatures::METADATA
                | AvFeatures::VENDOR_COMMANDS
                | AvFeatures::ADVANCED_CONTROL
                | AvFeatures::REMOTE_CONTROL_TARGET
                | AvFeatures::BROWSING
                | AvFeatures::COVER_ARTWORK;
            if config_util::delay_reporting_enabled() {
                features |= AvFeatures::DELAY_REPORTING;
            }
            self.transport.enable(features);
            for peer_id in 0..MAX_PEERS {
                self.transport.register(peer_id, SINK_SERVICE_NAME, PeerSep::Source);
            }
        } else {
            let handles: Vec<TransportHandle> =
                self.sink.peer_id_to_handle.values().copied().collect();
            for handle in handles {
                self.transport.deregister(handle);
            }
            self.sink.peer_id_to_handle.clear();
            self.transport.disable();
        }
    }

    /// Tears the source side down. Safe to call repeatedly.
    pub fn cleanup_source(&mut self) {
        info!("cleanup source");
        if !self.source.enabled {
            return;
        }
        let (reply, _discard) = oneshot::channel();
        self.set_active_peer(PeerSep::Sink, None, reply);
        self.source_audio.cleanup();
        self.execute_source_service(false);
        self.source.cleanup_all_peers();
        *self.source_callbacks.lock().unwrap() = None;
        self.source.enabled = false;
    }

    /// Tears the sink side down. Safe to call repeatedly.
    pub fn cleanup_sink(&mut self) {
        info!("cleanup sink");
        if !self.sink.enabled {
            return;
        }
        let (reply, _discard) = oneshot::channel();
        self.set_active_peer(PeerSep::Source, None, reply);
        self.sink_audio.cleanup();
        self.execute_sink_service(false);
        self.sink.cleanup_all_peers();
        *self.sink_callbacks.lock().unwrap() = None;
        self.sink.enabled = false;
    }

    /// Switches (or clears) the active peer of the side owning peers of
    /// `sep`. `reply` is always fulfilled; for a connected peer the audio
    /// engine fulfils it once the restarted pipeline is ready.
    pub fn set_active_peer(
        &mut self,
        sep: PeerSep,
        address: Option<Address>,
        reply: PeerReadySender,
    ) -> bool {
        info!("set active peer: sep={:?} address={:?}", sep, address);

        if self.owning_pool(sep).active_peer == address {
            let _ = reply.send(());
            return true; // Nothing has changed
        }

        let addr = match address {
            None => {
                debug!("peer address is empty, shutdown the audio {:?} side", sep);
                if !self.codec_negotiation.set_active_peer(None) {
                    warn!("unable to set active peer to empty in codec negotiation");
                }
                let old = self.owning_pool(sep).active_peer;
                match sep {
                    PeerSep::Sink => {
                        if let Some(old) = old {
                            self.source_audio.end_session(old);
                        }
                        let (done_tx, done_rx) = std::sync::mpsc::channel();
                        self.source_audio.shutdown(done_tx);
                        if done_rx.recv_timeout(AUDIO_SHUTDOWN_TIMEOUT).is_err() {
                            error!("Timed out waiting for A2DP source shutdown to complete.");
                        }
                    }
                    PeerSep::Source => {
                        if let Some(old) = old {
                            self.sink_audio.end_session(old);
                        }
                        self.sink_audio.shutdown();
                    }
                }
                self.owning_pool_mut(sep).active_peer = None;
                let _ = reply.send(());
                return true;
            }
            Some(addr) => addr,
        };

        let connected = self.owning_pool(sep).find_peer(&addr).map_or(false, |p| p.is_connected());
        if !connected {
            error!("Error setting {} as active {:?} peer", addr, sep);
            let _ = reply.send(());
            return false;
        }

        let old = self.owning_pool(sep).active_peer;
        let restarted = match sep {
            PeerSep::Sink => self.source_audio.restart_session(old, addr, reply),
            PeerSep::Source => self.sink_audio.restart_session(old, addr, reply),
        };
        if !restarted {
            // reply is fulfilled within restart_session
            return false;
        }
        self.owning_pool_mut(sep).active_peer = Some(addr);
        true
    }

    /// Applies updated codec preferences for a source-side peer. Updating
    /// the active peer forces a session restart.
    pub fn update_codec_config(
        &mut self,
        address: Address,
        codec_preferences: Vec<A2dpCodecConfig>,
        reply: PeerReadySender,
    ) {
        if self.source.is_active(&address) {
            self.source_audio.end_session(address);
        }
        self.source_audio.encoder_user_config_update(address, codec_preferences, reply);
    }

    pub fn set_silence_peer(&mut self, address: Address, silence: bool) {
        info!("[{}]: silence={}", address, silence);
        match self.source.find_peer_mut(&address) {
            Some(peer) if peer.is_connected() => peer.set_silence(silence),
            Some(_) => warn!("[{}]: peer is not connected", address),
            None => warn!("[{}]: peer is null", address),
        }
    }

    pub fn is_peer_silenced(&self, address: &Address) -> bool {
        self.source.find_peer(address).map_or(false, |p| p.is_connected() && p.is_in_silence_mode())
    }

    pub fn set_mandatory_codec_preferred(&mut self, address: Address, preferred: bool) {
        match self.find_peer_any_mut(&address) {
            Some(peer) => peer.set_mandatory_codec_preferred(preferred),
            None => warn!("[{}]: no peer to apply mandatory codec preference", address),
        }
    }

    pub fn delete_idle_peers(&mut self, sep: PeerSep) {
        self.owning_pool_mut(sep).delete_idle_peers();
    }

    /// Expiry of the AVRCP-before-AV interop timer: synthesize a connect
    /// request if the peer still exists and AVRCP is still up.
    pub fn av_open_on_rc_timeout(&mut self, sep: PeerSep, address: Address) {
        debug!("[{}]: AV open on RC timeout", address);

        if !self.rc.is_connected_peer(&address) {
            error!("[{}]: AVRCP peer is not connected", address);
            return;
        }

        let pool = self.owning_pool(sep);
        if pool.enabled && pool.find_peer(&address).is_some() {
            debug!("[{}]: Connecting to AVRCP peer", address);
            self.handle_av_event(sep, Some(address), HANDLE_UNKNOWN, AvEvent::ConnectReq);
        }
    }

    /// Arms the 2 s timer that initiates AVDTP towards a peer that opened
    /// only AVRCP. The synthesized connect is dispatched on whichever side
    /// is enabled.
    pub(crate) fn arm_av_open_on_rc_timer(&mut self, peer_sep: PeerSep, address: Address) {
        let dispatch_sep = if self.source.enabled { PeerSep::Sink } else { PeerSep::Source };
        let tx = self.tx.clone();
        let task = TIMER_RUNTIME.spawn(async move {
            sleep(Duration::from_millis(AV_OPEN_ON_RC_TIMEOUT_MS)).await;
            let _ = tx.send(Message::AvOpenOnRcTimeout { sep: dispatch_sep, address });
        });
        match self.owning_pool_mut(peer_sep).find_peer_mut(&address) {
            Some(peer) => peer.set_av_open_on_rc_task(task),
            None => task.abort(),
        }
    }

    /// Delay report from the transport, in 1/10 ms. Cached on sink-sep
    /// peers and pushed to the HAL when the peer is active.
    pub fn set_audio_delay(&mut self, address: Address, delay: u16) {
        self.source_audio.set_audio_delay(delay);

        let sep = match self.enabled_side() {
            Some(sep) => sep,
            None => return,
        };
        let pool = self.owning_pool_mut(sep);
        let active = pool.is_active(&address);
        let mut push_remote = false;
        if let Some(peer) = pool.find_peer_mut(&address) {
            if peer.is_sink() {
                peer.set_delay_report(delay);
                push_remote = active;
            }
        }
        if push_remote {
            self.source_audio.set_remote_delay(delay);
        }
    }

    pub fn get_audio_delay(&self) -> u16 {
        match self.find_active_peer() {
            Some(peer) if peer.is_sink() => peer.delay_report(),
            _ => 0,
        }
    }

    pub fn reset_audio_delay(&mut self) {
        self.source_audio.reset_audio_delay();
    }

    pub fn set_dynamic_audio_buffer_size(&mut self, size: u8) {
        self.source_audio.set_dynamic_audio_buffer_size(size);
    }

    /// Which side serves lookups that are not peer-sep qualified. The
    /// source side wins when both are enabled.
    fn enabled_side(&self) -> Option<PeerSep> {
        if self.source.enabled {
            Some(PeerSep::Sink)
        } else if self.sink.enabled {
            Some(PeerSep::Source)
        } else {
            None
        }
    }

    pub(crate) fn find_peer_any(&self, address: &Address) -> Option<&Peer> {
        self.enabled_side().and_then(|sep| self.owning_pool(sep).find_peer(address))
    }

    fn find_peer_any_mut(&mut self, address: &Address) -> Option<&mut Peer> {
        match self.enabled_side() {
            Some(sep) => self.owning_pool_mut(sep).find_peer_mut(address),
            None => None,
        }
    }

    pub(crate) fn find_active_peer(&self) -> Option<&Peer> {
        let sep = self.enabled_side()?;
        let pool = self.owning_pool(sep);
        pool.active_peer.and_then(|a| pool.find_peer(&a))
    }

    /// Whether the active peer is ready for a local stream start.
    pub fn stream_ready(&self) -> bool {
        let peer = match self.find_active_peer() {
            Some(peer) => peer,
            None => {
                warn!("stream_ready: no active peer found");
                return false;
            }
        };
        if peer.check_flags(PeerFlags::REMOTE_SUSPEND | PeerFlags::PENDING_STOP) {
            return false;
        }
        peer.state() == PeerState::Opened
    }

    /// Whether the active peer is streaming with no pending suspend/stop.
    pub fn stream_started_ready(&self) -> bool {
        let peer = match self.find_active_peer() {
            Some(peer) => peer,
            None => {
                warn!("stream_started_ready: no active peer found");
                return false;
            }
        };
        let ready = if peer.check_flags(
            PeerFlags::LOCAL_SUSPEND_PENDING | PeerFlags::REMOTE_SUSPEND | PeerFlags::PENDING_STOP,
        ) {
            false
        } else {
            peer.is_streaming()
        };
        debug!(
            "stream_started_ready: peer {} state={:?} flags={} ready={}",
            peer.address(),
            peer.state(),
            peer.flags_to_string(),
            ready
        );
        ready
    }

    /// Posts a payload-less event for a source-side peer.
    pub fn source_dispatch_sm_event(&self, address: Address, event: AvEvent) {
        debug!("[{}]: dispatch {}", address, event.name());
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: Some(address),
            handle: HANDLE_UNKNOWN,
            event,
        });
    }

    /// Posts a payload-less event for a sink-side peer.
    pub fn sink_dispatch_sm_event(&self, address: Address, event: AvEvent) {
        debug!("[{}]: dispatch {}", address, event.name());
        self.post(Message::Av {
            sep: PeerSep::Source,
            address: Some(address),
            handle: HANDLE_UNKNOWN,
            event,
        });
    }

    /// ACL went down for a peer; routed to whichever side is enabled.
    pub fn acl_disconnected(&self, address: Address) {
        info!("[{}]: ACL disconnected", address);
        match self.enabled_side() {
            Some(PeerSep::Sink) => self.source_dispatch_sm_event(address, AvEvent::AclDisconnected),
            Some(PeerSep::Source) => self.sink_dispatch_sm_event(address, AvEvent::AclDisconnected),
            None => {}
        }
    }

    /// Starts streaming on the active source-side peer.
    pub fn stream_start(&self) {
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: self.source.active_peer,
            handle: HANDLE_UNKNOWN,
            event: AvEvent::StartStreamReq { use_latency_mode: None },
        });
    }

    pub fn stream_start_with_latency(&self, use_latency_mode: bool) {
        info!(
            "stream start: peer_address={:?} use_latency_mode={}",
            self.source.active_peer, use_latency_mode
        );
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: self.source.active_peer,
            handle: HANDLE_UNKNOWN,
            event: AvEvent::StartStreamReq { use_latency_mode: Some(use_latency_mode) },
        });
    }

    /// Suspends every started source-side peer. The active peer might have
    /// changed mid-reconfiguration, so all started peers are addressed.
    pub fn stream_suspend(&mut self) {
        self.source_suspend_started_peers(AvEvent::SuspendStreamReq);
    }

    /// Stops a specific peer, or every started source-side peer when no
    /// address is given.
    pub fn stream_stop(&mut self, address: Option<Address>) {
        if let Some(addr) = address {
            self.source_dispatch_sm_event(addr, AvEvent::StopStreamReq);
            return;
        }
        self.source_suspend_started_peers(AvEvent::StopStreamReq);
    }

    fn source_suspend_started_peers(&mut self, event: AvEvent) {
        let started: Vec<Address> = self
            .source
            .peers
            .values()
            .filter(|p| p.is_streaming())
            .map(|p| *p.address())
            .collect();
        if started.is_empty() {
            self.source_audio.on_stopped(None);
            return;
        }
        for address in started {
            self.source_dispatch_sm_event(address, event.clone());
        }
    }

    /// Requests the offload path for the active source-side peer.
    pub fn stream_start_offload(&self) {
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: self.source.active_peer,
            handle: HANDLE_UNKNOWN,
            event: AvEvent::OffloadStartReq,
        });
    }

    /// Lifts a remote suspend on the active peer so the media task may
    /// restart the stream.
    pub fn clear_remote_suspend_flag(&mut self) {
        let sep = match self.enabled_side() {
            Some(sep) => sep,
            None => return,
        };
        let active = self.owning_pool(sep).active_peer;
        let cleared = match active {
            Some(a) => self
                .with_peer_mut(sep, a, |p| {
                    debug!("[{}]: flags={} are cleared", p.address(), p.flags_to_string());
                    p.clear_flags(PeerFlags::REMOTE_SUSPEND);
                })
                .is_some(),
            None => false,
        };
        if !cleared {
            warn!("clear_remote_suspend_flag: no active peer found");
        }
    }

    pub fn is_peer_edr(&self, address: &Address) -> bool {
        match self.find_peer_any(address) {
            Some(peer) if peer.is_connected() => peer.is_edr(),
            Some(_) => {
                warn!("[{}]: peer is not connected", address);
                false
            }
            None => {
                warn!("[{}]: no peer found", address);
                false
            }
        }
    }

    pub fn peer_supports_3mbps(&self, address: &Address) -> bool {
        match self.find_peer_any(address) {
            Some(peer) => peer.is_connected() && peer.is_3mbps(),
            None => false,
        }
    }

    pub fn peer_prefers_mandatory_codec(&self, address: &Address) -> bool {
        self.find_peer_any(address).map_or(false, |p| p.is_mandatory_codec_preferred())
    }

    /// Whether the active peer is connected.
    pub fn is_connected(&self) -> bool {
        self.find_active_peer().map_or(false, |p| p.is_connected())
    }

    /// The stream endpoint type of the active peer; defaults to Sink.
    pub fn get_peer_sep(&self) -> PeerSep {
        self.find_active_peer().map_or(PeerSep::Sink, |p| p.sep())
    }

    pub fn is_a2dp_offload_enabled(&self) -> bool {
        self.a2dp_offload_enabled
    }

    pub fn source_active_peer(&self) -> Option<Address> {
        self.source.active_peer
    }

    pub fn sink_active_peer(&self) -> Option<Address> {
        self.sink.active_peer
    }

    pub(crate) fn report_connection_state(&mut self, address: Address, state: BtavConnectionState) {
        info!("[{}]: connection state {:?}", address, state);
        if self.source.enabled {
            self.post_callback(CallbackMessage::SourceConnectionState(address, state));
        } else if self.sink.enabled {
            self.post_callback(CallbackMessage::SinkConnectionState(address, state));
        }
    }

    pub(crate) fn report_audio_state(&mut self, address: Address, state: BtavAudioState) {
        info!("[{}]: audio state {:?}", address, state);
        if self.source.enabled {
            self.post_callback(CallbackMessage::SourceAudioState(address, state));
        } else if self.sink.enabled {
            self.post_callback(CallbackMessage::SinkAudioState(address, state));
        }
    }

    /// Publishes the negotiated codec and capability sets for a source-side
    /// peer.
    pub fn report_source_codec_state(
        &mut self,
        address: Address,
        codec_config: A2dpCodecConfig,
        codecs_local_capabilities: Vec<A2dpCodecConfig>,
        codecs_selectable_capabilities: Vec<A2dpCodecConfig>,
    ) {
        debug!("[{}]: report source codec state", address);
        if self.source.enabled {
            self.post_callback(CallbackMessage::SourceAudioConfig(
                address,
                codec_config,
                codecs_local_capabilities,
                codecs_selectable_capabilities,
            ));
        }
    }

    pub(crate) fn report_sink_audio_config_state(
        &mut self,
        address: Address,
        sample_rate: i32,
        channel_count: i32,
    ) {
        info!(
            "[{}]: sample_rate={} channel_count={}",
            address, sample_rate, channel_count
        );
        if self.sink.enabled {
            self.post_callback(CallbackMessage::SinkAudioConfig(
                address,
                sample_rate,
                channel_count,
            ));
        }
    }

    /// Asks the host (on the callback loop) whether the mandatory codec
    /// should beat optional ones; the answer is applied asynchronously.
    pub(crate) fn query_mandatory_codec_priority(&mut self, address: Address) {
        if self.source.enabled {
            self.post_callback(CallbackMessage::QueryMandatoryCodec(address));
        }
    }

    /// Renders both registries for debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, pool) in [("Source", &self.source), ("Sink", &self.sink)] {
            out += &format!(
                "\nA2DP {} State: {}\n",
                name,
                if pool.enabled { "Enabled" } else { "Disabled" }
            );
            if !pool.enabled {
                continue;
            }
            out += &format!(
                "  Active peer: {}\n",
                pool.active_peer.map_or(String::from("(none)"), |a| a.to_string())
            );
            for peer in pool.peers.values() {
                out += &format!("  Peer: {}\n", peer.address());
                out += &format!("    Connected: {}\n", peer.is_connected());
                out += &format!("    Streaming: {}\n", peer.is_streaming());
                out += &format!("    SEP: {:?}\n", peer.sep());
                out += &format!("    State Machine: {:?}\n", peer.state());
                out += &format!("    Flags: {}\n", peer.flags_to_string());
                out += &format!(
                    "    OpenOnRcTimer: {}\n",
                    if peer.av_open_on_rc_timer_scheduled() {
                        "Scheduled"
                    } else {
                        "Not scheduled"
                    }
                );
                out += &format!("    Handle: 0x{:x}\n", peer.handle());
                out += &format!("    Peer ID: {}\n", peer.peer_id());
                out += &format!("    EDR: {}\n", peer.is_edr());
                out += &format!("    Support 3Mbps: {}\n", peer.is_3mbps());
                out += &format!(
                    "    Self Initiated Connection: {}\n",
                    peer.self_initiated_connection()
                );
                out += &format!(
                    "    Delay Reporting: {} (in 1/10 milliseconds)\n",
                    peer.delay_report()
                );
                out += &format!(
                    "    Codec Preferred: {}\n",
                    if peer.is_mandatory_codec_preferred() { "Mandatory" } else { "Optional" }
                );
            }
        }
        out
    }

    /// Posts a disconnect towards a peer, mirroring the upper-layer
    /// disconnect path.
    pub(crate) fn disconnect_peer_downward(&mut self, sep: PeerSep, address: Address) {
        if !self.owning_pool(sep).enabled {
            warn!("[{}]: cannot disconnect, {:?} side not enabled", address, sep);
            return;
        }
        self.post(Message::Av {
            sep,
            address: Some(address),
            handle: HANDLE_UNKNOWN,
            event: AvEvent::DisconnectReq,
        });
    }
}

impl IBluetoothAvSource for BluetoothAv {
    fn init(
        &mut self,
        callbacks: Box<dyn IAvSourceCallbacks>,
        max_connected_audio_devices: i32,
        codec_priorities: Vec<A2dpCodecConfig>,
        offloading_preference: Vec<A2dpCodecConfig>,
    ) -> BtStatus {
        self.init_source_internal(
            callbacks,
            max_connected_audio_devices,
            codec_priorities,
            offloading_preference,
        )
    }

    fn connect(&mut self, address: String) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("Invalid device address {}", address);
                return BtStatus::InvalidParam;
            }
        };
        debug!("Connecting to AV sink peer: {}", addr);
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: Some(addr),
            handle: HANDLE_UNKNOWN,
            event: AvEvent::ConnectReq,
        });
        BtStatus::Success
    }

    fn disconnect(&mut self, address: String) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("Invalid device address {}", address);
                return BtStatus::InvalidParam;
            }
        };
        self.post(Message::Av {
            sep: PeerSep::Sink,
            address: Some(addr),
            handle: HANDLE_UNKNOWN,
            event: AvEvent::DisconnectReq,
        });
        BtStatus::Success
    }

    fn set_silence_device(&mut self, address: String, silence: bool) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("Invalid device address {}", address);
                return BtStatus::InvalidParam;
            }
        };
        self.post(Message::SetSilence { address: addr, silence });
        BtStatus::Success
    }

    fn set_active_device(&mut self, address: String) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        let addr = if address.is_empty() {
            None
        } else {
            match Address::from_string(address.clone()) {
                Some(addr) => Some(addr),
                None => {
                    warn!("Invalid device address {}", address);
                    return BtStatus::InvalidParam;
                }
            }
        };
        let (reply, _discard) = oneshot::channel();
        self.post(Message::SetActivePeer { sep: PeerSep::Sink, address: addr, reply });
        BtStatus::Success
    }

    fn config_codec(
        &mut self,
        address: String,
        codec_preferences: Vec<A2dpCodecConfig>,
    ) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("AV source needs a peer to config codec, got {}", address);
                return BtStatus::InvalidParam;
            }
        };
        for preference in &codec_preferences {
            if !A2dpCodecSampleRate::validate_bits(preference.sample_rate)
                || !A2dpCodecBitsPerSample::validate_bits(preference.bits_per_sample)
                || !A2dpCodecChannelMode::validate_bits(preference.channel_mode)
            {
                warn!("[{}]: invalid codec preference {:?}", addr, preference);
                return BtStatus::InvalidParam;
            }
        }
        let (reply, _discard) = oneshot::channel();
        self.post(Message::UpdateCodecConfig { address: addr, codec_preferences, reply });
        BtStatus::Success
    }

    fn cleanup(&mut self) -> bool {
        if !self.source.enabled {
            return false;
        }
        self.post(Message::CleanupSource);
        true
    }

    fn get_codec_ext_version(&mut self, address: String) -> Vec<u8> {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return Vec::new();
        }
        match Address::from_string(address) {
            Some(addr) => self.source_audio.codec_ext_version(&addr),
            None => Vec::new(),
        }
    }

    fn get_codec_ext_config(&mut self, address: String) -> Vec<u8> {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return Vec::new();
        }
        match Address::from_string(address) {
            Some(addr) => self.source_audio.codec_ext_config(&addr),
            None => Vec::new(),
        }
    }

    fn set_codec_ext_config(&mut self, address: String, config: Vec<u8>) -> BtStatus {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return BtStatus::NotReady;
        }
        match Address::from_string(address) {
            Some(addr) => self.source_audio.set_codec_ext_config(&addr, config),
            None => BtStatus::InvalidParam,
        }
    }

    fn set_codec_ext_data(&mut self, address: String, data: Vec<u8>) {
        if !self.source.enabled {
            warn!("AV source is not enabled");
            return;
        }
        if let Some(addr) = Address::from_string(address) {
            self.source_audio.set_codec_ext_data(&addr, data);
        }
    }
}

impl IBluetoothAvSink for BluetoothAv {
    fn init(
        &mut self,
        callbacks: Box<dyn IAvSinkCallbacks>,
        max_connected_audio_devices: i32,
    ) -> BtStatus {
        self.init_sink_internal(callbacks, max_connected_audio_devices)
    }

    fn connect(&mut self, address: String) -> BtStatus {
        if !self.sink.enabled {
            warn!("AV sink is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("Invalid device address {}", address);
                return BtStatus::InvalidParam;
            }
        };
        debug!("Connecting to AV source peer: {}", addr);
        self.post(Message::Av {
            sep: PeerSep::Source,
            address: Some(addr),
            handle: HANDLE_UNKNOWN,
            event: AvEvent::ConnectReq,
        });
        BtStatus::Success
    }

    fn disconnect(&mut self, address: String) -> BtStatus {
        if !self.sink.enabled {
            warn!("AV sink is not enabled");
            return BtStatus::NotReady;
        }
        let addr = match Address::from_string(address.clone()) {
            Some(addr) => addr,
            None => {
                warn!("Invalid device address {}", address);
                return BtStatus::InvalidParam;
            }
        };
        self.post(Message::Av {
            sep: PeerSep::Source,
            address: Some(addr),
            handle: HANDLE_UNKNOWN,
            event: AvEvent::DisconnectReq,
        });
        BtStatus::Success
    }

    fn cleanup(&mut self) -> bool {
        if !self.sink.enabled {
            return false;
        }
        self.post(Message::CleanupSink);
        true
    }

    fn update_audio_focus_state(&mut self, state: i32) {
        debug!("audio focus state={}", state);
        if !self.sink.enabled {
            warn!("AV sink is not enabled");
            return;
        }
        self.sink_audio.set_focus_state(state);
    }

    fn update_audio_track_gain(&mut self, gain: f32) {
        debug!("audio track gain={}", gain);
        if !self.sink.enabled {
            warn!("AV sink is not enabled");
            return;
        }
        self.sink_audio.set_audio_track_gain(gain);
    }

    fn set_active_device(&mut self, address: String) -> BtStatus {
        if !self.sink.enabled {
            warn!("AV sink is not enabled");
            return BtStatus::NotReady;
        }
        let addr = if address.is_empty() {
            None
        } else {
            match Address::from_string(address.clone()) {
                Some(addr) => Some(addr),
                None => {
                    warn!("Invalid device address {}", address);
                    return BtStatus::InvalidParam;
                }
            }
        };
        let (reply, _discard) = oneshot::channel();
        self.post(Message::SetActivePeer { sep: PeerSep::Source, address: addr, reply });
        BtStatus::Success
    }
}
