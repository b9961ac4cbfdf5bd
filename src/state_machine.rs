//! The five-state AVDTP signalling state machine.
//!
//! There is no dedicated Suspend state: suspend handling needs no actions
//! beyond those of Opened, only the suspend flags that keep the media task
//! from restarting the stream while a local or remote suspend is in flight.
//!
//! State is a tagged value on the peer; the handlers below run on the
//! control loop and may touch the registries, the transport, the audio
//! engines and the notification channel.

use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::a2dp::{AvStatus, BtStatus, BtavAudioState, BtavConnectionState};
use crate::avrcp::{RcEvent, RC_ID_PLAY};
use crate::bluetooth_av::BluetoothAv;
use crate::event::{AvEvent, StartData, SuspendData};
use crate::peer::{PeerFlags, PeerSep, PeerState, HANDLE_UNKNOWN};
use crate::{Address, Message};

impl BluetoothAv {
    /// Runs one event through the peer's state machine. The peer must
    /// already exist in its registry.
    pub(crate) fn process_peer_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        let (state, flags) = match self.with_peer(sep, address, |p| (p.state(), p.flags_to_string()))
        {
            Some(snapshot) => snapshot,
            None => return,
        };
        debug!(
            "Peer {} : event={} flags={} active_peer={}",
            address,
            event.name(),
            flags,
            self.peer_is_active(sep, &address)
        );

        match state {
            PeerState::Idle => self.idle_process_event(sep, address, event),
            PeerState::Opening => self.opening_process_event(sep, address, event),
            PeerState::Opened => self.opened_process_event(sep, address, event),
            PeerState::Started => self.started_process_event(sep, address, event),
            PeerState::Closing => self.closing_process_event(sep, address, event),
            PeerState::Invalid => {
                error!("Peer {} : event={} while in Invalid state", address, event.name())
            }
        }
    }

    fn transition_to(&mut self, sep: PeerSep, address: Address, state: PeerState) {
        self.transition_internal(sep, address, state, true);
    }

    /// `report_started` suppresses the Started audio notification when the
    /// start is immediately self-suspended and never surfaces upward.
    fn transition_internal(
        &mut self,
        sep: PeerSep,
        address: Address,
        state: PeerState,
        report_started: bool,
    ) {
        let old = match self.with_peer(sep, address, |p| p.state()) {
            Some(state) => state,
            None => return,
        };
        debug!("Peer {} : {:?} -> {:?}", address, old, state);

        // State exit actions
        if old == PeerState::Opened {
            self.with_peer_mut(sep, address, |p| p.clear_flags(PeerFlags::PENDING_START));
        }

        self.with_peer_mut(sep, address, |p| p.set_state(state));

        // State entry actions
        match state {
            PeerState::Idle => self.enter_idle(sep, address),
            PeerState::Opening => self.enter_opening(sep, address),
            PeerState::Opened => self.enter_opened(sep, address),
            PeerState::Started => self.enter_started(sep, address, report_started),
            PeerState::Closing => self.enter_closing(sep, address),
            PeerState::Invalid => {}
        }
    }

    fn enter_idle(&mut self, sep: PeerSep, address: Address) {
        self.with_peer_mut(sep, address, |p| {
            p.set_edr(0);
            p.clear_all_flags();
        });

        // Quiesce the pipeline if this is the active peer or none is left.
        let is_active = self.peer_is_active(sep, &address);
        if is_active || self.owning_pool(sep).active_peer.is_none() {
            self.audio_on_idle(sep);
        }

        // Reset the active peer if this was the active peer and the Idle
        // state was re-entered.
        let deletable = self.with_peer(sep, address, |p| p.can_be_deleted()).unwrap_or(false);
        if is_active && deletable {
            let (reply, _discard) = oneshot::channel();
            self.set_active_peer(sep, None, reply);
        }

        // Deletion is deferred so in-flight events for this peer drain
        // before the record goes away.
        self.post(Message::DeleteIdlePeers { sep });
    }

    fn enter_opening(&mut self, _sep: PeerSep, address: Address) {
        self.report_connection_state(address, BtavConnectionState::Connecting);
    }

    fn enter_opened(&mut self, sep: PeerSep, address: Address) {
        self.with_peer_mut(sep, address, |p| {
            p.clear_flags(
                PeerFlags::LOCAL_SUSPEND_PENDING
                    | PeerFlags::PENDING_START
                    | PeerFlags::PENDING_STOP,
            )
        });

        // The sink side has no upper-layer active-device manager, so the
        // first connected Source peer wins.
        if sep == PeerSep::Source && self.sink.active_peer.is_none() {
            let (reply, _discard) = oneshot::channel();
            if !self.set_active_peer(PeerSep::Source, Some(address), reply) {
                error!("Error setting {} as active Source peer", address);
            }
        }
    }

    fn enter_started(&mut self, sep: PeerSep, address: Address, report_started: bool) {
        // Streaming again; any remote suspend is over.
        self.with_peer_mut(sep, address, |p| p.clear_flags(PeerFlags::REMOTE_SUSPEND));

        self.sink_audio.set_rx_flush(false);

        if report_started {
            self.report_audio_state(address, BtavAudioState::Started);
        }
    }

    fn enter_closing(&mut self, sep: PeerSep, address: Address) {
        if self.peer_is_active(sep, &address) {
            // Stop handing samples over while the close completes.
            match sep {
                PeerSep::Sink => self.source_audio.set_tx_flush(true),
                PeerSep::Source => self.sink_audio.set_rx_flush(true),
            }
        }
    }

    fn idle_process_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        let is_connect_req = matches!(event, AvEvent::ConnectReq);
        match event {
            AvEvent::Enable(_) => {}

            AvEvent::StopStreamReq | AvEvent::SuspendStreamReq | AvEvent::AclDisconnected => {
                // Re-enter Idle so the peer can be swept.
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::DisconnectReq => {
                let (handle, is_source) = self
                    .with_peer(sep, address, |p| (p.handle(), p.is_source()))
                    .unwrap_or((HANDLE_UNKNOWN, false));
                if handle != HANDLE_UNKNOWN {
                    self.transport.close(handle);
                    if is_source {
                        self.transport.close_rc(handle);
                    }
                }
                // Re-enter Idle so the peer can be swept.
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::ConnectReq | AvEvent::Pending(_) => {
                self.with_peer_mut(sep, address, |p| {
                    p.set_self_initiated_connection(is_connect_req)
                });
                if !self.owning_pool(sep).allowed_to_connect(&address) {
                    error!("Cannot connect to peer {}: too many connected peers", address);
                    self.report_connection_state(address, BtavConnectionState::Disconnected);
                    self.disconnect_peer_downward(sep, address);
                    return;
                }
                self.query_mandatory_codec_priority(address);
                let handle = self.with_peer(sep, address, |p| p.handle()).unwrap_or(HANDLE_UNKNOWN);
                self.transport.open(address, handle);
                self.transition_to(sep, address, PeerState::Opening);
            }

            AvEvent::AvrcpOpen => self.idle_rc_open(sep, address, None),
            AvEvent::Rc(rc @ RcEvent::Open { .. }) => self.idle_rc_open(sep, address, Some(rc)),

            AvEvent::Rc(rc @ RcEvent::BrowseOpen { .. }) => {
                self.rc.handle_event(Some(address), &rc);
            }

            // The remote may run its streaming procedure while our
            // signalling side still sits in Idle; the config report must
            // not be lost.
            AvEvent::SinkConfigReq(data) => {
                self.report_sink_audio_config_state(
                    data.address,
                    data.sample_rate,
                    data.channel_count,
                );
            }

            AvEvent::Open(data) => {
                info!(
                    "Peer {} : event=AV_OPEN status={:?} edr=0x{:x}",
                    address, data.status, data.edr
                );
                if data.status.is_success() {
                    let peer_sep = self.with_peer(sep, address, |p| p.sep()).unwrap();
                    assert_eq!(
                        peer_sep, data.sep,
                        "Peer {} stream endpoint type changed across transport open",
                        address
                    );
                    self.with_peer_mut(sep, address, |p| p.set_edr(data.edr));
                    if !self.owning_pool(sep).allowed_to_connect(&address) {
                        error!("Cannot connect to peer {}: too many connected peers", address);
                        self.disconnect_peer_downward(sep, address);
                        return;
                    }
                    self.report_connection_state(address, BtavConnectionState::Connected);
                    self.transition_to(sep, address, PeerState::Opened);
                    if sep == PeerSep::Sink {
                        // If a PLAY command was queued, send it now.
                        self.rc.check_pending_play(&address, true);
                    } else {
                        // Bring up the AVRCP connection as well.
                        let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                        self.transport.open_rc(handle);
                    }
                } else {
                    self.report_connection_state(address, BtavConnectionState::Disconnected);
                    self.transition_to(sep, address, PeerState::Idle);
                    if sep == PeerSep::Sink {
                        self.rc.check_pending_play(&address, false);
                    }
                }
            }

            AvEvent::AvrcpClose => {
                debug!("Peer {} : AVRCP_CLOSE: stopping the AV open timer", address);
                self.with_peer_mut(sep, address, |p| p.cancel_av_open_on_rc_timer());
            }
            AvEvent::Rc(rc @ RcEvent::Close { .. }) => {
                debug!("Peer {} : RC_CLOSE: stopping the AV open timer", address);
                self.with_peer_mut(sep, address, |p| p.cancel_av_open_on_rc_timer());
                self.rc.handle_event(Some(address), &rc);
            }

            AvEvent::OffloadStartReq => {
                error!("Peer {} : OFFLOAD_START_REQ: stream is not Opened", address);
                self.source_audio.on_offload_started(&address, AvStatus::Fail);
            }

            AvEvent::Rc(rc) => self.rc.handle_event(Some(address), &rc),

            _ => warn!("Peer {} : Unhandled event={}", address, event.name()),
        }
    }

    /// The remote opened AVRCP without AVDTP. Some headsets never initiate
    /// the AV connection themselves, so arm a timer that makes us initiate
    /// it; waiting also avoids colliding with remotes that do follow up.
    fn idle_rc_open(&mut self, sep: PeerSep, address: Address, rc: Option<RcEvent>) {
        warn!("Peer {} : AVRCP opened without AV", address);

        if !self.owning_pool(sep).allowed_to_connect(&address) {
            error!("Cannot connect to peer {}: too many connected peers", address);
            self.disconnect_peer_downward(sep, address);
            return;
        }
        self.arm_av_open_on_rc_timer(sep, address);

        if let Some(rc) = rc {
            self.rc.handle_event(Some(address), &rc);
        }
    }

    fn opening_process_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        match event {
            AvEvent::StopStreamReq | AvEvent::SuspendStreamReq => {} // Ignore

            // Only an intermediate state needs this; elsewhere the regular
            // connect/disconnect events cover the teardown.
            AvEvent::AclDisconnected => {
                warn!("Peer {} : transitioning to Idle due to ACL disconnect", address);
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::Reject(_) => {
                warn!("Peer {} : connection rejected", address);
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::Open(data) => {
                info!(
                    "Peer {} : event=AV_OPEN status={:?} edr=0x{:x}",
                    address, data.status, data.edr
                );
                if data.status.is_success() {
                    let peer_sep = self.with_peer(sep, address, |p| p.sep()).unwrap();
                    assert_eq!(
                        peer_sep, data.sep,
                        "Peer {} stream endpoint type changed across transport open",
                        address
                    );
                    self.with_peer_mut(sep, address, |p| p.set_edr(data.edr));
                    if !self.owning_pool(sep).allowed_to_connect(&address) {
                        error!("Cannot connect to peer {}: too many connected peers", address);
                        self.disconnect_peer_downward(sep, address);
                        return;
                    }
                    self.report_connection_state(address, BtavConnectionState::Connected);
                    self.transition_to(sep, address, PeerState::Opened);
                    if sep == PeerSep::Sink {
                        self.rc.check_pending_play(&address, true);
                    } else {
                        let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                        self.transport.open_rc(handle);
                    }
                } else {
                    // Tear down AVRCP too; an AVRCP connection cannot stand
                    // without an AV connection.
                    if self.rc.is_connected_peer(&address) {
                        warn!("Peer {} : disconnecting AVRCP", address);
                        if let Some(rc_handle) = self.rc.connected_peer_handle(&address) {
                            self.transport.close_rc(rc_handle);
                        }
                    }
                    self.report_connection_state(address, BtavConnectionState::Disconnected);
                    self.transition_to(sep, address, PeerState::Idle);
                    if sep == PeerSep::Sink {
                        self.rc.check_pending_play(&address, false);
                    }
                }
            }

            AvEvent::SinkConfigReq(data) => {
                if sep == PeerSep::Source {
                    self.report_sink_audio_config_state(
                        data.address,
                        data.sample_rate,
                        data.channel_count,
                    );
                }
            }

            AvEvent::ConnectReq => {
                warn!("Peer {} : already connecting, ignore connect request", address);
            }

            AvEvent::Pending(_) => {
                warn!("Peer {} : already connecting, ignore incoming request", address);
            }

            AvEvent::OffloadStartReq => {
                error!("Peer {} : OFFLOAD_START_REQ: stream is not Opened", address);
                self.source_audio.on_offload_started(&address, AvStatus::Fail);
            }

            AvEvent::Close(_) => {
                self.audio_on_stopped(sep, None);
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::DisconnectReq => {
                let handle = self.with_peer(sep, address, |p| p.handle()).unwrap_or(HANDLE_UNKNOWN);
                self.transport.close(handle);
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::Rc(rc) => self.rc.handle_event(Some(address), &rc),

            _ => warn!("Peer {} : Unhandled event={}", address, event.name()),
        }
    }

    fn opened_process_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        // A remote PLAY always lifts a remote suspend.
        if let AvEvent::Rc(RcEvent::RemoteCmd { rc_id, .. }) = &event {
            if *rc_id == RC_ID_PLAY
                && self
                    .with_peer(sep, address, |p| p.check_flags(PeerFlags::REMOTE_SUSPEND))
                    .unwrap_or(false)
            {
                debug!("Peer {} : resetting remote suspend flag on RC PLAY", address);
                self.with_peer_mut(sep, address, |p| p.clear_flags(PeerFlags::REMOTE_SUSPEND));
            }
        }

        match event {
            AvEvent::StopStreamReq | AvEvent::SuspendStreamReq | AvEvent::AclDisconnected => {}

            AvEvent::StartStreamReq { use_latency_mode } => {
                info!("Peer {} : event=START_STREAM_REQ", address);
                let (handle, latency) = self
                    .with_peer_mut(sep, address, |p| {
                        if let Some(use_latency_mode) = use_latency_mode {
                            p.set_use_latency_mode(use_latency_mode);
                        }
                        (p.handle(), p.use_latency_mode())
                    })
                    .unwrap();
                self.transport.start(handle, latency);
                self.with_peer_mut(sep, address, |p| p.set_flags(PeerFlags::PENDING_START));
            }

            AvEvent::Start(data) => {
                info!(
                    "Peer {} : event=AV_START status={:?} suspending={} initiator={}",
                    address, data.status, data.suspending, data.initiator
                );
                if data.status.is_success() && data.suspending {
                    return;
                }

                // A start initiated by the remote, or hitting a non-active
                // peer, is immediately suspended again.
                let mut should_suspend = false;
                if sep == PeerSep::Sink {
                    let pending = self
                        .with_peer(sep, address, |p| {
                            p.check_flags(PeerFlags::PENDING_START | PeerFlags::REMOTE_SUSPEND)
                        })
                        .unwrap_or(false);
                    if !pending {
                        warn!("Peer {} : trigger suspend as remote initiated", address);
                        should_suspend = true;
                    } else if !self.peer_is_active(sep, &address) {
                        warn!("Peer {} : trigger suspend as non-active", address);
                        should_suspend = true;
                    }

                    if self.source_audio.on_started(&address, Some(&data)) {
                        // Clear the pending flag only after acknowledgement.
                        self.with_peer_mut(sep, address, |p| {
                            p.clear_flags(PeerFlags::PENDING_START)
                        });
                    }
                }

                // Remain in Opened if the start failed.
                if !data.status.is_success() {
                    return;
                }

                if sep == PeerSep::Source && self.peer_is_active(sep, &address) {
                    // Remove flush state, ready for streaming.
                    self.sink_audio.set_rx_flush(false);
                    self.sink_audio.on_start();
                }

                if should_suspend {
                    self.source_dispatch_sm_event(address, AvEvent::SuspendStreamReq);
                }
                self.transition_internal(sep, address, PeerState::Started, !should_suspend);
            }

            AvEvent::DisconnectReq => {
                let (handle, is_source) =
                    self.with_peer(sep, address, |p| (p.handle(), p.is_source())).unwrap();
                self.transport.close(handle);
                if is_source {
                    self.transport.close_rc(handle);
                }
                self.report_connection_state(address, BtavConnectionState::Disconnecting);
                // Wait in Closing until fully closed.
                self.transition_to(sep, address, PeerState::Closing);
            }

            AvEvent::Close(data) => {
                let pending_start = self
                    .with_peer(sep, address, |p| p.check_flags(PeerFlags::PENDING_START))
                    .unwrap_or(false);
                if pending_start {
                    warn!("Peer {} : failed pending start request", address);
                    let av_start = StartData {
                        handle: data.handle,
                        status: AvStatus::FailStream,
                        initiator: true,
                        suspending: true,
                    };
                    self.source_audio.on_started(&address, Some(&av_start));
                    // The pending start flag is cleared on exiting Opened.
                } else if self.peer_is_active(sep, &address) {
                    self.audio_on_stopped(sep, None);
                }
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::Reconfig(data) => {
                if !data.status.is_success() {
                    warn!("Peer {} : failed reconfiguration", address);
                    let pending_start = self
                        .with_peer(sep, address, |p| p.check_flags(PeerFlags::PENDING_START))
                        .unwrap_or(false);
                    if pending_start {
                        error!("Peer {} : cannot start after failed reconfiguration", address);
                        self.with_peer_mut(sep, address, |p| {
                            p.clear_flags(PeerFlags::PENDING_START)
                        });
                        self.source_audio.command_ack(BtStatus::Fail);
                    }
                    self.disconnect_peer_downward(sep, address);
                    return;
                }

                if self.peer_is_active(sep, &address) {
                    info!("Peer {} : reconfig done - restarting the audio session", address);
                    let (reply, _discard) = oneshot::channel();
                    self.source_audio.start_session(address, reply);
                }
                let pending_start = self
                    .with_peer(sep, address, |p| p.check_flags(PeerFlags::PENDING_START))
                    .unwrap_or(false);
                if pending_start {
                    let (handle, latency) = self
                        .with_peer(sep, address, |p| (p.handle(), p.use_latency_mode()))
                        .unwrap();
                    info!("Peer {} : reconfig done - starting the stream", address);
                    self.transport.start(handle, latency);
                }
            }

            AvEvent::ConnectReq => {
                warn!("Peer {} : ignore connect request for connected device", address);
            }

            AvEvent::OffloadStartReq => {
                error!("Peer {} : OFFLOAD_START_REQ: stream is not Started", address);
                self.source_audio.on_offload_started(&address, AvStatus::Fail);
            }

            AvEvent::AvrcpRemotePlay => {
                if self
                    .with_peer(sep, address, |p| p.check_flags(PeerFlags::REMOTE_SUSPEND))
                    .unwrap_or(false)
                {
                    debug!("Peer {} : resetting remote suspend flag on RC PLAY", address);
                    self.with_peer_mut(sep, address, |p| p.clear_flags(PeerFlags::REMOTE_SUSPEND));
                }
            }

            AvEvent::SetLatencyReq { is_low_latency } => {
                let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                info!("Peer {} : is_low_latency={}", address, is_low_latency);
                self.transport.set_latency(handle, is_low_latency);
            }

            AvEvent::Rc(rc) => self.rc.handle_event(Some(address), &rc),

            _ => warn!("Peer {} : Unhandled event={}", address, event.name()),
        }
    }

    fn started_process_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        match event {
            AvEvent::AclDisconnected => {}

            AvEvent::StartStreamReq { .. } => {
                info!("Peer {} : event=START_STREAM_REQ while started", address);
                // We were started remotely; just ack back the local request.
                if sep == PeerSep::Sink {
                    self.source_audio.on_started(&address, None);
                }
            }

            ev @ (AvEvent::StopStreamReq | AvEvent::SuspendStreamReq) => {
                info!("Peer {} : event={}", address, ev.name());
                let is_stop = matches!(ev, AvEvent::StopStreamReq);
                self.with_peer_mut(sep, address, |p| {
                    // Keep the media task from restarting the stream while
                    // the suspend is in flight; a local suspend overrides a
                    // remote one.
                    p.set_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
                    p.clear_flags(PeerFlags::REMOTE_SUSPEND);
                });

                let is_active = self.peer_is_active(sep, &address);
                if sep == PeerSep::Sink && (is_active || !self.stream_started_ready()) {
                    if is_stop {
                        self.audio_on_stopped(sep, None);
                    } else {
                        // Ensure tx frames are immediately suspended.
                        self.source_audio.set_tx_flush(true);
                    }
                } else if sep == PeerSep::Source {
                    self.audio_on_stopped(sep, None);
                }

                // Suspend is used even for stop to work around transports
                // that drop the stream context on a full stop.
                let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                self.transport.stop(handle, true);
            }

            AvEvent::DisconnectReq => {
                info!("Peer {} : event=DISCONNECT_REQ", address);
                let (handle, is_source) =
                    self.with_peer(sep, address, |p| (p.handle(), p.is_source())).unwrap();
                self.transport.close(handle);
                if is_source {
                    self.transport.close_rc(handle);
                }
                self.report_connection_state(address, BtavConnectionState::Disconnecting);
                self.transition_to(sep, address, PeerState::Closing);
            }

            AvEvent::Suspend(data) => {
                info!(
                    "Peer {} : event=AV_SUSPEND status={:?} initiator={}",
                    address, data.status, data.initiator
                );

                let is_active = self.peer_is_active(sep, &address);
                if is_active || !self.stream_started_ready() {
                    self.audio_on_suspended(sep, &data);
                }

                // Remain in Started if the suspend failed.
                if !data.status.is_success() {
                    self.with_peer_mut(sep, address, |p| {
                        p.clear_flags(PeerFlags::LOCAL_SUSPEND_PENDING)
                    });
                    if sep == PeerSep::Sink && is_active {
                        // Suspend failed, reset the tx flush state.
                        self.source_audio.set_tx_flush(false);
                    }
                    return;
                }

                let mut audio_state = BtavAudioState::RemoteSuspend;
                if !data.initiator {
                    // Remote suspend blocks the media task from restarting
                    // the stream, unless a local suspend was already racing
                    // it; the local suspend wins.
                    if !self
                        .with_peer(sep, address, |p| {
                            p.check_flags(PeerFlags::LOCAL_SUSPEND_PENDING)
                        })
                        .unwrap_or(false)
                    {
                        self.with_peer_mut(sep, address, |p| {
                            p.set_flags(PeerFlags::REMOTE_SUSPEND)
                        });
                    }
                } else {
                    audio_state = BtavAudioState::Stopped;
                }

                self.report_audio_state(address, audio_state);
                self.transition_to(sep, address, PeerState::Opened);
            }

            AvEvent::Stop(data) => {
                info!("Peer {} : event=AV_STOP status={:?}", address, data.status);
                self.with_peer_mut(sep, address, |p| {
                    p.set_flags(PeerFlags::PENDING_STOP);
                    p.clear_flags(PeerFlags::LOCAL_SUSPEND_PENDING);
                });

                // The encoder and the audio session are shared; only the
                // active peer may tear them down.
                let is_active = self.peer_is_active(sep, &address);
                if is_active || !self.stream_started_ready() {
                    self.audio_on_stopped(sep, Some(&data));
                }

                self.report_audio_state(address, BtavAudioState::Stopped);

                if data.status.is_success() {
                    self.transition_to(sep, address, PeerState::Opened);
                }
            }

            AvEvent::Close(_) => {
                info!("Peer {} : event=AV_CLOSE", address);
                self.with_peer_mut(sep, address, |p| p.set_flags(PeerFlags::PENDING_STOP));

                if self.peer_is_active(sep, &address) {
                    self.audio_on_stopped(sep, None);
                }

                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::OffloadStartReq => {
                let suspending = self
                    .with_peer(sep, address, |p| {
                        p.check_flags(
                            PeerFlags::LOCAL_SUSPEND_PENDING
                                | PeerFlags::REMOTE_SUSPEND
                                | PeerFlags::PENDING_STOP,
                        )
                    })
                    .unwrap_or(false);
                if suspending {
                    warn!("Peer {} : OFFLOAD_START_REQ: stream is suspending", address);
                    self.source_audio.on_offload_started(&address, AvStatus::Fail);
                } else {
                    let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                    self.transport.offload_start(handle);
                }
            }

            AvEvent::OffloadStartRsp(status) => {
                self.source_audio.on_offload_started(&address, status);
            }

            AvEvent::SetLatencyReq { is_low_latency } => {
                let handle = self.with_peer(sep, address, |p| p.handle()).unwrap();
                info!("Peer {} : is_low_latency={}", address, is_low_latency);
                self.transport.set_latency(handle, is_low_latency);
            }

            AvEvent::Rc(rc) => self.rc.handle_event(Some(address), &rc),

            _ => warn!("Peer {} : Unhandled event={}", address, event.name()),
        }
    }

    fn closing_process_event(&mut self, sep: PeerSep, address: Address, event: AvEvent) {
        match event {
            AvEvent::SuspendStreamReq | AvEvent::AclDisconnected => {}

            AvEvent::Stop(_) | AvEvent::StopStreamReq => {
                if self.peer_is_active(sep, &address) {
                    self.audio_on_stopped(sep, None);
                }
            }

            AvEvent::Close(_) => {
                self.report_connection_state(address, BtavConnectionState::Disconnected);
                self.transition_to(sep, address, PeerState::Idle);
            }

            AvEvent::Rc(rc @ (RcEvent::Close { .. } | RcEvent::BrowseClose { .. })) => {
                self.rc.handle_event(Some(address), &rc);
            }

            AvEvent::OffloadStartReq => {
                error!("Peer {} : OFFLOAD_START_REQ: stream is not Opened", address);
                self.source_audio.on_offload_started(&address, AvStatus::Fail);
            }

            AvEvent::ConnectReq => {
                warn!("Peer {} : ignore connect request while closing", address);
                self.transition_to(sep, address, PeerState::Idle);
            }

            _ => warn!("Peer {} : Unhandled event={}", address, event.name()),
        }
    }

    fn audio_on_stopped(&mut self, sep: PeerSep, suspend: Option<&SuspendData>) {
        match sep {
            PeerSep::Sink => self.source_audio.on_stopped(suspend),
            PeerSep::Source => self.sink_audio.on_stopped(suspend),
        }
    }

    fn audio_on_suspended(&mut self, sep: PeerSep, suspend: &SuspendData) {
        match sep {
            PeerSep::Sink => self.source_audio.on_suspended(suspend),
            PeerSep::Source => self.sink_audio.on_suspended(suspend),
        }
    }

    fn audio_on_idle(&mut self, sep: PeerSep) {
        match sep {
            PeerSep::Sink => self.source_audio.on_idle(),
            PeerSep::Source => self.sink_audio.on_idle(),
        }
    }
}
