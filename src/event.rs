//! Events consumed by the per-peer state machines.
//!
//! An [`AvEvent`] is an immutable tagged record: the variant is the event
//! kind and the variant fields are the payload. Every payload is owned by
//! the event (including the nested AVRCP vendor/browse buffers), so events
//! can be cloned and posted across threads without sharing allocations with
//! the transport that produced them.

use crate::a2dp::{AvFeatures, AvStatus};
use crate::avrcp::RcEvent;
use crate::peer::{PeerSep, TransportHandle};
use crate::Address;

#[derive(Debug, Clone)]
pub struct EnableData {
    pub features: AvFeatures,
}

#[derive(Debug, Clone)]
pub struct RegisterData {
    pub handle: TransportHandle,
    /// The peer id is used as the application id when registering slots.
    pub peer_id: u8,
    pub status: AvStatus,
}

#[derive(Debug, Clone)]
pub struct OpenData {
    pub address: Address,
    pub handle: TransportHandle,
    pub status: AvStatus,
    /// EDR capability bits of the remote radio.
    pub edr: u8,
    /// Stream endpoint type of the remote.
    pub sep: PeerSep,
}

#[derive(Debug, Clone)]
pub struct CloseData {
    pub handle: TransportHandle,
}

#[derive(Debug, Clone)]
pub struct StartData {
    pub handle: TransportHandle,
    pub status: AvStatus,
    /// Whether the local side initiated the start.
    pub initiator: bool,
    /// Set when the transport is already suspending the freshly started
    /// stream; such events carry no work for the state machine.
    pub suspending: bool,
}

#[derive(Debug, Clone)]
pub struct SuspendData {
    pub handle: TransportHandle,
    pub status: AvStatus,
    pub initiator: bool,
}

#[derive(Debug, Clone)]
pub struct ReconfigData {
    pub handle: TransportHandle,
    pub status: AvStatus,
}

#[derive(Debug, Clone)]
pub struct RejectData {
    pub address: Address,
    pub handle: TransportHandle,
}

#[derive(Debug, Clone)]
pub struct PendingData {
    pub address: Address,
}

#[derive(Debug, Clone)]
pub struct SinkConfigData {
    pub address: Address,
    pub sample_rate: i32,
    pub channel_count: i32,
}

/// Event kinds handled by the state machine: transport confirmations and
/// indications, AVRCP sub-events, and upper-layer requests.
#[derive(Debug, Clone)]
pub enum AvEvent {
    // Transport events.
    Enable(EnableData),
    Register(RegisterData),
    Open(OpenData),
    Close(CloseData),
    Start(StartData),
    Stop(SuspendData),
    Suspend(SuspendData),
    Reconfig(ReconfigData),
    Reject(RejectData),
    Pending(PendingData),
    OffloadStartRsp(AvStatus),
    Rc(RcEvent),

    // Upper-layer requests.
    ConnectReq,
    DisconnectReq,
    StartStreamReq { use_latency_mode: Option<bool> },
    StopStreamReq,
    SuspendStreamReq,
    SinkConfigReq(SinkConfigData),
    AclDisconnected,
    OffloadStartReq,
    AvrcpOpen,
    AvrcpClose,
    AvrcpRemotePlay,
    SetLatencyReq { is_low_latency: bool },
}

impl AvEvent {
    /// Human-readable event name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            AvEvent::Enable(_) => "AV_ENABLE",
            AvEvent::Register(_) => "AV_REGISTER",
            AvEvent::Open(_) => "AV_OPEN",
            AvEvent::Close(_) => "AV_CLOSE",
            AvEvent::Start(_) => "AV_START",
            AvEvent::Stop(_) => "AV_STOP",
            AvEvent::Suspend(_) => "AV_SUSPEND",
            AvEvent::Reconfig(_) => "AV_RECONFIG",
            AvEvent::Reject(_) => "AV_REJECT",
            AvEvent::Pending(_) => "AV_PENDING",
            AvEvent::OffloadStartRsp(_) => "AV_OFFLOAD_START_RSP",
            AvEvent::Rc(rc) => rc.name(),
            AvEvent::ConnectReq => "CONNECT_REQ",
            AvEvent::DisconnectReq => "DISCONNECT_REQ",
            AvEvent::StartStreamReq { .. } => "START_STREAM_REQ",
            AvEvent::StopStreamReq => "STOP_STREAM_REQ",
            AvEvent::SuspendStreamReq => "SUSPEND_STREAM_REQ",
            AvEvent::SinkConfigReq(_) => "SINK_CONFIG_REQ",
            AvEvent::AclDisconnected => "ACL_DISCONNECTED",
            AvEvent::OffloadStartReq => "OFFLOAD_START_REQ",
            AvEvent::AvrcpOpen => "AVRCP_OPEN",
            AvEvent::AvrcpClose => "AVRCP_CLOSE",
            AvEvent::AvrcpRemotePlay => "AVRCP_REMOTE_PLAY",
            AvEvent::SetLatencyReq { .. } => "SET_LATENCY_REQ",
        }
    }
}
