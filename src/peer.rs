//! The per-remote-device record.

use tokio::task::JoinHandle;

use crate::Address;

/// Stream handle assigned by the transport when a slot is registered.
pub type TransportHandle = u16;

/// Peers may briefly carry this sentinel before the Register event binds a
/// real handle to their peer id.
pub const HANDLE_UNKNOWN: TransportHandle = 0;

/// EDR capability bit for 2 Mbps.
pub const EDR_2MBPS: u8 = 0x01;
/// EDR capability bit for 3 Mbps.
pub const EDR_3MBPS: u8 = 0x02;

/// How long to wait for the remote to open AVDTP after it opened AVRCP
/// before we initiate AVDTP ourselves.
pub const AV_OPEN_ON_RC_TIMEOUT_MS: u64 = 2 * 1000;

/// Stream endpoint type of the remote device. A Source peer sends audio to
/// us (the local device plays the sink role); a Sink peer receives audio
/// from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSep {
    Source,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// `previous_state` of a peer that never left Idle.
    Invalid,
    Idle,
    Opening,
    Opened,
    Started,
    Closing,
}

impl PeerState {
    /// States counted against the max-connections policy.
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(self, PeerState::Opening | PeerState::Opened | PeerState::Started)
    }
}

bitflags! {
    pub struct PeerFlags: u8 {
        /// A locally initiated suspend is outstanding to the transport.
        const LOCAL_SUSPEND_PENDING = 0x1;
        /// The remote suspended the stream and has not resumed it.
        const REMOTE_SUSPEND = 0x2;
        /// A locally initiated start is outstanding to the transport.
        const PENDING_START = 0x4;
        /// A stop confirmation is outstanding.
        const PENDING_STOP = 0x8;
    }
}

pub struct Peer {
    address: Address,
    sep: PeerSep,
    handle: TransportHandle,
    peer_id: u8,
    state: PeerState,
    previous_state: PeerState,
    flags: PeerFlags,
    edr: u8,
    self_initiated_connection: bool,
    is_silenced: bool,
    delay_report: u16,
    mandatory_codec_preferred: bool,
    use_latency_mode: bool,
    /// Armed when the remote opens AVRCP without AVDTP; synthesizes a
    /// connect request on expiry.
    av_open_on_rc_task: Option<JoinHandle<()>>,
}

impl Peer {
    pub fn new(address: Address, sep: PeerSep, handle: TransportHandle, peer_id: u8) -> Peer {
        Peer {
            address,
            sep,
            handle,
            peer_id,
            state: PeerState::Idle,
            previous_state: PeerState::Invalid,
            flags: PeerFlags::empty(),
            edr: 0,
            self_initiated_connection: false,
            is_silenced: false,
            delay_report: 0,
            mandatory_codec_preferred: false,
            use_latency_mode: false,
            av_open_on_rc_task: None,
        }
    }

    /// Stops the timers. The peer must not process further events.
    pub fn cleanup(&mut self) {
        self.cancel_av_open_on_rc_timer();
    }

    /// A peer may only be freed once it sits in Idle *and* has actually
    /// transitioned through Idle, so that a just-created record is not
    /// garbage-collected before its first event.
    pub fn can_be_deleted(&self) -> bool {
        self.state == PeerState::Idle && self.previous_state != PeerState::Invalid
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn sep(&self) -> PeerSep {
        self.sep
    }

    /// True if the remote is an A2DP Source.
    pub fn is_source(&self) -> bool {
        self.sep == PeerSep::Source
    }

    /// True if the remote is an A2DP Sink.
    pub fn is_sink(&self) -> bool {
        self.sep == PeerSep::Sink
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    pub fn set_handle(&mut self, handle: TransportHandle) {
        self.handle = handle;
    }

    pub fn peer_id(&self) -> u8 {
        self.peer_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn previous_state(&self) -> PeerState {
        self.previous_state
    }

    pub(crate) fn set_state(&mut self, state: PeerState) {
        self.previous_state = self.state;
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Opened || self.state == PeerState::Started
    }

    pub fn is_streaming(&self) -> bool {
        self.state == PeerState::Started
    }

    pub fn set_edr(&mut self, edr: u8) {
        self.edr = edr;
    }

    pub fn is_edr(&self) -> bool {
        self.edr != 0
    }

    pub fn is_3mbps(&self) -> bool {
        (self.edr & EDR_3MBPS) != 0
    }

    /// Check whether any of the flags specified by the mask is set.
    pub fn check_flags(&self, mask: PeerFlags) -> bool {
        self.flags.intersects(mask)
    }

    /// Set only the flags specified by the mask.
    pub fn set_flags(&mut self, mask: PeerFlags) {
        self.flags.insert(mask);
    }

    /// Clear only the flags specified by the mask.
    pub fn clear_flags(&mut self, mask: PeerFlags) {
        self.flags.remove(mask);
    }

    pub fn clear_all_flags(&mut self) {
        self.flags = PeerFlags::empty();
    }

    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    /// String representation of the set flags.
    pub fn flags_to_string(&self) -> String {
        let mut result = String::new();
        for (flag, name) in [
            (PeerFlags::LOCAL_SUSPEND_PENDING, "LOCAL_SUSPEND_PENDING"),
            (PeerFlags::REMOTE_SUSPEND, "REMOTE_SUSPEND"),
            (PeerFlags::PENDING_START, "PENDING_START"),
            (PeerFlags::PENDING_STOP, "PENDING_STOP"),
        ] {
            if self.flags.contains(flag) {
                if !result.is_empty() {
                    result += "|";
                }
                result += name;
            }
        }
        if result.is_empty() {
            result = String::from("None");
        }
        format!("0x{:x}({})", self.flags.bits(), result)
    }

    pub fn self_initiated_connection(&self) -> bool {
        self.self_initiated_connection
    }

    pub fn set_self_initiated_connection(&mut self, v: bool) {
        self.self_initiated_connection = v;
    }

    pub fn is_in_silence_mode(&self) -> bool {
        self.is_silenced
    }

    pub fn set_silence(&mut self, silence: bool) {
        self.is_silenced = silence;
    }

    /// AVDTP delay reporting in 1/10 milliseconds.
    pub fn set_delay_report(&mut self, delay: u16) {
        self.delay_report = delay;
    }

    pub fn delay_report(&self) -> u16 {
        self.delay_report
    }

    pub fn set_mandatory_codec_preferred(&mut self, preferred: bool) {
        self.mandatory_codec_preferred = preferred;
    }

    pub fn is_mandatory_codec_preferred(&self) -> bool {
        self.mandatory_codec_preferred
    }

    pub fn use_latency_mode(&self) -> bool {
        self.use_latency_mode
    }

    pub fn set_use_latency_mode(&mut self, use_latency_mode: bool) {
        self.use_latency_mode = use_latency_mode;
    }

    pub(crate) fn set_av_open_on_rc_task(&mut self, task: JoinHandle<()>) {
        self.cancel_av_open_on_rc_timer();
        self.av_open_on_rc_task = Some(task);
    }

    pub(crate) fn cancel_av_open_on_rc_timer(&mut self) {
        if let Some(task) = self.av_open_on_rc_task.take() {
            task.abort();
        }
    }

    pub fn av_open_on_rc_timer_scheduled(&self) -> bool {
        self.av_open_on_rc_task.is_some()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.cancel_av_open_on_rc_timer();
    }
}
