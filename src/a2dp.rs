//! Profile-level A2DP types shared between the registries, the state
//! machine and the external seams.

use num_traits::cast::FromPrimitive;

use crate::Address;

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum BtStatus {
    Success = 0,
    Fail,
    NotReady,
    NoMemory,
    Busy,
    Done,
    Unsupported,
    InvalidParam,
    Unhandled,
    AuthFailure,
    RemoteDeviceDown,
    AuthRejected,

    // Any statuses that couldn't be cleanly converted
    Unknown = 0xff,
}

impl From<u32> for BtStatus {
    fn from(item: u32) -> Self {
        match BtStatus::from_u32(item) {
            Some(x) => x,
            _ => BtStatus::Unknown,
        }
    }
}

/// Status reported by the AV transport in its confirmation events.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum AvStatus {
    Success = 0,
    Fail,
    FailSdp,
    FailStream,
    FailResources,
    FailRole,
    FailGetCapabilities,
}

impl AvStatus {
    pub fn is_success(&self) -> bool {
        *self == AvStatus::Success
    }
}

impl From<u8> for AvStatus {
    fn from(item: u8) -> Self {
        AvStatus::from_u8(item).unwrap_or(AvStatus::Fail)
    }
}

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum BtavConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

impl From<u32> for BtavConnectionState {
    fn from(item: u32) -> Self {
        BtavConnectionState::from_u32(item).unwrap()
    }
}

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum BtavAudioState {
    RemoteSuspend = 0,
    Stopped,
    Started,
}

impl From<u32> for BtavAudioState {
    fn from(item: u32) -> Self {
        BtavAudioState::from_u32(item).unwrap()
    }
}

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(i32)]
pub enum A2dpCodecPriority {
    Disabled = -1,
    Default = 0,
    Highest = 1000_000,
}

impl From<i32> for A2dpCodecPriority {
    fn from(item: i32) -> Self {
        A2dpCodecPriority::from_i32(item).unwrap_or(A2dpCodecPriority::Default)
    }
}

bitflags! {
    pub struct A2dpCodecSampleRate: i32 {
        const RATE_NONE = 0x0;
        const RATE_44100 = 0x01;
        const RATE_48000 = 0x02;
        const RATE_88200 = 0x04;
        const RATE_96000 = 0x08;
        const RATE_176400 = 0x10;
        const RATE_192000 = 0x20;
        const RATE_16000 = 0x40;
        const RATE_24000 = 0x80;
    }
}

impl A2dpCodecSampleRate {
    pub fn validate_bits(val: i32) -> bool {
        A2dpCodecSampleRate::from_bits(val).is_some()
    }
}

bitflags! {
    pub struct A2dpCodecBitsPerSample: i32 {
        const SAMPLE_NONE = 0x0;
        const SAMPLE_16 = 0x01;
        const SAMPLE_24 = 0x02;
        const SAMPLE_32 = 0x04;
    }
}

impl A2dpCodecBitsPerSample {
    pub fn validate_bits(val: i32) -> bool {
        A2dpCodecBitsPerSample::from_bits(val).is_some()
    }
}

bitflags! {
    pub struct A2dpCodecChannelMode: i32 {
        const MODE_NONE = 0x0;
        const MODE_MONO = 0x01;
        const MODE_STEREO = 0x02;
    }
}

impl A2dpCodecChannelMode {
    pub fn validate_bits(val: i32) -> bool {
        A2dpCodecChannelMode::from_bits(val).is_some()
    }
}

/// One codec configuration record as exchanged with the upper layer and the
/// codec negotiation module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct A2dpCodecConfig {
    pub codec_type: i32,
    pub codec_priority: i32,
    pub sample_rate: i32,
    pub bits_per_sample: i32,
    pub channel_mode: i32,
    pub codec_specific_1: i64,
    pub codec_specific_2: i64,
    pub codec_specific_3: i64,
    pub codec_specific_4: i64,
}

bitflags! {
    /// Feature set passed to the transport when a side is enabled.
    pub struct AvFeatures: u32 {
        const REMOTE_CONTROL_TARGET = 0x0001;
        const REMOTE_CONTROL_CONTROLLER = 0x0002;
        const VENDOR_COMMANDS = 0x0004;
        const METADATA = 0x0008;
        const ADVANCED_CONTROL = 0x0010;
        const BROWSING = 0x0020;
        const COVER_ARTWORK = 0x0040;
        const NO_SCO_SUSPEND = 0x0080;
        const DELAY_REPORTING = 0x0100;
    }
}

/// Seam to the codec negotiation module that selects and reconfigures the
/// stream codec for the active peer.
pub trait AvCodecNegotiation: Send {
    /// Initializes codec selection with the upper layer's priorities.
    fn init(&mut self, codec_priorities: &[A2dpCodecConfig]);

    /// Points codec selection at a new active peer, or at no peer.
    ///
    /// Returns false if the module rejected the change.
    fn set_active_peer(&mut self, peer_address: Option<Address>) -> bool;
}
