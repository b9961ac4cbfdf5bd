//! AVRCP sub-events and the seam to the AVRCP module.
//!
//! The session manager does not interpret AVRCP traffic. Remote-control
//! events ride the same transport callback as the AV signalling events and
//! are forwarded verbatim to the AVRCP module; only Open/Close and the
//! remote PLAY command influence the AV state machine.

use crate::peer::TransportHandle;
use crate::Address;

/// Passthrough command id for PLAY.
pub const RC_ID_PLAY: u8 = 0x44;

/// AVRCP events carried inside [`crate::event::AvEvent::Rc`].
///
/// Variable-length vendor and browse payloads are owned so a clone of the
/// enclosing event is a deep copy.
#[derive(Debug, Clone)]
pub enum RcEvent {
    /// Remote control channel opened.
    Open { address: Address, status: u8 },
    /// Remote control channel closed.
    Close { address: Address },
    /// Browsing channel opened.
    BrowseOpen { address: Address },
    /// Browsing channel closed.
    BrowseClose { address: Address },
    /// Passthrough command from the remote. Params: command id, key state.
    RemoteCmd { rc_id: u8, key_state: u8 },
    /// Passthrough response from the remote. Params: command id, key state.
    RemoteRsp { rc_id: u8, key_state: u8 },
    /// Vendor-dependent command payload.
    VendorCmd { data: Vec<u8> },
    /// Metadata message with optional nested vendor and browse buffers.
    MetaMsg { data: Vec<u8>, vendor: Vec<u8>, browse: Vec<u8> },
    /// Remote features update.
    Feat { address: Address, features: u32 },
    /// Cover-art PSM report.
    CoverArtPsm { address: Address, psm: u16 },
}

impl RcEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RcEvent::Open { .. } => "RC_OPEN",
            RcEvent::Close { .. } => "RC_CLOSE",
            RcEvent::BrowseOpen { .. } => "RC_BROWSE_OPEN",
            RcEvent::BrowseClose { .. } => "RC_BROWSE_CLOSE",
            RcEvent::RemoteCmd { .. } => "RC_REMOTE_CMD",
            RcEvent::RemoteRsp { .. } => "RC_REMOTE_RSP",
            RcEvent::VendorCmd { .. } => "RC_VENDOR_CMD",
            RcEvent::MetaMsg { .. } => "RC_META_MSG",
            RcEvent::Feat { .. } => "RC_FEAT",
            RcEvent::CoverArtPsm { .. } => "RC_COVER_ART_PSM",
        }
    }

    /// The peer address carried by the event, for events that have one.
    pub fn address(&self) -> Option<Address> {
        match self {
            RcEvent::Open { address, .. }
            | RcEvent::Close { address }
            | RcEvent::BrowseOpen { address }
            | RcEvent::BrowseClose { address }
            | RcEvent::Feat { address, .. }
            | RcEvent::CoverArtPsm { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Seam to the AVRCP module.
pub trait AvrcpHandler: Send {
    /// Forwards an AVRCP event for the given peer.
    fn handle_event(&mut self, address: Option<Address>, event: &RcEvent);

    /// Whether the AVRCP control channel is up for the peer.
    fn is_connected_peer(&self, address: &Address) -> bool;

    /// The AVRCP-side handle for a connected peer, if any.
    fn connected_peer_handle(&self, address: &Address) -> Option<TransportHandle>;

    /// Replays a PLAY command that was queued while the AV channel was still
    /// coming up. `accepted` tells whether the AV open succeeded.
    fn check_pending_play(&mut self, address: &Address, accepted: bool);
}
