//! Seam to the AVDTP signalling engine.
//!
//! Every method is a request; the engine confirms asynchronously by posting
//! the corresponding [`crate::event::AvEvent`] back to the control loop.

use crate::a2dp::AvFeatures;
use crate::peer::{PeerSep, TransportHandle};
use crate::Address;

pub trait AvTransport: Send {
    /// Brings the signalling engine up with the given feature set.
    fn enable(&mut self, features: AvFeatures);

    /// Tears the signalling engine down.
    fn disable(&mut self);

    /// Registers one stream endpoint slot. The engine answers with a
    /// Register event binding a transport handle to `peer_id`.
    fn register(&mut self, peer_id: u8, service_name: &str, sep: PeerSep);

    /// Releases a registered slot.
    fn deregister(&mut self, handle: TransportHandle);

    /// Opens the AVDTP connection towards a peer.
    fn open(&mut self, address: Address, handle: TransportHandle);

    /// Closes the AVDTP connection.
    fn close(&mut self, handle: TransportHandle);

    /// Starts the stream.
    fn start(&mut self, handle: TransportHandle, use_latency_mode: bool);

    /// Stops the stream. `suspend` requests a suspend rather than a full
    /// stream teardown.
    fn stop(&mut self, handle: TransportHandle, suspend: bool);

    /// Opens the AVRCP control channel towards the peer behind `handle`.
    fn open_rc(&mut self, handle: TransportHandle);

    /// Closes the AVRCP control channel.
    fn close_rc(&mut self, handle: TransportHandle);

    /// Hands the started stream to the hardware offload path. The engine
    /// answers with an OffloadStartRsp event.
    fn offload_start(&mut self, handle: TransportHandle);

    /// Propagates the low-latency preference for the stream.
    fn set_latency(&mut self, handle: TransportHandle, is_low_latency: bool);
}
