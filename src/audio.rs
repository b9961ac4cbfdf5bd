//! Seams to the audio HAL pipelines.
//!
//! There is one encoder pipeline for the source role and one decoder
//! pipeline for the sink role; each is a singleton shared by every peer of
//! that role. Only the active peer may drive them, which the state machine
//! enforces at every call site.

use std::sync::mpsc::Sender;

use tokio::sync::oneshot;

use crate::a2dp::{A2dpCodecConfig, AvStatus, BtStatus};
use crate::event::{StartData, SuspendData};
use crate::Address;

/// Single-shot rendezvous fulfilled when the audio pipeline is ready for
/// the peer it was (re)started against. Always fulfilled, also on failure,
/// so the caller can never deadlock.
pub type PeerReadySender = oneshot::Sender<()>;

/// The encoder pipeline used when the local device is the A2DP Source.
pub trait SourceAudioEngine: Send {
    fn init(&mut self) -> bool;

    fn cleanup(&mut self);

    /// Acknowledges a stream start towards the audio service. `start` is
    /// None when the start was remote and there is nothing to confirm.
    ///
    /// Returns true if the acknowledgement was delivered; only then may the
    /// pending-start flag be cleared.
    fn on_started(&mut self, address: &Address, start: Option<&StartData>) -> bool;

    /// The stream stopped; tear the encoder session down.
    fn on_stopped(&mut self, suspend: Option<&SuspendData>);

    /// The stream suspended; pause the encoder until resumed.
    fn on_suspended(&mut self, suspend: &SuspendData);

    /// No connected peer is left; quiesce the pipeline.
    fn on_idle(&mut self);

    /// Completion of an offload start request.
    fn on_offload_started(&mut self, address: &Address, status: AvStatus);

    /// Acknowledges a pending audio-control command without a state change.
    fn command_ack(&mut self, status: BtStatus);

    /// Gates handing encoded frames to the transport.
    fn set_tx_flush(&mut self, enable: bool);

    fn start_session(&mut self, address: Address, reply: PeerReadySender);

    fn end_session(&mut self, address: Address);

    /// Ends the session against `old_address` (if any) and starts one
    /// against `new_address`. Takes ownership of `reply` and fulfills it
    /// once the new pipeline is ready.
    ///
    /// Returns false if the restart could not even be scheduled; `reply` is
    /// fulfilled regardless.
    fn restart_session(
        &mut self,
        old_address: Option<Address>,
        new_address: Address,
        reply: PeerReadySender,
    ) -> bool;

    /// Shuts the pipeline down, signalling `done` on completion. The caller
    /// bounds its wait; the engine must signal even on failure.
    fn shutdown(&mut self, done: Sender<()>);

    /// Applies updated codec preferences for a peer, fulfilling `reply`
    /// once the encoder has reconfigured.
    fn encoder_user_config_update(
        &mut self,
        address: Address,
        codec_preferences: Vec<A2dpCodecConfig>,
        reply: PeerReadySender,
    );

    /// Publishes which codecs the offload path accepts.
    fn update_codec_offloading_capabilities(&mut self, offloading_preference: &[A2dpCodecConfig]);

    /// Audio-control delay bookkeeping, in 1/10 ms.
    fn set_audio_delay(&mut self, delay: u16);

    fn reset_audio_delay(&mut self);

    /// Pushes the active peer's delay report into the HAL.
    fn set_remote_delay(&mut self, delay: u16);

    fn set_dynamic_audio_buffer_size(&mut self, size: u8);

    // Vendor codec extension pass-through. The payloads are opaque here.
    fn codec_ext_version(&mut self, address: &Address) -> Vec<u8>;

    fn codec_ext_config(&mut self, address: &Address) -> Vec<u8>;

    fn set_codec_ext_config(&mut self, address: &Address, config: Vec<u8>) -> BtStatus;

    fn set_codec_ext_data(&mut self, address: &Address, data: Vec<u8>);
}

/// The decoder pipeline used when the local device is the A2DP Sink.
pub trait SinkAudioEngine: Send {
    fn init(&mut self) -> bool;

    fn cleanup(&mut self);

    /// The active source peer started streaming; start decoding.
    fn on_start(&mut self);

    fn on_stopped(&mut self, suspend: Option<&SuspendData>);

    fn on_suspended(&mut self, suspend: &SuspendData);

    fn on_idle(&mut self);

    /// Gates handing received samples to the audio track.
    fn set_rx_flush(&mut self, enable: bool);

    fn start_session(&mut self, address: Address, reply: PeerReadySender);

    fn end_session(&mut self, address: Address);

    fn restart_session(
        &mut self,
        old_address: Option<Address>,
        new_address: Address,
        reply: PeerReadySender,
    ) -> bool;

    fn shutdown(&mut self);

    /// Final audio focus state decided by the upper layer.
    fn set_focus_state(&mut self, state: i32);

    /// Track gain used for ducking.
    fn set_audio_track_gain(&mut self, gain: f32);
}
