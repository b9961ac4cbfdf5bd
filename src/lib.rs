//! Per-peer A2DP session management.
//!
//! This crate tracks every remote audio peer (source or sink role), drives
//! each through the AVDTP signalling state machine, arbitrates which peer is
//! routed to the local audio pipeline, and reports connection and audio
//! state upward. The AVDTP/AVRCP packet engine, the audio HAL pipelines and
//! the AVRCP module are collaborators behind traits.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;

pub mod a2dp;
pub mod audio;
pub mod avrcp;
pub mod bluetooth_av;
pub mod callbacks;
pub mod config_util;
pub mod event;
pub mod peer;
pub mod transport;

mod state_machine;

#[cfg(test)]
pub(crate) mod mocks;

use std::fmt::{Debug, Display, Formatter, Result};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::a2dp::A2dpCodecConfig;
use crate::audio::PeerReadySender;
use crate::bluetooth_av::BluetoothAv;
use crate::callbacks::CallbackMessage;
use crate::event::AvEvent;
use crate::peer::{PeerSep, TransportHandle};

/// Represents a Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    val: [u8; 6],
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_fmt(format_args!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        ))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        Debug::fmt(self, f)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self { val: [0; 6] }
    }
}

impl Address {
    /// Constructs an Address from a vector of 6 bytes.
    pub fn from_byte_vec(raw_addr: &Vec<u8>) -> Option<Address> {
        if let Ok(val) = raw_addr.clone().try_into() {
            return Some(Address { val });
        }
        None
    }

    pub fn from_string(addr_str: String) -> Option<Address> {
        let s = addr_str.split(':').collect::<Vec<&str>>();

        if s.len() != 6 {
            return None;
        }

        let mut raw: [u8; 6] = [0; 6];
        for i in 0..s.len() {
            raw[i] = match u8::from_str_radix(s[i], 16) {
                Ok(res) => res,
                Err(_) => {
                    return None;
                }
            };
        }

        Some(Address { val: raw })
    }

    pub fn to_byte_vec(&self) -> Vec<u8> {
        self.val.to_vec()
    }
}

/// Message types that are sent to the control loop.
///
/// All registry and peer mutation happens on the control loop; everything
/// else posts one of these.
#[derive(Debug)]
pub enum Message {
    /// Transport event whose peer addressing is carried in the payload.
    /// `sep` is the stream endpoint type of the remote the event is about.
    AvTransport { sep: PeerSep, event: AvEvent },

    /// Event with explicit peer addressing.
    Av { sep: PeerSep, address: Option<Address>, handle: TransportHandle, event: AvEvent },

    /// Switch (or clear) the active peer of one side.
    SetActivePeer { sep: PeerSep, address: Option<Address>, reply: PeerReadySender },

    /// Apply updated codec preferences for a source-side peer.
    UpdateCodecConfig {
        address: Address,
        codec_preferences: Vec<A2dpCodecConfig>,
        reply: PeerReadySender,
    },

    /// Mute or unmute a source-side peer.
    SetSilence { address: Address, silence: bool },

    /// Answer of the mandatory-codec query run on the callback loop.
    SetMandatoryCodecPreferred { address: Address, preferred: bool },

    /// Deferred sweep freeing peers that re-entered Idle.
    DeleteIdlePeers { sep: PeerSep },

    /// The AVRCP-without-AVDTP interop timer fired for a peer.
    AvOpenOnRcTimeout { sep: PeerSep, address: Address },

    /// Delay report received from the transport, in 1/10 ms.
    SetAudioDelay { address: Address, delay: u16 },

    CleanupSource,
    CleanupSink,
}

/// Umbrella for the dispatch loops of the AV stack.
pub struct Stack {}

impl Stack {
    /// Creates an mpsc channel for passing messages to the control loop.
    ///
    /// The channel is unbounded so the state machine can post follow-up
    /// events to itself without blocking the control loop.
    pub fn create_channel() -> (UnboundedSender<Message>, UnboundedReceiver<Message>) {
        unbounded_channel::<Message>()
    }

    /// Creates an mpsc channel for passing notifications to the callback
    /// loop.
    pub fn create_callback_channel(
    ) -> (UnboundedSender<CallbackMessage>, UnboundedReceiver<CallbackMessage>) {
        unbounded_channel::<CallbackMessage>()
    }

    /// Runs the control dispatch loop.
    pub async fn dispatch(mut rx: UnboundedReceiver<Message>, av: Arc<Mutex<BluetoothAv>>) {
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                eprintln!("Message dispatch loop quit");
                break;
            }

            debug!("Message handler: {:?}", m);

            av.lock().unwrap().handle_message(m.unwrap());
        }
    }
}
