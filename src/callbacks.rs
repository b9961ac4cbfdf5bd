//! Upward notifications to the host audio service.
//!
//! All callbacks are serialized on a dedicated dispatch loop so the host is
//! never entered while the core lock is held. The control loop posts
//! [`CallbackMessage`]s; the only message that flows back is the result of
//! the synchronous mandatory-codec query.

use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::a2dp::{A2dpCodecConfig, BtavAudioState, BtavConnectionState};
use crate::{Address, Message};

/// Callbacks registered by the audio service for the source role.
pub trait IAvSourceCallbacks: Send {
    fn connection_state(&mut self, address: Address, state: BtavConnectionState);

    fn audio_state(&mut self, address: Address, state: BtavAudioState);

    fn audio_config(
        &mut self,
        address: Address,
        codec_config: A2dpCodecConfig,
        codecs_local_capabilities: Vec<A2dpCodecConfig>,
        codecs_selectable_capabilities: Vec<A2dpCodecConfig>,
    );

    /// Synchronous query: should the mandatory codec beat optional ones for
    /// this peer?
    fn mandatory_codec_preferred(&mut self, address: Address) -> bool;
}

/// Callbacks registered by the audio service for the sink role.
pub trait IAvSinkCallbacks: Send {
    fn connection_state(&mut self, address: Address, state: BtavConnectionState);

    fn audio_state(&mut self, address: Address, state: BtavAudioState);

    fn audio_config(&mut self, address: Address, sample_rate: i32, channel_count: i32);
}

pub type SharedSourceCallbacks = Arc<Mutex<Option<Box<dyn IAvSourceCallbacks>>>>;
pub type SharedSinkCallbacks = Arc<Mutex<Option<Box<dyn IAvSinkCallbacks>>>>;

/// Messages drained by the callback dispatch loop.
#[derive(Debug, PartialEq)]
pub enum CallbackMessage {
    SourceConnectionState(Address, BtavConnectionState),
    SourceAudioState(Address, BtavAudioState),
    SourceAudioConfig(Address, A2dpCodecConfig, Vec<A2dpCodecConfig>, Vec<A2dpCodecConfig>),
    /// Runs the synchronous mandatory-codec query and posts the answer back
    /// to the control loop.
    QueryMandatoryCodec(Address),
    SinkConnectionState(Address, BtavConnectionState),
    SinkAudioState(Address, BtavAudioState),
    SinkAudioConfig(Address, i32, i32),
}

pub struct CallbackDispatcher {
    source: SharedSourceCallbacks,
    sink: SharedSinkCallbacks,
    tx: UnboundedSender<Message>,
}

impl CallbackDispatcher {
    pub fn new(
        source: SharedSourceCallbacks,
        sink: SharedSinkCallbacks,
        tx: UnboundedSender<Message>,
    ) -> CallbackDispatcher {
        CallbackDispatcher { source, sink, tx }
    }

    /// Runs the callback dispatch loop until the channel closes.
    pub async fn dispatch(&self, mut rx: UnboundedReceiver<CallbackMessage>) {
        while let Some(m) = rx.recv().await {
            match m {
                CallbackMessage::SourceConnectionState(address, state) => {
                    if let Some(cb) = self.source.lock().unwrap().as_mut() {
                        cb.connection_state(address, state);
                    }
                }
                CallbackMessage::SourceAudioState(address, state) => {
                    if let Some(cb) = self.source.lock().unwrap().as_mut() {
                        cb.audio_state(address, state);
                    }
                }
                CallbackMessage::SourceAudioConfig(address, config, local, selectable) => {
                    if let Some(cb) = self.source.lock().unwrap().as_mut() {
                        cb.audio_config(address, config, local, selectable);
                    }
                }
                CallbackMessage::QueryMandatoryCodec(address) => {
                    let preferred = match self.source.lock().unwrap().as_mut() {
                        Some(cb) => cb.mandatory_codec_preferred(address),
                        None => {
                            warn!("[{}]: no source callbacks for codec query", address);
                            false
                        }
                    };
                    // Apply on the control loop only when preferred; the
                    // default peer value already covers the other case.
                    if preferred {
                        let _ =
                            self.tx.send(Message::SetMandatoryCodecPreferred { address, preferred });
                    }
                }
                CallbackMessage::SinkConnectionState(address, state) => {
                    if let Some(cb) = self.sink.lock().unwrap().as_mut() {
                        cb.connection_state(address, state);
                    }
                }
                CallbackMessage::SinkAudioState(address, state) => {
                    if let Some(cb) = self.sink.lock().unwrap().as_mut() {
                        cb.audio_state(address, state);
                    }
                }
                CallbackMessage::SinkAudioConfig(address, sample_rate, channel_count) => {
                    if let Some(cb) = self.sink.lock().unwrap().as_mut() {
                        cb.audio_config(address, sample_rate, channel_count);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2dp::A2dpCodecConfig;
    use crate::Stack;

    struct RecordingSourceCallbacks {
        states: Arc<Mutex<Vec<(Address, BtavConnectionState)>>>,
        prefer_mandatory: bool,
    }

    impl IAvSourceCallbacks for RecordingSourceCallbacks {
        fn connection_state(&mut self, address: Address, state: BtavConnectionState) {
            self.states.lock().unwrap().push((address, state));
        }

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
            self.prefer_mandatory
        }
    }

    fn address() -> Address {
        Address::from_string(String::from("AA:BB:CC:DD:EE:01")).unwrap()
    }

    #[test]
    fn notifications_are_delivered_in_order() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let (tx, _rx) = Stack::create_channel();
            let (cb_tx, cb_rx) = Stack::create_callback_channel();
            let states = Arc::new(Mutex::new(Vec::new()));
            let source: SharedSourceCallbacks = Arc::new(Mutex::new(Some(Box::new(
                RecordingSourceCallbacks { states: states.clone(), prefer_mandatory: false },
            ))));
            let dispatcher = CallbackDispatcher::new(source, Arc::new(Mutex::new(None)), tx);

            cb_tx
                .send(CallbackMessage::SourceConnectionState(
                    address(),
                    BtavConnectionState::Connecting,
                ))
                .unwrap();
            cb_tx
                .send(CallbackMessage::SourceConnectionState(
                    address(),
                    BtavConnectionState::Connected,
                ))
                .unwrap();
            drop(cb_tx);
            dispatcher.dispatch(cb_rx).await;

            assert_eq!(
                *states.lock().unwrap(),
                vec![
                    (address(), BtavConnectionState::Connecting),
                    (address(), BtavConnectionState::Connected)
                ]
            );
        });
    }

    #[test]
    fn mandatory_codec_answer_posts_back_only_when_preferred() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            for prefer_mandatory in [true, false] {
                let (tx, mut rx) = Stack::create_channel();
                let (cb_tx, cb_rx) = Stack::create_callback_channel();
                let source: SharedSourceCallbacks = Arc::new(Mutex::new(Some(Box::new(
                    RecordingSourceCallbacks {
                        states: Arc::new(Mutex::new(Vec::new())),
                        prefer_mandatory,
                    },
                ))));
                let dispatcher = CallbackDispatcher::new(source, Arc::new(Mutex::new(None)), tx);

                cb_tx.send(CallbackMessage::QueryMandatoryCodec(address())).unwrap();
                drop(cb_tx);
                dispatcher.dispatch(cb_rx).await;

                if prefer_mandatory {
                    match rx.try_recv() {
                        Ok(Message::SetMandatoryCodecPreferred { address: a, preferred }) => {
                            assert_eq!(a, address());
                            assert!(preferred);
                        }
                        other => panic!("unexpected message: {:?}", other),
                    }
                } else {
                    assert!(rx.try_recv().is_err());
                }
            }
        });
    }
}
