//! Live audio capture
//!
//! Streaming feature: `Idle -> Streaming -> Idle`. While streaming, the
//! bitrate can change without leaving the state. Frames pushed by the
//! endpoint are forwarded only while a stream on that device is running.

use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{FeatureError, FeatureHandler, FeatureKind};
use crate::connection::{Connection, ConnectionEvent};
use crate::dispatch::MessageHandler;
use crate::events::{EndReason, FeatureEvent, Notifier};
use crate::messages::{AudioDevice, Message, MessageKind};
use crate::sync::lock;

/// Sample rates the endpoint can capture at
pub const SUPPORTED_BITRATES: [u32; 12] = [
    1000, 2000, 4000, 8000, 11025, 22050, 32000, 44100, 48000, 64000, 88200, 96000,
];

/// Rate considered the best quality/bandwidth trade-off
pub const BEST_BITRATE: u32 = 44100;

/// Quality label shown next to a bitrate
pub fn quality_label(bitrate: u32) -> &'static str {
    match bitrate {
        b if b < BEST_BITRATE => "low",
        BEST_BITRATE => "best",
        _ => "high",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamParams {
    pub device_index: u32,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Streaming(StreamParams),
}

#[derive(Debug)]
struct AudioState {
    stream: StreamState,
    /// Bitrate used for the next stream start
    bitrate: u32,
    devices: Vec<AudioDevice>,
}

pub struct AudioCaptureHandler {
    connection: Connection,
    notifier: Notifier,
    state: Mutex<AudioState>,
}

impl AudioCaptureHandler {
    pub(crate) fn new(connection: Connection, notifier: Notifier, bitrate: u32) -> Self {
        let bitrate = if SUPPORTED_BITRATES.contains(&bitrate) {
            bitrate
        } else {
            warn!("Configured bitrate {} unsupported, using {}", bitrate, BEST_BITRATE);
            BEST_BITRATE
        };

        Self {
            connection,
            notifier,
            state: Mutex::new(AudioState {
                stream: StreamState::Idle,
                bitrate,
                devices: Vec::new(),
            }),
        }
    }

    pub fn stream_state(&self) -> StreamState {
        lock(&self.state).stream
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.stream_state(), StreamState::Streaming(_))
    }

    pub fn bitrate(&self) -> u32 {
        lock(&self.state).bitrate
    }

    /// Devices from the most recent device list
    pub fn devices(&self) -> Vec<AudioDevice> {
        lock(&self.state).devices.clone()
    }

    /// Ask the endpoint for its capture devices
    pub fn refresh_devices(&self) -> Result<(), FeatureError> {
        self.connection.send(&Message::GetAudioDevices)?;
        Ok(())
    }

    /// Change the capture bitrate.
    ///
    /// While streaming the stream stays up and the endpoint is told the new
    /// rate.
    pub fn set_bitrate(&self, bitrate: u32) -> Result<(), FeatureError> {
        if !SUPPORTED_BITRATES.contains(&bitrate) {
            return Err(FeatureError::UnsupportedBitrate(bitrate));
        }

        let mut state = lock(&self.state);
        if let StreamState::Streaming(params) = state.stream {
            if params.bitrate != bitrate {
                self.connection.send(&Message::StartAudioStream {
                    device_index: params.device_index,
                    bitrate,
                })?;
                state.stream = StreamState::Streaming(StreamParams { bitrate, ..params });
                self.notifier.notify(FeatureEvent::StreamBitrateChanged {
                    device_index: params.device_index,
                    bitrate,
                });
            }
        }
        state.bitrate = bitrate;
        Ok(())
    }

    /// Start streaming from `device_index` at the current bitrate.
    ///
    /// Already streaming: no-op that returns the running parameters.
    pub fn start_stream(&self, device_index: u32) -> Result<StreamParams, FeatureError> {
        let mut state = lock(&self.state);

        if let StreamState::Streaming(params) = state.stream {
            debug!(
                "Start requested for device {} while streaming {:?}, keeping current stream",
                device_index, params
            );
            return Ok(params);
        }

        if !state.devices.is_empty() && !state.devices.iter().any(|d| d.index == device_index) {
            return Err(FeatureError::UnknownDevice(device_index));
        }

        let params = StreamParams {
            device_index,
            bitrate: state.bitrate,
        };
        self.connection.send(&Message::StartAudioStream {
            device_index,
            bitrate: params.bitrate,
        })?;
        state.stream = StreamState::Streaming(params);
        drop(state);

        info!(
            "Audio stream started on device {} at {} ({})",
            device_index,
            params.bitrate,
            quality_label(params.bitrate)
        );
        self.notifier.notify(FeatureEvent::StreamStarted {
            device_index,
            bitrate: params.bitrate,
        });
        Ok(params)
    }

    /// Stop the running stream. Idle: no-op.
    ///
    /// Local interest is always cancelled; failing to tell the endpoint is
    /// only logged. Returns whether a stream was running.
    pub fn stop_stream(&self, device_index: u32) -> bool {
        let params = {
            let mut state = lock(&self.state);
            let StreamState::Streaming(params) = state.stream else {
                return false;
            };
            state.stream = StreamState::Idle;
            params
        };

        if params.device_index != device_index {
            debug!(
                "Stop requested for device {}, stopping running device {}",
                device_index, params.device_index
            );
        }

        if let Err(e) = self.connection.send(&Message::StopAudioStream {
            device_index: params.device_index,
        }) {
            warn!("Could not tell endpoint to stop audio stream: {}", e);
        }

        self.notifier.notify(FeatureEvent::StreamStopped {
            device_index: params.device_index,
        });
        true
    }

    fn on_devices(&self, devices: &[AudioDevice], is_error: bool, error_msg: &str) {
        if is_error {
            self.notifier.notify(FeatureEvent::RequestFailed {
                operation: "list audio devices".to_string(),
                error: error_msg.to_string(),
            });
            return;
        }

        lock(&self.state).devices = devices.to_vec();
        self.notifier.notify(FeatureEvent::AudioDevicesChanged {
            devices: devices.to_vec(),
        });
    }

    fn on_frame(&self, device_index: u32, data: &[u8]) {
        let streaming = matches!(
            lock(&self.state).stream,
            StreamState::Streaming(params) if params.device_index == device_index
        );

        if streaming {
            self.notifier.notify(FeatureEvent::AudioFrame {
                device_index,
                data: data.to_vec(),
            });
        } else {
            debug!("Dropping audio frame for device {} (not streaming)", device_index);
        }
    }
}

impl MessageHandler for AudioCaptureHandler {
    fn name(&self) -> &'static str {
        "audio-capture"
    }

    fn handle(&self, message: &Message) {
        match message {
            Message::GetAudioDevicesResponse {
                devices,
                is_error,
                error_msg,
            } => self.on_devices(devices, *is_error, error_msg),
            Message::AudioFrame { device_index, data } => self.on_frame(*device_index, data),
            other => debug!("Audio capture ignoring {}", other.kind()),
        }
    }
}

impl FeatureHandler for AudioCaptureHandler {
    const FEATURE: FeatureKind = FeatureKind::AudioCapture;

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::GetAudioDevicesResponse, MessageKind::AudioFrame]
    }

    fn connection_changed(&self, event: &ConnectionEvent) {
        if event.is_connected {
            return;
        }

        lock(&self.state).stream = StreamState::Idle;
        self.notifier.notify(FeatureEvent::SessionEnded {
            reason: EndReason::Disconnected,
        });
    }

    fn detaching(&self) {
        if let StreamState::Streaming(params) = self.stream_state() {
            self.stop_stream(params.device_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::events::{notification_channel, NotificationReceiver};
    use crate::transport::{channel_pair, ChannelEnd};

    fn setup() -> (AudioCaptureHandler, Connection, ChannelEnd, NotificationReceiver) {
        let (local, remote) = channel_pair();
        let connection = Connection::new(ConnectionInfo::new("host:1", "host"), local.transport);
        connection.connect();
        let (tx, rx) = notification_channel();
        let notifier = Notifier::new(connection.id(), FeatureKind::AudioCapture, tx);
        let handler = AudioCaptureHandler::new(connection.clone(), notifier, 8000);
        (handler, connection, remote, rx)
    }

    fn sent(remote: &mut ChannelEnd) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = remote.inbound.try_recv() {
            out.push(Message::decode(&frame).unwrap());
        }
        out
    }

    fn events(rx: &mut NotificationReceiver) -> Vec<FeatureEvent> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n.event);
        }
        out
    }

    #[test]
    fn test_start_duplicate_start_and_stop() {
        let (handler, _conn, mut remote, mut rx) = setup();
        handler.set_bitrate(44100).unwrap();

        let params = handler.start_stream(0).unwrap();
        assert_eq!(
            handler.stream_state(),
            StreamState::Streaming(StreamParams {
                device_index: 0,
                bitrate: 44100
            })
        );
        assert_eq!(params.bitrate, 44100);

        let again = handler.start_stream(0).unwrap();
        assert_eq!(again, params);
        assert!(handler.is_streaming());

        assert!(handler.stop_stream(0));
        assert_eq!(handler.stream_state(), StreamState::Idle);
        assert!(!handler.stop_stream(0));

        assert_eq!(
            sent(&mut remote),
            vec![
                Message::StartAudioStream {
                    device_index: 0,
                    bitrate: 44100
                },
                Message::StopAudioStream { device_index: 0 },
            ]
        );
        assert_eq!(
            events(&mut rx),
            vec![
                FeatureEvent::StreamStarted {
                    device_index: 0,
                    bitrate: 44100
                },
                FeatureEvent::StreamStopped { device_index: 0 },
            ]
        );
    }

    #[test]
    fn test_bitrate_changes_while_streaming() {
        let (handler, _conn, mut remote, _rx) = setup();
        handler.start_stream(1).unwrap();
        handler.set_bitrate(22050).unwrap();

        assert_eq!(
            handler.stream_state(),
            StreamState::Streaming(StreamParams {
                device_index: 1,
                bitrate: 22050
            })
        );
        assert_eq!(sent(&mut remote).len(), 2);
    }

    #[test]
    fn test_unsupported_bitrate() {
        let (handler, _conn, _remote, _rx) = setup();
        assert_eq!(
            handler.set_bitrate(12345),
            Err(FeatureError::UnsupportedBitrate(12345))
        );
        assert_eq!(handler.bitrate(), 8000);
    }

    #[test]
    fn test_unknown_device_once_list_is_known() {
        let (handler, _conn, _remote, mut rx) = setup();
        handler.handle(&Message::GetAudioDevicesResponse {
            devices: vec![AudioDevice {
                index: 0,
                name: "Microphone (USB)".to_string(),
            }],
            is_error: false,
            error_msg: String::new(),
        });
        assert_eq!(handler.devices().len(), 1);
        assert!(matches!(
            events(&mut rx)[0],
            FeatureEvent::AudioDevicesChanged { .. }
        ));

        assert_eq!(handler.start_stream(3), Err(FeatureError::UnknownDevice(3)));
        assert_eq!(handler.stream_state(), StreamState::Idle);
    }

    #[test]
    fn test_frames_only_while_streaming() {
        let (handler, _conn, _remote, mut rx) = setup();
        let frame = Message::AudioFrame {
            device_index: 0,
            data: vec![1, 2, 3],
        };

        handler.handle(&frame);
        assert!(events(&mut rx).is_empty());

        handler.start_stream(0).unwrap();
        events(&mut rx);
        handler.handle(&frame);
        handler.handle(&Message::AudioFrame {
            device_index: 5,
            data: vec![9],
        });
        assert_eq!(
            events(&mut rx),
            vec![FeatureEvent::AudioFrame {
                device_index: 0,
                data: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn test_disconnect_stops_stream() {
        let (handler, conn, _remote, mut rx) = setup();
        handler.start_stream(0).unwrap();
        events(&mut rx);

        conn.disconnect();
        handler.connection_changed(&ConnectionEvent {
            connection: conn.id(),
            is_connected: false,
        });

        assert_eq!(handler.stream_state(), StreamState::Idle);
        assert_eq!(
            events(&mut rx),
            vec![FeatureEvent::SessionEnded {
                reason: EndReason::Disconnected
            }]
        );

        // stopping afterwards is a harmless no-op
        assert!(!handler.stop_stream(0));
        assert_eq!(handler.start_stream(0), Err(FeatureError::NotConnected));
    }

    #[test]
    fn test_stop_when_endpoint_unreachable() {
        let (handler, conn, _remote, _rx) = setup();
        handler.start_stream(0).unwrap();
        conn.disconnect();

        assert!(handler.stop_stream(0));
        assert_eq!(handler.stream_state(), StreamState::Idle);
    }

    #[test]
    fn test_device_list_error() {
        let (handler, _conn, _remote, mut rx) = setup();
        handler.handle(&Message::GetAudioDevicesResponse {
            devices: vec![],
            is_error: true,
            error_msg: "No capture devices".to_string(),
        });
        assert_eq!(
            events(&mut rx),
            vec![FeatureEvent::RequestFailed {
                operation: "list audio devices".to_string(),
                error: "No capture devices".to_string(),
            }]
        );
    }

    #[test]
    fn test_quality_label() {
        assert_eq!(quality_label(8000), "low");
        assert_eq!(quality_label(44100), "best");
        assert_eq!(quality_label(96000), "high");
    }
}
