//! Simulated remote endpoint
//!
//! Answers console requests from an in-memory registry, log bundle and
//! device list, and pushes audio frames while a stream is running.

use std::collections::BTreeSet;
use std::time::Duration;
use tether_core::messages::{AudioDevice, LogFile, Message, RegistryValue, RegistryValueKind};
use tether_core::transport::{ChannelEnd, Transport};
use tokio::task::JoinHandle;

/// Interval between pushed audio frames
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Frames per second implied by `FRAME_INTERVAL`
const FRAMES_PER_SECOND: u32 = 50;

pub struct SimulatedEndpoint {
    keys: BTreeSet<String>,
    values: BTreeSet<(String, String)>,
    devices: Vec<AudioDevice>,
    logs: Vec<LogFile>,
    /// (device_index, bitrate) of the running stream
    streaming: Option<(u32, u32)>,
    frame_counter: u64,
}

impl SimulatedEndpoint {
    pub fn new(display_name: &str) -> Self {
        let keys = [
            "HKCU",
            "HKCU\\Software",
            "HKCU\\Software\\X",
            "HKCU\\Software\\X\\Sub",
            "HKLM",
            "HKLM\\Software",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let values = [("HKCU\\Software\\X", "Setting")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            keys,
            values,
            devices: vec![
                AudioDevice {
                    index: 0,
                    name: "Microphone (Simulated)".to_string(),
                },
                AudioDevice {
                    index: 1,
                    name: "Line In (Simulated)".to_string(),
                },
            ],
            logs: vec![
                LogFile {
                    name: "client.log".to_string(),
                    contents: format!("{display_name}: client started\n").into_bytes(),
                },
                LogFile {
                    name: "keylog-2026-10-18.log".to_string(),
                    contents: b"[12:00:01] <Enter>\n".to_vec(),
                },
            ],
            streaming: None,
            frame_counter: 0,
        }
    }

    /// Answer one request. Pushes and fire-and-forget requests yield `None`.
    pub fn respond(&mut self, request: Message) -> Option<Message> {
        match request {
            Message::CreateRegistryKey { parent_path } => Some(self.create_key(parent_path)),
            Message::DeleteRegistryKey {
                parent_path,
                key_name,
            } => Some(self.delete_key(parent_path, key_name)),
            Message::CreateRegistryValue { key_path, kind } => {
                Some(self.create_value(key_path, kind))
            }
            Message::DeleteRegistryValue {
                key_path,
                value_name,
            } => Some(self.delete_value(key_path, value_name)),
            Message::GetLogs { request_id } => Some(Message::GetLogsResponse {
                request_id,
                files: self.logs.clone(),
                is_error: false,
                error_msg: String::new(),
            }),
            Message::GetAudioDevices => Some(Message::GetAudioDevicesResponse {
                devices: self.devices.clone(),
                is_error: false,
                error_msg: String::new(),
            }),
            Message::StartAudioStream {
                device_index,
                bitrate,
            } => {
                if self.devices.iter().any(|d| d.index == device_index) {
                    self.streaming = Some((device_index, bitrate));
                } else {
                    tracing::warn!("Simulated endpoint has no device {}", device_index);
                }
                None
            }
            Message::StopAudioStream { .. } => {
                self.streaming = None;
                None
            }
            other => {
                tracing::warn!("Simulated endpoint ignoring {}", other.kind());
                None
            }
        }
    }

    fn create_key(&mut self, parent_path: String) -> Message {
        if !self.keys.contains(&parent_path) {
            return Message::CreateRegistryKeyResponse {
                parent_path,
                key_name: String::new(),
                is_error: true,
                error_msg: "Cannot create key: The parent key does not exist.".to_string(),
            };
        }

        let key_name = (1..)
            .map(|n| format!("New Key #{n}"))
            .find(|name| !self.keys.contains(&format!("{parent_path}\\{name}")))
            .unwrap_or_default();
        self.keys.insert(format!("{parent_path}\\{key_name}"));

        Message::CreateRegistryKeyResponse {
            parent_path,
            key_name,
            is_error: false,
            error_msg: String::new(),
        }
    }

    fn delete_key(&mut self, parent_path: String, key_name: String) -> Message {
        let full = format!("{parent_path}\\{key_name}");
        let (is_error, error_msg) = if self.keys.contains(&full) {
            let prefix = format!("{full}\\");
            self.keys
                .retain(|key| key != &full && !key.starts_with(&prefix));
            self.values
                .retain(|(key, _)| key != &full && !key.starts_with(&prefix));
            (false, String::new())
        } else {
            (
                true,
                "Cannot delete key: The system cannot find the file specified.".to_string(),
            )
        };

        Message::DeleteRegistryKeyResponse {
            parent_path,
            key_name,
            is_error,
            error_msg,
        }
    }

    fn create_value(&mut self, key_path: String, kind: RegistryValueKind) -> Message {
        if !self.keys.contains(&key_path) {
            return Message::CreateRegistryValueResponse {
                key_path,
                value: RegistryValue::default(),
                is_error: true,
                error_msg: "Cannot create value: The key does not exist.".to_string(),
            };
        }

        let name = (1..)
            .map(|n| format!("New Value #{n}"))
            .find(|name| !self.values.contains(&(key_path.clone(), name.clone())))
            .unwrap_or_default();
        self.values.insert((key_path.clone(), name.clone()));

        let data = match kind {
            RegistryValueKind::DWord => vec![0; 4],
            RegistryValueKind::QWord => vec![0; 8],
            _ => Vec::new(),
        };

        Message::CreateRegistryValueResponse {
            key_path,
            value: RegistryValue { name, kind, data },
            is_error: false,
            error_msg: String::new(),
        }
    }

    fn delete_value(&mut self, key_path: String, value_name: String) -> Message {
        let removed = self.values.remove(&(key_path.clone(), value_name.clone()));
        Message::DeleteRegistryValueResponse {
            key_path,
            value_name,
            is_error: !removed,
            error_msg: if removed {
                String::new()
            } else {
                "Cannot delete value: The value does not exist.".to_string()
            },
        }
    }

    /// Next audio frame for the running stream, if any
    fn next_frame(&mut self) -> Option<Message> {
        let (device_index, bitrate) = self.streaming?;
        self.frame_counter += 1;

        let len = (bitrate / FRAMES_PER_SECOND).max(1) as usize;
        let phase = self.frame_counter as usize;
        let data = (0..len).map(|i| ((i + phase) % 256) as u8).collect();

        Some(Message::AudioFrame { device_index, data })
    }

    /// Serve requests arriving on `end` until the console side closes
    pub fn spawn(self, end: ChannelEnd) -> JoinHandle<()> {
        let mut endpoint = self;
        let ChannelEnd {
            transport,
            mut inbound,
        } = end;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);

            loop {
                let outgoing = tokio::select! {
                    frame = inbound.recv() => {
                        let Some(frame) = frame else {
                            tracing::debug!("Console closed the channel");
                            break;
                        };
                        match Message::decode(&frame) {
                            Ok(request) => endpoint.respond(request),
                            Err(e) => {
                                tracing::warn!("Simulated endpoint got an undecodable frame: {}", e);
                                None
                            }
                        }
                    }
                    _ = ticker.tick(), if endpoint.streaming.is_some() => endpoint.next_frame(),
                };

                let Some(message) = outgoing else {
                    continue;
                };
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("Failed to encode {}: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = transport.send(frame) {
                    tracing::info!("Simulated endpoint stopping: {}", e);
                    break;
                }
            }
        })
    }
}
