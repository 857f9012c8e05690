//! Message Schema
//!
//! The closed set of payloads exchanged over a control connection. Every
//! variant is a plain value; field order is the positional tag order on the
//! wire, so reordering fields is a protocol break.
//!
//! Responses never report failure as a transport fault. They carry
//! `is_error` plus a human-readable `error_msg` instead, and the requesting
//! handler treats that as a normal terminal outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of value stored under a registry key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum RegistryValueKind {
    #[default]
    Unknown,
    None,
    String,
    ExpandString,
    Binary,
    DWord,
    MultiString,
    QWord,
}

impl fmt::Display for RegistryValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistryValueKind::Unknown => "REG_UNKNOWN",
            RegistryValueKind::None => "REG_NONE",
            RegistryValueKind::String => "REG_SZ",
            RegistryValueKind::ExpandString => "REG_EXPAND_SZ",
            RegistryValueKind::Binary => "REG_BINARY",
            RegistryValueKind::DWord => "REG_DWORD",
            RegistryValueKind::MultiString => "REG_MULTI_SZ",
            RegistryValueKind::QWord => "REG_QWORD",
        };
        f.write_str(name)
    }
}

/// A registry value as reported back by the endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegistryValue {
    pub name: String,
    pub kind: RegistryValueKind,
    pub data: Vec<u8>,
}

/// One log file inside a retrieved log bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Audio input device advertised by the endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioDevice {
    pub index: u32,
    pub name: String,
}

/// Every payload that can travel over a control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    // === Registry editor ===
    CreateRegistryKey {
        parent_path: String,
    },
    CreateRegistryKeyResponse {
        parent_path: String,
        key_name: String,
        is_error: bool,
        error_msg: String,
    },
    DeleteRegistryKey {
        parent_path: String,
        key_name: String,
    },
    DeleteRegistryKeyResponse {
        parent_path: String,
        key_name: String,
        is_error: bool,
        error_msg: String,
    },
    CreateRegistryValue {
        key_path: String,
        kind: RegistryValueKind,
    },
    CreateRegistryValueResponse {
        key_path: String,
        value: RegistryValue,
        is_error: bool,
        error_msg: String,
    },
    DeleteRegistryValue {
        key_path: String,
        value_name: String,
    },
    DeleteRegistryValueResponse {
        key_path: String,
        value_name: String,
        is_error: bool,
        error_msg: String,
    },

    // === Log retrieval ===
    GetLogs {
        request_id: u64,
    },
    GetLogsResponse {
        request_id: u64,
        files: Vec<LogFile>,
        is_error: bool,
        error_msg: String,
    },

    // === Audio capture ===
    GetAudioDevices,
    GetAudioDevicesResponse {
        devices: Vec<AudioDevice>,
        is_error: bool,
        error_msg: String,
    },
    StartAudioStream {
        device_index: u32,
        bitrate: u32,
    },
    StopAudioStream {
        device_index: u32,
    },
    /// Unsolicited push while a stream is running
    AudioFrame {
        device_index: u32,
        data: Vec<u8>,
    },
}

/// Field-less discriminant of [`Message`], used as the dispatch key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CreateRegistryKey,
    CreateRegistryKeyResponse,
    DeleteRegistryKey,
    DeleteRegistryKeyResponse,
    CreateRegistryValue,
    CreateRegistryValueResponse,
    DeleteRegistryValue,
    DeleteRegistryValueResponse,
    GetLogs,
    GetLogsResponse,
    GetAudioDevices,
    GetAudioDevicesResponse,
    StartAudioStream,
    StopAudioStream,
    AudioFrame,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors raised while turning messages into frames and back
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode {kind} message: {source}")]
    Encode {
        kind: MessageKind,
        #[source]
        source: bincode::Error,
    },

    #[error("Failed to decode message frame: {0}")]
    Decode(#[source] bincode::Error),
}

impl Message {
    /// Get the dispatch key for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::CreateRegistryKey { .. } => MessageKind::CreateRegistryKey,
            Message::CreateRegistryKeyResponse { .. } => MessageKind::CreateRegistryKeyResponse,
            Message::DeleteRegistryKey { .. } => MessageKind::DeleteRegistryKey,
            Message::DeleteRegistryKeyResponse { .. } => MessageKind::DeleteRegistryKeyResponse,
            Message::CreateRegistryValue { .. } => MessageKind::CreateRegistryValue,
            Message::CreateRegistryValueResponse { .. } => MessageKind::CreateRegistryValueResponse,
            Message::DeleteRegistryValue { .. } => MessageKind::DeleteRegistryValue,
            Message::DeleteRegistryValueResponse { .. } => MessageKind::DeleteRegistryValueResponse,
            Message::GetLogs { .. } => MessageKind::GetLogs,
            Message::GetLogsResponse { .. } => MessageKind::GetLogsResponse,
            Message::GetAudioDevices => MessageKind::GetAudioDevices,
            Message::GetAudioDevicesResponse { .. } => MessageKind::GetAudioDevicesResponse,
            Message::StartAudioStream { .. } => MessageKind::StartAudioStream,
            Message::StopAudioStream { .. } => MessageKind::StopAudioStream,
            Message::AudioFrame { .. } => MessageKind::AudioFrame,
        }
    }

    /// Terminal outcome of a response message.
    ///
    /// Returns `None` for requests and pushes, `Some(Ok(()))` for a
    /// successful response and `Some(Err(msg))` when the endpoint reported
    /// an error.
    pub fn outcome(&self) -> Option<Result<(), &str>> {
        let (is_error, error_msg) = match self {
            Message::CreateRegistryKeyResponse { is_error, error_msg, .. }
            | Message::DeleteRegistryKeyResponse { is_error, error_msg, .. }
            | Message::CreateRegistryValueResponse { is_error, error_msg, .. }
            | Message::DeleteRegistryValueResponse { is_error, error_msg, .. }
            | Message::GetLogsResponse { is_error, error_msg, .. }
            | Message::GetAudioDevicesResponse { is_error, error_msg, .. } => {
                (*is_error, error_msg.as_str())
            }
            _ => return None,
        };

        Some(if is_error { Err(error_msg) } else { Ok(()) })
    }

    /// Encode into a single wire frame
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|source| CodecError::Encode {
            kind: self.kind(),
            source,
        })
    }

    /// Decode a single wire frame
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(frame).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let msg = Message::DeleteRegistryKeyResponse {
            parent_path: "HKCU\\Software".to_string(),
            key_name: "Sub".to_string(),
            is_error: false,
            error_msg: String::new(),
        };
        assert_eq!(msg.kind(), MessageKind::DeleteRegistryKeyResponse);
        assert_eq!(Message::GetAudioDevices.kind(), MessageKind::GetAudioDevices);
    }

    #[test]
    fn test_outcome() {
        let ok = Message::GetLogsResponse {
            request_id: 1,
            files: vec![],
            is_error: false,
            error_msg: String::new(),
        };
        assert_eq!(ok.outcome(), Some(Ok(())));

        let failed = Message::DeleteRegistryValueResponse {
            key_path: "HKLM\\Software".to_string(),
            value_name: "Run".to_string(),
            is_error: true,
            error_msg: "Access denied".to_string(),
        };
        assert_eq!(failed.outcome(), Some(Err("Access denied")));

        assert_eq!(Message::GetLogs { request_id: 3 }.outcome(), None);
        assert_eq!(
            Message::AudioFrame {
                device_index: 0,
                data: vec![1, 2]
            }
            .outcome(),
            None
        );
    }

    #[test]
    fn test_frame_is_stable_across_reencode() {
        let msg = Message::CreateRegistryValueResponse {
            key_path: "HKCU\\Software\\X".to_string(),
            value: RegistryValue {
                name: "New Value #1".to_string(),
                kind: RegistryValueKind::DWord,
                data: vec![0, 0, 0, 0],
            },
            is_error: false,
            error_msg: String::new(),
        };

        let frame = msg.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode().unwrap(), frame);
    }

    #[test]
    fn test_field_order_is_positional() {
        let frame = Message::CreateRegistryValue {
            key_path: "K".to_string(),
            kind: RegistryValueKind::String,
        }
        .encode()
        .unwrap();

        // variant tag (u32), string length (u64), "K", kind tag (u32)
        assert_eq!(frame.len(), 4 + 8 + 1 + 4);
        assert_eq!(&frame[0..4], &4u32.to_le_bytes());
        assert_eq!(frame[12], b'K');
        assert_eq!(&frame[13..17], &2u32.to_le_bytes());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = Message::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_registry_value_kind_display() {
        assert_eq!(RegistryValueKind::String.to_string(), "REG_SZ");
        assert_eq!(RegistryValueKind::QWord.to_string(), "REG_QWORD");
    }
}
