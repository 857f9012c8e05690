/// Seconds to wait for a response before a request times out
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Initial audio capture sample rate (Hz)
pub const DEFAULT_AUDIO_BITRATE: u32 = 44_100;

/// Directory under the data dir where per-client downloads are kept
pub const DEFAULT_DOWNLOAD_SUBDIR: &str = "tether/clients";
