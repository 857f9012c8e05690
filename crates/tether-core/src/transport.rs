//! Transport seam for control connections
//!
//! The core never frames bytes itself. A transport accepts whole encoded
//! frames and delivers whole frames back, in order.

use std::fmt;
use tokio::sync::mpsc;

/// Kind of transport backing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// In-process channel pair (tests, simulated endpoints)
    Channel,
    /// Externally provided transport (TCP, TLS, ...)
    External,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Channel => write!(f, "channel"),
            TransportType::External => write!(f, "external"),
        }
    }
}

/// Outbound half of a transport
///
/// `send` must not block; implementations queue the frame for transmission.
pub trait Transport: Send + Sync {
    /// Queue one encoded frame for transmission
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Kind of this transport
    fn transport_type(&self) -> TransportType {
        TransportType::External
    }
}

/// Errors that can occur with transports
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection is not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<TransportError> for String {
    fn from(err: TransportError) -> String {
        err.to_string()
    }
}

/// Receiving half of a transport: whole frames in wire order
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Transport backed by an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Channel
    }
}

/// One side of an in-process link
pub struct ChannelEnd {
    pub transport: ChannelTransport,
    pub inbound: FrameReceiver,
}

/// Create a connected pair of channel ends.
///
/// Frames sent on one end's transport arrive on the other end's `inbound`.
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        ChannelEnd {
            transport: ChannelTransport::new(b_tx),
            inbound: a_rx,
        },
        ChannelEnd {
            transport: ChannelTransport::new(a_tx),
            inbound: b_rx,
        },
    )
}
