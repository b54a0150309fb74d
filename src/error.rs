//! Error taxonomy for transfer sessions

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed header, out-of-order packet, or an unexpected flag
    /// combination.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A filesystem or stream operation failed at the OS level.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The stream ended before the announced payload was fully read.
    #[error("stream ended before the announced payload was read")]
    TruncatedPacket,

    /// Nothing to read yet on a non-blocking stream; retry the same step.
    /// Never surfaced past the codec's callers.
    #[error("no packet available yet")]
    NoPacket,

    /// The peer sent ABORT_TRANSFER.
    #[error("peer aborted the transfer")]
    PeerAborted,

    /// This side originated the abort.
    #[error("transfer aborted locally")]
    LocalAbort,
}

impl TransferError {
    /// Stable kind tag for the reporting sink.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Protocol(_) => "protocol",
            TransferError::Io(_) => "io",
            TransferError::TruncatedPacket => "truncated",
            TransferError::NoPacket => "no-packet",
            TransferError::PeerAborted => "peer-abort",
            TransferError::LocalAbort => "local-abort",
        }
    }
}
