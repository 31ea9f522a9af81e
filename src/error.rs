//! Error taxonomy for the frame bridge.
//!
//! Every failure the bridge can observe maps to one [`ErrorKind`], and every kind has a
//! declared [`Disposition`]. Callers decide what to do with an error by asking for its
//! disposition instead of matching on variants ad hoc.

use thiserror::Error;

use crate::envelope::EnvelopeError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("envelope missing required field '{0}'")]
    MissingField(&'static str),

    #[error("image payload for stream {stream_id} could not be decoded: {reason}")]
    ImagePayloadDecode { stream_id: String, reason: String },

    #[error("broker connection error: {0}")]
    BrokerConnection(String),

    #[error("sink '{sink}' failed on stream {stream_id}: {reason}")]
    SinkProcessing {
        sink: &'static str,
        stream_id: String,
        reason: String,
    },

    #[error("frame capture failed: {0}")]
    FrameCapture(String),

    #[error("frame encode failed: {0}")]
    FrameEncode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedEnvelope,
    MissingField,
    ImagePayloadDecode,
    BrokerConnection,
    SinkProcessing,
    FrameCapture,
    FrameEncode,
    Config,
}

/// What the owning loop does after an error of a given kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Try the same step again on the next paced iteration.
    Retry,
    /// Log, resolve the unit of work, and continue with the next one.
    Skip,
    /// Stop the loop, release resources, and surface the error.
    Fatal,
}

impl ErrorKind {
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorKind::MalformedEnvelope
            | ErrorKind::MissingField
            | ErrorKind::ImagePayloadDecode
            | ErrorKind::SinkProcessing
            | ErrorKind::FrameEncode => Disposition::Skip,
            ErrorKind::FrameCapture => Disposition::Retry,
            ErrorKind::BrokerConnection | ErrorKind::Config => Disposition::Fatal,
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            BridgeError::MissingField(_) => ErrorKind::MissingField,
            BridgeError::ImagePayloadDecode { .. } => ErrorKind::ImagePayloadDecode,
            BridgeError::BrokerConnection(_) => ErrorKind::BrokerConnection,
            BridgeError::SinkProcessing { .. } => ErrorKind::SinkProcessing,
            BridgeError::FrameCapture(_) => ErrorKind::FrameCapture,
            BridgeError::FrameEncode(_) => ErrorKind::FrameEncode,
            BridgeError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.kind().disposition()
    }

    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }
}

impl From<EnvelopeError> for BridgeError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Malformed(reason) => BridgeError::MalformedEnvelope(reason),
            EnvelopeError::MissingField(field) => BridgeError::MissingField(field),
            EnvelopeError::ImagePayload { meta, reason } => BridgeError::ImagePayloadDecode {
                stream_id: meta.stream_id,
                reason,
            },
        }
    }
}
