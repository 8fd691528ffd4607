//! Decoder errors.

/// Errors thrown by the decoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecoderError {
    /// The packet violates the framing rules of RFC 6716 section 3.
    InvalidPacket,
    /// The given PCM buffer is too small to hold the decoded frame.
    BufferTooSmall,
    /// Bad arguments.
    BadArguments(&'static str),
    /// The decoder is not in a state in which the call makes sense.
    InvalidState(&'static str),
    /// An internal decoder error.
    InternalError(&'static str),
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderError::InvalidPacket => {
                write!(f, "invalid packet")
            }
            DecoderError::BufferTooSmall => {
                write!(f, "output buffer is too small")
            }
            DecoderError::BadArguments(message) => {
                write!(f, "{}", message)
            }
            DecoderError::InvalidState(message) => {
                write!(f, "{}", message)
            }
            DecoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for DecoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
