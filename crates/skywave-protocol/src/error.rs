use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {got}")]
    FrameTooShort { expected: usize, got: usize },

    #[error("unknown control message tag: {0}")]
    UnknownMessageTag(u16),

    #[error("unknown voice packet type: {0}")]
    UnknownVoiceType(u8),

    #[error("control message too large: {0} bytes (max {max})", max = crate::codec::MAX_CONTROL_MSG_SIZE)]
    MessageTooLarge(usize),

    #[error("voice packet too large: {0} bytes (max {max})", max = crate::voice::MAX_VOICE_PACKET_SIZE)]
    VoicePacketTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
