use crate::error::ProtocolError;
use crate::types::{SequenceNumber, SessionId};

/// Maximum decrypted voice packet size: 2 KiB.
pub const MAX_VOICE_PACKET_SIZE: usize = 2048;

/// Target value for normal speech (route to the speaker's current channel).
pub const TARGET_CHANNEL: u8 = 0;
/// Highest whisper slot id.
pub const TARGET_WHISPER_MAX: u8 = 30;
/// Target value for server loopback (echo back to the speaker).
pub const TARGET_LOOPBACK: u8 = 31;

/// Voice packet types carried in the low 3 bits of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceType {
    /// Legacy CELT-encoded voice.
    VoiceData = 0,
    /// Transport ping; payload is an 8-byte timestamp.
    Ping = 1,
    /// Opus-encoded voice.
    VoiceOpus = 4,
}

impl VoiceType {
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(VoiceType::VoiceData),
            1 => Ok(VoiceType::Ping),
            4 => Ok(VoiceType::VoiceOpus),
            other => Err(ProtocolError::UnknownVoiceType(other)),
        }
    }
}

/// A voice packet as received from a client.
///
/// Wire format after decryption:
/// ```text
/// [first: u8 = ttttt fff] [sequence: u32 BE] [frame bytes]
/// ```
/// where `ttttt` is the 5-bit target (0 = current channel, 1..30 = whisper
/// slot, 31 = loopback) and `fff` is the 3-bit type. Ping packets carry an
/// 8-byte big-endian timestamp instead of sequence + frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub voice_type: VoiceType,
    pub target: u8,
    pub sequence: SequenceNumber,
    pub frame: Vec<u8>,
}

impl VoicePacket {
    pub fn new(voice_type: VoiceType, target: u8, sequence: SequenceNumber, frame: Vec<u8>) -> Self {
        Self {
            voice_type,
            target: target & 0x1F,
            sequence,
            frame,
        }
    }

    fn first_byte(&self) -> u8 {
        (self.target << 3) | (self.voice_type as u8)
    }

    /// Serialize for transmission (client side and loopback).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.frame.len());
        buf.push(self.first_byte());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.frame);
        buf
    }

    /// Parse a decrypted client packet.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_VOICE_PACKET_SIZE {
            return Err(ProtocolError::VoicePacketTooLarge(data.len()));
        }
        if data.is_empty() {
            return Err(ProtocolError::FrameTooShort {
                expected: 1,
                got: 0,
            });
        }

        let voice_type = VoiceType::from_bits(data[0] & 0x07)?;
        let target = data[0] >> 3;

        if voice_type == VoiceType::Ping {
            // Timestamp is opaque to the server; keep it in `frame` for echo.
            return Ok(Self {
                voice_type,
                target,
                sequence: 0,
                frame: data[1..].to_vec(),
            });
        }

        if data.len() < 5 {
            return Err(ProtocolError::FrameTooShort {
                expected: 5,
                got: data.len(),
            });
        }

        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self {
            voice_type,
            target,
            sequence,
            frame: data[5..].to_vec(),
        })
    }
}

/// Packet-level effects attached to a forwarded voice frame.
///
/// The server never decodes audio; degradation rides alongside the encoded
/// frame so receivers can drive their delay line and noise mixer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketEffects {
    /// Linear playback gain (listener-binding volume adjustment).
    pub gain: f32,
    /// Jitter scale in [0, 1] for the receiver's delay line.
    pub jitter: f32,
    /// Additive-noise scale in [0, 1].
    pub noise: f32,
}

impl PacketEffects {
    pub const IDENTITY: PacketEffects = PacketEffects {
        gain: 1.0,
        jitter: 0.0,
        noise: 0.0,
    };
}

/// A voice packet as forwarded to a receiver.
///
/// Wire format before encryption:
/// ```text
/// [first: u8] [speaker: u32 BE] [sequence: u32 BE]
/// [gain: f32 BE] [jitter: f32 BE] [noise: f32 BE] [frame bytes]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundVoice {
    pub voice_type: VoiceType,
    pub target: u8,
    pub speaker: SessionId,
    pub sequence: SequenceNumber,
    pub effects: PacketEffects,
    pub frame: Vec<u8>,
}

/// Outbound header: 1 + 4 + 4 + 3 * 4 bytes.
pub const OUTBOUND_HEADER_SIZE: usize = 21;

impl OutboundVoice {
    pub fn new(speaker: SessionId, packet: &VoicePacket, effects: PacketEffects) -> Self {
        Self {
            voice_type: packet.voice_type,
            target: packet.target,
            speaker,
            sequence: packet.sequence,
            effects,
            frame: packet.frame.clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OUTBOUND_HEADER_SIZE + self.frame.len());
        buf.push((self.target << 3) | (self.voice_type as u8));
        buf.extend_from_slice(&self.speaker.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.effects.gain.to_be_bytes());
        buf.extend_from_slice(&self.effects.jitter.to_be_bytes());
        buf.extend_from_slice(&self.effects.noise.to_be_bytes());
        buf.extend_from_slice(&self.frame);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < OUTBOUND_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                expected: OUTBOUND_HEADER_SIZE,
                got: data.len(),
            });
        }
        let voice_type = VoiceType::from_bits(data[0] & 0x07)?;
        let target = data[0] >> 3;
        let speaker = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let sequence = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let gain = f32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let jitter = f32::from_be_bytes([data[13], data[14], data[15], data[16]]);
        let noise = f32::from_be_bytes([data[17], data[18], data[19], data[20]]);
        Ok(Self {
            voice_type,
            target,
            speaker,
            sequence,
            effects: PacketEffects {
                gain,
                jitter,
                noise,
            },
            frame: data[OUTBOUND_HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_opus_packet() {
        let original = VoicePacket::new(VoiceType::VoiceOpus, 0, 100, vec![1, 2, 3, 4, 5]);
        let decoded = VoicePacket::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn first_byte_layout() {
        // Target 5 in the high five bits, Opus (4) in the low three.
        let packet = VoicePacket::new(VoiceType::VoiceOpus, 5, 0, vec![]);
        assert_eq!(packet.to_bytes()[0], (5 << 3) | 4);
    }

    #[test]
    fn target_masked_to_five_bits() {
        let packet = VoicePacket::new(VoiceType::VoiceOpus, 0xFF, 0, vec![]);
        assert_eq!(packet.target, 31);
    }

    #[test]
    fn whisper_and_loopback_targets() {
        let whisper = VoicePacket::new(VoiceType::VoiceOpus, 12, 7, vec![0xAB]);
        let decoded = VoicePacket::from_bytes(&whisper.to_bytes()).unwrap();
        assert_eq!(decoded.target, 12);

        let loopback = VoicePacket::new(VoiceType::VoiceOpus, TARGET_LOOPBACK, 8, vec![]);
        let decoded = VoicePacket::from_bytes(&loopback.to_bytes()).unwrap();
        assert_eq!(decoded.target, TARGET_LOOPBACK);
    }

    #[test]
    fn ping_keeps_timestamp_payload() {
        let mut data = vec![0x01u8];
        data.extend_from_slice(&0xDEAD_BEEF_0000_0001u64.to_be_bytes());
        let packet = VoicePacket::from_bytes(&data).unwrap();
        assert_eq!(packet.voice_type, VoiceType::Ping);
        assert_eq!(packet.frame.len(), 8);
    }

    #[test]
    fn unknown_type_discarded() {
        for bits in [2u8, 3, 5, 6, 7] {
            let data = [bits, 0, 0, 0, 1, 0xAA];
            assert!(matches!(
                VoicePacket::from_bytes(&data),
                Err(ProtocolError::UnknownVoiceType(_))
            ));
        }
    }

    #[test]
    fn truncated_voice_rejected() {
        let data = [0x04u8, 0, 0];
        assert!(VoicePacket::from_bytes(&data).is_err());
    }

    #[test]
    fn oversized_packet_rejected() {
        let data = vec![0x04u8; MAX_VOICE_PACKET_SIZE + 1];
        assert!(matches!(
            VoicePacket::from_bytes(&data),
            Err(ProtocolError::VoicePacketTooLarge(_))
        ));
    }

    #[test]
    fn outbound_roundtrip_with_effects() {
        let inbound = VoicePacket::new(VoiceType::VoiceOpus, 0, 55, vec![9, 9, 9]);
        let effects = PacketEffects {
            gain: 0.5,
            jitter: 0.25,
            noise: 0.75,
        };
        let outbound = OutboundVoice::new(42, &inbound, effects);
        let decoded = OutboundVoice::from_bytes(&outbound.to_bytes()).unwrap();
        assert_eq!(decoded.speaker, 42);
        assert_eq!(decoded.sequence, 55);
        assert_eq!(decoded.effects, effects);
        assert_eq!(decoded.frame, vec![9, 9, 9]);
    }

    #[test]
    fn outbound_identity_effects() {
        let inbound = VoicePacket::new(VoiceType::VoiceData, 0, 1, vec![1]);
        let outbound = OutboundVoice::new(1, &inbound, PacketEffects::IDENTITY);
        let decoded = OutboundVoice::from_bytes(&outbound.to_bytes()).unwrap();
        assert_eq!(decoded.effects.gain, 1.0);
        assert_eq!(decoded.effects.jitter, 0.0);
        assert_eq!(decoded.effects.noise, 0.0);
    }
}
