use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::messages::*;

/// Maximum control message payload: 128 KiB.
pub const MAX_CONTROL_MSG_SIZE: usize = 128 * 1024;

/// Frame header: 2-byte big-endian type tag + 4-byte big-endian length.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Encode a control message into a `[tag u16 BE][len u32 BE][payload]` frame.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    if payload.len() > MAX_CONTROL_MSG_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(msg.kind() as u16).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn encode_payload(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    use ControlMessage::*;
    let bytes = match msg {
        Version(m) => postcard::to_allocvec(m)?,
        UdpTunnel(m) => postcard::to_allocvec(m)?,
        Authenticate(m) => postcard::to_allocvec(m)?,
        Ping(m) => postcard::to_allocvec(m)?,
        Reject(m) => postcard::to_allocvec(m)?,
        ServerSync(m) => postcard::to_allocvec(m)?,
        ChannelRemove(m) => postcard::to_allocvec(m)?,
        ChannelState(m) => postcard::to_allocvec(m)?,
        UserRemove(m) => postcard::to_allocvec(m)?,
        UserState(m) => postcard::to_allocvec(m)?,
        BanList(m) => postcard::to_allocvec(m)?,
        TextMessage(m) => postcard::to_allocvec(m)?,
        PermissionDenied(m) => postcard::to_allocvec(m)?,
        Acl(m) => postcard::to_allocvec(m)?,
        QueryUsers(m) => postcard::to_allocvec(m)?,
        CryptSetup(m) => postcard::to_allocvec(m)?,
        ContextActionModify(m) => postcard::to_allocvec(m)?,
        ContextAction(m) => postcard::to_allocvec(m)?,
        UserList(m) => postcard::to_allocvec(m)?,
        VoiceTarget(m) => postcard::to_allocvec(m)?,
        PermissionQuery(m) => postcard::to_allocvec(m)?,
        CodecVersion(m) => postcard::to_allocvec(m)?,
        UserStats(m) => postcard::to_allocvec(m)?,
        RequestBlob(m) => postcard::to_allocvec(m)?,
        ServerConfig(m) => postcard::to_allocvec(m)?,
        SuggestConfig(m) => postcard::to_allocvec(m)?,
        PluginDataTransmission(m) => postcard::to_allocvec(m)?,
        ChannelListener(m) => postcard::to_allocvec(m)?,
        HfBandSimulationUpdate(m) => postcard::to_allocvec(m)?,
        SignalQualityUpdate(m) => postcard::to_allocvec(m)?,
        PropagationUpdate(m) => postcard::to_allocvec(m)?,
    };
    Ok(bytes)
}

/// Decode a payload for a known message tag.
pub fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<ControlMessage, ProtocolError> {
    let msg = match kind {
        MessageKind::Version => ControlMessage::Version(postcard::from_bytes(payload)?),
        MessageKind::UdpTunnel => ControlMessage::UdpTunnel(postcard::from_bytes(payload)?),
        MessageKind::Authenticate => ControlMessage::Authenticate(postcard::from_bytes(payload)?),
        MessageKind::Ping => ControlMessage::Ping(postcard::from_bytes(payload)?),
        MessageKind::Reject => ControlMessage::Reject(postcard::from_bytes(payload)?),
        MessageKind::ServerSync => ControlMessage::ServerSync(postcard::from_bytes(payload)?),
        MessageKind::ChannelRemove => ControlMessage::ChannelRemove(postcard::from_bytes(payload)?),
        MessageKind::ChannelState => ControlMessage::ChannelState(postcard::from_bytes(payload)?),
        MessageKind::UserRemove => ControlMessage::UserRemove(postcard::from_bytes(payload)?),
        MessageKind::UserState => ControlMessage::UserState(postcard::from_bytes(payload)?),
        MessageKind::BanList => ControlMessage::BanList(postcard::from_bytes(payload)?),
        MessageKind::TextMessage => ControlMessage::TextMessage(postcard::from_bytes(payload)?),
        MessageKind::PermissionDenied => {
            ControlMessage::PermissionDenied(postcard::from_bytes(payload)?)
        }
        MessageKind::Acl => ControlMessage::Acl(postcard::from_bytes(payload)?),
        MessageKind::QueryUsers => ControlMessage::QueryUsers(postcard::from_bytes(payload)?),
        MessageKind::CryptSetup => ControlMessage::CryptSetup(postcard::from_bytes(payload)?),
        MessageKind::ContextActionModify => {
            ControlMessage::ContextActionModify(postcard::from_bytes(payload)?)
        }
        MessageKind::ContextAction => ControlMessage::ContextAction(postcard::from_bytes(payload)?),
        MessageKind::UserList => ControlMessage::UserList(postcard::from_bytes(payload)?),
        MessageKind::VoiceTarget => ControlMessage::VoiceTarget(postcard::from_bytes(payload)?),
        MessageKind::PermissionQuery => {
            ControlMessage::PermissionQuery(postcard::from_bytes(payload)?)
        }
        MessageKind::CodecVersion => ControlMessage::CodecVersion(postcard::from_bytes(payload)?),
        MessageKind::UserStats => ControlMessage::UserStats(postcard::from_bytes(payload)?),
        MessageKind::RequestBlob => ControlMessage::RequestBlob(postcard::from_bytes(payload)?),
        MessageKind::ServerConfig => ControlMessage::ServerConfig(postcard::from_bytes(payload)?),
        MessageKind::SuggestConfig => ControlMessage::SuggestConfig(postcard::from_bytes(payload)?),
        MessageKind::PluginDataTransmission => {
            ControlMessage::PluginDataTransmission(postcard::from_bytes(payload)?)
        }
        MessageKind::ChannelListener => {
            ControlMessage::ChannelListener(postcard::from_bytes(payload)?)
        }
        MessageKind::HfBandSimulationUpdate => {
            ControlMessage::HfBandSimulationUpdate(postcard::from_bytes(payload)?)
        }
        MessageKind::SignalQualityUpdate => {
            ControlMessage::SignalQualityUpdate(postcard::from_bytes(payload)?)
        }
        MessageKind::PropagationUpdate => {
            ControlMessage::PropagationUpdate(postcard::from_bytes(payload)?)
        }
    };
    Ok(msg)
}

/// Attempt to extract one complete frame from a byte buffer.
///
/// Returns `Ok(Some(msg))` if a complete message is available, `Ok(None)` if
/// more data is needed, or `Err` if the frame is malformed (unknown tag or
/// oversized payload). Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<ControlMessage>, ProtocolError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let tag = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;

    if length > MAX_CONTROL_MSG_SIZE {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    let kind = MessageKind::from_tag(tag).ok_or(ProtocolError::UnknownMessageTag(tag))?;

    if buf.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(length);
    decode_payload(kind, &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Band, Permissions, Season};

    #[test]
    fn roundtrip_version() {
        let msg = ControlMessage::Version(Version {
            version: PROTOCOL_VERSION,
            release: "skywave 0.1.0".into(),
            os: "linux".into(),
            os_version: "6.8".into(),
        });
        let encoded = encode_message(&msg).unwrap();
        assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), 0);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = try_decode_frame(&mut buf).unwrap().unwrap();
        match decoded {
            ControlMessage::Version(v) => {
                assert_eq!(v.version, PROTOCOL_VERSION);
                assert_eq!(v.release, "skywave 0.1.0");
            }
            _ => panic!("wrong variant"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_authenticate() {
        let msg = ControlMessage::Authenticate(Authenticate {
            username: "LA1K".into(),
            password: Some("secret".into()),
            tokens: vec!["contest".into()],
            celt_versions: vec![],
            opus: true,
        });
        let encoded = encode_message(&msg).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::Authenticate(a) => {
                assert_eq!(a.username, "LA1K");
                assert_eq!(a.password.as_deref(), Some("secret"));
                assert!(a.opus);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_user_state_with_grid() {
        let msg = ControlMessage::UserState(UserState {
            session_id: Some(7),
            grid_locator: Some("JO59jw".into()),
            preferred_band: Some(Band::Band40m),
            listening_channel_add: vec![3, 4],
            ..Default::default()
        });
        let encoded = encode_message(&msg).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::UserState(u) => {
                assert_eq!(u.session_id, Some(7));
                assert_eq!(u.grid_locator.as_deref(), Some("JO59jw"));
                assert_eq!(u.preferred_band, Some(Band::Band40m));
                assert_eq!(u.listening_channel_add, vec![3, 4]);
                assert!(u.name.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_propagation_update() {
        let msg = ControlMessage::PropagationUpdate(PropagationUpdate {
            solar_flux_index: 150,
            k_index: 2,
            season: Season::Summer,
            muf_reference_mhz: 24.7,
            epoch: 42,
            open_bands: vec![Band::Band20m, Band::Band15m],
        });
        let encoded = encode_message(&msg).unwrap();
        assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), 30);
        let mut buf = BytesMut::from(&encoded[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::PropagationUpdate(p) => {
                assert_eq!(p.solar_flux_index, 150);
                assert_eq!(p.epoch, 42);
                assert_eq!(p.open_bands.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_permission_denied() {
        let msg = ControlMessage::PermissionDenied(PermissionDenied {
            kind: DenyKind::Permission,
            permission: Some(Permissions::SPEAK),
            channel_id: Some(4),
            session_id: None,
            reason: None,
        });
        let encoded = encode_message(&msg).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::PermissionDenied(p) => {
                assert_eq!(p.kind, DenyKind::Permission);
                assert_eq!(p.permission, Some(Permissions::SPEAK));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let msg = ControlMessage::Ping(Ping {
            timestamp: 12345,
            ..Default::default()
        });
        let encoded = encode_message(&msg).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..5]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..]);
        let decoded = try_decode_frame(&mut buf).unwrap().unwrap();
        match decoded {
            ControlMessage::Ping(p) => assert_eq!(p.timestamp, 12345),
            _ => panic!("wrong variant"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&999u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageTag(999))));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&((MAX_CONTROL_MSG_SIZE as u32) + 1).to_be_bytes());
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge(_))));
    }

    #[test]
    fn multiple_frames_in_buffer() {
        let m1 = ControlMessage::Ping(Ping {
            timestamp: 1,
            ..Default::default()
        });
        let m2 = ControlMessage::ChannelRemove(ChannelRemove { channel_id: 9 });
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_message(&m1).unwrap());
        buf.extend_from_slice(&encode_message(&m2).unwrap());

        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::Ping(p) => assert_eq!(p.timestamp, 1),
            _ => panic!("wrong variant"),
        }
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::ChannelRemove(c) => assert_eq!(c.channel_id, 9),
            _ => panic!("wrong variant"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn tunnelled_voice_roundtrip() {
        let inner = vec![0x04, 0, 0, 0, 1, 0xAA, 0xBB];
        let msg = ControlMessage::UdpTunnel(UdpTunnel {
            packet: inner.clone(),
        });
        let encoded = encode_message(&msg).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::UdpTunnel(t) => assert_eq!(t.packet, inner),
            _ => panic!("wrong variant"),
        }
    }
}
