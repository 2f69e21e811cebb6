use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};

use skywave_protocol::codec::encode_message;
use skywave_protocol::messages::{ControlMessage, UdpTunnel};
use skywave_protocol::types::SessionId;
use skywave_protocol::voice::{VoicePacket, VoiceType, MAX_VOICE_PACKET_SIZE};

use crate::crypt::CRYPT_OVERHEAD;
use crate::router::{self, Delivery};
use crate::state::{HandshakeState, ServerState};

/// Datagram layout: 4-byte session id in clear, then the encrypted record.
const DATAGRAM_HEADER: usize = 4;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = DATAGRAM_HEADER + CRYPT_OVERHEAD + MAX_VOICE_PACKET_SIZE;

/// Split a datagram into its addressed session and the encrypted record.
fn parse_datagram(data: &[u8]) -> Option<(SessionId, &[u8])> {
    if data.len() < DATAGRAM_HEADER + CRYPT_OVERHEAD || data.len() > MAX_DATAGRAM {
        return None;
    }
    let session = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((session, &data[DATAGRAM_HEADER..]))
}

/// Run the UDP voice receive loop.
pub async fn run_udp_loop(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("UDP recv error: {e}");
                continue;
            }
        };

        let Some((session_id, record)) = parse_datagram(&buf[..len]) else {
            trace!(src = %src_addr, len, "discarding malformed datagram");
            continue;
        };

        let Some(plain) = decrypt_and_bind(&state, session_id, record, src_addr) else {
            continue;
        };

        let packet = match VoicePacket::from_bytes(&plain) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(session_id, "invalid voice packet: {e}");
                continue;
            }
        };

        if packet.voice_type == VoiceType::Ping {
            echo_ping(&state, &socket, session_id, &packet, src_addr).await;
            continue;
        }

        dispatch_voice(&state, session_id, &packet).await;
    }
}

/// Decrypt against the addressed session; on the first success from a new
/// address, bind the session to it. Crypto failures are silent drops.
fn decrypt_and_bind(
    state: &ServerState,
    session_id: SessionId,
    record: &[u8],
    src_addr: SocketAddr,
) -> Option<Vec<u8>> {
    let mut session = state.sessions.get_mut(&session_id)?;
    if session.handshake != HandshakeState::Authenticated {
        return None;
    }

    let plain = match session.crypt.decrypt(record) {
        Some(plain) => plain,
        None => {
            trace!(session_id, lost = session.crypt.lost, "voice decrypt failed");
            return None;
        }
    };

    // Charge the bandwidth budget before accepting the frame.
    if !session.voice_budget.try_consume(record.len() as f64) {
        trace!(session_id, "voice packet over bandwidth cap");
        return None;
    }

    session.last_activity = Instant::now();
    session.udp_packets = session.udp_packets.wrapping_add(1);

    if session.udp_addr != Some(src_addr) {
        if let Some(old) = session.udp_addr.replace(src_addr) {
            state.addr_to_session.remove(&old);
        }
        state.addr_to_session.insert(src_addr, session_id);
        debug!(session_id, src = %src_addr, "bound voice address");
    }
    Some(plain)
}

async fn echo_ping(
    state: &ServerState,
    socket: &UdpSocket,
    session_id: SessionId,
    packet: &VoicePacket,
    src_addr: SocketAddr,
) {
    let encrypted = match state.sessions.get_mut(&session_id) {
        Some(mut session) => session.crypt.encrypt(&packet.to_bytes()),
        None => return,
    };
    if let Err(e) = socket.send_to(&encrypted, src_addr).await {
        warn!(session_id, "ping echo failed: {e}");
    }
}

/// Route one voice packet and emit the deliveries. Shared by the UDP loop
/// and the UDPTunnel control path.
pub async fn dispatch_voice(state: &ServerState, speaker: SessionId, packet: &VoicePacket) {
    let deliveries = router::route_voice(state, speaker, packet).await;
    if deliveries.is_empty() {
        return;
    }
    let socket = state.udp_socket();
    for delivery in deliveries {
        emit(state, socket.as_deref(), delivery).await;
    }
}

/// Send one delivery: encrypted UDP when the receiver has a bound address,
/// otherwise tunnelled in the control stream (TLS already covers it).
async fn emit(state: &ServerState, socket: Option<&UdpSocket>, delivery: Delivery) {
    let target = {
        let Some(mut session) = state.sessions.get_mut(&delivery.session) else {
            return;
        };
        match (socket, session.udp_addr) {
            (Some(_), Some(addr)) => Some((addr, session.crypt.encrypt(&delivery.payload))),
            _ => None,
        }
    };

    match (socket, target) {
        (Some(socket), Some((addr, encrypted))) => {
            if let Err(e) = socket.send_to(&encrypted, addr).await {
                warn!(session = delivery.session, "voice send failed: {e}");
            }
        }
        _ => {
            let tunnel = ControlMessage::UdpTunnel(UdpTunnel {
                packet: delivery.payload,
            });
            match encode_message(&tunnel) {
                Ok(frame) => state.send_raw(delivery.session, frame),
                Err(e) => warn!("failed to encode voice tunnel: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{add_session, add_session_with_rx, state};
    use bytes::BytesMut;
    use skywave_protocol::codec::try_decode_frame;
    use skywave_protocol::voice::{OutboundVoice, VoiceType};

    #[test]
    fn parse_datagram_bounds() {
        assert!(parse_datagram(&[0u8; DATAGRAM_HEADER + CRYPT_OVERHEAD - 1]).is_none());
        assert!(parse_datagram(&vec![0u8; MAX_DATAGRAM + 1]).is_none());
        let mut data = vec![0u8; DATAGRAM_HEADER + CRYPT_OVERHEAD];
        data[..4].copy_from_slice(&7u32.to_be_bytes());
        let (session, record) = parse_datagram(&data).unwrap();
        assert_eq!(session, 7);
        assert_eq!(record.len(), CRYPT_OVERHEAD);
    }

    #[tokio::test]
    async fn decrypt_binds_address_once_valid() {
        let state = state();
        let sid = add_session(&state, "alice", 3).await;
        let src: SocketAddr = "192.0.2.10:40000".parse().unwrap();

        let packet = VoicePacket::new(VoiceType::VoiceOpus, 0, 1, vec![1, 2, 3]);
        let record = {
            let mut session = state.sessions.get_mut(&sid).unwrap();
            session.crypt.encrypt_as_client(&packet.to_bytes(), 0)
        };

        let plain = decrypt_and_bind(&state, sid, &record, src).unwrap();
        assert_eq!(plain, packet.to_bytes());
        assert_eq!(state.sessions.get(&sid).unwrap().udp_addr, Some(src));
        assert_eq!(*state.addr_to_session.get(&src).unwrap(), sid);
    }

    #[tokio::test]
    async fn garbage_record_is_dropped_silently() {
        let state = state();
        let sid = add_session(&state, "alice", 3).await;
        let src: SocketAddr = "192.0.2.10:40000".parse().unwrap();
        let record = vec![0u8; CRYPT_OVERHEAD + 10];
        assert!(decrypt_and_bind(&state, sid, &record, src).is_none());
        // Address stays unbound after a crypto failure.
        assert!(state.sessions.get(&sid).unwrap().udp_addr.is_none());
        assert!(state.sessions.get(&sid).unwrap().crypt.lost > 0);
    }

    #[tokio::test]
    async fn tunnel_fallback_when_no_udp_address() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let (bob, mut bob_rx) = add_session_with_rx(&state, "bob", 3).await;

        let packet = VoicePacket::new(VoiceType::VoiceOpus, 0, 4, vec![9]);
        dispatch_voice(&state, alice, &packet).await;

        let frame = bob_rx.recv().await.expect("tunnelled frame");
        let mut buf = BytesMut::from(&frame[..]);
        match try_decode_frame(&mut buf).unwrap().unwrap() {
            ControlMessage::UdpTunnel(tunnel) => {
                let outbound = OutboundVoice::from_bytes(&tunnel.packet).unwrap();
                assert_eq!(outbound.speaker, alice);
                assert_eq!(outbound.sequence, 4);
            }
            other => panic!("unexpected message {other:?}"),
        }
        let _ = bob;
    }

    #[tokio::test]
    async fn bandwidth_cap_drops_excess() {
        let state = state();
        let sid = add_session(&state, "alice", 3).await;
        let src: SocketAddr = "192.0.2.11:40000".parse().unwrap();
        // Exhaust the budget (default 72 kbit/s = 9000 bytes burst).
        {
            let mut session = state.sessions.get_mut(&sid).unwrap();
            assert!(session.voice_budget.try_consume(9000.0));
        }
        let packet = VoicePacket::new(VoiceType::VoiceOpus, 0, 1, vec![0; 100]);
        let record = {
            let mut session = state.sessions.get_mut(&sid).unwrap();
            session.crypt.encrypt_as_client(&packet.to_bytes(), 0)
        };
        assert!(decrypt_and_bind(&state, sid, &record, src).is_none());
    }
}
