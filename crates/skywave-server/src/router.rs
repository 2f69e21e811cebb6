use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use tracing::trace;

use skywave_propagation::GridSquare;
use skywave_protocol::types::{ChannelId, Permissions, SessionId, UserId};
use skywave_protocol::voice::{
    OutboundVoice, PacketEffects, VoicePacket, TARGET_CHANNEL, TARGET_LOOPBACK,
};

use crate::acl::Identity;
use crate::state::{HandshakeState, ServerState};

/// Signal strengths below this drop the pair entirely.
pub const MIN_AUDIBLE_STRENGTH: f64 = 0.05;

/// One packet handed to the transport for one receiver.
#[derive(Debug)]
pub struct Delivery {
    pub session: SessionId,
    /// Plaintext outbound voice bytes; the transport encrypts per receiver.
    pub payload: Vec<u8>,
}

struct SpeakerInfo {
    session: SessionId,
    user_id: Option<UserId>,
    admin: bool,
    channel: ChannelId,
    grid: Option<GridSquare>,
    absorb: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    session: SessionId,
    /// Listener-binding gain; `None` for plain channel members.
    listener_gain: Option<f32>,
}

/// Route one voice packet: enumerate receivers, apply per-pair degradation,
/// return the packets to emit. Dropped receivers simply see a sequence gap;
/// the speaker's sequence number is forwarded untouched.
pub async fn route_voice(
    state: &ServerState,
    speaker_id: SessionId,
    packet: &VoicePacket,
) -> Vec<Delivery> {
    let Some(speaker) = speaker_snapshot(state, speaker_id) else {
        return Vec::new();
    };

    // Listening-only users and server-muted/suppressed sessions are absorbed
    // silently: no error, no forwarding.
    if speaker.absorb {
        trace!(session = speaker_id, "voice absorbed");
        return Vec::new();
    }

    if packet.target == TARGET_LOOPBACK {
        let outbound = OutboundVoice::new(speaker_id, packet, PacketEffects::IDENTITY);
        return vec![Delivery {
            session: speaker_id,
            payload: outbound.to_bytes(),
        }];
    }

    let candidates = if packet.target == TARGET_CHANNEL {
        channel_candidates(state, &speaker).await
    } else {
        whisper_candidates(state, &speaker, packet.target).await
    };

    let mut deliveries = Vec::with_capacity(candidates.len());
    let now = Utc::now();
    for candidate in candidates {
        if candidate.session == speaker_id {
            continue;
        }
        let Some((receiver_grid, deaf, blocked)) =
            receiver_snapshot(state, candidate.session, speaker.user_id)
        else {
            continue;
        };
        if deaf || blocked {
            continue;
        }

        let mut effects = PacketEffects::IDENTITY;
        // HF degradation applies only when the simulation is on and both
        // ends declare a location.
        if let (true, Some(speaker_grid), Some(receiver_grid)) = (
            state.config.hf_propagation.enabled,
            &speaker.grid,
            &receiver_grid,
        ) {
            let strength = state.engine.signal_strength(speaker_grid, receiver_grid, now);
            if strength < MIN_AUDIBLE_STRENGTH {
                continue;
            }
            let fading = state.engine.fading(strength);
            if rand::thread_rng().gen::<f64>() < fading.packet_loss_probability {
                continue;
            }
            effects.jitter = fading.jitter as f32;
            effects.noise = fading.noise_factor as f32;
        }
        if let Some(gain) = candidate.listener_gain {
            effects.gain *= gain;
        }

        let outbound = OutboundVoice::new(speaker_id, packet, effects);
        deliveries.push(Delivery {
            session: candidate.session,
            payload: outbound.to_bytes(),
        });
    }
    deliveries
}

fn speaker_snapshot(state: &ServerState, session_id: SessionId) -> Option<SpeakerInfo> {
    let session = state.sessions.get(&session_id)?;
    if session.handshake != HandshakeState::Authenticated {
        return None;
    }
    Some(SpeakerInfo {
        session: session_id,
        user_id: session.user_id,
        admin: session.admin,
        channel: session.channel_id,
        grid: session.grid.clone(),
        absorb: session.listening_only
            || session.flags.server_mute
            || session.flags.suppress
            || session.flags.self_mute,
    })
}

fn receiver_snapshot(
    state: &ServerState,
    session_id: SessionId,
    speaker_user: Option<UserId>,
) -> Option<(Option<GridSquare>, bool, bool)> {
    let session = state.sessions.get(&session_id)?;
    if session.handshake != HandshakeState::Authenticated {
        return None;
    }
    let deaf = session.flags.server_deaf || session.flags.self_deaf;
    let blocked = match speaker_user {
        Some(user) => session.blocked_users.contains(&user),
        None => false,
    };
    Some((session.grid.clone(), deaf, blocked))
}

/// Candidates for normal speech: members and listeners of the speaker's
/// channel and of every linked channel the speaker may speak into.
async fn channel_candidates(state: &ServerState, speaker: &SpeakerInfo) -> Vec<Candidate> {
    let topology = state.topology.read().await;
    let identity = Identity {
        session_id: speaker.session,
        user_id: speaker.user_id,
        admin: speaker.admin,
    };

    let mut out: HashMap<SessionId, Candidate> = HashMap::new();
    for channel in topology.tree.audio_reach(speaker.channel) {
        if !topology
            .acl
            .allowed(&topology.tree, identity, channel, Permissions::SPEAK)
        {
            continue;
        }
        let Some(entry) = topology.tree.get(channel) else {
            continue;
        };
        // Members take precedence over listener bindings: one copy each.
        for &member in &entry.members {
            out.insert(
                member,
                Candidate {
                    session: member,
                    listener_gain: None,
                },
            );
        }
        for (user, volume) in topology.listeners.listeners_of(channel) {
            let Some(sid) = state.user_to_session.get(&user).map(|s| *s) else {
                continue;
            };
            out.entry(sid).or_insert(Candidate {
                session: sid,
                listener_gain: Some(volume.gain()),
            });
        }
    }
    out.into_values().collect()
}

/// Candidates for a whisper slot, materialized once per routing epoch.
async fn whisper_candidates(
    state: &ServerState,
    speaker: &SpeakerInfo,
    slot: u8,
) -> Vec<Candidate> {
    let epoch = state.routing_epoch();

    let (cached, specs) = {
        let Some(session) = state.sessions.get(&speaker.session) else {
            return Vec::new();
        };
        let cached = session
            .whisper_cache
            .get(&slot)
            .filter(|c| c.epoch == epoch)
            .map(|c| c.sessions.clone());
        (cached, session.whisper_targets.get(&slot).cloned())
    };

    let sessions = match cached {
        Some(sessions) => sessions,
        None => {
            let Some(specs) = specs else {
                return Vec::new();
            };
            let materialized = materialize(state, speaker, &specs).await;
            if let Some(mut session) = state.sessions.get_mut(&speaker.session) {
                session.whisper_cache.insert(
                    slot,
                    crate::state::CachedWhisper {
                        epoch,
                        sessions: materialized.clone(),
                    },
                );
            }
            materialized
        }
    };

    sessions
        .into_iter()
        .map(|session| Candidate {
            session,
            listener_gain: None,
        })
        .collect()
}

/// Resolve a slot's target specs to concrete sessions. The speaker needs
/// Whisper at every channel audio would land in.
async fn materialize(
    state: &ServerState,
    speaker: &SpeakerInfo,
    specs: &[skywave_protocol::messages::VoiceTargetSpec],
) -> Vec<SessionId> {
    let topology = state.topology.read().await;
    let identity = Identity {
        session_id: speaker.session,
        user_id: speaker.user_id,
        admin: speaker.admin,
    };

    let mut out: Vec<SessionId> = Vec::new();
    for spec in specs {
        // Explicit sessions: Whisper is checked against each target's
        // current channel.
        for &target in &spec.sessions {
            let Some(channel) = state.sessions.get(&target).map(|s| s.channel_id) else {
                continue;
            };
            if topology
                .acl
                .allowed(&topology.tree, identity, channel, Permissions::WHISPER)
            {
                out.push(target);
            }
        }

        let Some(base) = spec.channel_id else {
            continue;
        };
        if !topology.tree.contains(base) {
            continue;
        }
        let mut channels = vec![base];
        if spec.children {
            channels.extend(topology.tree.descendants(base));
        }
        if spec.links {
            for ch in channels.clone() {
                if let Some(entry) = topology.tree.get(ch) {
                    channels.extend(entry.linked());
                }
            }
        }
        channels.sort_unstable();
        channels.dedup();

        let group_filter: Option<&str> = spec.group.as_deref();
        for channel in channels {
            if !topology
                .acl
                .allowed(&topology.tree, identity, channel, Permissions::WHISPER)
            {
                continue;
            }
            let Some(entry) = topology.tree.get(channel) else {
                continue;
            };
            for &member in &entry.members {
                if let Some(group) = group_filter {
                    let member_user = state.sessions.get(&member).and_then(|s| s.user_id);
                    let in_group = member_user
                        .is_some_and(|u| topology.acl.group_members(channel, group).contains(&u));
                    if !in_group {
                        continue;
                    }
                }
                out.push(member);
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{add_session, state};
    use skywave_propagation::engine::ConditionsUpdate;
    use skywave_protocol::messages::VoiceTargetSpec;
    use skywave_protocol::types::{Season, VolumeAdjustment, VolumeAdjustmentKind};
    use skywave_protocol::voice::VoiceType;

    fn opus(target: u8, sequence: u32) -> VoicePacket {
        VoicePacket::new(VoiceType::VoiceOpus, target, sequence, vec![0xAA, 0xBB])
    }

    fn set_grid(state: &ServerState, sid: SessionId, locator: &str) {
        let grid = GridSquare::parse(locator).unwrap();
        state.sessions.get_mut(&sid).unwrap().grid = Some(grid);
    }

    #[tokio::test]
    async fn same_channel_no_grids_passes_verbatim() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;

        for sequence in 0..20 {
            let deliveries = route_voice(&state, alice, &opus(0, sequence)).await;
            assert_eq!(deliveries.len(), 1);
            assert_eq!(deliveries[0].session, bob);
            let outbound = OutboundVoice::from_bytes(&deliveries[0].payload).unwrap();
            assert_eq!(outbound.speaker, alice);
            assert_eq!(outbound.sequence, sequence);
            assert_eq!(outbound.effects, PacketEffects::IDENTITY);
            assert_eq!(outbound.frame, vec![0xAA, 0xBB]);
        }
    }

    #[tokio::test]
    async fn speaker_never_receives_own_channel_audio() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let deliveries = route_voice(&state, alice, &opus(0, 1)).await;
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn loopback_target_echoes_to_speaker() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let deliveries = route_voice(&state, alice, &opus(TARGET_LOOPBACK, 9)).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, alice);
        let outbound = OutboundVoice::from_bytes(&deliveries[0].payload).unwrap();
        assert_eq!(outbound.sequence, 9);
        assert_eq!(outbound.effects, PacketEffects::IDENTITY);
    }

    #[tokio::test]
    async fn listening_only_speaker_is_absorbed() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let _bob = add_session(&state, "bob", 3).await;
        state.sessions.get_mut(&alice).unwrap().listening_only = true;
        let deliveries = route_voice(&state, alice, &opus(0, 1)).await;
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn muted_speaker_is_absorbed() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let _bob = add_session(&state, "bob", 3).await;
        state.sessions.get_mut(&alice).unwrap().flags.server_mute = true;
        assert!(route_voice(&state, alice, &opus(0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn deafened_receiver_is_excluded() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;
        state.sessions.get_mut(&bob).unwrap().flags.self_deaf = true;
        assert!(route_voice(&state, alice, &opus(0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn blocked_speaker_is_excluded_at_receiver() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;
        state.sessions.get_mut(&alice).unwrap().user_id = Some(77);
        state.sessions.get_mut(&bob).unwrap().blocked_users.insert(77);
        assert!(route_voice(&state, alice, &opus(0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn listener_receives_exactly_one_adjusted_copy() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await; // speaker in 40m
        let uma = add_session(&state, "uma", 4).await; // member of 20m
        state.sessions.get_mut(&uma).unwrap().user_id = Some(50);
        state.user_to_session.insert(50, uma);
        {
            let mut topology = state.topology.write().await;
            topology.listeners.add(50, 3);
            topology.listeners.set_volume(
                50,
                3,
                VolumeAdjustment::new(VolumeAdjustmentKind::Multiplicative, 0.5),
            );
        }

        let deliveries = route_voice(&state, alice, &opus(0, 5)).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, uma);
        let outbound = OutboundVoice::from_bytes(&deliveries[0].payload).unwrap();
        assert!((outbound.effects.gain - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn member_copy_wins_over_listener_binding() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;
        state.sessions.get_mut(&bob).unwrap().user_id = Some(51);
        state.user_to_session.insert(51, bob);
        {
            let mut topology = state.topology.write().await;
            topology.listeners.add(51, 3);
            topology
                .listeners
                .set_volume(51, 3, VolumeAdjustment::new(VolumeAdjustmentKind::Multiplicative, 0.1));
        }
        let deliveries = route_voice(&state, alice, &opus(0, 1)).await;
        assert_eq!(deliveries.len(), 1);
        let outbound = OutboundVoice::from_bytes(&deliveries[0].payload).unwrap();
        // One copy, at member gain.
        assert_eq!(outbound.effects.gain, 1.0);
    }

    #[tokio::test]
    async fn linked_channel_members_hear_speech() {
        let state = state();
        {
            let mut topology = state.topology.write().await;
            topology.tree.link(3, 4);
        }
        state.bump_routing_epoch();
        let alice = add_session(&state, "alice", 3).await;
        let carol = add_session(&state, "carol", 4).await;
        let deliveries = route_voice(&state, alice, &opus(0, 1)).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, carol);
    }

    #[tokio::test]
    async fn weak_path_is_dropped_entirely() {
        // Storm floor: strength is far below the audibility threshold.
        let state = state();
        state.engine.apply_update(ConditionsUpdate {
            solar_flux_index: Some(60),
            k_index: Some(9),
            season: Some(Season::Winter),
            ..Default::default()
        });
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;
        set_grid(&state, alice, "JO59jw");
        set_grid(&state, bob, "FN31pr");
        for sequence in 0..50 {
            assert!(route_voice(&state, alice, &opus(0, sequence)).await.is_empty());
        }
        let _ = bob;
    }

    #[tokio::test]
    async fn strong_path_delivers_with_degradation_tags() {
        let state = state();
        state.engine.apply_update(ConditionsUpdate {
            solar_flux_index: Some(300),
            k_index: Some(0),
            season: Some(Season::Summer),
            ..Default::default()
        });
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 3).await;
        set_grid(&state, alice, "JO59jw");
        set_grid(&state, bob, "JO59jx");

        let mut delivered = 0;
        let mut tagged = 0;
        for sequence in 0..200 {
            for delivery in route_voice(&state, alice, &opus(0, sequence)).await {
                delivered += 1;
                assert_eq!(delivery.session, bob);
                let outbound = OutboundVoice::from_bytes(&delivery.payload).unwrap();
                assert_eq!(outbound.speaker, alice);
                if outbound.effects.noise > 0.0 {
                    tagged += 1;
                }
            }
        }
        assert!(delivered > 0, "fading must let some packets through");
        assert_eq!(delivered, tagged, "every grid-pair packet carries noise");
    }

    #[tokio::test]
    async fn whisper_slot_reaches_registered_targets_only() {
        let state = state();
        let alice = add_session(&state, "alice", 3).await;
        let bob = add_session(&state, "bob", 4).await;
        let _carol = add_session(&state, "carol", 2).await;

        state.sessions.get_mut(&alice).unwrap().whisper_targets.insert(
            2,
            vec![VoiceTargetSpec {
                sessions: vec![bob],
                ..Default::default()
            }],
        );

        let deliveries = route_voice(&state, alice, &opus(2, 1)).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, bob);

        // Unregistered slot: nothing.
        assert!(route_voice(&state, alice, &opus(7, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn whisper_channel_target_with_children() {
        let state = state();
        let sub = {
            let mut topology = state.topology.write().await;
            topology.tree.add_channel(3, "40m dx", false).unwrap()
        };
        state.bump_routing_epoch();
        let alice = add_session(&state, "alice", 2).await;
        let bob = add_session(&state, "bob", 3).await;
        let carol = add_session(&state, "carol", sub).await;

        state.sessions.get_mut(&alice).unwrap().whisper_targets.insert(
            1,
            vec![VoiceTargetSpec {
                channel_id: Some(3),
                children: true,
                ..Default::default()
            }],
        );

        let mut got: Vec<SessionId> = route_voice(&state, alice, &opus(1, 1))
            .await
            .iter()
            .map(|d| d.session)
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![bob, carol]);
    }

    #[tokio::test]
    async fn whisper_cache_invalidated_by_routing_epoch() {
        let state = state();
        let alice = add_session(&state, "alice", 2).await;
        let _bob = add_session(&state, "bob", 3).await;

        state.sessions.get_mut(&alice).unwrap().whisper_targets.insert(
            1,
            vec![VoiceTargetSpec {
                channel_id: Some(3),
                ..Default::default()
            }],
        );

        assert_eq!(route_voice(&state, alice, &opus(1, 1)).await.len(), 1);

        // A new member joins the target channel; the epoch bump forces
        // re-materialization.
        let carol = add_session(&state, "carol", 3).await;
        let got = route_voice(&state, alice, &opus(1, 2)).await;
        assert_eq!(got.len(), 2);
        assert!(got.iter().any(|d| d.session == carol));
    }
}
