use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

use skywave_propagation::GridSquare;
use skywave_protocol::codec::try_decode_frame;
use skywave_protocol::messages::{
    self, ControlMessage, DenyKind, RejectReason, PROTOCOL_VERSION,
};
use skywave_protocol::types::{
    Band, ChannelId, Permissions, SessionId, UserProperty,
};
use skywave_protocol::voice::VoicePacket;

use crate::acl::Identity;
use crate::bus::Event;
use crate::channels::ROOT_CHANNEL;
use crate::ionotask;
use crate::state::{HandshakeState, ServerState};
use crate::udp;

const TEXT_MESSAGE_MAX: usize = 5000;

/// Deadline for client-initiated operations that hit the store.
const RPC_DEADLINE: Duration = Duration::from_secs(5);

/// Run a store-backed operation under the RPC deadline. `None` means the
/// deadline fired; the caller answers with a "timeout" denial.
async fn with_deadline<T>(fut: impl std::future::Future<Output = T>) -> Option<T> {
    tokio::time::timeout(RPC_DEADLINE, fut).await.ok()
}

fn deny_timeout(state: &ServerState, session_id: SessionId) {
    deny(state, session_id, DenyKind::Other, None, None, "timeout");
}

/// Handle one control connection (already TLS-wrapped).
pub async fn handle_connection(tls_stream: TlsStream<TcpStream>, state: Arc<ServerState>) {
    let peer_ip = tls_stream
        .get_ref()
        .0
        .peer_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));

    // Address-prefix bans are enforced before any bytes are exchanged.
    match state.store.find_match(peer_ip, "", "", Utc::now()).await {
        Ok(Some(ban)) => {
            info!(peer = %peer_ip, reason = %ban.reason, "rejecting banned address");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(peer = %peer_ip, "ban lookup failed, admitting: {e}"),
    }

    let (read_half, mut write_half) = tokio::io::split(tls_stream);

    // Writer task: owns the write half, drains the session's frame queue.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!("control write error: {e}");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let session_id = state.create_session(peer_ip, tx);
    info!(session_id, peer = %peer_ip, "control connection open");

    let mut read_half = read_half;
    let mut buf = BytesMut::with_capacity(4096);

    let deadline = Instant::now() + Duration::from_secs(state.config.handshake_timeout as u64);
    let authenticated =
        run_handshake(&state, session_id, &mut read_half, &mut buf, deadline).await;

    if authenticated {
        message_loop(&state, session_id, &mut read_half, &mut buf).await;
    }

    cleanup_session(&state, session_id).await;
    writer_handle.abort();
    info!(session_id, "control connection closed");
}

/// Drive the handshake machine (Fresh -> Versioned -> Authenticating ->
/// Authenticated) until login succeeds or the connection dies.
async fn run_handshake(
    state: &Arc<ServerState>,
    session_id: SessionId,
    read_half: &mut (impl AsyncReadExt + Unpin),
    buf: &mut BytesMut,
    deadline: Instant,
) -> bool {
    loop {
        let msg = match read_frame_until(read_half, buf, deadline).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(session_id, "connection closed during handshake");
                return false;
            }
            Err(e) => {
                warn!(session_id, "handshake failed: {e}");
                return false;
            }
        };

        let handshake = match state.sessions.get(&session_id) {
            Some(session) => session.handshake,
            None => return false,
        };

        match (handshake, msg) {
            (HandshakeState::Fresh, ControlMessage::Version(version)) => {
                if let Some(mut session) = state.sessions.get_mut(&session_id) {
                    session.version = version.version;
                    session.handshake = HandshakeState::Versioned;
                }
                state.send_to(
                    session_id,
                    &ControlMessage::Version(messages::Version {
                        version: PROTOCOL_VERSION,
                        release: format!("skywave {}", env!("CARGO_PKG_VERSION")),
                        os: std::env::consts::OS.to_string(),
                        os_version: String::new(),
                    }),
                );
            }
            (HandshakeState::Versioned, ControlMessage::Authenticate(auth)) => {
                if let Some(mut session) = state.sessions.get_mut(&session_id) {
                    session.handshake = HandshakeState::Authenticating;
                }
                match authenticate(state, session_id, auth).await {
                    Ok(()) => {
                        finish_login(state, session_id).await;
                        return true;
                    }
                    Err(reject) => {
                        state.send_to(session_id, &ControlMessage::Reject(reject));
                        // Give the writer a moment to flush the reject.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        return false;
                    }
                }
            }
            // Ping is harmless in any state.
            (_, ControlMessage::Ping(ping)) => {
                state.send_to(session_id, &ControlMessage::Ping(ping));
            }
            (handshake, other) => {
                warn!(
                    session_id,
                    ?handshake,
                    kind = ?other.kind(),
                    "unexpected message during handshake"
                );
                return false;
            }
        }
    }
}

/// Read one frame with an absolute deadline. `Ok(None)` means EOF.
async fn read_frame_until(
    read_half: &mut (impl AsyncReadExt + Unpin),
    buf: &mut BytesMut,
    deadline: Instant,
) -> Result<Option<ControlMessage>> {
    loop {
        if let Some(msg) = try_decode_frame(buf)? {
            return Ok(Some(msg));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("deadline exceeded");
        }
        let n = tokio::time::timeout(remaining, read_half.read_buf(buf))
            .await
            .map_err(|_| anyhow::anyhow!("deadline exceeded"))??;
        if n == 0 {
            return Ok(None);
        }
    }
}

fn reject(reason: RejectReason, details: &str) -> messages::Reject {
    messages::Reject {
        reason,
        details: details.to_string(),
    }
}

/// Credential check. Fills in the session on success.
async fn authenticate(
    state: &Arc<ServerState>,
    session_id: SessionId,
    auth: messages::Authenticate,
) -> std::result::Result<(), messages::Reject> {
    let peer_ip = match state.sessions.get(&session_id) {
        Some(session) => session.peer_ip,
        None => return Err(reject(RejectReason::None, "session gone")),
    };

    let fail = |reason: RejectReason, details: &str| {
        if state.record_auth_failure(peer_ip) {
            return reject(RejectReason::RateLimited, "too many attempts");
        }
        reject(reason, details)
    };

    let username = auth.username.trim().to_string();
    let char_count = username.chars().count();
    if char_count == 0 || char_count > 32 || username.chars().any(|c| c.is_control()) {
        return Err(fail(
            RejectReason::InvalidUsername,
            "username must be 1-32 printable characters",
        ));
    }

    match state
        .store
        .find_match(peer_ip, &username, "", Utc::now())
        .await
    {
        Ok(Some(ban)) => {
            info!(session_id, username = %username, reason = %ban.reason, "banned user rejected");
            return Err(reject(RejectReason::Banned, &ban.reason));
        }
        Ok(None) => {}
        Err(e) => warn!(session_id, "ban lookup failed, admitting: {e}"),
    }

    if state.is_name_connected(&username) {
        return Err(fail(RejectReason::UsernameInUse, "name already connected"));
    }
    if state.authenticated_count() >= state.config.users as usize {
        return Err(reject(RejectReason::ServerFull, "server is full"));
    }

    // Resolve or create the user record.
    let record = match state.store.user_by_name(&username).await {
        Ok(record) => record,
        Err(e) => {
            warn!(session_id, "user lookup failed: {e}");
            return Err(reject(RejectReason::AuthenticatorFail, "store failure"));
        }
    };

    let record = match record {
        Some(record) => {
            if let Some(expected) = &record.password_hash {
                let offered = auth.password.as_deref().unwrap_or("");
                let offered_hash = hex_sha256(offered);
                if offered_hash.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
                    return Err(fail(RejectReason::WrongUserPassword, "bad password"));
                }
            }
            Some(record)
        }
        None if state.config.autoregister => {
            match state.store.register_user(&username).await {
                Ok(user_id) => {
                    state.bus.publish(Event::UserRegistered {
                        user_id,
                        name: username.clone(),
                    });
                    state.store.user_by_id(user_id).await.ok().flatten()
                }
                Err(e) => {
                    warn!(session_id, "self-registration failed: {e}");
                    None
                }
            }
        }
        None => None,
    };

    // Apply everything to the session.
    {
        let Some(mut session) = state.sessions.get_mut(&session_id) else {
            return Err(reject(RejectReason::None, "session gone"));
        };
        session.name = username.clone();
        session.codec_opus = auth.opus;
        if let Some(record) = &record {
            session.user_id = Some(record.id);
            session.admin = record.is_admin();
            session.listening_only = record.listening_only();
            if let Some(locator) = record.property(UserProperty::GridLocator) {
                match GridSquare::parse(locator) {
                    Ok(grid) => session.grid = Some(grid),
                    Err(e) => debug!(session_id, "ignoring stored grid locator: {e}"),
                }
            }
            if let Some(label) = record.property(UserProperty::PreferredBand) {
                session.preferred_band = Band::from_label(label);
            }
        }
        session.handshake = HandshakeState::Authenticated;
        session.last_activity = Instant::now();
    }

    if let Some(record) = &record {
        state.user_to_session.insert(record.id, session_id);
        // Access tokens become temporary groups at the root.
        let mut topology = state.topology.write().await;
        for token in &auth.tokens {
            topology.acl.add_temp_group(session_id, ROOT_CHANNEL, token);
            let _ = state
                .store
                .add_temporary(session_id, ROOT_CHANNEL, token)
                .await;
        }
    }

    state.bus.publish(Event::UserAuthenticated {
        session: session_id,
        user_id: record.as_ref().map(|r| r.id),
        name: username,
    });
    Ok(())
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Post-auth synchronization: crypto, codecs, tree, roster, ServerSync.
async fn finish_login(state: &Arc<ServerState>, session_id: SessionId) {
    // CryptSetup first so the client can start its voice stack.
    let crypt_setup = {
        let Some(session) = state.sessions.get(&session_id) else {
            return;
        };
        messages::CryptSetup {
            key: Some(session.crypt.key_bytes()),
            client_nonce: Some(session.crypt.client_nonce_bytes()),
            server_nonce: Some(session.crypt.server_nonce_bytes()),
        }
    };
    state.send_to(session_id, &ControlMessage::CryptSetup(crypt_setup));
    state.send_to(
        session_id,
        &ControlMessage::CodecVersion(messages::CodecVersion {
            alpha: 0,
            beta: 0,
            prefer_alpha: false,
            opus: true,
        }),
    );

    // Land in the last channel when it still exists, the root otherwise.
    let target_channel = match resolve_last_channel(state, session_id).await {
        Some(channel) => channel,
        None => ROOT_CHANNEL,
    };
    join_channel(state, session_id, target_channel).await;

    // Channel tree, then the roster (self included), then ServerSync.
    let channel_states: Vec<ControlMessage> = {
        let topology = state.topology.read().await;
        topology
            .tree
            .ids()
            .into_iter()
            .filter_map(|id| topology.tree.get(id))
            .map(|entry| ControlMessage::ChannelState(entry.to_state()))
            .collect()
    };
    for msg in &channel_states {
        state.send_to(session_id, msg);
    }
    let roster: Vec<ControlMessage> = state
        .sessions
        .iter()
        .filter(|other| other.handshake == HandshakeState::Authenticated)
        .map(|other| ControlMessage::UserState(other.to_user_state()))
        .collect();
    for msg in &roster {
        state.send_to(session_id, msg);
    }

    let (root_perms, user_state) = {
        let topology = state.topology.read().await;
        let Some(session) = state.sessions.get(&session_id) else {
            return;
        };
        let identity = Identity {
            session_id,
            user_id: session.user_id,
            admin: session.admin,
        };
        (
            topology.acl.evaluate(&topology.tree, identity, ROOT_CHANNEL),
            session.to_user_state(),
        )
    };

    state.send_to(
        session_id,
        &ControlMessage::ServerSync(messages::ServerSync {
            session_id,
            max_bandwidth: state.config.bandwidth,
            welcome_text: state.config.welcometext.clone(),
            permissions: root_perms,
        }),
    );
    state.send_to(
        session_id,
        &ControlMessage::ServerConfig(messages::ServerConfig {
            max_bandwidth: Some(state.config.bandwidth),
            welcome_text: Some(state.config.welcometext.clone()),
            max_message_length: Some(TEXT_MESSAGE_MAX as u32),
            max_users: Some(state.config.users),
        }),
    );

    // Built-in context actions.
    for (action, text) in [
        ("block", "Block user's audio"),
        ("unblock", "Unblock user's audio"),
        ("band_info", "Show band recommendation"),
    ] {
        state.send_to(
            session_id,
            &ControlMessage::ContextActionModify(messages::ContextActionModify {
                action: action.to_string(),
                text: text.to_string(),
                context: 0,
                operation: messages::ContextActionOp::Add,
            }),
        );
    }

    // Announce the newcomer to everyone else.
    state.broadcast(&ControlMessage::UserState(user_state), Some(session_id));
    let name = state
        .sessions
        .get(&session_id)
        .map(|s| s.name.clone())
        .unwrap_or_default();
    info!(session_id, name = %name, "login complete");
}

async fn resolve_last_channel(state: &Arc<ServerState>, session_id: SessionId) -> Option<ChannelId> {
    let user_id = state.sessions.get(&session_id)?.user_id?;
    let stored = state
        .store
        .get_property(user_id, UserProperty::LastChannel)
        .await
        .ok()??;
    let channel: ChannelId = stored.parse().ok()?;
    let topology = state.topology.read().await;
    topology.tree.contains(channel).then_some(channel)
}

/// Move a session into a channel, updating membership and notifying.
async fn join_channel(state: &Arc<ServerState>, session_id: SessionId, channel: ChannelId) {
    {
        let mut topology = state.topology.write().await;
        if !topology.tree.contains(channel) {
            return;
        }
        let old = match state.sessions.get_mut(&session_id) {
            Some(mut session) => {
                let old = session.channel_id;
                session.channel_id = channel;
                old
            }
            None => return,
        };
        if let Some(entry) = topology.tree.get_mut(old) {
            entry.members.remove(&session_id);
        }
        if let Some(entry) = topology.tree.get_mut(channel) {
            entry.members.insert(session_id);
        }
    }
    state.bump_routing_epoch();

    if let Some(user_id) = state.sessions.get(&session_id).and_then(|s| s.user_id) {
        let _ = state
            .store
            .set_property(user_id, UserProperty::LastChannel, Some(&channel.to_string()))
            .await;
    }

    state.broadcast(
        &ControlMessage::UserState(messages::UserState {
            session_id: Some(session_id),
            channel_id: Some(channel),
            ..Default::default()
        }),
        None,
    );
}

/// The post-handshake message loop with the idle timer.
async fn message_loop(
    state: &Arc<ServerState>,
    session_id: SessionId,
    read_half: &mut (impl AsyncReadExt + Unpin),
    buf: &mut BytesMut,
) {
    let idle = Duration::from_secs(state.config.timeout.max(1) as u64);
    let max_burst = state.config.max_inflight_messages.max(1);

    'outer: loop {
        // Kicked sessions disappear from the map; stop reading for them.
        if !state.sessions.contains_key(&session_id) {
            break;
        }

        match tokio::time::timeout(idle, read_half.read_buf(buf)).await {
            Err(_) => {
                // No TCP traffic; UDP voice also counts as liveness.
                let alive = state
                    .sessions
                    .get(&session_id)
                    .map(|s| s.last_activity.elapsed() < idle)
                    .unwrap_or(false);
                if alive {
                    continue;
                }
                info!(session_id, "closing idle session: timeout");
                break;
            }
            Ok(Ok(0)) => {
                debug!(session_id, "client closed connection");
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(session_id, "control read error: {e}");
                break;
            }
        }

        let mut burst = 0u32;
        loop {
            match try_decode_frame(buf) {
                Ok(Some(msg)) => {
                    if let Some(mut session) = state.sessions.get_mut(&session_id) {
                        session.last_activity = Instant::now();
                        session.tcp_packets = session.tcp_packets.wrapping_add(1);
                    } else {
                        break 'outer;
                    }
                    handle_message(state, session_id, msg).await;

                    burst += 1;
                    if burst >= max_burst {
                        tokio::task::yield_now().await;
                        burst = 0;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Malformed frame: the stream cannot be trusted anymore.
                    warn!(session_id, "closing on protocol error: {e}");
                    break 'outer;
                }
            }
        }
    }
}

fn deny(
    state: &ServerState,
    session_id: SessionId,
    kind: DenyKind,
    permission: Option<Permissions>,
    channel_id: Option<ChannelId>,
    reason: &str,
) {
    state.send_to(
        session_id,
        &ControlMessage::PermissionDenied(messages::PermissionDenied {
            kind,
            permission,
            channel_id,
            session_id: Some(session_id),
            reason: if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            },
        }),
    );
}

/// A validation warning on the text channel: the record is rejected but the
/// session continues.
fn warn_text(state: &ServerState, session_id: SessionId, text: &str) {
    state.send_to(
        session_id,
        &ControlMessage::TextMessage(messages::TextMessage {
            actor: None,
            sessions: vec![session_id],
            channels: Vec::new(),
            trees: Vec::new(),
            message: text.to_string(),
        }),
    );
}

fn identity_of(state: &ServerState, session_id: SessionId) -> Option<Identity> {
    let session = state.sessions.get(&session_id)?;
    Some(Identity {
        session_id,
        user_id: session.user_id,
        admin: session.admin,
    })
}

/// Dispatch one authenticated control message.
async fn handle_message(state: &Arc<ServerState>, session_id: SessionId, msg: ControlMessage) {
    match msg {
        ControlMessage::Ping(ping) => handle_ping(state, session_id, ping),
        ControlMessage::UdpTunnel(tunnel) => handle_tunnel(state, session_id, tunnel).await,
        ControlMessage::UserState(update) => handle_user_state(state, session_id, update).await,
        ControlMessage::ChannelState(update) => {
            handle_channel_state(state, session_id, update).await
        }
        ControlMessage::ChannelRemove(remove) => {
            handle_channel_remove(state, session_id, remove.channel_id).await
        }
        ControlMessage::TextMessage(text) => handle_text_message(state, session_id, text).await,
        ControlMessage::PermissionQuery(query) => {
            handle_permission_query(state, session_id, query).await
        }
        ControlMessage::Acl(acl) => handle_acl(state, session_id, acl).await,
        ControlMessage::QueryUsers(query) => handle_query_users(state, session_id, query).await,
        ControlMessage::CryptSetup(_) => handle_crypt_resync(state, session_id),
        ControlMessage::VoiceTarget(target) => handle_voice_target(state, session_id, target),
        ControlMessage::UserRemove(remove) => handle_user_remove(state, session_id, remove).await,
        ControlMessage::BanList(bans) => handle_ban_list(state, session_id, bans).await,
        ControlMessage::UserStats(stats) => handle_user_stats(state, session_id, stats),
        ControlMessage::RequestBlob(request) => handle_request_blob(state, session_id, request).await,
        ControlMessage::UserList(list) => handle_user_list(state, session_id, list).await,
        ControlMessage::ChannelListener(listener) => {
            handle_channel_listener(state, session_id, listener).await
        }
        ControlMessage::HfBandSimulationUpdate(update) => {
            handle_hf_update(state, session_id, update).await
        }
        ControlMessage::ContextAction(action) => {
            handle_context_action(state, session_id, action).await
        }
        ControlMessage::PluginDataTransmission(data) => {
            handle_plugin_data(state, session_id, data)
        }
        ControlMessage::CodecVersion(codec) => {
            if let Some(mut session) = state.sessions.get_mut(&session_id) {
                session.codec_opus = codec.opus;
            }
        }
        ControlMessage::Authenticate(_) => {
            debug!(session_id, "duplicate Authenticate ignored");
        }
        ControlMessage::Version(_)
        | ControlMessage::Reject(_)
        | ControlMessage::ServerSync(_)
        | ControlMessage::ServerConfig(_)
        | ControlMessage::SuggestConfig(_)
        | ControlMessage::ContextActionModify(_)
        | ControlMessage::PermissionDenied(_)
        | ControlMessage::SignalQualityUpdate(_)
        | ControlMessage::PropagationUpdate(_) => {
            debug!(session_id, kind = ?msg.kind(), "ignoring server-plane message from client");
        }
    }
}

fn handle_ping(state: &ServerState, session_id: SessionId, ping: messages::Ping) {
    let reply = match state.sessions.get(&session_id) {
        Some(session) => messages::Ping {
            timestamp: ping.timestamp,
            good: session.crypt.good,
            late: session.crypt.late,
            lost: session.crypt.lost,
            resync: session.crypt.resync,
        },
        None => return,
    };
    state.send_to(session_id, &ControlMessage::Ping(reply));
}

async fn handle_tunnel(
    state: &Arc<ServerState>,
    session_id: SessionId,
    tunnel: messages::UdpTunnel,
) {
    // Tunnelled voice is charged against the same bandwidth budget.
    let allowed = state
        .sessions
        .get_mut(&session_id)
        .map(|mut s| s.voice_budget.try_consume(tunnel.packet.len() as f64))
        .unwrap_or(false);
    if !allowed {
        return;
    }
    match VoicePacket::from_bytes(&tunnel.packet) {
        Ok(packet) => udp::dispatch_voice(state, session_id, &packet).await,
        Err(e) => debug!(session_id, "invalid tunnelled voice packet: {e}"),
    }
}

async fn handle_user_state(
    state: &Arc<ServerState>,
    session_id: SessionId,
    update: messages::UserState,
) {
    let target = update.session_id.unwrap_or(session_id);
    let self_update = target == session_id;
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };

    if !self_update {
        // Only moderation flags may be set on others.
        let target_channel = match state.sessions.get(&target) {
            Some(session) => session.channel_id,
            None => {
                deny(state, session_id, DenyKind::Other, None, None, "no such session");
                return;
            }
        };
        let allowed = {
            let topology = state.topology.read().await;
            topology.acl.allowed(
                &topology.tree,
                actor,
                target_channel,
                Permissions::MUTE_DEAFEN,
            )
        };
        if !allowed {
            deny(
                state,
                session_id,
                DenyKind::Permission,
                Some(Permissions::MUTE_DEAFEN),
                Some(target_channel),
                "",
            );
            return;
        }
        let mut broadcast = messages::UserState {
            session_id: Some(target),
            actor: Some(session_id),
            ..Default::default()
        };
        if let Some(mut session) = state.sessions.get_mut(&target) {
            if let Some(mute) = update.server_mute {
                session.flags.server_mute = mute;
                broadcast.server_mute = Some(mute);
            }
            if let Some(deaf) = update.server_deaf {
                session.flags.server_deaf = deaf;
                broadcast.server_deaf = Some(deaf);
            }
            if let Some(suppress) = update.suppress {
                session.flags.suppress = suppress;
                broadcast.suppress = Some(suppress);
            }
            if let Some(priority) = update.priority_speaker {
                session.flags.priority_speaker = priority;
                broadcast.priority_speaker = Some(priority);
            }
        }
        state.broadcast(&ControlMessage::UserState(broadcast), None);
        return;
    }

    // Grid locator: a malformed one is a validation warning, not an error.
    if let Some(locator) = &update.grid_locator {
        match GridSquare::parse(locator) {
            Ok(grid) => {
                let allowed = {
                    let topology = state.topology.read().await;
                    let channel = state
                        .sessions
                        .get(&session_id)
                        .map(|s| s.channel_id)
                        .unwrap_or(ROOT_CHANNEL);
                    topology.acl.allowed(
                        &topology.tree,
                        actor,
                        channel,
                        Permissions::SET_GRID_LOCATOR,
                    )
                };
                if allowed {
                    let normalized = grid.as_str().to_string();
                    if let Some(mut session) = state.sessions.get_mut(&session_id) {
                        session.grid = Some(grid);
                    }
                    if let Some(user_id) = actor.user_id {
                        let _ = state
                            .store
                            .set_property(user_id, UserProperty::GridLocator, Some(&normalized))
                            .await;
                        state.bus.publish(Event::UserPropertiesChanged { user_id });
                    }
                } else {
                    deny(
                        state,
                        session_id,
                        DenyKind::Permission,
                        Some(Permissions::SET_GRID_LOCATOR),
                        None,
                        "",
                    );
                    return;
                }
            }
            Err(e) => {
                warn_text(state, session_id, &format!("grid locator rejected: {e}"));
                return;
            }
        }
    }

    // Channel move.
    if let Some(dest) = update.channel_id {
        let current = state
            .sessions
            .get(&session_id)
            .map(|s| s.channel_id)
            .unwrap_or(ROOT_CHANNEL);
        if dest != current {
            let (exists, allowed) = {
                let topology = state.topology.read().await;
                (
                    topology.tree.contains(dest),
                    topology
                        .acl
                        .allowed(&topology.tree, actor, dest, Permissions::ENTER),
                )
            };
            if !exists {
                deny(state, session_id, DenyKind::Other, None, Some(dest), "no such channel");
            } else if !allowed {
                deny(
                    state,
                    session_id,
                    DenyKind::Permission,
                    Some(Permissions::ENTER),
                    Some(dest),
                    "",
                );
            } else {
                join_channel(state, session_id, dest).await;
            }
        }
    }

    // Self flags.
    let mut broadcast = messages::UserState {
        session_id: Some(session_id),
        ..Default::default()
    };
    let mut changed = false;
    if let Some(mut session) = state.sessions.get_mut(&session_id) {
        if let Some(mute) = update.self_mute {
            session.flags.self_mute = mute;
            broadcast.self_mute = Some(mute);
            changed = true;
        }
        if let Some(deaf) = update.self_deaf {
            session.flags.self_deaf = deaf;
            // Deafened implies muted.
            if deaf {
                session.flags.self_mute = true;
                broadcast.self_mute = Some(true);
            }
            broadcast.self_deaf = Some(deaf);
            changed = true;
        }
        if let Some(recording) = update.recording {
            session.flags.recording = recording;
            broadcast.recording = Some(recording);
            changed = true;
        }
        if update.grid_locator.is_some() {
            broadcast.grid_locator = session.grid.as_ref().map(|g| g.as_str().to_string());
            changed = true;
        }
        if let Some(band) = update.preferred_band {
            session.preferred_band = Some(band);
            broadcast.preferred_band = Some(band);
            changed = true;
        }
    }
    if let (Some(band), Some(user_id)) = (update.preferred_band, actor.user_id) {
        let _ = state
            .store
            .set_property(user_id, UserProperty::PreferredBand, Some(&band.label()))
            .await;
        state.bus.publish(Event::UserPropertiesChanged { user_id });
    }
    if let (Some(comment), Some(user_id)) = (&update.comment, actor.user_id) {
        let _ = state
            .store
            .set_property(user_id, UserProperty::Comment, Some(comment))
            .await;
        state.bus.publish(Event::UserPropertiesChanged { user_id });
        broadcast.comment = Some(comment.clone());
        changed = true;
    }

    // Listener bindings embedded in UserState.
    for channel in &update.listening_channel_add {
        listener_add(state, session_id, *channel).await;
    }
    for channel in &update.listening_channel_remove {
        listener_remove(state, session_id, *channel).await;
    }

    if changed {
        state.broadcast(&ControlMessage::UserState(broadcast), None);
    }
}

async fn handle_channel_state(
    state: &Arc<ServerState>,
    session_id: SessionId,
    update: messages::ChannelState,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };

    match update.channel_id {
        // Creation: no id yet.
        None => {
            let parent = update.parent.unwrap_or(ROOT_CHANNEL);
            let Some(name) = update.name.clone().filter(|n| !n.trim().is_empty()) else {
                deny(state, session_id, DenyKind::ChannelName, None, None, "missing name");
                return;
            };
            if name.chars().count() > 64 || name.chars().any(|c| c.is_control()) {
                deny(state, session_id, DenyKind::ChannelName, None, None, "invalid name");
                return;
            }
            let temporary = update.temporary.unwrap_or(false);
            let needed = if temporary {
                Permissions::MAKE_TEMP_CHANNEL
            } else {
                Permissions::MAKE_CHANNEL
            };

            let created = {
                let mut topology = state.topology.write().await;
                if !topology.acl.allowed(&topology.tree, actor, parent, needed) {
                    None
                } else {
                    let id = topology.tree.add_channel(parent, &name, temporary);
                    if let (Some(id), Some(description)) = (id, &update.description) {
                        if let Some(entry) = topology.tree.get_mut(id) {
                            entry.description = description.clone();
                        }
                    }
                    if let (Some(id), Some(position)) = (id, update.position) {
                        if let Some(entry) = topology.tree.get_mut(id) {
                            entry.position = position;
                        }
                    }
                    id
                }
            };

            match created {
                Some(id) => {
                    state.bump_routing_epoch();
                    let entry_state = {
                        let topology = state.topology.read().await;
                        topology.tree.get(id).map(|e| e.to_state())
                    };
                    if let Some(entry_state) = entry_state {
                        state.broadcast(&ControlMessage::ChannelState(entry_state), None);
                    }
                    // The creator lands in their new channel.
                    if temporary {
                        join_channel(state, session_id, id).await;
                    }
                }
                None => deny(
                    state,
                    session_id,
                    DenyKind::Permission,
                    Some(needed),
                    Some(parent),
                    "",
                ),
            }
        }
        // Edit of an existing channel.
        Some(channel_id) => {
            let mut link_change = false;
            {
                let mut topology = state.topology.write().await;
                if !topology.tree.contains(channel_id) {
                    deny(state, session_id, DenyKind::Other, None, Some(channel_id), "no such channel");
                    return;
                }
                let may_edit =
                    topology
                        .acl
                        .allowed(&topology.tree, actor, channel_id, Permissions::MAKE_CHANNEL);
                let may_link =
                    topology
                        .acl
                        .allowed(&topology.tree, actor, channel_id, Permissions::LINK_CHANNEL);

                if update.name.is_some() || update.description.is_some() || update.position.is_some()
                {
                    if !may_edit {
                        deny(
                            state,
                            session_id,
                            DenyKind::Permission,
                            Some(Permissions::MAKE_CHANNEL),
                            Some(channel_id),
                            "",
                        );
                        return;
                    }
                    if let Some(entry) = topology.tree.get_mut(channel_id) {
                        if let Some(name) = &update.name {
                            entry.name = name.clone();
                        }
                        if let Some(description) = &update.description {
                            entry.description = description.clone();
                        }
                        if let Some(position) = update.position {
                            entry.position = position;
                        }
                    }
                }

                if !update.links_add.is_empty() || !update.links_remove.is_empty() {
                    if !may_link {
                        deny(
                            state,
                            session_id,
                            DenyKind::Permission,
                            Some(Permissions::LINK_CHANNEL),
                            Some(channel_id),
                            "",
                        );
                        return;
                    }
                    for other in &update.links_add {
                        link_change |= topology.tree.link(channel_id, *other);
                    }
                    for other in &update.links_remove {
                        link_change |= topology.tree.unlink(channel_id, *other);
                    }
                }
            }
            if link_change {
                state.bump_routing_epoch();
            }
            let entry_state = {
                let topology = state.topology.read().await;
                topology.tree.get(channel_id).map(|e| e.to_state())
            };
            if let Some(entry_state) = entry_state {
                state.broadcast(&ControlMessage::ChannelState(entry_state), None);
            }
        }
    }
}

async fn handle_channel_remove(
    state: &Arc<ServerState>,
    session_id: SessionId,
    channel_id: ChannelId,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if channel_id == ROOT_CHANNEL {
        deny(state, session_id, DenyKind::Other, None, Some(channel_id), "cannot remove the root");
        return;
    }

    let removed = {
        let mut topology = state.topology.write().await;
        if !topology.tree.contains(channel_id) {
            deny(state, session_id, DenyKind::Other, None, Some(channel_id), "no such channel");
            return;
        }
        if !topology
            .acl
            .allowed(&topology.tree, actor, channel_id, Permissions::MAKE_CHANNEL)
        {
            deny(
                state,
                session_id,
                DenyKind::Permission,
                Some(Permissions::MAKE_CHANNEL),
                Some(channel_id),
                "",
            );
            return;
        }
        let removed = topology.tree.remove_subtree(channel_id);
        for gone in &removed {
            topology.acl.remove_channel(*gone);
            topology.listeners.remove_channel(*gone);
        }
        removed
    };
    if removed.is_empty() {
        return;
    }
    state.bump_routing_epoch();

    // Displaced members fall back to the root.
    let displaced: Vec<SessionId> = state
        .sessions
        .iter()
        .filter(|s| removed.contains(&s.channel_id))
        .map(|s| s.id)
        .collect();
    for sid in displaced {
        join_channel(state, sid, ROOT_CHANNEL).await;
    }

    for gone in removed {
        let _ = state.store.remove_channel(gone).await;
        state.broadcast(
            &ControlMessage::ChannelRemove(messages::ChannelRemove { channel_id: gone }),
            None,
        );
    }
}

async fn handle_text_message(
    state: &Arc<ServerState>,
    session_id: SessionId,
    text: messages::TextMessage,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if text.message.chars().count() > TEXT_MESSAGE_MAX {
        deny(state, session_id, DenyKind::TextTooLong, None, None, "");
        return;
    }

    let mut recipients: Vec<SessionId> = Vec::new();
    for target in &text.sessions {
        if state.sessions.contains_key(target) {
            recipients.push(*target);
        }
    }

    {
        let topology = state.topology.read().await;
        let mut channels: Vec<ChannelId> = Vec::new();
        for channel in &text.channels {
            channels.push(*channel);
        }
        for tree_root in &text.trees {
            channels.push(*tree_root);
            channels.extend(topology.tree.descendants(*tree_root));
        }
        channels.sort_unstable();
        channels.dedup();

        for channel in channels {
            if !topology
                .acl
                .allowed(&topology.tree, actor, channel, Permissions::TEXT_MESSAGE)
            {
                deny(
                    state,
                    session_id,
                    DenyKind::Permission,
                    Some(Permissions::TEXT_MESSAGE),
                    Some(channel),
                    "",
                );
                continue;
            }
            if let Some(entry) = topology.tree.get(channel) {
                recipients.extend(entry.members.iter().copied());
            }
        }
    }

    recipients.sort_unstable();
    recipients.dedup();

    let relay = ControlMessage::TextMessage(messages::TextMessage {
        actor: Some(session_id),
        sessions: text.sessions,
        channels: text.channels,
        trees: text.trees,
        message: text.message,
    });
    for recipient in recipients {
        if recipient != session_id {
            state.send_to(recipient, &relay);
        }
    }
}

async fn handle_permission_query(
    state: &Arc<ServerState>,
    session_id: SessionId,
    query: messages::PermissionQuery,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    let permissions = {
        let topology = state.topology.read().await;
        topology.acl.evaluate(&topology.tree, actor, query.channel_id)
    };
    state.send_to(
        session_id,
        &ControlMessage::PermissionQuery(messages::PermissionQuery {
            channel_id: query.channel_id,
            permissions: Some(permissions),
            flush: false,
        }),
    );
}

async fn handle_acl(state: &Arc<ServerState>, session_id: SessionId, msg: messages::Acl) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if !actor.admin {
        deny(state, session_id, DenyKind::Permission, None, Some(msg.channel_id), "acl edits are admin-only");
        return;
    }

    if msg.query {
        let reply = {
            let topology = state.topology.read().await;
            let mut acls: Vec<messages::AclSpec> = Vec::new();
            // Inherited rows from ancestors first, flagged as such.
            for node in topology.tree.path_from_root(msg.channel_id) {
                let inherited = node != msg.channel_id;
                for row in topology.acl.rows(node) {
                    if inherited && !row.apply_subs {
                        continue;
                    }
                    acls.push(messages::AclSpec {
                        user_id: row.user_id,
                        group: row.group.clone(),
                        allow: row.allow,
                        deny: row.deny,
                        apply_here: row.apply_here,
                        apply_subs: row.apply_subs,
                        inherited,
                    });
                }
            }
            messages::Acl {
                channel_id: msg.channel_id,
                inherit_acls: true,
                groups: Vec::new(),
                acls,
                query: false,
            }
        };
        state.send_to(session_id, &ControlMessage::Acl(reply));
        return;
    }

    // Replacement write.
    let rows: Vec<skywave_store::types::AclRow> = msg
        .acls
        .iter()
        .filter(|spec| !spec.inherited)
        .map(|spec| skywave_store::types::AclRow {
            channel_id: msg.channel_id,
            user_id: spec.user_id,
            group: spec.group.clone(),
            allow: spec.allow,
            deny: spec.deny,
            apply_here: spec.apply_here,
            apply_subs: spec.apply_subs,
        })
        .collect();

    {
        let mut topology = state.topology.write().await;
        topology.acl.set_rows(msg.channel_id, rows.clone());
        for group in &msg.groups {
            topology
                .acl
                .update_group(msg.channel_id, &group.name, &group.add, &group.remove);
        }
    }
    // One retry on a store write failure, then surface it to the client.
    let mut persisted = state.store.replace_rows(msg.channel_id, rows.clone()).await;
    if persisted.is_err() {
        persisted = state.store.replace_rows(msg.channel_id, rows).await;
    }
    if let Err(e) = persisted {
        warn!(session_id, "failed to persist acl rows: {e}");
        deny(state, session_id, DenyKind::Other, None, Some(msg.channel_id), "internal");
    }
    state.bump_routing_epoch();
    // Cached client-side permissions are stale now.
    state.broadcast(
        &ControlMessage::PermissionQuery(messages::PermissionQuery {
            channel_id: msg.channel_id,
            permissions: None,
            flush: true,
        }),
        None,
    );
}

async fn handle_query_users(
    state: &Arc<ServerState>,
    session_id: SessionId,
    query: messages::QueryUsers,
) {
    let mut ids = Vec::new();
    let mut names = Vec::new();
    for id in &query.ids {
        if let Ok(Some(record)) = state.store.user_by_id(*id).await {
            ids.push(record.id);
            names.push(record.name);
        }
    }
    for name in &query.names {
        if let Ok(Some(record)) = state.store.user_by_name(name).await {
            ids.push(record.id);
            names.push(record.name);
        }
    }
    state.send_to(
        session_id,
        &ControlMessage::QueryUsers(messages::QueryUsers { ids, names }),
    );
}

/// Client asked for a voice-crypt resync: fresh nonces, same key.
fn handle_crypt_resync(state: &ServerState, session_id: SessionId) {
    let setup = match state.sessions.get_mut(&session_id) {
        Some(mut session) => {
            session.crypt.resync_nonces();
            messages::CryptSetup {
                key: None,
                client_nonce: Some(session.crypt.client_nonce_bytes()),
                server_nonce: Some(session.crypt.server_nonce_bytes()),
            }
        }
        None => return,
    };
    state.send_to(session_id, &ControlMessage::CryptSetup(setup));
}

fn handle_voice_target(
    state: &ServerState,
    session_id: SessionId,
    target: messages::VoiceTarget,
) {
    if target.id == 0 || target.id > 30 {
        deny(state, session_id, DenyKind::Other, None, None, "whisper slot out of range");
        return;
    }
    if let Some(mut session) = state.sessions.get_mut(&session_id) {
        session.whisper_cache.remove(&target.id);
        if target.targets.is_empty() {
            session.whisper_targets.remove(&target.id);
        } else {
            session.whisper_targets.insert(target.id, target.targets);
        }
    }
}

async fn handle_user_remove(
    state: &Arc<ServerState>,
    session_id: SessionId,
    remove: messages::UserRemove,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if !actor.admin {
        deny(state, session_id, DenyKind::Permission, None, None, "kick/ban is admin-only");
        return;
    }
    let Some(target) = state.sessions.get(&remove.session_id).map(|s| s.id) else {
        deny(state, session_id, DenyKind::Other, None, None, "no such session");
        return;
    };

    if remove.ban {
        let (peer_ip, name) = match state.sessions.get(&target) {
            Some(session) => (session.peer_ip, session.name.clone()),
            None => return,
        };
        let prefix_len = match peer_ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let ban = skywave_store::types::Ban {
            address: peer_ip,
            prefix_len,
            username: name,
            cert_hash: String::new(),
            reason: remove.reason.clone(),
            start: Utc::now(),
            duration_secs: 0,
        };
        let mut persisted = state.store.append_ban(ban.clone()).await;
        if persisted.is_err() {
            persisted = state.store.append_ban(ban).await;
        }
        if let Err(e) = persisted {
            warn!(session_id, "failed to persist ban: {e}");
        }
    }

    state.broadcast(
        &ControlMessage::UserRemove(messages::UserRemove {
            session_id: target,
            actor: Some(session_id),
            reason: remove.reason,
            ban: remove.ban,
        }),
        None,
    );
    // Dropping the session closes its writer; the reader notices next pass.
    state.remove_session(target).await;
}

async fn handle_ban_list(
    state: &Arc<ServerState>,
    session_id: SessionId,
    msg: messages::BanList,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if !actor.admin {
        deny(state, session_id, DenyKind::Permission, None, None, "ban list is admin-only");
        return;
    }

    if msg.query {
        let bans = match with_deadline(state.store.bans()).await {
            Some(Ok(bans)) => bans,
            Some(Err(e)) => {
                warn!(session_id, "ban list read failed: {e}");
                return;
            }
            None => {
                deny_timeout(state, session_id);
                return;
            }
        };
        let entries = bans
            .iter()
            .map(|ban| messages::BanEntry {
                address: match ban.address {
                    IpAddr::V4(v4) => v4.octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                },
                prefix_len: ban.prefix_len,
                username: ban.username.clone(),
                cert_hash: ban.cert_hash.clone(),
                reason: ban.reason.clone(),
                start: ban.start.timestamp(),
                duration: ban.duration_secs,
            })
            .collect();
        state.send_to(
            session_id,
            &ControlMessage::BanList(messages::BanList {
                bans: entries,
                query: false,
            }),
        );
        return;
    }

    let mut bans = Vec::with_capacity(msg.bans.len());
    for entry in &msg.bans {
        let address = match entry.address.len() {
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&entry.address);
                IpAddr::from(b)
            }
            16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&entry.address);
                IpAddr::from(b)
            }
            other => {
                warn_text(
                    state,
                    session_id,
                    &format!("ban entry rejected: address length {other}"),
                );
                continue;
            }
        };
        bans.push(skywave_store::types::Ban {
            address,
            prefix_len: entry.prefix_len,
            username: entry.username.clone(),
            cert_hash: entry.cert_hash.clone(),
            reason: entry.reason.clone(),
            start: chrono::DateTime::from_timestamp(entry.start, 0).unwrap_or_else(Utc::now),
            duration_secs: entry.duration,
        });
    }
    if let Err(e) = state.store.replace_bans(bans).await {
        warn!(session_id, "failed to persist ban list: {e}");
    }
}

fn handle_user_stats(state: &ServerState, session_id: SessionId, stats: messages::UserStats) {
    let target = stats.session_id.unwrap_or(session_id);
    let requester_admin = state
        .sessions
        .get(&session_id)
        .map(|s| s.admin)
        .unwrap_or(false);
    if target != session_id && !requester_admin {
        deny(state, session_id, DenyKind::Permission, None, None, "stats are admin-only");
        return;
    }
    let reply = match state.sessions.get(&target) {
        Some(session) => messages::UserStats {
            session_id: Some(target),
            stats_only: false,
            from_client: messages::PacketStats {
                good: session.crypt.good,
                late: session.crypt.late,
                lost: session.crypt.lost,
                resync: session.crypt.resync,
            },
            from_server: messages::PacketStats::default(),
            udp_packets: session.udp_packets,
            tcp_packets: session.tcp_packets,
            address: requester_admin.then(|| session.peer_ip.to_string()),
            opus: session.codec_opus,
            idle_secs: session.last_activity.elapsed().as_secs() as u32,
            online_secs: session.connected_at.elapsed().as_secs() as u32,
            bandwidth: state.config.bandwidth,
            version: session.version,
        },
        None => {
            deny(state, session_id, DenyKind::Other, None, None, "no such session");
            return;
        }
    };
    state.send_to(session_id, &ControlMessage::UserStats(reply));
}

async fn handle_request_blob(
    state: &Arc<ServerState>,
    session_id: SessionId,
    request: messages::RequestBlob,
) {
    for target in &request.session_textures {
        let Some(user_id) = state.sessions.get(target).and_then(|s| s.user_id) else {
            continue;
        };
        if let Ok(Some(texture)) = state.store.texture(user_id).await {
            state.send_to(
                session_id,
                &ControlMessage::UserState(messages::UserState {
                    session_id: Some(*target),
                    texture: Some(texture),
                    ..Default::default()
                }),
            );
        }
    }
    for target in &request.session_comments {
        let Some(user_id) = state.sessions.get(target).and_then(|s| s.user_id) else {
            continue;
        };
        if let Ok(Some(comment)) = state.store.get_property(user_id, UserProperty::Comment).await
        {
            state.send_to(
                session_id,
                &ControlMessage::UserState(messages::UserState {
                    session_id: Some(*target),
                    comment: Some(comment),
                    ..Default::default()
                }),
            );
        }
    }
    if !request.channel_descriptions.is_empty() {
        let topology = state.topology.read().await;
        for channel in &request.channel_descriptions {
            if let Some(entry) = topology.tree.get(*channel) {
                state.send_to(
                    session_id,
                    &ControlMessage::ChannelState(messages::ChannelState {
                        channel_id: Some(*channel),
                        description: Some(entry.description.clone()),
                        ..Default::default()
                    }),
                );
            }
        }
    }
}

async fn handle_user_list(
    state: &Arc<ServerState>,
    session_id: SessionId,
    list: messages::UserList,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    if !actor.admin {
        deny(state, session_id, DenyKind::Permission, None, None, "registry is admin-only");
        return;
    }

    // Entries with an empty name request unregistration.
    for entry in &list.users {
        if entry.name.is_empty() {
            match state.store.unregister_user(entry.user_id).await {
                Ok(true) => {
                    let mut topology = state.topology.write().await;
                    topology.listeners.remove_user(entry.user_id);
                    drop(topology);
                    state.bump_routing_epoch();
                    state.bus.publish(Event::UserUnregistered {
                        user_id: entry.user_id,
                    });
                }
                Ok(false) => {
                    // Unregistering an unknown user is a no-op.
                    debug!(user_id = entry.user_id, "unregister: not found");
                }
                Err(e) => warn!(session_id, "unregister failed: {e}"),
            }
        }
    }

    let users = match with_deadline(state.store.all_users()).await {
        Some(Ok(users)) => users,
        Some(Err(e)) => {
            warn!(session_id, "user list read failed: {e}");
            return;
        }
        None => {
            deny_timeout(state, session_id);
            return;
        }
    };
    let entries = users
        .iter()
        .map(|user| messages::RegisteredUser {
            user_id: user.id,
            name: user.name.clone(),
            last_seen: user.property(UserProperty::LastSeen).map(str::to_string),
            last_channel: user
                .property(UserProperty::LastChannel)
                .and_then(|c| c.parse().ok()),
        })
        .collect();
    state.send_to(
        session_id,
        &ControlMessage::UserList(messages::UserList { users: entries }),
    );
}

async fn listener_add(state: &Arc<ServerState>, session_id: SessionId, channel: ChannelId) -> bool {
    let Some(actor) = identity_of(state, session_id) else {
        return false;
    };
    let Some(user_id) = actor.user_id else {
        deny(state, session_id, DenyKind::Other, None, Some(channel), "listeners must be registered");
        return false;
    };
    let added = {
        let mut topology = state.topology.write().await;
        if !topology.tree.contains(channel) {
            deny(state, session_id, DenyKind::Other, None, Some(channel), "no such channel");
            return false;
        }
        if !topology
            .acl
            .allowed(&topology.tree, actor, channel, Permissions::LISTEN)
        {
            deny(
                state,
                session_id,
                DenyKind::Permission,
                Some(Permissions::LISTEN),
                Some(channel),
                "",
            );
            return false;
        }
        topology.listeners.add(user_id, channel)
    };
    if added {
        state.bump_routing_epoch();
        state.broadcast(
            &ControlMessage::ChannelListener(messages::ChannelListener {
                session_id: Some(session_id),
                channel_id: channel,
                operation: messages::ListenerOp::Add,
                volume: Some(skywave_protocol::types::VolumeAdjustment::identity()),
            }),
            None,
        );
    }
    added
}

async fn listener_remove(
    state: &Arc<ServerState>,
    session_id: SessionId,
    channel: ChannelId,
) -> bool {
    let Some(user_id) = state.sessions.get(&session_id).and_then(|s| s.user_id) else {
        return false;
    };
    let removed = {
        let mut topology = state.topology.write().await;
        topology.listeners.remove(user_id, channel)
    };
    if removed {
        state.bump_routing_epoch();
        state.broadcast(
            &ControlMessage::ChannelListener(messages::ChannelListener {
                session_id: Some(session_id),
                channel_id: channel,
                operation: messages::ListenerOp::Remove,
                volume: None,
            }),
            None,
        );
    }
    removed
}

async fn handle_channel_listener(
    state: &Arc<ServerState>,
    session_id: SessionId,
    msg: messages::ChannelListener,
) {
    // Clients may only manage their own bindings.
    if msg.session_id.is_some_and(|sid| sid != session_id) {
        deny(state, session_id, DenyKind::Other, None, None, "cannot manage other listeners");
        return;
    }
    match msg.operation {
        messages::ListenerOp::Add => {
            listener_add(state, session_id, msg.channel_id).await;
        }
        messages::ListenerOp::Remove => {
            listener_remove(state, session_id, msg.channel_id).await;
        }
        messages::ListenerOp::Disable | messages::ListenerOp::SetVolume => {
            let Some(user_id) = state.sessions.get(&session_id).and_then(|s| s.user_id) else {
                return;
            };
            let volume = match msg.operation {
                messages::ListenerOp::Disable => {
                    skywave_protocol::types::VolumeAdjustment::silenced()
                }
                _ => msg
                    .volume
                    .unwrap_or_else(skywave_protocol::types::VolumeAdjustment::identity),
            };
            let changed = {
                let mut topology = state.topology.write().await;
                topology.listeners.set_volume(user_id, msg.channel_id, volume)
            };
            if changed {
                state.broadcast(
                    &ControlMessage::ChannelListener(messages::ChannelListener {
                        session_id: Some(session_id),
                        channel_id: msg.channel_id,
                        operation: msg.operation,
                        volume: Some(volume),
                    }),
                    None,
                );
            } else {
                deny(state, session_id, DenyKind::Other, None, Some(msg.channel_id), "no such listener binding");
            }
        }
    }
}

async fn handle_hf_update(
    state: &Arc<ServerState>,
    session_id: SessionId,
    update: messages::HfBandSimulationUpdate,
) {
    let Some(actor) = identity_of(state, session_id) else {
        return;
    };
    let allowed = {
        let topology = state.topology.read().await;
        topology.acl.allowed(
            &topology.tree,
            actor,
            ROOT_CHANNEL,
            Permissions::CONFIGURE_PROPAGATION,
        )
    };
    if !allowed {
        deny(
            state,
            session_id,
            DenyKind::Permission,
            Some(Permissions::CONFIGURE_PROPAGATION),
            Some(ROOT_CHANNEL),
            "",
        );
        return;
    }

    if let Some(sfi) = update.solar_flux_index {
        if !(60..=300).contains(&sfi) {
            warn_text(state, session_id, "solar flux index must be 60-300");
            return;
        }
    }
    if let Some(k) = update.k_index {
        if k > 9 {
            warn_text(state, session_id, "K-index must be 0-9");
            return;
        }
    }

    let snapshot = state.engine.apply_update(
        skywave_propagation::engine::ConditionsUpdate {
            solar_flux_index: update.solar_flux_index,
            k_index: update.k_index,
            season: update.season,
            auto_time: update.auto_time,
        },
    );
    if let Some(snapshot) = snapshot {
        info!(
            session_id,
            sfi = snapshot.state.solar_flux_index,
            k = snapshot.state.k_index,
            "manual ionospheric override"
        );
        ionotask::propagate_snapshot(state, snapshot).await;
    }
}

async fn handle_context_action(
    state: &Arc<ServerState>,
    session_id: SessionId,
    action: messages::ContextAction,
) {
    match action.action.as_str() {
        "block" => {
            let Some(target_user) = action
                .session_id
                .and_then(|sid| state.sessions.get(&sid))
                .and_then(|s| s.user_id)
            else {
                warn_text(state, session_id, "block: target has no registered user");
                return;
            };
            if let Some(mut session) = state.sessions.get_mut(&session_id) {
                session.blocked_users.insert(target_user);
            }
        }
        "unblock" => {
            let Some(target_user) = action
                .session_id
                .and_then(|sid| state.sessions.get(&sid))
                .and_then(|s| s.user_id)
            else {
                return;
            };
            if let Some(mut session) = state.sessions.get_mut(&session_id) {
                session.blocked_users.remove(&target_user);
            }
        }
        "band_info" => {
            let own_grid = state.sessions.get(&session_id).and_then(|s| s.grid.clone());
            let other_grid = action
                .session_id
                .and_then(|sid| state.sessions.get(&sid))
                .and_then(|s| s.grid.clone());
            match (own_grid, other_grid) {
                (Some(a), Some(b)) => {
                    let band = state.engine.recommend_band(&a, &b);
                    let distance = skywave_propagation::distance_km(&a, &b);
                    warn_text(
                        state,
                        session_id,
                        &format!(
                            "{} to {}: {:.0} km, recommended band {}",
                            a,
                            b,
                            distance,
                            band.label()
                        ),
                    );
                }
                _ => warn_text(state, session_id, "band_info needs grid locators on both ends"),
            }
        }
        other => debug!(session_id, action = other, "unknown context action"),
    }
}

fn handle_plugin_data(
    state: &ServerState,
    session_id: SessionId,
    data: messages::PluginDataTransmission,
) {
    let relay = ControlMessage::PluginDataTransmission(messages::PluginDataTransmission {
        sender_session: Some(session_id),
        receiver_sessions: Vec::new(),
        data: data.data,
        data_id: data.data_id,
    });
    for receiver in data.receiver_sessions.iter().take(30) {
        if *receiver != session_id {
            state.send_to(*receiver, &relay);
        }
    }
}

/// Tear down after the connection ends: persist last-seen, announce the
/// departure, drop the session.
async fn cleanup_session(state: &Arc<ServerState>, session_id: SessionId) {
    let (was_authenticated, user_id) = match state.sessions.get(&session_id) {
        Some(session) => (
            session.handshake == HandshakeState::Authenticated,
            session.user_id,
        ),
        None => return, // already removed by a kick
    };

    if let Some(user_id) = user_id {
        let _ = state
            .store
            .set_property(
                user_id,
                UserProperty::LastSeen,
                Some(&Utc::now().to_rfc3339()),
            )
            .await;
    }

    state.remove_session(session_id).await;
    if was_authenticated {
        state.broadcast(
            &ControlMessage::UserRemove(messages::UserRemove {
                session_id,
                actor: None,
                reason: String::new(),
                ban: false,
            }),
            None,
        );
    }
}
