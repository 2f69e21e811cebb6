use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use skywave_propagation::{GridSquare, PropagationEngine};
use skywave_protocol::codec::encode_message;
use skywave_protocol::messages::{ControlMessage, UserState, VoiceTargetSpec};
use skywave_protocol::types::{Band, ChannelId, SessionId, UserId};
use skywave_store::Store;

use crate::acl::AclManager;
use crate::bus::EventBus;
use crate::channels::{ChannelTree, ROOT_CHANNEL};
use crate::config::ServerConfig;
use crate::crypt::CryptState;
use crate::listeners::ListenerManager;

/// Failed authentication attempts tolerated per address per window.
const AUTH_FAILURE_LIMIT: usize = 5;
const AUTH_FAILURE_WINDOW_SECS: u64 = 10;

/// Token bucket; the voice path charges per byte, control paths per message.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume `cost` tokens. Returns false when rate-limited.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Handshake progress of a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Fresh,
    Versioned,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFlags {
    pub self_mute: bool,
    pub self_deaf: bool,
    pub server_mute: bool,
    pub server_deaf: bool,
    pub suppress: bool,
    pub priority_speaker: bool,
    pub recording: bool,
}

/// A materialized whisper target set, valid for one routing epoch.
#[derive(Debug, Clone)]
pub struct CachedWhisper {
    pub epoch: u64,
    pub sessions: Vec<SessionId>,
}

/// Per-connection session state.
pub struct Session {
    pub id: SessionId,
    pub handshake: HandshakeState,
    pub name: String,
    pub user_id: Option<UserId>,
    pub admin: bool,
    /// Mirrored from the user record: may receive, never transmit.
    pub listening_only: bool,
    pub channel_id: ChannelId,
    pub flags: SessionFlags,
    pub grid: Option<GridSquare>,
    pub preferred_band: Option<Band>,
    pub version: u32,
    pub codec_opus: bool,
    pub peer_ip: IpAddr,
    /// Learned from the first valid encrypted UDP packet.
    pub udp_addr: Option<SocketAddr>,
    /// Sender feeding this session's TCP writer task.
    pub tx: mpsc::Sender<Vec<u8>>,
    pub crypt: CryptState,
    /// Voice bandwidth budget (bytes).
    pub voice_budget: RateLimiter,
    pub last_activity: Instant,
    pub connected_at: Instant,
    pub tcp_packets: u32,
    pub udp_packets: u32,
    /// Registered whisper slots (1..=30) and their materialized caches.
    pub whisper_targets: HashMap<u8, Vec<VoiceTargetSpec>>,
    pub whisper_cache: HashMap<u8, CachedWhisper>,
    /// Users this session refuses audio from.
    pub blocked_users: HashSet<UserId>,
}

impl Session {
    /// Wire-level description of this session for roster broadcasts.
    pub fn to_user_state(&self) -> UserState {
        UserState {
            session_id: Some(self.id),
            name: Some(self.name.clone()),
            user_id: self.user_id,
            channel_id: Some(self.channel_id),
            self_mute: Some(self.flags.self_mute),
            self_deaf: Some(self.flags.self_deaf),
            server_mute: Some(self.flags.server_mute),
            server_deaf: Some(self.flags.server_deaf),
            suppress: Some(self.flags.suppress),
            priority_speaker: Some(self.flags.priority_speaker),
            recording: Some(self.flags.recording),
            grid_locator: self.grid.as_ref().map(|g| g.as_str().to_string()),
            preferred_band: self.preferred_band,
            listening_only: Some(self.listening_only),
            ..Default::default()
        }
    }
}

/// The channel tree, ACL rows and listener maps share one reader-writer
/// lock: routing reads, structural mutations write.
pub struct Topology {
    pub tree: ChannelTree,
    pub acl: AclManager,
    pub listeners: ListenerManager,
}

/// Shared server state.
pub struct ServerState {
    pub config: ServerConfig,
    pub sessions: DashMap<SessionId, Session>,
    pub user_to_session: DashMap<UserId, SessionId>,
    pub addr_to_session: DashMap<SocketAddr, SessionId>,
    pub topology: RwLock<Topology>,
    pub engine: PropagationEngine,
    pub bus: EventBus,
    pub store: Arc<dyn Store>,
    /// Monotonic; never reused within a run.
    next_session_id: AtomicU32,
    /// Bumped on join/leave, channel structure, ACL and group changes;
    /// invalidates materialized whisper sets.
    routing_epoch: AtomicU64,
    auth_failures: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    /// Set once the UDP socket is bound; voice tunnelled over TCP still
    /// goes out through it for receivers with a bound address.
    udp_socket: std::sync::OnceLock<Arc<tokio::net::UdpSocket>>,
}

impl ServerState {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>, engine: PropagationEngine) -> Self {
        let mut tree = ChannelTree::new();
        for (id, name) in config.channel_list() {
            if id == ROOT_CHANNEL {
                continue;
            }
            if tree.insert_with_id(id, ROOT_CHANNEL, &name).is_none() {
                warn!(id, name = %name, "skipping duplicate channel id in config");
                continue;
            }
            if let Some(description) = config.description_for(id) {
                if let Some(entry) = tree.get_mut(id) {
                    entry.description = description.to_string();
                }
            }
        }
        for (a, b) in config.link_pairs() {
            if !tree.link(a, b) {
                warn!(a, b, "skipping invalid channel link in config");
            }
        }

        let mut acl = AclManager::new();
        // User-principal rules are resolved against the store later, during
        // startup; group rules apply immediately.
        crate::acl::apply_config_rules(&mut acl, &config.acl_rules(), &HashMap::new());

        Self {
            config,
            sessions: DashMap::new(),
            user_to_session: DashMap::new(),
            addr_to_session: DashMap::new(),
            topology: RwLock::new(Topology {
                tree,
                acl,
                listeners: ListenerManager::new(),
            }),
            engine,
            bus: EventBus::new(),
            store,
            next_session_id: AtomicU32::new(0),
            routing_epoch: AtomicU64::new(0),
            auth_failures: Mutex::new(HashMap::new()),
            udp_socket: std::sync::OnceLock::new(),
        }
    }

    pub fn set_udp_socket(&self, socket: Arc<tokio::net::UdpSocket>) {
        let _ = self.udp_socket.set(socket);
    }

    pub fn udp_socket(&self) -> Option<Arc<tokio::net::UdpSocket>> {
        self.udp_socket.get().cloned()
    }

    /// Allocate a session id. Ids start at 1 and are never reused.
    pub fn allocate_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn routing_epoch(&self) -> u64 {
        self.routing_epoch.load(Ordering::Acquire)
    }

    /// Invalidate every materialized whisper set.
    pub fn bump_routing_epoch(&self) {
        self.routing_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Count of fully authenticated sessions.
    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.handshake == HandshakeState::Authenticated)
            .count()
    }

    pub fn is_name_connected(&self, name: &str) -> bool {
        self.sessions
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Record a failed authentication; returns true when the address is now
    /// over the limit and must be rejected with RateLimited.
    pub fn record_auth_failure(&self, addr: IpAddr) -> bool {
        let mut failures = self.auth_failures.lock().expect("auth failure lock");
        let now = Instant::now();
        let entry = failures.entry(addr).or_default();
        entry.retain(|at| now.duration_since(*at).as_secs() < AUTH_FAILURE_WINDOW_SECS);
        entry.push(now);
        entry.len() > AUTH_FAILURE_LIMIT
    }

    /// Queue an encoded frame to one session. Best-effort: full queues and
    /// closed sessions drop the frame.
    pub fn send_raw(&self, session_id: SessionId, frame: Vec<u8>) {
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.tx.try_send(frame);
        }
    }

    /// Queue a control message to one session.
    pub fn send_to(&self, session_id: SessionId, msg: &ControlMessage) {
        match encode_message(msg) {
            Ok(frame) => self.send_raw(session_id, frame),
            Err(e) => warn!(session_id, "failed to encode control message: {e}"),
        }
    }

    /// Broadcast a control message to every authenticated session.
    pub fn broadcast(&self, msg: &ControlMessage, exclude: Option<SessionId>) {
        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode broadcast: {e}");
                return;
            }
        };
        for session in self.sessions.iter() {
            if session.handshake != HandshakeState::Authenticated {
                continue;
            }
            if Some(session.id) == exclude {
                continue;
            }
            let _ = session.tx.try_send(frame.clone());
        }
    }

    /// Create the session entry for a connection that has completed its TLS
    /// handshake. Returns the id.
    pub fn create_session(
        &self,
        peer_ip: IpAddr,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> SessionId {
        let id = self.allocate_session_id();
        let now = Instant::now();
        // Bandwidth cap in bytes per second, with one second of burst.
        let bytes_per_sec = self.config.bandwidth as f64 / 8.0;
        let session = Session {
            id,
            handshake: HandshakeState::Fresh,
            name: String::new(),
            user_id: None,
            admin: false,
            listening_only: false,
            channel_id: ROOT_CHANNEL,
            flags: SessionFlags::default(),
            grid: None,
            preferred_band: None,
            version: 0,
            codec_opus: false,
            peer_ip,
            udp_addr: None,
            tx,
            crypt: CryptState::generate(),
            voice_budget: RateLimiter::new(bytes_per_sec, bytes_per_sec),
            last_activity: now,
            connected_at: now,
            tcp_packets: 0,
            udp_packets: 0,
            whisper_targets: HashMap::new(),
            whisper_cache: HashMap::new(),
            blocked_users: HashSet::new(),
        };
        self.sessions.insert(id, session);
        id
    }

    /// Tear down a session: indices, channel membership, listener bindings
    /// (bindings persist for registered users), temporary groups.
    pub async fn remove_session(&self, session_id: SessionId) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(user_id) = session.user_id {
            self.user_to_session.remove(&user_id);
        }
        if let Some(addr) = session.udp_addr {
            self.addr_to_session.remove(&addr);
        }

        {
            let mut topology = self.topology.write().await;
            if let Some(entry) = topology.tree.get_mut(session.channel_id) {
                entry.members.remove(&session_id);
            }
            topology.acl.clear_session(session_id);
        }
        if let Err(e) = self.store.clear_session(session_id).await {
            warn!(session_id, "failed to clear temporary groups: {e}");
        }
        self.bump_routing_epoch();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use skywave_propagation::IonosphericState;
    use skywave_protocol::types::Season;
    use skywave_store::memory::MemoryStore;

    /// A state with four band channels and a quiet ionosphere.
    pub fn state() -> Arc<ServerState> {
        let toml = r#"
            [channels]
            1 = "160m"
            2 = "80m"
            3 = "40m"
            4 = "20m"
        "#;
        state_with_config(toml::from_str(toml).unwrap())
    }

    pub fn state_with_config(config: ServerConfig) -> Arc<ServerState> {
        let engine = PropagationEngine::new(IonosphericState::new(
            config.hf_propagation.solar_flux_index,
            config.hf_propagation.k_index,
            Season::from_index(config.hf_propagation.season).unwrap_or(Season::Winter),
            false,
        ));
        Arc::new(ServerState::new(
            config,
            Arc::new(MemoryStore::new()),
            engine,
        ))
    }

    /// Insert an authenticated session in a channel, bypassing the network.
    pub async fn add_session(
        state: &ServerState,
        name: &str,
        channel: ChannelId,
    ) -> SessionId {
        let (id, rx) = add_session_with_rx(state, name, channel).await;
        // Keep the receiver alive so try_send never fails in tests.
        std::mem::forget(rx);
        id
    }

    /// Like [`add_session`] but hands back the frame receiver so tests can
    /// inspect what the session was sent.
    pub async fn add_session_with_rx(
        state: &ServerState,
        name: &str,
        channel: ChannelId,
    ) -> (SessionId, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(64);
        let id = state.create_session("127.0.0.1".parse().unwrap(), tx);
        {
            let mut session = state.sessions.get_mut(&id).unwrap();
            session.handshake = HandshakeState::Authenticated;
            session.name = name.to_string();
            session.channel_id = channel;
        }
        let mut topology = state.topology.write().await;
        topology
            .tree
            .get_mut(channel)
            .expect("test channel exists")
            .members
            .insert(id);
        drop(topology);
        state.bump_routing_epoch();
        (id, rx)
    }
}
