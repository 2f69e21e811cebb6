use serde::{Deserialize, Serialize};

use crate::types::*;

/// Current protocol version: two 16-bit halves (major, minor) packed in a u32.
pub const PROTOCOL_VERSION: u32 = (1u32 << 16) | 5;

/// Split a packed protocol version into (major, minor).
pub fn version_halves(v: u32) -> (u16, u16) {
    ((v >> 16) as u16, (v & 0xFFFF) as u16)
}

/// Control message type tags. Fixed for wire compatibility; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
    PluginDataTransmission = 26,
    ChannelListener = 27,
    HfBandSimulationUpdate = 28,
    SignalQualityUpdate = 29,
    PropagationUpdate = 30,
}

impl MessageKind {
    pub fn from_tag(tag: u16) -> Option<Self> {
        use MessageKind::*;
        Some(match tag {
            0 => Version,
            1 => UdpTunnel,
            2 => Authenticate,
            3 => Ping,
            4 => Reject,
            5 => ServerSync,
            6 => ChannelRemove,
            7 => ChannelState,
            8 => UserRemove,
            9 => UserState,
            10 => BanList,
            11 => TextMessage,
            12 => PermissionDenied,
            13 => Acl,
            14 => QueryUsers,
            15 => CryptSetup,
            16 => ContextActionModify,
            17 => ContextAction,
            18 => UserList,
            19 => VoiceTarget,
            20 => PermissionQuery,
            21 => CodecVersion,
            22 => UserStats,
            23 => RequestBlob,
            24 => ServerConfig,
            25 => SuggestConfig,
            26 => PluginDataTransmission,
            27 => ChannelListener,
            28 => HfBandSimulationUpdate,
            29 => SignalQualityUpdate,
            30 => PropagationUpdate,
            _ => return None,
        })
    }
}

/// Rejection reasons sent before closing an unauthenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    None,
    WrongVersion,
    InvalidUsername,
    WrongUserPassword,
    WrongServerPassword,
    UsernameInUse,
    ServerFull,
    NoCertificate,
    AuthenticatorFail,
    Banned,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// Packed protocol version (major << 16 | minor).
    pub version: u32,
    pub release: String,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticate {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Access tokens for token-gated groups.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// CELT bitstream versions the client supports (legacy clients).
    #[serde(default)]
    pub celt_versions: Vec<i32>,
    #[serde(default)]
    pub opus: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
    /// Voice crypt counters, echoed for resync diagnostics.
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub reason: RejectReason,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSync {
    /// The session id assigned to the newly authenticated client.
    pub session_id: SessionId,
    pub max_bandwidth: u32,
    pub welcome_text: String,
    /// Effective root-channel permissions for this user.
    pub permissions: Permissions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelRemove {
    pub channel_id: ChannelId,
}

/// Full or partial channel description. Absent options mean "unchanged".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: Option<ChannelId>,
    pub parent: Option<ChannelId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Complete replacement set of link partners.
    #[serde(default)]
    pub links: Option<Vec<ChannelId>>,
    #[serde(default)]
    pub links_add: Vec<ChannelId>,
    #[serde(default)]
    pub links_remove: Vec<ChannelId>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub temporary: Option<bool>,
    /// The band this channel models, if it is a band channel.
    #[serde(default)]
    pub band: Option<Band>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRemove {
    pub session_id: SessionId,
    #[serde(default)]
    pub actor: Option<SessionId>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub ban: bool,
}

/// Full or partial user/session description. Absent options mean "unchanged".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserState {
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub actor: Option<SessionId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub self_mute: Option<bool>,
    #[serde(default)]
    pub self_deaf: Option<bool>,
    #[serde(default)]
    pub server_mute: Option<bool>,
    #[serde(default)]
    pub server_deaf: Option<bool>,
    #[serde(default)]
    pub suppress: Option<bool>,
    #[serde(default)]
    pub priority_speaker: Option<bool>,
    #[serde(default)]
    pub recording: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Texture blob, served on RequestBlob.
    #[serde(default)]
    pub texture: Option<Vec<u8>>,
    /// Maidenhead locator, 4 or 6 characters. Validated server-side.
    #[serde(default)]
    pub grid_locator: Option<String>,
    #[serde(default)]
    pub preferred_band: Option<Band>,
    #[serde(default)]
    pub listening_only: Option<bool>,
    #[serde(default)]
    pub listening_channel_add: Vec<ChannelId>,
    #[serde(default)]
    pub listening_channel_remove: Vec<ChannelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    /// Address bytes (4 for IPv4, 16 for IPv6).
    pub address: Vec<u8>,
    pub prefix_len: u8,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cert_hash: String,
    #[serde(default)]
    pub reason: String,
    /// Seconds since the Unix epoch.
    pub start: i64,
    /// Seconds; 0 means permanent.
    pub duration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanList {
    pub bans: Vec<BanEntry>,
    /// True to fetch the list instead of replacing it.
    #[serde(default)]
    pub query: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
    #[serde(default)]
    pub actor: Option<SessionId>,
    /// Direct recipients.
    #[serde(default)]
    pub sessions: Vec<SessionId>,
    /// Channel recipients (members only).
    #[serde(default)]
    pub channels: Vec<ChannelId>,
    /// Subtree recipients (members of the channel and all descendants).
    #[serde(default)]
    pub trees: Vec<ChannelId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyKind {
    /// A concrete permission bit was missing.
    Permission,
    ChannelName,
    TextTooLong,
    TemporaryChannel,
    MissingCertificate,
    UserName,
    ChannelFull,
    NestingLimit,
    ChannelCountLimit,
    ListenerLimit,
    /// Server-side failure surfaced to the client ("internal", "timeout").
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDenied {
    pub kind: DenyKind,
    #[serde(default)]
    pub permission: Option<Permissions>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclSpec {
    /// Either a registered user id or a group name; exactly one is set.
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub group: Option<String>,
    pub allow: Permissions,
    pub deny: Permissions,
    pub apply_here: bool,
    pub apply_subs: bool,
    /// True when this row was inherited from an ancestor, not stored here.
    #[serde(default)]
    pub inherited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub inherit: bool,
    #[serde(default)]
    pub inheritable: bool,
    #[serde(default)]
    pub add: Vec<UserId>,
    #[serde(default)]
    pub remove: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub inherit_acls: bool,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub acls: Vec<AclSpec>,
    /// True to fetch the current rows instead of replacing them.
    #[serde(default)]
    pub query: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryUsers {
    #[serde(default)]
    pub ids: Vec<UserId>,
    #[serde(default)]
    pub names: Vec<String>,
}

/// Voice record-layer setup. Server → client carries all three fields;
/// client → server with empty fields requests a resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptSetup {
    #[serde(default)]
    pub key: Option<Vec<u8>>,
    #[serde(default)]
    pub client_nonce: Option<Vec<u8>>,
    #[serde(default)]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextActionOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextActionModify {
    pub action: String,
    #[serde(default)]
    pub text: String,
    /// Bitmask of contexts (server/channel/user) the action applies to.
    #[serde(default)]
    pub context: u32,
    pub operation: ContextActionOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAction {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub last_channel: Option<ChannelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<RegisteredUser>,
}

/// One target specification inside a whisper slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceTargetSpec {
    #[serde(default)]
    pub sessions: Vec<SessionId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// Restrict the channel target to members of this group.
    #[serde(default)]
    pub group: Option<String>,
    /// Follow channel links.
    #[serde(default)]
    pub links: bool,
    /// Include all descendant channels.
    #[serde(default)]
    pub children: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTarget {
    /// Whisper slot, 1..=30.
    pub id: u8,
    pub targets: Vec<VoiceTargetSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    /// Server → client: all cached permissions are stale, re-query.
    #[serde(default)]
    pub flush: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CodecVersion {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PacketStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub stats_only: bool,
    #[serde(default)]
    pub from_client: PacketStats,
    #[serde(default)]
    pub from_server: PacketStats,
    #[serde(default)]
    pub udp_packets: u32,
    #[serde(default)]
    pub tcp_packets: u32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub opus: bool,
    #[serde(default)]
    pub idle_secs: u32,
    #[serde(default)]
    pub online_secs: u32,
    #[serde(default)]
    pub bandwidth: u32,
    /// The client's reported protocol version.
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBlob {
    #[serde(default)]
    pub session_textures: Vec<SessionId>,
    #[serde(default)]
    pub session_comments: Vec<SessionId>,
    #[serde(default)]
    pub channel_descriptions: Vec<ChannelId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub max_bandwidth: Option<u32>,
    #[serde(default)]
    pub welcome_text: Option<String>,
    #[serde(default)]
    pub max_message_length: Option<u32>,
    #[serde(default)]
    pub max_users: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub positional: Option<bool>,
    #[serde(default)]
    pub push_to_talk: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDataTransmission {
    #[serde(default)]
    pub sender_session: Option<SessionId>,
    #[serde(default)]
    pub receiver_sessions: Vec<SessionId>,
    pub data: Vec<u8>,
    pub data_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerOp {
    Add,
    Remove,
    /// Keep the binding but set its volume to zero.
    Disable,
    SetVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelListener {
    /// Absent client → server: the sender's own session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub channel_id: ChannelId,
    pub operation: ListenerOp,
    #[serde(default)]
    pub volume: Option<VolumeAdjustment>,
}

/// Runtime override of the simulated ionospheric state (admin only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HfBandSimulationUpdate {
    #[serde(default)]
    pub solar_flux_index: Option<u16>,
    #[serde(default)]
    pub k_index: Option<u8>,
    #[serde(default)]
    pub season: Option<Season>,
    #[serde(default)]
    pub auto_time: Option<bool>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Per-pair quality hint pushed to a receiver when conditions change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalQualityUpdate {
    pub speaker_session: SessionId,
    /// Signal strength in [0, 1].
    pub strength: f32,
    pub recommended_band: Band,
}

/// Global ionospheric state broadcast after every epoch change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationUpdate {
    pub solar_flux_index: u16,
    pub k_index: u8,
    pub season: Season,
    /// MUF at the 3000 km reference distance, MHz.
    pub muf_reference_mhz: f32,
    pub epoch: u64,
    /// Bands currently considered open at the reference distance.
    pub open_bands: Vec<Band>,
}

/// A voice packet tunnelled over the control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpTunnel {
    pub packet: Vec<u8>,
}

/// The closed set of control-plane messages.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Version(Version),
    UdpTunnel(UdpTunnel),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    BanList(BanList),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    Acl(Acl),
    QueryUsers(QueryUsers),
    CryptSetup(CryptSetup),
    ContextActionModify(ContextActionModify),
    ContextAction(ContextAction),
    UserList(UserList),
    VoiceTarget(VoiceTarget),
    PermissionQuery(PermissionQuery),
    CodecVersion(CodecVersion),
    UserStats(UserStats),
    RequestBlob(RequestBlob),
    ServerConfig(ServerConfig),
    SuggestConfig(SuggestConfig),
    PluginDataTransmission(PluginDataTransmission),
    ChannelListener(ChannelListener),
    HfBandSimulationUpdate(HfBandSimulationUpdate),
    SignalQualityUpdate(SignalQualityUpdate),
    PropagationUpdate(PropagationUpdate),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Version(_) => MessageKind::Version,
            ControlMessage::UdpTunnel(_) => MessageKind::UdpTunnel,
            ControlMessage::Authenticate(_) => MessageKind::Authenticate,
            ControlMessage::Ping(_) => MessageKind::Ping,
            ControlMessage::Reject(_) => MessageKind::Reject,
            ControlMessage::ServerSync(_) => MessageKind::ServerSync,
            ControlMessage::ChannelRemove(_) => MessageKind::ChannelRemove,
            ControlMessage::ChannelState(_) => MessageKind::ChannelState,
            ControlMessage::UserRemove(_) => MessageKind::UserRemove,
            ControlMessage::UserState(_) => MessageKind::UserState,
            ControlMessage::BanList(_) => MessageKind::BanList,
            ControlMessage::TextMessage(_) => MessageKind::TextMessage,
            ControlMessage::PermissionDenied(_) => MessageKind::PermissionDenied,
            ControlMessage::Acl(_) => MessageKind::Acl,
            ControlMessage::QueryUsers(_) => MessageKind::QueryUsers,
            ControlMessage::CryptSetup(_) => MessageKind::CryptSetup,
            ControlMessage::ContextActionModify(_) => MessageKind::ContextActionModify,
            ControlMessage::ContextAction(_) => MessageKind::ContextAction,
            ControlMessage::UserList(_) => MessageKind::UserList,
            ControlMessage::VoiceTarget(_) => MessageKind::VoiceTarget,
            ControlMessage::PermissionQuery(_) => MessageKind::PermissionQuery,
            ControlMessage::CodecVersion(_) => MessageKind::CodecVersion,
            ControlMessage::UserStats(_) => MessageKind::UserStats,
            ControlMessage::RequestBlob(_) => MessageKind::RequestBlob,
            ControlMessage::ServerConfig(_) => MessageKind::ServerConfig,
            ControlMessage::SuggestConfig(_) => MessageKind::SuggestConfig,
            ControlMessage::PluginDataTransmission(_) => MessageKind::PluginDataTransmission,
            ControlMessage::ChannelListener(_) => MessageKind::ChannelListener,
            ControlMessage::HfBandSimulationUpdate(_) => MessageKind::HfBandSimulationUpdate,
            ControlMessage::SignalQualityUpdate(_) => MessageKind::SignalQualityUpdate,
            ControlMessage::PropagationUpdate(_) => MessageKind::PropagationUpdate,
        }
    }
}
