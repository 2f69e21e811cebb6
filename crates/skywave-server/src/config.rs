use std::collections::HashMap;

use serde::Deserialize;

use skywave_protocol::types::{ChannelId, Permissions};

/// Server configuration, loaded from a TOML file. Every key has a default so
/// a bare config (or none at all) yields a working server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Path/URL of the persistent store. Empty = in-memory.
    #[serde(default)]
    pub database: String,

    /// Maximum concurrent sessions.
    #[serde(default = "default_users")]
    pub users: u32,

    /// TCP listen port; UDP is bound to the same port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address; empty = all interfaces.
    #[serde(default)]
    pub host: String,

    /// Per-user voice bandwidth cap, bits per second.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u32,

    /// Idle seconds before a session is disconnected.
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    /// Seconds a connection may spend in the handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u32,

    /// Maximum control messages processed per read burst.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_messages: u32,

    #[serde(default = "default_welcometext")]
    pub welcometext: String,

    /// Accept unknown names as self-registrations.
    #[serde(default = "default_true")]
    pub autoregister: bool,

    /// Path to TLS certificate file (PEM).
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    /// Path to TLS private key file (PEM).
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// State directory (stats staging lives under it).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Numeric channel id -> name.
    #[serde(default)]
    pub channels: HashMap<String, String>,

    /// Numeric channel id -> description.
    #[serde(default)]
    pub channel_description: HashMap<String, String>,

    /// Numeric channel id -> comma-separated ids (bidirectional links).
    #[serde(default)]
    pub channel_links: HashMap<String, String>,

    /// Metadata field tag -> type ("text", "bool", "select:a,b").
    #[serde(default)]
    pub metadata_fields: HashMap<String, String>,

    /// Channel id -> ACL rule lines ("principal:+perm,-perm ...").
    #[serde(default)]
    pub acl: HashMap<String, String>,

    #[serde(default)]
    pub hf_propagation: HfPropagationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HfPropagationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pull SFI/K from external fetchers instead of the static values.
    #[serde(default)]
    pub use_external_data: bool,
    #[serde(default)]
    pub use_dxview_data: bool,
    #[serde(default)]
    pub use_swpc_data: bool,

    /// Static solar flux index (60-300) when external data is off.
    #[serde(default = "default_sfi")]
    pub solar_flux_index: u16,

    /// Static K-index (0-9).
    #[serde(default = "default_k_index")]
    pub k_index: u8,

    /// Follow the wall clock for the season.
    #[serde(default = "default_true")]
    pub auto_season: bool,

    /// Static season (0=winter .. 3=fall) when auto_season is off.
    #[serde(default)]
    pub season: u8,

    /// Minutes between ionospheric refresh ticks.
    #[serde(default = "default_update_interval")]
    pub update_interval: u32,
}

impl Default for HfPropagationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_external_data: false,
            use_dxview_data: false,
            use_swpc_data: false,
            solar_flux_index: default_sfi(),
            k_index: default_k_index(),
            auto_season: true,
            season: 0,
            update_interval: default_update_interval(),
        }
    }
}

fn default_users() -> u32 {
    100
}
fn default_port() -> u16 {
    64738
}
fn default_bandwidth() -> u32 {
    72_000
}
fn default_timeout() -> u32 {
    30
}
fn default_handshake_timeout() -> u32 {
    10
}
fn default_max_inflight() -> u32 {
    20
}
fn default_welcometext() -> String {
    "Welcome to Skywave.".into()
}
fn default_true() -> bool {
    true
}
fn default_cert_path() -> String {
    "certs/server.crt".into()
}
fn default_key_path() -> String {
    "certs/server.key".into()
}
fn default_state_dir() -> String {
    "state".into()
}
fn default_sfi() -> u16 {
    120
}
fn default_k_index() -> u8 {
    2
}
fn default_update_interval() -> u32 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes")
    }
}

/// Type of a custom `[metadata_fields]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataFieldType {
    Text,
    Bool,
    /// Closed choice list ("select:a,b,c").
    Select(Vec<String>),
}

impl MetadataFieldType {
    fn parse(spec: &str) -> Option<Self> {
        match spec.trim() {
            "text" => Some(Self::Text),
            "bool" => Some(Self::Bool),
            other => {
                let options = other.strip_prefix("select:")?;
                let options: Vec<String> = options
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect();
                (!options.is_empty()).then_some(Self::Select(options))
            }
        }
    }
}

/// An ACL principal from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    All,
    Admin,
    Moderator,
    Group(String),
    User(String),
}

/// One parsed `[acl]` rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AclConfigRule {
    pub channel_id: ChannelId,
    pub principal: Principal,
    pub allow: Permissions,
    pub deny: Permissions,
}

impl ServerConfig {
    /// The effective bind address ("" means all interfaces).
    pub fn bind_host(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }

    /// Parsed `[channels]` section, sorted by id.
    pub fn channel_list(&self) -> Vec<(ChannelId, String)> {
        let mut out: Vec<(ChannelId, String)> = self
            .channels
            .iter()
            .filter_map(|(id, name)| Some((id.parse().ok()?, name.clone())))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn description_for(&self, id: ChannelId) -> Option<&str> {
        self.channel_description.get(&id.to_string()).map(String::as_str)
    }

    /// Parsed `[channel_links]`: (from, to) pairs, bidirectional by contract.
    pub fn link_pairs(&self) -> Vec<(ChannelId, ChannelId)> {
        let mut out = Vec::new();
        for (from, list) in &self.channel_links {
            let Ok(from) = from.parse::<ChannelId>() else {
                continue;
            };
            for part in list.split(',') {
                if let Ok(to) = part.trim().parse::<ChannelId>() {
                    out.push((from, to));
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Parsed `[metadata_fields]`, sorted by tag. Invalid specs are skipped.
    pub fn metadata_field_types(&self) -> Vec<(String, MetadataFieldType)> {
        let mut out: Vec<(String, MetadataFieldType)> = self
            .metadata_fields
            .iter()
            .filter_map(|(tag, spec)| Some((tag.clone(), MetadataFieldType::parse(spec)?)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Parsed `[acl]` rules. Unparseable fragments are skipped.
    pub fn acl_rules(&self) -> Vec<AclConfigRule> {
        let mut out = Vec::new();
        for (channel, line) in &self.acl {
            let Ok(channel_id) = channel.parse::<ChannelId>() else {
                continue;
            };
            for rule in line.split_whitespace() {
                if let Some(parsed) = parse_acl_rule(channel_id, rule) {
                    out.push(parsed);
                }
            }
        }
        out.sort_by_key(|r| r.channel_id);
        out
    }
}

/// Parse one `principal:±perm,...` fragment.
fn parse_acl_rule(channel_id: ChannelId, rule: &str) -> Option<AclConfigRule> {
    let (principal_text, perms_text) = rule.split_once(':')?;
    let principal = match principal_text {
        "@all" => Principal::All,
        "@admin" => Principal::Admin,
        "@moderator" => Principal::Moderator,
        _ => {
            if let Some(group) = principal_text.strip_prefix('~') {
                Principal::Group(group.to_string())
            } else if let Some(user) = principal_text.strip_prefix('#') {
                Principal::User(user.to_string())
            } else {
                return None;
            }
        }
    };

    let mut allow = Permissions::NONE;
    let mut deny = Permissions::NONE;
    for perm in perms_text.split(',') {
        let perm = perm.trim();
        if perm.is_empty() {
            continue;
        }
        let (sign, name) = perm.split_at(1);
        let bits = Permissions::from_name(name)?;
        match sign {
            "+" => allow = allow.union(bits),
            "-" => deny = deny.union(bits),
            _ => return None,
        }
    }
    Some(AclConfigRule {
        channel_id,
        principal,
        allow,
        deny,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.users, 100);
        assert_eq!(config.port, 64738);
        assert_eq!(config.bandwidth, 72_000);
        assert_eq!(config.timeout, 30);
        assert!(config.autoregister);
        assert!(config.database.is_empty());
        assert_eq!(config.bind_host(), "0.0.0.0");
        assert!(config.hf_propagation.enabled);
        assert_eq!(config.hf_propagation.solar_flux_index, 120);
        assert_eq!(config.hf_propagation.update_interval, 15);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            database = "skywave.db"
            users = 40
            port = 64740
            host = "10.0.0.5"
            bandwidth = 48000
            timeout = 60
            welcometext = "73 de skywave"
            autoregister = false

            [channels]
            1 = "160m"
            2 = "80m"
            3 = "40m"

            [channel_description]
            3 = "The workhorse band"

            [channel_links]
            2 = "3, 1"

            [metadata_fields]
            antenna = "text"
            qrp = "bool"

            [acl]
            3 = "@all:+speak,+whisper ~contest:+textmessage #W1AW:-speak"

            [hf_propagation]
            enabled = true
            solar_flux_index = 180
            k_index = 4
            auto_season = false
            season = 2
            update_interval = 5
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.users, 40);
        assert_eq!(config.bind_host(), "10.0.0.5");
        assert_eq!(
            config.channel_list(),
            vec![(1, "160m".into()), (2, "80m".into()), (3, "40m".into())]
        );
        assert_eq!(config.description_for(3), Some("The workhorse band"));
        assert_eq!(config.link_pairs(), vec![(2, 1), (2, 3)]);
        assert_eq!(config.hf_propagation.solar_flux_index, 180);
        assert_eq!(config.hf_propagation.season, 2);
        assert!(!config.hf_propagation.auto_season);
    }

    #[test]
    fn acl_rules_parse() {
        let toml = r#"
            [acl]
            3 = "@all:+speak,+whisper ~contest:+textmessage #W1AW:-speak"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        let rules = config.acl_rules();
        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].principal, Principal::All);
        assert!(rules[0].allow.contains(Permissions::SPEAK));
        assert!(rules[0].allow.contains(Permissions::WHISPER));
        assert!(rules[0].deny.is_empty());

        assert_eq!(rules[1].principal, Principal::Group("contest".into()));
        assert!(rules[1].allow.contains(Permissions::TEXT_MESSAGE));

        assert_eq!(rules[2].principal, Principal::User("W1AW".into()));
        assert!(rules[2].deny.contains(Permissions::SPEAK));
    }

    #[test]
    fn malformed_acl_fragments_are_skipped() {
        let toml = r#"
            [acl]
            3 = "@all:+speak nonsense @admin:+fly @moderator:*speak"
            x = "@all:+speak"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        let rules = config.acl_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].principal, Principal::All);
    }

    #[test]
    fn metadata_field_types_parse() {
        let toml = r#"
            [metadata_fields]
            antenna = "text"
            qrp = "bool"
            power = "select:low, high"
            broken = "select:"
            unknown = "blob"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        let fields = config.metadata_field_types();
        assert_eq!(
            fields,
            vec![
                ("antenna".into(), MetadataFieldType::Text),
                (
                    "power".into(),
                    MetadataFieldType::Select(vec!["low".into(), "high".into()])
                ),
                ("qrp".into(), MetadataFieldType::Bool),
            ]
        );
    }

    #[test]
    fn link_pairs_ignore_garbage() {
        let toml = r#"
            [channel_links]
            2 = "3, x, 5"
            bad = "1"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.link_pairs(), vec![(2, 3), (2, 5)]);
    }
}
