use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skywave_protocol::types::{ChannelId, Permissions, UserId, UserProperty};

/// A persisted user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    /// Password verifier (salted hash), absent for certificate-only users.
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Strong certificate hash (full chain validated).
    #[serde(default)]
    pub cert_hash_strong: Option<String>,
    /// Weak certificate hash (self-signed leaf).
    #[serde(default)]
    pub cert_hash_weak: Option<String>,
    /// Free-form properties keyed by small integer tag.
    #[serde(default)]
    pub properties: HashMap<UserProperty, String>,
}

impl UserRecord {
    pub fn new(id: UserId, name: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert(UserProperty::Name, name.to_string());
        Self {
            id,
            name: name.to_string(),
            password_hash: None,
            cert_hash_strong: None,
            cert_hash_weak: None,
            properties,
        }
    }

    pub fn property(&self, tag: UserProperty) -> Option<&str> {
        self.properties.get(&tag).map(String::as_str)
    }

    /// Whether this user may only receive, never transmit.
    pub fn listening_only(&self) -> bool {
        matches!(self.property(UserProperty::ListeningOnly), Some("1" | "true"))
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.property(UserProperty::Admin), Some("1" | "true"))
    }
}

/// A ban list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub address: IpAddr,
    pub prefix_len: u8,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cert_hash: String,
    #[serde(default)]
    pub reason: String,
    pub start: DateTime<Utc>,
    /// Seconds; 0 means permanent.
    pub duration_secs: u32,
}

impl Ban {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.duration_secs == 0 {
            return false;
        }
        now >= self.start + chrono::Duration::seconds(self.duration_secs as i64)
    }

    /// Prefix match against a connecting address.
    pub fn matches_address(&self, address: IpAddr) -> bool {
        let (ban_bytes, addr_bytes): (Vec<u8>, Vec<u8>) = match (self.address, address) {
            (IpAddr::V4(b), IpAddr::V4(a)) => (b.octets().to_vec(), a.octets().to_vec()),
            (IpAddr::V6(b), IpAddr::V6(a)) => (b.octets().to_vec(), a.octets().to_vec()),
            _ => return false,
        };
        let total_bits = (ban_bytes.len() * 8) as u32;
        let prefix = (self.prefix_len as u32).min(total_bits);

        let full_bytes = (prefix / 8) as usize;
        if ban_bytes[..full_bytes] != addr_bytes[..full_bytes] {
            return false;
        }
        let rem = prefix % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        (ban_bytes[full_bytes] & mask) == (addr_bytes[full_bytes] & mask)
    }
}

/// A persisted ACL row attached to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRow {
    pub channel_id: ChannelId,
    /// Exactly one of `user_id` and `group` is set.
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub group: Option<String>,
    pub allow: Permissions,
    pub deny: Permissions,
    pub apply_here: bool,
    pub apply_subs: bool,
}
