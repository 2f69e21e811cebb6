//! Persistence contracts for the Skywave server.
//!
//! The core never talks to a database directly; it goes through the traits
//! in this crate. Every mutating operation is transactional (all-or-nothing)
//! and serializable with respect to the others. [`memory::MemoryStore`] is
//! the in-process implementation used by default and by the test suite.

pub mod error;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

use skywave_protocol::types::{ChannelId, SessionId, UserId, UserProperty};

use error::StoreError;
use types::{AclRow, Ban, UserRecord};

/// Registered users and their property maps.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create a user record. Names are unique case-insensitively; a taken
    /// name yields [`StoreError::NameTaken`].
    async fn register_user(&self, name: &str) -> Result<UserId, StoreError>;

    /// Remove a user record. Returns `false` when the id was not registered
    /// (a no-op, not an error).
    async fn unregister_user(&self, id: UserId) -> Result<bool, StoreError>;

    /// Case-insensitive lookup by name.
    async fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    async fn all_users(&self) -> Result<Vec<UserRecord>, StoreError>;

    async fn get_property(
        &self,
        id: UserId,
        tag: UserProperty,
    ) -> Result<Option<String>, StoreError>;

    /// Set or clear (`None`) a property. Unknown user ids are an error.
    async fn set_property(
        &self,
        id: UserId,
        tag: UserProperty,
        value: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn texture(&self, id: UserId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_texture(&self, id: UserId, blob: Option<&[u8]>) -> Result<(), StoreError>;
}

/// The server ban list.
#[async_trait]
pub trait BanStore: Send + Sync {
    async fn bans(&self) -> Result<Vec<Ban>, StoreError>;

    /// Replace the whole list (the BanList control message semantics).
    async fn replace_bans(&self, bans: Vec<Ban>) -> Result<(), StoreError>;

    async fn append_ban(&self, ban: Ban) -> Result<(), StoreError>;

    /// Drop expired entries; returns how many were removed.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// First active ban matching an address, name or certificate hash.
    async fn find_match(
        &self,
        address: IpAddr,
        username: &str,
        cert_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ban>, StoreError>;
}

/// Per-channel ACL rows.
#[async_trait]
pub trait AclStore: Send + Sync {
    async fn rows_for_channel(&self, channel: ChannelId) -> Result<Vec<AclRow>, StoreError>;

    async fn replace_rows(
        &self,
        channel: ChannelId,
        rows: Vec<AclRow>,
    ) -> Result<(), StoreError>;

    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError>;
}

/// Temporary group memberships, keyed by (session, channel). They live only
/// as long as the session and never persist across runs, but the contract
/// sits with the other stores so an external backend can share transactions.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn add_temporary(
        &self,
        session: SessionId,
        channel: ChannelId,
        group: &str,
    ) -> Result<(), StoreError>;

    async fn temporary_groups(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<(SessionId, String)>, StoreError>;

    /// Drop every temporary membership a session holds.
    async fn clear_session(&self, session: SessionId) -> Result<(), StoreError>;
}

/// The full persistence surface the server needs.
pub trait Store: UserStore + BanStore + AclStore + GroupStore {}

impl<T: UserStore + BanStore + AclStore + GroupStore> Store for T {}
