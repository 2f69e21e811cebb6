use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use skywave_protocol::types::{ChannelId, SessionId, UserId, UserProperty};

use crate::error::StoreError;
use crate::types::{AclRow, Ban, UserRecord};
use crate::{AclStore, BanStore, GroupStore, UserStore};

#[derive(Default)]
struct Inner {
    next_user_id: UserId,
    users: HashMap<UserId, UserRecord>,
    textures: HashMap<UserId, Vec<u8>>,
    bans: Vec<Ban>,
    acl_rows: HashMap<ChannelId, Vec<AclRow>>,
    // (session, channel) -> group names
    temp_groups: HashMap<(SessionId, ChannelId), Vec<String>>,
}

/// In-memory store. One mutex over the whole dataset makes every operation
/// trivially transactional and serializable against the others.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_user_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn register_user(&self, name: &str) -> Result<UserId, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .users
            .values()
            .any(|u| u.name.eq_ignore_ascii_case(name))
        {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        let id = inner.next_user_id;
        inner.next_user_id += 1;
        inner.users.insert(id, UserRecord::new(id, name));
        Ok(id)
    }

    async fn unregister_user(&self, id: UserId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.textures.remove(&id);
        Ok(inner.users.remove(&id).is_some())
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&id).cloned())
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users: Vec<UserRecord> = inner.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn get_property(
        &self,
        id: UserId,
        tag: UserProperty,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .get(&id)
            .and_then(|u| u.properties.get(&tag))
            .cloned())
    }

    async fn set_property(
        &self,
        id: UserId,
        tag: UserProperty,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner.users.get_mut(&id).ok_or(StoreError::UnknownUser(id))?;
        match value {
            Some(v) => {
                user.properties.insert(tag, v.to_string());
                if tag == UserProperty::Name {
                    user.name = v.to_string();
                }
            }
            None => {
                user.properties.remove(&tag);
            }
        }
        Ok(())
    }

    async fn texture(&self, id: UserId) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.textures.get(&id).cloned())
    }

    async fn set_texture(&self, id: UserId, blob: Option<&[u8]>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&id) {
            return Err(StoreError::UnknownUser(id));
        }
        match blob {
            Some(b) => {
                inner.textures.insert(id, b.to_vec());
            }
            None => {
                inner.textures.remove(&id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BanStore for MemoryStore {
    async fn bans(&self) -> Result<Vec<Ban>, StoreError> {
        Ok(self.inner.lock().await.bans.clone())
    }

    async fn replace_bans(&self, bans: Vec<Ban>) -> Result<(), StoreError> {
        self.inner.lock().await.bans = bans;
        Ok(())
    }

    async fn append_ban(&self, ban: Ban) -> Result<(), StoreError> {
        self.inner.lock().await.bans.push(ban);
        Ok(())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.bans.len();
        inner.bans.retain(|b| !b.is_expired(now));
        Ok(before - inner.bans.len())
    }

    async fn find_match(
        &self,
        address: IpAddr,
        username: &str,
        cert_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ban>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .bans
            .iter()
            .filter(|b| !b.is_expired(now))
            .find(|b| {
                b.matches_address(address)
                    || (!b.username.is_empty() && b.username.eq_ignore_ascii_case(username))
                    || (!b.cert_hash.is_empty() && b.cert_hash == cert_hash)
            })
            .cloned())
    }
}

#[async_trait]
impl AclStore for MemoryStore {
    async fn rows_for_channel(&self, channel: ChannelId) -> Result<Vec<AclRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.acl_rows.get(&channel).cloned().unwrap_or_default())
    }

    async fn replace_rows(
        &self,
        channel: ChannelId,
        rows: Vec<AclRow>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if rows.is_empty() {
            inner.acl_rows.remove(&channel);
        } else {
            inner.acl_rows.insert(channel, rows);
        }
        Ok(())
    }

    async fn remove_channel(&self, channel: ChannelId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.acl_rows.remove(&channel);
        Ok(())
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn add_temporary(
        &self,
        session: SessionId,
        channel: ChannelId,
        group: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let groups = inner.temp_groups.entry((session, channel)).or_default();
        if !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
        Ok(())
    }

    async fn temporary_groups(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<(SessionId, String)>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for ((session, ch), groups) in &inner.temp_groups {
            if *ch == channel {
                for g in groups {
                    out.push((*session, g.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn clear_session(&self, session: SessionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.temp_groups.retain(|(s, _), _| *s != session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywave_protocol::types::Permissions;

    #[tokio::test]
    async fn register_and_lookup() {
        let store = MemoryStore::new();
        let id = store.register_user("LA1K").await.unwrap();
        let user = store.user_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.name, "LA1K");
        assert_eq!(user.property(UserProperty::Name), Some("LA1K"));
    }

    #[tokio::test]
    async fn registration_is_case_insensitive_unique() {
        let store = MemoryStore::new();
        store.register_user("Alice").await.unwrap();
        let err = store.register_user("ALICE").await.unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(_)));
        assert!(store.user_by_name("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unregister_missing_is_noop() {
        let store = MemoryStore::new();
        assert!(!store.unregister_user(999).await.unwrap());
        let id = store.register_user("bob").await.unwrap();
        assert!(store.unregister_user(id).await.unwrap());
        assert!(!store.unregister_user(id).await.unwrap());
    }

    #[tokio::test]
    async fn property_set_get_clear() {
        let store = MemoryStore::new();
        let id = store.register_user("carol").await.unwrap();
        store
            .set_property(id, UserProperty::GridLocator, Some("JO59jw"))
            .await
            .unwrap();
        assert_eq!(
            store.get_property(id, UserProperty::GridLocator).await.unwrap(),
            Some("JO59jw".to_string())
        );
        store
            .set_property(id, UserProperty::GridLocator, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_property(id, UserProperty::GridLocator).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn property_on_unknown_user_fails() {
        let store = MemoryStore::new();
        let err = store
            .set_property(42, UserProperty::Comment, Some("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(42)));
    }

    #[tokio::test]
    async fn renaming_via_property_updates_lookup() {
        let store = MemoryStore::new();
        let id = store.register_user("old").await.unwrap();
        store
            .set_property(id, UserProperty::Name, Some("new"))
            .await
            .unwrap();
        assert!(store.user_by_name("old").await.unwrap().is_none());
        assert_eq!(store.user_by_name("NEW").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn texture_roundtrip() {
        let store = MemoryStore::new();
        let id = store.register_user("dave").await.unwrap();
        assert!(store.texture(id).await.unwrap().is_none());
        store.set_texture(id, Some(&[1, 2, 3])).await.unwrap();
        assert_eq!(store.texture(id).await.unwrap(), Some(vec![1, 2, 3]));
        store.set_texture(id, None).await.unwrap();
        assert!(store.texture(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ban_append_match_prune() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_ban(Ban {
                address: "10.1.0.0".parse().unwrap(),
                prefix_len: 16,
                username: "mallory".into(),
                cert_hash: String::new(),
                reason: "test".into(),
                start: now,
                duration_secs: 60,
            })
            .await
            .unwrap();

        let hit = store
            .find_match("10.1.2.3".parse().unwrap(), "someone", "", now)
            .await
            .unwrap();
        assert!(hit.is_some());

        // Name match from a different address.
        let hit = store
            .find_match("172.16.0.1".parse().unwrap(), "MALLORY", "", now)
            .await
            .unwrap();
        assert!(hit.is_some());

        let later = now + chrono::Duration::seconds(120);
        assert!(store
            .find_match("10.1.2.3".parse().unwrap(), "x", "", later)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.prune_expired(later).await.unwrap(), 1);
        assert!(store.bans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acl_rows_replace_and_remove() {
        let store = MemoryStore::new();
        let row = AclRow {
            channel_id: 3,
            user_id: Some(1),
            group: None,
            allow: Permissions::SPEAK,
            deny: Permissions::NONE,
            apply_here: true,
            apply_subs: false,
        };
        store.replace_rows(3, vec![row.clone()]).await.unwrap();
        assert_eq!(store.rows_for_channel(3).await.unwrap(), vec![row]);
        store.remove_channel(3).await.unwrap();
        assert!(store.rows_for_channel(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn temporary_groups_scoped_to_session() {
        let store = MemoryStore::new();
        store.add_temporary(10, 3, "contest").await.unwrap();
        store.add_temporary(10, 3, "contest").await.unwrap(); // idempotent
        store.add_temporary(11, 3, "dx").await.unwrap();
        store.add_temporary(10, 4, "other").await.unwrap();

        let mut groups = store.temporary_groups(3).await.unwrap();
        groups.sort();
        assert_eq!(groups, vec![(10, "contest".into()), (11, "dx".into())]);

        store.clear_session(10).await.unwrap();
        assert_eq!(store.temporary_groups(3).await.unwrap(), vec![(11, "dx".into())]);
        assert!(store.temporary_groups(4).await.unwrap().is_empty());
    }
}
