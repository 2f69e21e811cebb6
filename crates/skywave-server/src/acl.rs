use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::trace;

use skywave_protocol::types::{ChannelId, Permissions, SessionId, UserId};
use skywave_store::types::AclRow;

use crate::channels::{ChannelTree, ROOT_CHANNEL};

/// Meta-group matching every connected user.
pub const GROUP_ALL: &str = "all";
/// Meta-group matching users with the admin property.
pub const GROUP_ADMIN: &str = "admin";

/// The identity a permission question is asked for.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub admin: bool,
}

/// ACL rows, group definitions and the per-(session, channel) result cache.
///
/// Lives under the server's channel/ACL reader-writer lock next to the tree.
/// The cache is internally locked so evaluation works through a shared
/// reference; any structural mutation bumps the generation, which invalidates
/// every cached result at once.
pub struct AclManager {
    rows: HashMap<ChannelId, Vec<AclRow>>,
    /// Channel-scoped named groups: channel -> group -> member user ids.
    groups: HashMap<ChannelId, HashMap<String, HashSet<UserId>>>,
    /// Temporary memberships: (session, channel) -> group names.
    temp_groups: HashMap<(SessionId, ChannelId), HashSet<String>>,
    generation: u64,
    cache: Mutex<HashMap<(SessionId, ChannelId), (u64, Permissions)>>,
}

impl AclManager {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
            groups: HashMap::new(),
            temp_groups: HashMap::new(),
            generation: 0,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Current invalidation generation; bumped on every structural change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self) {
        self.generation += 1;
        self.cache.lock().expect("acl cache lock poisoned").clear();
    }

    /// Called when channel parentage changed; the walk results are stale.
    pub fn invalidate_all(&mut self) {
        self.bump();
    }

    pub fn rows(&self, channel: ChannelId) -> &[AclRow] {
        self.rows.get(&channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_rows(&mut self, channel: ChannelId, rows: Vec<AclRow>) {
        if rows.is_empty() {
            self.rows.remove(&channel);
        } else {
            self.rows.insert(channel, rows);
        }
        self.bump();
    }

    pub fn remove_channel(&mut self, channel: ChannelId) {
        self.rows.remove(&channel);
        self.groups.remove(&channel);
        self.temp_groups.retain(|(_, ch), _| *ch != channel);
        self.bump();
    }

    pub fn group_members(&self, channel: ChannelId, group: &str) -> HashSet<UserId> {
        self.groups
            .get(&channel)
            .and_then(|g| g.get(group))
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_group(
        &mut self,
        channel: ChannelId,
        group: &str,
        add: &[UserId],
        remove: &[UserId],
    ) {
        let members = self
            .groups
            .entry(channel)
            .or_default()
            .entry(group.to_string())
            .or_default();
        members.extend(add.iter().copied());
        for id in remove {
            members.remove(id);
        }
        self.bump();
    }

    pub fn add_temp_group(&mut self, session: SessionId, channel: ChannelId, group: &str) {
        self.temp_groups
            .entry((session, channel))
            .or_default()
            .insert(group.to_string());
        self.bump();
    }

    /// Drop all state tied to a session.
    pub fn clear_session(&mut self, session: SessionId) {
        self.temp_groups.retain(|(s, _), _| *s != session);
        self.bump();
    }

    fn in_group(&self, identity: Identity, channel: ChannelId, group: &str) -> bool {
        match group {
            GROUP_ALL => true,
            GROUP_ADMIN => identity.admin,
            _ => {
                if let Some(user_id) = identity.user_id {
                    if self
                        .groups
                        .get(&channel)
                        .and_then(|g| g.get(group))
                        .is_some_and(|members| members.contains(&user_id))
                    {
                        return true;
                    }
                }
                self.temp_groups
                    .get(&(identity.session_id, channel))
                    .is_some_and(|names| names.contains(group))
            }
        }
    }

    fn row_matches(&self, identity: Identity, node: ChannelId, row: &AclRow) -> bool {
        if let Some(user) = row.user_id {
            return identity.user_id == Some(user);
        }
        match &row.group {
            Some(group) => self.in_group(identity, node, group),
            None => false,
        }
    }

    /// Effective permissions of `identity` in `channel`, walking the tree
    /// from the root. Cached until the next structural change.
    pub fn evaluate(
        &self,
        tree: &ChannelTree,
        identity: Identity,
        channel: ChannelId,
    ) -> Permissions {
        if identity.admin {
            return Permissions::ALL;
        }

        let key = (identity.session_id, channel);
        {
            let cache = self.cache.lock().expect("acl cache lock poisoned");
            if let Some(&(generation, perms)) = cache.get(&key) {
                if generation == self.generation {
                    return perms;
                }
            }
        }

        let path = tree.path_from_root(channel);
        if path.is_empty() {
            return Permissions::NONE;
        }

        let mut perms = Permissions::DEFAULT;
        for &node in &path {
            let at_target = node == channel;
            for row in self.rows(node) {
                let applies = if at_target {
                    row.apply_here
                } else {
                    row.apply_subs
                };
                if applies && self.row_matches(identity, node, row) {
                    perms = perms.difference(row.deny).union(row.allow);
                }
            }
            // Every ancestor must grant Traverse for the target to be
            // reachable at all.
            if !at_target && !perms.contains(Permissions::TRAVERSE) {
                perms = Permissions::NONE;
                break;
            }
        }

        trace!(
            session = identity.session_id,
            channel,
            perms = perms.0,
            "acl evaluated"
        );
        self.cache
            .lock()
            .expect("acl cache lock poisoned")
            .insert(key, (self.generation, perms));
        perms
    }

    /// Convenience single-bit check.
    pub fn allowed(
        &self,
        tree: &ChannelTree,
        identity: Identity,
        channel: ChannelId,
        perm: Permissions,
    ) -> bool {
        self.evaluate(tree, identity, channel).contains(perm)
    }

    /// Cached entry count, for tests.
    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

impl Default for AclManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed rows and groups from the parsed config `[acl]` section.
pub fn apply_config_rules(
    acl: &mut AclManager,
    rules: &[crate::config::AclConfigRule],
    user_ids_by_name: &HashMap<String, UserId>,
) {
    for rule in rules {
        let (user_id, group) = match &rule.principal {
            crate::config::Principal::All => (None, Some(GROUP_ALL.to_string())),
            crate::config::Principal::Admin => (None, Some(GROUP_ADMIN.to_string())),
            crate::config::Principal::Moderator => (None, Some("moderator".to_string())),
            crate::config::Principal::Group(name) => (None, Some(name.clone())),
            crate::config::Principal::User(name) => {
                match user_ids_by_name.get(name.to_lowercase().as_str()) {
                    Some(id) => (Some(*id), None),
                    None => continue,
                }
            }
        };
        let mut rows = acl.rows(rule.channel_id).to_vec();
        rows.push(AclRow {
            channel_id: rule.channel_id,
            user_id,
            group,
            allow: rule.allow,
            deny: rule.deny,
            apply_here: true,
            apply_subs: true,
        });
        acl.set_rows(rule.channel_id, rows);
    }
}
