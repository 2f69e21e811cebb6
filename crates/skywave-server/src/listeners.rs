use std::collections::{HashMap, HashSet};

use skywave_protocol::types::{ChannelId, UserId, VolumeAdjustment};

/// Listener bindings: users subscribed to a channel's audio without being
/// members. Both indices are kept in lockstep; the pair (user, channel)
/// appears in exactly one entry of each.
pub struct ListenerManager {
    /// channel -> user -> volume adjustment.
    by_channel: HashMap<ChannelId, HashMap<UserId, VolumeAdjustment>>,
    /// user -> channels they listen to.
    by_user: HashMap<UserId, HashSet<ChannelId>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self {
            by_channel: HashMap::new(),
            by_user: HashMap::new(),
        }
    }

    /// Add a binding with the identity volume. Adding an existing binding is
    /// a no-op that preserves the current volume; returns whether the
    /// binding was created.
    pub fn add(&mut self, user: UserId, channel: ChannelId) -> bool {
        let listeners = self.by_channel.entry(channel).or_default();
        if listeners.contains_key(&user) {
            return false;
        }
        listeners.insert(user, VolumeAdjustment::identity());
        self.by_user.entry(user).or_default().insert(channel);
        true
    }

    /// Remove a binding; cleans both indices. Returns whether it existed.
    pub fn remove(&mut self, user: UserId, channel: ChannelId) -> bool {
        let mut removed = false;
        if let Some(listeners) = self.by_channel.get_mut(&channel) {
            removed = listeners.remove(&user).is_some();
            if listeners.is_empty() {
                self.by_channel.remove(&channel);
            }
        }
        if let Some(channels) = self.by_user.get_mut(&user) {
            channels.remove(&channel);
            if channels.is_empty() {
                self.by_user.remove(&user);
            }
        }
        removed
    }

    /// Set the volume for an existing binding.
    pub fn set_volume(
        &mut self,
        user: UserId,
        channel: ChannelId,
        volume: VolumeAdjustment,
    ) -> bool {
        match self
            .by_channel
            .get_mut(&channel)
            .and_then(|l| l.get_mut(&user))
        {
            Some(slot) => {
                *slot = volume;
                true
            }
            None => false,
        }
    }

    /// Silence a binding without removing it.
    pub fn disable(&mut self, user: UserId, channel: ChannelId) -> bool {
        self.set_volume(user, channel, VolumeAdjustment::silenced())
    }

    pub fn volume(&self, user: UserId, channel: ChannelId) -> Option<VolumeAdjustment> {
        self.by_channel
            .get(&channel)
            .and_then(|l| l.get(&user))
            .copied()
    }

    /// Listeners of a channel with their volume adjustments.
    pub fn listeners_of(&self, channel: ChannelId) -> Vec<(UserId, VolumeAdjustment)> {
        self.by_channel
            .get(&channel)
            .map(|l| l.iter().map(|(u, v)| (*u, *v)).collect())
            .unwrap_or_default()
    }

    /// Channels a user listens to.
    pub fn channels_of(&self, user: UserId) -> Vec<ChannelId> {
        self.by_user
            .get(&user)
            .map(|c| {
                let mut v: Vec<ChannelId> = c.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default()
    }

    /// Drop every binding a user holds (unregistration, disconnect of an
    /// unregistered user). Returns the affected channels.
    pub fn remove_user(&mut self, user: UserId) -> Vec<ChannelId> {
        let channels = self.channels_of(user);
        for channel in &channels {
            self.remove(user, *channel);
        }
        channels
    }

    /// Drop every binding on a channel (channel removal).
    pub fn remove_channel(&mut self, channel: ChannelId) -> Vec<UserId> {
        let users: Vec<UserId> = self
            .by_channel
            .get(&channel)
            .map(|l| l.keys().copied().collect())
            .unwrap_or_default();
        for user in &users {
            self.remove(*user, channel);
        }
        users
    }

    /// Total binding count; both indices must agree.
    pub fn len(&self) -> usize {
        self.by_channel.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        let from_channels: usize = self.by_channel.values().map(HashMap::len).sum();
        let from_users: usize = self.by_user.values().map(HashSet::len).sum();
        from_channels == from_users
    }
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywave_protocol::types::VolumeAdjustmentKind;

    #[test]
    fn add_initializes_identity_volume() {
        let mut listeners = ListenerManager::new();
        assert!(listeners.add(10, 3));
        assert_eq!(listeners.volume(10, 3), Some(VolumeAdjustment::identity()));
        assert!(listeners.indices_consistent());
    }

    #[test]
    fn double_add_is_noop_preserving_volume() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        listeners.set_volume(
            10,
            3,
            VolumeAdjustment::new(VolumeAdjustmentKind::Multiplicative, 2.0),
        );
        assert!(!listeners.add(10, 3));
        assert_eq!(listeners.volume(10, 3).unwrap().factor, 2.0);
        assert_eq!(listeners.len(), 1);
        assert!(listeners.indices_consistent());
    }

    #[test]
    fn remove_cleans_both_indices() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        listeners.add(10, 4);
        assert!(listeners.remove(10, 3));
        assert_eq!(listeners.channels_of(10), vec![4]);
        assert!(listeners.listeners_of(3).is_empty());
        assert!(!listeners.remove(10, 3));
        assert!(listeners.indices_consistent());
    }

    #[test]
    fn disable_keeps_binding_at_zero_volume() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        assert!(listeners.disable(10, 3));
        let volume = listeners.volume(10, 3).unwrap();
        assert_eq!(volume.factor, 0.0);
        assert_eq!(volume.gain(), 0.0);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn set_volume_on_missing_binding_fails() {
        let mut listeners = ListenerManager::new();
        assert!(!listeners.set_volume(10, 3, VolumeAdjustment::identity()));
        assert!(!listeners.disable(10, 3));
    }

    #[test]
    fn remove_user_drops_all_bindings() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        listeners.add(10, 4);
        listeners.add(11, 3);
        let mut affected = listeners.remove_user(10);
        affected.sort_unstable();
        assert_eq!(affected, vec![3, 4]);
        assert_eq!(listeners.len(), 1);
        assert!(listeners.channels_of(10).is_empty());
        assert!(listeners.indices_consistent());
    }

    #[test]
    fn remove_channel_drops_all_listeners() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        listeners.add(11, 3);
        listeners.add(11, 4);
        let mut users = listeners.remove_channel(3);
        users.sort_unstable();
        assert_eq!(users, vec![10, 11]);
        assert_eq!(listeners.channels_of(11), vec![4]);
        assert!(listeners.indices_consistent());
    }

    #[test]
    fn listeners_of_reports_volumes() {
        let mut listeners = ListenerManager::new();
        listeners.add(10, 3);
        listeners.add(11, 3);
        listeners.disable(11, 3);
        let mut of_channel = listeners.listeners_of(3);
        of_channel.sort_by_key(|(u, _)| *u);
        assert_eq!(of_channel.len(), 2);
        assert_eq!(of_channel[0].1.gain(), 1.0);
        assert_eq!(of_channel[1].1.gain(), 0.0);
    }
}
