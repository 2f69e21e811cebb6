use std::collections::{HashMap, HashSet};

use skywave_protocol::messages::ChannelState;
use skywave_protocol::types::{Band, ChannelId, SessionId};

/// The root channel id. Always present, conceptually its own parent.
pub const ROOT_CHANNEL: ChannelId = 0;

/// One channel in the tree.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub name: String,
    pub description: String,
    pub parent: ChannelId,
    /// Ordered child list.
    pub children: Vec<ChannelId>,
    /// Manually configured links; never removed by the propagation engine.
    pub permanent_links: HashSet<ChannelId>,
    /// Links added and removed at runtime by the open-bands set.
    pub dynamic_links: HashSet<ChannelId>,
    pub position: i32,
    pub temporary: bool,
    /// Set when this channel models an amateur band.
    pub band: Option<Band>,
    /// Sessions currently in the channel.
    pub members: HashSet<SessionId>,
}

impl ChannelEntry {
    fn new(id: ChannelId, parent: ChannelId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: String::new(),
            parent,
            children: Vec::new(),
            permanent_links: HashSet::new(),
            dynamic_links: HashSet::new(),
            position: 0,
            temporary: false,
            band: band_from_name(name),
            members: HashSet::new(),
        }
    }

    /// All link partners, permanent and dynamic.
    pub fn linked(&self) -> HashSet<ChannelId> {
        self.permanent_links
            .union(&self.dynamic_links)
            .copied()
            .collect()
    }

    /// Wire representation of this channel.
    pub fn to_state(&self) -> ChannelState {
        let mut links: Vec<ChannelId> = self.linked().into_iter().collect();
        links.sort_unstable();
        ChannelState {
            channel_id: Some(self.id),
            parent: Some(self.parent),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            links: Some(links),
            links_add: Vec::new(),
            links_remove: Vec::new(),
            position: Some(self.position),
            temporary: Some(self.temporary),
            band: self.band,
        }
    }
}

/// Recognize band channels by their configured name ("80m", "20m", ...).
fn band_from_name(name: &str) -> Option<Band> {
    Band::from_label(name)
}

/// The channel tree plus the link overlay graph.
///
/// Kept behind the server's channel/ACL reader-writer lock; all methods here
/// are synchronous.
pub struct ChannelTree {
    channels: HashMap<ChannelId, ChannelEntry>,
    next_id: ChannelId,
}

impl ChannelTree {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(ROOT_CHANNEL, ChannelEntry::new(ROOT_CHANNEL, ROOT_CHANNEL, "Root"));
        Self {
            channels,
            next_id: 1,
        }
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelEntry> {
        self.channels.get_mut(&id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// All ids in stable (sorted) order.
    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a channel with a fixed id (config bootstrap). Fails when the
    /// id or the parent is missing.
    pub fn insert_with_id(
        &mut self,
        id: ChannelId,
        parent: ChannelId,
        name: &str,
    ) -> Option<ChannelId> {
        if self.channels.contains_key(&id) || !self.channels.contains_key(&parent) {
            return None;
        }
        self.channels.insert(id, ChannelEntry::new(id, parent, name));
        self.channels
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(id);
        self.next_id = self.next_id.max(id + 1);
        Some(id)
    }

    /// Create a channel with the next free id.
    pub fn add_channel(
        &mut self,
        parent: ChannelId,
        name: &str,
        temporary: bool,
    ) -> Option<ChannelId> {
        let id = self.next_id;
        let created = self.insert_with_id(id, parent, name)?;
        if let Some(entry) = self.channels.get_mut(&created) {
            entry.temporary = temporary;
        }
        Some(created)
    }

    /// Remove a channel and its whole subtree. The root cannot be removed.
    /// Returns the removed ids, deepest first.
    pub fn remove_subtree(&mut self, id: ChannelId) -> Vec<ChannelId> {
        if id == ROOT_CHANNEL || !self.channels.contains_key(&id) {
            return Vec::new();
        }
        let mut removed = self.descendants(id);
        removed.reverse();
        removed.push(id);

        for gone in &removed {
            self.channels.remove(gone);
        }
        // Unhook from the parent and clear dangling links.
        for entry in self.channels.values_mut() {
            entry.children.retain(|c| !removed.contains(c));
            for gone in &removed {
                entry.permanent_links.remove(gone);
                entry.dynamic_links.remove(gone);
            }
        }
        removed
    }

    /// Channel ids from the root down to `id`, inclusive. Empty when the id
    /// is unknown.
    pub fn path_from_root(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut path = Vec::new();
        let mut current = id;
        loop {
            let Some(entry) = self.channels.get(&current) else {
                return Vec::new();
            };
            path.push(current);
            if current == ROOT_CHANNEL {
                break;
            }
            current = entry.parent;
        }
        path.reverse();
        path
    }

    /// All descendant ids of a channel, depth-first.
    pub fn descendants(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut out = Vec::new();
        let mut stack: Vec<ChannelId> = match self.channels.get(&id) {
            Some(entry) => entry.children.clone(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            if let Some(entry) = self.channels.get(&next) {
                out.push(next);
                stack.extend(entry.children.iter().copied());
            }
        }
        out
    }

    /// Add a bidirectional permanent link.
    pub fn link(&mut self, a: ChannelId, b: ChannelId) -> bool {
        if a == b || !self.channels.contains_key(&a) || !self.channels.contains_key(&b) {
            return false;
        }
        self.channels.get_mut(&a).expect("checked").permanent_links.insert(b);
        self.channels.get_mut(&b).expect("checked").permanent_links.insert(a);
        true
    }

    /// Remove a permanent link in both directions.
    pub fn unlink(&mut self, a: ChannelId, b: ChannelId) -> bool {
        let mut removed = false;
        if let Some(entry) = self.channels.get_mut(&a) {
            removed |= entry.permanent_links.remove(&b);
        }
        if let Some(entry) = self.channels.get_mut(&b) {
            removed |= entry.permanent_links.remove(&a);
        }
        removed
    }

    /// Replace the dynamic link overlay between band channels: every pair of
    /// open-band channels is linked, everything else is dropped. Permanent
    /// links are untouched. Returns the ids whose link set changed.
    pub fn apply_open_bands(&mut self, open: &[Band]) -> Vec<ChannelId> {
        let band_channels: Vec<(ChannelId, Band)> = self
            .channels
            .values()
            .filter_map(|c| c.band.map(|b| (c.id, b)))
            .collect();

        let mut changed = Vec::new();
        for (id, band) in &band_channels {
            let desired: HashSet<ChannelId> = if open.contains(band) {
                band_channels
                    .iter()
                    .filter(|(other_id, other_band)| other_id != id && open.contains(other_band))
                    .map(|(other_id, _)| *other_id)
                    .collect()
            } else {
                HashSet::new()
            };
            let entry = self.channels.get_mut(id).expect("listed above");
            if entry.dynamic_links != desired {
                entry.dynamic_links = desired;
                changed.push(*id);
            }
        }
        changed.sort_unstable();
        changed
    }

    /// Channels whose audio a speaker in `id` reaches: the channel itself
    /// plus its link partners.
    pub fn audio_reach(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut out = vec![id];
        if let Some(entry) = self.channels.get(&id) {
            let mut linked: Vec<ChannelId> = entry.linked().into_iter().collect();
            linked.sort_unstable();
            out.extend(linked);
        }
        out
    }
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_bands() -> ChannelTree {
        let mut tree = ChannelTree::new();
        tree.insert_with_id(1, ROOT_CHANNEL, "160m").unwrap();
        tree.insert_with_id(2, ROOT_CHANNEL, "80m").unwrap();
        tree.insert_with_id(3, ROOT_CHANNEL, "40m").unwrap();
        tree.insert_with_id(4, ROOT_CHANNEL, "20m").unwrap();
        tree
    }

    #[test]
    fn root_always_exists() {
        let tree = ChannelTree::new();
        let root = tree.get(ROOT_CHANNEL).unwrap();
        assert_eq!(root.parent, ROOT_CHANNEL);
        assert!(root.band.is_none());
    }

    #[test]
    fn band_detection_from_name() {
        let tree = tree_with_bands();
        assert_eq!(tree.get(2).unwrap().band, Some(Band::Band80m));
        assert_eq!(tree.get(4).unwrap().band, Some(Band::Band20m));
        assert_eq!(band_from_name("lounge"), None);
        assert_eq!(band_from_name(" 40M "), Some(Band::Band40m));
    }

    #[test]
    fn insert_rejects_duplicates_and_orphans() {
        let mut tree = tree_with_bands();
        assert!(tree.insert_with_id(2, ROOT_CHANNEL, "dup").is_none());
        assert!(tree.insert_with_id(99, 42, "orphan").is_none());
    }

    #[test]
    fn add_channel_allocates_past_config_ids() {
        let mut tree = tree_with_bands();
        let id = tree.add_channel(ROOT_CHANNEL, "temp", true).unwrap();
        assert!(id > 4);
        assert!(tree.get(id).unwrap().temporary);
    }

    #[test]
    fn path_from_root_walks_ancestry() {
        let mut tree = tree_with_bands();
        let sub = tree.add_channel(3, "dx corner", false).unwrap();
        assert_eq!(tree.path_from_root(sub), vec![ROOT_CHANNEL, 3, sub]);
        assert_eq!(tree.path_from_root(ROOT_CHANNEL), vec![ROOT_CHANNEL]);
        assert!(tree.path_from_root(404).is_empty());
    }

    #[test]
    fn descendants_collects_subtree() {
        let mut tree = tree_with_bands();
        let a = tree.add_channel(3, "a", false).unwrap();
        let b = tree.add_channel(a, "b", false).unwrap();
        let mut desc = tree.descendants(3);
        desc.sort_unstable();
        assert_eq!(desc, vec![a, b]);
    }

    #[test]
    fn remove_subtree_cleans_links_and_children() {
        let mut tree = tree_with_bands();
        let a = tree.add_channel(3, "a", false).unwrap();
        tree.link(a, 2);
        let removed = tree.remove_subtree(3);
        assert!(removed.contains(&3) && removed.contains(&a));
        assert!(!tree.contains(3));
        assert!(!tree.get(2).unwrap().permanent_links.contains(&a));
        assert!(!tree.get(ROOT_CHANNEL).unwrap().children.contains(&3));
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut tree = ChannelTree::new();
        assert!(tree.remove_subtree(ROOT_CHANNEL).is_empty());
        assert!(tree.contains(ROOT_CHANNEL));
    }

    #[test]
    fn links_are_bidirectional() {
        let mut tree = tree_with_bands();
        assert!(tree.link(2, 3));
        assert!(tree.get(2).unwrap().permanent_links.contains(&3));
        assert!(tree.get(3).unwrap().permanent_links.contains(&2));
        assert!(tree.unlink(3, 2));
        assert!(tree.get(2).unwrap().permanent_links.is_empty());
        assert!(!tree.link(2, 2));
    }

    #[test]
    fn open_bands_link_pairs() {
        let mut tree = tree_with_bands();
        let changed = tree.apply_open_bands(&[Band::Band80m, Band::Band40m]);
        assert_eq!(changed, vec![2, 3]);
        assert!(tree.get(2).unwrap().dynamic_links.contains(&3));
        assert!(tree.get(3).unwrap().dynamic_links.contains(&2));
        assert!(tree.get(4).unwrap().dynamic_links.is_empty());

        // Conditions collapse: dynamic links drop, permanent ones stay.
        tree.link(2, 4);
        let changed = tree.apply_open_bands(&[]);
        assert_eq!(changed, vec![2, 3]);
        assert!(tree.get(2).unwrap().dynamic_links.is_empty());
        assert!(tree.get(2).unwrap().permanent_links.contains(&4));
    }

    #[test]
    fn audio_reach_includes_links() {
        let mut tree = tree_with_bands();
        tree.link(3, 4);
        tree.apply_open_bands(&[Band::Band160m, Band::Band40m]);
        let reach = tree.audio_reach(3);
        assert!(reach.contains(&3));
        assert!(reach.contains(&4), "permanent link");
        assert!(reach.contains(&1), "dynamic link");
        assert_eq!(reach[0], 3);
    }

    #[test]
    fn to_state_carries_links_sorted() {
        let mut tree = tree_with_bands();
        tree.link(3, 4);
        tree.link(3, 1);
        let state = tree.get(3).unwrap().to_state();
        assert_eq!(state.links, Some(vec![1, 4]));
        assert_eq!(state.band, Some(Band::Band40m));
        assert_eq!(state.parent, Some(ROOT_CHANNEL));
    }
}
