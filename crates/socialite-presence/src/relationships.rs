use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::identity::{PartyId, UserId};

/// Cached friend lists and party member lists.
///
/// Lists are replaced whole; a reader sees either the previous or the new
/// list for a key. Misses return an empty list and mean "no data yet".
#[derive(Default)]
pub struct RelationshipCache {
    friends: ListMap<UserId>,
    members: ListMap<PartyId>,
}

impl RelationshipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_friends(&self, user: UserId, friends: impl IntoIterator<Item = UserId>) {
        self.friends.replace(user, friends);
    }

    pub fn friends_of(&self, user: &UserId) -> Arc<[UserId]> {
        self.friends.get(user)
    }

    pub fn replace_members(&self, party: PartyId, members: impl IntoIterator<Item = UserId>) {
        self.members.replace(party, members);
    }

    pub fn members_of(&self, party: &PartyId) -> Arc<[UserId]> {
        self.members.get(party)
    }

    /// Installs a complete friend-list snapshot; users missing from it are
    /// dropped. Returns the number of lists written.
    pub fn refresh_friends(&self, snapshot: HashMap<UserId, Vec<UserId>>) -> usize {
        self.friends.swap_all(snapshot)
    }

    /// Installs a complete party-membership snapshot; parties missing from it
    /// are dropped. Returns the number of lists written.
    pub fn refresh_members(&self, snapshot: HashMap<PartyId, Vec<UserId>>) -> usize {
        self.members.swap_all(snapshot)
    }

    pub fn friend_list_count(&self) -> usize {
        self.friends.len()
    }

    pub fn party_count(&self) -> usize {
        self.members.len()
    }
}

struct ListMap<K> {
    inner: RwLock<HashMap<K, Arc<[UserId]>>>,
}

impl<K> Default for ListMap<K> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> ListMap<K> {
    fn replace(&self, key: K, list: impl IntoIterator<Item = UserId>) {
        let list = dedup(list);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(key, list);
    }

    fn get(&self, key: &K) -> Arc<[UserId]> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(key)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    fn swap_all(&self, snapshot: HashMap<K, Vec<UserId>>) -> usize {
        let fresh: HashMap<K, Arc<[UserId]>> = snapshot
            .into_iter()
            .map(|(key, list)| (key, dedup(list)))
            .collect();
        let written = fresh.len();
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
        written
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn dedup(list: impl IntoIterator<Item = UserId>) -> Arc<[UserId]> {
    let mut out: Vec<UserId> = list.into_iter().collect();
    out.sort();
    out.dedup();
    Arc::from(out)
}
