use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::JsonStore;

pub type ProfileId = String;

pub const PROFILES_KEY: &str = "profiles";

/// One tenant. Created and owned by the admin surface; the core only reads
/// the list and maintains the unread counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub unread_count: u64,
}

pub fn load_profiles(store: &Arc<JsonStore>) -> Vec<Profile> {
    store.get(PROFILES_KEY)
}

pub fn save_profiles(store: &Arc<JsonStore>, profiles: &[Profile]) {
    store.set(PROFILES_KEY, &profiles);
}

/// Seed the default profile on a fresh data directory.
pub fn seed_default(store: &Arc<JsonStore>) -> Vec<Profile> {
    let mut profiles = load_profiles(store);
    if profiles.is_empty() {
        profiles.push(Profile {
            id: "default".to_string(),
            name: "Default Profile".to_string(),
            unread_count: 0,
        });
        save_profiles(store, &profiles);
    }
    profiles
}

/// Bump the unread counter for one profile. Unknown ids are ignored.
pub fn bump_unread(store: &Arc<JsonStore>, profile_id: &str) {
    let mut profiles = load_profiles(store);
    let mut changed = false;
    for profile in profiles.iter_mut() {
        if profile.id == profile_id {
            profile.unread_count += 1;
            changed = true;
        }
    }
    if changed {
        save_profiles(store, &profiles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn seed_creates_default_once() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let first = seed_default(&store);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "default");

        // A second seed leaves the list alone.
        let second = seed_default(&store);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn bump_unread_only_touches_matching_profile() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        save_profiles(
            &store,
            &[
                Profile { id: "a".into(), name: "A".into(), unread_count: 0 },
                Profile { id: "b".into(), name: "B".into(), unread_count: 2 },
            ],
        );

        bump_unread(&store, "b");
        bump_unread(&store, "missing");

        let profiles = load_profiles(&store);
        assert_eq!(profiles[0].unread_count, 0);
        assert_eq!(profiles[1].unread_count, 3);
    }
}
