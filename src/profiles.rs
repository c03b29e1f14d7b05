//! Per-user display profiles backed by the `profiles` table. Strictly
//! self-service: the acting identity can only read and write its own row,
//! and the role field is not reachable from here at all.

use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::{can, Action, Principal};
use crate::storage::{SharedStore, Store};

pub const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub department: Option<String>,
}

/// Partial profile update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

fn profiles_to_df(rows: &[Profile]) -> Result<DataFrame> {
    let ids = Series::new("user_id".into(), rows.iter().map(|p| p.user_id.clone()).collect::<Vec<_>>());
    let names = Series::new("display_name".into(), rows.iter().map(|p| p.display_name.clone()).collect::<Vec<Option<String>>>());
    let departments = Series::new("department".into(), rows.iter().map(|p| p.department.clone()).collect::<Vec<Option<String>>>());
    Ok(DataFrame::new(vec![ids.into(), names.into(), departments.into()])?)
}

fn df_to_profiles(df: &DataFrame) -> Result<Vec<Profile>> {
    let ids = df.column("user_id")?.str()?;
    let names = df.column("display_name")?.str()?;
    let departments = df.column("department")?.str()?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        out.push(Profile {
            user_id: ids.get(i).unwrap_or_default().to_string(),
            display_name: names.get(i).map(|s| s.to_string()),
            department: departments.get(i).map(|s| s.to_string()),
        });
    }
    Ok(out)
}

#[derive(Clone)]
pub struct ProfileStore {
    store: SharedStore,
}

impl ProfileStore {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    fn load(store: &Store) -> Result<Vec<Profile>> {
        match store.read_table(PROFILES_TABLE)? {
            Some(df) => df_to_profiles(&df),
            None => Ok(Vec::new()),
        }
    }

    /// Fetch the caller's own profile. Missing rows read as an empty profile
    /// so a fresh account renders without a separate provisioning step.
    pub fn get(&self, actor: &Principal, user_id: &str) -> AppResult<Profile> {
        let own = actor.user_id == user_id;
        if !can(actor.role, Action::ReadProfile { own }) {
            return Err(AppError::forbidden("own_profile_only", "profiles are self-service"));
        }
        let guard = self.store.0.lock();
        let rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        Ok(rows
            .into_iter()
            .find(|p| p.user_id == user_id)
            .unwrap_or_else(|| Profile { user_id: user_id.to_string(), ..Profile::default() }))
    }

    pub fn update(&self, actor: &Principal, user_id: &str, patch: ProfilePatch) -> AppResult<Profile> {
        let own = actor.user_id == user_id;
        if !can(actor.role, Action::UpdateProfile { own }) {
            return Err(AppError::forbidden("own_profile_only", "profiles are self-service"));
        }
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let idx = match rows.iter().position(|p| p.user_id == user_id) {
            Some(i) => i,
            None => {
                rows.push(Profile { user_id: user_id.to_string(), ..Profile::default() });
                rows.len() - 1
            }
        };
        let row = &mut rows[idx];
        if let Some(display_name) = patch.display_name { row.display_name = Some(display_name); }
        if let Some(department) = patch.department { row.department = Some(department); }
        let updated = row.clone();
        Self::save(&guard, &rows).map_err(|e| AppError::write("write_error", e.to_string()))?;
        info!(target: "policydesk::profiles", "profile.update user={}", user_id);
        Ok(updated)
    }

    fn save(store: &Store, rows: &[Profile]) -> Result<()> {
        store.write_table(PROFILES_TABLE, profiles_to_df(rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn profiles() -> (tempfile::TempDir, ProfileStore) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, ProfileStore::new(shared))
    }

    fn actor(id: &str, role: Role) -> Principal {
        Principal { user_id: id.into(), email: format!("{id}@example.test"), role }
    }

    #[test]
    fn missing_profile_reads_as_empty() {
        let (_tmp, store) = profiles();
        let me = actor("u1", Role::Staff);
        let p = store.get(&me, "u1").unwrap();
        assert_eq!(p.user_id, "u1");
        assert!(p.display_name.is_none());
        assert!(p.department.is_none());
    }

    #[test]
    fn update_creates_then_patches() {
        let (_tmp, store) = profiles();
        let me = actor("u1", Role::Staff);
        store
            .update(&me, "u1", ProfilePatch { display_name: Some("Alex".into()), department: None })
            .unwrap();
        let p = store
            .update(&me, "u1", ProfilePatch { display_name: None, department: Some("Ward 3".into()) })
            .unwrap();
        assert_eq!(p.display_name.as_deref(), Some("Alex"));
        assert_eq!(p.department.as_deref(), Some("Ward 3"));
    }

    #[test]
    fn other_users_profile_is_off_limits_even_for_admin() {
        let (_tmp, store) = profiles();
        let admin = actor("boss", Role::Admin);
        assert_eq!(store.get(&admin, "u1").unwrap_err().code_str(), "own_profile_only");
        let err = store.update(&admin, "u1", ProfilePatch::default()).unwrap_err();
        assert_eq!(err.code_str(), "own_profile_only");
    }
}
