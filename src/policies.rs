//! Policy records and the role-filtered repository over the `policies` table.
//! The repository re-enforces the authorization gate at this trust boundary;
//! any client-side gating is advisory only.

use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::{can, Action, Principal, Role};
use crate::storage::{now_ms, SharedStore, Store};

pub const POLICIES_TABLE: &str = "policies";

/// Fixed starter set; the column itself is free-form so new categories can be
/// introduced without a migration.
pub const CATEGORIES: &[&str] = &[
    "Infection Control",
    "Medication Management",
    "Emergency Procedures",
    "Documentation",
    "Patient Care",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Draft,
    Archived,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Draft => "draft",
            PolicyStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<PolicyStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(PolicyStatus::Active),
            "draft" => Some(PolicyStatus::Draft),
            "archived" => Some(PolicyStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned document record. `created_by` is stamped once at creation and
/// never altered; timestamps are server-assigned epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub status: PolicyStatus,
    pub version: String,
    pub content: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Caller-supplied fields for a new policy. Note there is deliberately no
/// `created_by` here: the repository stamps it from the acting identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub title: String,
    pub description: String,
    pub category: String,
    pub status: PolicyStatus,
    pub version: String,
    pub content: String,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<PolicyStatus>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

fn policies_to_df(rows: &[Policy]) -> Result<DataFrame> {
    let ids = Series::new("id".into(), rows.iter().map(|p| p.id.clone()).collect::<Vec<_>>());
    let titles = Series::new("title".into(), rows.iter().map(|p| p.title.clone()).collect::<Vec<_>>());
    let descriptions = Series::new("description".into(), rows.iter().map(|p| p.description.clone()).collect::<Vec<_>>());
    let categories = Series::new("category".into(), rows.iter().map(|p| p.category.clone()).collect::<Vec<_>>());
    let statuses = Series::new("status".into(), rows.iter().map(|p| p.status.as_str().to_string()).collect::<Vec<_>>());
    let versions = Series::new("version".into(), rows.iter().map(|p| p.version.clone()).collect::<Vec<_>>());
    let contents = Series::new("content".into(), rows.iter().map(|p| p.content.clone()).collect::<Vec<_>>());
    let creators = Series::new("created_by".into(), rows.iter().map(|p| p.created_by.clone()).collect::<Vec<Option<String>>>());
    let created = Series::new("created_at".into(), rows.iter().map(|p| p.created_at).collect::<Vec<_>>());
    let updated = Series::new("updated_at".into(), rows.iter().map(|p| p.updated_at).collect::<Vec<_>>());
    Ok(DataFrame::new(vec![
        ids.into(), titles.into(), descriptions.into(), categories.into(), statuses.into(),
        versions.into(), contents.into(), creators.into(), created.into(), updated.into(),
    ])?)
}

fn df_to_policies(df: &DataFrame) -> Result<Vec<Policy>> {
    let ids = df.column("id")?.str()?;
    let titles = df.column("title")?.str()?;
    let descriptions = df.column("description")?.str()?;
    let categories = df.column("category")?.str()?;
    let statuses = df.column("status")?.str()?;
    let versions = df.column("version")?.str()?;
    let contents = df.column("content")?.str()?;
    let creators = df.column("created_by")?.str()?;
    let created = df.column("created_at")?.i64()?;
    let updated = df.column("updated_at")?.i64()?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        out.push(Policy {
            id: ids.get(i).unwrap_or_default().to_string(),
            title: titles.get(i).unwrap_or_default().to_string(),
            description: descriptions.get(i).unwrap_or_default().to_string(),
            category: categories.get(i).unwrap_or_default().to_string(),
            // Unknown status strings are treated as draft so they stay
            // invisible to staff rather than leaking.
            status: statuses.get(i).and_then(PolicyStatus::parse).unwrap_or(PolicyStatus::Draft),
            version: versions.get(i).unwrap_or_default().to_string(),
            content: contents.get(i).unwrap_or_default().to_string(),
            created_by: creators.get(i).map(|s| s.to_string()),
            created_at: created.get(i).unwrap_or(0),
            updated_at: updated.get(i).unwrap_or(0),
        });
    }
    Ok(out)
}

#[derive(Clone)]
pub struct PolicyRepository {
    store: SharedStore,
}

impl PolicyRepository {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    fn load(store: &Store) -> Result<Vec<Policy>> {
        match store.read_table(POLICIES_TABLE)? {
            Some(df) => df_to_policies(&df),
            None => Ok(Vec::new()),
        }
    }

    fn save(store: &Store, rows: &[Policy]) -> Result<()> {
        store.write_table(POLICIES_TABLE, policies_to_df(rows)?)
    }

    /// Role-filtered listing, most-recently-updated first. Staff only ever
    /// see active records; admins see everything.
    pub fn list(&self, role: Role) -> AppResult<Vec<Policy>> {
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        rows.retain(|p| can(role, Action::ReadPolicy(p.status)));
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    pub fn get(&self, id: &str, role: Role) -> AppResult<Policy> {
        let guard = self.store.0.lock();
        let rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let Some(p) = rows.into_iter().find(|p| p.id == id) else {
            return Err(AppError::not_found("policy_not_found", "no policy with that id"));
        };
        if !can(role, Action::ReadPolicy(p.status)) {
            // Deliberately indistinguishable from a missing record so staff
            // cannot probe for drafts.
            return Err(AppError::not_found("policy_not_found", "no policy with that id"));
        }
        Ok(p)
    }

    /// Create a policy, stamping `created_by` from the acting identity.
    /// Caller-supplied creator values never reach this signature.
    pub fn create(&self, draft: PolicyDraft, actor: &Principal) -> AppResult<Policy> {
        if !can(actor.role, Action::CreatePolicy) {
            return Err(AppError::forbidden("admin_only", "only admins can create policies"));
        }
        if draft.title.trim().is_empty() {
            return Err(AppError::validation("title_required", "policy title is required"));
        }
        let now = now_ms();
        let policy = Policy {
            id: uuid::Uuid::new_v4().to_string(),
            title: draft.title,
            description: draft.description,
            category: draft.category,
            status: draft.status,
            version: draft.version,
            content: draft.content,
            created_by: Some(actor.user_id.clone()),
            created_at: now,
            updated_at: now,
        };
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        rows.push(policy.clone());
        Self::save(&guard, &rows).map_err(|e| AppError::write("write_error", e.to_string()))?;
        info!(target: "policydesk::policies", "policy.create id={} by={}", policy.id, actor.user_id);
        Ok(policy)
    }

    /// Partial update; refreshes `updated_at`, leaves `created_by` and
    /// `created_at` untouched.
    pub fn update(&self, id: &str, patch: PolicyPatch, actor: &Principal) -> AppResult<Policy> {
        if !can(actor.role, Action::UpdatePolicy) {
            return Err(AppError::forbidden("admin_only", "only admins can update policies"));
        }
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let Some(p) = rows.iter_mut().find(|p| p.id == id) else {
            return Err(AppError::not_found("policy_not_found", "no policy with that id"));
        };
        if let Some(title) = patch.title { p.title = title; }
        if let Some(description) = patch.description { p.description = description; }
        if let Some(category) = patch.category { p.category = category; }
        if let Some(status) = patch.status { p.status = status; }
        if let Some(version) = patch.version { p.version = version; }
        if let Some(content) = patch.content { p.content = content; }
        p.updated_at = now_ms();
        let updated = p.clone();
        Self::save(&guard, &rows).map_err(|e| AppError::write("write_error", e.to_string()))?;
        info!(target: "policydesk::policies", "policy.update id={} by={}", id, actor.user_id);
        Ok(updated)
    }

    pub fn delete(&self, id: &str, actor: &Principal) -> AppResult<()> {
        if !can(actor.role, Action::DeletePolicy) {
            return Err(AppError::forbidden("admin_only", "only admins can delete policies"));
        }
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let before = rows.len();
        rows.retain(|p| p.id != id);
        if rows.len() == before {
            return Err(AppError::not_found("policy_not_found", "no policy with that id"));
        }
        Self::save(&guard, &rows).map_err(|e| AppError::write("write_error", e.to_string()))?;
        info!(target: "policydesk::policies", "policy.delete id={} by={}", id, actor.user_id);
        Ok(())
    }

    /// Insert-or-replace keyed by id, preserving the supplied timestamps and
    /// creator. Operational path for the bulk importer; the HTTP boundary in
    /// front of it is admin-gated.
    pub fn upsert_imported(&self, row: Policy) -> AppResult<()> {
        let guard = self.store.0.lock();
        let mut rows = Self::load(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        rows.retain(|p| p.id != row.id);
        rows.push(row);
        Self::save(&guard, &rows).map_err(|e| AppError::write("write_error", e.to_string()))?;
        Ok(())
    }

    /// Seed a small starter set on a completely empty store so a fresh
    /// install has something to render.
    pub fn seed_demo_policies(&self, created_by: &str) -> Result<()> {
        {
            let guard = self.store.0.lock();
            if guard.table_exists(POLICIES_TABLE) { return Ok(()); }
        }
        let now = now_ms();
        let samples = [
            ("Hand Hygiene Policy", "Infection Control", PolicyStatus::Active,
             "All staff must perform hand hygiene before and after every episode of patient contact."),
            ("Controlled Drugs Storage", "Medication Management", PolicyStatus::Active,
             "Controlled drugs are stored in the locked cabinet and checked at every shift change."),
            ("Fire Evacuation Procedure", "Emergency Procedures", PolicyStatus::Draft,
             "On hearing the continuous alarm, evacuate patients via the nearest marked route."),
        ];
        let rows: Vec<Policy> = samples
            .iter()
            .enumerate()
            .map(|(i, (title, category, status, content))| Policy {
                id: uuid::Uuid::new_v4().to_string(),
                title: title.to_string(),
                description: format!("{title} for all clinical areas"),
                category: category.to_string(),
                status: *status,
                version: "1.0".to_string(),
                content: content.to_string(),
                created_by: Some(created_by.to_string()),
                created_at: now - i as i64,
                updated_at: now - i as i64,
            })
            .collect();
        let guard = self.store.0.lock();
        Self::save(&guard, &rows)?;
        info!(target: "policydesk::policies", "seeded {} demo policies", rows.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, PolicyRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, PolicyRepository::new(shared))
    }

    fn admin() -> Principal {
        Principal { user_id: "admin-1".into(), email: "admin@example.test".into(), role: Role::Admin }
    }

    fn staff() -> Principal {
        Principal { user_id: "staff-1".into(), email: "staff@example.test".into(), role: Role::Staff }
    }

    fn draft(title: &str, status: PolicyStatus) -> PolicyDraft {
        PolicyDraft {
            title: title.into(),
            description: "desc".into(),
            category: "Documentation".into(),
            status,
            version: "1.0".into(),
            content: "body".into(),
        }
    }

    #[test]
    fn staff_list_contains_only_active() {
        let (_tmp, repo) = repo();
        repo.create(draft("a", PolicyStatus::Active), &admin()).unwrap();
        repo.create(draft("d", PolicyStatus::Draft), &admin()).unwrap();
        repo.create(draft("x", PolicyStatus::Archived), &admin()).unwrap();

        let staff_view = repo.list(Role::Staff).unwrap();
        assert!(staff_view.iter().all(|p| p.status == PolicyStatus::Active));
        assert_eq!(staff_view.len(), 1);

        let admin_view = repo.list(Role::Admin).unwrap();
        assert_eq!(admin_view.len(), 3);
        // admin view is a superset of the staff view
        for p in &staff_view {
            assert!(admin_view.iter().any(|q| q.id == p.id));
        }
    }

    #[test]
    fn list_orders_by_updated_at_descending() {
        let (_tmp, repo) = repo();
        let first = repo.create(draft("first", PolicyStatus::Active), &admin()).unwrap();
        let second = repo.create(draft("second", PolicyStatus::Active), &admin()).unwrap();
        // bump the older record so it sorts to the front
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.update(&first.id, PolicyPatch { version: Some("1.1".into()), ..Default::default() }, &admin()).unwrap();

        let listed = repo.list(Role::Admin).unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
        assert!(listed[0].updated_at >= listed[1].updated_at);
    }

    #[test]
    fn create_stamps_creator_from_actor() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("a", PolicyStatus::Active), &admin()).unwrap();
        assert_eq!(p.created_by.as_deref(), Some("admin-1"));
        assert_eq!(p.created_at, p.updated_at);
    }

    #[test]
    fn staff_cannot_mutate() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("a", PolicyStatus::Active), &admin()).unwrap();
        assert_eq!(repo.create(draft("b", PolicyStatus::Active), &staff()).unwrap_err().code_str(), "admin_only");
        assert_eq!(repo.update(&p.id, PolicyPatch::default(), &staff()).unwrap_err().code_str(), "admin_only");
        assert_eq!(repo.delete(&p.id, &staff()).unwrap_err().code_str(), "admin_only");
        // nothing changed
        assert_eq!(repo.list(Role::Admin).unwrap().len(), 1);
    }

    #[test]
    fn update_refreshes_updated_at_and_keeps_creator() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("a", PolicyStatus::Draft), &admin()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let q = repo
            .update(&p.id, PolicyPatch { status: Some(PolicyStatus::Active), ..Default::default() }, &admin())
            .unwrap();
        assert_eq!(q.status, PolicyStatus::Active);
        assert_eq!(q.title, "a");
        assert_eq!(q.created_by, p.created_by);
        assert_eq!(q.created_at, p.created_at);
        assert!(q.updated_at > p.updated_at);
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let (_tmp, repo) = repo();
        let err = repo.update("nope", PolicyPatch::default(), &admin()).unwrap_err();
        assert_eq!(err.code_str(), "policy_not_found");
    }

    #[test]
    fn staff_get_of_draft_reads_as_missing() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("d", PolicyStatus::Draft), &admin()).unwrap();
        assert_eq!(repo.get(&p.id, Role::Staff).unwrap_err().code_str(), "policy_not_found");
        assert_eq!(repo.get(&p.id, Role::Admin).unwrap().id, p.id);
    }

    #[test]
    fn delete_removes_the_record() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("a", PolicyStatus::Active), &admin()).unwrap();
        repo.delete(&p.id, &admin()).unwrap();
        assert!(repo.list(Role::Admin).unwrap().is_empty());
        assert_eq!(repo.delete(&p.id, &admin()).unwrap_err().code_str(), "policy_not_found");
    }

    #[test]
    fn draft_then_publish_scenario() {
        let (_tmp, repo) = repo();
        let p = repo.create(draft("new policy", PolicyStatus::Draft), &admin()).unwrap();
        assert!(repo.list(Role::Staff).unwrap().is_empty());
        assert_eq!(repo.list(Role::Admin).unwrap().len(), 1);

        repo.update(&p.id, PolicyPatch { status: Some(PolicyStatus::Active), ..Default::default() }, &admin()).unwrap();
        assert_eq!(repo.list(Role::Staff).unwrap().len(), 1);
    }

    #[test]
    fn upsert_imported_replaces_by_id() {
        let (_tmp, repo) = repo();
        let row = Policy {
            id: "fixed-id".into(),
            title: "imported".into(),
            description: String::new(),
            category: "Documentation".into(),
            status: PolicyStatus::Active,
            version: "2.0".into(),
            content: "text".into(),
            created_by: None,
            created_at: 10,
            updated_at: 20,
        };
        repo.upsert_imported(row.clone()).unwrap();
        let mut replacement = row.clone();
        replacement.title = "imported v2".into();
        repo.upsert_imported(replacement).unwrap();
        let listed = repo.list(Role::Admin).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "imported v2");
        // imported timestamps are preserved as-is
        assert_eq!(listed[0].created_at, 10);
        assert_eq!(listed[0].updated_at, 20);
    }
}
