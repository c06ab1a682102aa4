//! In-memory stores, used when no `DATABASE_URL` is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::repo::{SessionStore, StoreResult, UserStore};
use crate::auth::repo_types::{NewUser, SessionId, SessionRecord, StoreError, User};

#[derive(Default)]
struct UserTables {
    users: HashMap<Uuid, User>,
    by_email: HashMap<String, Uuid>,
    by_external_id: HashMap<String, Uuid>,
}

/// In-memory user store. All writes go through one lock, so the uniqueness
/// checks and the insert are atomic.
#[derive(Default)]
pub struct InMemoryUserStore {
    tables: RwLock<UserTables>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.tables.read().await.users.len()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_email
            .get(&email.to_lowercase())
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_external_id
            .get(external_id)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn insert(&self, new: NewUser) -> StoreResult<User> {
        let mut tables = self.tables.write().await;
        let email = new.email.to_lowercase();
        if tables.by_email.contains_key(&email) {
            return Err(StoreError::Conflict);
        }
        if let Some(ext) = &new.external_id {
            if tables.by_external_id.contains_key(ext) {
                return Err(StoreError::Conflict);
            }
        }

        let user = User {
            id: Uuid::new_v4(),
            display_name: new.display_name,
            email: email.clone(),
            password_hash: new.password_hash,
            external_id: new.external_id,
            avatar_url: new.avatar_url,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.by_email.insert(email, user.id);
        if let Some(ext) = &user.external_id {
            tables.by_external_id.insert(ext.clone(), user.id);
        }
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_link_fields(
        &self,
        id: Uuid,
        external_id: &str,
        avatar_url: Option<&str>,
    ) -> StoreResult<User> {
        let mut tables = self.tables.write().await;
        if let Some(owner) = tables.by_external_id.get(external_id) {
            if *owner != id {
                return Err(StoreError::Conflict);
            }
        }

        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        let previous = user.external_id.replace(external_id.to_string());
        if let Some(url) = avatar_url {
            user.avatar_url = Some(url.to_string());
        }
        let updated = user.clone();

        if let Some(prev) = previous {
            tables.by_external_id.remove(&prev);
        }
        tables.by_external_id.insert(external_id.to_string(), id);
        Ok(updated)
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &SessionRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &SessionId) -> StoreResult<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(email: &str) -> NewUser {
        NewUser {
            display_name: "Jane Doe".into(),
            email: email.into(),
            password_hash: Some("hash".into()),
            external_id: None,
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn email_is_unique_case_insensitively() {
        let store = InMemoryUserStore::new();
        store.insert(local("jane@x.com")).await.expect("first insert");
        let err = store.insert(local("JANE@x.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        assert!(store.find_by_email("Jane@X.com").await.unwrap().is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn external_id_cannot_be_bound_to_two_users() {
        let store = InMemoryUserStore::new();
        let a = store.insert(local("a@x.com")).await.unwrap();
        let b = store.insert(local("b@x.com")).await.unwrap();
        store.update_link_fields(a.id, "ext-1", None).await.unwrap();

        let err = store.update_link_fields(b.id, "ext-1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        let linked = store.find_by_external_id("ext-1").await.unwrap().unwrap();
        assert_eq!(linked.id, a.id);
    }

    #[tokio::test]
    async fn link_keeps_avatar_when_none_given() {
        let store = InMemoryUserStore::new();
        let a = store.insert(local("a@x.com")).await.unwrap();
        store
            .update_link_fields(a.id, "ext-1", Some("https://img/a.png"))
            .await
            .unwrap();
        let again = store.update_link_fields(a.id, "ext-1", None).await.unwrap();
        assert_eq!(again.avatar_url.as_deref(), Some("https://img/a.png"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_sessions() {
        let store = InMemorySessionStore::new();
        let now = OffsetDateTime::now_utc();
        for (id, offset) in [("old", -10), ("fresh", 3600)] {
            store
                .insert(&SessionRecord {
                    id: SessionId(id.into()),
                    user_id: Uuid::new_v4(),
                    created_at: now,
                    expires_at: now + time::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.get(&SessionId("fresh".into())).await.unwrap().is_some());
        assert!(store.get(&SessionId("old".into())).await.unwrap().is_none());
    }
}
