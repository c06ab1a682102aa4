use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, SessionId, SessionRecord, StoreError, User};

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence of user accounts. Implementations must enforce uniqueness of
/// `email` (case-insensitive) and `external_id` themselves and report a
/// violation as [`StoreError::Conflict`].
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>>;
    async fn insert(&self, user: NewUser) -> StoreResult<User>;
    /// Attach a provider identity to an existing account. `avatar_url` is only
    /// overwritten when a new value is given.
    async fn update_link_fields(
        &self,
        id: Uuid,
        external_id: &str,
        avatar_url: Option<&str>,
    ) -> StoreResult<User>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &SessionRecord) -> StoreResult<()>;
    async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>>;
    /// Returns whether a record was actually removed.
    async fn delete(&self, id: &SessionId) -> StoreResult<bool>;
    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64>;
}

const USER_COLUMNS: &str =
    "id, display_name, email, password_hash, external_id, avatar_url, created_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn insert(&self, user: NewUser) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (display_name, email, password_hash, external_id, avatar_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.external_id)
        .bind(&user.avatar_url)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update_link_fields(
        &self,
        id: Uuid,
        external_id: &str,
        avatar_url: Option<&str>,
    ) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET external_id = $2,
                   avatar_url = COALESCE($3, avatar_url)
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(external_id)
        .bind(avatar_url)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }
}

#[derive(Clone)]
pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &SessionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&session.id.0)
        .bind(session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, user_id, created_at, expires_at
              FROM sessions
             WHERE id = $1
            "#,
        )
        .bind(&id.0)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn delete(&self, id: &SessionId) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(&id.0)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}
