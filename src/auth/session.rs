use std::sync::Arc;

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use time::{Duration, OffsetDateTime};
use tower_cookies::{cookie::SameSite, Cookie, Key, SignedCookies};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::repo::{SessionStore, StoreResult};
use crate::auth::repo_types::{SessionId, SessionRecord};

pub const SESSION_COOKIE: &str = "invoicely_session";
const SESSION_ID_LEN: usize = 48;

/// Server-side session lifecycle: `establish` -> active -> `destroy` or expiry.
/// Sessions are never extended.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn establish(&self, user_id: Uuid) -> StoreResult<SessionId> {
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            id: new_session_id(),
            user_id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.insert(&record).await?;
        info!(user_id = %user_id, session = %record.id, "session established");
        Ok(record.id)
    }

    pub async fn resolve(&self, id: &SessionId) -> StoreResult<Option<Uuid>> {
        let Some(record) = self.store.get(id).await? else {
            debug!(session = %id, "unknown session");
            return Ok(None);
        };
        if record.is_expired(OffsetDateTime::now_utc()) {
            debug!(session = %id, user_id = %record.user_id, "session expired");
            self.store.delete(id).await?;
            return Ok(None);
        }
        Ok(Some(record.user_id))
    }

    pub async fn destroy(&self, id: &SessionId) -> StoreResult<()> {
        if self.store.delete(id).await? {
            info!(session = %id, "session destroyed");
        } else {
            debug!(session = %id, "destroy of absent session");
        }
        Ok(())
    }

    pub async fn purge_expired(&self) -> StoreResult<u64> {
        self.store.purge_expired(OffsetDateTime::now_utc()).await
    }
}

fn new_session_id() -> SessionId {
    SessionId(
        OsRng
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect(),
    )
}

/// Reads the session id from the signed session cookie, if present and intact.
pub fn session_from_cookies(cookies: &SignedCookies<'_>) -> Option<SessionId> {
    cookies
        .get(SESSION_COOKIE)
        .map(|c| SessionId(c.value().to_string()))
        .filter(|id| !id.0.is_empty())
}

pub fn set_session_cookie(cookies: &SignedCookies<'_>, id: &SessionId, max_age: Duration, secure: bool) {
    let cookie = Cookie::build((SESSION_COOKIE, id.0.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(max_age)
        .build();
    cookies.add(cookie);
}

pub fn clear_session_cookie(cookies: &SignedCookies<'_>) {
    let cookie = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .max_age(Duration::ZERO)
        .build();
    cookies.add(cookie);
}

/// Derives the cookie signing key from the configured session secret
/// (at least 32 bytes, checked when the configuration is loaded).
pub fn cookie_key(secret: &str) -> Key {
    Key::derive_from(secret.as_bytes())
}
