use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::FromRef;
use sqlx::postgres::PgPoolOptions;
use tower_cookies::Key;
use tracing::{info, warn};

use crate::auth::memory::{InMemorySessionStore, InMemoryUserStore};
use crate::auth::oauth::{GoogleProvider, IdentityProvider};
use crate::auth::repo::{PgSessionStore, PgUserStore, SessionStore, UserStore};
use crate::auth::services::AuthGateway;
use crate::auth::session::{cookie_key, SessionManager};
use crate::config::AppConfig;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<AuthGateway>,
    pub cookie_key: Key,
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let (users, sessions): (Arc<dyn UserStore>, Arc<dyn SessionStore>) =
            match &config.database_url {
                Some(url) => {
                    let db = PgPoolOptions::new()
                        .max_connections(10)
                        .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
                        .connect(url)
                        .await
                        .context("connect to database")?;

                    // Run migrations if present
                    if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
                        warn!(error = %e, "migration failed; continuing");
                    }

                    (
                        Arc::new(PgUserStore::new(db.clone())),
                        Arc::new(PgSessionStore::new(db)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; accounts and sessions live in memory only");
                    (
                        Arc::new(InMemoryUserStore::new()),
                        Arc::new(InMemorySessionStore::new()),
                    )
                }
            };

        let provider = match &config.google {
            Some(google) => {
                let provider = GoogleProvider::new(google).context("configure google oauth")?;
                Some(Arc::new(provider) as Arc<dyn IdentityProvider>)
            }
            None => {
                warn!("Google OAuth not configured; set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET to enable it");
                None
            }
        };

        let state = Self::from_parts(config, users, sessions, provider);
        info!(
            mode = ?state.config.auth_mode,
            google = state.gateway.provider_enabled(),
            "auth configured"
        );
        Ok(state)
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        session_store: Arc<dyn SessionStore>,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        let sessions = SessionManager::new(
            session_store,
            time::Duration::hours(config.session.max_age_hours),
        );
        let gateway = Arc::new(AuthGateway::new(&config, users, sessions, provider));
        let cookie_key = cookie_key(&config.session.secret);
        Self {
            config,
            gateway,
            cookie_key,
        }
    }

    /// Periodically drops expired sessions from the store.
    pub fn spawn_session_purge(&self) -> tokio::task::JoinHandle<()> {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                match gateway.sessions().purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(purged = n, "expired sessions removed"),
                    Err(e) => warn!(error = %e, "session purge failed"),
                }
            }
        })
    }

    #[cfg(test)]
    pub fn fake(config: AppConfig, provider: Option<Arc<dyn IdentityProvider>>) -> Self {
        Self::from_parts(
            Arc::new(config),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemorySessionStore::new()),
            provider,
        )
    }
}

#[cfg(test)]
pub fn test_config() -> AppConfig {
    use crate::config::{AuthMode, JwtConfig, SessionConfig};

    AppConfig {
        database_url: None,
        db_acquire_timeout_secs: 1,
        jwt: JwtConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_days: 30,
        },
        session: SessionConfig {
            secret: "test-session-secret-test-session-secret".into(),
            max_age_hours: 24,
            secure_cookie: false,
        },
        google: None,
        frontend_url: "http://localhost:5173".into(),
        auth_mode: AuthMode::Session,
        bind_addr: "127.0.0.1:0".into(),
    }
}
