use std::str::FromStr;

use serde::Deserialize;

/// How the external-provider callback hands the identity back to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Establish a server-side session and set the session cookie.
    Session,
    /// Issue a bearer token and pass it to the frontend in the redirect URL.
    Token,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(AuthMode::Session),
            "token" => Ok(AuthMode::Token),
            other => anyhow::bail!("unknown AUTH_MODE {other:?} (expected \"session\" or \"token\")"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub max_age_hours: i64,
    pub secure_cookie: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `None` runs the service on in-memory stores.
    pub database_url: Option<String>,
    pub db_acquire_timeout_secs: u64,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    /// `None` disables the external-provider login flow.
    pub google: Option<GoogleConfig>,
    pub frontend_url: String,
    pub auth_mode: AuthMode,
    pub bind_addr: String,
}

const MIN_SESSION_SECRET_LEN: usize = 32;

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str, default: i64| {
            get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };

        let jwt = JwtConfig {
            secret: get("JWT_SECRET").ok_or_else(|| anyhow::anyhow!("JWT_SECRET is not set"))?,
            issuer: get("JWT_ISSUER").unwrap_or_else(|| "invoicely".into()),
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| "invoicely-users".into()),
            ttl_days: parsed("JWT_TTL_DAYS", 30),
        };

        let session_secret =
            get("SESSION_SECRET").ok_or_else(|| anyhow::anyhow!("SESSION_SECRET is not set"))?;
        if session_secret.len() < MIN_SESSION_SECRET_LEN {
            anyhow::bail!("SESSION_SECRET must be at least {MIN_SESSION_SECRET_LEN} bytes");
        }
        let session = SessionConfig {
            secret: session_secret,
            max_age_hours: parsed("SESSION_MAX_AGE_HOURS", 24),
            secure_cookie: get("SESSION_COOKIE_SECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        };

        let google = match (get("GOOGLE_CLIENT_ID"), get("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret))
                if !client_id.is_empty() && !client_secret.is_empty() =>
            {
                Some(GoogleConfig {
                    client_id,
                    client_secret,
                    callback_url: get("GOOGLE_CALLBACK_URL").unwrap_or_else(|| {
                        "http://localhost:5000/api/auth/google/callback".into()
                    }),
                })
            }
            _ => None,
        };

        let auth_mode = match get("AUTH_MODE") {
            Some(v) => v.parse()?,
            None => AuthMode::Session,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").filter(|v| !v.is_empty()),
            db_acquire_timeout_secs: parsed("DB_ACQUIRE_TIMEOUT_SECS", 5).max(1) as u64,
            jwt,
            session,
            google,
            frontend_url: get("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:5173".into())
                .trim_end_matches('/')
                .to_string(),
            auth_mode,
            bind_addr: format!(
                "{}:{}",
                get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
                get("APP_PORT").unwrap_or_else(|| "5000".into())
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_apply_when_only_secrets_are_set() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "jwt"),
            ("SESSION_SECRET", SECRET),
        ]))
        .expect("config");
        assert_eq!(cfg.jwt.ttl_days, 30);
        assert_eq!(cfg.session.max_age_hours, 24);
        assert_eq!(cfg.auth_mode, AuthMode::Session);
        assert_eq!(cfg.frontend_url, "http://localhost:5173");
        assert!(cfg.google.is_none());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.bind_addr, "0.0.0.0:5000");
    }

    #[test]
    fn google_requires_both_id_and_secret() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "jwt"),
            ("SESSION_SECRET", SECRET),
            ("GOOGLE_CLIENT_ID", "id"),
        ]))
        .expect("config");
        assert!(cfg.google.is_none());

        let cfg = AppConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "jwt"),
            ("SESSION_SECRET", SECRET),
            ("GOOGLE_CLIENT_ID", "id"),
            ("GOOGLE_CLIENT_SECRET", "shh"),
        ]))
        .expect("config");
        let google = cfg.google.expect("google enabled");
        assert_eq!(google.client_id, "id");
        assert!(google.callback_url.ends_with("/api/auth/google/callback"));
    }

    #[test]
    fn rejects_missing_jwt_secret_and_short_session_secret() {
        assert!(AppConfig::from_lookup(lookup(&[("SESSION_SECRET", SECRET)])).is_err());
        let err = AppConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "jwt"),
            ("SESSION_SECRET", "short"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SESSION_SECRET"));
    }

    #[test]
    fn parses_auth_mode_and_trims_frontend_url() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "jwt"),
            ("SESSION_SECRET", SECRET),
            ("AUTH_MODE", "Token"),
            ("FRONTEND_URL", "https://app.example.com/"),
        ]))
        .expect("config");
        assert_eq!(cfg.auth_mode, AuthMode::Token);
        assert_eq!(cfg.frontend_url, "https://app.example.com");
        assert!("cookie".parse::<AuthMode>().is_err());
    }
}
