use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::dto::{CallbackQuery, LoginRequest, SignupRequest};
use crate::auth::identity::{normalize_email, ExternalProfile, IdentityResolver};
use crate::auth::jwt::JwtKeys;
use crate::auth::oauth::{AuthorizationRequest, IdentityProvider, ProviderError};
use crate::auth::password::{hash_password, verify_password};
use crate::auth::repo::UserStore;
use crate::auth::repo_types::{NewUser, SessionId, StoreError, User};
use crate::auth::session::SessionManager;
use crate::config::{AppConfig, AuthMode};
use crate::error::{AuthError, CredentialFailure, FieldError};

const FRONTEND_CALLBACK_PATH: &str = "/auth/callback";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// A credential presented with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Session(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Session(SessionId),
}

/// The authenticated identity handed to request handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub email: String,
    pub method: AuthMethod,
}

/// Opaque failure codes the frontend receives after the provider callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackError {
    AuthFailed,
    NoUser,
    LoginFailed,
}

impl CallbackError {
    pub fn code(self) -> &'static str {
        match self {
            CallbackError::AuthFailed => "auth_failed",
            CallbackError::NoUser => "no_user",
            CallbackError::LoginFailed => "login_failed",
        }
    }
}

/// Where to send the user agent after the provider callback, and the session
/// to bind to it, if one was established.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub redirect: String,
    pub session: Option<SessionId>,
}

/// State and PKCE verifier remembered between the redirect to the provider
/// and its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub pkce_verifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub clear_session_cookie: bool,
}

pub struct AuthGateway {
    mode: AuthMode,
    frontend_url: String,
    users: Arc<dyn UserStore>,
    keys: JwtKeys,
    resolver: IdentityResolver,
    sessions: SessionManager,
    provider: Option<Arc<dyn IdentityProvider>>,
}

impl AuthGateway {
    pub fn new(
        config: &AppConfig,
        users: Arc<dyn UserStore>,
        sessions: SessionManager,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            mode: config.auth_mode,
            frontend_url: config.frontend_url.clone(),
            resolver: IdentityResolver::new(users.clone()),
            users,
            keys: JwtKeys::from_config(&config.jwt),
            sessions,
            provider,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn provider_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn signup(&self, mut req: SignupRequest) -> Result<(User, String), AuthError> {
        req.email = normalize_email(&req.email);
        validate_signup(&req)?;

        if self.users.find_by_email(&req.email).await?.is_some() {
            warn!(email = %req.email, "email already registered");
            return Err(AuthError::DuplicateEmail);
        }

        let password = req.password;
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let user = match self
            .users
            .insert(NewUser {
                display_name: req.display_name,
                email: req.email,
                password_hash: Some(hash),
                external_id: None,
                avatar_url: None,
            })
            .await
        {
            Ok(u) => u,
            Err(StoreError::Conflict) => {
                warn!("email registered concurrently");
                return Err(AuthError::DuplicateEmail);
            }
            Err(e) => return Err(e.into()),
        };

        let token = self
            .keys
            .issue(user.id, &user.email)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok((user, token))
    }

    pub async fn login(&self, mut req: LoginRequest) -> Result<(User, String), AuthError> {
        req.email = normalize_email(&req.email);
        if !is_valid_email(&req.email) {
            return Err(AuthError::Validation(vec![FieldError::new("email", "Invalid email")]));
        }

        let Some(user) = self.users.find_by_email(&req.email).await? else {
            warn!(email = %req.email, "login unknown email");
            return Err(AuthError::InvalidCredentials(CredentialFailure::UnknownEmail));
        };

        let Some(hash) = user.password_hash.clone() else {
            warn!(user_id = %user.id, "password login for external-only account");
            return Err(AuthError::ExternalOnlyAccount);
        };

        let password = req.password;
        let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        if !ok {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials(CredentialFailure::WrongPassword));
        }

        let token = self
            .keys
            .issue(user.id, &user.email)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        info!(user_id = %user.id, email = %user.email, "user logged in");
        Ok((user, token))
    }

    pub fn begin_external_login(&self) -> Result<AuthorizationRequest, AuthError> {
        let provider = self.provider.as_ref().ok_or(AuthError::ProviderDisabled)?;
        Ok(provider.authorization_request())
    }

    /// Finishes the provider round trip. Never fails: every outcome is a
    /// redirect, and failures only carry an opaque code.
    pub async fn external_callback(
        &self,
        query: CallbackQuery,
        pending: Option<PendingAuthorization>,
    ) -> CallbackOutcome {
        let Some(provider) = self.provider.as_ref() else {
            warn!("provider callback while external login is disabled");
            return self.failure(CallbackError::AuthFailed);
        };
        if let Some(err) = query.error {
            warn!(provider_error = %err, "provider reported an error");
            return self.failure(CallbackError::AuthFailed);
        }
        let (Some(code), Some(state)) = (query.code, query.state) else {
            warn!("provider callback without code or state");
            return self.failure(CallbackError::AuthFailed);
        };
        let Some(pending) = pending.filter(|p| p.state == state) else {
            warn!("oauth state mismatch");
            return self.failure(CallbackError::AuthFailed);
        };

        match provider.fetch_profile(&code, &pending.pkce_verifier).await {
            Ok(profile) => self.login_with_profile(&profile).await,
            Err(ProviderError::MissingSubject) => {
                warn!("provider returned no usable profile");
                self.failure(CallbackError::NoUser)
            }
            Err(e) => {
                error!(error = %e, "external authentication failed");
                self.failure(CallbackError::AuthFailed)
            }
        }
    }

    /// Resolves the profile to a local user, then hands the identity back
    /// according to the deployment mode.
    pub async fn login_with_profile(&self, profile: &ExternalProfile) -> CallbackOutcome {
        let user = match self.resolver.resolve(profile).await {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, external_id = %profile.external_id, "identity resolution failed");
                return self.failure(CallbackError::AuthFailed);
            }
        };

        match self.mode {
            AuthMode::Session => match self.sessions.establish(user.id).await {
                Ok(session) => CallbackOutcome {
                    redirect: self.frontend_route(FRONTEND_CALLBACK_PATH),
                    session: Some(session),
                },
                Err(e) => {
                    error!(error = %e, user_id = %user.id, "session establishment failed");
                    self.failure(CallbackError::LoginFailed)
                }
            },
            AuthMode::Token => match self.keys.issue(user.id, &user.email) {
                Ok(token) => CallbackOutcome {
                    redirect: format!(
                        "{}?token={}",
                        self.frontend_route(FRONTEND_CALLBACK_PATH),
                        token
                    ),
                    session: None,
                },
                Err(e) => {
                    error!(error = %e, user_id = %user.id, "token issuance failed");
                    self.failure(CallbackError::LoginFailed)
                }
            },
        }
    }

    /// Identity check. Bearer claims are trusted as issued; a session must
    /// still point at an existing user.
    pub async fn identify(&self, credential: &Credential) -> Result<AuthContext, AuthError> {
        match credential {
            Credential::Bearer(token) => {
                let identity = self.keys.verify(token).map_err(|e| {
                    warn!(error = %e, "bearer token rejected");
                    AuthError::Token(e)
                })?;
                Ok(AuthContext {
                    user_id: identity.user_id,
                    email: identity.email,
                    method: AuthMethod::Token,
                })
            }
            Credential::Session(id) => {
                let user_id = self
                    .sessions
                    .resolve(id)
                    .await?
                    .ok_or(AuthError::Unauthenticated)?;
                let user = self.users.find_by_id(user_id).await?.ok_or_else(|| {
                    warn!(user_id = %user_id, "session bound to a missing user");
                    AuthError::Unauthenticated
                })?;
                Ok(AuthContext {
                    user_id: user.id,
                    email: user.email,
                    method: AuthMethod::Session(id.clone()),
                })
            }
        }
    }

    pub async fn current_user(&self, ctx: &AuthContext) -> Result<User, AuthError> {
        self.users.find_by_id(ctx.user_id).await?.ok_or_else(|| {
            warn!(user_id = %ctx.user_id, "authenticated user not found");
            AuthError::UserNotFound
        })
    }

    /// Sessions are destroyed server-side. Bearer tokens stay valid until
    /// they expire; the client just discards them.
    pub async fn logout(&self, credential: Option<&Credential>) -> Result<LogoutOutcome, AuthError> {
        match credential {
            Some(Credential::Session(id)) => {
                self.sessions.destroy(id).await.map_err(|e| {
                    error!(error = %e, "session destruction failed");
                    AuthError::from(e)
                })?;
                Ok(LogoutOutcome {
                    clear_session_cookie: true,
                })
            }
            Some(Credential::Bearer(_)) | None => Ok(LogoutOutcome {
                clear_session_cookie: false,
            }),
        }
    }

    fn frontend_route(&self, path: &str) -> String {
        format!("{}{}", self.frontend_url, path)
    }

    fn failure(&self, err: CallbackError) -> CallbackOutcome {
        CallbackOutcome {
            redirect: format!("{}/?error={}", self.frontend_url, err.code()),
            session: None,
        }
    }
}

fn validate_signup(req: &SignupRequest) -> Result<(), AuthError> {
    let mut errors = Vec::new();

    let name_len = req.display_name.chars().count();
    if !(3..=100).contains(&name_len) {
        errors.push(FieldError::new("displayName", "Display name must be between 3 and 100 characters"));
    }
    if req.email.len() > 255 {
        errors.push(FieldError::new("email", "Email must be at most 255 characters"));
    } else if !is_valid_email(&req.email) {
        errors.push(FieldError::new("email", "Invalid email"));
    }
    if req.password.chars().count() < 6 {
        errors.push(FieldError::new("password", "Password must be at least 6 characters"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AuthError::Validation(errors))
    }
}
