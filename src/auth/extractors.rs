use axum::{
    async_trait,
    extract::{FromRef, FromRequest, FromRequestParts, Request},
    http::{header::AUTHORIZATION, request::Parts},
    Json,
};
use serde::de::DeserializeOwned;
use tower_cookies::{Cookies, Key};

use crate::auth::repo_types::SessionId;
use crate::auth::services::{AuthContext, Credential};
use crate::auth::session::session_from_cookies;
use crate::error::AuthError;
use crate::state::AppState;

/// Credentials found on a request, in whatever combination the client sent.
#[derive(Debug, Clone, Default)]
pub struct PresentedCredentials {
    pub bearer: Option<String>,
    pub session: Option<SessionId>,
}

impl PresentedCredentials {
    /// Bearer tokens take precedence for identity checks.
    pub fn for_identity(&self) -> Option<Credential> {
        self.bearer
            .clone()
            .map(Credential::Bearer)
            .or_else(|| self.session.clone().map(Credential::Session))
    }

    /// A session, when present, is what logout has to tear down.
    pub fn for_logout(&self) -> Option<Credential> {
        self.session
            .clone()
            .map(Credential::Session)
            .or_else(|| self.bearer.clone().map(Credential::Bearer))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for PresentedCredentials {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let bearer = match parts.headers.get(AUTHORIZATION) {
            None => None,
            Some(value) => {
                let value = value.to_str().map_err(|_| AuthError::Unauthenticated)?;
                // Expect "Bearer <token>"
                let token = value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
                    .ok_or(AuthError::Unauthenticated)?;
                Some(token.trim().to_string())
            }
        };

        let cookies = Cookies::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| AuthError::Internal(msg.to_string()))?;
        let key = Key::from_ref(state);
        let session = session_from_cookies(&cookies.signed(&key));

        Ok(Self { bearer, session })
    }
}

/// Authenticated identity, resolved through the gateway from either a bearer
/// token or the session cookie.
pub struct CurrentUser(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = PresentedCredentials::from_request_parts(parts, state).await?;
        let credential = presented.for_identity().ok_or(AuthError::Unauthenticated)?;
        let ctx = state.gateway.identify(&credential).await?;
        Ok(CurrentUser(ctx))
    }
}

/// JSON body whose rejections surface as `AuthError::Validation` instead of
/// axum's plain-text 4xx.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ValidJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_differs_between_identity_and_logout() {
        let both = PresentedCredentials {
            bearer: Some("tok".into()),
            session: Some(SessionId("sid".into())),
        };
        assert_eq!(both.for_identity(), Some(Credential::Bearer("tok".into())));
        assert_eq!(
            both.for_logout(),
            Some(Credential::Session(SessionId("sid".into())))
        );
        assert_eq!(PresentedCredentials::default().for_identity(), None);
    }
}
