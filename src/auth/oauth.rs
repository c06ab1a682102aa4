//! External identity provider (Google OAuth 2.0, authorization code + PKCE).

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::identity::ExternalProfile;
use crate::config::GoogleConfig;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Where to send the user agent, plus what the callback needs to finish the
/// exchange.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce_verifier: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("profile request failed: {0}")]
    Profile(String),
    #[error("provider returned no subject identifier")]
    MissingSubject,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authorization URL requesting the `profile` and `email` scopes.
    fn authorization_request(&self) -> AuthorizationRequest;

    async fn fetch_profile(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<ExternalProfile, ProviderError>;
}

type ConfiguredClient = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    oauth2::basic::BasicTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// Google user info from API.
#[derive(Debug, Deserialize)]
struct GoogleUser {
    #[serde(default)]
    id: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

pub struct GoogleProvider {
    client: ConfiguredClient,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(cfg: &GoogleConfig) -> anyhow::Result<Self> {
        let client = BasicClient::new(ClientId::new(cfg.client_id.clone()))
            .set_client_secret(ClientSecret::new(cfg.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(GOOGLE_AUTH_URL.to_string())?)
            .set_token_uri(TokenUrl::new(GOOGLE_TOKEN_URL.to_string())?)
            .set_redirect_uri(RedirectUrl::new(cfg.callback_url.clone())?);

        // Redirects are disabled to keep the token exchange from being
        // bounced to another host.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self { client, http })
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("profile".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        AuthorizationRequest {
            url: url.to_string(),
            state: state.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        }
    }

    async fn fetch_profile(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<ExternalProfile, ProviderError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        let google_user: GoogleUser = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProviderError::Profile(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Profile(e.to_string()))?;

        debug!(external_id = %google_user.id, "fetched google profile");
        google_user.into_profile()
    }
}

impl GoogleUser {
    fn into_profile(self) -> Result<ExternalProfile, ProviderError> {
        if self.id.trim().is_empty() {
            return Err(ProviderError::MissingSubject);
        }
        Ok(ExternalProfile {
            external_id: self.id,
            email: self.email,
            display_name: self.name,
            avatar_url: self.picture,
        })
    }
}
