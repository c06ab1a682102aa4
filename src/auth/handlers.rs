use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use tower_cookies::{cookie::SameSite, Cookie, Cookies};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, CallbackQuery, LoginRequest, MeResponse, MessageResponse, PublicUser,
            SignupRequest,
        },
        extractors::{CurrentUser, PresentedCredentials, ValidJson},
        services::PendingAuthorization,
        session::{clear_session_cookie, set_session_cookie},
    },
    error::AuthError,
    state::AppState,
};

const OAUTH_COOKIE: &str = "invoicely_oauth";
const OAUTH_COOKIE_MAX_AGE: time::Duration = time::Duration::minutes(10);

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/google", get(google_login))
        .route("/auth/google/callback", get(google_callback))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<SignupRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AuthError> {
    let (user, token) = state.gateway.signup(payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User created successfully",
            user: PublicUser::from(&user),
            token,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let (user, token) = state.gateway.login(payload).await?;
    Ok(Json(AuthResponse {
        message: "Login successful",
        user: PublicUser::from(&user),
        token,
    }))
}

#[instrument(skip(state, current))]
pub async fn get_me(
    State(state): State<AppState>,
    CurrentUser(current): CurrentUser,
) -> Result<Json<MeResponse>, AuthError> {
    let user = state.gateway.current_user(&current).await?;
    Ok(Json(MeResponse { user: user.into() }))
}

/// Always succeeds for the client; an unreadable Authorization header just
/// means there is nothing server-side to tear down for it.
#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
    presented: Result<PresentedCredentials, AuthError>,
) -> Result<Json<MessageResponse>, AuthError> {
    let presented = presented.unwrap_or_default();
    let outcome = state.gateway.logout(presented.for_logout().as_ref()).await?;
    if outcome.clear_session_cookie {
        clear_session_cookie(&cookies.signed(&state.cookie_key));
    }
    Ok(Json(MessageResponse {
        message: "Logged out successfully",
    }))
}

#[instrument(skip_all)]
pub async fn google_login(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Redirect, AuthError> {
    let request = state.gateway.begin_external_login()?;

    let pending = Cookie::build((
        OAUTH_COOKIE,
        format!("{}:{}", request.state, request.pkce_verifier),
    ))
    .path("/")
    .http_only(true)
    .same_site(SameSite::Lax)
    .secure(state.config.session.secure_cookie)
    .max_age(OAUTH_COOKIE_MAX_AGE)
    .build();
    cookies.signed(&state.cookie_key).add(pending);

    info!("redirecting to identity provider");
    Ok(Redirect::to(&request.url))
}

#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    cookies: Cookies,
    query: Option<Query<CallbackQuery>>,
) -> Redirect {
    let signed = cookies.signed(&state.cookie_key);
    let pending = signed.get(OAUTH_COOKIE).and_then(|c| {
        c.value()
            .split_once(':')
            .map(|(state, verifier)| PendingAuthorization {
                state: state.to_string(),
                pkce_verifier: verifier.to_string(),
            })
    });
    if pending.is_none() {
        warn!("callback without a pending authorization cookie");
    }
    // single use
    signed.remove(Cookie::build(OAUTH_COOKIE).path("/").build());

    let query = query.map(|Query(q)| q).unwrap_or_default();
    let outcome = state.gateway.external_callback(query, pending).await;

    if let Some(session) = &outcome.session {
        set_session_cookie(
            &signed,
            session,
            state.gateway.sessions().ttl(),
            state.config.session.secure_cookie,
        );
    }
    Redirect::to(&outcome.redirect)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{header, HeaderValue};
    use axum_test::TestServer;
    use serde_json::{json, Value};

    use crate::app::build_app;
    use crate::auth::identity::ExternalProfile;
    use crate::auth::jwt::JwtKeys;
    use crate::auth::oauth::{fake::StaticProvider, IdentityProvider};
    use crate::auth::session::SESSION_COOKIE;
    use crate::config::AuthMode;
    use crate::state::{test_config, AppState};

    use super::OAUTH_COOKIE;

    fn server(provider: Option<Arc<dyn IdentityProvider>>) -> TestServer {
        let state = AppState::fake(test_config(), provider);
        TestServer::new(build_app(state)).unwrap()
    }

    fn google_user() -> Arc<dyn IdentityProvider> {
        Arc::new(StaticProvider {
            profile: Some(ExternalProfile {
                external_id: "google-7".into(),
                email: Some("g@x.com".into()),
                display_name: Some("Gina".into()),
                avatar_url: None,
            }),
        })
    }

    fn bearer(token: &str) -> HeaderValue {
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap()
    }

    #[tokio::test]
    async fn signup_then_me_with_bearer() {
        let server = server(None);
        let res = server
            .post("/api/auth/signup")
            .json(&json!({"displayName": "Jane Doe", "email": "Jane@X.com", "password": "secret1"}))
            .await;
        res.assert_status(axum::http::StatusCode::CREATED);
        let body: Value = res.json();
        assert_eq!(body["message"], "User created successfully");
        assert_eq!(body["user"]["email"], "jane@x.com");
        let token = body["token"].as_str().unwrap().to_string();

        let me = server
            .get("/api/auth/me")
            .add_header(header::AUTHORIZATION, bearer(&token))
            .await;
        me.assert_status_ok();
        let me: Value = me.json();
        assert_eq!(me["user"]["displayName"], "Jane Doe");
        assert!(me["user"].get("passwordHash").is_none());
    }

    #[tokio::test]
    async fn duplicate_signup_conflicts_and_bad_login_is_generic() {
        let server = server(None);
        let body = json!({"displayName": "Jane Doe", "email": "jane@x.com", "password": "secret1"});
        server.post("/api/auth/signup").json(&body).await.assert_status(axum::http::StatusCode::CREATED);

        let dup = server.post("/api/auth/signup").json(&body).await;
        dup.assert_status(axum::http::StatusCode::CONFLICT);

        let wrong = server
            .post("/api/auth/login")
            .json(&json!({"email": "jane@x.com", "password": "nope123"}))
            .await;
        let unknown = server
            .post("/api/auth/login")
            .json(&json!({"email": "who@x.com", "password": "nope123"}))
            .await;
        wrong.assert_status_unauthorized();
        unknown.assert_status_unauthorized();
        assert_eq!(wrong.json::<Value>(), unknown.json::<Value>());
    }

    #[tokio::test]
    async fn me_requires_credentials() {
        let server = server(None);
        server.get("/api/auth/me").await.assert_status_unauthorized();

        let res = server
            .get("/api/auth/me")
            .add_header(header::AUTHORIZATION, bearer("not.a.jwt"))
            .await;
        res.assert_status_unauthorized();
        assert_eq!(res.json::<Value>()["error"], "Invalid token");
    }

    #[tokio::test]
    async fn google_routes_are_404_when_disabled() {
        let server = server(None);
        server
            .get("/api/auth/google")
            .await
            .assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn google_round_trip_sets_session_cookie_and_logout_clears_it() {
        let server = server(Some(google_user()));

        let start = server.get("/api/auth/google").await;
        start.assert_status(axum::http::StatusCode::SEE_OTHER);
        let location = start.header(header::LOCATION);
        assert!(location.to_str().unwrap().starts_with("https://provider.test/authorize"));
        let pending = start.cookie(OAUTH_COOKIE);

        let callback = server
            .get("/api/auth/google/callback?code=good-code&state=fixed-state")
            .add_cookie(pending)
            .await;
        callback.assert_status(axum::http::StatusCode::SEE_OTHER);
        assert_eq!(
            callback.header(header::LOCATION),
            "http://localhost:5173/auth/callback"
        );
        let session = callback.cookie(SESSION_COOKIE);

        let me = server.get("/api/auth/me").add_cookie(session.clone()).await;
        me.assert_status_ok();
        assert_eq!(me.json::<Value>()["user"]["email"], "g@x.com");

        let out = server.post("/api/auth/logout").add_cookie(session.clone()).await;
        out.assert_status_ok();
        assert_eq!(out.json::<Value>()["message"], "Logged out successfully");

        server
            .get("/api/auth/me")
            .add_cookie(session)
            .await
            .assert_status_unauthorized();
    }

    #[tokio::test]
    async fn callback_without_pending_cookie_fails_opaquely() {
        let server = server(Some(google_user()));
        let res = server
            .get("/api/auth/google/callback?code=good-code&state=fixed-state")
            .await;
        res.assert_status(axum::http::StatusCode::SEE_OTHER);
        assert_eq!(
            res.header(header::LOCATION),
            "http://localhost:5173/?error=auth_failed"
        );
        assert!(res.maybe_cookie(SESSION_COOKIE).is_none());
    }

    #[tokio::test]
    async fn logout_without_credentials_still_succeeds() {
        let server = server(None);
        server.post("/api/auth/logout").await.assert_status_ok();
    }

    #[tokio::test]
    async fn unparseable_bodies_are_validation_errors() {
        let server = server(None);
        let res = server
            .post("/api/auth/signup")
            .json(&json!({"email": "jane@x.com", "password": "secret1"}))
            .await;
        res.assert_status(axum::http::StatusCode::BAD_REQUEST);
        let body: Value = res.json();
        assert_eq!(body["error"], "Validation error");
        assert_eq!(body["details"][0]["field"], "displayName");

        let res = server
            .post("/api/auth/login")
            .json(&json!({"email": "jane@x.com", "password": 123456}))
            .await;
        res.assert_status(axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(res.json::<Value>()["details"][0]["field"], "password");

        let res = server.post("/api/auth/login").text("{not json").await;
        res.assert_status(axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(res.json::<Value>()["error"], "Validation error");
    }

    #[tokio::test]
    async fn expired_bearer_reports_token_expired() {
        let server = server(None);
        let keys = JwtKeys::from_config(&test_config().jwt);
        let issued = time::OffsetDateTime::now_utc() - time::Duration::days(30) - time::Duration::seconds(5);
        let token = keys
            .issue_at(uuid::Uuid::new_v4(), "jane@x.com", issued)
            .unwrap();

        let res = server
            .get("/api/auth/me")
            .add_header(header::AUTHORIZATION, bearer(&token))
            .await;
        res.assert_status_unauthorized();
        assert_eq!(res.json::<Value>()["error"], "Token expired");
    }

    #[tokio::test]
    async fn token_mode_callback_redirects_with_token() {
        let mut config = test_config();
        config.auth_mode = AuthMode::Token;
        let server = TestServer::new(build_app(AppState::fake(config, Some(google_user())))).unwrap();

        let pending = server.get("/api/auth/google").await.cookie(OAUTH_COOKIE);
        let callback = server
            .get("/api/auth/google/callback?code=good-code&state=fixed-state")
            .add_cookie(pending)
            .await;
        callback.assert_status(axum::http::StatusCode::SEE_OTHER);
        assert!(callback.maybe_cookie(SESSION_COOKIE).is_none());

        let location = callback.header(header::LOCATION);
        let token = location
            .to_str()
            .unwrap()
            .strip_prefix("http://localhost:5173/auth/callback?token=")
            .expect("token in redirect")
            .to_string();
        let me = server
            .get("/api/auth/me")
            .add_header(header::AUTHORIZATION, bearer(&token))
            .await;
        me.assert_status_ok();
        assert_eq!(me.json::<Value>()["user"]["email"], "g@x.com");
    }
}
