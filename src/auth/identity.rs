use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::repo::UserStore;
use crate::auth::repo_types::{NewUser, StoreError, User};

const MAX_ATTEMPTS: usize = 3;
const FALLBACK_DISPLAY_NAME: &str = "user";
const PLACEHOLDER_EMAIL_DOMAIN: &str = "external.invalid";

/// Profile claims returned by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProfile {
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("account {user_id} is already linked to another external identity")]
    LinkConflict { user_id: Uuid },
    #[error("identity resolution still conflicting after {0} attempts")]
    Contended(usize),
}

/// Maps an external profile onto exactly one local user: by external id, then
/// by email (linking the account), otherwise by creating a new user.
#[derive(Clone)]
pub struct IdentityResolver {
    users: Arc<dyn UserStore>,
}

impl IdentityResolver {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    pub async fn resolve(&self, profile: &ExternalProfile) -> Result<User, ResolveError> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.resolve_once(profile).await {
                // A concurrent callback created or linked the same identity
                // between our lookup and our write; look it up again.
                Err(ResolveError::Store(StoreError::Conflict)) => {
                    warn!(attempt, external_id = %profile.external_id, "identity write conflicted, retrying");
                }
                other => return other,
            }
        }
        Err(ResolveError::Contended(MAX_ATTEMPTS))
    }

    async fn resolve_once(&self, profile: &ExternalProfile) -> Result<User, ResolveError> {
        if let Some(user) = self.users.find_by_external_id(&profile.external_id).await? {
            debug!(user_id = %user.id, "external identity already known");
            return Ok(user);
        }

        let email = profile
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|e| !e.is_empty());

        if let Some(email) = email.as_deref() {
            if let Some(existing) = self.users.find_by_email(email).await? {
                if existing
                    .external_id
                    .as_deref()
                    .is_some_and(|ext| ext != profile.external_id)
                {
                    warn!(user_id = %existing.id, "email matches an account linked to a different external identity");
                    return Err(ResolveError::LinkConflict {
                        user_id: existing.id,
                    });
                }
                let linked = self
                    .users
                    .update_link_fields(
                        existing.id,
                        &profile.external_id,
                        profile.avatar_url.as_deref(),
                    )
                    .await?;
                info!(
                    user_id = %linked.id,
                    email = %linked.email,
                    has_password = linked.has_password(),
                    "linked external identity to existing account"
                );
                return Ok(linked);
            }
        }

        let new_user = NewUser {
            display_name: display_name_for(profile, email.as_deref()),
            email: email.unwrap_or_else(|| placeholder_email(&profile.external_id)),
            password_hash: None,
            external_id: Some(profile.external_id.clone()),
            avatar_url: profile.avatar_url.clone(),
        };
        let user = self.users.insert(new_user).await?;
        info!(user_id = %user.id, email = %user.email, "created user from external identity");
        Ok(user)
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn display_name_for(profile: &ExternalProfile, email: Option<&str>) -> String {
    profile
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| {
            email
                .and_then(|e| e.split('@').next())
                .filter(|local| !local.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string())
}

/// Emails are matched case-insensitively while external ids are not, so the
/// local part escapes uppercase letters (`A` -> `_a`, `_` -> `__`) to keep two
/// ids differing only in case from sharing one placeholder.
fn placeholder_email(external_id: &str) -> String {
    let mut local = String::with_capacity(external_id.len());
    for c in external_id.chars() {
        if c == '_' {
            local.push_str("__");
        } else if c.is_uppercase() {
            local.push('_');
            local.extend(c.to_lowercase());
        } else {
            local.push(c);
        }
    }
    format!("{}@{}", local, PLACEHOLDER_EMAIL_DOMAIN)
}
