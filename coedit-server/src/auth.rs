//! Bearer-token authentication for the WebSocket gateway.

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Role carried in a connection token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Anonymous participant admitted without a token.
    Guest,
    /// Authenticated user.
    #[default]
    User,
    /// Administrator; bypasses per-document access checks.
    Admin,
}

/// Claims expected in a connection token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the stable user id.
    pub sub: String,
    /// Display name shown to other participants.
    pub name: String,
    /// Role; defaults to [`Role::User`] when absent.
    #[serde(default)]
    pub role: Role,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// A participant as resolved by the gateway.
#[derive(Clone, Debug)]
pub struct AuthedUser {
    /// Stable subject id, or a synthetic `guest-` id.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
    /// Resolved role.
    pub role: Role,
}

impl AuthedUser {
    /// Whether this participant connected without a token.
    pub fn is_guest(&self) -> bool {
        self.role == Role::Guest
    }

    /// Synthesize an identity for a tokenless connection.
    pub fn guest() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            user_id: format!("guest-{}", &tag[..8]),
            display_name: format!("Guest {}", &tag[..4]),
            role: Role::Guest,
        }
    }
}

/// Verify a bearer token's signature and expiry and resolve its subject.
pub fn verify(token: &str, secret: &str) -> Result<AuthedUser> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .context("invalid bearer token")?;
    Ok(AuthedUser {
        user_id: data.claims.sub,
        display_name: data.claims.name,
        role: data.claims.role,
    })
}
