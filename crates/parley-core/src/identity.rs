use chrono::Duration;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;

use parley_types::api::Claims;
use parley_types::models::{User, UserId};

use crate::error::ChatError;

/// A user resolved from a valid credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
}

impl From<&User> for CurrentUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

/// Who is calling. Supplied with every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    #[default]
    Anonymous,
    User(CurrentUser),
}

impl Identity {
    /// The resolved user, or `Unauthenticated`.
    pub fn user(&self) -> Result<&CurrentUser, ChatError> {
        match self {
            Self::User(user) => Ok(user),
            Self::Anonymous => Err(ChatError::Unauthenticated),
        }
    }
}

impl From<CurrentUser> for Identity {
    fn from(user: CurrentUser) -> Self {
        Self::User(user)
    }
}

/// Issues and verifies HS256 bearer tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            exp: (chrono::Utc::now() + self.ttl).timestamp() as usize,
        };

        let token = encode(&Header::default(), &claims, &self.encoding)?;
        Ok(token)
    }

    /// Claims of a valid, unexpired token. Anything else is `None`.
    pub fn verify(&self, token: &str) -> Option<Claims> {
        match decode::<Claims>(token, &self.decoding, &Validation::default()) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                debug!("Rejected bearer token: {}", e);
                None
            }
        }
    }
}
