//! Auth verifier — the named interface standing in for whatever identity
//! provider issues bearer tokens. HS256 JWTs carrying a `sub` claim are the
//! concrete scheme; everything else in the crate only depends on the
//! `AuthVerifier` port.

use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed authorization header")]
    MalformedHeader,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, authorization_header: &str) -> Result<AuthenticatedUser, AuthError>;
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(jsonwebtoken::Algorithm::HS256),
        }
    }
}

fn strip_bearer(header: &str) -> Result<&str, AuthError> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(AuthError::MalformedHeader)
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, authorization_header: &str) -> Result<AuthenticatedUser, AuthError> {
        if authorization_header.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let token = strip_bearer(authorization_header)?;
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(AuthenticatedUser {
            user_id: data.claims.sub,
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Accepts whatever token string was registered against a user id, no
    /// actual JWT parsing — for handler tests that don't care about the
    /// token format.
    #[derive(Default)]
    pub struct FakeAuthVerifier {
        tokens: Mutex<HashMap<String, String>>,
    }

    impl FakeAuthVerifier {
        pub fn register(&self, token: &str, user_id: &str) {
            self.tokens
                .lock()
                .unwrap()
                .insert(token.to_string(), user_id.to_string());
        }
    }

    #[async_trait]
    impl AuthVerifier for FakeAuthVerifier {
        async fn verify(&self, authorization_header: &str) -> Result<AuthenticatedUser, AuthError> {
            let token = strip_bearer(authorization_header)?;
            self.tokens
                .lock()
                .unwrap()
                .get(token)
                .map(|user_id| AuthenticatedUser {
                    user_id: user_id.clone(),
                })
                .ok_or_else(|| AuthError::InvalidToken("unregistered token".to_string()))
        }
    }
}
