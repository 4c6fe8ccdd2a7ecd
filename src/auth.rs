//! Connection admission credentials
//!
//! Turns a bearer credential into a verified [`Identity`] before a session
//! is handed to a hub.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AppError;
use crate::types::Identity;

/// Validates bearer credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, bearer: &str) -> Result<Identity, AppError>;
}

/// Static token table
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Identity>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: entries.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenTable {
    async fn authenticate(&self, bearer: &str) -> Result<Identity, AppError> {
        self.tokens
            .get(bearer)
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
