//! Authenticated principal threaded through every orchestration call.
//!
//! Request handlers resolve a bearer session token to an `Option<Principal>` and
//! hand it to the worker; [`require_principal`] turns a missing principal into
//! [`EngineError::Unauthenticated`] instead of failing any other way.

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::trio::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    pub username: String,
}

pub fn require_principal(principal: Option<&Principal>) -> Result<&Principal, EngineError> {
    principal.ok_or(EngineError::Unauthenticated)
}

/// Hex SHA-256 of a session token. Only digests are stored.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A fresh random session token.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
