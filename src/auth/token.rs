//! Bearer tokens of the form `zoekt_<lookup>_<secret>`.
//!
//! The lookup half is stored in clear so a token can be found without
//! scanning; the full token is only ever stored as an argon2id hash.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Token;

const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const TOKEN_PREFIX: &str = "zoekt";
const LOOKUP_LENGTH: usize = 8;
const SECRET_BYTES: usize = 16;
const SECRET_LENGTH: usize = SECRET_BYTES * 2;

/// Attempts before giving up on finding a free lookup value.
const ISSUE_ATTEMPTS: usize = 3;

/// A freshly issued token. `raw` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub raw: String,
    pub token: Token,
}

pub struct TokenHasher {
    argon2: Argon2<'static>,
}

impl Default for TokenHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenHasher {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .unwrap_or_default();

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn hash(&self, raw: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(raw.as_bytes(), &salt)
            .map_err(|e| Error::Config(format!("failed to hash token: {e}")))?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, raw: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Config(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(raw.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Config(format!("failed to verify token: {e}"))),
        }
    }

    /// Creates and stores a new token, retrying when the random lookup is taken.
    pub fn issue(
        &self,
        store: &dyn Store,
        is_admin: bool,
        description: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        for _ in 0..ISSUE_ATTEMPTS {
            let lookup = random_lookup();
            let raw = format!("{TOKEN_PREFIX}_{lookup}_{}", random_secret());
            let token = Token {
                id: Uuid::new_v4().to_string(),
                token_hash: self.hash(&raw)?,
                token_lookup: lookup,
                is_admin,
                description: description.clone(),
                created_at: now,
                expires_at,
                last_used_at: None,
            };

            match store.create_token(&token) {
                Ok(()) => return Ok(IssuedToken { raw, token }),
                Err(Error::TokenLookupCollision) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::TokenLookupCollision)
    }

    /// Resolves a presented token to its stored record.
    pub fn authenticate(&self, store: &dyn Store, raw: &str, now: DateTime<Utc>) -> Result<Token> {
        let (lookup, _) = parse_token(raw)?;
        let token = store
            .get_token_by_lookup(&lookup)?
            .ok_or(Error::Unauthorized)?;

        if !self.verify(raw, &token.token_hash)? {
            return Err(Error::Unauthorized);
        }
        if token.expires_at.is_some_and(|at| at < now) {
            return Err(Error::TokenExpired);
        }

        if let Err(e) = store.update_token_last_used(&token.id, now) {
            tracing::warn!(token_id = %token.id, error = %e, "Failed to update token last_used_at");
        }
        Ok(token)
    }
}

fn random_lookup() -> String {
    Uuid::new_v4().simple().to_string()[..LOOKUP_LENGTH].to_string()
}

fn random_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Splits a token into its lookup and secret halves.
pub fn parse_token(raw: &str) -> Result<(String, String)> {
    let mut parts = raw.split('_');
    let (Some(TOKEN_PREFIX), Some(lookup), Some(secret), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::InvalidTokenFormat);
    };

    if lookup.len() != LOOKUP_LENGTH || secret.len() != SECRET_LENGTH {
        return Err(Error::InvalidTokenFormat);
    }
    Ok((lookup.to_string(), secret.to_string()))
}
