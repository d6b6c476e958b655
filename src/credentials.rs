// src/credentials.rs
//
// Password hashing and session token issuance/validation. Tokens are
// stateless JWTs bound to a user id; validity is exactly "correctly
// signed and not expired" (no revocation list).
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sessions last a week. Rotation is out of scope.
pub const TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("token subject is not a valid user id")]
    Subject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: usize,
    pub iat: usize,
}

#[derive(Clone)]
pub struct CredentialService {
    secret: String,
}

impl CredentialService {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn hash_password(&self, password: &str) -> Result<String, CredentialError> {
        Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
    }

    pub fn verify_password(
        &self,
        password: &str,
        password_hash: &str,
    ) -> Result<bool, CredentialError> {
        Ok(bcrypt::verify(password, password_hash)?)
    }

    pub fn issue_token(&self, user_id: Uuid) -> Result<String, CredentialError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + Duration::seconds(TOKEN_TTL_SECONDS)).timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )?)
    }

    /// Resolves a token back to the user id it was issued for. Fails on
    /// bad signature, malformed token, or expiry.
    pub fn validate_token(&self, token: &str) -> Result<Uuid, CredentialError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::default(),
        )?;

        token_data
            .claims
            .sub
            .parse::<Uuid>()
            .map_err(|_| CredentialError::Subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CredentialService {
        CredentialService::new("test_secret")
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let svc = service();
        let hash = svc.hash_password("pw1").unwrap();
        assert_ne!(hash, "pw1");
        assert!(svc.verify_password("pw1", &hash).unwrap());
        assert!(!svc.verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn test_token_resolves_to_issuing_user() {
        let svc = service();
        let user_id = Uuid::new_v4();
        let token = svc.issue_token(user_id).unwrap();
        assert_eq!(svc.validate_token(&token).unwrap(), user_id);
    }

    #[test]
    fn test_tampered_token_fails() {
        let svc = service();
        let token = svc.issue_token(Uuid::new_v4()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        assert!(svc.validate_token(&tampered).is_err());

        // Signed with a different secret
        let other = CredentialService::new("other_secret");
        let foreign = other.issue_token(Uuid::new_v4()).unwrap();
        assert!(svc.validate_token(&foreign).is_err());
    }

    #[test]
    fn test_expired_token_fails() {
        let svc = service();
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: (now - Duration::hours(1)).timestamp() as usize,
            iat: (now - Duration::hours(2)).timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test_secret"),
        )
        .unwrap();
        assert!(svc.validate_token(&token).is_err());
    }
}
