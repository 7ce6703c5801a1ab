use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;

use relay_core::auth::{Claims, TokenVerifier};
use relay_core::error::{RelayError, Result};
use relay_core::session::{Role, UserId, VerifiedIdentity};

/// Token verifier backed by HMAC-signed JWTs.
///
/// The highest recognized role claim wins; authenticated tokens without a
/// recognized role get the standard user tier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier over an HS256 secret.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.leeway = 60; // clock skew tolerance
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    RelayError::AuthenticationFailed("token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    RelayError::AuthenticationFailed("invalid signature".to_string())
                }
                jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => {
                    RelayError::AuthenticationFailed(format!("missing claim: {}", claim))
                }
                _ => RelayError::AuthenticationFailed(e.to_string()),
            })?;
        Ok(token_data.claims)
    }
}

/// Highest role named in the claims, or the standard tier when none is
/// recognized.
fn role_from_claims(claims: &Claims) -> Role {
    claims
        .roles
        .iter()
        .filter_map(|r| r.parse::<Role>().ok())
        .filter(|r| *r > Role::Anonymous)
        .max()
        .unwrap_or(Role::User)
}

impl TokenVerifier for JwtVerifier {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedIdentity>> + Send + 'a>> {
        Box::pin(async move {
            let claims = self.decode_claims(token)?;
            let role = role_from_claims(&claims);
            let expires_at =
                DateTime::<Utc>::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);

            Ok(VerifiedIdentity {
                user_id: UserId::new(claims.sub),
                role,
                permissions: claims.permissions,
                expires_at,
            })
        })
    }
}

/// Fixed-map verifier for local development and tests: each registered
/// token resolves to one identity, everything else fails.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: RwLock<HashMap<String, VerifiedIdentity>>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    pub fn insert(&self, token: impl Into<String>, identity: VerifiedIdentity) {
        self.tokens.write().insert(token.into(), identity);
    }

    /// Register a token for a plain user.
    pub fn with_user(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.insert(
            token,
            VerifiedIdentity {
                user_id: UserId::new(user_id.into()),
                role: Role::User,
                permissions: vec![],
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        );
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedIdentity>> + Send + 'a>> {
        let identity = self.tokens.read().get(token).cloned();
        Box::pin(async move {
            identity.ok_or_else(|| RelayError::AuthenticationFailed("unknown token".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(roles: &[&str], duration_secs: i64) -> Claims {
        let mut builder = Claims::builder()
            .subject("user-1")
            .duration_secs(duration_secs);
        for role in roles {
            builder = builder.role(*role);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for(&claims(&["institutional"], 3600), "secret");

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, UserId::new("user-1"));
        assert_eq!(identity.role, Role::Institutional);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("correct");
        let token = token_for(&claims(&[], 3600), "wrong");

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new("secret");
        // Well past the 60 s leeway.
        let token = token_for(&claims(&[], -3600), "secret");

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify("not-a-jwt").await.is_err());
    }

    #[test]
    fn test_role_selection() {
        assert_eq!(role_from_claims(&claims(&[], 60)), Role::User);
        assert_eq!(role_from_claims(&claims(&["viewer"], 60)), Role::User);
        assert_eq!(
            role_from_claims(&claims(&["user", "admin"], 60)),
            Role::Admin
        );
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticTokenVerifier::new().with_user("tok-1", "u-1");
        let identity = verifier.verify("tok-1").await.unwrap();
        assert_eq!(identity.user_id, UserId::new("u-1"));
        assert!(verifier.verify("tok-2").await.is_err());
    }
}
