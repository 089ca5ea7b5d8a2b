//! JWT Authentication
//!
//! Validates JWTs issued by the wallet login service. The token subject is
//! the player's wallet address. The server does NOT issue tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::Address;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry validation (testing only).
    pub skip_expiry: bool,
    /// With no key configured, treat the token itself as the wallet
    /// address. Local development only.
    pub insecure_dev: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: env_flag("AUTH_SKIP_EXPIRY"),
            insecure_dev: env_flag("AUTH_INSECURE_DEV"),
        }
    }

    /// HS256 config with the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Check if a verification key is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    fn decoding_key(&self) -> Result<(DecodingKey, Algorithm), AuthError> {
        if let Some(pem) = &self.public_key_pem {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
            return Ok((key, Algorithm::RS256));
        }
        match &self.secret {
            Some(secret) => Ok((DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)),
            None => Err(AuthError::NotConfigured),
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation.validate_exp = !self.skip_expiry;
        validation
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "true" || v == "1").unwrap_or(false)
}

/// JWT claims expected from the login service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the wallet address.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Wallet address the token was issued for.
    pub fn address(&self) -> Address {
        Address::new(self.sub.trim())
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a JWT and return the wallet address it authenticates.
pub fn authenticate(token: &str, config: &AuthConfig) -> Result<Address, AuthError> {
    if !config.is_configured() && config.insecure_dev {
        let address = token.trim();
        if address.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        return Ok(Address::new(address));
    }
    validate_token(token, config).map(|claims| claims.address())
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = config.decoding_key()?;
    let claims = decode::<TokenClaims>(token, &key, &config.validation(algorithm))
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.trim().is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // `exp` is optional in our claims, so the library only checks it when set.
    if !config.skip_expiry && claims.exp > 0 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn token(claims: &TokenClaims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(sub: &str) -> TokenClaims {
        let now = chrono::Utc::now().timestamp() as u64;
        TokenClaims {
            sub: sub.into(),
            exp: now + 3600,
            iat: now,
            iss: Some("wallet-login".into()),
            aud: Some(serde_json::json!("duel")),
        }
    }

    #[test]
    fn test_subject_is_wallet_address() {
        let t = token(&claims("GALICE"), SECRET);
        let address = authenticate(&t, &AuthConfig::with_secret(SECRET)).unwrap();
        assert_eq!(address, Address::new("GALICE"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut c = claims("GALICE");
        c.exp = 1;
        let t = token(&c, SECRET);
        assert!(matches!(validate_token(&t, &AuthConfig::with_secret(SECRET)), Err(AuthError::Expired)));

        let lenient = AuthConfig { skip_expiry: true, ..AuthConfig::with_secret(SECRET) };
        assert!(validate_token(&t, &lenient).is_ok());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let t = token(&claims("GALICE"), "correct-secret-key-here!!!!!");
        let result = validate_token(&t, &AuthConfig::with_secret("wrong-secret-key-here!!!!!!"));
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_blank_subject_rejected() {
        let t = token(&claims("  "), SECRET);
        let result = validate_token(&t, &AuthConfig::with_secret(SECRET));
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let t = token(&claims("GALICE"), SECRET);
        let config = AuthConfig { issuer: Some("someone-else".into()), ..AuthConfig::with_secret(SECRET) };
        assert!(matches!(validate_token(&t, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_not_configured() {
        let result = authenticate("some.jwt.token", &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_insecure_dev_mode() {
        let config = AuthConfig { insecure_dev: true, ..AuthConfig::default() };
        assert_eq!(authenticate("GBOB", &config).unwrap(), Address::new("GBOB"));
        assert!(authenticate("", &config).is_err());

        // A configured key always wins.
        let keyed = AuthConfig { insecure_dev: true, ..AuthConfig::with_secret(SECRET) };
        assert!(authenticate("GBOB", &keyed).is_err());
    }
}
