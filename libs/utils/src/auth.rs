//! HS256 bearer credentials shared by the gateway (mint) and the export
//! service (verify).

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header,
    TokenData, Validation,
};
use serde::{Deserialize, Serialize};

/// Issuer required in every export token.
pub const EXPECTED_ISSUER: &str = "excel-export-app";

/// Audience required in every export token.
pub const EXPECTED_AUDIENCE: &str = "excel-export-api";

/// Anything shorter is brute-forceable for HS256.
pub const MIN_SECRET_LEN: usize = 32;

/// Default token lifetime, overridable through `JWT_EXPIRES_IN`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    /// Claims for a token minted now with the given lifetime.
    pub fn new(lifetime: Duration) -> Self {
        let iat = get_current_timestamp();
        Claims {
            iss: EXPECTED_ISSUER.to_string(),
            aud: EXPECTED_AUDIENCE.to_string(),
            iat,
            exp: iat + lifetime.as_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("malformed Authorization header")]
    MalformedHeader,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("JWT secret must be at least {MIN_SECRET_LEN} bytes")]
    SecretTooShort,
}

/// Verifies bearer tokens against a shared secret. Constructed once at
/// startup and shared between requests.
pub struct JwtAuth {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::SecretTooShort);
        }
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.set_issuer(&[EXPECTED_ISSUER]);
        validation.set_audience(&[EXPECTED_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        // The default 60s leeway would keep just-expired tokens alive.
        validation.leeway = 0;
        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data: TokenData<Claims> = decode(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        Ok(data.claims)
    }
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth").finish_non_exhaustive()
    }
}

/// Mint a short-lived bearer token for a call into the export service.
pub fn mint_token(secret: &[u8], lifetime: Duration) -> Result<String, AuthError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(AuthError::SecretTooShort);
    }
    encode(
        &Header::new(JWT_ALGORITHM),
        &Claims::new(lifetime),
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))
}

/// Extract the raw token from an `Authorization: Bearer <token>` header.
///
/// The prefix match is exact: `bearer `, double spaces and other whitespace
/// variations are rejected rather than normalized.
pub fn parse_bearer(header: Option<&hyper::header::HeaderValue>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingHeader)?;
    let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?;
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn mint_then_verify() {
        let token = mint_token(SECRET, Duration::from_secs(900)).unwrap();
        let auth = JwtAuth::new(SECRET).unwrap();
        let claims = auth.decode(&token).unwrap();
        assert_eq!(claims.iss, EXPECTED_ISSUER);
        assert_eq!(claims.aud, EXPECTED_AUDIENCE);
        assert_eq!(claims.exp, claims.iat + 900);
    }

    #[test]
    fn secret_length_is_enforced() {
        assert_eq!(
            mint_token(b"too-short", Duration::from_secs(900)).unwrap_err(),
            AuthError::SecretTooShort
        );
        assert!(matches!(
            JwtAuth::new(b"too-short"),
            Err(AuthError::SecretTooShort)
        ));
    }

    #[test]
    fn expired_token_is_a_distinct_failure() {
        let now = get_current_timestamp();
        let claims = Claims {
            iss: EXPECTED_ISSUER.to_string(),
            aud: EXPECTED_AUDIENCE.to_string(),
            iat: now - 1800,
            exp: now - 900,
        };
        let token = encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        let auth = JwtAuth::new(SECRET).unwrap();
        assert_eq!(auth.decode(&token).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn wrong_issuer_or_audience_is_rejected() {
        let auth = JwtAuth::new(SECRET).unwrap();
        for (iss, aud) in [
            ("someone-else", EXPECTED_AUDIENCE),
            (EXPECTED_ISSUER, "someone-else"),
        ] {
            let now = get_current_timestamp();
            let claims = Claims {
                iss: iss.to_string(),
                aud: aud.to_string(),
                iat: now,
                exp: now + 900,
            };
            let token = encode(
                &Header::new(JWT_ALGORITHM),
                &claims,
                &EncodingKey::from_secret(SECRET),
            )
            .unwrap();
            assert!(matches!(auth.decode(&token), Err(AuthError::Invalid(_))));
        }
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint_token(SECRET, Duration::from_secs(900)).unwrap();
        let auth = JwtAuth::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches!(auth.decode(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn bearer_prefix_is_case_and_whitespace_sensitive() {
        let ok = HeaderValue::from_static("Bearer abc.def.ghi");
        assert_eq!(parse_bearer(Some(&ok)).unwrap(), "abc.def.ghi");

        assert_eq!(parse_bearer(None).unwrap_err(), AuthError::MissingHeader);
        for bad in ["bearer abc.def.ghi", "Bearer  abc.def.ghi", "Bearer", "Token abc"] {
            let value = HeaderValue::from_str(bad).unwrap();
            assert_eq!(
                parse_bearer(Some(&value)).unwrap_err(),
                AuthError::MalformedHeader,
                "expected rejection of {bad:?}"
            );
        }
    }
}
