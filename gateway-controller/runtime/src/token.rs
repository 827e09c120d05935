use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::fmt;

/// Allowed clock drift between the token issuer and this process, in seconds.
const LEEWAY_SECS: u64 = 5 * 60;

/// The role claim value that grants access to admin-only routes.
const ADMIN_ROLE: &str = "admin";

/// The verified claims of a bearer token, attached to admitted requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,

    #[serde(default)]
    pub role: Option<String>,
}

/// Verifies HS256-signed bearer tokens.
///
/// Expiry is always enforced. Issuer and audience are enforced, and required to be present, only
/// when configured.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

// === impl Claims ===

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

// === impl TokenVerifier ===

impl TokenVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
            validation.required_spec_claims.insert("iss".to_string());
        }
        match audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                validation.required_spec_claims.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> jsonwebtoken::errors::Result<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    pub(crate) const SECRET: &str = "gateway-test-secret";

    /// Signs `claims`, adding an expiry an hour from now unless one is given.
    pub(crate) fn mint(secret: &str, mut claims: serde_json::Value) -> String {
        if claims.get("exp").is_none() {
            claims["exp"] = (chrono::Utc::now().timestamp() + 3600).into();
        }
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_signed_tokens() {
        let verifier = TokenVerifier::new(SECRET, None, None);
        let token = mint(SECRET, serde_json::json!({"sub": "42", "role": "admin"}));
        let claims = verifier.verify(&token).expect("token must verify");
        assert_eq!(claims.sub.as_deref(), Some("42"));
        assert!(claims.is_admin());

        let token = mint(SECRET, serde_json::json!({"sub": "43", "aud": "mobile"}));
        let claims = verifier.verify(&token).expect("audience is not checked");
        assert!(!claims.is_admin());
    }

    #[test]
    fn rejects_forged_and_expired_tokens() {
        let verifier = TokenVerifier::new(SECRET, None, None);
        assert!(verifier.verify("x").is_err());

        let forged = mint("another-secret", serde_json::json!({"sub": "42"}));
        assert!(verifier.verify(&forged).is_err());

        let expired = chrono::Utc::now().timestamp() - 3600;
        let token = mint(SECRET, serde_json::json!({"sub": "42", "exp": expired}));
        assert!(verifier.verify(&token).is_err());

        // Within the allowed clock drift.
        let recent = chrono::Utc::now().timestamp() - 60;
        let token = mint(SECRET, serde_json::json!({"sub": "42", "exp": recent}));
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn enforces_configured_issuer_and_audience() {
        let verifier = TokenVerifier::new(SECRET, Some("auth"), Some("gateway"));

        let token = mint(
            SECRET,
            serde_json::json!({"sub": "42", "iss": "auth", "aud": "gateway"}),
        );
        assert!(verifier.verify(&token).is_ok());

        let token = mint(
            SECRET,
            serde_json::json!({"sub": "42", "iss": "elsewhere", "aud": "gateway"}),
        );
        assert!(verifier.verify(&token).is_err());

        let token = mint(
            SECRET,
            serde_json::json!({"sub": "42", "iss": "auth", "aud": "mobile"}),
        );
        assert!(verifier.verify(&token).is_err());

        let token = mint(SECRET, serde_json::json!({"sub": "42"}));
        assert!(verifier.verify(&token).is_err(), "issuer is required");
    }
}
