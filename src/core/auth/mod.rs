//! Socket admission credentials and tenant context construction.
//!
//! Credentials are accepted in priority order: bearer header, handshake
//! query token, handshake auth object, API key + org header, then explicit
//! demo identifiers. Extraction returns `None` on any failure; it never
//! errors. The resulting [`TenantContext`] is validated in one place,
//! [`Authenticator::validate_tenant_context`].

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::domain::{OrgId, TenantContext, UserId};
use crate::core::store::Store;
use crate::error::{Error, Result};

/// Maximum tolerated skew between server time and token issue time.
pub const MAX_CLOCK_DRIFT_SECS: i64 = 3;

/// Raw credential material captured from the socket handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeCredentials {
    /// `Authorization: Bearer …` header value, without the scheme.
    pub bearer: Option<String>,
    /// `?token=` query parameter.
    pub query_token: Option<String>,
    /// Token carried in the socket auth object.
    pub auth_token: Option<String>,
    /// API key + org header pair.
    pub api_key: Option<(String, String)>,
    /// Explicit demo identifiers.
    pub demo: Option<(String, Option<String>)>,
}

/// Claims required of every verified token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "organizationId")]
    pub organization_id: String,
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Verifies bearer tokens into claims.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<TokenClaims>;
}

/// `jsonwebtoken`-backed verifier (RS256 or HS256 depending on key).
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier over an RSA public key in PEM form (`JWT_PUBLIC_KEY`).
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::Config(format!("bad JWT public key: {e}")))?;
        Ok(Self {
            decoding_key,
            validation: Validation::new(Algorithm::RS256),
        })
    }

    /// Verifier over a shared secret, for tests and demo deployments.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<TokenClaims> {
        match jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                debug!(error = %e, "Token verification failed");
                None
            }
        }
    }
}

/// Verifier for deployments with no JWT key configured: every token is
/// rejected, leaving demo and API-key admission as the only paths.
pub struct DenyAllVerifier;

impl TokenVerifier for DenyAllVerifier {
    fn verify(&self, _token: &str) -> Option<TokenClaims> {
        None
    }
}

/// Admission authority: credential extraction plus context validation.
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn Store>,
    /// When false, demo credentials are rejected outright.
    allow_demo: bool,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, store: Arc<dyn Store>, allow_demo: bool) -> Self {
        Self {
            verifier,
            store,
            allow_demo,
        }
    }

    /// Extract a tenant context from handshake credentials.
    ///
    /// Infallible in shape: any failure yields `None` so the gateway can
    /// emit one uniform `AUTH_FAILED` close.
    pub fn extract(&self, creds: &HandshakeCredentials) -> Option<ExtractedIdentity> {
        let token = creds
            .bearer
            .as_deref()
            .or(creds.query_token.as_deref())
            .or(creds.auth_token.as_deref());

        if let Some(token) = token {
            let claims = self.verifier.verify(token)?;
            if claims.organization_id.is_empty() || claims.sub.is_empty() {
                return None;
            }
            let ctx = TenantContext {
                organization_id: OrgId::new(&claims.organization_id),
                user_id: Some(UserId::new(&claims.sub)),
                user_role: claims.roles.first().cloned(),
                roles: claims.roles.clone(),
                permissions: claims.permissions.clone(),
                features: claims.features.clone(),
            };
            return Some(ExtractedIdentity {
                ctx,
                issued_at: claims.iat,
            });
        }

        if let Some((key, org)) = &creds.api_key {
            if key.is_empty() || org.is_empty() {
                return None;
            }
            // API keys authenticate the org itself; no user identity.
            return Some(ExtractedIdentity {
                ctx: TenantContext::for_org(org.as_str()),
                issued_at: None,
            });
        }

        if let Some((org, user)) = &creds.demo {
            if !self.allow_demo || org.is_empty() {
                return None;
            }
            // Demo sessions get the standard client grants, nothing more.
            let mut ctx = TenantContext::for_org(org.as_str()).with_permissions(vec![
                "Channel:read".to_string(),
                "Event:create".to_string(),
                "Event:read".to_string(),
                "Room:write".to_string(),
            ]);
            if let Some(user) = user {
                ctx = ctx.with_user(user.as_str());
            }
            return Some(ExtractedIdentity {
                ctx,
                issued_at: None,
            });
        }

        None
    }

    /// Verify the org exists and is active and the user (if any) belongs
    /// to it.
    pub async fn validate_tenant_context(&self, ctx: &TenantContext) -> Result<()> {
        let org = self
            .store
            .get_organization(&ctx.organization_id)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::Auth(format!(
                    "organization {} does not exist",
                    ctx.organization_id
                )),
                other => other,
            })?;
        if !org.active {
            return Err(Error::Auth(format!(
                "organization {} is inactive",
                ctx.organization_id
            )));
        }
        if let Some(user) = &ctx.user_id {
            let member = self
                .store
                .user_belongs_to(&ctx.organization_id, user)
                .await?;
            if !member {
                return Err(Error::Auth(format!(
                    "user {user} is not a member of {}",
                    ctx.organization_id
                )));
            }
        }
        Ok(())
    }

    /// Clock drift check at `connection.established`.
    ///
    /// Drift beyond [`MAX_CLOCK_DRIFT_SECS`] indicates a compromised or
    /// replayed session; the caller terminates the socket unless a token
    /// refresh is scheduled.
    pub fn check_clock_drift(
        &self,
        identity: &ExtractedIdentity,
        established_at: DateTime<Utc>,
        refresh_scheduled: bool,
    ) -> Result<()> {
        let Some(iat) = identity.issued_at else {
            return Ok(());
        };
        let drift = (established_at.timestamp() - iat).abs();
        if drift > MAX_CLOCK_DRIFT_SECS && !refresh_scheduled {
            warn!(
                org = %identity.ctx.organization_id,
                drift_secs = drift,
                "Token clock drift exceeds tolerance"
            );
            return Err(Error::Auth(format!("token clock drift of {drift}s")));
        }
        Ok(())
    }
}

/// Identity extracted from the handshake, before validation.
#[derive(Debug, Clone)]
pub struct ExtractedIdentity {
    pub ctx: TenantContext,
    /// Token issue time when the credential carried one.
    pub issued_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Organization;
    use crate::core::store::MemoryStore;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn token_for(org: &str, sub: &str, iat: Option<i64>) -> String {
        let mut claims = json!({ "organizationId": org, "sub": sub });
        if let Some(iat) = iat {
            claims["iat"] = json!(iat);
        }
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn authenticator(store: Arc<MemoryStore>, allow_demo: bool) -> Authenticator {
        Authenticator::new(
            Arc::new(JwtVerifier::from_secret(SECRET)),
            store,
            allow_demo,
        )
    }

    #[test]
    fn bearer_token_yields_context() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let creds = HandshakeCredentials {
            bearer: Some(token_for("o1", "u1", None)),
            ..Default::default()
        };
        let identity = auth.extract(&creds).unwrap();
        assert_eq!(identity.ctx.organization_id, OrgId::new("o1"));
        assert_eq!(identity.ctx.user_id, Some(UserId::new("u1")));
    }

    #[test]
    fn bearer_takes_priority_over_query() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let creds = HandshakeCredentials {
            bearer: Some(token_for("o1", "u1", None)),
            query_token: Some(token_for("o2", "u2", None)),
            ..Default::default()
        };
        let identity = auth.extract(&creds).unwrap();
        assert_eq!(identity.ctx.organization_id, OrgId::new("o1"));
    }

    #[test]
    fn garbage_token_extracts_none() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let creds = HandshakeCredentials {
            bearer: Some("not-a-jwt".into()),
            ..Default::default()
        };
        assert!(auth.extract(&creds).is_none());
    }

    #[test]
    fn api_key_authenticates_org_without_user() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let creds = HandshakeCredentials {
            api_key: Some(("key-1".into(), "o1".into())),
            ..Default::default()
        };
        let identity = auth.extract(&creds).unwrap();
        assert_eq!(identity.ctx.organization_id, OrgId::new("o1"));
        assert!(identity.ctx.user_id.is_none());
    }

    #[test]
    fn demo_requires_enablement() {
        let store = Arc::new(MemoryStore::new());
        let creds = HandshakeCredentials {
            demo: Some(("o1".into(), Some("u1".into()))),
            ..Default::default()
        };
        assert!(authenticator(store.clone(), false).extract(&creds).is_none());
        assert!(authenticator(store, true).extract(&creds).is_some());
    }

    #[tokio::test]
    async fn validation_rejects_unknown_org() {
        let auth = authenticator(Arc::new(MemoryStore::new()), true);
        let ctx = TenantContext::for_org("ghost");
        let err = auth.validate_tenant_context(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn validation_rejects_inactive_org() {
        let store = Arc::new(MemoryStore::new());
        let mut org = Organization::new("o1", "acme");
        org.active = false;
        store.upsert_organization(org).await.unwrap();

        let auth = authenticator(store, true);
        let err = auth
            .validate_tenant_context(&TenantContext::for_org("o1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn validation_rejects_foreign_user() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_organization(Organization::new("o1", "acme"))
            .await
            .unwrap();

        let auth = authenticator(store, true);
        let ctx = TenantContext::for_org("o1").with_user("stranger");
        let err = auth.validate_tenant_context(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn validation_accepts_member() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_organization(Organization::new("o1", "acme"))
            .await
            .unwrap();
        store
            .register_user(&OrgId::new("o1"), &UserId::new("u1"))
            .await
            .unwrap();

        let auth = authenticator(store, true);
        let ctx = TenantContext::for_org("o1").with_user("u1");
        assert!(auth.validate_tenant_context(&ctx).await.is_ok());
    }

    #[test]
    fn clock_drift_beyond_tolerance_is_fatal_for_the_socket() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let now = Utc::now();
        let identity = ExtractedIdentity {
            ctx: TenantContext::for_org("o1"),
            issued_at: Some(now.timestamp() - 10),
        };
        assert!(auth.check_clock_drift(&identity, now, false).is_err());
        // A scheduled refresh keeps the socket alive.
        assert!(auth.check_clock_drift(&identity, now, true).is_ok());
    }

    #[test]
    fn clock_drift_within_tolerance_passes() {
        let auth = authenticator(Arc::new(MemoryStore::new()), false);
        let now = Utc::now();
        let identity = ExtractedIdentity {
            ctx: TenantContext::for_org("o1"),
            issued_at: Some(now.timestamp() - 2),
        };
        assert!(auth.check_clock_drift(&identity, now, false).is_ok());
    }
}
