use std::sync::Arc;

use chrono::Utc;
use fx_access_policy::{AccessGrants, normalize_resource};
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation, decode, decode_header, errors::ErrorKind,
};
use serde::Deserialize;
use serde_json::Value;

use crate::accounts::{AccountDataError, AccountDirectory, Agent, Identity, Issuer};
use crate::audit::{AuditEntry, AuditSink};
use crate::jwks::JwksCache;

pub const ROOT_AGENT_ID: &str = "root-user";
pub const ROOT_ISSUER_ID: &str = "root";
pub const ROOT_SUBJECT: &str = "root";

const ALLOWED_ALGORITHMS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("no public key available for issuer {issuer_id}")]
    UnknownIssuer { issuer_id: String },
    #[error("credential signature is invalid")]
    SignatureInvalid,
    #[error("agent {issuer_id}/{subject} is not known to this account")]
    UnresolvedAgent { issuer_id: String, subject: String },
    #[error("agent {agent_id} is not authorized to {action} on {resource}")]
    Unauthorized {
        agent_id: String,
        action: String,
        resource: String,
    },
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("account data unavailable: {0}")]
    AccountData(String),
}

impl PermissionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::UnknownIssuer { .. } => "unknown_issuer",
            Self::SignatureInvalid => "signature_invalid",
            Self::UnresolvedAgent { .. } => "unresolved_agent",
            Self::Unauthorized { .. } => "unauthorized",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::AccountData(_) => "account_data_unavailable",
        }
    }

    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential
                | Self::InvalidCredential(_)
                | Self::UnknownIssuer { .. }
                | Self::SignatureInvalid
        )
    }
}

impl From<AccountDataError> for PermissionError {
    fn from(error: AccountDataError) -> Self {
        Self::AccountData(error.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    permissions: Option<Value>,
}

/// The well-known bootstrap agent: `*` on `/`, never backed by a credential.
#[must_use]
pub fn root_agent() -> Agent {
    Agent {
        id: ROOT_AGENT_ID.to_string(),
        identities: vec![Identity {
            issuer_id: ROOT_ISSUER_ID.to_string(),
            subject: ROOT_SUBJECT.to_string(),
        }],
        access: AccessGrants::new(vec![fx_access_policy::AccessEntry::new("*", "/")]),
    }
}

/// An agent bound to the account and identity it was resolved for.
#[derive(Clone)]
pub struct ResolvedAgent {
    account_id: String,
    agent: Agent,
    identity: Identity,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for ResolvedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAgent")
            .field("account_id", &self.account_id)
            .field("agent", &self.agent)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl ResolvedAgent {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.agent.id
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn access(&self) -> &AccessGrants {
        &self.agent.access
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.agent.id == ROOT_AGENT_ID && self.identity.issuer_id == ROOT_ISSUER_ID
    }

    #[must_use]
    pub fn is_authorized(&self, action: &str, resource: &str) -> bool {
        self.agent
            .access
            .is_authorized(action, &normalize_resource(resource))
    }

    /// Records the decision before reporting it, so denials are as visible as grants.
    pub async fn ensure_authorized(
        &self,
        action: &str,
        resource: &str,
    ) -> Result<(), PermissionError> {
        let resource = normalize_resource(resource);
        let authorized = self.is_authorized(action, &resource);
        self.audit
            .record(AuditEntry {
                account_id: self.account_id.clone(),
                issuer_id: self.identity.issuer_id.clone(),
                subject: self.identity.subject.clone(),
                action: action.to_string(),
                resource: resource.clone(),
                authorized,
                timestamp: Utc::now(),
            })
            .await;
        if authorized {
            return Ok(());
        }
        tracing::warn!(
            reason_code = "unauthorized",
            account_id = %self.account_id,
            agent_id = %self.agent.id,
            action,
            resource = %resource,
            "authorization denied"
        );
        Err(PermissionError::Unauthorized {
            agent_id: self.agent.id.clone(),
            action: action.to_string(),
            resource,
        })
    }
}

pub struct PermissionResolver {
    accounts: Arc<dyn AccountDirectory>,
    audit: Arc<dyn AuditSink>,
    jwks: Arc<JwksCache>,
    audience: String,
}

impl PermissionResolver {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        audit: Arc<dyn AuditSink>,
        jwks: Arc<JwksCache>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            accounts,
            audit,
            jwks,
            audience: audience.into(),
        }
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, PermissionError> {
        let raw = header_value.ok_or(PermissionError::MissingCredential)?;
        let Some(token) = raw.trim().strip_prefix("Bearer ") else {
            return Err(PermissionError::MissingCredential);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(PermissionError::MissingCredential);
        }
        Ok(token)
    }

    #[must_use]
    pub fn root(&self, account_id: Option<&str>) -> ResolvedAgent {
        let identity = Identity {
            issuer_id: ROOT_ISSUER_ID.to_string(),
            subject: ROOT_SUBJECT.to_string(),
        };
        ResolvedAgent {
            account_id: account_id
                .filter(|value| !value.is_empty())
                .unwrap_or(ROOT_ISSUER_ID)
                .to_string(),
            agent: root_agent(),
            identity,
            audit: self.audit.clone(),
        }
    }

    pub async fn resolve(
        &self,
        account_id: &str,
        credential: &str,
        is_root: bool,
    ) -> Result<ResolvedAgent, PermissionError> {
        if is_root {
            return Ok(self.root(Some(account_id)));
        }

        let (header, claims) = prevalidate(credential)?;
        let inline_permissions = parse_inline_permissions(claims.permissions.as_ref())?;
        let identity = Identity {
            issuer_id: claims.iss.unwrap_or_default(),
            subject: claims.sub.unwrap_or_default(),
        };

        let (agent, ()) = tokio::try_join!(
            self.lookup_agent(account_id, &identity),
            self.verify(account_id, &identity, &header, credential),
        )?;

        let mut resolved = ResolvedAgent {
            account_id: account_id.to_string(),
            agent,
            identity,
            audit: self.audit.clone(),
        };

        if let Some(narrowed) = inline_permissions {
            for entry in &narrowed.allow {
                resolved
                    .ensure_authorized(&entry.action, &entry.resource)
                    .await?;
            }
            resolved.agent.access = narrowed;
        }
        Ok(resolved)
    }

    async fn lookup_agent(
        &self,
        account_id: &str,
        identity: &Identity,
    ) -> Result<Agent, PermissionError> {
        self.accounts
            .get_agent(account_id, identity)
            .await?
            .ok_or_else(|| unresolved(identity))
    }

    async fn verify(
        &self,
        account_id: &str,
        identity: &Identity,
        header: &Header,
        credential: &str,
    ) -> Result<(), PermissionError> {
        let issuer = self
            .accounts
            .get_issuer(account_id, &identity.issuer_id)
            .await?
            .ok_or_else(|| unresolved(identity))?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(PermissionError::SignatureInvalid);
        }
        let key = self
            .decoding_key(&issuer, header)
            .await?
            .ok_or_else(|| PermissionError::UnknownIssuer {
                issuer_id: issuer.id.clone(),
            })?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[issuer.id.as_str()]);
        validation.set_required_spec_claims(&["iss", "sub", "aud"]);
        decode::<Value>(credential, &key, &validation)
            .map(|_| ())
            .map_err(map_verify_error)
    }

    async fn decoding_key(
        &self,
        issuer: &Issuer,
        header: &Header,
    ) -> Result<Option<DecodingKey>, PermissionError> {
        if let Some(url) = issuer
            .json_keys_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        {
            return self
                .jwks
                .decoding_key(url, header.kid.as_deref())
                .await
                .map_err(|error| PermissionError::KeyUnavailable(error.to_string()));
        }
        let Some(inline) = issuer.inline_key(header.kid.as_deref()) else {
            return Ok(None);
        };
        let pem = inline.public_key.as_bytes();
        let key = match header.alg {
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            _ => DecodingKey::from_rsa_pem(pem),
        };
        key.map(Some)
            .map_err(|error| PermissionError::KeyUnavailable(error.to_string()))
    }
}

fn unresolved(identity: &Identity) -> PermissionError {
    PermissionError::UnresolvedAgent {
        issuer_id: identity.issuer_id.clone(),
        subject: identity.subject.clone(),
    }
}

/// Decodes without verifying so the issuer can be located; requires `iss` and `sub`.
fn prevalidate(credential: &str) -> Result<(Header, CredentialClaims), PermissionError> {
    let header = decode_header(credential)
        .map_err(|_| PermissionError::InvalidCredential("unable to decode credential".into()))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let claims = decode::<CredentialClaims>(credential, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|_| PermissionError::InvalidCredential("unable to decode credential".into()))?
        .claims;
    if claims.iss.as_deref().is_none_or(str::is_empty) {
        return Err(PermissionError::InvalidCredential(
            "credential does not have an 'iss' claim".into(),
        ));
    }
    if claims.sub.as_deref().is_none_or(str::is_empty) {
        return Err(PermissionError::InvalidCredential(
            "credential does not have a 'sub' claim".into(),
        ));
    }
    Ok((header, claims))
}

fn parse_inline_permissions(claim: Option<&Value>) -> Result<Option<AccessGrants>, PermissionError> {
    let Some(claim) = claim.filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    let malformed = || PermissionError::InvalidCredential("malformed inline permission".into());
    let grants: AccessGrants = serde_json::from_value(claim.clone()).map_err(|_| malformed())?;
    for entry in &grants.allow {
        entry.validate().map_err(|_| malformed())?;
    }
    Ok(Some(grants))
}

fn map_verify_error(error: jsonwebtoken::errors::Error) -> PermissionError {
    match error.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
            PermissionError::SignatureInvalid
        }
        ErrorKind::ExpiredSignature => PermissionError::InvalidCredential("credential expired".into()),
        ErrorKind::ImmatureSignature => {
            PermissionError::InvalidCredential("credential is not valid yet".into())
        }
        ErrorKind::InvalidAudience => {
            PermissionError::InvalidCredential("credential audience mismatch".into())
        }
        ErrorKind::InvalidIssuer => {
            PermissionError::InvalidCredential("credential issuer mismatch".into())
        }
        _ => PermissionError::InvalidCredential(error.to_string()),
    }
}
