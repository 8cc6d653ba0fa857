use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fx_access_policy::AccessGrants;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const MAX_ISSUER_PUBLIC_KEYS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub issuer_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub access: AccessGrants,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerPublicKey {
    pub key_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_keys_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_keys: Option<Vec<IssuerPublicKey>>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IssuerValidationError {
    #[error("issuer {issuer_id} sets both jsonKeysUrl and publicKeys")]
    JsonKeysUrlAndPublicKeys { issuer_id: String },
    #[error("issuer {issuer_id} sets neither jsonKeysUrl nor publicKeys")]
    MissingJsonKeysUrlAndPublicKeys { issuer_id: String },
    #[error("issuer {issuer_id} has an empty publicKeys list")]
    EmptyPublicKeys { issuer_id: String },
    #[error("issuer {issuer_id} has more than 3 public keys")]
    TooManyKeys { issuer_id: String },
    #[error("issuer {issuer_id} has a public key without a keyId")]
    MissingKeyId { issuer_id: String },
    #[error("issuer {issuer_id} key {key_id} has no publicKey")]
    MissingPublicKey { issuer_id: String, key_id: String },
}

impl IssuerValidationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::JsonKeysUrlAndPublicKeys { .. } => "issuer_json_keys_url_and_public_keys",
            Self::MissingJsonKeysUrlAndPublicKeys { .. } => {
                "issuer_missing_json_keys_url_and_public_keys"
            }
            Self::EmptyPublicKeys { .. } => "issuer_empty_public_keys",
            Self::TooManyKeys { .. } => "issuer_too_many_keys",
            Self::MissingKeyId { .. } => "issuer_missing_key_id",
            Self::MissingPublicKey { .. } => "issuer_missing_public_key",
        }
    }
}

impl Issuer {
    pub fn validate(&self) -> Result<(), IssuerValidationError> {
        let issuer_id = || self.id.clone();
        let json_keys_url = self
            .json_keys_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match (json_keys_url, self.public_keys.as_ref()) {
            (Some(_), Some(_)) => Err(IssuerValidationError::JsonKeysUrlAndPublicKeys {
                issuer_id: issuer_id(),
            }),
            (None, None) => Err(IssuerValidationError::MissingJsonKeysUrlAndPublicKeys {
                issuer_id: issuer_id(),
            }),
            (Some(_), None) => Ok(()),
            (None, Some(keys)) => {
                if keys.is_empty() {
                    return Err(IssuerValidationError::EmptyPublicKeys {
                        issuer_id: issuer_id(),
                    });
                }
                if keys.len() > MAX_ISSUER_PUBLIC_KEYS {
                    return Err(IssuerValidationError::TooManyKeys {
                        issuer_id: issuer_id(),
                    });
                }
                for key in keys {
                    if key.key_id.trim().is_empty() {
                        return Err(IssuerValidationError::MissingKeyId {
                            issuer_id: issuer_id(),
                        });
                    }
                    if key.public_key.trim().is_empty() {
                        return Err(IssuerValidationError::MissingPublicKey {
                            issuer_id: issuer_id(),
                            key_id: key.key_id.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Inline key matching `key_id`, if this issuer carries inline keys.
    #[must_use]
    pub fn inline_key(&self, key_id: Option<&str>) -> Option<&IssuerPublicKey> {
        let key_id = key_id?;
        self.public_keys
            .as_ref()?
            .iter()
            .find(|key| key.key_id == key_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountDataError {
    #[error("account data unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    InvalidIssuer(#[from] IssuerValidationError),
}

/// Read-side view of account data needed to resolve callers.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn get_issuer(
        &self,
        account_id: &str,
        issuer_id: &str,
    ) -> Result<Option<Issuer>, AccountDataError>;

    async fn get_agent(
        &self,
        account_id: &str,
        identity: &Identity,
    ) -> Result<Option<Agent>, AccountDataError>;
}

pub fn memory() -> Arc<MemoryAccountDirectory> {
    Arc::new(MemoryAccountDirectory::default())
}

#[derive(Default)]
pub struct MemoryAccountDirectory {
    inner: Mutex<MemoryAccountDirectoryInner>,
}

#[derive(Default)]
struct MemoryAccountDirectoryInner {
    issuers: HashMap<(String, String), Issuer>,
    agents: HashMap<String, Vec<Agent>>,
}

impl MemoryAccountDirectory {
    pub async fn insert_issuer(
        &self,
        account_id: &str,
        issuer: Issuer,
    ) -> Result<(), AccountDataError> {
        issuer.validate()?;
        let mut inner = self.inner.lock().await;
        inner
            .issuers
            .insert((account_id.to_string(), issuer.id.clone()), issuer);
        Ok(())
    }

    pub async fn insert_agent(&self, account_id: &str, agent: Agent) {
        let mut inner = self.inner.lock().await;
        let agents = inner.agents.entry(account_id.to_string()).or_default();
        agents.retain(|existing| existing.id != agent.id);
        agents.push(agent);
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn get_issuer(
        &self,
        account_id: &str,
        issuer_id: &str,
    ) -> Result<Option<Issuer>, AccountDataError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .issuers
            .get(&(account_id.to_string(), issuer_id.to_string()))
            .cloned())
    }

    async fn get_agent(
        &self,
        account_id: &str,
        identity: &Identity,
    ) -> Result<Option<Agent>, AccountDataError> {
        let inner = self.inner.lock().await;
        Ok(inner.agents.get(account_id).and_then(|agents| {
            agents
                .iter()
                .find(|agent| agent.identities.contains(identity))
                .cloned()
        }))
    }
}
