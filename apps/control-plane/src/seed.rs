use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::accounts::{AccountDataError, Agent, Issuer, MemoryAccountDirectory};
use crate::dispatch::functions::MemoryFunctionRegistry;
use crate::dispatch::types::{FunctionSummary, FunctionTarget};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeededIssuer {
    pub account_id: String,
    #[serde(flatten)]
    pub issuer: Issuer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeededAgent {
    pub account_id: String,
    #[serde(flatten)]
    pub agent: Agent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeededFunction {
    #[serde(flatten)]
    pub target: FunctionTarget,
    #[serde(default)]
    pub summary: FunctionSummary,
}

/// Bootstrap contents for the in-memory collaborators.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub issuers: Vec<SeededIssuer>,
    #[serde(default)]
    pub agents: Vec<SeededAgent>,
    #[serde(default)]
    pub functions: Vec<SeededFunction>,
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse seed file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("seed file rejected: {0}")]
    Rejected(#[from] AccountDataError),
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SeedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SeedError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads every entry; an invalid issuer aborts before later entries are applied.
    pub async fn apply(
        self,
        accounts: &MemoryAccountDirectory,
        functions: &MemoryFunctionRegistry,
    ) -> Result<(), SeedError> {
        let (issuers, agents, function_count) =
            (self.issuers.len(), self.agents.len(), self.functions.len());
        for seeded in self.issuers {
            accounts
                .insert_issuer(&seeded.account_id, seeded.issuer)
                .await?;
        }
        for seeded in self.agents {
            accounts.insert_agent(&seeded.account_id, seeded.agent).await;
        }
        for seeded in self.functions {
            functions.insert(seeded.target, seeded.summary).await;
        }
        tracing::info!(issuers, agents, functions = function_count, "seed applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use anyhow::Result;
    use serde_json::json;

    use super::{Seed, SeedError};
    use crate::accounts::{self, AccountDirectory, Identity};
    use crate::dispatch::functions::{self, FunctionRegistry};
    use crate::dispatch::types::FunctionTarget;

    #[tokio::test]
    async fn seed_file_populates_directories() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        let contents = json!({
            "issuers": [{
                "accountId": "acc-1",
                "id": "iss-1",
                "jsonKeysUrl": "http://127.0.0.1:1/keys"
            }],
            "agents": [{
                "accountId": "acc-1",
                "id": "usr-1",
                "identities": [{"issuerId": "iss-1", "subject": "sub-1"}],
                "access": {"allow": [{"action": "function:*", "resource": "/account/acc-1/"}]}
            }],
            "functions": [{
                "accountId": "acc-1",
                "subscriptionId": "sub-1",
                "boundaryId": "bnd-1",
                "functionId": "fn-1",
                "summary": {"routes": [{"path": "/"}]}
            }]
        });
        file.write_all(contents.to_string().as_bytes())?;

        let accounts = accounts::memory();
        let registry = functions::memory();
        Seed::load(file.path())?.apply(&accounts, &registry).await?;

        assert!(accounts.get_issuer("acc-1", "iss-1").await?.is_some());
        let identity = Identity {
            issuer_id: "iss-1".to_string(),
            subject: "sub-1".to_string(),
        };
        assert!(accounts.get_agent("acc-1", &identity).await?.is_some());
        let summary = registry
            .get_summary(&FunctionTarget::new("acc-1", "sub-1", "bnd-1", "fn-1"))
            .await?;
        assert_eq!(summary.map(|summary| summary.routes.len()), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_issuer_is_rejected() -> Result<()> {
        let seed: Seed = serde_json::from_value(json!({
            "issuers": [{"accountId": "acc-1", "id": "iss-1"}]
        }))?;
        let result = seed
            .apply(&accounts::memory(), &functions::memory())
            .await;
        assert!(matches!(result, Err(SeedError::Rejected(_))));

        let missing = Seed::load(std::path::Path::new("/nonexistent/seed.json"));
        assert!(matches!(missing, Err(SeedError::Read { .. })));
        Ok(())
    }
}
